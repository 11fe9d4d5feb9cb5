//! Refreshes stored method expiry dates from gateways that can report them.

use crate::error::BillingError;
use crate::services::gateway::GatewayRegistry;
use crate::services::metrics::record_error;
use crate::services::store::ChargeStore;
use std::sync::Arc;
use tracing::{info, instrument};

pub struct ExpiryRefresher {
    store: Arc<dyn ChargeStore>,
    gateways: Arc<GatewayRegistry>,
}

impl ExpiryRefresher {
    pub fn new(store: Arc<dyn ChargeStore>, gateways: Arc<GatewayRegistry>) -> Self {
        Self { store, gateways }
    }

    /// Ask `gateway_id` for the expiry of every token it issued and store
    /// the dates that changed. Returns how many methods were updated.
    #[instrument(skip(self))]
    pub async fn refresh(&self, gateway_id: &str) -> Result<usize, BillingError> {
        let gateway = self.gateways.require(gateway_id)?;
        if !gateway.supports_expiry_check() {
            return Ok(0);
        }

        let methods = self.store.list_methods_for_gateway(gateway_id).await?;
        if methods.is_empty() {
            return Ok(0);
        }

        let tokens: Vec<String> = methods.iter().map(|m| m.external_token.clone()).collect();
        let expiries = gateway.check_expire(&tokens).await.map_err(|e| {
            record_error("gateway", "check_expire");
            BillingError::Gateway(e.to_string())
        })?;

        let mut updated = 0;
        for method in &methods {
            let Some(expires_on) = expiries.get(&method.external_token) else {
                continue;
            };
            if method.expires_on == Some(*expires_on) {
                continue;
            }
            self.store
                .set_method_expiry(method.method_id, *expires_on)
                .await?;
            updated += 1;
        }

        info!(
            gateway = gateway_id,
            checked = methods.len(),
            updated = updated,
            "Refreshed payment method expiry"
        );
        Ok(updated)
    }
}
