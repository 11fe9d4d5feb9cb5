//! Payment gateway port.
//!
//! Concrete processors live outside this crate. They classify every charge
//! into success, pending, or one of three failure kinds, and expose the raw
//! response so it can be written to the audit log.

use crate::error::BillingError;
use crate::models::{Payment, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// What the gateway said, readable after any call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub code: String,
    pub message: String,
    pub successful: bool,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl GatewayResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>, successful: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            successful,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeResult {
    /// Settled synchronously.
    Ok,
    /// Accepted; the final result arrives by callback.
    Pending,
}

#[derive(Debug, Clone)]
pub struct ChargeOutcome {
    pub result: ChargeResult,
    pub response: GatewayResponse,
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Worth trying again on a later run (insufficient funds, timeouts).
    #[error("Retryable gateway failure {}: {}", .0.code, .0.message)]
    Retryable(GatewayResponse),

    /// The credential can never be charged again.
    #[error("Terminal gateway failure {}: {}", .0.code, .0.message)]
    Terminal(GatewayResponse),

    /// Unclassified result. Needs a human.
    #[error("Unhandled gateway result {}: {}", .0.code, .0.message)]
    Hard(GatewayResponse),
}

impl GatewayError {
    pub fn response(&self) -> &GatewayResponse {
        match self {
            GatewayError::Retryable(r) | GatewayError::Terminal(r) | GatewayError::Hard(r) => r,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Retryable(_) => "retryable",
            GatewayError::Terminal(_) => "terminal",
            GatewayError::Hard(_) => "hard",
        }
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    fn id(&self) -> &str;

    /// Recurrent charges on this gateway cannot be cancelled at all.
    fn unstoppable(&self) -> bool {
        false
    }

    /// Recurrent charges on this gateway cannot be cancelled by the user.
    fn user_unstoppable(&self) -> bool {
        false
    }

    /// Status a successful charge settles into.
    fn paid_status(&self) -> PaymentStatus {
        PaymentStatus::Paid
    }

    /// Completion instant reported by the processor, when it has one.
    fn charged_at(&self, _response: &GatewayResponse) -> Option<DateTime<Utc>> {
        None
    }

    async fn charge(&self, payment: &Payment, token: &str) -> Result<ChargeOutcome, GatewayError>;

    fn supports_expiry_check(&self) -> bool {
        false
    }

    /// Expiry dates for the given tokens. Tokens the processor does not
    /// know are left out of the map.
    async fn check_expire(
        &self,
        _tokens: &[String],
    ) -> Result<HashMap<String, NaiveDate>, GatewayError> {
        Ok(HashMap::new())
    }
}

/// Gateways by id.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<String, Arc<dyn Gateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn Gateway>) {
        tracing::debug!(gateway = gateway.id(), "Registered gateway");
        self.gateways.insert(gateway.id().to_string(), gateway);
    }

    pub fn with(mut self, gateway: Arc<dyn Gateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Gateway>> {
        self.gateways.get(id).cloned()
    }

    pub fn require(&self, id: &str) -> Result<Arc<dyn Gateway>, BillingError> {
        self.get(id)
            .ok_or_else(|| BillingError::Gateway(format!("Unknown gateway '{}'", id)))
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.gateways.keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Gateway for payments settled out of band (bank transfer, operator).
/// Every charge is left pending until someone resolves it.
#[derive(Debug, Clone, Default)]
pub struct ManualGateway;

pub const MANUAL_GATEWAY_ID: &str = "manual";

#[async_trait]
impl Gateway for ManualGateway {
    fn id(&self) -> &str {
        MANUAL_GATEWAY_ID
    }

    async fn charge(&self, payment: &Payment, _token: &str) -> Result<ChargeOutcome, GatewayError> {
        Ok(ChargeOutcome {
            result: ChargeResult::Pending,
            response: GatewayResponse::new("MANUAL_PENDING", "Awaiting manual settlement", true)
                .with_data(serde_json::json!({ "payment_id": payment.payment_id })),
        })
    }
}
