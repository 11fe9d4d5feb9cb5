//! Batch run over due recurrent charges.

use crate::error::BillingError;
use crate::models::{
    Actor, ChargeUpdate, CreatePayment, CreatePaymentLog, Payment, PaymentStatus, RecurrentCharge,
    RecurrentChargeState,
};
use crate::services::gateway::{
    ChargeOutcome, ChargeResult, Gateway, GatewayError, GatewayRegistry, GatewayResponse,
};
use crate::services::ledger::{PaymentLedger, StatusUpdate};
use crate::services::metrics::{record_charge_outcome, record_error, record_run};
use crate::services::registry::RecurrentChargeRegistry;
use crate::services::store::ChargeStore;
use chrono::Duration;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

pub const FAST_CHARGE_NOTE: &str = "Fast charge";
const FAST_CHARGE_CODE: &str = "FAST_CHARGE";
const ALREADY_PAID_CODE: &str = "ALREADY_PAID";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Charged,
    Pending,
    /// Retryable failure. The attempt is back in the queue if it had
    /// retries left.
    Failed,
    /// Terminal failure.
    Stopped,
    FastChargeStopped,
    /// Unclassified gateway result, attempt left active for inspection.
    Unhandled,
    /// Another run owns the attempt, or it is no longer due.
    Skipped,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Charged => "charged",
            AttemptOutcome::Pending => "pending",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Stopped => "stopped",
            AttemptOutcome::FastChargeStopped => "fast_charge",
            AttemptOutcome::Unhandled => "unhandled",
            AttemptOutcome::Skipped => "skipped",
        }
    }
}

/// One line of the run report.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub charge_id: Uuid,
    pub outcome: Result<AttemptOutcome, String>,
}

impl std::fmt::Display for AttemptReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.outcome {
            Ok(outcome) => write!(f, "{} {}", self.charge_id, outcome.as_str()),
            Err(message) => write!(f, "{} error: {}", self.charge_id, message),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub charged: usize,
    pub pending: usize,
    pub failed: usize,
    pub stopped: usize,
    pub fast_charge_stopped: usize,
    pub unhandled: usize,
    pub skipped: usize,
    pub errors: usize,
    pub elapsed: std::time::Duration,
    pub attempts: Vec<AttemptReport>,
}

impl RunSummary {
    fn record(&mut self, charge_id: Uuid, outcome: &Result<AttemptOutcome, BillingError>) {
        self.processed += 1;
        match outcome {
            Ok(AttemptOutcome::Charged) => self.charged += 1,
            Ok(AttemptOutcome::Pending) => self.pending += 1,
            Ok(AttemptOutcome::Failed) => self.failed += 1,
            Ok(AttemptOutcome::Stopped) => self.stopped += 1,
            Ok(AttemptOutcome::FastChargeStopped) => self.fast_charge_stopped += 1,
            Ok(AttemptOutcome::Unhandled) => self.unhandled += 1,
            Ok(AttemptOutcome::Skipped) => self.skipped += 1,
            Err(_) => self.errors += 1,
        }
        self.attempts.push(AttemptReport {
            charge_id,
            outcome: outcome.as_ref().copied().map_err(|e| e.to_string()),
        });
    }
}

enum Prepared {
    /// The attempt was settled without a gateway call.
    Done(AttemptOutcome),
    Charge {
        payment: Payment,
        gateway: Arc<dyn Gateway>,
    },
}

pub struct ChargeOrchestrator {
    registry: Arc<RecurrentChargeRegistry>,
    ledger: Arc<PaymentLedger>,
    store: Arc<dyn ChargeStore>,
    gateways: Arc<GatewayRegistry>,
}

impl ChargeOrchestrator {
    pub fn new(
        registry: Arc<RecurrentChargeRegistry>,
        ledger: Arc<PaymentLedger>,
        store: Arc<dyn ChargeStore>,
        gateways: Arc<GatewayRegistry>,
    ) -> Self {
        Self {
            registry,
            ledger,
            store,
            gateways,
        }
    }

    /// Charge every due attempt, or only `ids` when given.
    ///
    /// Failures of a single attempt are logged and counted. Only systemic
    /// errors (storage unreachable) end the run early.
    #[instrument(skip(self, ids), fields(narrowed = ids.is_some()))]
    pub async fn run(&self, ids: Option<&[Uuid]>) -> Result<RunSummary, BillingError> {
        let started = Instant::now();
        let charges = match self.registry.chargeable(ids).await {
            Ok(charges) => charges,
            Err(e) => {
                record_run("aborted");
                return Err(e);
            }
        };
        info!(count = charges.len(), "Loaded chargeable attempts");

        let mut summary = RunSummary::default();
        for charge in &charges {
            match self.process(charge).await {
                Err(e) if e.is_systemic() => {
                    error!(charge_id = %charge.charge_id, error = %e, "Storage failure, aborting run");
                    record_error("systemic", "charge");
                    record_run("aborted");
                    return Err(e);
                }
                outcome => {
                    match &outcome {
                        Ok(o) => info!(
                            charge_id = %charge.charge_id,
                            outcome = o.as_str(),
                            "Attempt processed"
                        ),
                        Err(e) => {
                            error!(charge_id = %charge.charge_id, error = %e, "Attempt failed");
                            record_error("attempt", "charge");
                        }
                    }
                    summary.record(charge.charge_id, &outcome);
                }
            }
        }

        summary.elapsed = started.elapsed();
        record_run("completed");
        info!(
            processed = summary.processed,
            charged = summary.charged,
            errors = summary.errors,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Recurrent charge run finished"
        );
        Ok(summary)
    }

    #[instrument(skip(self, due), fields(charge_id = %due.charge_id))]
    async fn process(&self, due: &RecurrentCharge) -> Result<AttemptOutcome, BillingError> {
        // The loaded set may be stale: only the run that claims an attempt
        // charges it.
        let Some(charge) = self.registry.claim(due.charge_id).await? else {
            info!(charge_id = %due.charge_id, "Attempt no longer available, skipping");
            record_charge_outcome(AttemptOutcome::Skipped.as_str());
            return Ok(AttemptOutcome::Skipped);
        };

        let (payment, gateway) = match self.prepare(&charge).await {
            Ok(Prepared::Done(outcome)) => {
                record_charge_outcome(outcome.as_str());
                return Ok(outcome);
            }
            Ok(Prepared::Charge { payment, gateway }) => (payment, gateway),
            Err(e) => {
                if let Err(release) = self.registry.release_claim(charge.charge_id).await {
                    warn!(
                        charge_id = %charge.charge_id,
                        error = %release,
                        "Failed to release claim, attempt stays in flight"
                    );
                }
                return Err(e);
            }
        };

        // From here on money may have moved. Errors leave the attempt in
        // flight so no later run charges it blindly.
        let result = gateway.charge(&payment, charge.token()).await;
        let (outcome, response) = self
            .apply_result(&charge, &payment, gateway.as_ref(), result)
            .await?;

        self.append_log(payment.payment_id, charge.charge_id, &response)
            .await?;
        record_charge_outcome(outcome.as_str());
        Ok(outcome)
    }

    /// Everything before the gateway call. Nothing here moves money, so a
    /// failure hands the attempt back to the queue.
    async fn prepare(&self, charge: &RecurrentCharge) -> Result<Prepared, BillingError> {
        if let Some(previous) = self.fast_charge_conflict(charge).await? {
            warn!(
                charge_id = %charge.charge_id,
                previous_charge_id = %previous.charge_id,
                previous_charge_at = %previous.charge_at,
                "Fast charge detected, stopping attempt"
            );
            self.registry
                .transition(
                    charge.charge_id,
                    RecurrentChargeState::SystemStop,
                    Actor::System,
                    ChargeUpdate {
                        status: Some(FAST_CHARGE_CODE.to_string()),
                        note: Some(FAST_CHARGE_NOTE.to_string()),
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(Prepared::Done(AttemptOutcome::FastChargeStopped));
        }

        let payment_id = match charge.payment_id {
            Some(payment_id) => payment_id,
            None => self.create_payment(charge).await?,
        };

        // The payment may have been settled by a callback or another run.
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))?;

        if payment.status.is_paid_like() {
            self.complete_already_paid(charge, &payment).await?;
            return Ok(Prepared::Done(AttemptOutcome::Charged));
        }

        let gateway = self.gateways.require(&payment.gateway)?;
        Ok(Prepared::Charge { payment, gateway })
    }

    /// Mark the attempt charged without touching the settled payment.
    async fn complete_already_paid(
        &self,
        charge: &RecurrentCharge,
        payment: &Payment,
    ) -> Result<(), BillingError> {
        info!(
            payment_id = %payment.payment_id,
            status = %payment.status,
            "Payment already settled, skipping gateway"
        );
        let response = GatewayResponse::new(ALREADY_PAID_CODE, "Payment already paid", true);
        self.registry
            .transition(
                charge.charge_id,
                RecurrentChargeState::Charged,
                Actor::System,
                ChargeUpdate::status(ALREADY_PAID_CODE),
            )
            .await?;
        self.append_log(payment.payment_id, charge.charge_id, &response)
            .await
    }

    async fn fast_charge_conflict(
        &self,
        charge: &RecurrentCharge,
    ) -> Result<Option<RecurrentCharge>, BillingError> {
        let threshold = self.registry.config().fast_charge_threshold;
        if threshold <= Duration::zero() {
            return Ok(None);
        }

        let Some(previous) = self.registry.previous_charged(charge).await? else {
            return Ok(None);
        };

        let too_close = previous.charge_at == charge.charge_at
            || charge.charge_at - previous.charge_at < threshold;
        Ok(too_close.then_some(previous))
    }

    /// Open a `form` payment for this cycle and link it to the attempt.
    async fn create_payment(&self, charge: &RecurrentCharge) -> Result<Uuid, BillingError> {
        let parent = self
            .store
            .get_payment(charge.parent_payment_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("Parent payment {}", charge.parent_payment_id))
            })?;

        let payment = self
            .store
            .create_payment(&CreatePayment {
                user_id: parent.user_id,
                gateway: parent.gateway.clone(),
                amount: charge.custom_amount.unwrap_or(parent.amount),
                subscription_id: parent.subscription_id,
                catalog_item_id: charge.renewal_catalog_item_id.or(parent.catalog_item_id),
                address_id: parent.address_id,
                is_recurrent: true,
                parent_payment_id: Some(parent.payment_id),
            })
            .await?;

        let linked = self
            .registry
            .link_payment(charge.charge_id, payment.payment_id)
            .await?;
        if linked != payment.payment_id {
            warn!(
                charge_id = %charge.charge_id,
                payment_id = %payment.payment_id,
                linked_payment_id = %linked,
                "Attempt already linked to another payment, new payment left unused"
            );
            return Ok(linked);
        }

        info!(
            charge_id = %charge.charge_id,
            payment_id = %payment.payment_id,
            amount = %payment.amount,
            "Created recurrent payment"
        );
        Ok(payment.payment_id)
    }

    async fn apply_result(
        &self,
        charge: &RecurrentCharge,
        payment: &Payment,
        gateway: &dyn Gateway,
        result: Result<ChargeOutcome, GatewayError>,
    ) -> Result<(AttemptOutcome, GatewayResponse), BillingError> {
        let charge_id = charge.charge_id;

        match result {
            Ok(ChargeOutcome {
                result: ChargeResult::Ok,
                response,
            }) => {
                self.settle(payment, gateway, &response).await?;
                self.registry
                    .transition(
                        charge_id,
                        RecurrentChargeState::Charged,
                        Actor::System,
                        ChargeUpdate::status(response.code.clone()),
                    )
                    .await?;
                Ok((AttemptOutcome::Charged, response))
            }
            Ok(ChargeOutcome {
                result: ChargeResult::Pending,
                response,
            }) => {
                self.registry
                    .transition(
                        charge_id,
                        RecurrentChargeState::Pending,
                        Actor::System,
                        ChargeUpdate::status(response.code.clone()),
                    )
                    .await?;
                Ok((AttemptOutcome::Pending, response))
            }
            Err(GatewayError::Retryable(response)) => {
                self.fail(payment, &response, false).await?;
                self.registry
                    .transition(
                        charge_id,
                        RecurrentChargeState::ChargeFailed,
                        Actor::System,
                        ChargeUpdate::status(response.code.clone()),
                    )
                    .await?;
                let rearmed = self.registry.rearm_failed(charge_id).await?;
                info!(
                    charge_id = %charge_id,
                    state = %rearmed.state,
                    retries = rearmed.retries,
                    "Retryable charge failure"
                );
                Ok((AttemptOutcome::Failed, response))
            }
            Err(GatewayError::Terminal(response)) => {
                self.fail(payment, &response, true).await?;
                self.registry
                    .transition(
                        charge_id,
                        RecurrentChargeState::SystemStop,
                        Actor::System,
                        ChargeUpdate {
                            status: Some(response.code.clone()),
                            note: Some(format!("Terminal failure: {}", response.message)),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok((AttemptOutcome::Stopped, response))
            }
            Err(GatewayError::Hard(response)) => {
                warn!(
                    charge_id = %charge_id,
                    code = %response.code,
                    message = %response.message,
                    "Unhandled charge result, leaving attempt for inspection"
                );
                record_error("gateway_unhandled", "charge");
                // Recording a status takes the attempt out of the due set
                // without touching its retries.
                self.registry
                    .transition(
                        charge_id,
                        RecurrentChargeState::Active,
                        Actor::System,
                        ChargeUpdate {
                            status: Some(response.code.clone()),
                            note: Some(format!(
                                "Unhandled charge result {}: {}",
                                response.code, response.message
                            )),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok((AttemptOutcome::Unhandled, response))
            }
        }
    }

    async fn settle(
        &self,
        payment: &Payment,
        gateway: &dyn Gateway,
        response: &GatewayResponse,
    ) -> Result<bool, BillingError> {
        self.ledger
            .update_status(
                payment.payment_id,
                &StatusUpdate::new(gateway.paid_status())
                    .notify(true)
                    .paid_at(gateway.charged_at(response)),
            )
            .await
    }

    async fn fail(
        &self,
        payment: &Payment,
        response: &GatewayResponse,
        notify: bool,
    ) -> Result<bool, BillingError> {
        self.ledger
            .update_status(
                payment.payment_id,
                &StatusUpdate::new(PaymentStatus::Fail)
                    .notify(notify)
                    .error_message(format!("{}: {}", response.code, response.message)),
            )
            .await
    }

    async fn append_log(
        &self,
        payment_id: Uuid,
        charge_id: Uuid,
        response: &GatewayResponse,
    ) -> Result<(), BillingError> {
        self.store
            .append_log(&CreatePaymentLog {
                payment_id,
                charge_id: Some(charge_id),
                success: response.successful,
                result_code: response.code.clone(),
                result_message: response.message.clone(),
                response: response.data.clone(),
            })
            .await?;
        Ok(())
    }

    /// Apply the asynchronous result of a `pending` attempt.
    #[instrument(skip(self, response), fields(charge_id = %charge_id, succeeded = succeeded))]
    pub async fn resolve_pending(
        &self,
        charge_id: Uuid,
        succeeded: bool,
        response: GatewayResponse,
    ) -> Result<RecurrentCharge, BillingError> {
        let charge = self.registry.get(charge_id).await?;
        let target = if succeeded {
            RecurrentChargeState::Charged
        } else {
            RecurrentChargeState::ChargeFailed
        };
        if charge.state != RecurrentChargeState::Pending {
            return Err(BillingError::IllegalTransition {
                from: charge.state,
                to: target,
            });
        }

        let payment_id = charge.payment_id.ok_or_else(|| {
            BillingError::NotFound(format!("Payment for pending attempt {}", charge_id))
        })?;
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))?;
        let gateway = self.gateways.require(&payment.gateway)?;

        if succeeded {
            self.settle(&payment, gateway.as_ref(), &response).await?;
        } else {
            self.fail(&payment, &response, true).await?;
        }

        let mut resolved = self
            .registry
            .transition(
                charge_id,
                target,
                Actor::System,
                ChargeUpdate::status(response.code.clone()),
            )
            .await?;

        if !succeeded {
            resolved = self.registry.rearm_failed(charge_id).await?;
        }

        self.append_log(payment_id, charge_id, &response).await?;
        record_charge_outcome(if succeeded { "charged" } else { "failed" });
        Ok(resolved)
    }
}
