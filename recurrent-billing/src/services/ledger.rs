//! Lock-guarded payment status transitions.

use crate::error::BillingError;
use crate::models::{PaymentStatus, SavePaymentStatus};
use crate::services::events::{BillingEvent, EventSink, MessageQueue, PaymentStatusMessage};
use crate::services::lock::{with_lock, AdvisoryLock};
use crate::services::metrics::{record_error, record_status_transition};
use crate::services::store::ChargeStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Requested status change for one payment.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: PaymentStatus,
    /// Whether the end user should hear about it.
    pub notify: bool,
    pub note: Option<String>,
    pub error_message: Option<String>,
    /// Settlement instant. Defaults to now when a paid-like status is first
    /// reached.
    pub paid_at: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn new(status: PaymentStatus) -> Self {
        Self {
            status,
            notify: false,
            note: None,
            error_message: None,
            paid_at: None,
        }
    }

    pub fn notify(mut self, notify: bool) -> Self {
        self.notify = notify;
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn paid_at(mut self, paid_at: Option<DateTime<Utc>>) -> Self {
        self.paid_at = paid_at;
        self
    }
}

/// The only writer of payment status.
///
/// Every caller that can observe the same payment (gateway callbacks, the
/// batch run, operators) goes through [`PaymentLedger::update_status`],
/// which serializes them on a per-payment lock and turns duplicate requests
/// into no-ops.
pub struct PaymentLedger {
    store: Arc<dyn ChargeStore>,
    lock: Arc<dyn AdvisoryLock>,
    events: Arc<dyn EventSink>,
    queue: Arc<dyn MessageQueue>,
    lock_timeout: Duration,
}

impl PaymentLedger {
    pub fn new(
        store: Arc<dyn ChargeStore>,
        lock: Arc<dyn AdvisoryLock>,
        events: Arc<dyn EventSink>,
        queue: Arc<dyn MessageQueue>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            lock,
            events,
            queue,
            lock_timeout,
        }
    }

    pub fn lock_key(payment_id: Uuid) -> String {
        format!("payment:{}", payment_id)
    }

    /// Move a payment to `update.status`.
    ///
    /// Returns `Ok(false)` when nothing changed: the payment already had that
    /// status, or it is paid-like and the request was `fail`. A
    /// `LockTimeout` means the outcome is unknown and the caller should retry.
    #[instrument(skip(self, update), fields(payment_id = %payment_id, to = %update.status))]
    pub async fn update_status(
        &self,
        payment_id: Uuid,
        update: &StatusUpdate,
    ) -> Result<bool, BillingError> {
        let key = Self::lock_key(payment_id);
        let change = with_lock(self.lock.as_ref(), &key, self.lock_timeout, move || {
            self.apply(payment_id, update)
        })
        .await?;

        let Some((old_status, new_status)) = change else {
            return Ok(false);
        };

        info!(
            payment_id = %payment_id,
            old_status = %old_status,
            new_status = %new_status,
            "Payment status updated"
        );

        let event = BillingEvent::PaymentStatusChanged {
            payment_id,
            old_status,
            new_status,
            notify_user: update.notify,
        };
        if let Err(e) = self.events.emit(event).await {
            warn!(payment_id = %payment_id, error = %e, "Failed to emit payment event");
            record_error("event", "update_status");
        }

        let message = PaymentStatusMessage {
            payment_id,
            notify_user: update.notify,
        };
        if let Err(e) = self.queue.publish(&message).await {
            warn!(payment_id = %payment_id, error = %e, "Failed to publish payment message");
            record_error("queue", "update_status");
        }

        Ok(true)
    }

    /// Re-read and write under the payment lock. Returns the old and new
    /// status when the row actually changed.
    async fn apply(
        &self,
        payment_id: Uuid,
        update: &StatusUpdate,
    ) -> Result<Option<(PaymentStatus, PaymentStatus)>, BillingError> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))?;

        if payment.status == update.status {
            record_status_transition(update.status.as_str(), "noop");
            return Ok(None);
        }

        if payment.status.is_paid_like() && update.status == PaymentStatus::Fail {
            warn!(
                payment_id = %payment_id,
                current = %payment.status,
                "Rejected transition from settled payment to fail"
            );
            record_status_transition(update.status.as_str(), "rejected");
            return Ok(None);
        }

        let paid_at = if update.status.is_paid_like() && payment.paid_at.is_none() {
            Some(update.paid_at.unwrap_or_else(Utc::now))
        } else {
            None
        };

        let saved = self
            .store
            .save_payment_status(
                payment_id,
                &SavePaymentStatus {
                    status: update.status,
                    paid_at,
                    note: update.note.clone(),
                    error_message: update.error_message.clone(),
                },
            )
            .await?;

        record_status_transition(update.status.as_str(), "applied");
        Ok(Some((payment.status, saved.status)))
    }
}
