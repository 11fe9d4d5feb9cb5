//! Recurrent charge attempts: creation, queries and state transitions.

use crate::config::SchedulingConfig;
use crate::error::BillingError;
use crate::models::{
    Actor, CatalogTerms, ChargeUpdate, CreateRecurrentCharge, Payment, PaymentStatus,
    RecurrentCharge, RecurrentChargeState, StoredPaymentMethod, SubscriptionSnapshot,
};
use crate::services::events::{BillingEvent, EventSink};
use crate::services::gateway::GatewayRegistry;
use crate::services::lock::{with_lock, AdvisoryLock};
use crate::services::metrics::record_error;
use crate::services::schedule::calculate_charge_at;
use crate::services::store::ChargeStore;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Status held by an attempt while one run owns it. It keeps the attempt out
/// of the chargeable set of every other run.
pub const IN_FLIGHT_STATUS: &str = "IN_FLIGHT";

pub struct RecurrentChargeRegistry {
    store: Arc<dyn ChargeStore>,
    lock: Arc<dyn AdvisoryLock>,
    events: Arc<dyn EventSink>,
    gateways: Arc<GatewayRegistry>,
    config: SchedulingConfig,
    lock_timeout: Duration,
}

impl RecurrentChargeRegistry {
    pub fn new(
        store: Arc<dyn ChargeStore>,
        lock: Arc<dyn AdvisoryLock>,
        events: Arc<dyn EventSink>,
        gateways: Arc<GatewayRegistry>,
        config: SchedulingConfig,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            store,
            lock,
            events,
            gateways,
            config,
            lock_timeout,
        }
    }

    pub fn config(&self) -> &SchedulingConfig {
        &self.config
    }

    pub fn lock_key(charge_id: Uuid) -> String {
        format!("recurrent_charge:{}", charge_id)
    }

    fn parent_lock_key(parent_payment_id: Uuid) -> String {
        format!("recurrent_charge_parent:{}", parent_payment_id)
    }

    pub async fn get(&self, charge_id: Uuid) -> Result<RecurrentCharge, BillingError> {
        self.store
            .get_charge(charge_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Recurrent charge {}", charge_id)))
    }

    async fn payment(&self, payment_id: Uuid) -> Result<Payment, BillingError> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Payment {}", payment_id)))
    }

    // ---------------------------------------------------------------------
    // Stored payment methods
    // ---------------------------------------------------------------------

    /// Record a reusable token the first time a charge or authorization
    /// yields one. Registering the same token again returns the same method.
    pub async fn register_method(
        &self,
        user_id: Uuid,
        gateway: &str,
        external_token: &str,
    ) -> Result<StoredPaymentMethod, BillingError> {
        Ok(self
            .store
            .find_or_create_method(user_id, gateway, external_token)
            .await?)
    }

    pub async fn update_method_expiry(
        &self,
        method_id: Uuid,
        expires_on: NaiveDate,
    ) -> Result<(), BillingError> {
        Ok(self.store.set_method_expiry(method_id, expires_on).await?)
    }

    // ---------------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------------

    /// Schedule an attempt for `parent_payment_id`, or return the attempt
    /// that already exists for it.
    pub async fn create_attempt(
        &self,
        method_id: Uuid,
        parent_payment_id: Uuid,
        charge_at: DateTime<Utc>,
        custom_amount: Option<Decimal>,
        retries: Option<i32>,
    ) -> Result<RecurrentCharge, BillingError> {
        self.create_attempt_from(CreateRecurrentCharge {
            method_id,
            parent_payment_id,
            charge_at,
            retries: retries.unwrap_or(self.config.default_retries),
            custom_amount,
            renewal_catalog_item_id: None,
            note: None,
        })
        .await
    }

    #[instrument(skip(self, input), fields(parent_payment_id = %input.parent_payment_id))]
    pub async fn create_attempt_from(
        &self,
        input: CreateRecurrentCharge,
    ) -> Result<RecurrentCharge, BillingError> {
        let key = Self::parent_lock_key(input.parent_payment_id);
        let input = &input;

        with_lock(self.lock.as_ref(), &key, self.lock_timeout, move || {
            self.insert_unless_exists(input)
        })
        .await
    }

    async fn insert_unless_exists(
        &self,
        input: &CreateRecurrentCharge,
    ) -> Result<RecurrentCharge, BillingError> {
        if let Some(existing) = self
            .store
            .latest_charge_for_parent(input.parent_payment_id)
            .await?
        {
            info!(
                charge_id = %existing.charge_id,
                parent_payment_id = %input.parent_payment_id,
                "Attempt already exists for parent payment"
            );
            return Ok(existing);
        }

        let charge = self.store.create_charge(input).await?;
        info!(
            charge_id = %charge.charge_id,
            charge_at = %charge.charge_at,
            retries = charge.retries,
            "Recurrent charge scheduled"
        );
        Ok(charge)
    }

    /// Chain the attempt for the next billing cycle after `charged`.
    ///
    /// The payment produced by `charged` becomes the new parent.
    pub async fn schedule_next(
        &self,
        charged: &RecurrentCharge,
        subscription: Option<&SubscriptionSnapshot>,
        terms: &CatalogTerms,
    ) -> Result<RecurrentCharge, BillingError> {
        if charged.state != RecurrentChargeState::Charged {
            return Err(BillingError::InvalidSchedule(format!(
                "attempt {} is {}, not charged",
                charged.charge_id, charged.state
            )));
        }
        let payment_id = charged.payment_id.ok_or_else(|| {
            BillingError::InvalidSchedule(format!(
                "attempt {} has no resulting payment",
                charged.charge_id
            ))
        })?;
        let payment = self.payment(payment_id).await?;

        let charge_at = calculate_charge_at(
            &payment,
            subscription,
            terms,
            self.config.charge_before_hours,
            Utc::now(),
        )?;

        self.create_attempt_from(CreateRecurrentCharge {
            method_id: charged.method_id,
            parent_payment_id: payment.payment_id,
            charge_at,
            retries: self.config.default_retries,
            custom_amount: charged.custom_amount,
            renewal_catalog_item_id: charged.renewal_catalog_item_id,
            note: None,
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Transitions
    // ---------------------------------------------------------------------

    /// Move an attempt to `to` on behalf of `actor`, writing `update` along
    /// the way. Emits one event if the state actually changed.
    pub async fn transition(
        &self,
        charge_id: Uuid,
        to: RecurrentChargeState,
        actor: Actor,
        update: ChargeUpdate,
    ) -> Result<RecurrentCharge, BillingError> {
        self.apply(charge_id, move |charge| {
            if !charge.state.allows(to, actor) {
                return Err(BillingError::IllegalTransition {
                    from: charge.state,
                    to,
                });
            }
            charge.state = to;
            if let Some(status) = update.status {
                charge.status = Some(status);
            }
            if let Some(payment_id) = update.payment_id {
                charge.payment_id = Some(payment_id);
            }
            if let Some(note) = update.note {
                charge.push_note(&note);
            }
            Ok(())
        })
        .await
    }

    /// Re-read the attempt under its lock, mutate, persist, then notify.
    async fn apply<F>(&self, charge_id: Uuid, mutate: F) -> Result<RecurrentCharge, BillingError>
    where
        F: FnOnce(&mut RecurrentCharge) -> Result<(), BillingError> + Send,
    {
        let key = Self::lock_key(charge_id);
        let (old_state, charge) = with_lock(self.lock.as_ref(), &key, self.lock_timeout, move || {
            self.mutate_locked(charge_id, mutate)
        })
        .await?;

        if old_state != charge.state {
            info!(
                charge_id = %charge_id,
                old_state = %old_state,
                new_state = %charge.state,
                "Recurrent charge transitioned"
            );
            let event = BillingEvent::ChargeStateChanged {
                charge_id,
                old_state,
                new_state: charge.state,
            };
            if let Err(e) = self.events.emit(event).await {
                warn!(charge_id = %charge_id, error = %e, "Failed to emit charge event");
                record_error("event", "transition");
            }
        }

        Ok(charge)
    }

    async fn mutate_locked<F>(
        &self,
        charge_id: Uuid,
        mutate: F,
    ) -> Result<(RecurrentChargeState, RecurrentCharge), BillingError>
    where
        F: FnOnce(&mut RecurrentCharge) -> Result<(), BillingError> + Send,
    {
        let mut charge = self.get(charge_id).await?;
        let old_state = charge.state;
        mutate(&mut charge)?;
        let saved = self.store.save_charge(&charge).await?;
        Ok((old_state, saved))
    }

    // ---------------------------------------------------------------------
    // Run ownership
    // ---------------------------------------------------------------------

    /// Take a due attempt for the current run.
    ///
    /// Re-reads the attempt under its lock and marks it in flight. Returns
    /// `None` when it is no longer active, already carries a status (another
    /// run owns it or a result was recorded) or is no longer due.
    #[instrument(skip(self), fields(charge_id = %charge_id))]
    pub async fn claim(&self, charge_id: Uuid) -> Result<Option<RecurrentCharge>, BillingError> {
        let key = Self::lock_key(charge_id);
        with_lock(self.lock.as_ref(), &key, self.lock_timeout, move || {
            self.claim_locked(charge_id)
        })
        .await
    }

    async fn claim_locked(&self, charge_id: Uuid) -> Result<Option<RecurrentCharge>, BillingError> {
        let mut charge = self.get(charge_id).await?;
        let due_before = Utc::now() + self.config.lookahead;
        if charge.state != RecurrentChargeState::Active
            || charge.status.is_some()
            || charge.charge_at > due_before
        {
            return Ok(None);
        }

        charge.status = Some(IN_FLIGHT_STATUS.to_string());
        Ok(Some(self.store.save_charge(&charge).await?))
    }

    /// Give a claimed attempt back to the queue. Used when a run fails before
    /// the gateway was called.
    pub async fn release_claim(&self, charge_id: Uuid) -> Result<RecurrentCharge, BillingError> {
        self.apply(charge_id, |charge| {
            if charge.state == RecurrentChargeState::Active
                && charge.status.as_deref() == Some(IN_FLIGHT_STATUS)
            {
                charge.status = None;
            }
            Ok(())
        })
        .await
    }

    /// Link `payment_id` unless the attempt already has a payment. Returns
    /// the payment the attempt ends up linked to.
    pub async fn link_payment(
        &self,
        charge_id: Uuid,
        payment_id: Uuid,
    ) -> Result<Uuid, BillingError> {
        let linked = self
            .apply(charge_id, move |charge| {
                if charge.payment_id.is_none() {
                    charge.payment_id = Some(payment_id);
                }
                Ok(())
            })
            .await?;
        Ok(linked.payment_id.unwrap_or(payment_id))
    }

    /// Put a failed attempt back in the queue if it has retries left.
    ///
    /// Consumes one retry and pushes `charge_at` out by the retry delay. An
    /// attempt with no retries left stays `charge_failed` with a note and is
    /// never selected by a run again.
    pub async fn rearm_failed(&self, charge_id: Uuid) -> Result<RecurrentCharge, BillingError> {
        let retry_delay = self.config.retry_delay;
        self.apply(charge_id, move |charge| {
            if charge.state != RecurrentChargeState::ChargeFailed {
                return Err(BillingError::IllegalTransition {
                    from: charge.state,
                    to: RecurrentChargeState::Active,
                });
            }
            if charge.retries <= 0 {
                info!(charge_id = %charge.charge_id, "Retries exhausted, attempt stays charge_failed");
                charge.push_note("Retries exhausted");
                return Ok(());
            }
            charge.retries -= 1;
            charge.state = RecurrentChargeState::Active;
            charge.charge_at = Utc::now() + retry_delay;
            charge.status = None;
            charge.push_note(&format!("Retry scheduled, {} left", charge.retries));
            Ok(())
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Stopping
    // ---------------------------------------------------------------------

    /// False when the gateway forbids cancellation or the parent payment
    /// was prepaid.
    pub async fn can_be_stopped(&self, charge: &RecurrentCharge) -> Result<bool, BillingError> {
        let parent = self.payment(charge.parent_payment_id).await?;
        if let Some(gateway) = self.gateways.get(&parent.gateway) {
            if gateway.unstoppable() {
                return Ok(false);
            }
        }
        Ok(parent.status != PaymentStatus::Prepaid)
    }

    pub async fn can_be_stopped_by_user(
        &self,
        charge: &RecurrentCharge,
    ) -> Result<bool, BillingError> {
        if !self.can_be_stopped(charge).await? {
            return Ok(false);
        }
        let parent = self.payment(charge.parent_payment_id).await?;
        Ok(!self
            .gateways
            .get(&parent.gateway)
            .is_some_and(|gateway| gateway.user_unstoppable()))
    }

    pub async fn stop_by_user(&self, charge_id: Uuid) -> Result<RecurrentCharge, BillingError> {
        let charge = self.get(charge_id).await?;
        if !self.can_be_stopped_by_user(&charge).await? {
            return Err(BillingError::IllegalTransition {
                from: charge.state,
                to: RecurrentChargeState::UserStop,
            });
        }
        self.transition(
            charge_id,
            RecurrentChargeState::UserStop,
            Actor::User,
            ChargeUpdate::note("Stopped by user"),
        )
        .await
    }

    pub async fn stop_by_admin(
        &self,
        charge_id: Uuid,
        reason: &str,
    ) -> Result<RecurrentCharge, BillingError> {
        let charge = self.get(charge_id).await?;
        if !self.can_be_stopped(&charge).await? {
            return Err(BillingError::IllegalTransition {
                from: charge.state,
                to: RecurrentChargeState::AdminStop,
            });
        }
        self.transition(
            charge_id,
            RecurrentChargeState::AdminStop,
            Actor::Admin,
            ChargeUpdate::note(format!("Stopped by admin: {}", reason)),
        )
        .await
    }

    /// True for stop states, and for a failed attempt whose latest successor
    /// on the same token is stopped.
    pub async fn is_effectively_stopped(
        &self,
        charge: &RecurrentCharge,
    ) -> Result<bool, BillingError> {
        if charge.state.is_stop() {
            return Ok(true);
        }
        if charge.state != RecurrentChargeState::ChargeFailed {
            return Ok(false);
        }

        let successor = self
            .store
            .latest_charge_for_token_after(charge.token(), charge.charge_at, charge.charge_id)
            .await?;
        Ok(successor.is_some_and(|next| next.state.is_stop()))
    }

    // ---------------------------------------------------------------------
    // Reactivation
    // ---------------------------------------------------------------------

    /// Replace an exhausted, recently system-stopped attempt with a fresh
    /// one scheduled after the reactivation delay.
    #[instrument(skip(self), fields(charge_id = %charge_id))]
    pub async fn reactivate_after_system_stop(
        &self,
        charge_id: Uuid,
    ) -> Result<RecurrentCharge, BillingError> {
        let charge = self.get(charge_id).await?;
        if !self.can_be_stopped(&charge).await? {
            return Err(BillingError::ReactivationUnavailable(format!(
                "attempt {} cannot be stopped",
                charge_id
            )));
        }

        let key = Self::parent_lock_key(charge.parent_payment_id);
        with_lock(self.lock.as_ref(), &key, self.lock_timeout, move || {
            self.reactivate_locked(charge_id)
        })
        .await
    }

    async fn reactivate_locked(&self, charge_id: Uuid) -> Result<RecurrentCharge, BillingError> {
        let now = Utc::now();
        let mut stopped = self.get(charge_id).await?;

        if stopped.state != RecurrentChargeState::SystemStop {
            return Err(BillingError::ReactivationUnavailable(format!(
                "attempt {} is {}, not system_stop",
                charge_id, stopped.state
            )));
        }
        if stopped.retries != 0 {
            return Err(BillingError::ReactivationUnavailable(format!(
                "attempt {} still has {} retries",
                charge_id, stopped.retries
            )));
        }
        if stopped.charge_at < now - self.config.reactivation_window {
            return Err(BillingError::ReactivationUnavailable(format!(
                "attempt {} was due at {}, outside the reactivation window",
                charge_id, stopped.charge_at
            )));
        }
        if let Some(latest) = self
            .store
            .latest_charge_for_parent(stopped.parent_payment_id)
            .await?
        {
            if latest.charge_id != charge_id {
                return Err(BillingError::ReactivationUnavailable(format!(
                    "attempt {} was superseded by {}",
                    charge_id, latest.charge_id
                )));
            }
        }

        let fresh = self
            .store
            .create_charge(&CreateRecurrentCharge {
                method_id: stopped.method_id,
                parent_payment_id: stopped.parent_payment_id,
                charge_at: now + self.config.reactivation_delay,
                retries: self.config.default_retries,
                custom_amount: stopped.custom_amount,
                renewal_catalog_item_id: stopped.renewal_catalog_item_id,
                note: Some(format!("Reactivated from {}", charge_id)),
            })
            .await?;

        stopped.push_note(&format!("Reactivated as {}", fresh.charge_id));
        self.store.save_charge(&stopped).await?;

        info!(
            charge_id = %charge_id,
            new_charge_id = %fresh.charge_id,
            charge_at = %fresh.charge_at,
            "Recurrent charge reactivated"
        );
        Ok(fresh)
    }

    /// Undo a user stop while the attempt is still due in the future.
    pub async fn reactivate_by_user(&self, charge_id: Uuid) -> Result<RecurrentCharge, BillingError> {
        let charge = self.get(charge_id).await?;
        if !self.can_be_stopped_by_user(&charge).await? {
            return Err(BillingError::ReactivationUnavailable(format!(
                "attempt {} is not user-controllable",
                charge_id
            )));
        }

        self.apply(charge_id, move |charge| {
            if charge.state != RecurrentChargeState::UserStop {
                return Err(BillingError::ReactivationUnavailable(format!(
                    "attempt {} is {}, not user_stop",
                    charge.charge_id, charge.state
                )));
            }
            if charge.charge_at <= Utc::now() {
                return Err(BillingError::ReactivationUnavailable(format!(
                    "attempt {} was due at {}",
                    charge.charge_id, charge.charge_at
                )));
            }
            charge.state = RecurrentChargeState::Active;
            charge.push_note("Reactivated by user");
            Ok(())
        })
        .await
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    /// Due attempts, in random order. `ids` restricts the set for manual
    /// re-runs.
    pub async fn chargeable(
        &self,
        ids: Option<&[Uuid]>,
    ) -> Result<Vec<RecurrentCharge>, BillingError> {
        let due_before = Utc::now() + self.config.lookahead;
        Ok(self.store.find_chargeable(due_before, ids).await?)
    }

    /// Most recent charged attempt on the same stored method.
    pub async fn previous_charged(
        &self,
        charge: &RecurrentCharge,
    ) -> Result<Option<RecurrentCharge>, BillingError> {
        Ok(self
            .store
            .last_charged_for_method(charge.method_id, charge.charge_id)
            .await?)
    }
}
