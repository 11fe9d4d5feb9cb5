//! In-process store. Backs the test suite and dry runs with
//! `STORAGE_BACKEND=memory`; contents are lost when the process exits.

use crate::models::{
    CreatePayment, CreatePaymentLog, CreateRecurrentCharge, Payment, PaymentLog, PaymentStatus,
    RecurrentCharge, RecurrentChargeState, SavePaymentStatus, StoredPaymentMethod,
};
use crate::services::store::ChargeStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rand::seq::SliceRandom;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Attempt row plus its insertion order.
#[derive(Debug, Clone)]
struct ChargeRow {
    charge: RecurrentCharge,
    seq: u64,
}

#[derive(Default)]
struct MemoryState {
    payments: HashMap<Uuid, Payment>,
    methods: HashMap<Uuid, StoredPaymentMethod>,
    charges: HashMap<Uuid, ChargeRow>,
    logs: Vec<PaymentLog>,
    seq: u64,
}

impl MemoryState {
    fn with_token(&self, row: &ChargeRow) -> RecurrentCharge {
        let mut charge = row.charge.clone();
        if let Some(method) = self.methods.get(&charge.method_id) {
            charge.external_token = method.external_token.clone();
        }
        charge
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::InternalError(anyhow::anyhow!("Memory store poisoned")))
    }

    /// Insert a payment as-is. Used to seed imported or already settled
    /// payments that did not go through checkout.
    pub fn insert_payment(&self, payment: Payment) -> Result<(), AppError> {
        self.state()?.payments.insert(payment.payment_id, payment);
        Ok(())
    }

    /// Overwrite an attempt row, bypassing transition rules. Used to seed
    /// historical attempts.
    pub fn put_charge(&self, charge: RecurrentCharge) -> Result<(), AppError> {
        let mut state = self.state()?;
        state.seq += 1;
        let seq = state.seq;
        state.charges.insert(charge.charge_id, ChargeRow { charge, seq });
        Ok(())
    }

    pub fn charges_for_parent(&self, parent_payment_id: Uuid) -> Result<Vec<RecurrentCharge>, AppError> {
        let state = self.state()?;
        let mut rows: Vec<&ChargeRow> = state
            .charges
            .values()
            .filter(|row| row.charge.parent_payment_id == parent_payment_id)
            .collect();
        rows.sort_by_key(|row| row.seq);
        Ok(rows.into_iter().map(|row| state.with_token(row)).collect())
    }
}

#[async_trait]
impl ChargeStore for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        self.state().map(|_| ())
    }

    async fn create_payment(&self, input: &CreatePayment) -> Result<Payment, AppError> {
        let now = Utc::now();
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            user_id: input.user_id,
            gateway: input.gateway.clone(),
            status: PaymentStatus::Form,
            amount: input.amount,
            paid_at: None,
            subscription_id: input.subscription_id,
            catalog_item_id: input.catalog_item_id,
            address_id: input.address_id,
            is_recurrent: input.is_recurrent,
            parent_payment_id: input.parent_payment_id,
            note: None,
            error_message: None,
            created_utc: now,
            updated_utc: now,
        };
        self.state()?
            .payments
            .insert(payment.payment_id, payment.clone());
        Ok(payment)
    }

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError> {
        Ok(self.state()?.payments.get(&payment_id).cloned())
    }

    async fn save_payment_status(
        &self,
        payment_id: Uuid,
        input: &SavePaymentStatus,
    ) -> Result<Payment, AppError> {
        let mut state = self.state()?;
        let payment = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))?;

        payment.status = input.status;
        if payment.paid_at.is_none() {
            payment.paid_at = input.paid_at;
        }
        if input.note.is_some() {
            payment.note = input.note.clone();
        }
        if input.error_message.is_some() {
            payment.error_message = input.error_message.clone();
        }
        payment.updated_utc = Utc::now();

        Ok(payment.clone())
    }

    async fn find_or_create_method(
        &self,
        user_id: Uuid,
        gateway: &str,
        external_token: &str,
    ) -> Result<StoredPaymentMethod, AppError> {
        let mut state = self.state()?;
        if let Some(existing) = state.methods.values().find(|m| {
            m.user_id == user_id && m.gateway == gateway && m.external_token == external_token
        }) {
            return Ok(existing.clone());
        }

        let method = StoredPaymentMethod {
            method_id: Uuid::new_v4(),
            user_id,
            gateway: gateway.to_string(),
            external_token: external_token.to_string(),
            expires_on: None,
            created_utc: Utc::now(),
        };
        state.methods.insert(method.method_id, method.clone());
        Ok(method)
    }

    async fn get_method(&self, method_id: Uuid) -> Result<Option<StoredPaymentMethod>, AppError> {
        Ok(self.state()?.methods.get(&method_id).cloned())
    }

    async fn list_methods_for_gateway(
        &self,
        gateway: &str,
    ) -> Result<Vec<StoredPaymentMethod>, AppError> {
        let mut methods: Vec<StoredPaymentMethod> = self
            .state()?
            .methods
            .values()
            .filter(|m| m.gateway == gateway)
            .cloned()
            .collect();
        methods.sort_by_key(|m| m.created_utc);
        Ok(methods)
    }

    async fn set_method_expiry(
        &self,
        method_id: Uuid,
        expires_on: NaiveDate,
    ) -> Result<(), AppError> {
        let mut state = self.state()?;
        let method = state.methods.get_mut(&method_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Payment method {} not found", method_id))
        })?;
        method.expires_on = Some(expires_on);
        Ok(())
    }

    async fn create_charge(
        &self,
        input: &CreateRecurrentCharge,
    ) -> Result<RecurrentCharge, AppError> {
        let mut state = self.state()?;
        let token = state
            .methods
            .get(&input.method_id)
            .map(|m| m.external_token.clone())
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Payment method {} not found",
                    input.method_id
                ))
            })?;
        if !state.payments.contains_key(&input.parent_payment_id) {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Parent payment {} not found",
                input.parent_payment_id
            )));
        }

        let now = Utc::now();
        let charge = RecurrentCharge {
            charge_id: Uuid::new_v4(),
            method_id: input.method_id,
            parent_payment_id: input.parent_payment_id,
            payment_id: None,
            charge_at: input.charge_at,
            retries: input.retries,
            custom_amount: input.custom_amount,
            renewal_catalog_item_id: input.renewal_catalog_item_id,
            state: RecurrentChargeState::Active,
            status: None,
            note: input.note.clone(),
            external_token: token,
            created_utc: now,
            updated_utc: now,
        };

        state.seq += 1;
        let seq = state.seq;
        state.charges.insert(
            charge.charge_id,
            ChargeRow {
                charge: charge.clone(),
                seq,
            },
        );
        Ok(charge)
    }

    async fn get_charge(&self, charge_id: Uuid) -> Result<Option<RecurrentCharge>, AppError> {
        let state = self.state()?;
        Ok(state.charges.get(&charge_id).map(|row| state.with_token(row)))
    }

    async fn latest_charge_for_parent(
        &self,
        parent_payment_id: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError> {
        let state = self.state()?;
        Ok(state
            .charges
            .values()
            .filter(|row| row.charge.parent_payment_id == parent_payment_id)
            .max_by_key(|row| row.seq)
            .map(|row| state.with_token(row)))
    }

    async fn save_charge(&self, charge: &RecurrentCharge) -> Result<RecurrentCharge, AppError> {
        let mut state = self.state()?;
        let row = state.charges.get_mut(&charge.charge_id).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Recurrent charge {} not found",
                charge.charge_id
            ))
        })?;

        row.charge.state = charge.state;
        row.charge.status = charge.status.clone();
        row.charge.payment_id = charge.payment_id;
        row.charge.retries = charge.retries;
        row.charge.charge_at = charge.charge_at;
        row.charge.note = charge.note.clone();
        row.charge.updated_utc = Utc::now();

        let row = row.clone();
        Ok(state.with_token(&row))
    }

    async fn find_chargeable(
        &self,
        due_before: DateTime<Utc>,
        ids: Option<&[Uuid]>,
    ) -> Result<Vec<RecurrentCharge>, AppError> {
        let state = self.state()?;
        let mut charges: Vec<RecurrentCharge> = state
            .charges
            .values()
            .filter(|row| {
                let c = &row.charge;
                c.state == RecurrentChargeState::Active
                    && c.status.is_none()
                    && c.retries >= 0
                    && c.charge_at <= due_before
                    && ids.map_or(true, |ids| ids.contains(&c.charge_id))
            })
            .map(|row| state.with_token(row))
            .collect();
        charges.shuffle(&mut rand::thread_rng());
        Ok(charges)
    }

    async fn last_charged_for_method(
        &self,
        method_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError> {
        let state = self.state()?;
        Ok(state
            .charges
            .values()
            .filter(|row| {
                row.charge.method_id == method_id
                    && row.charge.state == RecurrentChargeState::Charged
                    && row.charge.charge_id != exclude
            })
            .max_by_key(|row| row.charge.charge_at)
            .map(|row| state.with_token(row)))
    }

    async fn latest_charge_for_token_after(
        &self,
        external_token: &str,
        after: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError> {
        let state = self.state()?;
        Ok(state
            .charges
            .values()
            .filter(|row| {
                row.charge.charge_id != exclude
                    && row.charge.charge_at > after
                    && state
                        .methods
                        .get(&row.charge.method_id)
                        .is_some_and(|m| m.external_token == external_token)
            })
            .max_by_key(|row| row.charge.charge_at)
            .map(|row| state.with_token(row)))
    }

    async fn append_log(&self, input: &CreatePaymentLog) -> Result<PaymentLog, AppError> {
        let log = PaymentLog {
            log_id: Uuid::new_v4(),
            payment_id: input.payment_id,
            charge_id: input.charge_id,
            success: input.success,
            result_code: input.result_code.clone(),
            result_message: input.result_message.clone(),
            response: input.response.clone(),
            created_utc: Utc::now(),
        };
        self.state()?.logs.push(log.clone());
        Ok(log)
    }

    async fn list_logs(&self, payment_id: Uuid) -> Result<Vec<PaymentLog>, AppError> {
        Ok(self
            .state()?
            .logs
            .iter()
            .filter(|log| log.payment_id == payment_id)
            .cloned()
            .collect())
    }
}
