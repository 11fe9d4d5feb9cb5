//! Persistence contract for payments, stored methods and recurrent charges.

use crate::models::{
    CreatePayment, CreatePaymentLog, CreateRecurrentCharge, Payment, PaymentLog, RecurrentCharge,
    SavePaymentStatus, StoredPaymentMethod,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Durable state behind the registry and the payment ledger.
///
/// Implementations perform plain reads and writes; mutual exclusion is the
/// caller's job (see `services::lock`).
#[async_trait]
pub trait ChargeStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    // Payments

    async fn create_payment(&self, input: &CreatePayment) -> Result<Payment, AppError>;

    async fn get_payment(&self, payment_id: Uuid) -> Result<Option<Payment>, AppError>;

    async fn save_payment_status(
        &self,
        payment_id: Uuid,
        input: &SavePaymentStatus,
    ) -> Result<Payment, AppError>;

    // Stored payment methods

    /// Return the method for (user, gateway, token), creating it on first use.
    async fn find_or_create_method(
        &self,
        user_id: Uuid,
        gateway: &str,
        external_token: &str,
    ) -> Result<StoredPaymentMethod, AppError>;

    async fn get_method(&self, method_id: Uuid) -> Result<Option<StoredPaymentMethod>, AppError>;

    async fn list_methods_for_gateway(
        &self,
        gateway: &str,
    ) -> Result<Vec<StoredPaymentMethod>, AppError>;

    async fn set_method_expiry(&self, method_id: Uuid, expires_on: NaiveDate)
        -> Result<(), AppError>;

    // Recurrent charges

    async fn create_charge(
        &self,
        input: &CreateRecurrentCharge,
    ) -> Result<RecurrentCharge, AppError>;

    async fn get_charge(&self, charge_id: Uuid) -> Result<Option<RecurrentCharge>, AppError>;

    /// Most recently created attempt descended from `parent_payment_id`.
    async fn latest_charge_for_parent(
        &self,
        parent_payment_id: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError>;

    /// Persist the mutable fields of an attempt (state, status, payment link,
    /// retries, charge_at, note).
    async fn save_charge(&self, charge: &RecurrentCharge) -> Result<RecurrentCharge, AppError>;

    /// Active attempts without a recorded status, retries >= 0 and
    /// `charge_at <= due_before`, in random order. `ids` narrows the set.
    async fn find_chargeable(
        &self,
        due_before: DateTime<Utc>,
        ids: Option<&[Uuid]>,
    ) -> Result<Vec<RecurrentCharge>, AppError>;

    /// Latest `charged` attempt on the same stored method, other than `exclude`.
    async fn last_charged_for_method(
        &self,
        method_id: Uuid,
        exclude: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError>;

    /// Latest attempt sharing `external_token` scheduled after `after`.
    async fn latest_charge_for_token_after(
        &self,
        external_token: &str,
        after: DateTime<Utc>,
        exclude: Uuid,
    ) -> Result<Option<RecurrentCharge>, AppError>;

    // Audit log

    async fn append_log(&self, input: &CreatePaymentLog) -> Result<PaymentLog, AppError>;

    async fn list_logs(&self, payment_id: Uuid) -> Result<Vec<PaymentLog>, AppError>;
}
