//! Payment ledger model.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Form,
    Paid,
    Fail,
    Timeout,
    Refund,
    Imported,
    Prepaid,
    Authorized,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Form => "form",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Fail => "fail",
            PaymentStatus::Timeout => "timeout",
            PaymentStatus::Refund => "refund",
            PaymentStatus::Imported => "imported",
            PaymentStatus::Prepaid => "prepaid",
            PaymentStatus::Authorized => "authorized",
        }
    }

    /// Parse a stored status. Unknown values are rejected rather than
    /// defaulted, a payment must never silently become `form`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "form" => Some(PaymentStatus::Form),
            "paid" => Some(PaymentStatus::Paid),
            "fail" => Some(PaymentStatus::Fail),
            "timeout" => Some(PaymentStatus::Timeout),
            "refund" => Some(PaymentStatus::Refund),
            "imported" => Some(PaymentStatus::Imported),
            "prepaid" => Some(PaymentStatus::Prepaid),
            "authorized" => Some(PaymentStatus::Authorized),
            _ => None,
        }
    }

    /// Statuses that represent a successful settlement.
    pub fn is_paid_like(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Paid | PaymentStatus::Prepaid | PaymentStatus::Authorized
        )
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single money movement attempt.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub payment_id: Uuid,
    pub user_id: Uuid,
    pub gateway: String,
    pub status: PaymentStatus,
    pub amount: Decimal,
    pub paid_at: Option<DateTime<Utc>>,
    pub subscription_id: Option<Uuid>,
    pub catalog_item_id: Option<Uuid>,
    pub address_id: Option<Uuid>,
    pub is_recurrent: bool,
    pub parent_payment_id: Option<Uuid>,
    pub note: Option<String>,
    pub error_message: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Input for creating a payment. Payments always start in `form`.
#[derive(Debug, Clone)]
pub struct CreatePayment {
    pub user_id: Uuid,
    pub gateway: String,
    pub amount: Decimal,
    pub subscription_id: Option<Uuid>,
    pub catalog_item_id: Option<Uuid>,
    pub address_id: Option<Uuid>,
    pub is_recurrent: bool,
    pub parent_payment_id: Option<Uuid>,
}

/// Persisted result of an effective status change.
#[derive(Debug, Clone)]
pub struct SavePaymentStatus {
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub error_message: Option<String>,
}

/// Reusable tokenized credential issued by a gateway.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StoredPaymentMethod {
    pub method_id: Uuid,
    pub user_id: Uuid,
    pub gateway: String,
    pub external_token: String,
    pub expires_on: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
}

/// Audit entry for one gateway interaction.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentLog {
    pub log_id: Uuid,
    pub payment_id: Uuid,
    pub charge_id: Option<Uuid>,
    pub success: bool,
    pub result_code: String,
    pub result_message: String,
    pub response: serde_json::Value,
    pub created_utc: DateTime<Utc>,
}

/// Input for appending an audit entry.
#[derive(Debug, Clone)]
pub struct CreatePaymentLog {
    pub payment_id: Uuid,
    pub charge_id: Option<Uuid>,
    pub success: bool,
    pub result_code: String,
    pub result_message: String,
    pub response: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paid_like_statuses() {
        assert!(PaymentStatus::Paid.is_paid_like());
        assert!(PaymentStatus::Prepaid.is_paid_like());
        assert!(PaymentStatus::Authorized.is_paid_like());
        assert!(!PaymentStatus::Form.is_paid_like());
        assert!(!PaymentStatus::Fail.is_paid_like());
        assert!(!PaymentStatus::Refund.is_paid_like());
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert_eq!(PaymentStatus::parse("prepaid"), Some(PaymentStatus::Prepaid));
        assert_eq!(PaymentStatus::parse("settled"), None);
    }
}
