//! Read-only subscription and catalog data used for scheduling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Snapshot of a subscription row at scheduling time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub subscription_id: Uuid,
    pub start_at: DateTime<Utc>,
    /// Paid-through instant.
    pub end_at: DateTime<Utc>,
}

/// Billing terms of the catalog item a payment was made for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogTerms {
    pub length_days: i64,
    /// Per-item lead time, overrides the global setting when present.
    pub charge_before_hours: Option<i64>,
}
