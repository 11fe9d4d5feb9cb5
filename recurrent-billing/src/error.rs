//! Error taxonomy for the recurrent charge core.

use crate::models::RecurrentChargeState;
use service_core::error::AppError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition {
        from: RecurrentChargeState,
        to: RecurrentChargeState,
    },

    #[error("Reactivation unavailable: {0}")]
    ReactivationUnavailable(String),

    #[error("Timed out after {waited:?} waiting for lock {key}")]
    LockTimeout { key: String, waited: Duration },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error(transparent)]
    Storage(#[from] AppError),
}

impl BillingError {
    /// Errors that make continuing a batch pointless. Everything else is
    /// local to one attempt.
    pub fn is_systemic(&self) -> bool {
        match self {
            BillingError::Storage(e) => e.is_infrastructure(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Storage(AppError::from(err))
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Storage(AppError::from(err))
    }
}
