//! Recurrent charge attempt model and its transition table.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Recurrent charge attempt state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RecurrentChargeState {
    Active,
    Pending,
    Charged,
    ChargeFailed,
    SystemStop,
    UserStop,
    AdminStop,
}

impl RecurrentChargeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrentChargeState::Active => "active",
            RecurrentChargeState::Pending => "pending",
            RecurrentChargeState::Charged => "charged",
            RecurrentChargeState::ChargeFailed => "charge_failed",
            RecurrentChargeState::SystemStop => "system_stop",
            RecurrentChargeState::UserStop => "user_stop",
            RecurrentChargeState::AdminStop => "admin_stop",
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            RecurrentChargeState::SystemStop
                | RecurrentChargeState::UserStop
                | RecurrentChargeState::AdminStop
        )
    }

    /// Whether `actor` may move an attempt from `self` to `to`.
    ///
    /// Re-entering the current state is always allowed; it only rewrites
    /// fields and never counts as a state change.
    pub fn allows(&self, to: RecurrentChargeState, actor: Actor) -> bool {
        use Actor::*;
        use RecurrentChargeState::*;

        if *self == to {
            return true;
        }

        matches!(
            (*self, to, actor),
            (Active, Charged, System)
                | (Active, Pending, System)
                | (Active, ChargeFailed, System)
                | (Active, SystemStop, System)
                | (Active, UserStop, User)
                | (Active, AdminStop, Admin)
                | (Pending, Charged, System)
                | (Pending, ChargeFailed, System)
                | (ChargeFailed, Active, System)
                | (ChargeFailed, UserStop, User)
                | (ChargeFailed, AdminStop, Admin)
                | (UserStop, Active, User)
        )
    }
}

impl std::fmt::Display for RecurrentChargeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who is requesting a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    User,
    Admin,
    System,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::User => "user",
            Actor::Admin => "admin",
            Actor::System => "system",
        }
    }
}

/// A scheduled future charge against a stored payment method.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurrentCharge {
    pub charge_id: Uuid,
    pub method_id: Uuid,
    pub parent_payment_id: Uuid,
    pub payment_id: Option<Uuid>,
    pub charge_at: DateTime<Utc>,
    pub retries: i32,
    pub custom_amount: Option<Decimal>,
    pub renewal_catalog_item_id: Option<Uuid>,
    pub state: RecurrentChargeState,
    pub status: Option<String>,
    pub note: Option<String>,
    /// Joined from the stored payment method, never written through here.
    pub external_token: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl RecurrentCharge {
    /// Bare credential token, for consumers that predate stored methods.
    pub fn token(&self) -> &str {
        &self.external_token
    }

    /// Append a line to the operational note.
    pub fn push_note(&mut self, line: &str) {
        self.note = Some(match self.note.take() {
            Some(existing) if !existing.is_empty() => format!("{}\n{}", existing, line),
            _ => line.to_string(),
        });
    }
}

/// Input for scheduling a new attempt.
#[derive(Debug, Clone)]
pub struct CreateRecurrentCharge {
    pub method_id: Uuid,
    pub parent_payment_id: Uuid,
    pub charge_at: DateTime<Utc>,
    pub retries: i32,
    pub custom_amount: Option<Decimal>,
    pub renewal_catalog_item_id: Option<Uuid>,
    pub note: Option<String>,
}

/// Fields a caller may set alongside a state transition.
#[derive(Debug, Clone, Default)]
pub struct ChargeUpdate {
    pub status: Option<String>,
    pub payment_id: Option<Uuid>,
    pub note: Option<String>,
}

impl ChargeUpdate {
    pub fn note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            ..Default::default()
        }
    }

    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(status.into()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Actor::*;
    use RecurrentChargeState::*;

    #[test]
    fn system_drives_gateway_outcomes() {
        assert!(Active.allows(Charged, System));
        assert!(Active.allows(Pending, System));
        assert!(Active.allows(ChargeFailed, System));
        assert!(Active.allows(SystemStop, System));
        assert!(Pending.allows(Charged, System));
        assert!(Pending.allows(ChargeFailed, System));
    }

    #[test]
    fn stops_are_restricted_to_their_actor() {
        assert!(Active.allows(UserStop, User));
        assert!(!Active.allows(UserStop, Admin));
        assert!(Active.allows(AdminStop, Admin));
        assert!(!Active.allows(AdminStop, User));
        assert!(!Active.allows(Charged, User));
    }

    #[test]
    fn terminal_states_do_not_move() {
        assert!(!Charged.allows(Active, System));
        assert!(!Charged.allows(ChargeFailed, System));
        assert!(!SystemStop.allows(Active, Admin));
        assert!(!AdminStop.allows(Active, User));
        assert!(UserStop.allows(Active, User));
    }

    #[test]
    fn same_state_is_not_a_violation() {
        assert!(Charged.allows(Charged, System));
        assert!(Active.allows(Active, System));
    }

    #[test]
    fn notes_accumulate() {
        let mut charge = RecurrentCharge {
            charge_id: Uuid::new_v4(),
            method_id: Uuid::new_v4(),
            parent_payment_id: Uuid::new_v4(),
            payment_id: None,
            charge_at: Utc::now(),
            retries: 1,
            custom_amount: None,
            renewal_catalog_item_id: None,
            state: Active,
            status: None,
            note: None,
            external_token: "tok".to_string(),
            created_utc: Utc::now(),
            updated_utc: Utc::now(),
        };
        charge.push_note("first");
        charge.push_note("second");
        assert_eq!(charge.note.as_deref(), Some("first\nsecond"));
        assert_eq!(charge.token(), "tok");
    }
}
