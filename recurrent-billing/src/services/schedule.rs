//! Next charge instant calculation.
//!
//! Pure over the snapshot it is handed: the caller reads the payment, the
//! subscription row (if any) and the catalog terms, this module only does
//! the arithmetic and the sanity checks.

use crate::error::BillingError;
use crate::models::{CatalogTerms, Payment, SubscriptionSnapshot};
use chrono::{DateTime, Duration, Utc};

/// Compute when the next recurrent charge for `payment` should run.
///
/// The paid-through instant is the subscription end, or `paid_at` plus the
/// catalog length when no subscription row exists yet. A positive lead time
/// moves the charge earlier by that many hours, a negative one moves it
/// later.
pub fn calculate_charge_at(
    payment: &Payment,
    subscription: Option<&SubscriptionSnapshot>,
    terms: &CatalogTerms,
    global_charge_before_hours: Option<i64>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, BillingError> {
    let paid_through = match subscription {
        Some(sub) => sub.end_at,
        None => {
            let paid_at = payment.paid_at.ok_or_else(|| {
                BillingError::InvalidSchedule(format!(
                    "payment {} has no paid_at and no subscription row",
                    payment.payment_id
                ))
            })?;
            if terms.length_days <= 0 {
                return Err(BillingError::InvalidSchedule(format!(
                    "catalog length of {} days for payment {}",
                    terms.length_days, payment.payment_id
                )));
            }
            paid_at + Duration::days(terms.length_days)
        }
    };

    let lead_hours = terms
        .charge_before_hours
        .or(global_charge_before_hours)
        .filter(|hours| *hours != 0);

    let charge_at = match lead_hours {
        None => paid_through,
        Some(_) if payment.subscription_id.is_none() => {
            return Err(BillingError::InvalidSchedule(format!(
                "lead time configured but payment {} has no subscription",
                payment.payment_id
            )));
        }
        Some(hours) => paid_through - Duration::hours(hours),
    };

    if charge_at <= now {
        return Err(BillingError::InvalidSchedule(format!(
            "charge_at {} is not in the future",
            charge_at
        )));
    }

    if let Some(sub) = subscription {
        if charge_at < sub.start_at {
            return Err(BillingError::InvalidSchedule(format!(
                "charge_at {} precedes subscription start {}",
                charge_at, sub.start_at
            )));
        }
    }

    if let Some(paid_at) = payment.paid_at {
        if charge_at < paid_at {
            return Err(BillingError::InvalidSchedule(format!(
                "charge_at {} precedes paid_at {}",
                charge_at, paid_at
            )));
        }
    }

    Ok(charge_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PaymentStatus;
    use chrono::TimeZone;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn paid_payment(paid_at: DateTime<Utc>, subscription_id: Option<Uuid>) -> Payment {
        Payment {
            payment_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            gateway: "card".to_string(),
            status: PaymentStatus::Paid,
            amount: Decimal::new(999, 2),
            paid_at: Some(paid_at),
            subscription_id,
            catalog_item_id: None,
            address_id: None,
            is_recurrent: false,
            parent_payment_id: None,
            note: None,
            error_message: None,
            created_utc: paid_at,
            updated_utc: paid_at,
        }
    }

    fn month_terms(charge_before_hours: Option<i64>) -> CatalogTerms {
        CatalogTerms {
            length_days: 31,
            charge_before_hours,
        }
    }

    #[test]
    fn paid_through_without_lead_time() {
        let payment = paid_payment(at(2024, 1, 1), Some(Uuid::new_v4()));
        let now = at(2024, 1, 2);

        let charge_at = calculate_charge_at(&payment, None, &month_terms(None), None, now).unwrap();
        assert_eq!(charge_at, at(2024, 2, 1));

        let zero = calculate_charge_at(&payment, None, &month_terms(Some(0)), None, now).unwrap();
        assert_eq!(zero, at(2024, 2, 1));
    }

    #[test]
    fn positive_lead_time_charges_earlier() {
        let payment = paid_payment(at(2024, 1, 1), Some(Uuid::new_v4()));
        let now = at(2024, 1, 2);

        let charge_at =
            calculate_charge_at(&payment, None, &month_terms(Some(24)), None, now).unwrap();
        assert_eq!(charge_at, at(2024, 1, 31));
    }

    #[test]
    fn negative_lead_time_charges_later() {
        let payment = paid_payment(at(2024, 1, 1), Some(Uuid::new_v4()));
        let now = at(2024, 1, 2);

        let charge_at =
            calculate_charge_at(&payment, None, &month_terms(None), Some(-48), now).unwrap();
        assert_eq!(charge_at, at(2024, 2, 3));
    }

    #[test]
    fn catalog_lead_time_overrides_global() {
        let payment = paid_payment(at(2024, 1, 1), Some(Uuid::new_v4()));
        let now = at(2024, 1, 2);

        let charge_at =
            calculate_charge_at(&payment, None, &month_terms(Some(24)), Some(72), now).unwrap();
        assert_eq!(charge_at, at(2024, 1, 31));
    }

    #[test]
    fn subscription_end_is_authoritative() {
        let subscription_id = Uuid::new_v4();
        let payment = paid_payment(at(2024, 1, 1), Some(subscription_id));
        let sub = SubscriptionSnapshot {
            subscription_id,
            start_at: at(2024, 1, 1),
            end_at: at(2024, 3, 1),
        };

        let charge_at =
            calculate_charge_at(&payment, Some(&sub), &month_terms(Some(24)), None, at(2024, 1, 2))
                .unwrap();
        assert_eq!(charge_at, at(2024, 2, 29));
    }

    #[test]
    fn lead_time_without_subscription_is_rejected() {
        let payment = paid_payment(at(2024, 1, 1), None);
        let result =
            calculate_charge_at(&payment, None, &month_terms(Some(24)), None, at(2024, 1, 2));
        assert!(matches!(result, Err(BillingError::InvalidSchedule(_))));

        // Without lead time the same payment schedules fine.
        let ok = calculate_charge_at(&payment, None, &month_terms(None), None, at(2024, 1, 2));
        assert_eq!(ok.unwrap(), at(2024, 2, 1));
    }

    #[test]
    fn past_or_present_instant_is_rejected() {
        let payment = paid_payment(at(2024, 1, 1), Some(Uuid::new_v4()));

        let present = calculate_charge_at(&payment, None, &month_terms(None), None, at(2024, 2, 1));
        assert!(matches!(present, Err(BillingError::InvalidSchedule(_))));

        let past = calculate_charge_at(&payment, None, &month_terms(None), None, at(2024, 3, 1));
        assert!(matches!(past, Err(BillingError::InvalidSchedule(_))));
    }

    #[test]
    fn instant_before_subscription_start_is_rejected() {
        let subscription_id = Uuid::new_v4();
        let payment = paid_payment(at(2024, 1, 1), Some(subscription_id));
        let sub = SubscriptionSnapshot {
            subscription_id,
            start_at: at(2024, 2, 10),
            end_at: at(2024, 2, 11),
        };

        let result =
            calculate_charge_at(&payment, Some(&sub), &month_terms(Some(48)), None, at(2024, 1, 2));
        assert!(matches!(result, Err(BillingError::InvalidSchedule(_))));
    }

    #[test]
    fn instant_before_paid_at_is_rejected() {
        let subscription_id = Uuid::new_v4();
        let payment = paid_payment(at(2024, 1, 20), Some(subscription_id));
        let sub = SubscriptionSnapshot {
            subscription_id,
            start_at: at(2024, 1, 1),
            end_at: at(2024, 1, 21),
        };

        let result =
            calculate_charge_at(&payment, Some(&sub), &month_terms(Some(48)), None, at(2024, 1, 2));
        assert!(matches!(result, Err(BillingError::InvalidSchedule(_))));
    }

    #[test]
    fn unpaid_payment_without_subscription_cannot_be_scheduled() {
        let mut payment = paid_payment(at(2024, 1, 1), Some(Uuid::new_v4()));
        payment.paid_at = None;
        payment.status = PaymentStatus::Form;

        let result = calculate_charge_at(&payment, None, &month_terms(None), None, at(2024, 1, 2));
        assert!(matches!(result, Err(BillingError::InvalidSchedule(_))));
    }
}
