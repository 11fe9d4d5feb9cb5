//! Payment status transition tests.

mod common;

use chrono::{Duration, Utc};
use common::{test_config, TestApp};
use recurrent_billing::config::SchedulingConfig;
use recurrent_billing::error::BillingError;
use recurrent_billing::models::PaymentStatus;
use recurrent_billing::services::{AdvisoryLock, BillingEvent, PaymentLedger, StatusUpdate};

#[tokio::test]
async fn repeated_update_changes_status_once() {
    let app = TestApp::spawn();
    let payment = app.seed_parent(PaymentStatus::Form);
    let update = StatusUpdate::new(PaymentStatus::Paid).notify(true);

    let first = app.app.ledger().update_status(payment.payment_id, &update).await.unwrap();
    let second = app.app.ledger().update_status(payment.payment_id, &update).await.unwrap();

    assert!(first);
    assert!(!second);
    assert_eq!(
        app.events.payment_events(payment.payment_id),
        vec![BillingEvent::PaymentStatusChanged {
            payment_id: payment.payment_id,
            old_status: PaymentStatus::Form,
            new_status: PaymentStatus::Paid,
            notify_user: true,
        }]
    );
    assert_eq!(app.events.messages().len(), 1);
    assert!(app.events.messages()[0].notify_user);

    let stored = app.payment(payment.payment_id).await;
    assert_eq!(stored.status, PaymentStatus::Paid);
    assert!(stored.paid_at.is_some());
}

#[tokio::test]
async fn settled_payments_never_regress_to_fail() {
    let app = TestApp::spawn();

    for status in [
        PaymentStatus::Paid,
        PaymentStatus::Prepaid,
        PaymentStatus::Authorized,
    ] {
        let payment = app.seed_parent(status);
        let updated = app
            .app
            .ledger()
            .update_status(
                payment.payment_id,
                &StatusUpdate::new(PaymentStatus::Fail).error_message("declined"),
            )
            .await
            .unwrap();

        assert!(!updated, "{} must not move to fail", status);
        let stored = app.payment(payment.payment_id).await;
        assert_eq!(stored.status, status);
        assert_eq!(stored.error_message, None);
        assert!(app.events.payment_events(payment.payment_id).is_empty());
    }
    assert!(app.events.messages().is_empty());
}

#[tokio::test]
async fn paid_at_is_written_once() {
    let app = TestApp::spawn();
    let ledger = app.app.ledger();
    let payment = app.seed_parent(PaymentStatus::Form);
    let first_paid = Utc::now() - Duration::hours(2);

    ledger
        .update_status(
            payment.payment_id,
            &StatusUpdate::new(PaymentStatus::Paid).paid_at(Some(first_paid)),
        )
        .await
        .unwrap();
    ledger
        .update_status(payment.payment_id, &StatusUpdate::new(PaymentStatus::Refund))
        .await
        .unwrap();
    ledger
        .update_status(
            payment.payment_id,
            &StatusUpdate::new(PaymentStatus::Paid).paid_at(Some(Utc::now())),
        )
        .await
        .unwrap();

    let stored = app.payment(payment.payment_id).await;
    assert_eq!(stored.status, PaymentStatus::Paid);
    assert_eq!(stored.paid_at, Some(first_paid));
    assert_eq!(app.events.payment_events(payment.payment_id).len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_collapse_into_one_change() {
    let app = TestApp::spawn();
    let payment = app.seed_parent(PaymentStatus::Form);

    let mut handles = Vec::new();
    for _ in 0..16 {
        let ledger = app.app.ledger().clone();
        let payment_id = payment.payment_id;
        handles.push(tokio::spawn(async move {
            ledger
                .update_status(payment_id, &StatusUpdate::new(PaymentStatus::Paid).notify(true))
                .await
        }));
    }

    let mut applied = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() {
            applied += 1;
        }
    }

    assert_eq!(applied, 1);
    assert_eq!(app.events.payment_events(payment.payment_id).len(), 1);
    assert_eq!(app.events.messages().len(), 1);
}

#[tokio::test]
async fn held_lock_surfaces_as_timeout() {
    let mut config = test_config(SchedulingConfig::default());
    config.lock.status_timeout = std::time::Duration::from_millis(100);
    let app = TestApp::spawn_with(config);
    let payment = app.seed_parent(PaymentStatus::Form);

    let lease = app
        .lock
        .acquire(
            &PaymentLedger::lock_key(payment.payment_id),
            std::time::Duration::from_secs(1),
        )
        .await
        .unwrap();

    let result = app
        .app
        .ledger()
        .update_status(payment.payment_id, &StatusUpdate::new(PaymentStatus::Paid))
        .await;
    assert!(matches!(result, Err(BillingError::LockTimeout { .. })));
    assert_eq!(app.payment(payment.payment_id).await.status, PaymentStatus::Form);

    app.lock.release(lease).await.unwrap();
    let retried = app
        .app
        .ledger()
        .update_status(payment.payment_id, &StatusUpdate::new(PaymentStatus::Paid))
        .await
        .unwrap();
    assert!(retried);
}

#[tokio::test]
async fn unknown_payment_is_not_found() {
    let app = TestApp::spawn();
    let result = app
        .app
        .ledger()
        .update_status(uuid::Uuid::new_v4(), &StatusUpdate::new(PaymentStatus::Paid))
        .await;
    assert!(matches!(result, Err(BillingError::NotFound(_))));
}
