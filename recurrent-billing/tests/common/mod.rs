//! Test helper module for recurrent-billing integration tests.
//!
//! Builds the services over the in-memory store, the in-process lock and a
//! recording event sink, with a scripted gateway standing in for a real
//! processor.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use recurrent_billing::config::{
    DatabaseConfig, LockBackend, LockConfig, RecurrentConfig, RedisConfig, SchedulingConfig,
    StorageBackend,
};
use recurrent_billing::models::{
    Actor, ChargeUpdate, Payment, PaymentStatus, RecurrentCharge, RecurrentChargeState,
    StoredPaymentMethod,
};
use recurrent_billing::services::{
    init_metrics, ChargeOutcome, ChargeResult, ChargeStore, Gateway, GatewayError,
    GatewayRegistry, GatewayResponse, LocalLock, MemoryStore, RecordingEvents,
};
use recurrent_billing::startup::Application;
use rust_decimal::Decimal;
use service_core::config::Config as CoreConfig;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const TEST_GATEWAY: &str = "test";

/// Gateway that replays queued results, then succeeds.
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Result<ChargeOutcome, GatewayError>>>,
    calls: AtomicUsize,
    pub unstoppable: AtomicBool,
    pub user_unstoppable: AtomicBool,
    /// Settle to `authorized` instead of `paid`.
    pub authorizes: AtomicBool,
    delay_ms: AtomicU64,
    expiries: Mutex<HashMap<String, NaiveDate>>,
}

impl ScriptedGateway {
    pub fn push(&self, result: Result<ChargeOutcome, GatewayError>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn push_ok(&self) {
        self.push(Ok(ok_outcome()));
    }

    pub fn push_pending(&self) {
        self.push(Ok(ChargeOutcome {
            result: ChargeResult::Pending,
            response: GatewayResponse::new("CHARGE_PENDING", "3-D Secure required", true),
        }));
    }

    pub fn push_retryable(&self) {
        self.push(Err(GatewayError::Retryable(GatewayResponse::new(
            "INSUFFICIENT_FUNDS",
            "Insufficient funds",
            false,
        ))));
    }

    pub fn push_terminal(&self) {
        self.push(Err(GatewayError::Terminal(GatewayResponse::new(
            "CARD_CLOSED",
            "Card account closed",
            false,
        ))));
    }

    pub fn push_hard(&self) {
        self.push(Err(GatewayError::Hard(GatewayResponse::new(
            "E_WEIRD",
            "Unexpected processor reply",
            false,
        ))));
    }

    pub fn set_expiry(&self, token: &str, date: NaiveDate) {
        self.expiries
            .lock()
            .unwrap()
            .insert(token.to_string(), date);
    }

    /// Make every charge take `delay` before answering.
    pub fn set_delay(&self, delay: std::time::Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub fn ok_outcome() -> ChargeOutcome {
    ChargeOutcome {
        result: ChargeResult::Ok,
        response: GatewayResponse::new("CHARGE_OK", "Approved", true)
            .with_data(serde_json::json!({ "auth_code": "A1B2C3" })),
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    fn id(&self) -> &str {
        TEST_GATEWAY
    }

    fn unstoppable(&self) -> bool {
        self.unstoppable.load(Ordering::SeqCst)
    }

    fn user_unstoppable(&self) -> bool {
        self.user_unstoppable.load(Ordering::SeqCst)
    }

    fn paid_status(&self) -> PaymentStatus {
        if self.authorizes.load(Ordering::SeqCst) {
            PaymentStatus::Authorized
        } else {
            PaymentStatus::Paid
        }
    }

    async fn charge(&self, _payment: &Payment, _token: &str) -> Result<ChargeOutcome, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ok_outcome()))
    }

    fn supports_expiry_check(&self) -> bool {
        true
    }

    async fn check_expire(
        &self,
        tokens: &[String],
    ) -> Result<HashMap<String, NaiveDate>, GatewayError> {
        let known = self.expiries.lock().unwrap();
        Ok(tokens
            .iter()
            .filter_map(|t| known.get(t).map(|d| (t.clone(), *d)))
            .collect())
    }
}

pub fn test_config(scheduling: SchedulingConfig) -> RecurrentConfig {
    RecurrentConfig {
        common: CoreConfig {
            log_level: "warn".to_string(),
            otlp_endpoint: None,
        },
        service_name: "recurrent-billing-test".to_string(),
        service_version: "0.1.0".to_string(),
        storage: StorageBackend::Memory,
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 5,
            min_connections: 1,
        },
        lock: LockConfig {
            backend: LockBackend::Local,
            status_timeout: std::time::Duration::from_secs(10),
            lease_ttl: std::time::Duration::from_secs(60),
        },
        redis: RedisConfig {
            url: "redis://localhost:6379".to_string(),
            payment_queue: None,
        },
        scheduling,
        run_migrations: false,
    }
}

/// Test application wrapper for integration tests.
pub struct TestApp {
    pub app: Application,
    pub store: Arc<MemoryStore>,
    pub lock: Arc<LocalLock>,
    pub events: Arc<RecordingEvents>,
    pub gateway: Arc<ScriptedGateway>,
}

impl TestApp {
    pub fn spawn() -> Self {
        Self::spawn_with(test_config(SchedulingConfig::default()))
    }

    pub fn spawn_with(config: RecurrentConfig) -> Self {
        init_metrics();

        let store = Arc::new(MemoryStore::new());
        let lock = Arc::new(LocalLock::new());
        let events = Arc::new(RecordingEvents::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let gateways = GatewayRegistry::new().with(gateway.clone());

        let app = Application::assemble(
            &config,
            store.clone(),
            lock.clone(),
            events.clone(),
            events.clone(),
            gateways,
        );

        TestApp {
            app,
            store,
            lock,
            events,
            gateway,
        }
    }

    /// A settled one-off purchase that recurrent charges descend from.
    pub fn seed_parent(&self, status: PaymentStatus) -> Payment {
        self.seed_parent_on(TEST_GATEWAY, status)
    }

    pub fn seed_parent_on(&self, gateway: &str, status: PaymentStatus) -> Payment {
        let now = Utc::now();
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            gateway: gateway.to_string(),
            status,
            amount: Decimal::new(1999, 2),
            paid_at: status.is_paid_like().then(|| now - Duration::days(30)),
            subscription_id: Some(Uuid::new_v4()),
            catalog_item_id: Some(Uuid::new_v4()),
            address_id: Some(Uuid::new_v4()),
            is_recurrent: false,
            parent_payment_id: None,
            note: None,
            error_message: None,
            created_utc: now,
            updated_utc: now,
        };
        self.store.insert_payment(payment.clone()).unwrap();
        payment
    }

    pub async fn seed_method(&self, parent: &Payment) -> StoredPaymentMethod {
        self.app
            .registry()
            .register_method(
                parent.user_id,
                &parent.gateway,
                &format!("tok_{}", Uuid::new_v4().simple()),
            )
            .await
            .unwrap()
    }

    /// Parent payment, stored method and an active attempt due at `charge_at`.
    pub async fn seed_attempt(&self, charge_at: DateTime<Utc>, retries: i32) -> RecurrentCharge {
        let parent = self.seed_parent(PaymentStatus::Paid);
        let method = self.seed_method(&parent).await;
        self.app
            .registry()
            .create_attempt(method.method_id, parent.payment_id, charge_at, None, Some(retries))
            .await
            .unwrap()
    }

    /// Force an attempt into `state` the way the system would.
    pub async fn move_to(&self, charge_id: Uuid, state: RecurrentChargeState) -> RecurrentCharge {
        let actor = match state {
            RecurrentChargeState::UserStop => Actor::User,
            RecurrentChargeState::AdminStop => Actor::Admin,
            _ => Actor::System,
        };
        self.app
            .registry()
            .transition(charge_id, state, actor, ChargeUpdate::default())
            .await
            .unwrap()
    }

    /// A historical `charged` attempt on `method_id`.
    pub fn seed_charged_history(
        &self,
        method: &StoredPaymentMethod,
        parent: &Payment,
        charge_at: DateTime<Utc>,
    ) -> RecurrentCharge {
        let now = Utc::now();
        let charge = RecurrentCharge {
            charge_id: Uuid::new_v4(),
            method_id: method.method_id,
            parent_payment_id: parent.payment_id,
            payment_id: None,
            charge_at,
            retries: 3,
            custom_amount: None,
            renewal_catalog_item_id: None,
            state: RecurrentChargeState::Charged,
            status: Some("CHARGE_OK".to_string()),
            note: None,
            external_token: method.external_token.clone(),
            created_utc: now,
            updated_utc: now,
        };
        self.store.put_charge(charge.clone()).unwrap();
        charge
    }

    pub async fn charge(&self, charge_id: Uuid) -> RecurrentCharge {
        self.app.registry().get(charge_id).await.unwrap()
    }

    pub async fn payment(&self, payment_id: Uuid) -> Payment {
        self.store.get_payment(payment_id).await.unwrap().unwrap()
    }
}

/// Assert two instants are within a minute of each other.
pub fn assert_close(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let drift = (actual - expected).num_seconds().abs();
    assert!(
        drift < 60,
        "expected {} to be close to {}, off by {}s",
        actual,
        expected,
        drift
    );
}
