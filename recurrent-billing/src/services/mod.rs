//! Services module for recurrent-billing.

pub mod database;
pub mod events;
pub mod expiry;
pub mod gateway;
pub mod ledger;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod schedule;
pub mod store;

pub use database::Database;
pub use events::{
    BillingEvent, BroadcastEventSink, EventSink, LogMessageQueue, MessageQueue,
    PaymentStatusMessage, RecordingEvents, RedisMessageQueue, TracingEventSink,
};
pub use expiry::ExpiryRefresher;
pub use gateway::{
    ChargeOutcome, ChargeResult, Gateway, GatewayError, GatewayRegistry, GatewayResponse,
    ManualGateway, MANUAL_GATEWAY_ID,
};
pub use ledger::{PaymentLedger, StatusUpdate};
pub use lock::{with_lock, AdvisoryLock, LocalLock, LockLease, PgAdvisoryLock, RedisLock};
pub use memory::MemoryStore;
pub use metrics::{
    get_metrics, init_metrics, record_charge_outcome, record_error, record_lock_wait, record_run,
    record_status_transition,
};
pub use orchestrator::{AttemptOutcome, AttemptReport, ChargeOrchestrator, RunSummary};
pub use registry::{RecurrentChargeRegistry, IN_FLIGHT_STATUS};
pub use schedule::calculate_charge_at;
pub use store::ChargeStore;
