//! Wires storage, locks, events and gateways into the charge services.

use crate::config::{LockBackend, RecurrentConfig, StorageBackend};
use crate::error::BillingError;
use crate::services::{
    AdvisoryLock, ChargeOrchestrator, ChargeStore, Database, EventSink, ExpiryRefresher,
    GatewayRegistry, LocalLock, LogMessageQueue, MemoryStore, MessageQueue, PaymentLedger,
    PgAdvisoryLock, RecurrentChargeRegistry, RedisLock, RedisMessageQueue, RunSummary,
    TracingEventSink,
};
use std::sync::Arc;
use uuid::Uuid;

pub struct Application {
    store: Arc<dyn ChargeStore>,
    registry: Arc<RecurrentChargeRegistry>,
    ledger: Arc<PaymentLedger>,
    orchestrator: ChargeOrchestrator,
    expiry: ExpiryRefresher,
}

impl Application {
    /// Connect to the configured backends and build the services.
    pub async fn build(
        config: RecurrentConfig,
        gateways: GatewayRegistry,
    ) -> Result<Self, BillingError> {
        let (store, database): (Arc<dyn ChargeStore>, Option<Database>) = match config.storage {
            StorageBackend::Postgres => {
                let db = Database::new(
                    &config.database.url,
                    config.database.max_connections,
                    config.database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    e
                })?;

                if config.run_migrations {
                    db.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        e
                    })?;
                }
                (Arc::new(db.clone()), Some(db))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage, state is lost on exit");
                (Arc::new(MemoryStore::new()), None)
            }
        };

        let lock: Arc<dyn AdvisoryLock> = match (config.lock.backend, &database) {
            (LockBackend::Redis, _) => {
                Arc::new(RedisLock::new(&config.redis.url, config.lock.lease_ttl).await?)
            }
            (LockBackend::Postgres, Some(db)) => Arc::new(PgAdvisoryLock::new(db.pool().clone())),
            (LockBackend::Postgres, None) => {
                return Err(BillingError::Storage(service_core::error::AppError::ConfigError(
                    anyhow::anyhow!("PostgreSQL locks need PostgreSQL storage"),
                )))
            }
            (LockBackend::Local, _) => Arc::new(LocalLock::new()),
        };

        let queue: Arc<dyn MessageQueue> = match &config.redis.payment_queue {
            Some(queue) => Arc::new(
                RedisMessageQueue::new(&config.redis.url, queue.clone())
                    .await
                    .map_err(|e| BillingError::Storage(e.into()))?,
            ),
            None => Arc::new(LogMessageQueue),
        };

        Ok(Self::assemble(
            &config,
            store,
            lock,
            Arc::new(TracingEventSink),
            queue,
            gateways,
        ))
    }

    /// Build the services over already constructed backends.
    pub fn assemble(
        config: &RecurrentConfig,
        store: Arc<dyn ChargeStore>,
        lock: Arc<dyn AdvisoryLock>,
        events: Arc<dyn EventSink>,
        queue: Arc<dyn MessageQueue>,
        gateways: GatewayRegistry,
    ) -> Self {
        let gateways = Arc::new(gateways);
        let ledger = Arc::new(PaymentLedger::new(
            store.clone(),
            lock.clone(),
            events.clone(),
            queue,
            config.lock.status_timeout,
        ));
        let registry = Arc::new(RecurrentChargeRegistry::new(
            store.clone(),
            lock,
            events,
            gateways.clone(),
            config.scheduling.clone(),
            config.lock.status_timeout,
        ));
        let orchestrator = ChargeOrchestrator::new(
            registry.clone(),
            ledger.clone(),
            store.clone(),
            gateways.clone(),
        );
        let expiry = ExpiryRefresher::new(store.clone(), gateways);

        Self {
            store,
            registry,
            ledger,
            orchestrator,
            expiry,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChargeStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RecurrentChargeRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<PaymentLedger> {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &ChargeOrchestrator {
        &self.orchestrator
    }

    pub fn expiry(&self) -> &ExpiryRefresher {
        &self.expiry
    }

    /// One batch run. Storage is checked first so an unreachable database
    /// fails fast.
    pub async fn run_once(&self, ids: Option<&[Uuid]>) -> Result<RunSummary, BillingError> {
        self.store.health_check().await?;
        self.orchestrator.run(ids).await
    }
}
