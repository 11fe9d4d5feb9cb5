//! Named advisory locks with an acquisition timeout.
//!
//! Three backends share one interface: an in-process lock for single-node
//! deployments and tests, a Redis lock for several workers sharing a cache,
//! and a PostgreSQL session advisory lock when the database is the only
//! shared resource.

use crate::error::BillingError;
use crate::services::metrics::record_lock_wait;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPool;
use sqlx::Postgres;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Proof of a held lock. Hand it back to [`AdvisoryLock::release`].
pub struct LockLease {
    key: String,
    token: String,
    inner: LeaseInner,
}

enum LeaseInner {
    Local(OwnedMutexGuard<()>),
    Redis,
    Postgres(PgSession),
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Block until `key` is held or `timeout` elapses (`LockTimeout`).
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockLease, BillingError>;

    async fn release(&self, lease: LockLease) -> Result<(), BillingError>;
}

/// Run `f` while holding `key`. The lock is released whatever `f` returns.
pub async fn with_lock<T, F, Fut>(
    lock: &dyn AdvisoryLock,
    key: &str,
    timeout: Duration,
    f: F,
) -> Result<T, BillingError>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, BillingError>> + Send,
    T: Send,
{
    let started = Instant::now();
    let lease = lock.acquire(key, timeout).await?;
    record_lock_wait(started.elapsed().as_secs_f64());
    debug!(key = %key, waited_ms = started.elapsed().as_millis() as u64, "Lock acquired");

    let result = f().await;

    if let Err(e) = lock.release(lease).await {
        warn!(key = %key, error = %e, "Failed to release lock");
    }

    result
}

// =========================================================================
// In-process
// =========================================================================

#[derive(Default)]
pub struct LocalLock {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>, BillingError> {
        let mut slots = self.slots.lock().map_err(|_| {
            BillingError::Storage(anyhow::anyhow!("Lock table poisoned").into())
        })?;
        Ok(slots.entry(key.to_string()).or_default().clone())
    }
}

#[async_trait]
impl AdvisoryLock for LocalLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockLease, BillingError> {
        let slot = self.slot(key)?;
        let guard = tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map_err(|_| BillingError::LockTimeout {
                key: key.to_string(),
                waited: timeout,
            })?;

        Ok(LockLease {
            key: key.to_string(),
            token: String::new(),
            inner: LeaseInner::Local(guard),
        })
    }

    async fn release(&self, lease: LockLease) -> Result<(), BillingError> {
        let LockLease { key, inner, .. } = lease;
        drop(inner);

        // Forget the slot once nobody holds or waits on it.
        if let Ok(mut slots) = self.slots.lock() {
            if slots.get(&key).is_some_and(|slot| Arc::strong_count(slot) == 1) {
                slots.remove(&key);
            }
        }
        Ok(())
    }
}

// =========================================================================
// Redis
// =========================================================================

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// `SET NX PX` lock. The lease expires on its own if the holder dies.
#[derive(Clone)]
pub struct RedisLock {
    manager: ConnectionManager,
    lease_ttl: Duration,
}

impl RedisLock {
    pub async fn new(url: &str, lease_ttl: Duration) -> Result<Self, BillingError> {
        tracing::info!("Connecting to Redis for advisory locks");
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            BillingError::from(e)
        })?;
        Ok(Self { manager, lease_ttl })
    }

    fn redis_key(key: &str) -> String {
        format!("lock:{}", key)
    }
}

#[async_trait]
impl AdvisoryLock for RedisLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockLease, BillingError> {
        let mut conn = self.manager.clone();
        let token = Uuid::new_v4().to_string();
        let redis_key = Self::redis_key(key);
        let deadline = Instant::now() + timeout;

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&redis_key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(self.lease_ttl.as_millis() as u64)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                return Ok(LockLease {
                    key: key.to_string(),
                    token,
                    inner: LeaseInner::Redis,
                });
            }

            if Instant::now() >= deadline {
                return Err(BillingError::LockTimeout {
                    key: key.to_string(),
                    waited: timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: LockLease) -> Result<(), BillingError> {
        let mut conn = self.manager.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(Self::redis_key(&lease.key))
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            warn!(key = %lease.key, "Lock lease expired before release");
        }
        Ok(())
    }
}

// =========================================================================
// PostgreSQL
// =========================================================================

/// Session-level `pg_advisory_lock`. The lease pins one pooled connection
/// until release.
#[derive(Clone)]
pub struct PgAdvisoryLock {
    pool: PgPool,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn lock_id(key: &str) -> i64 {
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        i64::from_be_bytes(bytes)
    }
}

/// Pooled connection that may hold session advisory locks.
///
/// Unless handed back with [`PgSession::recycle`] after a clean unlock, the
/// connection is detached from the pool on drop so its session ends and
/// PostgreSQL frees every lock it held.
struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
}

impl PgSession {
    fn new(conn: PoolConnection<Postgres>) -> Self {
        Self { conn: Some(conn) }
    }

    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>, BillingError> {
        self.conn.as_mut().ok_or_else(|| {
            BillingError::Storage(anyhow::anyhow!("Advisory lock session already closed").into())
        })
    }

    /// Return the connection to the pool. Only valid while it holds no lock.
    fn recycle(mut self) {
        drop(self.conn.take());
    }

    /// End the session now instead of waiting for drop.
    async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close().await;
        }
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Advisory lock session dropped while possibly holding a lock, closing it");
            drop(conn.detach());
        }
    }
}

#[async_trait]
impl AdvisoryLock for PgAdvisoryLock {
    async fn acquire(&self, key: &str, timeout: Duration) -> Result<LockLease, BillingError> {
        let lock_id = Self::lock_id(key);
        let deadline = Instant::now() + timeout;
        let timed_out = || BillingError::LockTimeout {
            key: key.to_string(),
            waited: timeout,
        };

        let conn = tokio::time::timeout(timeout, self.pool.acquire())
            .await
            .map_err(|_| timed_out())??;
        let mut session = PgSession::new(conn);

        loop {
            let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                .bind(lock_id)
                .fetch_one(&mut **session.conn()?)
                .await?;

            if acquired {
                return Ok(LockLease {
                    key: key.to_string(),
                    token: lock_id.to_string(),
                    inner: LeaseInner::Postgres(session),
                });
            }

            if Instant::now() >= deadline {
                session.recycle();
                return Err(timed_out());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn release(&self, lease: LockLease) -> Result<(), BillingError> {
        let lock_id = Self::lock_id(&lease.key);
        let LockLease { key, inner, .. } = lease;
        let LeaseInner::Postgres(mut session) = inner else {
            return Err(BillingError::Storage(
                anyhow::anyhow!("Lease for {} was not issued by PostgreSQL", key).into(),
            ));
        };

        let unlocked: Result<(bool,), sqlx::Error> =
            sqlx::query_as("SELECT pg_advisory_unlock($1)")
                .bind(lock_id)
                .fetch_one(&mut **session.conn()?)
                .await;

        match unlocked {
            Ok((true,)) => {
                session.recycle();
                Ok(())
            }
            Ok((false,)) => {
                warn!(key = %key, "Advisory lock was not held at release, closing session");
                session.close().await;
                Ok(())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Advisory unlock failed, closing session");
                session.close().await;
                Err(e.into())
            }
        }
    }
}
