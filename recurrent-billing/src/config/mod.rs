//! Configuration module for recurrent-billing.

use chrono::Duration;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct RecurrentConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub storage: StorageBackend,
    pub database: DatabaseConfig,
    pub lock: LockConfig,
    pub redis: RedisConfig,
    pub scheduling: SchedulingConfig,
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBackend {
    Redis,
    Postgres,
    Local,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub backend: LockBackend,
    pub status_timeout: std::time::Duration,
    /// Expiry of a Redis lease if the holder never releases it.
    pub lease_ttl: std::time::Duration,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    /// List that receives payment status messages. Unset keeps them in the
    /// log only.
    pub payment_queue: Option<String>,
}

/// Knobs of the scheduler and orchestrator.
#[derive(Debug, Clone)]
pub struct SchedulingConfig {
    /// Global lead time in hours. Negative values charge later.
    pub charge_before_hours: Option<i64>,
    /// Fast-charge guard window. Zero disables the guard.
    pub fast_charge_threshold: Duration,
    pub default_retries: i32,
    pub lookahead: Duration,
    pub reactivation_window: Duration,
    pub reactivation_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            charge_before_hours: None,
            fast_charge_threshold: Duration::hours(24),
            default_retries: 3,
            lookahead: Duration::minutes(15),
            reactivation_window: Duration::days(14),
            reactivation_delay: Duration::hours(24),
            retry_delay: Duration::hours(24),
        }
    }
}

/// Parse an optional setting. Unset or blank means `None`; a value that
/// does not parse is an error rather than a silent default.
fn parse_setting<T>(key: &str, raw: Option<&str>) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    raw.parse().map(Some).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("Invalid {} '{}': {}", key, raw, e))
    })
}

/// Parse a whole number of units into a duration, rejecting out-of-range
/// values.
fn parse_duration(
    key: &str,
    raw: Option<&str>,
    unit: fn(i64) -> Option<Duration>,
) -> Result<Option<Duration>, AppError> {
    parse_setting::<i64>(key, raw)?
        .map(|value| {
            unit(value).ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("{} is out of range: {}", key, value))
            })
        })
        .transpose()
}

fn env_parse<T>(key: &str) -> Result<Option<T>, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    parse_setting(key, env::var(key).ok().as_deref())
}

fn env_duration(
    key: &str,
    unit: fn(i64) -> Option<Duration>,
) -> Result<Option<Duration>, AppError> {
    parse_duration(key, env::var(key).ok().as_deref(), unit)
}

impl RecurrentConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;
        let defaults = SchedulingConfig::default();

        let storage = match env::var("STORAGE_BACKEND").as_deref() {
            Ok("memory") => StorageBackend::Memory,
            Ok("postgres") | Err(_) => StorageBackend::Postgres,
            Ok(other) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown STORAGE_BACKEND '{}'",
                    other
                )))
            }
        };

        let lock_backend = match env::var("LOCK_BACKEND").as_deref() {
            Ok("redis") => LockBackend::Redis,
            Ok("postgres") => LockBackend::Postgres,
            Ok("local") | Err(_) => LockBackend::Local,
            Ok(other) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown LOCK_BACKEND '{}'",
                    other
                )))
            }
        };

        let database_url = match (storage, env::var("DATABASE_URL")) {
            (_, Ok(url)) => url,
            (StorageBackend::Memory, Err(_)) => String::new(),
            (StorageBackend::Postgres, Err(_)) => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "DATABASE_URL is required"
                )))
            }
        };

        if lock_backend == LockBackend::Postgres && storage != StorageBackend::Postgres {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LOCK_BACKEND=postgres requires STORAGE_BACKEND=postgres"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "recurrent-billing".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            storage,
            database: DatabaseConfig {
                url: database_url,
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?.unwrap_or(10),
                min_connections: env_parse("DATABASE_MIN_CONNECTIONS")?.unwrap_or(2),
            },
            lock: LockConfig {
                backend: lock_backend,
                status_timeout: std::time::Duration::from_secs(
                    env_parse("STATUS_LOCK_TIMEOUT_SECONDS")?.unwrap_or(10),
                ),
                lease_ttl: std::time::Duration::from_secs(
                    env_parse("LOCK_LEASE_TTL_SECONDS")?.unwrap_or(60),
                ),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                payment_queue: env::var("PAYMENT_STATUS_QUEUE").ok(),
            },
            scheduling: SchedulingConfig {
                charge_before_hours: env_parse("CHARGE_BEFORE_HOURS")?,
                fast_charge_threshold: env_duration("FAST_CHARGE_THRESHOLD_HOURS", Duration::try_hours)?
                    .unwrap_or(defaults.fast_charge_threshold),
                default_retries: env_parse("RECURRENT_DEFAULT_RETRIES")?
                    .unwrap_or(defaults.default_retries),
                lookahead: env_duration("CHARGE_LOOKAHEAD_MINUTES", Duration::try_minutes)?
                    .unwrap_or(defaults.lookahead),
                reactivation_window: env_duration("REACTIVATION_WINDOW_DAYS", Duration::try_days)?
                    .unwrap_or(defaults.reactivation_window),
                reactivation_delay: env_duration("REACTIVATION_DELAY_HOURS", Duration::try_hours)?
                    .unwrap_or(defaults.reactivation_delay),
                retry_delay: env_duration("RETRY_DELAY_HOURS", Duration::try_hours)?
                    .unwrap_or(defaults.retry_delay),
            },
            run_migrations: env_parse("RUN_MIGRATIONS")?.unwrap_or(true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn blank_settings_fall_back_to_defaults() {
        assert_eq!(parse_setting::<i32>("RECURRENT_DEFAULT_RETRIES", None).unwrap(), None);
        assert_eq!(
            parse_setting::<i32>("RECURRENT_DEFAULT_RETRIES", Some("  ")).unwrap(),
            None
        );
        assert_eq!(
            parse_setting::<i32>("RECURRENT_DEFAULT_RETRIES", Some(" 5 ")).unwrap(),
            Some(5)
        );
    }

    #[test]
    fn malformed_settings_are_rejected() {
        let result = parse_duration("FAST_CHARGE_THRESHOLD_HOURS", Some("0h"), Duration::try_hours);
        assert!(matches!(result, Err(AppError::ConfigError(_))));

        let result = parse_setting::<bool>("RUN_MIGRATIONS", Some("yes"));
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn zero_threshold_is_kept() {
        let threshold =
            parse_duration("FAST_CHARGE_THRESHOLD_HOURS", Some("0"), Duration::try_hours).unwrap();
        assert_eq!(threshold, Some(Duration::zero()));
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let result = parse_duration(
            "REACTIVATION_WINDOW_DAYS",
            Some(&i64::MAX.to_string()),
            Duration::try_days,
        );
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    #[serial]
    fn from_env_fails_on_malformed_threshold() {
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("FAST_CHARGE_THRESHOLD_HOURS", "0h");

        let result = RecurrentConfig::from_env();

        env::remove_var("FAST_CHARGE_THRESHOLD_HOURS");
        env::remove_var("STORAGE_BACKEND");
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    #[serial]
    fn from_env_reads_zero_threshold() {
        env::set_var("STORAGE_BACKEND", "memory");
        env::set_var("FAST_CHARGE_THRESHOLD_HOURS", "0");

        let result = RecurrentConfig::from_env();

        env::remove_var("FAST_CHARGE_THRESHOLD_HOURS");
        env::remove_var("STORAGE_BACKEND");
        let config = result.unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.scheduling.fast_charge_threshold, Duration::zero());
    }
}
