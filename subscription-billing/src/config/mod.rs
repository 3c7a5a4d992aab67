//! Configuration module for subscription-billing.

use service_core::config as core_config;
use service_core::error::AppError;
use service_core::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub store: StoreBackend,
    pub database: Option<DatabaseConfig>,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorSettings,
    pub retry: RetryConfig,
    pub invoice_queue: InvoiceQueueConfig,
    pub vendors: VendorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub batch_size: i64,
}

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub worker_count: usize,
    pub queue_size: usize,
    pub cycle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Storage reads and writes inside a billing cycle.
    pub internal: RetryPolicy,
    /// Vendor sync and payment attempts.
    pub external: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct InvoiceQueueConfig {
    pub backend: QueueBackend,
    pub redis_url: String,
    pub key: String,
    pub worker_count: usize,
}

#[derive(Debug, Clone)]
pub struct VendorConfig {
    pub payment_gateway_url: Option<String>,
    pub vendor_sync_url: Option<String>,
    pub request_timeout: Duration,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let store = match env::var("STORE_BACKEND")
            .unwrap_or_else(|_| "postgres".to_string())
            .as_str()
        {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown STORE_BACKEND '{}', expected postgres or memory",
                    other
                )))
            }
        };

        let database = match store {
            StoreBackend::Postgres => Some(DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2)?,
            }),
            StoreBackend::Memory => None,
        };

        let queue_backend = match env::var("INVOICE_QUEUE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .as_str()
        {
            "redis" => QueueBackend::Redis,
            "memory" => QueueBackend::Memory,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown INVOICE_QUEUE_BACKEND '{}', expected redis or memory",
                    other
                )))
            }
        };

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "subscription-billing".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            store,
            database,
            scheduler: SchedulerConfig {
                enabled: parse_env("SCHEDULER_ENABLED", true)?,
                interval: Duration::from_secs(parse_env("SCHEDULER_INTERVAL_SECS", 3600)?),
                batch_size: parse_env("SCHEDULER_BATCH_SIZE", 100)?,
            },
            executor: ExecutorSettings {
                worker_count: parse_env("EXECUTOR_WORKER_COUNT", 8)?,
                queue_size: parse_env("EXECUTOR_QUEUE_SIZE", 1000)?,
                cycle_timeout: Duration::from_secs(parse_env("CYCLE_TIMEOUT_SECS", 1800)?),
            },
            retry: RetryConfig {
                internal: retry_policy_from_env("RETRY_INTERNAL", RetryPolicy::internal())?,
                external: retry_policy_from_env(
                    "RETRY_EXTERNAL",
                    RetryPolicy::external_vendor(),
                )?,
            },
            invoice_queue: InvoiceQueueConfig {
                backend: queue_backend,
                redis_url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                key: env::var("INVOICE_QUEUE_KEY")
                    .unwrap_or_else(|_| "billing:invoice-events".to_string()),
                worker_count: parse_env("INVOICE_WORKER_COUNT", 4)?,
            },
            vendors: VendorConfig {
                payment_gateway_url: non_empty_env("PAYMENT_GATEWAY_URL"),
                vendor_sync_url: non_empty_env("VENDOR_SYNC_URL"),
                request_timeout: Duration::from_secs(parse_env("VENDOR_TIMEOUT_SECS", 30)?),
            },
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Parse `key` when set; a value that does not parse is a configuration error.
fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("Invalid value '{}' for {}", raw, key))
        }),
        Err(_) => Ok(default),
    }
}

/// Overlay `<PREFIX>_INITIAL_BACKOFF_MS`, `<PREFIX>_MAX_BACKOFF_MS`,
/// `<PREFIX>_MULTIPLIER` and `<PREFIX>_MAX_ATTEMPTS` on `base`.
fn retry_policy_from_env(prefix: &str, base: RetryPolicy) -> Result<RetryPolicy, AppError> {
    let initial_ms = parse_env(
        &format!("{}_INITIAL_BACKOFF_MS", prefix),
        base.initial_backoff.as_millis() as u64,
    )?;
    let max_ms = parse_env(
        &format!("{}_MAX_BACKOFF_MS", prefix),
        base.max_backoff.as_millis() as u64,
    )?;

    Ok(RetryPolicy {
        max_attempts: parse_env(&format!("{}_MAX_ATTEMPTS", prefix), base.max_attempts)?,
        initial_backoff: Duration::from_millis(initial_ms),
        max_backoff: Duration::from_millis(max_ms),
        backoff_multiplier: parse_env(
            &format!("{}_MULTIPLIER", prefix),
            base.backoff_multiplier,
        )?,
        add_jitter: base.add_jitter,
    })
}
