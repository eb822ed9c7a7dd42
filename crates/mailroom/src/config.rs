//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `MAILROOM_DB`: Postgres connection string, or `memory` for an in-process store (required)
//! - `MAILROOM_READONLY_DB`: read-only replica for reads (optional)
//! - `MAILROOM_REDIS`: KV store URL (default: redis://localhost:6379/15)
//! - `MAILROOM_ADDRESS`: HTTP listen address (default: 0.0.0.0:8090)
//! - `MAILROOM_DOMAIN`: domain used in IVR callback URLs (default: localhost)
//! - `MAILROOM_AUTH_TOKEN`: token the internal API requires when set
//! - `MAILROOM_LOG_LEVEL`: log filter (default: info)
//! - `MAILROOM_LOG_FORMAT`: `text` or `json` (default: text)
//! - `MAILROOM_SENTRY_DSN`: recorded and logged at startup
//! - `MAILROOM_UUID_SEED`: non-zero makes generated UUIDs deterministic (default: 0)
//! - `MAILROOM_INSTANCE_ID`: name of this instance in cron locks (default: hostname)
//! - `MAILROOM_S3_*`, `MAILROOM_CHANNEL_LOGS_*`: attachment and channel log store credentials
//! - `MAILROOM_WORKERS_REALTIME`, `_BATCH`, `_THROTTLED`: worker pool sizes (default: 32 / 4 / 4)
//! - `MAILROOM_COMMIT_TIMEOUT_SECS`: bulk commit budget (default: 55)
//! - `MAILROOM_CONTACT_LOCK_TTL_SECS`: contact lock TTL (default: 300)

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use mailroom_observability_setup::LogFormat;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379/15";
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:8090";

/// Credentials of an S3-compatible store used by provider adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub bucket: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

impl StoreConfig {
    fn from_lookup(prefix: &str, lookup: &impl Fn(&str) -> Option<String>) -> Self {
        let get = |suffix: &str| lookup(&format!("{prefix}{suffix}")).filter(|v| !v.is_empty());
        Self {
            endpoint: get("ENDPOINT"),
            region: get("REGION"),
            bucket: get("BUCKET"),
            access_key_id: get("ACCESS_KEY_ID"),
            secret_access_key: get("SECRET_ACCESS_KEY"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.bucket.is_some()
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub readonly_db_url: Option<String>,
    pub redis_url: String,

    /// Address the internal HTTP API binds to
    pub address: SocketAddr,

    /// Domain used to build provider callback URLs
    pub domain: String,
    pub auth_token: Option<String>,

    pub log_level: String,
    pub log_format: LogFormat,
    pub sentry_dsn: Option<String>,

    pub uuid_seed: u64,
    pub instance_id: String,

    pub attachments: StoreConfig,
    pub channel_logs: StoreConfig,

    pub workers_realtime: usize,
    pub workers_batch: usize,
    pub workers_throttled: usize,

    /// Budget for a bulk commit, from opening the transaction to committing it
    pub commit_timeout: Duration,

    /// TTL of contact locks; held locks are renewed well before it lapses
    pub contact_lock_ttl: Duration,

    /// Age at which a cached org assets snapshot is reloaded
    pub assets_ttl: Duration,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let db_url = lookup("MAILROOM_DB").context("MAILROOM_DB environment variable is required")?;

        let address = lookup("MAILROOM_ADDRESS").unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let address = SocketAddr::from_str(&address).context("invalid MAILROOM_ADDRESS format")?;

        let log_format = lookup("MAILROOM_LOG_FORMAT").unwrap_or_default();
        let Some(log_format) = LogFormat::parse(&log_format) else {
            bail!("invalid MAILROOM_LOG_FORMAT {log_format:?}, expected text or json");
        };

        let uuid_seed = match lookup("MAILROOM_UUID_SEED") {
            Some(seed) => seed.parse().context("invalid MAILROOM_UUID_SEED")?,
            None => 0,
        };

        let instance_id = lookup("MAILROOM_INSTANCE_ID")
            .or_else(|| lookup("HOSTNAME"))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|s| s.parse().ok())
                .unwrap_or(default)
        };

        Ok(Self {
            db_url,
            readonly_db_url: lookup("MAILROOM_READONLY_DB").filter(|v| !v.is_empty()),
            redis_url: lookup("MAILROOM_REDIS").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            address,
            domain: lookup("MAILROOM_DOMAIN").unwrap_or_else(|| "localhost".to_string()),
            auth_token: lookup("MAILROOM_AUTH_TOKEN").filter(|v| !v.is_empty()),
            log_level: lookup("MAILROOM_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
            sentry_dsn: lookup("MAILROOM_SENTRY_DSN").filter(|v| !v.is_empty()),
            uuid_seed,
            instance_id,
            attachments: StoreConfig::from_lookup("MAILROOM_S3_", &lookup),
            channel_logs: StoreConfig::from_lookup("MAILROOM_CHANNEL_LOGS_", &lookup),
            workers_realtime: number("MAILROOM_WORKERS_REALTIME", 32) as usize,
            workers_batch: number("MAILROOM_WORKERS_BATCH", 4) as usize,
            workers_throttled: number("MAILROOM_WORKERS_THROTTLED", 4) as usize,
            commit_timeout: Duration::from_secs(number("MAILROOM_COMMIT_TIMEOUT_SECS", 55)),
            contact_lock_ttl: Duration::from_secs(number("MAILROOM_CONTACT_LOCK_TTL_SECS", 300)),
            assets_ttl: Duration::from_secs(number("MAILROOM_ASSETS_TTL_SECS", 5)),
        })
    }

    /// Absolute URL on this instance for provider callbacks.
    pub fn callback_url(&self, path: &str) -> String {
        let scheme = if self.domain.starts_with("localhost") {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{}{path}", self.domain)
    }

    /// Configuration for unit tests, backed by the memory store.
    #[cfg(test)]
    pub fn test_config() -> Self {
        Self::from_lookup(|key| match key {
            "MAILROOM_DB" => Some("memory".to_string()),
            "MAILROOM_DOMAIN" => Some("mailroom.test".to_string()),
            "MAILROOM_INSTANCE_ID" => Some("test-instance".to_string()),
            "MAILROOM_CONTACT_LOCK_TTL_SECS" => Some("10".to_string()),
            _ => None,
        })
        .expect("test config is valid")
    }
}
