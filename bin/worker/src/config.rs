//! Worker configuration.
//!
//! Loaded with the `config` crate from an optional `classync.toml` in the
//! working directory, overridden by `CLASSYNC__`-prefixed environment
//! variables (`CLASSYNC__DATABASE_URL`, `CLASSYNC__VAULT__KEY`,
//! `CLASSYNC__WORKER__CONCURRENCY`, ...). Provider endpoints are lists and
//! are easiest to give in the file.

use classync_scheduler::ConsumerSettings;
use rootcause::prelude::Report;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// Base name of the optional configuration file.
pub const CONFIG_FILE: &str = "classync";

/// Worker configuration.
#[derive(Debug, Deserialize)]
pub struct WorkerConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// NATS server URL. Without it the worker runs with background sync
    /// disabled.
    #[serde(default)]
    pub nats_url: Option<String>,

    pub vault: VaultConfig,

    #[serde(default)]
    pub worker: WorkerSettings,

    /// Provider scrapers to register.
    #[serde(default)]
    pub providers: Vec<ProviderEndpoint>,
}

/// Credential vault configuration.
#[derive(Clone, Deserialize)]
pub struct VaultConfig {
    /// The 32-byte key, taken as its UTF-8 bytes.
    pub key: String,
}

impl fmt::Debug for VaultConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultConfig")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Job processing settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkerSettings {
    /// Jobs processed at the same time.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Bound on a single provider fetch, in seconds.
    #[serde(default = "default_fetch_timeout_seconds")]
    pub fetch_timeout_seconds: u64,

    /// How often the recurring table is checked for due jobs, in seconds.
    #[serde(default = "default_tick_interval_seconds")]
    pub tick_interval_seconds: u64,

    /// Deliveries of a job before it is dropped.
    #[serde(default = "default_max_deliver")]
    pub max_deliver: u32,

    /// First retry delay, doubled on each further attempt, in seconds.
    #[serde(default = "default_retry_base_seconds")]
    pub retry_base_seconds: u64,

    /// Time a delivery may stay unacknowledged before the broker redelivers it.
    #[serde(default = "default_ack_wait_seconds")]
    pub ack_wait_seconds: u64,

    /// How long a run waits for its schedule's sync lock, in seconds.
    #[serde(default = "default_lock_wait_seconds")]
    pub lock_wait_seconds: u64,

    /// Age after which an unreleased lock lapses, in seconds.
    #[serde(default = "default_lock_ttl_seconds")]
    pub lock_ttl_seconds: u64,
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_concurrency() -> usize {
    4
}

fn default_fetch_timeout_seconds() -> u64 {
    60
}

fn default_tick_interval_seconds() -> u64 {
    30
}

fn default_max_deliver() -> u32 {
    5
}

fn default_retry_base_seconds() -> u64 {
    30
}

fn default_ack_wait_seconds() -> u64 {
    300
}

fn default_lock_wait_seconds() -> u64 {
    120
}

fn default_lock_ttl_seconds() -> u64 {
    600
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            fetch_timeout_seconds: default_fetch_timeout_seconds(),
            tick_interval_seconds: default_tick_interval_seconds(),
            max_deliver: default_max_deliver(),
            retry_base_seconds: default_retry_base_seconds(),
            ack_wait_seconds: default_ack_wait_seconds(),
            lock_wait_seconds: default_lock_wait_seconds(),
            lock_ttl_seconds: default_lock_ttl_seconds(),
        }
    }
}

impl WorkerSettings {
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds)
    }

    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_seconds.max(1))
    }

    #[must_use]
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_seconds)
    }

    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_seconds)
    }

    /// Settings for the broker's job consumer.
    #[must_use]
    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            concurrency: self.concurrency.max(1),
            max_deliver: self.max_deliver.max(1),
            ack_wait: Duration::from_secs(self.ack_wait_seconds),
            retry_base: Duration::from_secs(self.retry_base_seconds),
        }
    }
}

/// A provider scraper reachable over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderEndpoint {
    /// Registry key stored on schedules.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Base URL of the scraper service.
    pub base_url: String,
}

impl WorkerConfig {
    /// Loads configuration from `classync.toml`, if present, and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, Report<config::ConfigError>> {
        Self::from_builder(
            config::Config::builder()
                .add_source(config::File::with_name(CONFIG_FILE).required(false))
                .add_source(
                    config::Environment::with_prefix("CLASSYNC")
                        .prefix_separator("__")
                        .separator("__")
                        .try_parsing(true),
                ),
        )
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, Report<config::ConfigError>> {
        Ok(builder.build()?.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StartupError;

    fn parse(toml: &str) -> Result<WorkerConfig, Report<config::ConfigError>> {
        WorkerConfig::from_builder(
            config::Config::builder()
                .add_source(config::File::from_str(toml, config::FileFormat::Toml)),
        )
    }

    #[test]
    fn worker_settings_have_correct_defaults() {
        let settings = WorkerSettings::default();
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.fetch_timeout(), Duration::from_secs(60));
        assert_eq!(settings.max_deliver, 5);
        assert_eq!(settings.tick_interval(), Duration::from_secs(30));
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let config = parse(
            r#"
            database_url = "postgres://localhost/classync"
            [vault]
            key = "0123456789abcdef0123456789abcdef"
            "#,
        )
        .unwrap();

        assert_eq!(config.database_max_connections, 5);
        assert!(config.nats_url.is_none());
        assert!(config.providers.is_empty());
        assert_eq!(config.worker, WorkerSettings::default());
    }

    #[test]
    fn full_config_parses() {
        let config = parse(
            r#"
            database_url = "postgres://localhost/classync"
            nats_url = "nats://localhost:4222"
            [vault]
            key = "0123456789abcdef0123456789abcdef"
            [worker]
            concurrency = 8
            retry_base_seconds = 5
            [[providers]]
            id = "pronote"
            name = "Pronote"
            base_url = "http://scrapers:8080/pronote"
            "#,
        )
        .unwrap();

        assert_eq!(config.nats_url.as_deref(), Some("nats://localhost:4222"));
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.max_deliver, 5);
        assert_eq!(
            config.providers,
            vec![ProviderEndpoint {
                id: "pronote".to_string(),
                name: "Pronote".to_string(),
                base_url: "http://scrapers:8080/pronote".to_string(),
            }]
        );

        let consumer = config.worker.consumer_settings();
        assert_eq!(consumer.concurrency, 8);
        assert_eq!(consumer.retry_base, Duration::from_secs(5));
    }

    #[test]
    fn missing_vault_key_is_an_error() {
        assert!(parse(r#"database_url = "postgres://localhost/classync""#).is_err());
    }

    #[test]
    fn load_failure_is_a_config_startup_error() {
        let err = StartupError::from(
            parse(r#"database_url = "postgres://localhost/classync""#).unwrap_err(),
        );
        assert!(matches!(err, StartupError::Config { .. }));
        assert!(err.to_string().starts_with("invalid configuration: "));
    }

    #[test]
    fn vault_key_is_redacted() {
        let vault = VaultConfig {
            key: "super-secret-key".to_string(),
        };
        assert!(!format!("{vault:?}").contains("super-secret"));
    }
}
