use std::time::Duration;

use serde::Deserialize;

use crate::{reconnect::ReconnectPolicy, retry::RetryConfig};

/// Runtime configuration, loaded from `MISSIVE_*` environment variables.
///
/// Every field has a default, so an empty environment yields a working
/// configuration backed by an in-memory store.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: Option<String>,
    /// Path of the SQLite file the binary uses as its backend stand-in.
    pub backend_path: Option<String>,

    pub max_queue_size: usize,
    pub max_retries: u32,

    pub processing_interval_ms: u64,
    pub sync_interval_ms: u64,
    pub consistency_interval_ms: u64,
    pub cleanup_interval_secs: u64,

    pub ack_timeout_secs: u64,
    pub message_max_age_hours: u64,

    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,

    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,

    pub reconnect_initial_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_factor: f64,
    pub reconnect_max_attempts: u32,
    pub reconnect_jitter: bool,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("MISSIVE_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn backend_path(&self) -> &str {
        self.backend_path.as_deref().unwrap_or("missive-backend.db")
    }

    pub fn processing_interval(&self) -> Duration {
        Duration::from_millis(self.processing_interval_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn consistency_interval(&self) -> Duration {
        Duration::from_millis(self.consistency_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn ack_timeout(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::seconds(self.ack_timeout_secs as i64)
    }

    pub fn message_max_age(&self) -> chrono::TimeDelta {
        chrono::TimeDelta::hours(self.message_max_age_hours as i64)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }

    /// Retry policy for backend writes made during delivery.
    pub fn delivery_retry(&self) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(self.max_retries)
            .initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .build()
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::builder()
            .initial_delay(Duration::from_millis(self.reconnect_initial_delay_ms))
            .max_delay(Duration::from_millis(self.reconnect_max_delay_ms))
            .factor(self.reconnect_factor)
            .max_attempts(self.reconnect_max_attempts)
            .jitter(self.reconnect_jitter)
            .build()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            backend_path: None,
            max_queue_size: 100,
            max_retries: 3,
            processing_interval_ms: 1_000,
            sync_interval_ms: 5_000,
            consistency_interval_ms: 5_000,
            cleanup_interval_secs: 3_600,
            ack_timeout_secs: 300,
            message_max_age_hours: 24,
            retry_initial_delay_ms: 1_000,
            retry_max_delay_ms: 30_000,
            failure_threshold: 5,
            reset_timeout_secs: 60,
            reconnect_initial_delay_ms: 1_000,
            reconnect_max_delay_ms: 30_000,
            reconnect_factor: 2.0,
            reconnect_max_attempts: 10,
            reconnect_jitter: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.ack_timeout(), chrono::TimeDelta::minutes(5));
        assert_eq!(config.message_max_age(), chrono::TimeDelta::hours(24));
        assert_eq!(config.backend_path(), "missive-backend.db");
        assert_eq!(config.delivery_retry(), RetryConfig::database_operation());
    }

    #[test]
    fn partial_environment_keeps_defaults() {
        let vars = vec![
            ("MISSIVE_MAX_QUEUE_SIZE".to_owned(), "5".to_owned()),
            ("MISSIVE_DB_PATH".to_owned(), "/tmp/missive.db".to_owned()),
        ];
        let config: Config = envy::prefixed("MISSIVE_").from_iter(vars).unwrap();
        assert_eq!(config.max_queue_size, 5);
        assert_eq!(config.db_path(), Some("/tmp/missive.db"));
        assert_eq!(config.max_retries, 3);
    }
}
