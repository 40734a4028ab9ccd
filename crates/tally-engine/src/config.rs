//! # Engine Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     TALLY_DB_PATH=/var/lib/tally/tally.db                              │
//! │     TALLY_MAX_CONFLICT_RETRIES=3                                       │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     engine.toml (path passed by the host)                              │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     ./tally.db, 2 conflict retries, 1024 queued usage records          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! # engine.toml
//! [database]
//! path = "/var/lib/tally/tally.db"
//! max_connections = 8
//! busy_timeout_ms = 5000
//!
//! [reservation]
//! transaction_timeout_ms = 2000
//! max_conflict_retries = 2
//! retry_initial_backoff_ms = 25
//!
//! [usage]
//! queue_capacity = 1024
//! max_attempts = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_db::DbConfig;
use tracing::{debug, info, warn};

use crate::assembly::RetryPolicy;
use crate::error::{EngineError, EngineResult};
use crate::usage::UsageRecorderConfig;

// =============================================================================
// Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// SQLite file, or `:memory:`.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// How long a writer waits on the SQLite lock (milliseconds).
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./tally.db")
}
fn default_max_connections() -> u32 {
    5
}
fn default_min_connections() -> u32 {
    1
}
fn default_busy_timeout() -> u64 {
    5_000
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

// =============================================================================
// Reservation Settings
// =============================================================================

/// Transaction limits for the coordinator and order assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSettings {
    /// Upper bound on one ledger transaction, lock waits included.
    #[serde(default = "default_tx_timeout")]
    pub transaction_timeout_ms: u64,

    /// Extra attempts order assembly makes after a transient failure.
    #[serde(default = "default_conflict_retries")]
    pub max_conflict_retries: u32,

    #[serde(default = "default_retry_initial_backoff")]
    pub retry_initial_backoff_ms: u64,

    #[serde(default = "default_retry_max_backoff")]
    pub retry_max_backoff_ms: u64,
}

fn default_tx_timeout() -> u64 {
    10_000
}
fn default_conflict_retries() -> u32 {
    2
}
fn default_retry_initial_backoff() -> u64 {
    25
}
fn default_retry_max_backoff() -> u64 {
    500
}

impl Default for ReservationSettings {
    fn default() -> Self {
        ReservationSettings {
            transaction_timeout_ms: default_tx_timeout(),
            max_conflict_retries: default_conflict_retries(),
            retry_initial_backoff_ms: default_retry_initial_backoff(),
            retry_max_backoff_ms: default_retry_max_backoff(),
        }
    }
}

impl ReservationSettings {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_conflict_retries: self.max_conflict_retries,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
        }
    }
}

// =============================================================================
// Usage Settings
// =============================================================================

/// Offer usage recording queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSettings {
    /// Records held before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Attempts per record before it is logged and dropped.
    #[serde(default = "default_usage_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_usage_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_usage_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_queue_capacity() -> usize {
    1024
}
fn default_usage_attempts() -> u32 {
    5
}
fn default_usage_initial_backoff() -> u64 {
    50
}
fn default_usage_max_backoff() -> u64 {
    2_000
}

impl Default for UsageSettings {
    fn default() -> Self {
        UsageSettings {
            queue_capacity: default_queue_capacity(),
            max_attempts: default_usage_attempts(),
            initial_backoff_ms: default_usage_initial_backoff(),
            max_backoff_ms: default_usage_max_backoff(),
        }
    }
}

// =============================================================================
// Main Engine Configuration
// =============================================================================

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub reservation: ReservationSettings,

    #[serde(default)]
    pub usage: UsageSettings,
}

impl EngineConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file, if given and present
    /// 3. Environment variables
    pub fn load(config_path: Option<&Path>) -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            if path.exists() {
                info!(?path, "Loading engine config from file");
                let contents = std::fs::read_to_string(path)?;
                config = toml::from_str(&contents)?;
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads config or returns default if load fails.
    pub fn load_or_default(config_path: Option<&Path>) -> Self {
        Self::load(config_path).unwrap_or_else(|e| {
            warn!("Failed to load engine config: {}. Using defaults.", e);
            Self::default()
        })
    }

    /// Config for an in-memory database (tests, demos).
    pub fn in_memory() -> Self {
        let mut config = Self::default();
        config.database.path = PathBuf::from(":memory:");
        config.database.max_connections = 1;
        config.database.busy_timeout_ms = 1_000;
        config
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.database.path.as_os_str().is_empty() {
            return Err(EngineError::InvalidConfig(
                "database.path must not be empty".into(),
            ));
        }

        if self.database.max_connections == 0 {
            return Err(EngineError::InvalidConfig(
                "database.max_connections must be greater than 0".into(),
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(EngineError::InvalidConfig(format!(
                "database.min_connections ({}) exceeds max_connections ({})",
                self.database.min_connections, self.database.max_connections
            )));
        }

        if self.reservation.transaction_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "reservation.transaction_timeout_ms must be greater than 0".into(),
            ));
        }

        if self.reservation.retry_initial_backoff_ms > self.reservation.retry_max_backoff_ms {
            return Err(EngineError::InvalidConfig(
                "reservation.retry_initial_backoff_ms exceeds retry_max_backoff_ms".into(),
            ));
        }

        if self.usage.queue_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "usage.queue_capacity must be greater than 0".into(),
            ));
        }

        if self.usage.max_attempts == 0 {
            return Err(EngineError::InvalidConfig(
                "usage.max_attempts must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("TALLY_DB_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }

        if let Ok(max) = std::env::var("TALLY_DB_MAX_CONNECTIONS") {
            match max.parse::<u32>() {
                Ok(n) => self.database.max_connections = n,
                Err(_) => warn!(value = %max, "Ignoring invalid TALLY_DB_MAX_CONNECTIONS"),
            }
        }

        if let Ok(timeout) = std::env::var("TALLY_TX_TIMEOUT_MS") {
            match timeout.parse::<u64>() {
                Ok(ms) => self.reservation.transaction_timeout_ms = ms,
                Err(_) => warn!(value = %timeout, "Ignoring invalid TALLY_TX_TIMEOUT_MS"),
            }
        }

        if let Ok(retries) = std::env::var("TALLY_MAX_CONFLICT_RETRIES") {
            match retries.parse::<u32>() {
                Ok(n) => {
                    debug!(retries = n, "Overriding conflict retries from environment");
                    self.reservation.max_conflict_retries = n;
                }
                Err(_) => warn!(value = %retries, "Ignoring invalid TALLY_MAX_CONFLICT_RETRIES"),
            }
        }

        if let Ok(capacity) = std::env::var("TALLY_USAGE_QUEUE_CAPACITY") {
            match capacity.parse::<usize>() {
                Ok(n) => self.usage.queue_capacity = n,
                Err(_) => warn!(value = %capacity, "Ignoring invalid TALLY_USAGE_QUEUE_CAPACITY"),
            }
        }
    }

    // =========================================================================
    // Conversions
    // =========================================================================

    pub fn to_db_config(&self) -> DbConfig {
        let busy = Duration::from_millis(self.database.busy_timeout_ms);
        let base = if self.database.path.as_os_str() == ":memory:" {
            DbConfig::in_memory()
        } else {
            DbConfig::new(self.database.path.clone())
                .max_connections(self.database.max_connections)
                .min_connections(self.database.min_connections)
        };
        base.busy_timeout(busy)
    }

    pub fn usage_recorder_config(&self) -> UsageRecorderConfig {
        UsageRecorderConfig {
            queue_capacity: self.usage.queue_capacity,
            max_attempts: self.usage.max_attempts,
            initial_backoff: Duration::from_millis(self.usage.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.usage.max_backoff_ms),
        }
    }
}
