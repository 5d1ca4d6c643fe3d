/// Configuration for the batching and projection pipeline
///
/// Both structs deserialize with defaults for missing fields, so a partial
/// JSON or TOML document is enough. `ViewerConfig::from_env` reads the same
/// settings from `LIVEGRID_*` environment variables.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Events after which a batch is full
pub const DEFAULT_MAX_BATCH_EVENTS: usize = 10 * 1024;
/// Milliseconds after its first event at which a batch is due
pub const DEFAULT_MAX_BATCH_MILLIS: u64 = 100;
pub const DEFAULT_TABLE_ADDRESS: &str = "A1";
pub const DEFAULT_KEY_FIELD: &str = "topicPath";

pub const ENV_TABLE_ADDRESS: &str = "LIVEGRID_TABLE_ADDRESS";
pub const ENV_KEY_FIELD: &str = "LIVEGRID_KEY_FIELD";
pub const ENV_BATCH_EVENTS: &str = "LIVEGRID_BATCH_EVENTS";
pub const ENV_BATCH_MILLIS: &str = "LIVEGRID_BATCH_MILLIS";

/// Thresholds controlling when an `EventBatch` becomes ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_events: usize,
    pub max_wait_ms: u64,
}

impl BatchConfig {
    pub fn new(max_events: usize, max_wait: Duration) -> Self {
        BatchConfig {
            max_events,
            max_wait_ms: max_wait.as_millis() as u64,
        }
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_events == 0 {
            return Err(Error::Config("max_events must be at least 1".to_string()));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_events: DEFAULT_MAX_BATCH_EVENTS,
            max_wait_ms: DEFAULT_MAX_BATCH_MILLIS,
        }
    }
}

/// Settings for a `StreamOrchestrator`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    /// Where the table's header row is created, e.g. `Sheet1!B2`
    pub table_address: String,
    /// Column holding each row's topic path
    pub key_field: String,
    pub batch: BatchConfig,
}

impl ViewerConfig {
    pub fn with_table_address(mut self, address: impl Into<String>) -> Self {
        self.table_address = address.into();
        self
    }

    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Defaults overridden by any `LIVEGRID_*` variables present in the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable name.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ViewerConfig::default();
        if let Some(address) = lookup(ENV_TABLE_ADDRESS) {
            config.table_address = address;
        }
        if let Some(field) = lookup(ENV_KEY_FIELD) {
            config.key_field = field;
        }
        if let Some(events) = lookup(ENV_BATCH_EVENTS) {
            config.batch.max_events = parse_var(ENV_BATCH_EVENTS, &events)?;
        }
        if let Some(millis) = lookup(ENV_BATCH_MILLIS) {
            config.batch.max_wait_ms = parse_var(ENV_BATCH_MILLIS, &millis)?;
        }
        config.batch.validate()?;
        Ok(config)
    }
}

impl Default for ViewerConfig {
    fn default() -> Self {
        ViewerConfig {
            table_address: DEFAULT_TABLE_ADDRESS.to_string(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
            batch: BatchConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a number, got '{}'", name, raw)))
}
