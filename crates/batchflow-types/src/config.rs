//! Engine configuration types.
//!
//! `EngineConfig` represents `batchflow.toml`, which controls engine-wide
//! timeouts, the event bus size and logging output.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration. All fields have defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a split waits for its flows. Absent means wait indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split_timeout_secs: Option<u64>,

    /// How long `JobOperator::wait_for_completion` waits when the caller gives
    /// no timeout. Absent means wait indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_wait_timeout_secs: Option<u64>,

    /// Transaction timeout applied to chunk transactions unless the step sets
    /// `batchflow.transaction.timeout`.
    #[serde(default = "default_transaction_timeout_secs")]
    pub default_transaction_timeout_secs: u64,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_transaction_timeout_secs() -> u64 {
    180
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            split_timeout_secs: None,
            job_wait_timeout_secs: None,
            default_transaction_timeout_secs: default_transaction_timeout_secs(),
            event_bus_capacity: default_event_bus_capacity(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Log output settings consumed by batchflow-observe.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Bridge spans to OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}
