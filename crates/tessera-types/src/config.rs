//! Engine configuration types.
//!
//! `EngineConfig` is the top level of `config.toml`. Every
//! field has a default so an empty or partial file is valid.

use serde::{Deserialize, Serialize};

/// Tunables for the dispatcher, the transaction retry wrapper and the
/// delayed-call poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Attempts per dispatcher operation when storage reports a transient error.
    #[serde(default = "default_transaction_max_attempts")]
    pub transaction_max_attempts: u32,

    /// Back-off between attempts, multiplied by the attempt number.
    #[serde(default = "default_transaction_retry_backoff_ms")]
    pub transaction_retry_backoff_ms: u64,

    /// How often the poller looks for due delayed calls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum delayed calls claimed per poll.
    #[serde(default = "default_delayed_call_batch_size")]
    pub delayed_call_batch_size: u32,

    /// Lease on a claimed delayed call before another poller may take it.
    #[serde(default = "default_delayed_call_lease_secs")]
    pub delayed_call_lease_secs: u64,

    /// Maximum sub-workflow nesting depth.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: u32,
}

fn default_transaction_max_attempts() -> u32 {
    3
}

fn default_transaction_retry_backoff_ms() -> u64 {
    50
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_delayed_call_batch_size() -> u32 {
    50
}

fn default_delayed_call_lease_secs() -> u64 {
    60
}

fn default_max_nesting_depth() -> u32 {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transaction_max_attempts: default_transaction_max_attempts(),
            transaction_retry_backoff_ms: default_transaction_retry_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            delayed_call_batch_size: default_delayed_call_batch_size(),
            delayed_call_lease_secs: default_delayed_call_lease_secs(),
            max_nesting_depth: default_max_nesting_depth(),
        }
    }
}
