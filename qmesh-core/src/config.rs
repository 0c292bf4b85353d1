//! Kernel tunables. Deserializable so hosts can embed them in their own config files.

use std::time::Duration;

use serde::Deserialize;

/// Per-node kernel settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelConfig {
    /// Queued plus running queries at which new queries are rejected as BUSY (default 2048).
    #[serde(default = "default_max_queries")]
    pub max_queries: usize,
    /// How long a forwarding attempt waits for Accept/Reject before retrying (default 5000 ms).
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    /// How long a traced query may wait for the client's OK (default 30000 ms).
    #[serde(default = "default_hold_timeout_ms")]
    pub hold_timeout_ms: u64,
    /// One-minute load average per CPU at which new queries are rejected as BUSY (default 5.0).
    #[serde(default = "default_max_load_per_cpu")]
    pub max_load_per_cpu: f64,
    /// Sends per forwarding attempt before it is abandoned (default 8).
    #[serde(default = "default_max_forward_attempts")]
    pub max_forward_attempts: u32,
    /// Concurrent message handlers and concurrent query executions (default: available cores).
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_max_queries() -> usize {
    2048
}
fn default_forward_timeout_ms() -> u64 {
    5000
}
fn default_hold_timeout_ms() -> u64 {
    30_000
}
fn default_max_load_per_cpu() -> f64 {
    5.0
}
fn default_max_forward_attempts() -> u32 {
    8
}
fn default_workers() -> usize {
    num_cpus::get().max(1)
}

impl KernelConfig {
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn hold_timeout(&self) -> Duration {
        Duration::from_millis(self.hold_timeout_ms)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_queries: default_max_queries(),
            forward_timeout_ms: default_forward_timeout_ms(),
            hold_timeout_ms: default_hold_timeout_ms(),
            max_load_per_cpu: default_max_load_per_cpu(),
            max_forward_attempts: default_max_forward_attempts(),
            workers: default_workers(),
        }
    }
}
