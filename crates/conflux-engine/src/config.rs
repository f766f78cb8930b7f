//! Engine configuration
//!
//! A plain serde-deserializable struct with per-field defaults. Declared
//! values on an activity definition always win over the engine defaults.

use chrono::Duration;
use conflux_core::EngineError;
use serde::{Deserialize, Serialize};

/// Tunable engine defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Lock timeout in seconds for polled tasks without a declared timeout
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: i64,

    /// Retry budget for polled tasks without a declared budget
    #[serde(default = "default_task_retries")]
    pub task_retries: u32,

    /// Whether the history compaction job runs at all
    #[serde(default = "default_compaction_enabled")]
    pub compaction_enabled: bool,

    /// Rows removed per compaction batch
    #[serde(default = "default_compaction_batch_size")]
    pub compaction_batch_size: usize,

    /// Concurrent compaction batch workers
    #[serde(default = "default_compaction_max_jobs")]
    pub compaction_max_jobs: usize,

    /// Seconds between compaction runs
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,

    /// Seconds between timeout sweep runs
    #[serde(default = "default_timeout_sweep_interval_secs")]
    pub timeout_sweep_interval_secs: u64,

    /// Seconds a background-job lease is held before it expires
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: i64,
}

fn default_task_timeout_secs() -> i64 {
    3600
}

fn default_task_retries() -> u32 {
    0
}

fn default_compaction_enabled() -> bool {
    true
}

fn default_compaction_batch_size() -> usize {
    100
}

fn default_compaction_max_jobs() -> usize {
    4
}

fn default_compaction_interval_secs() -> u64 {
    300
}

fn default_timeout_sweep_interval_secs() -> u64 {
    60
}

fn default_lease_duration_secs() -> i64 {
    3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            task_timeout_secs: default_task_timeout_secs(),
            task_retries: default_task_retries(),
            compaction_enabled: default_compaction_enabled(),
            compaction_batch_size: default_compaction_batch_size(),
            compaction_max_jobs: default_compaction_max_jobs(),
            compaction_interval_secs: default_compaction_interval_secs(),
            timeout_sweep_interval_secs: default_timeout_sweep_interval_secs(),
            lease_duration_secs: default_lease_duration_secs(),
        }
    }
}

impl EngineConfig {
    /// Lock timeout for a polled task, declared seconds winning over the default
    pub fn task_timeout(&self, declared_secs: Option<i64>) -> Duration {
        Duration::seconds(declared_secs.unwrap_or(self.task_timeout_secs))
    }

    /// Retry budget for a polled task, declared budget winning over the default
    pub fn task_retries(&self, declared: Option<u32>) -> u32 {
        declared.unwrap_or(self.task_retries)
    }

    /// How long a background-job lease is taken for
    pub fn lease_duration(&self) -> Duration {
        Duration::seconds(self.lease_duration_secs)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.task_timeout_secs <= 0 {
            return Err(EngineError::Configuration(
                "task_timeout_secs must be positive".to_string(),
            ));
        }
        if self.compaction_batch_size == 0 {
            return Err(EngineError::Configuration(
                "compaction_batch_size must be positive".to_string(),
            ));
        }
        if self.compaction_max_jobs == 0 {
            return Err(EngineError::Configuration(
                "compaction_max_jobs must be positive".to_string(),
            ));
        }
        if self.lease_duration_secs <= 0 {
            return Err(EngineError::Configuration(
                "lease_duration_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
