//! Runtime configuration.
//!
//! All fields have defaults, so an empty JSON object is a valid
//! configuration.

use serde::{Deserialize, Serialize};

/// Default scheduler queue bound
pub const DEFAULT_QUEUE_LIMIT: usize = 100;

/// Default fill ratio at which the queue is reported as saturating
pub const DEFAULT_SATURATION_THRESHOLD: f64 = 0.8;

/// Task scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Queue bound; a call finding more than this many tasks queued is rejected
    pub queue_limit: usize,
    /// Fill ratio reported as saturating (0.0 - 1.0)
    pub saturation_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_limit: DEFAULT_QUEUE_LIMIT,
            saturation_threshold: DEFAULT_SATURATION_THRESHOLD,
        }
    }
}

impl SchedulerConfig {
    /// Set the queue bound
    #[must_use]
    pub fn with_queue_limit(mut self, queue_limit: usize) -> Self {
        self.queue_limit = queue_limit;
        self
    }
}

/// Executor configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Scheduler owned by the executor
    pub scheduler: SchedulerConfig,
}
