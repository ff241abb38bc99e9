//! Admission control for the task scheduler.
//!
//! Backpressure is applied by refusing new work, never by making callers
//! wait: a call that finds the queue over its bound fails immediately.

use crate::config::SchedulerConfig;
use serde::{Deserialize, Serialize};

/// Queue pressure as seen by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionStatus {
    /// Plenty of room
    Open,
    /// At or above the saturation threshold, still admitting
    Saturating,
    /// Over the bound; new tasks are rejected
    Full,
}

/// Admission controller
///
/// A task is admitted while the queue holds no more than `queue_limit`
/// entries, so up to `queue_limit + 1` tasks can be in flight at once.
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionController {
    /// Queue bound
    queue_limit: usize,
    /// Saturation threshold (0.0 - 1.0)
    threshold: f64,
}

impl AdmissionController {
    /// Create a new admission controller
    #[must_use]
    pub fn new(queue_limit: usize, threshold: f64) -> Self {
        Self {
            queue_limit,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Create from scheduler configuration
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.queue_limit, config.saturation_threshold)
    }

    /// Check if a task may join a queue currently holding `queued` tasks
    #[must_use]
    pub const fn admits(&self, queued: usize) -> bool {
        queued <= self.queue_limit
    }

    /// Queue fill ratio (0.0 - 1.0)
    #[must_use]
    pub fn fill_ratio(&self, queued: usize) -> f64 {
        if self.queue_limit == 0 {
            return if queued == 0 { 0.0 } else { 1.0 };
        }
        (queued as f64 / self.queue_limit as f64).min(1.0)
    }

    /// Pressure status for a queue holding `queued` tasks
    #[must_use]
    pub fn status(&self, queued: usize) -> AdmissionStatus {
        if !self.admits(queued) {
            AdmissionStatus::Full
        } else if self.queue_limit > 0 && self.fill_ratio(queued) >= self.threshold {
            AdmissionStatus::Saturating
        } else {
            AdmissionStatus::Open
        }
    }

    /// Queue bound
    #[must_use]
    pub const fn queue_limit(&self) -> usize {
        self.queue_limit
    }

    /// Saturation threshold
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Default for AdmissionController {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}
