//! Scheduler metrics and telemetry.

use crate::backpressure::AdmissionStatus;
use serde::Serialize;

/// Scheduler metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerMetrics {
    /// Tasks admitted to the queue
    pub admitted: u64,
    /// Tasks rejected by admission control
    pub rejected: u64,
    /// Tasks whose operation succeeded
    pub completed: u64,
    /// Tasks whose operation failed
    pub failed: u64,
    /// Tasks that never settled: their operation panicked or the runtime dropped them
    pub abandoned: u64,
    /// Largest queue length observed
    pub peak_queue_len: usize,
}

impl SchedulerMetrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an admission; `queue_len` includes the new task
    pub fn record_admission(&mut self, queue_len: usize) {
        self.admitted += 1;
        self.peak_queue_len = self.peak_queue_len.max(queue_len);
    }

    /// Record a rejection
    pub fn record_rejection(&mut self) {
        self.rejected += 1;
    }

    /// Record a successful task
    pub fn record_completion(&mut self) {
        self.completed += 1;
    }

    /// Record a failed task
    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// Record an abandoned task
    pub fn record_abandon(&mut self) {
        self.abandoned += 1;
    }

    /// Tasks that settled one way or another
    #[must_use]
    pub fn settled(&self) -> u64 {
        self.completed + self.failed + self.abandoned
    }

    /// Get success rate (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let settled = self.settled();
        if settled == 0 {
            return 1.0;
        }
        self.completed as f64 / settled as f64
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let settled = self.settled();
        if settled == 0 {
            return 0.0;
        }
        self.failed as f64 / settled as f64
    }

    /// Reset metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Point-in-time view of a scheduler
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry<Id> {
    /// Identifiers of queued tasks, oldest first
    pub active: Vec<Id>,
    /// Queue fill ratio
    pub fill_ratio: f64,
    /// Admission status
    pub status: AdmissionStatus,
    /// Metrics snapshot
    pub metrics: SchedulerMetrics,
}

impl<Id> Telemetry<Id> {
    /// Create new telemetry
    #[must_use]
    pub fn new(
        active: Vec<Id>,
        fill_ratio: f64,
        status: AdmissionStatus,
        metrics: SchedulerMetrics,
    ) -> Self {
        Self {
            active,
            fill_ratio,
            status,
            metrics,
        }
    }

    /// Number of queued tasks
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.active.len()
    }
}
