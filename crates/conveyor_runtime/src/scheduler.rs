//! Task scheduler with admission control and conflict serialization.
//!
//! Every scheduled task sits in a FIFO queue while it runs:
//! - Admission is decided when [`TaskScheduler::schedule`] is called.
//! - An admitted task is spawned onto the Tokio runtime right away. It runs
//!   whether or not the returned future is ever awaited, and dropping that
//!   future detaches the task instead of cancelling it.
//! - A task waits for every task queued before it that the blocking predicate
//!   says it conflicts with, then runs its operation.
//! - Failures of the tasks it waited for are logged and never reach it.

use crate::backpressure::AdmissionController;
use crate::config::SchedulerConfig;
use crate::monitor::{SchedulerMetrics, Telemetry};
use conveyor_core::{PipelineError, PipelineResult, TaskSeq};
use futures::future::{self, BoxFuture, Shared};
use futures::FutureExt;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Decides whether a new task must wait for an active one:
/// `is_blocked(active_id, new_id)`
pub type BlockingPredicate<Id> = Arc<dyn Fn(&Id, &Id) -> bool + Send + Sync>;

/// How a queued task settled, as seen by tasks waiting on it
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed(String),
    Abandoned,
}

type Completion = Shared<BoxFuture<'static, TaskOutcome>>;

struct QueuedTask<Id> {
    id: Id,
    seq: TaskSeq,
    completion: Completion,
}

impl<Id: Clone> Clone for QueuedTask<Id> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            seq: self.seq,
            completion: self.completion.clone(),
        }
    }
}

struct SchedulerState<Id> {
    queue: VecDeque<QueuedTask<Id>>,
    metrics: SchedulerMetrics,
}

/// State shared between the scheduler and its running tasks
struct SchedulerCore<Id> {
    state: Mutex<SchedulerState<Id>>,
    admission: AdmissionController,
    is_blocked: Option<BlockingPredicate<Id>>,
}

impl<Id> SchedulerCore<Id> {
    fn state(&self) -> MutexGuard<'_, SchedulerState<Id>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, outcome: &TaskOutcome) {
        let mut state = self.state();
        match outcome {
            TaskOutcome::Completed => state.metrics.record_completion(),
            TaskOutcome::Failed(_) => state.metrics.record_failure(),
            TaskOutcome::Abandoned => state.metrics.record_abandon(),
        }
    }
}

/// Callbacks run around a scheduled operation
///
/// `on_success` or `on_error` runs once the operation settles, then `after`
/// runs in every case. None of them run when admission is refused.
#[derive(Default)]
pub struct TaskHooks {
    after: Option<Box<dyn FnOnce() + Send>>,
    on_success: Option<Box<dyn FnOnce() + Send>>,
    on_error: Option<Box<dyn FnOnce(&PipelineError) + Send>>,
}

impl TaskHooks {
    /// No callbacks
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` once the task settles, whatever the outcome
    #[must_use]
    pub fn after(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.after = Some(Box::new(f));
        self
    }

    /// Run `f` when the operation succeeds
    #[must_use]
    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Run `f` with the error when the operation fails
    #[must_use]
    pub fn on_error(mut self, f: impl FnOnce(&PipelineError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for TaskHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHooks")
            .field("after", &self.after.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Queue membership of one admitted task
///
/// Dropping it removes the first queue entry with the task's id. If the task
/// never settled (its operation panicked, or the runtime dropped it) the
/// drop also counts an abandon.
struct QueueSlot<Id: PartialEq> {
    core: Arc<SchedulerCore<Id>>,
    id: Id,
    settled: bool,
}

impl<Id: PartialEq> QueueSlot<Id> {
    fn release(mut self) {
        self.settled = true;
    }
}

impl<Id: PartialEq> Drop for QueueSlot<Id> {
    fn drop(&mut self) {
        let mut state = self.core.state();
        if let Some(position) = state.queue.iter().position(|task| task.id == self.id) {
            state.queue.remove(position);
        }
        if !self.settled {
            state.metrics.record_abandon();
        }
    }
}

struct Admission<Id: PartialEq> {
    slot: QueueSlot<Id>,
    seq: TaskSeq,
    blockers: Vec<(TaskSeq, Completion)>,
    signal: oneshot::Sender<TaskOutcome>,
}

/// Task scheduler
///
/// Tasks are identified by `Id`. Several tasks may share an id; the queue is
/// cleaned up by removing the first entry with a matching id, which is not
/// necessarily the entry of the task that just finished.
pub struct TaskScheduler<Id> {
    core: Arc<SchedulerCore<Id>>,
}

impl<Id> fmt::Debug for TaskScheduler<Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state();
        f.debug_struct("TaskScheduler")
            .field("queued", &state.queue.len())
            .field("admission", &self.core.admission)
            .field("blocking", &self.core.is_blocked.is_some())
            .finish()
    }
}

impl<Id> Default for TaskScheduler<Id>
where
    Id: Clone + PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Id> TaskScheduler<Id>
where
    Id: Clone + PartialEq + Send + Sync + 'static,
{
    /// Create a scheduler without a blocking predicate
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default(), None)
    }

    /// Create a scheduler that serializes conflicting tasks
    #[must_use]
    pub fn with_blocking<F>(is_blocked: F) -> Self
    where
        F: Fn(&Id, &Id) -> bool + Send + Sync + 'static,
    {
        Self::with_config(SchedulerConfig::default(), Some(Arc::new(is_blocked)))
    }

    /// Create a scheduler from configuration
    #[must_use]
    pub fn with_config(config: SchedulerConfig, is_blocked: Option<BlockingPredicate<Id>>) -> Self {
        Self {
            core: Arc::new(SchedulerCore {
                state: Mutex::new(SchedulerState {
                    queue: VecDeque::new(),
                    metrics: SchedulerMetrics::new(),
                }),
                admission: AdmissionController::from_config(&config),
                is_blocked,
            }),
        }
    }

    /// Schedule `operation` under `id` without callbacks
    ///
    /// See [`TaskScheduler::schedule_with`].
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime
    pub fn schedule<T, F, Fut>(&self, id: Id, operation: F) -> BoxFuture<'static, PipelineResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<T>> + Send + 'static,
    {
        self.schedule_with(id, operation, TaskHooks::new())
    }

    /// Schedule `operation` under `id`
    ///
    /// Admission happens now: if the queue already holds more than
    /// `queue_limit` tasks the returned future resolves to
    /// [`PipelineError::QueueLimitReached`] and nothing is queued. Otherwise
    /// the task is queued and spawned immediately. It waits for conflicting
    /// tasks, then runs `operation`. The returned future yields the result;
    /// it resolves to [`PipelineError::Abandoned`] if the operation panicked.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime
    pub fn schedule_with<T, F, Fut>(
        &self,
        id: Id,
        operation: F,
        hooks: TaskHooks,
    ) -> BoxFuture<'static, PipelineResult<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<T>> + Send + 'static,
    {
        let admission = match self.admit(id) {
            Ok(admission) => admission,
            Err(err) => return future::ready(Err(err)).boxed(),
        };

        let seq = admission.seq;
        let task = tokio::spawn(run_task(admission, operation, hooks));
        async move {
            match task.await {
                Ok(result) => result,
                Err(err) => {
                    error!(task = %seq, error = %err, "scheduled task did not finish");
                    Err(PipelineError::Abandoned)
                }
            }
        }
        .boxed()
    }

    fn admit(&self, id: Id) -> PipelineResult<Admission<Id>> {
        let (signal, receiver) = oneshot::channel();
        let completion = receiver
            .map(|outcome| outcome.unwrap_or(TaskOutcome::Abandoned))
            .boxed()
            .shared();
        let seq = TaskSeq::next();
        let admission = &self.core.admission;

        let snapshot: Vec<QueuedTask<Id>> = {
            let mut state = self.core.state();
            let queued = state.queue.len();
            if !admission.admits(queued) {
                state.metrics.record_rejection();
                let limit = admission.queue_limit();
                warn!(queued, limit, "task rejected: queue limit reached");
                return Err(PipelineError::QueueLimitReached { limit });
            }

            let snapshot = state.queue.iter().cloned().collect();
            state.queue.push_back(QueuedTask {
                id: id.clone(),
                seq,
                completion,
            });
            let queue_len = state.queue.len();
            state.metrics.record_admission(queue_len);
            snapshot
        };
        debug!(task = %seq, ahead = snapshot.len(), "task admitted");

        let blockers = match &self.core.is_blocked {
            Some(is_blocked) => snapshot
                .into_iter()
                .filter(|active| is_blocked(&active.id, &id))
                .map(|active| (active.seq, active.completion))
                .collect(),
            None => Vec::new(),
        };

        Ok(Admission {
            slot: QueueSlot {
                core: Arc::clone(&self.core),
                id,
                settled: false,
            },
            seq,
            blockers,
            signal,
        })
    }

    /// Wait for every task queued right now; their failures are only logged
    pub async fn wait(&self) {
        let pending: Vec<(TaskSeq, Completion)> = self
            .core
            .state()
            .queue
            .iter()
            .map(|task| (task.seq, task.completion.clone()))
            .collect();

        for (seq, completion) in pending {
            log_outcome(seq, completion.await);
        }
    }

    /// Identifiers of queued tasks, oldest first
    #[must_use]
    pub fn active_list(&self) -> Vec<Id> {
        self.core.state().queue.iter().map(|task| task.id.clone()).collect()
    }

    /// Check if any task is queued
    #[must_use]
    pub fn executing(&self) -> bool {
        !self.core.state().queue.is_empty()
    }

    /// Metrics snapshot
    #[must_use]
    pub fn metrics(&self) -> SchedulerMetrics {
        self.core.state().metrics.clone()
    }

    /// Zero the metrics; the peak is recomputed from the tasks still queued
    pub fn reset_metrics(&self) {
        let mut state = self.core.state();
        let queued = state.queue.len();
        state.metrics.reset();
        state.metrics.peak_queue_len = queued;
    }

    /// Admission policy in use
    #[must_use]
    pub fn admission(&self) -> &AdmissionController {
        &self.core.admission
    }

    /// Point-in-time view of queue and metrics
    #[must_use]
    pub fn telemetry(&self) -> Telemetry<Id> {
        let state = self.core.state();
        let queued = state.queue.len();
        Telemetry::new(
            state.queue.iter().map(|task| task.id.clone()).collect(),
            self.core.admission.fill_ratio(queued),
            self.core.admission.status(queued),
            state.metrics.clone(),
        )
    }
}

/// Body of a spawned task
async fn run_task<Id, T, F, Fut>(admission: Admission<Id>, operation: F, hooks: TaskHooks) -> PipelineResult<T>
where
    Id: PartialEq,
    F: FnOnce() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let Admission { slot, seq, blockers, signal } = admission;

    for (blocker, completion) in blockers {
        debug!(task = %seq, blocker = %blocker, "waiting for conflicting task");
        log_outcome(blocker, completion.await);
    }

    debug!(task = %seq, "task started");
    let result = operation().await;

    let core = Arc::clone(&slot.core);
    slot.release();
    let outcome = match &result {
        Ok(_) => TaskOutcome::Completed,
        Err(err) => TaskOutcome::Failed(err.to_string()),
    };
    core.record(&outcome);
    debug!(task = %seq, ?outcome, "task settled");
    // waiters may all be gone
    let _ = signal.send(outcome);

    let TaskHooks { after, on_success, on_error } = hooks;
    match &result {
        Ok(_) => {
            if let Some(on_success) = on_success {
                on_success();
            }
        }
        Err(err) => {
            if let Some(on_error) = on_error {
                on_error(err);
            }
        }
    }
    if let Some(after) = after {
        after();
    }

    result
}

impl TaskOutcome {
    fn into_result(self) -> PipelineResult<()> {
        match self {
            Self::Completed => Ok(()),
            Self::Failed(message) => Err(PipelineError::handler(message)),
            Self::Abandoned => Err(PipelineError::Abandoned),
        }
    }
}

fn log_outcome(seq: TaskSeq, outcome: TaskOutcome) {
    match outcome.into_result() {
        Ok(()) => {}
        Err(PipelineError::Abandoned) => {
            debug!(task = %seq, "awaited task was abandoned");
        }
        Err(err) => {
            error!(task = %seq, error = %err, "awaited task failed");
        }
    }
}
