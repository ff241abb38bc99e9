//! Runnable pipeline entry point.
//!
//! An [`Executor`] owns a root [`HandlersCollection`], a [`TaskScheduler`]
//! keyed by input data and an optional default input. Every `execute` call
//! becomes one scheduled task whose identifier is the input value, so the
//! blocking predicate serializes invocations by data.

use crate::collection::HandlersCollection;
use crate::config::ExecutorConfig;
use crate::context::ExecutionContext;
use crate::engine;
use crate::handler::PipelineData;
use crate::scheduler::{BlockingPredicate, TaskScheduler};
use conveyor_core::{PipelineError, PipelineResult};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// Pipeline executor
///
/// Dereferences to its root collection, so handlers and links are registered
/// directly on the executor.
pub struct Executor<D> {
    collection: HandlersCollection<D>,
    scheduler: TaskScheduler<D>,
    default_data: Option<D>,
}

impl<D> fmt::Debug for Executor<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("collection", &self.collection)
            .field("scheduler", &self.scheduler)
            .field("has_default", &self.default_data.is_some())
            .finish()
    }
}

impl<D> Deref for Executor<D> {
    type Target = HandlersCollection<D>;

    fn deref(&self) -> &Self::Target {
        &self.collection
    }
}

impl<D> Default for Executor<D>
where
    D: PipelineData + PartialEq,
{
    fn default() -> Self {
        Self::new(None)
    }
}

impl<D> Executor<D>
where
    D: PipelineData + PartialEq,
{
    /// Create an executor whose invocations never block each other
    #[must_use]
    pub fn new(default_data: Option<D>) -> Self {
        Self::with_config(ExecutorConfig::default(), default_data, None)
    }

    /// Create an executor that serializes conflicting invocations
    ///
    /// `is_blocked(active, new)` receives the input data of a queued
    /// invocation and of the new one.
    #[must_use]
    pub fn with_blocking<F>(default_data: Option<D>, is_blocked: F) -> Self
    where
        F: Fn(&D, &D) -> bool + Send + Sync + 'static,
    {
        Self::with_config(ExecutorConfig::default(), default_data, Some(Arc::new(is_blocked)))
    }

    /// Create an executor from configuration
    #[must_use]
    pub fn with_config(
        config: ExecutorConfig,
        default_data: Option<D>,
        is_blocked: Option<BlockingPredicate<D>>,
    ) -> Self {
        Self {
            collection: HandlersCollection::new(),
            scheduler: TaskScheduler::with_config(config.scheduler, is_blocked),
            default_data,
        }
    }

    /// Run the pipeline once
    ///
    /// `data` falls back to the default input. Without a `context` a fresh
    /// root context is created; passing one reuses its cache and interrupter.
    /// `scope` collections run after the root's nested collections in every
    /// phase.
    ///
    /// Admission happens before this returns; the returned future resolves
    /// to [`PipelineError::QueueLimitReached`] when the scheduler refused the
    /// call, or [`PipelineError::MissingData`] when there is no input. An
    /// admitted invocation runs on the Tokio runtime even if the returned
    /// future is never awaited.
    ///
    /// # Panics
    ///
    /// Panics when an admitted call is made outside a Tokio runtime
    pub fn execute(
        &self,
        data: Option<D>,
        context: Option<ExecutionContext<D>>,
        scope: Vec<HandlersCollection<D>>,
    ) -> BoxFuture<'static, PipelineResult<ExecutionContext<D>>> {
        let Some(data) = data.or_else(|| self.default_data.clone()) else {
            return future::ready(Err(PipelineError::MissingData)).boxed();
        };

        let collection = self.collection.clone();
        let input = data.clone();
        debug!(collection = %collection.id(), scoped = scope.len(), "execute");
        self.scheduler.schedule(data, move || {
            let ctx = context.unwrap_or_else(|| ExecutionContext::new(input.clone()));
            engine::run_collection(collection, input, ctx, scope)
        })
    }

    /// Same as [`Executor::execute`] with the scope before the context
    pub fn execute_scope(
        &self,
        data: Option<D>,
        scope: Vec<HandlersCollection<D>>,
        context: Option<ExecutionContext<D>>,
    ) -> BoxFuture<'static, PipelineResult<ExecutionContext<D>>> {
        self.execute(data, context, scope)
    }

    /// Wait for every invocation in flight right now, awaited or not
    pub async fn wait(&self) {
        self.scheduler.wait().await;
    }

    /// Check if any invocation is in flight
    #[must_use]
    pub fn executing(&self) -> bool {
        self.scheduler.executing()
    }

    /// Input data of invocations in flight, oldest first
    #[must_use]
    pub fn active_list(&self) -> Vec<D> {
        self.scheduler.active_list()
    }
}

impl<D> Executor<D> {
    /// Root collection
    #[must_use]
    pub const fn collection(&self) -> &HandlersCollection<D> {
        &self.collection
    }

    /// Scheduler driving invocations
    #[must_use]
    pub const fn scheduler(&self) -> &TaskScheduler<D> {
        &self.scheduler
    }

    /// Input used when `execute` gets none
    #[must_use]
    pub const fn default_data(&self) -> Option<&D> {
        self.default_data.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::context::{ContextLoader, Loaded, Loader};
    use crate::handler::Handler;
    use crate::interrupter::{interrupter, is_interrupted};
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    fn record<D: PipelineData>(journal: &Journal, entry: impl Into<String>) -> Handler<D> {
        let journal = Arc::clone(journal);
        let entry = entry.into();
        Handler::from_fn(move |_, _| {
            journal.lock().unwrap().push(entry.clone());
            Ok(())
        })
    }

    /// Logs start and end of each call around a yield point
    fn yielding(journal: &Journal) -> Handler<u32> {
        let journal = Arc::clone(journal);
        Handler::new(move |n: u32, _| {
            let journal = Arc::clone(&journal);
            async move {
                journal.lock().unwrap().push(format!("{n}:start"));
                tokio::task::yield_now().await;
                journal.lock().unwrap().push(format!("{n}:end"));
                Ok(())
            }
        })
    }

    struct CountingLoader(Arc<AtomicUsize>);

    impl<D> ContextLoader<D> for CountingLoader {
        type Value = usize;

        fn load(&self, _ctx: &ExecutionContext<D>) -> PipelineResult<Loaded<usize>> {
            Ok(Loaded::ready(self.0.fetch_add(1, Ordering::SeqCst) + 1))
        }
    }

    fn counting() -> Loader<CountingLoader> {
        Loader::new(CountingLoader(Arc::new(AtomicUsize::new(0))))
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn lookup<D: PipelineData>(loader: &Loader<CountingLoader>, seen: &Arc<Mutex<Vec<usize>>>) -> Handler<D> {
        let (loader, seen) = (loader.clone(), Arc::clone(seen));
        Handler::new(move |_, ctx: ExecutionContext<D>| {
            let (loader, seen) = (loader.clone(), Arc::clone(&seen));
            async move {
                if let Some(value) = ctx.resolve(&loader).await? {
                    seen.lock().unwrap().push(value);
                }
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_execute_returns_context() {
        let executor = Executor::<u32>::new(None);
        let journal = Journal::default();
        executor.add_handler(record(&journal, "h"));

        let ctx = executor.execute(Some(3), None, Vec::new()).await.unwrap();
        assert_eq!(*ctx.data(), 3);
        assert_eq!(entries(&journal), vec!["h"]);
        assert!(!executor.executing());
    }

    #[tokio::test]
    async fn test_default_data() {
        let executor = Executor::new(Some(10u32));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        executor.add_handler(Handler::from_fn(move |n: &u32, _| {
            sink.lock().unwrap().push(*n);
            Ok(())
        }));

        executor.execute(None, None, Vec::new()).await.unwrap();
        executor.execute(Some(4), None, Vec::new()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![10, 4]);
        assert_eq!(executor.default_data(), Some(&10));
    }

    #[tokio::test]
    async fn test_missing_data() {
        let executor = Executor::<u32>::new(None);
        let err = executor.execute(None, None, Vec::new()).await.unwrap_err();

        assert!(matches!(err, PipelineError::MissingData));
        assert_eq!(executor.scheduler().metrics().admitted, 0);
    }

    #[tokio::test]
    async fn test_failing_handler_reports_after_post_handlers() {
        let executor = Executor::<u32>::new(None);
        let journal = Journal::default();
        executor
            .add_handler(Handler::from_fn(|_, _| Err(PipelineError::handler("h1 failed"))))
            .add_handler(record(&journal, "h2"))
            .add_post_handler(record(&journal, "p1"));

        let err = executor.execute(Some(1), None, Vec::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "h1 failed");
        assert_eq!(entries(&journal), vec!["p1"]);
        assert!(!executor.executing());
    }

    #[tokio::test]
    async fn test_same_key_runs_sequentially() {
        let executor = Executor::<u32>::with_blocking(None, |active, new| active == new);
        let journal = Journal::default();
        executor.add_handler(yielding(&journal));

        let first = executor.execute(Some(1), None, Vec::new());
        let second = executor.execute(Some(1), None, Vec::new());
        assert_eq!(executor.active_list(), vec![1, 1]);

        let (a, b) = tokio::join!(first, second);
        a.unwrap();
        b.unwrap();
        assert_eq!(entries(&journal), vec!["1:start", "1:end", "1:start", "1:end"]);
    }

    #[tokio::test]
    async fn test_different_keys_interleave() {
        let executor = Executor::<u32>::with_blocking(None, |active, new| active == new);
        let journal = Journal::default();
        executor.add_handler(yielding(&journal));

        let (a, b) = tokio::join!(
            executor.execute(Some(1), None, Vec::new()),
            executor.execute(Some(2), None, Vec::new()),
        );
        a.unwrap();
        b.unwrap();
        let log = entries(&journal);
        assert_eq!(log.len(), 4);
        assert!(log[..2].iter().all(|entry| entry.ends_with(":start")));
    }

    #[tokio::test]
    async fn test_queue_limit() {
        let config = ExecutorConfig {
            scheduler: SchedulerConfig::default().with_queue_limit(1),
        };
        let executor = Executor::<u32>::with_config(config, None, None);

        let first = executor.execute(Some(1), None, Vec::new());
        let second = executor.execute(Some(2), None, Vec::new());
        let err = executor.execute(Some(3), None, Vec::new()).await.unwrap_err();
        assert!(err.is_admission());

        first.await.unwrap();
        second.await.unwrap();
        executor.execute(Some(3), None, Vec::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_scope_matches_execute() {
        let executor = Executor::<u32>::new(None);
        let journal = Journal::default();
        let scope = HandlersCollection::<u32>::new();
        executor.add_handler(record(&journal, "root"));
        scope.add_handler(record(&journal, "scope"));

        executor
            .execute(Some(1), None, vec![scope.clone()])
            .await
            .unwrap();
        executor
            .execute_scope(Some(1), vec![scope], None)
            .await
            .unwrap();
        assert_eq!(entries(&journal), vec!["root", "scope", "root", "scope"]);
    }

    #[tokio::test]
    async fn test_loader_runs_once_per_tree() {
        let executor = Executor::<u32>::new(None);
        let labels = HandlersCollection::<String>::new();
        let loader = counting();
        let seen = Arc::new(Mutex::new(Vec::new()));

        executor
            .add_handler(lookup(&loader, &seen))
            .add_post_handler(lookup(&loader, &seen))
            .next_with(&labels, |n, _| format!("label-{n}"));
        labels.add_handler(lookup(&loader, &seen));

        let ctx = executor.execute(Some(1), None, Vec::new()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 1, 1]);
        assert!(ctx.has_context(&loader));

        // a new invocation gets a new tree
        executor.execute(Some(1), None, Vec::new()).await.unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&2));
    }

    #[tokio::test]
    async fn test_supplied_context_is_reused() {
        let executor = Executor::<u32>::new(None);
        let loader = counting();
        let seen = Arc::new(Mutex::new(Vec::new()));
        executor.add_handler(lookup(&loader, &seen));

        let root = ExecutionContext::new(5u32);
        assert_eq!(root.resolve(&loader).await.unwrap(), Some(1));

        let ctx = executor
            .execute(Some(5), Some(root.clone()), Vec::new())
            .await
            .unwrap();
        assert!(ctx.shares_cache_with(&root));
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_interrupter_stops_remaining_stages() {
        let executor = Executor::<u32>::new(None);
        let journal = Journal::default();
        let notify = HandlersCollection::<u32>::new();
        notify.add_handler(record(&journal, "notify"));

        executor
            .add_handler(interrupter(|n: &u32, _| *n == 0))
            .add_handler(record(&journal, "work"))
            .add_post_handler(record(&journal, "cleanup"))
            .next(&notify);

        let ctx = executor.execute(Some(0), None, Vec::new()).await.unwrap();
        assert!(is_interrupted(&ctx));
        assert_eq!(entries(&journal), vec!["cleanup"]);

        journal.lock().unwrap().clear();
        let ctx = executor.execute(Some(1), None, Vec::new()).await.unwrap();
        assert!(!is_interrupted(&ctx));
        assert_eq!(entries(&journal), vec!["work", "cleanup", "notify"]);
    }

    #[tokio::test]
    async fn test_unawaited_execution_does_not_block_same_key() {
        let executor = Executor::<u32>::with_blocking(None, |active, new| active == new);
        let journal = Journal::default();
        executor.add_handler(yielding(&journal));

        let first = executor.execute(Some(1), None, Vec::new());
        let second = executor.execute(Some(1), None, Vec::new());
        drop(first);

        timeout(Duration::from_secs(2), second)
            .await
            .expect("second invocation waited on one nobody polled")
            .unwrap();
        assert_eq!(entries(&journal), vec!["1:start", "1:end", "1:start", "1:end"]);
        assert!(!executor.executing());
    }

    #[tokio::test]
    async fn test_wait_with_unpolled_execution() {
        let executor = Executor::<u32>::new(None);
        let journal = Journal::default();
        executor.add_handler(yielding(&journal));

        let _pending = executor.execute(Some(4), None, Vec::new());
        timeout(Duration::from_secs(2), executor.wait())
            .await
            .expect("wait hung on an unpolled invocation");
        assert_eq!(entries(&journal), vec!["4:start", "4:end"]);
        assert!(!executor.executing());
    }

    #[tokio::test]
    async fn test_wait_drains_executor() {
        let executor = Arc::new(Executor::<u32>::new(None));
        let journal = Journal::default();
        executor.add_handler(yielding(&journal));

        let runner = Arc::clone(&executor);
        let task = tokio::spawn(async move { runner.execute(Some(8), None, Vec::new()).await });
        while !executor.executing() {
            tokio::task::yield_now().await;
        }

        executor.wait().await;
        assert!(!executor.executing());
        assert_eq!(entries(&journal), vec!["8:start", "8:end"]);
        task.await.unwrap().unwrap();
    }

    proptest! {
        #[test]
        fn prop_registration_order_kept(handlers in 0usize..8, post_handlers in 0usize..8) {
            let executor = Executor::<u32>::new(None);
            let journal = Journal::default();
            for i in 0..handlers {
                executor.add_handler(record(&journal, format!("h{i}")));
            }
            for i in 0..post_handlers {
                executor.add_post_handler(record(&journal, format!("p{i}")));
            }

            block_on(async { executor.execute(Some(1), None, Vec::new()).await }).unwrap();

            let expected: Vec<String> = (0..handlers)
                .map(|i| format!("h{i}"))
                .chain((0..post_handlers).map(|i| format!("p{i}")))
                .collect();
            prop_assert_eq!(entries(&journal), expected);
        }

        #[test]
        fn prop_post_handlers_run_once_after_failure(fail_at in 0usize..5, post_handlers in 1usize..5) {
            let executor = Executor::<u32>::new(None);
            let journal = Journal::default();
            for i in 0..5 {
                if i == fail_at {
                    executor.add_handler(Handler::from_fn(|_, _| Err(PipelineError::handler("fail"))));
                } else {
                    executor.add_handler(record(&journal, format!("h{i}")));
                }
            }
            for i in 0..post_handlers {
                executor.add_post_handler(record(&journal, format!("p{i}")));
            }

            let result = block_on(async { executor.execute(Some(1), None, Vec::new()).await });
            prop_assert!(result.is_err());

            let expected: Vec<String> = (0..fail_at)
                .map(|i| format!("h{i}"))
                .chain((0..post_handlers).map(|i| format!("p{i}")))
                .collect();
            prop_assert_eq!(entries(&journal), expected);
            prop_assert!(!executor.executing());
        }
    }
}
