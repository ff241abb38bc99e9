//! Demonstration pipeline driven by `conveyor run`.
//!
//! Each job goes through: a `validate` stage linked before the root, the
//! root's own handlers (interrupt check, transform), an audit post-handler
//! and a `notify` stage linked after it on a summary string. Links into
//! `validate` from the root also run an edge-scoped handler.

use conveyor_core::{PipelineError, PipelineResult};
use conveyor_runtime::{
    interrupter, is_interrupted, ContextLoader, ExecutionContext, Executor, ExecutorConfig,
    Handler, HandlersCollection, Loaded, Loader, Telemetry,
};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Unit of work flowing through the demo pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    /// Serialization key
    pub key: u32,
    /// Text processed by the pipeline
    pub payload: String,
}

/// Settings of one `conveyor run`
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Number of concurrent executions
    pub invocations: u32,
    /// Number of distinct job keys
    pub keys: u32,
    /// Serialize executions sharing a key
    pub serialize_same_key: bool,
    /// Interrupt jobs with this key after validation
    pub interrupt_on: Option<u32>,
}

/// How one execution ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Ran to the end
    Completed {
        /// Job key
        key: u32,
    },
    /// Stopped by the interrupter
    Interrupted {
        /// Job key
        key: u32,
    },
    /// Refused by the scheduler
    Rejected {
        /// Job key
        key: u32,
    },
    /// A stage failed
    Failed {
        /// Job key
        key: u32,
        /// Error message
        error: String,
    },
}

/// Result of a whole run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Per-execution outcomes, in submission order
    pub outcomes: Vec<Outcome>,
    /// Scheduler state once every execution settled
    pub telemetry: Telemetry<Job>,
}

static TRACE_IDS: AtomicU64 = AtomicU64::new(1);

/// Tags an invocation tree with a trace id
#[derive(Debug, Clone, Copy)]
pub struct TraceId;

impl<D> ContextLoader<D> for TraceId {
    type Value = u64;

    fn load(&self, _ctx: &ExecutionContext<D>) -> PipelineResult<Loaded<u64>> {
        Ok(Loaded::ready(TRACE_IDS.fetch_add(1, Ordering::Relaxed)))
    }
}

fn trace_id<D>(trace: &Loader<TraceId>, ctx: &ExecutionContext<D>) -> PipelineResult<u64> {
    ctx.get_context(trace)?
        .try_ready()
        .ok()
        .flatten()
        .ok_or_else(|| PipelineError::handler("trace id unavailable"))
}

/// Build the demo executor
pub fn build(config: ExecutorConfig, options: &RunOptions) -> Executor<Job> {
    let executor = if options.serialize_same_key {
        Executor::with_config(config, None, Some(Arc::new(|active: &Job, new: &Job| active.key == new.key)))
    } else {
        Executor::with_config(config, None, None)
    };

    let trace = Loader::new(TraceId);

    let validate = HandlersCollection::<Job>::new();
    let loader = trace.clone();
    validate.add_handler(
        Handler::from_fn(move |job: &Job, ctx| {
            if job.payload.trim().is_empty() {
                return Err(PipelineError::handler(format!("job {} has an empty payload", job.key)));
            }
            debug!(key = job.key, trace = trace_id(&loader, ctx)?, "validated");
            Ok(())
        })
        .named("validate"),
    );
    let loader = trace.clone();
    executor.edge(&validate).add_handler(
        Handler::from_fn(move |job: &Job, ctx| {
            debug!(key = job.key, trace = trace_id(&loader, ctx)?, "validated from root");
            Ok(())
        })
        .named("validate-edge"),
    );

    let notify = HandlersCollection::<String>::new();
    let loader = trace.clone();
    notify.add_handler(
        Handler::from_fn(move |summary: &String, ctx| {
            info!(trace = trace_id(&loader, ctx)?, "{summary}");
            Ok(())
        })
        .named("notify"),
    );

    let interrupt_on = options.interrupt_on;
    executor
        .before(&validate)
        .add_handler(interrupter(move |job: &Job, _| Some(job.key) == interrupt_on))
        .add_handler(
            Handler::new(|job: Job, _| async move {
                tokio::task::yield_now().await;
                debug!(key = job.key, output = %job.payload.to_uppercase(), "transformed");
                Ok(())
            })
            .named("transform"),
        )
        .add_post_handler(
            Handler::from_fn(move |job: &Job, ctx| {
                debug!(
                    key = job.key,
                    trace = trace_id(&trace, ctx)?,
                    interrupted = is_interrupted(ctx),
                    "audited"
                );
                Ok(())
            })
            .named("audit"),
        )
        .next_with(&notify, |job: &Job, _| format!("job {} done: {}", job.key, job.payload));

    executor
}

/// Fire `options.invocations` executions concurrently and collect outcomes
pub async fn run(executor: &Executor<Job>, options: &RunOptions) -> RunReport {
    let keys = options.keys.max(1);
    let jobs: Vec<Job> = (0..options.invocations)
        .map(|i| Job {
            key: i % keys,
            payload: format!("payload #{i}"),
        })
        .collect();

    let pending = jobs
        .iter()
        .map(|job| executor.execute(Some(job.clone()), None, Vec::new()));
    let results = join_all(pending).await;
    executor.wait().await;

    let outcomes = jobs
        .iter()
        .zip(results)
        .map(|(job, result)| match result {
            Ok(ctx) if is_interrupted(&ctx) => Outcome::Interrupted { key: job.key },
            Ok(_) => Outcome::Completed { key: job.key },
            Err(err) if err.is_admission() => Outcome::Rejected { key: job.key },
            Err(err) => Outcome::Failed {
                key: job.key,
                error: err.to_string(),
            },
        })
        .collect();

    RunReport {
        outcomes,
        telemetry: executor.scheduler().telemetry(),
    }
}
