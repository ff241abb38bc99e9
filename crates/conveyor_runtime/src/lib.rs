//! CONVEYOR Runtime
//!
//! Declarative handler pipelines executed over a memoizing per-invocation
//! context. Invocations go through a task scheduler that bounds the queue
//! and serializes conflicting work; a shared interrupter lets any step stop
//! the rest of an invocation tree.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backpressure;
pub mod collection;
pub mod config;
pub mod context;
mod engine;
pub mod executor;
pub mod handler;
pub mod interrupter;
pub mod monitor;
pub mod scheduler;

pub use backpressure::{AdmissionController, AdmissionStatus};
pub use collection::{HandlersCollection, LinkKind};
pub use config::{ExecutorConfig, SchedulerConfig};
pub use context::{ContextCache, ContextLoader, ExecutionContext, Loaded, Loader, Lookup, SharedCache};
pub use executor::Executor;
pub use handler::{Handler, PipelineData};
pub use interrupter::{
    interrupt, interrupt_loader, interrupter, interrupter_async, is_interrupted, InterruptLoader,
    Interrupter,
};
pub use monitor::{SchedulerMetrics, Telemetry};
pub use scheduler::{BlockingPredicate, TaskHooks, TaskScheduler};

pub use conveyor_core::{PipelineError, PipelineResult};
