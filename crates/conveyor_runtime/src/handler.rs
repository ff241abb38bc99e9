//! Handler functions run by a pipeline stage.

use crate::context::ExecutionContext;
use conveyor_core::PipelineResult;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Bound satisfied by every value flowing through a pipeline
pub trait PipelineData: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> PipelineData for T {}

type HandlerFn<D> =
    dyn Fn(D, ExecutionContext<D>) -> BoxFuture<'static, PipelineResult<()>> + Send + Sync;

/// A pipeline step invoked for its side effects
///
/// Cloning a handler keeps its identity: [`Handler::ptr_eq`] holds between
/// clones, which is what `remove_handler` matches on.
pub struct Handler<D> {
    name: Option<Arc<str>>,
    func: Arc<HandlerFn<D>>,
}

impl<D> Clone for Handler<D> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            func: Arc::clone(&self.func),
        }
    }
}

impl<D: PipelineData> Handler<D> {
    /// Wrap an asynchronous handler body
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(D, ExecutionContext<D>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PipelineResult<()>> + Send + 'static,
    {
        Self {
            name: None,
            func: Arc::new(move |data, ctx| func(data, ctx).boxed()),
        }
    }

    /// Wrap a synchronous handler body
    pub fn from_fn<F>(func: F) -> Self
    where
        F: Fn(&D, &ExecutionContext<D>) -> PipelineResult<()> + Send + Sync + 'static,
    {
        Self::new(move |data, ctx| future::ready(func(&data, &ctx)))
    }

    /// Attach a name used in logs
    #[must_use]
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<D> Handler<D> {
    /// Handler name, if one was attached
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Check if both values are the same handler
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }

    pub(crate) fn call(&self, data: D, ctx: ExecutionContext<D>) -> BoxFuture<'static, PipelineResult<()>> {
        (self.func)(data, ctx)
    }
}

impl<D> fmt::Debug for Handler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name.as_deref().unwrap_or("<anonymous>"))
            .finish_non_exhaustive()
    }
}
