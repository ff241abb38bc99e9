//! Cooperative cancellation for an invocation tree.
//!
//! The [`Interrupter`] lives in the context cache like any other loader
//! value, so every hop of a tree (nested scopes, chained stages, even stages
//! with a different data type) sees the same flag.

use crate::context::{ContextLoader, ExecutionContext, Loaded, Loader};
use crate::handler::{Handler, PipelineData};
use conveyor_core::PipelineResult;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared cancellation flag
///
/// Once set it stays set for the rest of the tree. Handlers already running
/// are never aborted; the engine checks the flag before starting each handler
/// and chain link.
#[derive(Debug, Clone, Default)]
pub struct Interrupter {
    interrupted: Arc<AtomicBool>,
}

impl Interrupter {
    /// Create a flag that is not interrupted
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The interrupter of the tree `ctx` belongs to, created on first use
    #[must_use]
    pub fn of<D>(ctx: &ExecutionContext<D>) -> Self {
        ctx.memoized(&interrupt_loader(), Self::new)
    }

    /// Check if interruption was requested
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Request interruption
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }
}

/// Loader producing the tree's [`Interrupter`]
///
/// Look it up through [`interrupt_loader`].
#[derive(Debug, Clone, Copy, Default)]
pub struct InterruptLoader;

impl<D> ContextLoader<D> for InterruptLoader {
    type Value = Interrupter;

    fn load(&self, _ctx: &ExecutionContext<D>) -> PipelineResult<Loaded<Interrupter>> {
        Ok(Loaded::ready(Interrupter::new()))
    }
}

/// Handle of the tree's [`InterruptLoader`]
///
/// Every handle returned here addresses the same cache entry, whatever the
/// context's data type.
#[must_use]
pub fn interrupt_loader() -> Loader<InterruptLoader> {
    Loader::singleton(InterruptLoader)
}

/// Check if the tree `ctx` belongs to was interrupted
#[must_use]
pub fn is_interrupted<D>(ctx: &ExecutionContext<D>) -> bool {
    Interrupter::of(ctx).is_interrupted()
}

/// Interrupt the tree `ctx` belongs to
pub fn interrupt<D>(ctx: &ExecutionContext<D>) {
    Interrupter::of(ctx).interrupt();
}

/// Handler that interrupts the tree when `predicate` holds
pub fn interrupter<D, P>(predicate: P) -> Handler<D>
where
    D: PipelineData,
    P: Fn(&D, &ExecutionContext<D>) -> bool + Send + Sync + 'static,
{
    Handler::from_fn(move |data, ctx| {
        if predicate(data, ctx) {
            interrupt(ctx);
        }
        Ok(())
    })
    .named("interrupter")
}

/// Handler that interrupts the tree when the asynchronous `predicate` holds
pub fn interrupter_async<D, P, Fut>(predicate: P) -> Handler<D>
where
    D: PipelineData,
    P: Fn(D, ExecutionContext<D>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PipelineResult<bool>> + Send + 'static,
{
    let predicate = Arc::new(predicate);
    Handler::new(move |data: D, ctx: ExecutionContext<D>| {
        let predicate = Arc::clone(&predicate);
        async move {
            if predicate(data, ctx.clone()).await? {
                interrupt(&ctx);
            }
            Ok(())
        }
    })
    .named("interrupter")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupter_default() {
        let interrupter = Interrupter::new();
        assert!(!interrupter.is_interrupted());
        interrupter.interrupt();
        assert!(interrupter.is_interrupted());
    }

    #[test]
    fn test_interrupter_shared_across_tree() {
        let root = ExecutionContext::new(1u32);
        let hop = ExecutionContext::chained("next".to_string(), &root);

        assert!(!is_interrupted(&hop));
        interrupt(&root);
        assert!(is_interrupted(&hop));
    }

    #[test]
    fn test_interrupter_cached_once() {
        let ctx = ExecutionContext::new(0u32);
        assert!(!ctx.has_context(&interrupt_loader()));

        let first = Interrupter::of(&ctx);
        assert!(ctx.has_context(&interrupt_loader()));

        first.interrupt();
        let through_loader = ctx
            .get_context(&interrupt_loader())
            .unwrap()
            .try_ready()
            .ok()
            .flatten()
            .unwrap();
        assert!(through_loader.is_interrupted());
    }

    #[test]
    fn test_loader_then_of_agree() {
        let ctx = ExecutionContext::new(0u32);
        let via_loader = ctx
            .get_context(&interrupt_loader())
            .unwrap()
            .try_ready()
            .ok()
            .flatten()
            .unwrap();
        via_loader.interrupt();
        assert!(Interrupter::of(&ctx).is_interrupted());
    }

    #[test]
    fn test_interrupt_loader_handles_share_entry() {
        assert!(interrupt_loader().same_as(&interrupt_loader()));

        let root = ExecutionContext::new(0u32);
        let hop = ExecutionContext::chained("label".to_string(), &root);
        Interrupter::of(&hop);
        assert!(root.has_context(&interrupt_loader()));
        assert_eq!(root.cache().len(), 1);
    }

    #[test]
    fn test_separate_trees_independent() {
        let a = ExecutionContext::new(0u32);
        let b = ExecutionContext::new(0u32);
        interrupt(&a);
        assert!(!is_interrupted(&b));
    }

    #[tokio::test]
    async fn test_interrupter_handler() {
        let handler = interrupter(|data: &u32, _| *data > 10);

        let small = ExecutionContext::new(5u32);
        handler.call(5, small.clone()).await.unwrap();
        assert!(!is_interrupted(&small));

        let large = ExecutionContext::new(50u32);
        handler.call(50, large.clone()).await.unwrap();
        assert!(is_interrupted(&large));
    }

    #[tokio::test]
    async fn test_interrupter_async_handler() {
        let handler = interrupter_async(|data: u32, _ctx| async move {
            tokio::task::yield_now().await;
            Ok(data % 2 == 0)
        });

        let ctx = ExecutionContext::new(4u32);
        handler.call(4, ctx.clone()).await.unwrap();
        assert!(is_interrupted(&ctx));
    }
}
