//! Recursive walk of a collection graph.
//!
//! One call to [`run_collection`] runs, strictly in this order: the `before`
//! chains, the handlers, the post-handlers, the `next` chains. The owner
//! collection goes first in every phase, followed by its nested collections
//! and then the caller-supplied scope. Nothing inside a phase overlaps.

use crate::collection::{HandlersCollection, LinkKind};
use crate::context::ExecutionContext;
use crate::handler::PipelineData;
use crate::interrupter::Interrupter;
use conveyor_core::PipelineResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, trace, warn};

/// Walk `collection` with `data` in `ctx`, merging `scope` into the run
///
/// Returns the context so callers can read loader values out of it.
pub(crate) fn run_collection<D: PipelineData>(
    collection: HandlersCollection<D>,
    data: D,
    ctx: ExecutionContext<D>,
    scope: Vec<HandlersCollection<D>>,
) -> BoxFuture<'static, PipelineResult<ExecutionContext<D>>> {
    async move {
        let interrupter = Interrupter::of(&ctx);
        let mut scoped = collection.nested();
        scoped.extend(scope);
        trace!(collection = %collection.id(), scoped = scoped.len(), "running collection");

        run_chain(&collection, LinkKind::Before, &data, &ctx, &interrupter).await?;
        for stage in &scoped {
            run_chain(stage, LinkKind::Before, &data, &ctx, &interrupter).await?;
        }

        let main = run_handlers(&collection, &scoped, &data, &ctx, &interrupter).await;
        let cleanup = run_post_handlers(&collection, &scoped, &data, &ctx).await;
        if let Err(cleanup_err) = cleanup {
            if let Err(main_err) = &main {
                warn!(
                    collection = %collection.id(),
                    error = %main_err,
                    "handler error superseded by post-handler failure"
                );
            }
            return Err(cleanup_err);
        }
        main?;

        run_chain(&collection, LinkKind::Next, &data, &ctx, &interrupter).await?;
        for stage in &scoped {
            run_chain(stage, LinkKind::Next, &data, &ctx, &interrupter).await?;
        }

        Ok(ctx)
    }
    .boxed()
}

/// Follow every link of `kind` owned by `owner`; an interruption aborts the
/// rest of the phase
async fn run_chain<D: PipelineData>(
    owner: &HandlersCollection<D>,
    kind: LinkKind,
    data: &D,
    ctx: &ExecutionContext<D>,
    interrupter: &Interrupter,
) -> PipelineResult<()> {
    for link in owner.links(kind) {
        if interrupter.is_interrupted() {
            debug!(collection = %owner.id(), ?kind, "interrupted, skipping remaining links");
            break;
        }
        trace!(collection = %owner.id(), target = %link.target(), ?kind, "following link");
        link.run(owner, data.clone(), ctx.clone()).await?;
    }
    Ok(())
}

async fn run_handlers<D: PipelineData>(
    collection: &HandlersCollection<D>,
    scoped: &[HandlersCollection<D>],
    data: &D,
    ctx: &ExecutionContext<D>,
    interrupter: &Interrupter,
) -> PipelineResult<()> {
    for stage in std::iter::once(collection).chain(scoped) {
        for handler in stage.handlers() {
            if interrupter.is_interrupted() {
                debug!(collection = %stage.id(), "interrupted, skipping remaining handlers");
                return Ok(());
            }
            handler.call(data.clone(), ctx.clone()).await?;
        }
    }
    Ok(())
}

/// Post-handlers ignore the interrupter
async fn run_post_handlers<D: PipelineData>(
    collection: &HandlersCollection<D>,
    scoped: &[HandlersCollection<D>],
    data: &D,
    ctx: &ExecutionContext<D>,
) -> PipelineResult<()> {
    for stage in std::iter::once(collection).chain(scoped) {
        for handler in stage.post_handlers() {
            handler.call(data.clone(), ctx.clone()).await?;
        }
    }
    Ok(())
}
