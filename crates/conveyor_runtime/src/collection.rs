//! Declarative pipeline stages.
//!
//! A [`HandlersCollection`] is a shared handle: clones alias the same stage,
//! so a collection can be linked from several places and still be extended
//! afterwards. Everything registered on it keeps insertion order, and the
//! engine replays that order exactly.

use crate::context::ExecutionContext;
use crate::engine;
use crate::handler::{Handler, PipelineData};
use conveyor_core::{CollectionId, PipelineResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// When a chained stage runs relative to its owner's handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkKind {
    /// Strictly before the owner's handler phase
    Before,
    /// Strictly after the owner's post-handler phase
    Next,
}

type LinkRunner<D> = dyn Fn(&HandlersCollection<D>, D, ExecutionContext<D>) -> BoxFuture<'static, PipelineResult<()>>
    + Send
    + Sync;

/// Edge from one stage to another
///
/// The target's data type is erased; the runner maps the owner's data, builds
/// the chained context and walks the target.
pub(crate) struct ChainLink<D> {
    kind: LinkKind,
    target: CollectionId,
    run: Arc<LinkRunner<D>>,
}

impl<D> Clone for ChainLink<D> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            target: self.target,
            run: Arc::clone(&self.run),
        }
    }
}

impl<D> ChainLink<D> {
    pub(crate) const fn target(&self) -> CollectionId {
        self.target
    }

    pub(crate) fn run(
        &self,
        owner: &HandlersCollection<D>,
        data: D,
        ctx: ExecutionContext<D>,
    ) -> BoxFuture<'static, PipelineResult<()>> {
        (self.run)(owner, data, ctx)
    }
}

struct CollectionState<D> {
    handlers: Vec<Handler<D>>,
    post_handlers: Vec<Handler<D>>,
    links: Vec<ChainLink<D>>,
    nested: Vec<HandlersCollection<D>>,
    /// Edge collections keyed by link target; each value is a
    /// `HandlersCollection<E>` for the target's data type `E`
    edges: IndexMap<CollectionId, Box<dyn Any + Send + Sync>>,
}

impl<D> Default for CollectionState<D> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            post_handlers: Vec::new(),
            links: Vec::new(),
            nested: Vec::new(),
            edges: IndexMap::new(),
        }
    }
}

struct Inner<D> {
    id: CollectionId,
    state: Mutex<CollectionState<D>>,
}

/// A pipeline stage: handlers, post-handlers, chain links, nested and
/// edge-scoped collections
///
/// Chain links hold strong references to their targets; a cycle of links
/// keeps its collections alive and would recurse forever when executed.
pub struct HandlersCollection<D> {
    inner: Arc<Inner<D>>,
}

impl<D> Clone for HandlersCollection<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> fmt::Debug for HandlersCollection<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("HandlersCollection")
            .field("id", &self.inner.id)
            .field("handlers", &state.handlers.len())
            .field("post_handlers", &state.post_handlers.len())
            .field("links", &state.links.len())
            .field("nested", &state.nested.len())
            .field("edges", &state.edges.len())
            .finish()
    }
}

impl<D> Default for HandlersCollection<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> HandlersCollection<D> {
    /// Create an empty collection
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: CollectionId::new(),
                state: Mutex::new(CollectionState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, CollectionState<D>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identity of this collection
    #[must_use]
    pub fn id(&self) -> CollectionId {
        self.inner.id
    }

    /// Check if both handles point at the same collection
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Append a handler
    pub fn add_handler(&self, handler: Handler<D>) -> &Self {
        self.state().handlers.push(handler);
        self
    }

    /// Remove every registration of `handler`; returns whether any was found
    pub fn remove_handler(&self, handler: &Handler<D>) -> bool {
        let mut state = self.state();
        let before = state.handlers.len();
        state.handlers.retain(|h| !h.ptr_eq(handler));
        state.handlers.len() != before
    }

    /// Append a post-handler
    pub fn add_post_handler(&self, handler: Handler<D>) -> &Self {
        self.state().post_handlers.push(handler);
        self
    }

    /// Remove every registration of a post-handler; returns whether any was found
    pub fn remove_post_handler(&self, handler: &Handler<D>) -> bool {
        let mut state = self.state();
        let before = state.post_handlers.len();
        state.post_handlers.retain(|h| !h.ptr_eq(handler));
        state.post_handlers.len() != before
    }

    /// Nest a collection; it joins every run of this one
    pub fn add_collection(&self, collection: &Self) -> &Self {
        self.state().nested.push(collection.clone());
        self
    }

    /// Snapshot of the handlers, in registration order
    #[must_use]
    pub fn handlers(&self) -> Vec<Handler<D>> {
        self.state().handlers.clone()
    }

    /// Snapshot of the post-handlers, in registration order
    #[must_use]
    pub fn post_handlers(&self) -> Vec<Handler<D>> {
        self.state().post_handlers.clone()
    }

    /// Snapshot of the nested collections, in registration order
    #[must_use]
    pub fn nested(&self) -> Vec<Self> {
        self.state().nested.clone()
    }

    /// Number of chain links of `kind`
    #[must_use]
    pub fn link_count(&self, kind: LinkKind) -> usize {
        self.state().links.iter().filter(|l| l.kind == kind).count()
    }

    pub(crate) fn links(&self, kind: LinkKind) -> Vec<ChainLink<D>> {
        self.state()
            .links
            .iter()
            .filter(|l| l.kind == kind)
            .cloned()
            .collect()
    }

    /// Edge-scoped collection for links into `target`, created on first use
    ///
    /// Handlers added here run as extra scope of `target`, and only when
    /// `target` is reached through a link owned by this collection.
    pub fn edge<E: PipelineData>(&self, target: &HandlersCollection<E>) -> HandlersCollection<E> {
        let mut state = self.state();
        let slot = state
            .edges
            .entry(target.id())
            .or_insert_with(|| Box::new(HandlersCollection::<E>::new()));

        if let Some(existing) = slot.downcast_ref::<HandlersCollection<E>>() {
            return existing.clone();
        }
        let fresh = HandlersCollection::<E>::new();
        *slot = Box::new(fresh.clone());
        fresh
    }

    /// Edge-scoped collection for `target`, if one was created
    #[must_use]
    pub fn link_handlers<E: PipelineData>(
        &self,
        target: &HandlersCollection<E>,
    ) -> Option<HandlersCollection<E>> {
        self.state()
            .edges
            .get(&target.id())
            .and_then(|slot| slot.downcast_ref::<HandlersCollection<E>>())
            .cloned()
    }
}

impl<D: PipelineData> HandlersCollection<D> {
    /// Run `target` before this collection's handlers, with the same data
    pub fn before(&self, target: &Self) -> &Self {
        self.link(LinkKind::Before, target, |data: &D, _: &ExecutionContext<D>| data.clone())
    }

    /// Run `target` before this collection's handlers, on mapped data
    pub fn before_with<E, M>(&self, target: &HandlersCollection<E>, map: M) -> &Self
    where
        E: PipelineData,
        M: Fn(&D, &ExecutionContext<D>) -> E + Send + Sync + 'static,
    {
        self.link(LinkKind::Before, target, map)
    }

    /// Run `target` after this collection's post-handlers, with the same data
    pub fn next(&self, target: &Self) -> &Self {
        self.link(LinkKind::Next, target, |data: &D, _: &ExecutionContext<D>| data.clone())
    }

    /// Run `target` after this collection's post-handlers, on mapped data
    pub fn next_with<E, M>(&self, target: &HandlersCollection<E>, map: M) -> &Self
    where
        E: PipelineData,
        M: Fn(&D, &ExecutionContext<D>) -> E + Send + Sync + 'static,
    {
        self.link(LinkKind::Next, target, map)
    }

    fn link<E, M>(&self, kind: LinkKind, target: &HandlersCollection<E>, map: M) -> &Self
    where
        E: PipelineData,
        M: Fn(&D, &ExecutionContext<D>) -> E + Send + Sync + 'static,
    {
        let target = target.clone();
        let target_id = target.id();
        let run = move |owner: &HandlersCollection<D>,
                        data: D,
                        ctx: ExecutionContext<D>|
              -> BoxFuture<'static, PipelineResult<()>> {
            let mapped = map(&data, &ctx);
            let chained = ExecutionContext::chained(mapped.clone(), &ctx);
            let scope: Vec<_> = owner.link_handlers(&target).into_iter().collect();
            engine::run_collection(target.clone(), mapped, chained, scope)
                .map(|result| result.map(|_| ()))
                .boxed()
        };

        self.state().links.push(ChainLink {
            kind,
            target: target_id,
            run: Arc::new(run),
        });
        self
    }
}
