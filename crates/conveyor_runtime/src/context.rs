//! Per-invocation execution context.
//!
//! An [`ExecutionContext`] pairs the data value of one hop with a cache of
//! loader results. The cache is shared by every context derived from the same
//! root, so a loader runs at most once per invocation tree no matter how many
//! chain links or nested scopes ask for it.
//!
//! Loaders are looked up through a [`Loader`] handle. Each handle created
//! with [`Loader::new`] is its own cache entry; clones of a handle share it.

use conveyor_core::PipelineResult;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::{Future, IntoFuture};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type CachedValue = Arc<dyn Any + Send + Sync>;

/// Cache slot of a loader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CacheKey {
    /// One [`Loader::new`] allocation
    Instance(usize),
    /// Every handle of a loader type; used for tree-wide singletons
    Singleton(TypeId),
}

#[derive(Debug)]
struct CacheEntry {
    value: CachedValue,
    /// Keeps the loader allocation alive so its address is not reused as a
    /// key while the entry exists
    _owner: CachedValue,
}

/// Loader result cache shared across an invocation tree
///
/// Values are the last non-empty result of each loader.
#[derive(Debug, Default)]
pub struct ContextCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

/// Shared handle to a [`ContextCache`]
pub type SharedCache = Arc<ContextCache>;

impl ContextCache {
    /// Create an empty cache behind a shared handle
    #[must_use]
    pub fn shared() -> SharedCache {
        Arc::new(Self::default())
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of cached loader results
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Check if nothing is cached yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    fn contains(&self, key: CacheKey) -> bool {
        self.entries().contains_key(&key)
    }

    fn get<T: Clone + 'static>(&self, key: CacheKey) -> Option<T> {
        self.entries()
            .get(&key)
            .and_then(|entry| entry.value.downcast_ref::<T>())
            .cloned()
    }

    fn insert<T: Send + Sync + 'static>(&self, key: CacheKey, owner: CachedValue, value: T) {
        self.entries().insert(
            key,
            CacheEntry {
                value: Arc::new(value),
                _owner: owner,
            },
        );
    }

    fn get_or_insert_with<T, F>(&self, key: CacheKey, owner: CachedValue, init: F) -> T
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let mut entries = self.entries();
        if let Some(value) = entries.get(&key).and_then(|e| e.value.downcast_ref::<T>()) {
            return value.clone();
        }
        let value = init();
        entries.insert(
            key,
            CacheEntry {
                value: Arc::new(value.clone()),
                _owner: owner,
            },
        );
        value
    }
}

/// Output of a loader: available now, or after an await
pub enum Loaded<T> {
    /// Value computed synchronously; `None` is never cached
    Ready(Option<T>),
    /// Value still being computed
    Pending(BoxFuture<'static, PipelineResult<Option<T>>>),
}

impl<T> Loaded<T> {
    /// Synchronous, cacheable value
    #[must_use]
    pub fn ready(value: T) -> Self {
        Self::Ready(Some(value))
    }

    /// Synchronous empty result
    #[must_use]
    pub fn empty() -> Self {
        Self::Ready(None)
    }

    /// Asynchronous result
    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = PipelineResult<Option<T>>> + Send + 'static,
    {
        Self::Pending(future.boxed())
    }
}

/// Computes a value on first lookup within an invocation tree
pub trait ContextLoader<D>: Send + Sync + 'static {
    /// Value produced and cached by this loader
    type Value: Clone + Send + Sync + 'static;

    /// Compute the value for `ctx`
    ///
    /// # Errors
    ///
    /// Any error is surfaced to whoever asked for the value
    fn load(&self, ctx: &ExecutionContext<D>) -> PipelineResult<Loaded<Self::Value>>;
}

impl<D, T, F> ContextLoader<D> for F
where
    F: Fn(&ExecutionContext<D>) -> PipelineResult<Loaded<T>> + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn load(&self, ctx: &ExecutionContext<D>) -> PipelineResult<Loaded<T>> {
        self(ctx)
    }
}

/// Identity of a loader in the context cache
///
/// Two handles built with [`Loader::new`] are distinct cache entries even
/// when they wrap equal values or the same closure type. Clones of a handle
/// are the same entry.
pub struct Loader<L> {
    loader: Arc<L>,
    key: CacheKey,
}

impl<L> Clone for Loader<L> {
    fn clone(&self) -> Self {
        Self {
            loader: Arc::clone(&self.loader),
            key: self.key,
        }
    }
}

impl<L> fmt::Debug for Loader<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loader").field("key", &self.key).finish_non_exhaustive()
    }
}

impl<L> Deref for Loader<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.loader
    }
}

impl<L: Send + Sync + 'static> Loader<L> {
    /// Give `loader` its own cache entry
    #[must_use]
    pub fn new(loader: L) -> Self {
        let loader = Arc::new(loader);
        let key = CacheKey::Instance(Arc::as_ptr(&loader) as usize);
        Self { loader, key }
    }

    /// Handle whose cache entry is shared by every handle of `L`
    pub(crate) fn singleton(loader: L) -> Self {
        Self {
            loader: Arc::new(loader),
            key: CacheKey::Singleton(TypeId::of::<L>()),
        }
    }

    /// Check if both handles address the same cache entry
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        self.key == other.key
    }

    fn owner(&self) -> CachedValue {
        Arc::clone(&self.loader) as CachedValue
    }
}

/// Result of [`ExecutionContext::get_context`]
///
/// Cached and synchronous loader results come back as `Ready`; asynchronous
/// ones as `Pending`, which caches the value when it resolves. Both can be
/// awaited.
pub enum Lookup<T> {
    /// Value available now
    Ready(Option<T>),
    /// Value available once awaited
    Pending(BoxFuture<'static, PipelineResult<Option<T>>>),
}

impl<T> Lookup<T> {
    /// Check if the value is available without awaiting
    #[must_use]
    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Take the value if it is available without awaiting
    ///
    /// A pending lookup is handed back untouched so it can still be awaited
    /// and cached.
    ///
    /// # Errors
    ///
    /// Returns `self` when the lookup is pending
    pub fn try_ready(self) -> Result<Option<T>, Self> {
        match self {
            Self::Ready(value) => Ok(value),
            pending @ Self::Pending(_) => Err(pending),
        }
    }
}

impl<T: Send + 'static> IntoFuture for Lookup<T> {
    type Output = PipelineResult<Option<T>>;
    type IntoFuture = BoxFuture<'static, PipelineResult<Option<T>>>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Self::Ready(value) => future::ready(Ok(value)).boxed(),
            Self::Pending(pending) => pending,
        }
    }
}

/// Execution context for one hop of an invocation tree
#[derive(Debug)]
pub struct ExecutionContext<D> {
    data: D,
    cache: SharedCache,
}

impl<D: Clone> Clone for ExecutionContext<D> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            cache: Arc::clone(&self.cache),
        }
    }
}

impl<D> ExecutionContext<D> {
    /// Create a root context with a fresh cache
    #[must_use]
    pub fn new(data: D) -> Self {
        Self::with_cache(data, ContextCache::shared())
    }

    /// Create a context over an existing cache
    #[must_use]
    pub fn with_cache(data: D, cache: SharedCache) -> Self {
        Self { data, cache }
    }

    /// Create a context for a chained hop; shares the parent's cache
    #[must_use]
    pub fn chained<P>(data: D, parent: &ExecutionContext<P>) -> Self {
        Self::with_cache(data, parent.cache())
    }

    /// Data value of this hop
    #[must_use]
    pub fn data(&self) -> &D {
        &self.data
    }

    /// Handle to the tree-wide cache
    #[must_use]
    pub fn cache(&self) -> SharedCache {
        Arc::clone(&self.cache)
    }

    /// Check if both contexts belong to the same invocation tree
    #[must_use]
    pub fn shares_cache_with<P>(&self, other: &ExecutionContext<P>) -> bool {
        Arc::ptr_eq(&self.cache, &other.cache)
    }

    /// Check if `loader` already has a cached value in this tree
    #[must_use]
    pub fn has_context<L: ContextLoader<D>>(&self, loader: &Loader<L>) -> bool {
        self.cache.contains(loader.key)
    }

    /// Look up the value of `loader`, running it on a cache miss
    ///
    /// # Errors
    ///
    /// Returns the loader's error when it fails synchronously
    pub fn get_context<L: ContextLoader<D>>(
        &self,
        loader: &Loader<L>,
    ) -> PipelineResult<Lookup<L::Value>> {
        let key = loader.key;
        if let Some(value) = self.cache.get::<L::Value>(key) {
            return Ok(Lookup::Ready(Some(value)));
        }

        match loader.load(self)? {
            Loaded::Ready(value) => {
                if let Some(value) = &value {
                    self.cache.insert(key, loader.owner(), value.clone());
                }
                Ok(Lookup::Ready(value))
            }
            Loaded::Pending(pending) => {
                let cache = Arc::clone(&self.cache);
                let owner = loader.owner();
                Ok(Lookup::Pending(
                    async move {
                        let value = pending.await?;
                        if let Some(value) = &value {
                            cache.insert(key, owner, value.clone());
                        }
                        Ok(value)
                    }
                    .boxed(),
                ))
            }
        }
    }

    /// Look up the value of `loader` and await it if needed
    ///
    /// # Errors
    ///
    /// Returns the loader's error
    pub async fn resolve<L: ContextLoader<D>>(
        &self,
        loader: &Loader<L>,
    ) -> PipelineResult<Option<L::Value>>
    where
        D: Sync,
    {
        self.get_context(loader)?.await
    }

    /// Fetch the cached value of `loader`, or store the one built by `init`
    pub(crate) fn memoized<L, F>(&self, loader: &Loader<L>, init: F) -> L::Value
    where
        L: ContextLoader<D>,
        F: FnOnce() -> L::Value,
    {
        self.cache.get_or_insert_with(loader.key, loader.owner(), init)
    }
}
