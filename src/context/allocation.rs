use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use crate::{
    context::{
        arena::{ArenaAlloc, ArenaKind, ArenaSet},
        handles::{HandleTable, LoaderHandle},
    },
    host::ObjectRef,
    Error, Result,
};

/// Identifier of an [`AllocationContext`], unique within its domain for the lifetime
/// of the process. Identifiers are never reused, so a stale id held across a
/// collection simply stops resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub(crate) u64);

impl ContextId {
    /// The numeric value behind the identifier.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context #{}", self.0)
    }
}

/// Reference count value marking a context that has not been published yet.
pub(crate) const UNPUBLISHED: u64 = u64::MAX;

/// State guarded by the context's own lock: the arenas it allocates from and the
/// reference edges it holds to other contexts.
pub(crate) struct ContextInner {
    arenas: ArenaSet,
    edges: HashMap<ContextId, LoaderHandle>,
}

/// A private allocation universe: arenas, a handle table, and a reference count that
/// keeps it alive.
///
/// Every loadable unit is associated with exactly one context. Non-collectible units
/// share long-lived contexts (typically the domain's global one) whose memory is never
/// reclaimed. Collectible units get their own context whose lifetime is governed by a
/// reference count plus a cycle-aware collection pass, so mutually-referencing
/// contexts still unload once nothing outside the clique can reach them.
///
/// A freshly created context is *unpublished*: its count holds a sentinel and no
/// reference operation is valid until [`publish`](AllocationContext::publish) moves it
/// to one. The domain only inserts published contexts into its registry, which keeps
/// half-constructed contexts invisible to collection passes.
///
/// # Thread Safety
///
/// The reference count and liveness flags are atomics; arena and edge state sits
/// behind an internal mutex. All methods take `&self` and may be called from any
/// thread.
pub struct AllocationContext {
    id: ContextId,
    collectible: bool,
    refs: AtomicU64,
    alive: AtomicBool,
    marked: AtomicBool,
    quiesced: AtomicBool,
    wrapper: OnceLock<ObjectRef>,
    anchor: OnceLock<LoaderHandle>,
    handles: HandleTable,
    inner: Mutex<ContextInner>,
}

impl AllocationContext {
    /// Creates a context with empty arenas bounded by `reserve_limit` per arena kind.
    ///
    /// Collectible contexts start unpublished; non-collectible ones start with a
    /// permanent count of one and never accept reference operations.
    pub(crate) fn new(
        id: ContextId,
        collectible: bool,
        reserve_limit: usize,
        commit_granule: usize,
    ) -> Arc<AllocationContext> {
        Arc::new(AllocationContext {
            id,
            collectible,
            refs: AtomicU64::new(if collectible { UNPUBLISHED } else { 1 }),
            alive: AtomicBool::new(true),
            marked: AtomicBool::new(false),
            quiesced: AtomicBool::new(false),
            wrapper: OnceLock::new(),
            anchor: OnceLock::new(),
            handles: HandleTable::with_capacity(16),
            inner: Mutex::new(ContextInner {
                arenas: ArenaSet::new(reserve_limit, commit_granule),
                edges: HashMap::new(),
            }),
        })
    }

    /// This context's identifier.
    #[must_use]
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Whether this context participates in reference counting and collection.
    #[must_use]
    pub fn is_collectible(&self) -> bool {
        self.collectible
    }

    /// Whether the initial reference has been published.
    #[must_use]
    pub fn is_published(&self) -> bool {
        self.refs.load(Ordering::Acquire) != UNPUBLISHED
    }

    /// Whether the context is still usable: published, positively referenced, and not
    /// yet torn down.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        let refs = self.refs.load(Ordering::Acquire);
        refs != UNPUBLISHED && refs > 0
    }

    /// Current reference count, or `None` while unpublished.
    #[must_use]
    pub fn references(&self) -> Option<u64> {
        match self.refs.load(Ordering::Acquire) {
            UNPUBLISHED => None,
            count => Some(count),
        }
    }

    /// Publishes the context by turning the unpublished sentinel into an initial count
    /// of one. Exactly one publish may ever succeed.
    ///
    /// # Errors
    ///
    /// [`Error::NotCollectible`] for non-collectible contexts and
    /// [`Error::AlreadyPublished`] if the sentinel is already gone.
    pub fn publish(&self) -> Result<()> {
        if !self.collectible {
            return Err(Error::NotCollectible(self.id));
        }
        self.refs
            .compare_exchange(UNPUBLISHED, 1, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::AlreadyPublished(self.id))
    }

    /// Unconditionally takes one reference.
    ///
    /// Callers must already guarantee the context cannot be collected concurrently,
    /// for example by holding the domain's graph lock; this is what allows an edge to
    /// resurrect a context whose count has reached zero but whose collection has not
    /// started.
    ///
    /// # Errors
    ///
    /// [`Error::NotCollectible`] or [`Error::NotPublished`].
    pub fn add_reference(&self) -> Result<u64> {
        if !self.collectible {
            return Err(Error::NotCollectible(self.id));
        }
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == UNPUBLISHED {
                return Err(Error::NotPublished(self.id));
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Takes a reference only if the context is still alive.
    ///
    /// Unlike [`add_reference`](AllocationContext::add_reference) this never
    /// resurrects: a count of zero (or an unpublished sentinel) refuses with
    /// `Ok(false)`. Non-collectible contexts are permanently alive and report
    /// `Ok(true)` without counting.
    ///
    /// # Errors
    ///
    /// Infallible today; the `Result` keeps the signature uniform with the other
    /// reference operations.
    pub fn try_add_reference(&self) -> Result<bool> {
        if !self.collectible {
            return Ok(true);
        }
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == 0 || current == UNPUBLISHED {
                return Ok(false);
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(true),
                Err(observed) => current = observed,
            }
        }
    }

    /// Drops one reference and returns the count that remains.
    ///
    /// A return of zero makes the context eligible for the next collection pass; the
    /// caller decides whether to run one.
    ///
    /// # Errors
    ///
    /// [`Error::NotCollectible`], [`Error::NotPublished`], or
    /// [`Error::ReferenceUnderflow`] when the count is already zero.
    pub fn release(&self) -> Result<u64> {
        if !self.collectible {
            return Err(Error::NotCollectible(self.id));
        }
        let mut current = self.refs.load(Ordering::Acquire);
        loop {
            if current == UNPUBLISHED {
                return Err(Error::NotPublished(self.id));
            }
            if current == 0 {
                return Err(Error::ReferenceUnderflow(self.id));
            }
            match self.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current - 1),
                Err(observed) => current = observed,
            }
        }
    }

    /// Marks the context as torn down. Reference operations keep failing or refusing
    /// afterwards because the count stays at zero.
    pub(crate) fn set_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Scratch mark bit for collection passes. Only touched under the graph lock.
    pub(crate) fn set_marked(&self, marked: bool) {
        self.marked.store(marked, Ordering::Relaxed);
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Relaxed)
    }

    /// Whether new work is currently barred from entering the context.
    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.quiesced.load(Ordering::Acquire)
    }

    pub(crate) fn set_quiesced(&self, quiesced: bool) {
        self.quiesced.store(quiesced, Ordering::Release);
    }

    /// Installs the managed wrapper object and the strong anchor handle that pins it.
    /// Called once while the context is being constructed.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyPublished`] if a wrapper was installed before.
    pub(crate) fn install_wrapper(&self, wrapper: ObjectRef, anchor: LoaderHandle) -> Result<()> {
        self.wrapper
            .set(wrapper)
            .map_err(|_| Error::AlreadyPublished(self.id))?;
        self.anchor
            .set(anchor)
            .map_err(|_| Error::AlreadyPublished(self.id))?;
        Ok(())
    }

    /// The managed wrapper object, if one was installed.
    #[must_use]
    pub fn wrapper(&self) -> Option<ObjectRef> {
        self.wrapper.get().copied()
    }

    pub(crate) fn anchor(&self) -> Option<LoaderHandle> {
        self.anchor.get().copied()
    }

    pub(crate) fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Carves `size` bytes out of the arena of `kind`.
    ///
    /// # Errors
    ///
    /// [`Error::ResourceExhausted`] when the arena reserve cannot cover the request
    /// or the context is quiescing, or [`Error::LockError`] if the context lock is
    /// poisoned.
    pub(crate) fn alloc(&self, kind: ArenaKind, size: usize) -> Result<ArenaAlloc> {
        if self.is_quiesced() {
            return Err(Error::ResourceExhausted(format!(
                "{} is quiescing and accepts no allocations",
                self.id
            )));
        }
        let mut inner = self.inner.lock().map_err(|_| Error::LockError)?;
        inner.arenas.alloc(kind, size)
    }

    /// Whether this context already holds a counted edge to `target`.
    pub(crate) fn has_edge_to(&self, target: ContextId) -> Result<bool> {
        let inner = self.inner.lock().map_err(|_| Error::LockError)?;
        Ok(inner.edges.contains_key(&target))
    }

    /// Records the handle backing a newly created edge to `target`.
    pub(crate) fn record_edge(&self, target: ContextId, handle: LoaderHandle) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::LockError)?;
        debug_assert!(
            !inner.edges.contains_key(&target),
            "edge to {target} recorded twice"
        );
        inner.edges.insert(target, handle);
        Ok(())
    }

    /// Targets of every edge this context holds. Used when tracing reachability.
    pub(crate) fn edge_targets(&self) -> Result<Vec<ContextId>> {
        let inner = self.inner.lock().map_err(|_| Error::LockError)?;
        Ok(inner.edges.keys().copied().collect())
    }

    /// Drains the edge set during teardown so the counts they pinned can be returned.
    pub(crate) fn take_edges(&self) -> Result<Vec<(ContextId, LoaderHandle)>> {
        let mut inner = self.inner.lock().map_err(|_| Error::LockError)?;
        Ok(inner.edges.drain().collect())
    }

    /// Number of outgoing reference edges.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] if the context lock is poisoned.
    pub fn edge_count(&self) -> Result<usize> {
        let inner = self.inner.lock().map_err(|_| Error::LockError)?;
        Ok(inner.edges.len())
    }

    /// Bytes committed across all three arenas.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] if the context lock is poisoned.
    pub fn committed_bytes(&self) -> Result<usize> {
        let inner = self.inner.lock().map_err(|_| Error::LockError)?;
        Ok(inner.arenas.committed_bytes())
    }

    /// `(start, len)` of every committed arena chunk.
    pub(crate) fn chunk_ranges(&self) -> Result<Vec<(usize, usize)>> {
        let inner = self.inner.lock().map_err(|_| Error::LockError)?;
        Ok(inner.arenas.chunk_ranges())
    }

    /// Releases all arena memory and nulls the handle table. Teardown only.
    pub(crate) fn release_storage(&self) -> Result<()> {
        let mut inner = self.inner.lock().map_err(|_| Error::LockError)?;
        inner.arenas.release_all();
        self.handles.clear();
        Ok(())
    }
}

impl fmt::Debug for AllocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocationContext")
            .field("id", &self.id)
            .field("collectible", &self.collectible)
            .field("refs", &self.references())
            .field("alive", &self.alive.load(Ordering::Relaxed))
            .field("marked", &self.is_marked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn collectible(id: u64) -> Arc<AllocationContext> {
        AllocationContext::new(ContextId(id), true, 1 << 20, 4096)
    }

    #[test]
    fn publish_turns_sentinel_into_initial_reference() {
        let ctx = collectible(1);
        assert!(!ctx.is_published());
        assert_eq!(ctx.references(), None);

        ctx.publish().unwrap();
        assert!(ctx.is_published());
        assert_eq!(ctx.references(), Some(1));

        assert!(matches!(ctx.publish(), Err(Error::AlreadyPublished(_))));
    }

    #[test]
    fn reference_operations_require_publication() {
        let ctx = collectible(2);
        assert!(matches!(ctx.add_reference(), Err(Error::NotPublished(_))));
        assert!(matches!(ctx.release(), Err(Error::NotPublished(_))));
        assert_eq!(ctx.try_add_reference().unwrap(), false);
    }

    #[test]
    fn release_to_zero_then_underflow() {
        let ctx = collectible(3);
        ctx.publish().unwrap();
        ctx.add_reference().unwrap();
        assert_eq!(ctx.release().unwrap(), 1);
        assert_eq!(ctx.release().unwrap(), 0);
        assert!(matches!(ctx.release(), Err(Error::ReferenceUnderflow(_))));
    }

    #[test]
    fn try_add_reference_never_resurrects() {
        let ctx = collectible(4);
        ctx.publish().unwrap();
        ctx.release().unwrap();
        assert_eq!(ctx.try_add_reference().unwrap(), false);

        // The unconditional form may resurrect while the graph lock is held.
        assert_eq!(ctx.add_reference().unwrap(), 1);
        assert_eq!(ctx.try_add_reference().unwrap(), true);
        assert_eq!(ctx.references(), Some(2));
    }

    #[test]
    fn non_collectible_contexts_reject_counting() {
        let ctx = AllocationContext::new(ContextId(5), false, 1 << 20, 4096);
        assert!(ctx.is_published());
        assert!(ctx.is_alive());
        assert!(matches!(ctx.publish(), Err(Error::NotCollectible(_))));
        assert!(matches!(ctx.add_reference(), Err(Error::NotCollectible(_))));
        assert!(matches!(ctx.release(), Err(Error::NotCollectible(_))));
        assert_eq!(ctx.try_add_reference().unwrap(), true);
        assert_eq!(ctx.references(), Some(1));
    }

    #[test]
    fn balanced_concurrent_counting_returns_to_baseline() {
        let ctx = collectible(6);
        ctx.publish().unwrap();

        let mut joins = Vec::new();
        for _ in 0..8 {
            let ctx = Arc::clone(&ctx);
            joins.push(thread::spawn(move || {
                for _ in 0..1_000 {
                    ctx.add_reference().unwrap();
                    ctx.release().unwrap();
                }
            }));
        }
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(ctx.references(), Some(1));
    }

    #[test]
    fn dead_contexts_report_not_alive() {
        let ctx = collectible(7);
        ctx.publish().unwrap();
        assert!(ctx.is_alive());
        ctx.release().unwrap();
        assert!(!ctx.is_alive(), "zero references means not alive");
        ctx.set_dead();
        assert!(!ctx.is_alive());
    }

    #[test]
    fn edges_are_recorded_and_drained() {
        let ctx = collectible(8);
        let handle = ctx.handles().allocate(ObjectRef::new(0xBEEF)).unwrap();
        ctx.record_edge(ContextId(9), handle).unwrap();
        assert!(ctx.has_edge_to(ContextId(9)).unwrap());
        assert!(!ctx.has_edge_to(ContextId(10)).unwrap());
        assert_eq!(ctx.edge_count().unwrap(), 1);

        let drained = ctx.take_edges().unwrap();
        assert_eq!(drained, vec![(ContextId(9), handle)]);
        assert_eq!(ctx.edge_count().unwrap(), 0);
    }

    #[test]
    fn allocation_commits_and_release_discards() {
        let ctx = collectible(10);
        let alloc = ctx.alloc(ArenaKind::Plain, 64).unwrap();
        assert!(alloc.fresh_chunk.is_some());
        assert!(ctx.committed_bytes().unwrap() > 0);
        assert_eq!(ctx.chunk_ranges().unwrap().len(), 1);

        ctx.release_storage().unwrap();
        assert!(ctx.chunk_ranges().unwrap().is_empty());
    }
}
