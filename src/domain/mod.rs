//! Isolation domains: one namespace of units, contexts and locks.
//!
//! A [`crate::Domain`] owns everything the two halves of the engine share: the unit
//! and context registries, the load-lock acquisition table, the address range map and
//! the reference-edge graph. Units defined in one domain are invisible to every other
//! domain, and nothing is shared between domains except the host.
//!
//! # Key Components
//!
//! - [`crate::Domain`] - The facade every operation goes through
//! - [`crate::DomainStats`] - Operational counters for diagnostics
//!
//! # Locking Discipline
//!
//! The domain keeps three independent synchronization layers, ordered so no path ever
//! takes them in conflicting order:
//!
//! 1. load locks (acquisition table), taken only by level work
//! 2. the graph lock, serializing edge creation and collection passes
//! 3. per-context locks, innermost, guarding arenas and edge sets
//!
//! Lookups in the registries and the range map are lock-free and may be called from
//! anywhere, including observer callbacks running inside a collection pass.

use rayon::prelude::*;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};
use tracing::{debug, info, warn};

use crate::{
    config::DomainConfig,
    context::{
        apply_marks, plan_collection, AllocationContext, ArenaKind, CollectionSummary, ContextId,
        ContextSnapshot, LoaderHandle, QuiesceScope, RangeMap,
    },
    host::{ObjectRef, RuntimeHost, UnloadObserver},
    loader::{
        request_level as drive_request, LoadLevel, LoadLock, LoadableUnit, LockTable,
        UnitDefinition, UnitFlags, UnitId,
    },
    Error, Result,
};

mod registry;

use registry::{ContextRegistry, UnitRegistry};

/// Point-in-time operational counters for one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainStats {
    /// Units currently registered.
    pub units: usize,
    /// Contexts currently registered, the global one included.
    pub contexts: usize,
    /// Load locks currently linked, one per unit with an unfinished load.
    pub loads_in_flight: usize,
    /// Collection passes run since the domain was created.
    pub collection_passes: u64,
    /// Contexts swept since the domain was created.
    pub contexts_collected: u64,
    /// Bytes committed across every registered context's arenas.
    pub committed_bytes: usize,
}

/// An isolation domain: the single entry point for defining units, driving them
/// through load levels, and managing the allocation contexts behind them.
///
/// The domain is fully thread-safe; every method takes `&self`. Typical embeddings
/// create one domain per isolation boundary and share it behind an [`Arc`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use dotload::{
///     ContextId, Domain, DomainConfig, LoadLevel, LoadableUnit, ObjectRef, ResolvedImage,
///     Result, RuntimeHost, UnitDefinition,
/// };
///
/// struct StaticHost;
///
/// impl RuntimeHost for StaticHost {
///     fn resolve_image(&self, unit: &str) -> Result<ResolvedImage> {
///         Ok(ResolvedImage {
///             bytes: unit.as_bytes().to_vec(),
///             identity: None,
///             dependencies: Vec::new(),
///         })
///     }
///
///     fn create_context_wrapper(&self, context: ContextId) -> Result<ObjectRef> {
///         Ok(ObjectRef::new(0x1000 + context.raw()))
///     }
///
///     fn create_unit_object(&self, unit: &LoadableUnit) -> Result<ObjectRef> {
///         Ok(ObjectRef::new(0x2000 + unit.id().raw()))
///     }
/// }
///
/// # fn main() -> Result<()> {
/// let domain = Domain::new("default", Arc::new(StaticHost), DomainConfig::default());
///
/// let unit = domain.define_unit(UnitDefinition::new("app.core"))?;
/// let reached = domain.request_level(&unit, LoadLevel::Active)?;
/// assert_eq!(reached, LoadLevel::Active);
/// assert!(unit.is_active());
/// # Ok(())
/// # }
/// ```
pub struct Domain {
    name: String,
    host: Arc<dyn RuntimeHost>,
    config: DomainConfig,
    units: UnitRegistry,
    contexts: ContextRegistry,
    global_context: Arc<AllocationContext>,
    lock_table: LockTable,
    range_map: RangeMap,
    /// Serializes reference-edge creation against collection passes.
    graph: Mutex<()>,
    observers: RwLock<Vec<Arc<dyn UnloadObserver>>>,
    passes: AtomicU64,
    collected: AtomicU64,
}

impl Domain {
    /// Creates a domain named `name`, backed by `host`, with a fresh global context.
    #[must_use]
    pub fn new(name: impl Into<String>, host: Arc<dyn RuntimeHost>, config: DomainConfig) -> Domain {
        let name = name.into();
        let contexts = ContextRegistry::new();
        let global_context = AllocationContext::new(
            contexts.mint_id(),
            false,
            config.global_reserve,
            config.commit_granule,
        );
        contexts.insert(Arc::clone(&global_context));
        info!(target: "dotload::loader", domain = %name, "domain created");

        Domain {
            name,
            host,
            config,
            units: UnitRegistry::new(),
            contexts,
            global_context,
            lock_table: LockTable::new(),
            range_map: RangeMap::new(),
            graph: Mutex::new(()),
            observers: RwLock::new(Vec::new()),
            passes: AtomicU64::new(0),
            collected: AtomicU64::new(0),
        }
    }

    /// The domain's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration the domain was created with.
    #[must_use]
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    // ------------------------------------------------------------------------------
    // Units and the load pipeline
    // ------------------------------------------------------------------------------

    /// Registers a new unit. No level work runs until the unit is requested.
    ///
    /// A unit defined into an existing context inherits that context's
    /// collectibility, regardless of what the definition asked for.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateUnit`] if the name is taken, or [`Error::ContextNotFound`]
    /// if the definition names a context that does not exist.
    pub fn define_unit(&self, definition: UnitDefinition) -> Result<Arc<LoadableUnit>> {
        let collectible = match definition.context() {
            Some(context) => self.context(context)?.is_collectible(),
            None => definition.is_collectible(),
        };

        let unit = self.units.define(definition.name(), collectible)?;
        if let Some(context) = definition.context() {
            unit.assign_context(context)?;
        }
        debug!(
            target: "dotload::loader",
            unit = %unit.id(),
            name = unit.name(),
            collectible,
            "unit defined"
        );
        Ok(unit)
    }

    /// Drives `unit` toward `target` and returns the level actually reached.
    ///
    /// The request may legitimately stop one level short of `target` when the work
    /// for the final level is held by another thread or barred by the current
    /// thread's own recursion; re-request later to finish. Inside dependency work the
    /// target is additionally clamped by the calling thread's level ceiling.
    ///
    /// # Errors
    ///
    /// The unit's cached failure if it already failed; [`Error::LoadInProgress`] when
    /// the unit ended more than one level short; otherwise whatever the failing
    /// level's work raised (transient errors may simply be retried).
    pub fn request_level(&self, unit: &LoadableUnit, target: LoadLevel) -> Result<LoadLevel> {
        drive_request(self, unit, target)
    }

    /// Drives several units toward `target` in parallel, one result per unit, in
    /// input order.
    pub fn request_level_many(
        &self,
        units: &[Arc<LoadableUnit>],
        target: LoadLevel,
    ) -> Vec<Result<LoadLevel>> {
        units
            .par_iter()
            .map(|unit| self.request_level(unit, target))
            .collect()
    }

    /// Asserts that `unit` already reached `target`, without driving any work.
    ///
    /// # Errors
    ///
    /// The unit's cached failure if it failed, otherwise [`Error::LoadInProgress`]
    /// when the level has not been reached yet.
    pub fn require_level(&self, unit: &LoadableUnit, target: LoadLevel) -> Result<()> {
        if unit.level() >= target {
            return Ok(());
        }
        unit.check_no_failure()?;
        Err(Error::LoadInProgress {
            unit: unit.id(),
            current: unit.level(),
            target,
        })
    }

    /// Looks up a unit by id.
    ///
    /// # Errors
    ///
    /// [`Error::UnitNotFound`] if the unit was never defined or has been unloaded.
    pub fn unit(&self, id: UnitId) -> Result<Arc<LoadableUnit>> {
        self.units.get(id).ok_or(Error::UnitNotFound(id))
    }

    /// Looks up a unit by definition name.
    #[must_use]
    pub fn unit_by_name(&self, name: &str) -> Option<Arc<LoadableUnit>> {
        self.units.get_by_name(name)
    }

    /// Every unit currently bound to `context`.
    #[must_use]
    pub fn units_in_context(&self, context: ContextId) -> Vec<Arc<LoadableUnit>> {
        self.units.in_context(context)
    }

    // ------------------------------------------------------------------------------
    // Contexts and reference counting
    // ------------------------------------------------------------------------------

    /// Looks up a context by id.
    ///
    /// # Errors
    ///
    /// [`Error::ContextNotFound`] if the context does not exist or was collected.
    pub fn context(&self, id: ContextId) -> Result<Arc<AllocationContext>> {
        self.contexts.get(id).ok_or(Error::ContextNotFound(id))
    }

    /// The domain's global, non-collectible context.
    #[must_use]
    pub fn global_context(&self) -> &Arc<AllocationContext> {
        &self.global_context
    }

    /// Builds, publishes and registers a fresh collectible context.
    ///
    /// The host provides the managed wrapper object, which is pinned by a strong
    /// handle in the global context until the new context is destroyed. The context
    /// enters the registry only after it is published, so a concurrent collection
    /// pass can never observe it half-constructed.
    ///
    /// # Errors
    ///
    /// Host wrapper creation failures, or [`Error::LockError`] if handle allocation
    /// hits a poisoned lock.
    pub fn create_collectible_context(&self) -> Result<Arc<AllocationContext>> {
        let id = self.contexts.mint_id();
        let context = AllocationContext::new(
            id,
            true,
            self.config.collectible_reserve,
            self.config.commit_granule,
        );

        let wrapper = self.host.create_context_wrapper(id)?;
        if wrapper.is_null() {
            return Err(load_error!("host returned a null wrapper object for {id}"));
        }
        let anchor = self.global_context.handles().allocate(wrapper)?;
        context.install_wrapper(wrapper, anchor)?;
        context.publish()?;
        self.contexts.insert(Arc::clone(&context));

        debug!(target: "dotload::collect", context = %id, "collectible context created");
        Ok(context)
    }

    /// Takes one reference on `context`. See
    /// [`AllocationContext::add_reference`] for the liveness contract.
    ///
    /// # Errors
    ///
    /// [`Error::ContextNotFound`] plus the context's own counting errors.
    pub fn add_reference(&self, context: ContextId) -> Result<u64> {
        self.context(context)?.add_reference()
    }

    /// Takes one reference on `context` only if it is still alive.
    ///
    /// # Errors
    ///
    /// [`Error::ContextNotFound`] if the context is already gone.
    pub fn try_add_reference(&self, context: ContextId) -> Result<bool> {
        self.context(context)?.try_add_reference()
    }

    /// Drops one reference from `context` and returns the remaining count.
    ///
    /// When the count reaches zero and the domain is configured to collect on
    /// release, a collection pass runs before this returns.
    ///
    /// # Errors
    ///
    /// [`Error::ContextNotFound`], the context's counting errors, or anything a
    /// triggered collection pass raises.
    pub fn release(&self, context: ContextId) -> Result<u64> {
        let remaining = self.context(context)?.release()?;
        if remaining == 0 && self.config.collect_on_release {
            debug!(target: "dotload::collect", context = %context, "last reference released");
            self.run_collection_pass()?;
        }
        Ok(remaining)
    }

    /// Ensures a counted reference edge from `source` to `target`, making `target`'s
    /// context live at least as long as `source`'s.
    ///
    /// Edges are deduplicated and each carries exactly one count on the target;
    /// `Ok(true)` means this call created the edge. Same-context pairs and pairs
    /// involving a non-collectible context need no edge and report `Ok(false)`.
    /// The existence check is lock-free; only actual creation takes the graph lock.
    ///
    /// # Errors
    ///
    /// [`Error::ContextNotFound`] for either end, or [`Error::LockError`].
    pub fn ensure_reference(&self, source: ContextId, target: ContextId) -> Result<bool> {
        if source == target {
            return Ok(false);
        }
        let src = self.context(source)?;
        let dst = self.context(target)?;
        if !src.is_collectible() || !dst.is_collectible() {
            return Ok(false);
        }
        if src.has_edge_to(target)? {
            return Ok(false);
        }

        let _graph = self.graph.lock().map_err(|_| Error::LockError)?;
        if src.has_edge_to(target)? {
            return Ok(false);
        }

        let wrapper = dst
            .wrapper()
            .ok_or_else(|| load_error!("{target} has no wrapper object"))?;
        let handle = src.handles().allocate(wrapper)?;
        dst.add_reference()?;
        src.record_edge(target, handle)?;
        debug!(target: "dotload::collect", %source, %target, "reference edge created");
        Ok(true)
    }

    // ------------------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------------------

    /// Runs a full collection pass: snapshot, plan, sweep, teardown, repeated until a
    /// round sweeps nothing.
    ///
    /// The graph lock is held for the whole pass, so no reference edge can be created
    /// while garbage is being decided. Teardown failures are logged and do not stop
    /// the pass; the affected context is still gone from the registry.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] if the graph lock or a context lock is poisoned.
    pub fn run_collection_pass(&self) -> Result<CollectionSummary> {
        let _graph = self.graph.lock().map_err(|_| Error::LockError)?;
        let mut summary = CollectionSummary::default();

        loop {
            let live = self.contexts.collectible();
            let mut snapshot = Vec::with_capacity(live.len());
            for context in &live {
                let Some(references) = context.references() else {
                    continue;
                };
                snapshot.push(ContextSnapshot {
                    id: context.id(),
                    references,
                    edges: context.edge_targets()?,
                });
            }

            let doomed: std::collections::HashSet<ContextId> =
                plan_collection(&snapshot).into_iter().collect();
            apply_marks(&snapshot, &doomed, |id| self.contexts.get(id));
            if doomed.is_empty() {
                break;
            }
            summary.rounds += 1;

            // Unlink everything first so lookups fail before any teardown runs.
            let mut condemned = Vec::with_capacity(doomed.len());
            for id in &doomed {
                if let Some(context) = self.contexts.remove(*id) {
                    condemned.push(context);
                }
            }
            summary.contexts_collected += condemned.len();

            for context in &condemned {
                if let Err(error) = self.teardown_context(context) {
                    warn!(
                        target: "dotload::collect",
                        context = %context.id(),
                        %error,
                        "context teardown failed"
                    );
                }
            }
            // Teardown returned edge counts; re-plan to catch cascaded garbage.
        }

        self.passes.fetch_add(1, Ordering::Relaxed);
        self.collected
            .fetch_add(summary.contexts_collected as u64, Ordering::Relaxed);
        if summary.contexts_collected > 0 {
            info!(
                target: "dotload::collect",
                collected = summary.contexts_collected,
                rounds = summary.rounds,
                "collection pass swept"
            );
        } else {
            debug!(target: "dotload::collect", "collection pass found nothing");
        }
        Ok(summary)
    }

    /// Destroys one condemned context in a fixed order: condemn, unit removal, range
    /// removal, quiesced storage release, resume.
    fn teardown_context(&self, context: &Arc<AllocationContext>) -> Result<()> {
        let id = context.id();
        debug!(target: "dotload::collect", context = %id, "teardown started");

        context.set_dead();
        self.for_each_observer(|observer| observer.context_condemned(id));

        for unit in self.units.in_context(id) {
            unit.set_flags(UnitFlags::UNLOADED);
            self.for_each_observer(|observer| observer.unit_unloading(unit.id(), unit.name()));
            self.units.remove(&unit);
        }

        self.range_map.unregister_owner(id);

        {
            let _quiesced = QuiesceScope::enter(context);

            // Counts pinned by this context's outgoing edges go back to the
            // survivors; a survivor dropping to zero here is caught by the
            // caller's next planning round, never by a nested pass.
            for (target, _handle) in context.take_edges()? {
                if let Some(survivor) = self.contexts.get(target) {
                    if let Err(error) = survivor.release() {
                        warn!(
                            target: "dotload::collect",
                            context = %target,
                            %error,
                            "edge count return failed"
                        );
                    }
                }
            }

            if let Some(anchor) = context.anchor() {
                if let Err(error) = self.global_context.handles().release(anchor) {
                    warn!(
                        target: "dotload::collect",
                        context = %id,
                        %error,
                        "wrapper anchor release failed"
                    );
                }
            }
            context.release_storage()?;
        }

        self.for_each_observer(|observer| observer.context_destroyed(id));
        info!(target: "dotload::collect", context = %id, "context destroyed");
        Ok(())
    }

    // ------------------------------------------------------------------------------
    // Handles, memory, observers, diagnostics
    // ------------------------------------------------------------------------------

    /// Allocates `size` bytes from one of `context`'s arenas and returns the address.
    ///
    /// # Errors
    ///
    /// [`Error::ContextNotFound`], or [`Error::ResourceExhausted`] (transient) when
    /// the arena reserve cannot cover the request.
    pub fn context_alloc(&self, context: ContextId, kind: ArenaKind, size: usize) -> Result<usize> {
        let context = self.context(context)?;
        Ok(self.alloc_raw(&context, kind, size)?.addr)
    }

    /// The context whose committed arenas contain `addr`, if any. Lock-free.
    #[must_use]
    pub fn context_owning(&self, addr: usize) -> Option<ContextId> {
        self.range_map.context_owning(addr)
    }

    /// Creates a strong handle in `context`'s table, anchoring `object` until the
    /// handle is destroyed or the context goes away. Null objects cannot be
    /// anchored; a null slot is what marks a handle as released.
    ///
    /// # Errors
    ///
    /// [`Error::ContextNotFound`] or [`Error::LockError`].
    pub fn create_strong_handle(
        &self,
        context: ContextId,
        object: ObjectRef,
    ) -> Result<LoaderHandle> {
        if object.is_null() {
            return Err(load_error!("cannot anchor the null object reference"));
        }
        self.context(context)?.handles().allocate(object)
    }

    /// Destroys a strong handle previously created in `context`'s table. The slot is
    /// nulled before it is recycled.
    ///
    /// # Errors
    ///
    /// [`Error::ContextNotFound`] or [`Error::InvalidHandle`].
    pub fn destroy_strong_handle(&self, context: ContextId, handle: LoaderHandle) -> Result<()> {
        self.context(context)?.handles().release(handle)
    }

    /// Registers an observer for context and unit unload events.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] if the observer list lock is poisoned.
    pub fn register_observer(&self, observer: Arc<dyn UnloadObserver>) -> Result<()> {
        self.observers
            .write()
            .map_err(|_| Error::LockError)?
            .push(observer);
        Ok(())
    }

    /// Current operational counters.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] if a context lock is poisoned while summing memory.
    pub fn stats(&self) -> Result<DomainStats> {
        Ok(DomainStats {
            units: self.units.len(),
            contexts: self.contexts.len(),
            loads_in_flight: self.units.locks_in_flight(),
            collection_passes: self.passes.load(Ordering::Relaxed),
            contexts_collected: self.collected.load(Ordering::Relaxed),
            committed_bytes: self.contexts.committed_bytes()?,
        })
    }

    // ------------------------------------------------------------------------------
    // Pipeline plumbing
    // ------------------------------------------------------------------------------

    pub(crate) fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    pub(crate) fn find_or_create_lock(&self, unit: &LoadableUnit) -> Result<Arc<LoadLock>> {
        // An unloaded unit must not re-enter the pipeline.
        self.units
            .get(unit.id())
            .ok_or(Error::UnitNotFound(unit.id()))?;
        Ok(self.units.find_or_create_lock(unit))
    }

    pub(crate) fn unlink_lock(&self, unit: UnitId) {
        self.units.unlink_lock(unit);
    }

    pub(crate) fn host(&self) -> &dyn RuntimeHost {
        self.host.as_ref()
    }

    /// An existing unit named `name`, or a fresh definition inheriting the parent's
    /// collectibility.
    pub(crate) fn find_or_define_dependency(
        &self,
        name: &str,
        parent: &LoadableUnit,
    ) -> Result<Arc<LoadableUnit>> {
        if let Some(existing) = self.units.get_by_name(name) {
            return Ok(existing);
        }
        match self.units.define(name, parent.is_collectible()) {
            Ok(unit) => Ok(unit),
            // Raced with another definition; use whatever won.
            Err(Error::DuplicateUnit(_)) => self
                .units
                .get_by_name(name)
                .ok_or_else(|| load_error!("dependency '{name}' vanished while being defined")),
            Err(error) => Err(error),
        }
    }

    pub(crate) fn alloc_raw(
        &self,
        context: &AllocationContext,
        kind: ArenaKind,
        size: usize,
    ) -> Result<crate::context::ArenaAlloc> {
        let alloc = context.alloc(kind, size)?;
        if let Some((start, len)) = alloc.fresh_chunk {
            self.range_map.register(start, len, context.id());
        }
        Ok(alloc)
    }

    pub(crate) fn notify_unit_loaded(&self, unit: &LoadableUnit) {
        info!(
            target: "dotload::loader",
            unit = %unit.id(),
            name = unit.name(),
            "unit loaded"
        );
        self.host.unit_loaded(unit);
    }

    fn for_each_observer(&self, f: impl Fn(&dyn UnloadObserver)) {
        if let Ok(observers) = self.observers.read() {
            for observer in observers.iter() {
                f(observer.as_ref());
            }
        }
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("name", &self.name)
            .field("units", &self.units.len())
            .field("contexts", &self.contexts.len())
            .finish()
    }
}
