use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use crate::{
    context::{AllocationContext, ContextId},
    loader::{LoadLock, LoadableUnit, UnitId},
    Error, Result,
};

/// Unit storage for one domain: primary index by id, name index for definition-time
/// uniqueness, and the in-flight load locks.
///
/// Primary storage is a lock-free skip list and the secondary indices are concurrent
/// hash maps, so lookups never block level work. Name uniqueness is enforced through
/// the name index's entry lock, which makes definition atomic without a registry-wide
/// mutex.
pub(crate) struct UnitRegistry {
    /// Primary unit storage indexed by unit id.
    units: SkipMap<UnitId, Arc<LoadableUnit>>,
    /// Secondary index: unit ids by definition name. Source of truth for uniqueness.
    by_name: DashMap<String, UnitId>,
    /// Load locks of units currently in flight. Entries retire at the terminal level.
    locks: DashMap<UnitId, Arc<LoadLock>>,
    /// Counter for unit ids. Ids are never reused.
    next_id: AtomicU64,
}

impl UnitRegistry {
    pub(crate) fn new() -> UnitRegistry {
        UnitRegistry {
            units: SkipMap::new(),
            by_name: DashMap::new(),
            locks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates and registers a unit under `name`.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateUnit`] if the name is already taken.
    pub(crate) fn define(&self, name: &str, collectible: bool) -> Result<Arc<LoadableUnit>> {
        match self.by_name.entry(name.to_string()) {
            dashmap::Entry::Occupied(_) => Err(Error::DuplicateUnit(name.to_string())),
            dashmap::Entry::Vacant(slot) => {
                let id = UnitId(self.next_id.fetch_add(1, Ordering::Relaxed));
                debug_assert!(id.0 < u64::MAX, "unit id space exhausted");
                let unit = LoadableUnit::new(id, name.to_string(), collectible);
                self.units.insert(id, Arc::clone(&unit));
                slot.insert(id);
                Ok(unit)
            }
        }
    }

    pub(crate) fn get(&self, id: UnitId) -> Option<Arc<LoadableUnit>> {
        self.units.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn get_by_name(&self, name: &str) -> Option<Arc<LoadableUnit>> {
        let id = *self.by_name.get(name)?;
        self.get(id)
    }

    /// Removes `unit` from every index. Used when its context is torn down.
    pub(crate) fn remove(&self, unit: &LoadableUnit) {
        self.by_name.remove(unit.name());
        self.locks.remove(&unit.id());
        if let Some(entry) = self.units.get(&unit.id()) {
            entry.remove();
        }
    }

    /// Every unit bound to `context`.
    pub(crate) fn in_context(&self, context: ContextId) -> Vec<Arc<LoadableUnit>> {
        self.units
            .iter()
            .filter(|entry| entry.value().context() == Some(context))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// The unit's load lock, creating one if no load is in flight.
    pub(crate) fn find_or_create_lock(&self, unit: &LoadableUnit) -> Arc<LoadLock> {
        Arc::clone(
            self.locks
                .entry(unit.id())
                .or_insert_with(|| LoadLock::new(unit.id()))
                .value(),
        )
    }

    /// Retires the unit's load lock. Later loads of the same unit make a fresh one.
    pub(crate) fn unlink_lock(&self, unit: UnitId) {
        self.locks.remove(&unit);
    }

    pub(crate) fn len(&self) -> usize {
        self.units.len()
    }

    pub(crate) fn locks_in_flight(&self) -> usize {
        self.locks.len()
    }
}

/// Context storage for one domain. Only published contexts are ever inserted, so a
/// collection pass never observes a context that is still being constructed.
pub(crate) struct ContextRegistry {
    /// Primary context storage indexed by context id.
    contexts: SkipMap<ContextId, Arc<AllocationContext>>,
    /// Counter for context ids. Ids are never reused.
    next_id: AtomicU64,
}

impl ContextRegistry {
    pub(crate) fn new() -> ContextRegistry {
        ContextRegistry {
            contexts: SkipMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn mint_id(&self) -> ContextId {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug_assert!(id.0 < u64::MAX, "context id space exhausted");
        id
    }

    pub(crate) fn insert(&self, context: Arc<AllocationContext>) {
        debug_assert!(
            context.is_published() || !context.is_collectible(),
            "unpublished context must not enter the registry"
        );
        self.contexts.insert(context.id(), context);
    }

    pub(crate) fn get(&self, id: ContextId) -> Option<Arc<AllocationContext>> {
        self.contexts
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Unlinks `id`, returning the context for teardown.
    pub(crate) fn remove(&self, id: ContextId) -> Option<Arc<AllocationContext>> {
        self.contexts
            .remove(&id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All collectible, alive contexts, as input for a collection snapshot.
    pub(crate) fn collectible(&self) -> Vec<Arc<AllocationContext>> {
        self.contexts
            .iter()
            .filter(|entry| entry.value().is_collectible() && entry.value().is_published())
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Total bytes committed by every registered context's arenas.
    pub(crate) fn committed_bytes(&self) -> Result<usize> {
        let mut total = 0;
        for entry in self.contexts.iter() {
            total += entry.value().committed_bytes()?;
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique_per_domain() {
        let registry = UnitRegistry::new();
        let unit = registry.define("app.core", false).unwrap();
        assert!(matches!(
            registry.define("app.core", true),
            Err(Error::DuplicateUnit(name)) if name == "app.core"
        ));

        assert_eq!(registry.get(unit.id()).unwrap().name(), "app.core");
        assert_eq!(registry.get_by_name("app.core").unwrap().id(), unit.id());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn removal_frees_the_name() {
        let registry = UnitRegistry::new();
        let unit = registry.define("plugin", true).unwrap();
        registry.remove(&unit);

        assert!(registry.get(unit.id()).is_none());
        assert!(registry.get_by_name("plugin").is_none());

        // The name is reusable; the id is not reused.
        let again = registry.define("plugin", true).unwrap();
        assert_ne!(again.id(), unit.id());
    }

    #[test]
    fn in_context_filters_by_binding() {
        let registry = UnitRegistry::new();
        let a = registry.define("a", true).unwrap();
        let b = registry.define("b", true).unwrap();
        let c = registry.define("c", true).unwrap();
        a.assign_context(ContextId(1)).unwrap();
        b.assign_context(ContextId(1)).unwrap();
        c.assign_context(ContextId(2)).unwrap();

        let mut names: Vec<_> = registry
            .in_context(ContextId(1))
            .iter()
            .map(|u| u.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, ["a", "b"]);
    }

    #[test]
    fn locks_are_shared_until_unlinked() {
        let registry = UnitRegistry::new();
        let unit = registry.define("app.core", false).unwrap();

        let first = registry.find_or_create_lock(&unit);
        let second = registry.find_or_create_lock(&unit);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.locks_in_flight(), 1);

        registry.unlink_lock(unit.id());
        assert_eq!(registry.locks_in_flight(), 0);
        let third = registry.find_or_create_lock(&unit);
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn context_ids_are_never_reused() {
        let registry = ContextRegistry::new();
        let a = registry.mint_id();
        let ctx = AllocationContext::new(a, true, 1 << 16, 4096);
        ctx.publish().unwrap();
        registry.insert(Arc::clone(&ctx));
        assert!(registry.get(a).is_some());

        let removed = registry.remove(a).unwrap();
        assert!(Arc::ptr_eq(&removed, &ctx));
        assert!(registry.get(a).is_none());

        assert_ne!(registry.mint_id(), a);
    }

    #[test]
    fn collectible_listing_skips_non_collectible() {
        let registry = ContextRegistry::new();
        let global = AllocationContext::new(registry.mint_id(), false, 1 << 16, 4096);
        registry.insert(global);

        let plugin = AllocationContext::new(registry.mint_id(), true, 1 << 16, 4096);
        plugin.publish().unwrap();
        registry.insert(Arc::clone(&plugin));

        let collectible = registry.collectible();
        assert_eq!(collectible.len(), 1);
        assert_eq!(collectible[0].id(), plugin.id());
    }
}
