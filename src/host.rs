//! The embedding interface: what the engine asks of its host runtime.
//!
//! The lifecycle engine owns levels, locks, contexts and collection, but it does not
//! know where unit images come from or what a managed object is. Both concerns belong
//! to the embedder: a [`crate::RuntimeHost`] resolves names to images and mints the
//! managed objects the engine anchors, and any number of [`crate::UnloadObserver`]s
//! watch contexts go away.

use uguid::Guid;

use crate::{
    context::ContextId,
    loader::{LoadableUnit, UnitId},
    Result,
};

/// Opaque reference to an object on the host's managed object heap.
///
/// The engine never dereferences these; it only stores them in handle-table slots so
/// the host's garbage collector treats the objects as reachable. Zero is reserved as
/// the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(u64);

impl ObjectRef {
    /// The null object reference.
    pub const NULL: ObjectRef = ObjectRef(0);

    /// Wraps a raw heap word.
    #[must_use]
    pub const fn new(raw: u64) -> ObjectRef {
        ObjectRef(raw)
    }

    /// The raw heap word.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is the null reference.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// What the host's resolver produced for a unit name.
pub struct ResolvedImage {
    /// The raw image bytes. An empty image fails the unit permanently.
    pub bytes: Vec<u8>,
    /// Identity the image declares for itself; derived from the byte digest when the
    /// format carries none.
    pub identity: Option<Guid>,
    /// Names of the units this image requires to be loaded alongside it.
    pub dependencies: Vec<String>,
}

/// Services the engine requires from its embedding runtime.
///
/// Implementations must be safe to call from any thread: image resolution runs on
/// whichever thread performs that unit's level work, and may run for several units
/// concurrently.
///
/// # Examples
///
/// A host that fabricates one-byte images and mints sequential object references:
///
/// ```
/// use std::sync::atomic::{AtomicU64, Ordering};
/// use dotload::{ContextId, LoadableUnit, ObjectRef, ResolvedImage, Result, RuntimeHost};
///
/// struct TinyHost {
///     next_object: AtomicU64,
/// }
///
/// impl TinyHost {
///     fn mint(&self) -> ObjectRef {
///         ObjectRef::new(self.next_object.fetch_add(1, Ordering::Relaxed))
///     }
/// }
///
/// impl RuntimeHost for TinyHost {
///     fn resolve_image(&self, unit: &str) -> Result<ResolvedImage> {
///         Ok(ResolvedImage {
///             bytes: unit.as_bytes().to_vec(),
///             identity: None,
///             dependencies: Vec::new(),
///         })
///     }
///
///     fn create_context_wrapper(&self, _context: ContextId) -> Result<ObjectRef> {
///         Ok(self.mint())
///     }
///
///     fn create_unit_object(&self, _unit: &LoadableUnit) -> Result<ObjectRef> {
///         Ok(self.mint())
///     }
/// }
/// ```
pub trait RuntimeHost: Send + Sync {
    /// Resolves `unit` to its raw image, identity and declared dependencies.
    ///
    /// # Errors
    ///
    /// Any error fails the unit's resolve level; transient errors leave the level
    /// retryable, anything else is cached as the unit's permanent failure.
    fn resolve_image(&self, unit: &str) -> Result<ResolvedImage>;

    /// Creates the managed wrapper object for a freshly built collectible context.
    /// The engine anchors it with a strong handle until the context is destroyed.
    ///
    /// # Errors
    ///
    /// Failures abort context creation before the context becomes visible.
    fn create_context_wrapper(&self, context: ContextId) -> Result<ObjectRef>;

    /// Creates the managed runtime object for a unit whose load has completed.
    ///
    /// # Errors
    ///
    /// Any error fails the unit's final construction level.
    fn create_unit_object(&self, unit: &LoadableUnit) -> Result<ObjectRef>;

    /// Called once per unit, after its load notifications were released. The unit is
    /// fully usable; re-entering the engine from here is allowed.
    fn unit_loaded(&self, _unit: &LoadableUnit) {}
}

/// Watches contexts and their units go away.
///
/// Observers run inside the collection pass, between the steps of a context's
/// teardown. They must not call back into reference-edge creation or trigger another
/// collection pass; everything else, including reading unit and context state, is
/// allowed.
pub trait UnloadObserver: Send + Sync {
    /// `context` was condemned by a collection pass; teardown is about to begin.
    fn context_condemned(&self, _context: ContextId) {}

    /// `unit` is being removed because its context is going away.
    fn unit_unloading(&self, _unit: UnitId, _name: &str) {}

    /// Teardown of `context` finished and its memory is gone.
    fn context_destroyed(&self, _context: ContextId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reference_is_zero() {
        assert!(ObjectRef::NULL.is_null());
        assert_eq!(ObjectRef::NULL.raw(), 0);
        assert!(!ObjectRef::new(1).is_null());
    }
}
