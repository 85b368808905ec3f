use strum::{Display, EnumCount, EnumIter, FromRepr};

/// Readiness levels a loadable unit progresses through, in pipeline order.
///
/// Every unit starts at [`LoadLevel::Created`] and is driven one level at a time toward
/// [`LoadLevel::Active`]. Transitions are strictly sequential per unit: no level is ever
/// skipped and no level is ever revisited, so the numeric discriminants double as a
/// monotonic progress ordinal.
///
/// The level a unit has *completed* is distinct from the level currently being *worked*:
/// while a thread performs the work for level N, the unit still reports N − 1, and other
/// threads asking for N − 1 or below are satisfied without blocking.
///
/// ## Pipeline stages
///
/// ### Setup
/// - **`Created`**: definition exists, nothing resolved yet
/// - **`Begin`**: bookkeeping for an in-flight load is in place
/// - **`ResolveImage`**: the raw binary image and its identity are known
///
/// ### Construction
/// - **`AllocateContext`**: the unit is bound to its owning allocation context
/// - **`AddDependencies`**: referenced units are loaded and cross-context edges recorded
/// - **`PrepareNative`**: native artifacts are carved out of the context's arenas
///
/// ### Publication
/// - **`DeliverNotifications`**: observers have been told the unit is usable
/// - **`Loaded`**: the unit's runtime object exists
/// - **`Active`**: terminal; the unit is immutable and its load lock is retired
#[repr(u8)]
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash, Display, EnumIter, EnumCount, FromRepr,
)]
pub enum LoadLevel {
    /// Initial level (0) - the unit has been defined but no work has run.
    ///
    /// Units sit here between `define_unit` and the first `request_level` call.
    /// This is never a work level; the pipeline's first unit of work targets
    /// [`LoadLevel::Begin`].
    Created = 0x00,

    /// Begin (1) - in-flight load bookkeeping is established.
    ///
    /// Marks the unit as having entered the pipeline. After this level the unit is
    /// visible to loading-state queries as "in progress" whenever a load lock exists.
    Begin = 0x01,

    /// Resolve-Image (2) - the unit's binary image has been resolved.
    ///
    /// The host's resolver supplied the raw bytes, module version id and declared
    /// dependency names; the image digest is recorded as part of the unit's identity.
    /// An empty image permanently fails the unit at this level.
    ResolveImage = 0x02,

    /// Allocate-Context (3) - the unit is bound to its owning allocation context.
    ///
    /// Collectible units receive a freshly published context (or join the context
    /// chosen at definition time); non-collectible units bind to the domain's global
    /// context.
    AllocateContext = 0x03,

    /// Add-Dependencies (4) - referenced units are loaded and reference edges exist.
    ///
    /// Each declared dependency is driven through the pipeline under the current
    /// thread's level ceiling, and a cross-context reference edge is recorded for
    /// every collectible dependency so the dependency's context outlives this one.
    AddDependencies = 0x04,

    /// Prepare-Native (5) - native artifacts are allocated from the context's arenas.
    ///
    /// Metadata table space, code and an entry stub are carved out of the owning
    /// context's arena set. Arena exhaustion here is transient and the level is
    /// retried on the next request.
    PrepareNative = 0x05,

    /// Deliver-Notifications (6) - load observers have run.
    ///
    /// The only level whose work happens *after* the level completes and the lock
    /// acquisition is released, so observer callbacks may re-enter the pipeline for
    /// the same unit without tripping the deadlock check.
    DeliverNotifications = 0x06,

    /// Loaded (7) - the unit's managed runtime object exists.
    Loaded = 0x07,

    /// Active (8) - terminal level; the unit is read-only from here on.
    ///
    /// Completing this level unlinks the unit's load lock from the in-flight
    /// registry. A unit also parks its lock at this level when it fails permanently,
    /// so no further acquisition can succeed.
    Active = 0x08,
}

impl LoadLevel {
    /// The terminal level of the pipeline.
    pub const TERMINAL: LoadLevel = LoadLevel::Active;

    /// Returns the level after this one, or `None` at the terminal level.
    #[must_use]
    pub fn next(self) -> Option<LoadLevel> {
        LoadLevel::from_repr(self as u8 + 1)
    }

    /// Returns the level before this one, or `None` at [`LoadLevel::Created`].
    #[must_use]
    pub fn previous(self) -> Option<LoadLevel> {
        (self as u8).checked_sub(1).and_then(LoadLevel::from_repr)
    }

    /// `true` only for [`LoadLevel::Active`].
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == LoadLevel::TERMINAL
    }

    /// Decodes a raw level word, falling back to [`LoadLevel::Created`] for
    /// out-of-range values.
    pub(crate) fn from_word(word: u8) -> LoadLevel {
        LoadLevel::from_repr(word).unwrap_or(LoadLevel::Created)
    }
}
