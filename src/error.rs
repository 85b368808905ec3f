use thiserror::Error;

use crate::{context::ContextId, loader::LoadLevel, loader::UnitId};

macro_rules! load_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::LoadFailed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::LoadFailed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// This enum covers all error conditions that can occur while driving loadable units through
/// the load-level pipeline and while managing allocation context lifetimes. Each variant
/// provides specific context about the failure mode to enable appropriate error handling.
///
/// Errors split into two behavioral classes, reported by [`Error::is_transient`]:
/// transient errors are never cached and the failed operation may simply be retried, while
/// permanent errors raised during level work are cached on the unit and re-raised identically
/// on every later request for the failed level or above.
///
/// # Error Categories
///
/// ## Pipeline Errors
/// - [`Error::LoadFailed`] - A level's work failed permanently
/// - [`Error::LoadInProgress`] - Unit has not yet reached the requested level (retryable)
/// - [`Error::Empty`] - Resolved image contained no data
/// - [`Error::UnitNotFound`] - Requested unit not present in the registry
/// - [`Error::DuplicateUnit`] - Unit name already defined in this domain
///
/// ## Allocation Context Errors
/// - [`Error::ContextNotFound`] - Requested context not present in the registry
/// - [`Error::AlreadyPublished`] - Context published twice
/// - [`Error::NotPublished`] - Reference operation on an unpublished context
/// - [`Error::ReferenceUnderflow`] - Release without a matching reference
/// - [`Error::NotCollectible`] - Last reference of a non-collectible context released
/// - [`Error::InvalidHandle`] - Handle index outside the slot table
///
/// ## Resource and Synchronization Errors
/// - [`Error::ResourceExhausted`] - Arena reserve or similar budget exhausted (retryable)
/// - [`Error::LockError`] - Thread synchronization failure
///
/// # Examples
///
/// ```rust,no_run
/// use dotload::{Domain, Error, LoadLevel, UnitDefinition};
/// # fn demo(domain: &Domain) {
/// let unit = match domain.define_unit(UnitDefinition::new("app.core")) {
///     Ok(unit) => unit,
///     Err(Error::DuplicateUnit(name)) => {
///         eprintln!("'{name}' already defined");
///         return;
///     }
///     Err(e) => {
///         eprintln!("definition failed: {e}");
///         return;
///     }
/// };
///
/// match domain.request_level(&unit, LoadLevel::Active) {
///     Ok(level) => println!("reached {level}"),
///     Err(e) if e.is_transient() => println!("retry later: {e}"),
///     Err(e) => println!("permanent failure: {e}"),
/// }
/// # }
/// ```
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Pipeline Errors
    /// A level's work failed for a non-transient reason.
    ///
    /// Raised during incremental load work and cached on the failing unit: every later
    /// request for the failed level or above re-surfaces a clone of this value without
    /// re-running any work. The error includes the source location where the failure
    /// was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what failed
    /// * `file` - Source file in which the failure was detected
    /// * `line` - Source line in which the failure was detected
    #[error("Load failed - {file}:{line}: {message}")]
    LoadFailed {
        /// The message to be printed for the failure
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// The unit has not yet reached the requested level.
    ///
    /// Returned when a load stopped more than one level short of the request, either
    /// because another thread still holds the in-flight lock or because the anti-deadlock
    /// ceiling clamped a nested load. This is a retryable condition, not a load failure:
    /// re-request once the competing load has progressed.
    #[error("Unit {unit} is still loading - reached {current}, requested {target}")]
    LoadInProgress {
        /// The unit that is still in flight
        unit: UnitId,
        /// The level the unit had reached when the request returned
        current: LoadLevel,
        /// The level the caller asked for
        target: LoadLevel,
    },

    /// Resolved image was empty.
    ///
    /// The host's image resolution callback returned zero bytes where actual unit
    /// data was expected. Cached as a permanent failure on the unit.
    #[error("Provided image was empty")]
    Empty,

    /// Failed to find unit in the registry.
    ///
    /// The associated [`crate::UnitId`] identifies which unit was not found. Raised for
    /// operations on units that were never defined or whose owning context has already
    /// been torn down.
    #[error("Failed to find unit in registry - {0}")]
    UnitNotFound(UnitId),

    /// A unit with this name is already defined in the domain.
    ///
    /// Unit names are unique per isolation domain; defining a second unit under an
    /// existing name is rejected instead of silently aliasing the first.
    #[error("A unit named '{0}' is already defined")]
    DuplicateUnit(String),

    // Allocation Context Errors
    /// Failed to find allocation context in the registry.
    ///
    /// The associated [`crate::ContextId`] identifies which context was not found.
    /// Contexts leave the registry when a collection pass sweeps them.
    #[error("Failed to find allocation context in registry - {0}")]
    ContextNotFound(ContextId),

    /// The allocation context was already published.
    ///
    /// Publishing moves a context from its uninitialized sentinel state to reference
    /// count 1 exactly once; a second publish indicates a caller bug.
    #[error("Allocation context {0} was already published")]
    AlreadyPublished(ContextId),

    /// Reference operation on a context that has not been published.
    ///
    /// A context becomes subject to `add_reference`/`release` only after its first
    /// external holder publishes it.
    #[error("Allocation context {0} has not been published")]
    NotPublished(ContextId),

    /// A release had no matching reference.
    ///
    /// The context's reference count was already zero; this indicates an unbalanced
    /// `release` call by the holder.
    #[error("Reference count underflow on allocation context {0}")]
    ReferenceUnderflow(ContextId),

    /// Attempted to drop the last reference of a non-collectible context.
    ///
    /// Non-collectible contexts live for the whole process and never decrement
    /// below one.
    #[error("Allocation context {0} is not collectible and keeps its final reference")]
    NotCollectible(ContextId),

    /// Handle index outside the slot table.
    ///
    /// The associated value is the offending slot index. Raised when reading, updating
    /// or releasing a handle that this table never allocated.
    #[error("Handle slot {0} is outside the slot table")]
    InvalidHandle(u32),

    // Resource and Synchronization Errors
    /// A bounded resource was exhausted.
    ///
    /// Typically the reserved address budget of an arena. This condition is transient:
    /// the triggering request is not cached as a unit failure and may be retried.
    #[error("Resource exhaustion - {0}")]
    ResourceExhausted(String),

    /// Generic error for miscellaneous failures.
    ///
    /// Used for errors that don't fit into other categories or for wrapping host-side
    /// failures with additional context.
    #[error("{0}")]
    Error(String),

    /// Failed to lock target.
    ///
    /// This error occurs when thread synchronization fails, typically
    /// when trying to acquire a mutex or rwlock that is in an invalid state.
    #[error("Failed to lock target")]
    LockError,
}

impl Error {
    /// Returns `true` for conditions that are safe to retry and are never cached on a unit.
    ///
    /// Transient errors cover momentary resource exhaustion and loads that are still in
    /// flight on another thread. Everything else raised during level work is classified
    /// as permanent and cached at the failing level.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use dotload::Error;
    ///
    /// assert!(Error::ResourceExhausted("arena reserve".into()).is_transient());
    /// assert!(!Error::Empty.is_transient());
    /// ```
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ResourceExhausted(_) | Error::LoadInProgress { .. }
        )
    }
}
