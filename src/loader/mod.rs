//! Loadable units and the level-based load pipeline.
//!
//! A unit is anything the host can resolve to an image and wants brought to life:
//! defined once, then driven through a fixed sequence of readiness levels until it is
//! active. The pipeline is incremental and concurrent by construction. Any number of
//! threads may request any unit at any level; per unit, each level's work still runs
//! exactly once.
//!
//! # Key Components
//!
//! - [`crate::loader::LoadLevel`] - The readiness levels, in pipeline order
//! - [`crate::loader::LoadableUnit`] - One unit's identity, level, flags and
//!   per-level products
//! - [`crate::loader::UnitDefinition`] - How a unit enters the domain
//! - [`crate::loader::UnitImage`] - Resolved image bytes plus identity and declared
//!   dependencies
//!
//! # Concurrency Model
//!
//! Progression is serialized per unit by a load lock in a domain-wide acquisition
//! table. The table detects hold/wait cycles before blocking, and a thread-local
//! level ceiling keeps recursive dependency loads from ever waiting on their own call
//! stack. Both mechanisms surface as the same caller-visible contract: a load request
//! may legitimately return with the unit one level short of the ask.
//!
//! Failures during level work split into transient ones, which leave no trace and are
//! retried on the next request, and permanent ones, which are cached on the unit and
//! re-raised identically forever after.

mod level;
mod limiter;
mod lock;
mod pipeline;
mod unit;

pub use level::LoadLevel;
pub use unit::{LoadableUnit, NativeArtifacts, UnitDefinition, UnitFlags, UnitId, UnitImage};

pub(crate) use lock::{LoadLock, LockTable};
pub(crate) use pipeline::request_level;
