//! # dotload Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and
//! traits from the dotload library. Import this module to get quick access to the
//! essential types for driving unit loads and managing allocation contexts.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all dotload operations
pub use crate::Error;

/// The result type used throughout dotload
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// The isolation domain every operation goes through
pub use crate::Domain;

/// Domain tuning knobs
pub use crate::DomainConfig;

/// Operational counters for one domain
pub use crate::DomainStats;

// ================================================================================================
// Load Pipeline
// ================================================================================================

/// Readiness levels, in pipeline order
pub use crate::loader::LoadLevel;

/// Loadable units and how they are defined
pub use crate::loader::{LoadableUnit, UnitDefinition, UnitFlags, UnitId};

/// Per-level load products
pub use crate::loader::{NativeArtifacts, UnitImage};

// ================================================================================================
// Allocation Contexts
// ================================================================================================

/// Reference-counted private heaps
pub use crate::context::{AllocationContext, ContextId};

/// Arena allocators and their behaviors
pub use crate::context::{Arena, ArenaBehavior, ArenaKind};

/// Handle tables anchoring managed objects
pub use crate::context::{HandleTable, LoaderHandle};

/// Address-to-context resolution
pub use crate::context::RangeMap;

/// What a collection pass swept
pub use crate::context::CollectionSummary;

// ================================================================================================
// Embedding Interface
// ================================================================================================

/// Services the engine requires from its host runtime
pub use crate::RuntimeHost;

/// Teardown event callbacks
pub use crate::UnloadObserver;

/// Host-facing value types
pub use crate::{ObjectRef, ResolvedImage};

/// Unit identity values
pub use crate::Guid;
