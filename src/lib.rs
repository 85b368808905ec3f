// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(dead_code)]

//! # dotload
//!
//! [![Crates.io](https://img.shields.io/crates/v/dotload.svg)](https://crates.io/crates/dotload)
//! [![Documentation](https://docs.rs/dotload/badge.svg)](https://docs.rs/dotload)
//! [![License](https://img.shields.io/badge/license-Apache--2.0-blue.svg)](https://github.com/BinFlip/dotload/blob/main/LICENSE-APACHE)
//!
//! A thread-safe lifecycle engine for loadable code units. `dotload` drives units
//! through an incremental pipeline of readiness levels, serializing each unit's work
//! without ever deadlocking on dependency cycles, and manages the memory behind them
//! in reference-counted allocation contexts that a cycle-aware collector can unload.
//!
//! ## Features
//!
//! - **📈 Incremental loading** - Units advance one readiness level at a time and every
//!   intermediate state is a valid resting point
//! - **🔒 Deadlock-free by construction** - Lock acquisition detects hold/wait cycles up
//!   front and backs off instead of blocking
//! - **🧵 Concurrent everywhere** - Any number of threads may request any unit at any
//!   level; per unit, each level's work still runs exactly once
//! - **♻️ Unloadable contexts** - Collectible allocation contexts unload when
//!   unreferenced, even when they only keep each other alive
//! - **📌 Exact teardown order** - Observers watch a fixed condemn/notify/release
//!   sequence, never a half-dead context serving new work
//! - **🛡️ Sticky failures** - A unit that fails permanently fails the same way forever;
//!   transient trouble is simply retried
//!
//! ## Quick Start
//!
//! Add `dotload` to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! dotload = "0.1"
//! ```
//!
//! ### Using the Prelude
//!
//! For convenient access to the most commonly used types, import the prelude:
//!
//! ```rust
//! use dotload::prelude::*;
//!
//! let config = DomainConfig::default();
//! assert!(config.collect_on_release);
//! assert_eq!(LoadLevel::Created.next(), Some(LoadLevel::Begin));
//! ```
//!
//! ### Basic Usage
//!
//! The embedder supplies a [`RuntimeHost`] that resolves unit names to images and
//! mints managed objects; everything else is driven through a [`Domain`]:
//!
//! ```rust
//! use std::sync::Arc;
//! use dotload::{
//!     ContextId, Domain, DomainConfig, LoadLevel, LoadableUnit, ObjectRef, ResolvedImage,
//!     Result, RuntimeHost, UnitDefinition,
//! };
//!
//! struct FlatHost;
//!
//! impl RuntimeHost for FlatHost {
//!     fn resolve_image(&self, unit: &str) -> Result<ResolvedImage> {
//!         Ok(ResolvedImage {
//!             bytes: unit.as_bytes().to_vec(),
//!             identity: None,
//!             dependencies: Vec::new(),
//!         })
//!     }
//!
//!     fn create_context_wrapper(&self, context: ContextId) -> Result<ObjectRef> {
//!         Ok(ObjectRef::new(0x1000 + context.raw()))
//!     }
//!
//!     fn create_unit_object(&self, unit: &LoadableUnit) -> Result<ObjectRef> {
//!         Ok(ObjectRef::new(0x2000 + unit.id().raw()))
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let domain = Domain::new("default", Arc::new(FlatHost), DomainConfig::default());
//!
//! // A collectible unit gets its own allocation context.
//! let plugin = domain.define_unit(UnitDefinition::new("plugin.alpha").collectible())?;
//! domain.request_level(&plugin, LoadLevel::Active)?;
//! assert!(plugin.is_active());
//!
//! // Dropping the context's last reference unloads the plugin and frees its memory.
//! let context = plugin.context().unwrap();
//! domain.release(context)?;
//! assert!(domain.unit(plugin.id()).is_err());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! `dotload` is organized into several key modules:
//!
//! - [`prelude`] - Convenient re-exports of commonly used types and traits
//! - [`loader`] - Loadable units, readiness levels and the load pipeline
//! - [`context`] - Allocation contexts, arenas, handle tables and the collector
//! - [`domain`] - The isolation domain tying both halves together
//! - [`Error`] and [`Result`] - Comprehensive error handling
//!
//! ### The Load Pipeline
//!
//! Every unit moves through the same sequence of levels: begin, image resolution,
//! context allocation, dependency loading, native preparation, notification delivery,
//! final construction, activation. The engine guarantees:
//!
//! - **Monotonic progress**: a unit's level never goes backward
//! - **Exactly-once work**: each level's work runs on one thread, no matter how many
//!   threads are asking
//! - **Bounded recursion**: dependency loads triggered from level work are clamped one
//!   level below their trigger, so cyclic unit graphs converge instead of deadlocking
//! - **Honest results**: a request may complete one level short of its target when the
//!   remaining work belongs to another thread; asking again later finishes the job
//!
//! ### Allocation Contexts and Collection
//!
//! Loaded units park their runtime allocations in arena-backed contexts. Collectible
//! contexts are reference counted, and context-to-context references are tracked as
//! explicit edges. A collection pass subtracts edge-held counts from each context's
//! total to find the externally referenced roots, keeps everything they reach, and
//! tears the rest down in a fixed order. Cycles of contexts that only sustain each
//! other are collected as a group.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Errors split into *transient*
//! ones, which leave no trace and may simply be retried, and *permanent* ones, which
//! are cached on the failing unit and re-raised on every later request:
//!
//! ```rust
//! use dotload::Error;
//!
//! fn classify(error: &Error) -> &'static str {
//!     if error.is_transient() {
//!         "retry later"
//!     } else {
//!         "permanent"
//!     }
//! }
//!
//! assert_eq!(classify(&Error::ResourceExhausted("arena full".into())), "retry later");
//! assert_eq!(classify(&Error::Empty), "permanent");
//! ```
//!
//! ## Testing
//!
//! The test suite exercises the concurrency model with real thread interleavings:
//!
//! ```bash
//! cargo test
//! cargo bench  # Pipeline and collection micro-benchmarks
//! ```
#[macro_use]
pub(crate) mod error;
pub(crate) mod config;
pub(crate) mod host;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// This module provides a curated selection of the most frequently used types
/// from across the dotload library, allowing for convenient glob imports.
///
/// # Example
///
/// ```rust
/// use dotload::prelude::*;
///
/// // Now you have access to the most common types
/// let definition = UnitDefinition::new("app.core").collectible();
/// assert!(definition.is_collectible());
/// ```
pub mod prelude;

/// Loadable units and the level-based load pipeline.
///
/// This module contains everything that moves a unit from defined to active: the
/// [`loader::LoadLevel`] sequence, the [`loader::LoadableUnit`] state it is recorded
/// on, and the per-level products the pipeline attaches along the way.
///
/// # Key Components
///
/// - [`loader::LoadLevel`] - The readiness levels, in pipeline order
/// - [`loader::LoadableUnit`] - One unit's identity, level, flags and products
/// - [`loader::UnitDefinition`] - How a unit enters a domain
///
/// # Example
///
/// ```rust
/// use dotload::loader::LoadLevel;
///
/// // Levels form a fixed forward-only sequence.
/// assert!(LoadLevel::Begin < LoadLevel::Loaded);
/// assert_eq!(LoadLevel::Loaded.next(), Some(LoadLevel::Active));
/// assert!(LoadLevel::Active.is_terminal());
/// ```
pub mod loader;

/// Allocation contexts: reference-counted private heaps with cycle collection.
///
/// This module owns the memory side of the engine: arena allocators that commit
/// memory step-wise from a bounded reserve, handle tables that anchor managed
/// objects, the address range index, and the planner behind collection passes.
///
/// # Key Components
///
/// - [`context::AllocationContext`] - One context: count, arenas, handles, edges
/// - [`context::ArenaKind`] - The three arena behaviors a context carries
/// - [`context::CollectionSummary`] - What a collection pass swept
///
/// # Example
///
/// ```rust
/// use dotload::context::ArenaKind;
///
/// // Each arena kind has fixed allocation behavior.
/// let behavior = ArenaKind::Interleaved.behavior();
/// assert_eq!(behavior.stub_size, Some(32));
/// assert!(ArenaKind::Executable.behavior().stub_size.is_none());
/// ```
pub mod context;

/// Isolation domains: one namespace of units, contexts and locks.
///
/// The [`domain::Domain`] is the crate's main entry point; see its type-level
/// documentation for a complete usage example.
pub mod domain;

/// `dotload` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always
/// [`Error`]. This is used consistently throughout the crate for all fallible
/// operations.
///
/// # Examples
///
/// ```rust
/// use dotload::{Result, UnitDefinition};
///
/// fn describe(definition: &UnitDefinition) -> Result<String> {
///     Ok(format!("unit '{}'", definition.name()))
/// }
/// # assert!(describe(&UnitDefinition::new("app.core")).is_ok());
/// ```
pub type Result<T> = std::result::Result<T, Error>;

/// `dotload` Error type
///
/// The main error type for all operations in this crate. Provides detailed error
/// information for load failures, reference counting misuse, and resource limits.
///
/// # Examples
///
/// ```rust
/// use dotload::Error;
///
/// fn report(error: &Error) {
///     match error {
///         Error::LoadInProgress { unit, current, target } => {
///             println!("{unit} is at {current}, wanted {target}")
///         }
///         Error::LoadFailed { message, .. } => println!("failed: {message}"),
///         other => println!("{other}"),
///     }
/// }
/// ```
pub use error::Error;

/// Main entry point for driving unit loads and managing contexts.
///
/// See [`domain::Domain`] for the full API and a usage example.
pub use domain::{Domain, DomainStats};

/// Tunables for one isolation domain.
///
/// # Example
///
/// ```rust
/// use dotload::DomainConfig;
///
/// let compact = DomainConfig::compact();
/// assert!(compact.collectible_reserve < DomainConfig::default().collectible_reserve);
/// ```
pub use config::DomainConfig;

/// The embedding interface: image resolution, managed objects, unload events.
///
/// - [`RuntimeHost`] - Services the engine requires from its embedder
/// - [`UnloadObserver`] - Callbacks around context teardown
/// - [`ObjectRef`] - Opaque reference to a managed object
/// - [`ResolvedImage`] - What the host's resolver produced for a unit name
pub use host::{ObjectRef, ResolvedImage, RuntimeHost, UnloadObserver};

/// Core pipeline types, re-exported from [`loader`].
pub use loader::{LoadLevel, LoadableUnit, UnitDefinition, UnitId};

/// Core context types, re-exported from [`context`].
pub use context::{AllocationContext, ArenaKind, CollectionSummary, ContextId};

/// Globally unique identity carried by unit images.
///
/// Re-exported from [`uguid`](https://docs.rs/uguid) so embedders do not need their
/// own dependency on it.
pub use uguid::Guid;
