//! Allocation contexts: reference-counted private heaps with cycle collection.
//!
//! Everything a loadable unit allocates at load time lives in an allocation context.
//! Units that can never unload share long-lived contexts whose memory is simply never
//! reclaimed; collectible units each own a context whose lifetime is governed by a
//! reference count plus a mark-and-sweep pass over the context graph, so groups of
//! contexts that only keep each other alive still go away.
//!
//! # Key Components
//!
//! - [`crate::context::AllocationContext`] - One context: reference count, arenas,
//!   handle table, and outgoing reference edges
//! - [`crate::context::Arena`] - Append-only bump allocator committing memory
//!   step-wise from a bounded reserve
//! - [`crate::context::HandleTable`] - Growable slots anchoring managed objects, with
//!   free-list reuse and compare-and-swap updates
//! - [`crate::context::RangeMap`] - Lock-free address index answering which context
//!   owns a committed chunk
//! - [`crate::context::CollectionSummary`] - What a collection pass swept
//!
//! # Lifecycle
//!
//! A collectible context is created unpublished, receives its managed wrapper object
//! and anchor handle, and is published (count goes to one) before the domain registry
//! ever sees it. Reference edges between contexts are deduplicated and each carries
//! exactly one count, which is what lets a collection pass subtract edge-held counts
//! from the total and recognize externally-held contexts as roots.
//!
//! Collection itself is planned as a pure function over a consistent snapshot taken
//! under the domain's graph lock; the sweep tears each doomed context down in a fixed
//! order (condemn, unit notifications, range removal, quiesce, storage release,
//! resume) so observers never see a half-dead context serving new work.

mod allocation;
mod arena;
mod collector;
mod handles;
mod range;

pub use allocation::{AllocationContext, ContextId};
pub use arena::{Arena, ArenaBehavior, ArenaKind};
pub use collector::CollectionSummary;
pub use handles::{HandleTable, LoaderHandle};
pub use range::RangeMap;

pub(crate) use arena::ArenaAlloc;
pub(crate) use collector::{apply_marks, plan_collection, ContextSnapshot, QuiesceScope};
