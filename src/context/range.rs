use crossbeam_skiplist::SkipMap;
use std::ops::Bound;

use crate::context::ContextId;

struct RangeEntry {
    end: usize,
    owner: ContextId,
}

/// Domain-wide index from committed arena chunks back to the context that owns them.
///
/// Every chunk an arena commits is registered here, so diagnostics and unload checks
/// can answer "whose memory is this address in?" without touching any context lock.
/// Lookups walk a lock-free skip list keyed by chunk start address and never block,
/// which keeps them safe to call from teardown notifications.
pub struct RangeMap {
    ranges: SkipMap<usize, RangeEntry>,
}

impl Default for RangeMap {
    fn default() -> Self {
        RangeMap::new()
    }
}

impl RangeMap {
    /// Creates an empty range map.
    #[must_use]
    pub fn new() -> RangeMap {
        RangeMap {
            ranges: SkipMap::new(),
        }
    }

    /// Records that `[start, start + len)` belongs to `owner`.
    ///
    /// Chunks come from distinct heap allocations, so registered ranges never overlap.
    pub(crate) fn register(&self, start: usize, len: usize, owner: ContextId) {
        if len == 0 {
            return;
        }
        self.ranges.insert(
            start,
            RangeEntry {
                end: start + len,
                owner,
            },
        );
    }

    /// Drops every range registered for `owner`. Runs during context teardown, before
    /// the backing chunks are released.
    pub(crate) fn unregister_owner(&self, owner: ContextId) {
        for entry in self.ranges.iter() {
            if entry.value().owner == owner {
                entry.remove();
            }
        }
    }

    /// The context whose arenas contain `addr`, if any.
    #[must_use]
    pub fn context_owning(&self, addr: usize) -> Option<ContextId> {
        let entry = self.ranges.upper_bound(Bound::Included(&addr))?;
        (addr < entry.value().end).then(|| entry.value().owner)
    }

    /// Number of registered ranges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Whether no ranges are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
