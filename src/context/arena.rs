use crate::{Error, Result};

/// The flavors of heap arena an allocation context owns.
///
/// Arena behavior differs by what the carved-out memory is for, selected once at
/// construction from a small behavior table rather than through subtyping:
///
/// - **`Plain`**: metadata structures, byte-aligned bookkeeping
/// - **`Executable`**: generated code, aligned for instruction boundaries
/// - **`Interleaved`**: fixed-size dispatch stubs laid out in pre-generated page pairs,
///   where the code half of each pair is filled at commit time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaKind {
    /// General metadata allocations.
    Plain,
    /// Code allocations with instruction alignment.
    Executable,
    /// Fixed-size stub allocations in pre-generated code/data page pairs.
    Interleaved,
}

/// Commit and allocation behavior for one [`ArenaKind`].
#[derive(Debug, Clone, Copy)]
pub struct ArenaBehavior {
    /// Pages committed together per growth step.
    pub granule_pages: usize,
    /// Alignment applied to every allocation.
    pub alignment: usize,
    /// Fixed allocation unit for stub arenas; `None` for byte-sized arenas.
    pub stub_size: Option<usize>,
    /// Generator run over each committed code page, given the page and stub size.
    pub fill_page: Option<fn(&mut [u8], usize)>,
}

/// Size of one dispatch stub in an interleaved arena.
const STUB_SIZE: usize = 32;

impl ArenaKind {
    /// The behavior table entry for this kind.
    #[must_use]
    pub fn behavior(self) -> ArenaBehavior {
        match self {
            ArenaKind::Plain => ArenaBehavior {
                granule_pages: 1,
                alignment: 8,
                stub_size: None,
                fill_page: None,
            },
            ArenaKind::Executable => ArenaBehavior {
                granule_pages: 1,
                alignment: 16,
                stub_size: None,
                fill_page: None,
            },
            ArenaKind::Interleaved => ArenaBehavior {
                granule_pages: 2,
                alignment: STUB_SIZE,
                stub_size: Some(STUB_SIZE),
                fill_page: Some(write_stub_slots),
            },
        }
    }
}

// Stamps each stub slot with its slot ordinal so a resolved stub address is
// self-describing; the remainder of the slot stays zeroed until patched.
fn write_stub_slots(page: &mut [u8], stub_size: usize) {
    let mut slot = 0u32;
    let mut offset = 0;
    while offset + stub_size <= page.len() {
        page[offset..offset + 4].copy_from_slice(&slot.to_le_bytes());
        slot += 1;
        offset += stub_size;
    }
}

struct ArenaChunk {
    storage: Box<[u8]>,
    // Bytes handed out to allocations; for interleaved chunks this is the code
    // half of the pair, the data half is only reached at a page offset.
    capacity: usize,
    used: usize,
}

impl ArenaChunk {
    fn base(&self) -> usize {
        self.storage.as_ptr() as usize
    }

    fn remaining(&self) -> usize {
        self.capacity - self.used
    }
}

/// One allocation carved out of an arena.
#[derive(Debug)]
pub(crate) struct ArenaAlloc {
    /// Address of the allocation.
    pub(crate) addr: usize,
    /// Rounded size actually consumed.
    pub(crate) len: usize,
    /// `(start, len)` of a chunk committed to satisfy this allocation, for
    /// registration in the domain's range map.
    pub(crate) fresh_chunk: Option<(usize, usize)>,
}

/// An append-only heap arena: bump allocation out of chunks committed step-wise from a
/// bounded reserve.
///
/// Memory is never returned to the system until the owning context is torn down;
/// freed objects simply stop being referenced. Collectible contexts run with a small
/// reserve to cap the cost of short-lived contexts, while the global context's arenas
/// carry a much larger one.
///
/// The arena itself is not synchronized; it lives behind its owning context's lock.
pub struct Arena {
    kind: ArenaKind,
    reserve_limit: usize,
    commit_step: usize,
    chunks: Vec<ArenaChunk>,
    committed: usize,
    used: usize,
}

impl Arena {
    /// Creates an empty arena of `kind` that may commit up to `reserve_limit` bytes in
    /// steps derived from `commit_granule`.
    #[must_use]
    pub fn new(kind: ArenaKind, reserve_limit: usize, commit_granule: usize) -> Arena {
        let behavior = kind.behavior();
        Arena {
            kind,
            reserve_limit,
            commit_step: behavior.granule_pages * commit_granule.max(1),
            chunks: Vec::new(),
            committed: 0,
            used: 0,
        }
    }

    /// The kind this arena was constructed as.
    #[must_use]
    pub fn kind(&self) -> ArenaKind {
        self.kind
    }

    /// Upper bound on bytes this arena may ever commit.
    #[must_use]
    pub fn reserve_limit(&self) -> usize {
        self.reserve_limit
    }

    /// Bytes committed so far.
    #[must_use]
    pub fn committed_bytes(&self) -> usize {
        self.committed
    }

    /// Bytes handed out to allocations so far.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Bump-allocates `size` bytes, committing a fresh chunk when the current one is
    /// exhausted.
    ///
    /// Stub arenas allocate whole stub slots; `size` may not exceed the stub size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhausted`] (transient) once the reserve cannot cover
    /// the request.
    pub(crate) fn alloc(&mut self, size: usize) -> Result<ArenaAlloc> {
        let behavior = self.kind.behavior();
        let size = match behavior.stub_size {
            Some(stub) => {
                if size > stub {
                    return Err(Error::ResourceExhausted(format!(
                        "{size} byte request exceeds the {stub} byte stub slot"
                    )));
                }
                stub
            }
            None => round_up(size.max(1), behavior.alignment),
        };

        let mut fresh_chunk = None;
        if self.chunks.last().map_or(true, |c| c.remaining() < size) {
            fresh_chunk = Some(self.commit_chunk(size, &behavior)?);
        }
        let Some(chunk) = self.chunks.last_mut() else {
            unreachable!("commit_chunk always leaves a chunk behind");
        };

        let addr = chunk.base() + chunk.used;
        chunk.used += size;
        self.used += size;
        Ok(ArenaAlloc {
            addr,
            len: size,
            fresh_chunk,
        })
    }

    fn commit_chunk(&mut self, size: usize, behavior: &ArenaBehavior) -> Result<(usize, usize)> {
        let wanted = round_up(size.max(self.commit_step), self.commit_step);
        let available = self.reserve_limit - self.committed;
        let step = wanted.min(available);
        // Interleaved arenas commit whole page pairs and hand slots out of the
        // code half only; byte arenas may take a short final chunk.
        let paired = behavior.stub_size.is_some();
        let capacity = if paired {
            (self.commit_step / behavior.granule_pages).min(step)
        } else {
            step
        };
        if capacity < size || (paired && step < wanted) {
            return Err(Error::ResourceExhausted(format!(
                "{:?} arena reserve exhausted: {size} bytes requested, {available} of {} left",
                self.kind, self.reserve_limit
            )));
        }

        let mut storage = vec![0u8; step].into_boxed_slice();
        if let (Some(fill), Some(stub)) = (behavior.fill_page, behavior.stub_size) {
            fill(&mut storage[..capacity], stub);
        }

        let chunk = ArenaChunk {
            storage,
            capacity,
            used: 0,
        };
        let range = (chunk.base(), chunk.storage.len());
        self.committed += step;
        self.chunks.push(chunk);
        Ok(range)
    }

    /// `(start, len)` of every committed chunk.
    pub(crate) fn chunk_ranges(&self) -> Vec<(usize, usize)> {
        self.chunks
            .iter()
            .map(|c| (c.base(), c.storage.len()))
            .collect()
    }

    /// Drops every committed chunk. Only valid during context teardown.
    pub(crate) fn release_chunks(&mut self) {
        self.chunks.clear();
    }
}

fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// The per-context family of arenas, one of each [`ArenaKind`].
pub(crate) struct ArenaSet {
    plain: Arena,
    executable: Arena,
    interleaved: Arena,
}

impl ArenaSet {
    /// Builds the three arenas, each with its own `reserve_limit` budget.
    pub(crate) fn new(reserve_limit: usize, commit_granule: usize) -> ArenaSet {
        ArenaSet {
            plain: Arena::new(ArenaKind::Plain, reserve_limit, commit_granule),
            executable: Arena::new(ArenaKind::Executable, reserve_limit, commit_granule),
            interleaved: Arena::new(ArenaKind::Interleaved, reserve_limit, commit_granule),
        }
    }

    pub(crate) fn arena(&self, kind: ArenaKind) -> &Arena {
        match kind {
            ArenaKind::Plain => &self.plain,
            ArenaKind::Executable => &self.executable,
            ArenaKind::Interleaved => &self.interleaved,
        }
    }

    pub(crate) fn alloc(&mut self, kind: ArenaKind, size: usize) -> Result<ArenaAlloc> {
        match kind {
            ArenaKind::Plain => self.plain.alloc(size),
            ArenaKind::Executable => self.executable.alloc(size),
            ArenaKind::Interleaved => self.interleaved.alloc(size),
        }
    }

    pub(crate) fn committed_bytes(&self) -> usize {
        self.plain.committed_bytes()
            + self.executable.committed_bytes()
            + self.interleaved.committed_bytes()
    }

    pub(crate) fn chunk_ranges(&self) -> Vec<(usize, usize)> {
        let mut ranges = self.plain.chunk_ranges();
        ranges.extend(self.executable.chunk_ranges());
        ranges.extend(self.interleaved.chunk_ranges());
        ranges
    }

    pub(crate) fn release_all(&mut self) {
        self.plain.release_chunks();
        self.executable.release_chunks();
        self.interleaved.release_chunks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation_is_append_only() {
        let mut arena = Arena::new(ArenaKind::Plain, 4096, 1024);
        let a = arena.alloc(24).unwrap();
        let b = arena.alloc(8).unwrap();
        assert!(a.fresh_chunk.is_some());
        assert!(b.fresh_chunk.is_none());
        assert_eq!(b.addr, a.addr + a.len);
        assert_eq!(arena.used_bytes(), a.len + b.len);
    }

    #[test]
    fn alignment_rounds_requests() {
        let mut plain = Arena::new(ArenaKind::Plain, 4096, 1024);
        assert_eq!(plain.alloc(3).unwrap().len, 8);

        let mut code = Arena::new(ArenaKind::Executable, 4096, 1024);
        assert_eq!(code.alloc(17).unwrap().len, 32);
    }

    #[test]
    fn commit_grows_in_granule_steps_until_reserved_limit() {
        let mut arena = Arena::new(ArenaKind::Plain, 2048, 1024);
        arena.alloc(1000).unwrap();
        assert_eq!(arena.committed_bytes(), 1024);

        // Second chunk takes the rest of the reserve.
        arena.alloc(1024).unwrap();
        assert_eq!(arena.committed_bytes(), 2048);

        let err = arena.alloc(1024).unwrap_err();
        assert!(err.is_transient(), "reserve exhaustion must be retryable");
    }

    #[test]
    fn oversized_request_within_reserve_commits_one_large_chunk() {
        let mut arena = Arena::new(ArenaKind::Plain, 16384, 1024);
        let a = arena.alloc(3000).unwrap();
        assert_eq!(a.len, 3000usize.div_ceil(8) * 8);
        assert_eq!(arena.committed_bytes(), 3072);
    }

    #[test]
    fn interleaved_allocates_whole_stub_slots() {
        let mut arena = Arena::new(ArenaKind::Interleaved, 16384, 4096);
        let a = arena.alloc(9).unwrap();
        assert_eq!(a.len, STUB_SIZE);
        assert!(arena.alloc(STUB_SIZE + 1).is_err());
    }

    #[test]
    fn interleaved_pages_are_pregenerated() {
        let mut arena = Arena::new(ArenaKind::Interleaved, 16384, 4096);
        let a = arena.alloc(STUB_SIZE).unwrap();
        let (start, len) = a.fresh_chunk.expect("first alloc commits");
        assert_eq!(len, 2 * 4096);
        assert_eq!(a.addr, start);

        // First stub slot of the code page carries ordinal 0, the next ordinal 1.
        let chunk = &arena.chunks[0].storage;
        assert_eq!(&chunk[0..4], &0u32.to_le_bytes());
        assert_eq!(&chunk[STUB_SIZE..STUB_SIZE + 4], &1u32.to_le_bytes());
        // The data page of the pair stays zeroed.
        assert_eq!(&chunk[4096..4100], &[0, 0, 0, 0]);
    }

    #[test]
    fn stub_slots_never_spill_into_the_data_page() {
        let mut arena = Arena::new(ArenaKind::Interleaved, 16384, 4096);
        let first = arena.alloc(STUB_SIZE).unwrap();
        // One code page holds 128 slots; the 129th must come from a fresh pair.
        for _ in 1..128 {
            assert!(arena.alloc(STUB_SIZE).unwrap().fresh_chunk.is_none());
        }
        let rolled = arena.alloc(STUB_SIZE).unwrap();
        let (start, _) = rolled.fresh_chunk.expect("second pair committed");
        assert_eq!(rolled.addr, start);
        assert!(rolled.addr < first.addr || rolled.addr >= first.addr + 8192);

        for _ in 1..128 {
            arena.alloc(STUB_SIZE).unwrap();
        }
        assert!(arena.alloc(STUB_SIZE).unwrap_err().is_transient());
    }

    #[test]
    fn chunk_ranges_cover_every_allocation() {
        let mut arena = Arena::new(ArenaKind::Plain, 8192, 1024);
        let a = arena.alloc(512).unwrap();
        let b = arena.alloc(2048).unwrap();
        let ranges = arena.chunk_ranges();
        for alloc in [a, b] {
            assert!(ranges
                .iter()
                .any(|&(start, len)| alloc.addr >= start && alloc.addr + alloc.len <= start + len));
        }
    }

    #[test]
    fn release_drops_chunks_but_keeps_accounting() {
        let mut set = ArenaSet::new(4096, 1024);
        set.alloc(ArenaKind::Plain, 100).unwrap();
        set.alloc(ArenaKind::Executable, 100).unwrap();
        assert!(set.committed_bytes() > 0);
        assert_eq!(set.chunk_ranges().len(), 2);

        set.release_all();
        assert!(set.chunk_ranges().is_empty());
        assert_eq!(set.arena(ArenaKind::Plain).used_bytes(), 104);
    }
}
