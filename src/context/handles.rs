use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use crate::{host::ObjectRef, Error, Result};

/// An index into an allocation context's [`HandleTable`].
///
/// Loader handles anchor managed objects on behalf of the owning context: as long as
/// the slot holds an object reference, the underlying object-heap GC treats that
/// object as reachable. Handles are plain integers so they can be stored in native
/// structures without owning semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoaderHandle(pub(crate) u32);

impl LoaderHandle {
    /// The raw slot index of this handle.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Growable table of managed-object slots owned by one allocation context.
///
/// The slot array only ever appends; released slot indices go onto a free-list stack
/// and are reused before the array grows again. Slot reads are lock-free, and slot
/// updates use atomic compare-and-swap so racing writers never observe torn values.
/// A slot is nulled before its index is recycled, making the previously anchored
/// object collectible by the object-heap GC.
///
/// The whole table is released only when its owning context is torn down.
///
/// # Thread Safety
///
/// All operations take `&self` and are safe to call concurrently. Allocation and
/// release serialize on the free-list lock; reads and compare-and-swap updates do
/// not block.
pub struct HandleTable {
    slots: boxcar::Vec<AtomicU64>,
    free: Mutex<Vec<u32>>,
}

impl HandleTable {
    /// Creates an empty table with room for `capacity` slots before reallocation.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> HandleTable {
        HandleTable {
            slots: boxcar::Vec::with_capacity(capacity),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Allocates a slot holding `object` and returns its handle.
    ///
    /// Reuses the most recently freed slot when one exists, otherwise appends a new
    /// slot to the table.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockError`] if the free-list lock is poisoned.
    pub fn allocate(&self, object: ObjectRef) -> Result<LoaderHandle> {
        if let Some(index) = self.free.lock().map_err(|_| Error::LockError)?.pop() {
            match self.slots.get(index as usize) {
                Some(slot) => slot.store(object.raw(), Ordering::Release),
                None => return Err(Error::InvalidHandle(index)),
            }
            return Ok(LoaderHandle(index));
        }

        let index = self.slots.push(AtomicU64::new(object.raw()));
        debug_assert!(index <= u32::MAX as usize, "handle table exceeded u32 slots");
        Ok(LoaderHandle(index as u32))
    }

    /// Reads the object currently anchored by `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the slot was never allocated by this table.
    pub fn get(&self, handle: LoaderHandle) -> Result<ObjectRef> {
        self.slots
            .get(handle.0 as usize)
            .map(|slot| ObjectRef::new(slot.load(Ordering::Acquire)))
            .ok_or(Error::InvalidHandle(handle.0))
    }

    /// Unconditionally stores `object` into the slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the slot was never allocated by this table.
    pub fn store(&self, handle: LoaderHandle, object: ObjectRef) -> Result<()> {
        self.slots
            .get(handle.0 as usize)
            .map(|slot| slot.store(object.raw(), Ordering::Release))
            .ok_or(Error::InvalidHandle(handle.0))
    }

    /// Stores `object` only if the slot still holds `expected`, returning whether the
    /// swap happened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the slot was never allocated by this table.
    pub fn compare_set(
        &self,
        handle: LoaderHandle,
        expected: ObjectRef,
        object: ObjectRef,
    ) -> Result<bool> {
        let slot = self
            .slots
            .get(handle.0 as usize)
            .ok_or(Error::InvalidHandle(handle.0))?;
        Ok(slot
            .compare_exchange(
                expected.raw(),
                object.raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok())
    }

    /// Releases `handle`, nulling its slot and pushing the index onto the free list.
    ///
    /// The anchored object becomes collectible by the object-heap GC as soon as the
    /// slot is nulled. A slot that is already null was not live, so double releases
    /// are rejected before they can corrupt the free list.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandle`] if the slot was never allocated by this table
    /// or holds no object, or [`Error::LockError`] if the free-list lock is poisoned.
    pub fn release(&self, handle: LoaderHandle) -> Result<()> {
        let slot = self
            .slots
            .get(handle.0 as usize)
            .ok_or(Error::InvalidHandle(handle.0))?;
        if slot.swap(ObjectRef::NULL.raw(), Ordering::AcqRel) == ObjectRef::NULL.raw() {
            return Err(Error::InvalidHandle(handle.0));
        }
        self.free
            .lock()
            .map_err(|_| Error::LockError)?
            .push(handle.0);
        Ok(())
    }

    /// Number of slots the table has ever grown to, including freed ones.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.count()
    }

    /// Nulls every slot. Called during context teardown, after which the table is
    /// dropped along with its context.
    pub(crate) fn clear(&self) {
        for (_, slot) in self.slots.iter() {
            slot.store(ObjectRef::NULL.raw(), Ordering::Release);
        }
    }
}
