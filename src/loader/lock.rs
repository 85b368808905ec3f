use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Condvar, Mutex,
    },
    thread::{self, ThreadId},
};

use crate::{
    loader::{LoadLevel, UnitId},
    Error, Result,
};

/// How an acquisition attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcquireOutcome {
    /// The caller now holds the lock and owns the work for its level.
    Acquired,
    /// Another thread already pushed the lock to or past the requested level. The
    /// caller re-reads the unit's state instead of doing work.
    Satisfied,
    /// Blocking would have closed a hold/wait cycle. The caller backs off and lets
    /// the thread that holds the lock make progress.
    DeadlockAvoided,
}

/// Progression lock for one unit's walk through the load levels.
///
/// The lock tracks the highest level any thread has *completed*, which is deliberately
/// separate from the unit's own level: a failed step still completes here (so waiters
/// stop queueing for work that will never succeed) while the unit level only advances
/// on success.
pub(crate) struct LoadLock {
    unit: UnitId,
    level: AtomicU8,
}

impl LoadLock {
    pub(crate) fn new(unit: UnitId) -> Arc<LoadLock> {
        Arc::new(LoadLock {
            unit,
            level: AtomicU8::new(LoadLevel::Created as u8),
        })
    }

    pub(crate) fn unit(&self) -> UnitId {
        self.unit
    }

    /// Highest level any thread has completed under this lock.
    pub(crate) fn level(&self) -> LoadLevel {
        LoadLevel::from_word(self.level.load(Ordering::Acquire))
    }

    /// Records that the work for `level` ran. Monotonic; completions never regress.
    pub(crate) fn complete(&self, level: LoadLevel) {
        self.level.fetch_max(level as u8, Ordering::AcqRel);
    }
}

/// Who holds and who awaits each unit's load lock, kept consistent under one mutex so
/// a hold/wait cycle can be detected before a thread blocks.
struct WaitGraph {
    /// Unit whose lock is held, by which thread. A thread may hold several (nested
    /// dependency loads).
    holders: HashMap<UnitId, ThreadId>,
    /// Unit each blocked thread is waiting for. A blocked thread waits on exactly one.
    waiters: HashMap<ThreadId, UnitId>,
}

/// Domain-wide acquisition table for unit load locks.
///
/// Acquisition is deadlock-aware: before blocking on a held lock, the caller walks the
/// holder's own wait chain. If that chain leads back to the caller (directly, when the
/// caller already holds the lock it asks for, or through any number of hops) the
/// attempt returns [`AcquireOutcome::DeadlockAvoided`] instead of blocking, and the
/// pipeline's one-level-short tolerance absorbs the skipped step.
///
/// # Thread Safety
///
/// All bookkeeping lives under a single mutex paired with one condvar; waiters are
/// woken whenever any lock is left.
pub(crate) struct LockTable {
    state: Mutex<WaitGraph>,
    available: Condvar,
}

impl LockTable {
    pub(crate) fn new() -> LockTable {
        LockTable {
            state: Mutex::new(WaitGraph {
                holders: HashMap::new(),
                waiters: HashMap::new(),
            }),
            available: Condvar::new(),
        }
    }

    /// Acquires `lock` for the work of `target`, blocking while another thread makes
    /// progress unless blocking would deadlock.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] if the table mutex is poisoned.
    pub(crate) fn acquire(&self, lock: &LoadLock, target: LoadLevel) -> Result<AcquireOutcome> {
        let me = thread::current().id();
        let unit = lock.unit();
        let mut state = self.state.lock().map_err(|_| Error::LockError)?;

        loop {
            if lock.level() >= target {
                return Ok(AcquireOutcome::Satisfied);
            }
            if !state.holders.contains_key(&unit) {
                state.holders.insert(unit, me);
                return Ok(AcquireOutcome::Acquired);
            }
            if state.closes_cycle(unit, me) {
                tracing::debug!(
                    target: "dotload::loader",
                    %unit,
                    ?target,
                    "lock wait would deadlock, backing off"
                );
                return Ok(AcquireOutcome::DeadlockAvoided);
            }

            state.waiters.insert(me, unit);
            state = self.available.wait(state).map_err(|_| Error::LockError)?;
            state.waiters.remove(&me);
        }
    }

    /// Releases the hold on `unit` and wakes every waiter to re-evaluate.
    ///
    /// # Errors
    ///
    /// [`Error::LockError`] if the table mutex is poisoned.
    pub(crate) fn leave(&self, unit: UnitId) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| Error::LockError)?;
        let holder = state.holders.remove(&unit);
        debug_assert_eq!(
            holder,
            Some(thread::current().id()),
            "left a lock this thread does not hold"
        );
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    #[cfg(test)]
    fn waiter_count(&self) -> usize {
        self.state.lock().map(|s| s.waiters.len()).unwrap_or(0)
    }
}

impl WaitGraph {
    /// Whether `me` blocking on `unit` would close a hold/wait cycle.
    fn closes_cycle(&self, unit: UnitId, me: ThreadId) -> bool {
        let mut visited = 0usize;
        let mut current = unit;
        while let Some(&holder) = self.holders.get(&current) {
            if holder == me {
                return true;
            }
            match self.waiters.get(&holder) {
                Some(&next) => current = next,
                None => return false,
            }
            // Chains are bounded by live threads; bail out rather than spin if the
            // graph is somehow corrupt.
            visited += 1;
            if visited > self.holders.len() + self.waiters.len() {
                return true;
            }
        }
        false
    }
}

/// RAII hold on a unit's load lock; leaving happens on drop, after the level outcome
/// has been recorded.
pub(crate) struct TableGuard<'a> {
    table: &'a LockTable,
    unit: UnitId,
}

impl<'a> TableGuard<'a> {
    pub(crate) fn new(table: &'a LockTable, unit: UnitId) -> TableGuard<'a> {
        TableGuard { table, unit }
    }
}

impl Drop for TableGuard<'_> {
    fn drop(&mut self) {
        // A poisoned table mutex is already a crate-wide failure; nothing to do here.
        let _ = self.table.leave(self.unit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unit(word: u64) -> UnitId {
        UnitId(word)
    }

    #[test]
    fn first_acquire_wins_and_completion_satisfies_the_rest() {
        let table = LockTable::new();
        let lock = LoadLock::new(unit(1));

        assert_eq!(
            table.acquire(&lock, LoadLevel::Begin).unwrap(),
            AcquireOutcome::Acquired
        );
        lock.complete(LoadLevel::Begin);
        table.leave(unit(1)).unwrap();

        assert_eq!(
            table.acquire(&lock, LoadLevel::Begin).unwrap(),
            AcquireOutcome::Satisfied
        );
    }

    #[test]
    fn completions_never_regress() {
        let lock = LoadLock::new(unit(2));
        lock.complete(LoadLevel::AllocateContext);
        lock.complete(LoadLevel::Begin);
        assert_eq!(lock.level(), LoadLevel::AllocateContext);
    }

    #[test]
    fn reacquiring_a_held_lock_backs_off() {
        let table = LockTable::new();
        let lock = LoadLock::new(unit(3));

        assert_eq!(
            table.acquire(&lock, LoadLevel::Begin).unwrap(),
            AcquireOutcome::Acquired
        );
        assert_eq!(
            table.acquire(&lock, LoadLevel::ResolveImage).unwrap(),
            AcquireOutcome::DeadlockAvoided
        );
        table.leave(unit(3)).unwrap();
    }

    #[test]
    fn waiters_wake_when_the_holder_leaves() {
        let table = Arc::new(LockTable::new());
        let lock = LoadLock::new(unit(4));

        assert_eq!(
            table.acquire(&lock, LoadLevel::Begin).unwrap(),
            AcquireOutcome::Acquired
        );

        let contender = {
            let table = Arc::clone(&table);
            let lock = Arc::clone(&lock);
            thread::spawn(move || table.acquire(&lock, LoadLevel::Begin).unwrap())
        };

        while table.waiter_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        lock.complete(LoadLevel::Begin);
        table.leave(unit(4)).unwrap();

        assert_eq!(contender.join().unwrap(), AcquireOutcome::Satisfied);
    }

    #[test]
    fn cross_thread_hold_wait_cycle_is_detected() {
        let table = Arc::new(LockTable::new());
        let lock_a = LoadLock::new(unit(5));
        let lock_b = LoadLock::new(unit(6));

        // This thread holds A.
        assert_eq!(
            table.acquire(&lock_a, LoadLevel::Begin).unwrap(),
            AcquireOutcome::Acquired
        );

        // The other thread holds B, then blocks on A.
        let other = {
            let table = Arc::clone(&table);
            let lock_a = Arc::clone(&lock_a);
            let lock_b = Arc::clone(&lock_b);
            thread::spawn(move || {
                assert_eq!(
                    table.acquire(&lock_b, LoadLevel::Begin).unwrap(),
                    AcquireOutcome::Acquired
                );
                let outcome = table.acquire(&lock_a, LoadLevel::Begin).unwrap();
                table.leave(unit(6)).unwrap();
                outcome
            })
        };

        while table.waiter_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        // B is held by a thread that waits on A, which this thread holds.
        assert_eq!(
            table.acquire(&lock_b, LoadLevel::Begin).unwrap(),
            AcquireOutcome::DeadlockAvoided
        );

        lock_a.complete(LoadLevel::Begin);
        table.leave(unit(5)).unwrap();
        assert_eq!(other.join().unwrap(), AcquireOutcome::Satisfied);
    }

    #[test]
    fn guard_leaves_on_drop() {
        let table = LockTable::new();
        let lock = LoadLock::new(unit(7));

        assert_eq!(
            table.acquire(&lock, LoadLevel::Begin).unwrap(),
            AcquireOutcome::Acquired
        );
        {
            let _guard = TableGuard::new(&table, unit(7));
        }
        // The slot is free again.
        assert_eq!(
            table.acquire(&lock, LoadLevel::Begin).unwrap(),
            AcquireOutcome::Acquired
        );
        table.leave(unit(7)).unwrap();
    }
}
