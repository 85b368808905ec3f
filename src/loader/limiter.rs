//! Thread-scoped load-level ceiling.
//!
//! Recursive work performed while advancing a unit to level L must never drive another
//! unit past L − 1 on the same call chain, or two units loading each other could block
//! forever. Before a thread starts the work for one level it pushes a ceiling; every
//! nested load request on that thread silently clamps its target to the ceiling, and the
//! guard restores the previous value on drop. Callers of a clamped request receive a unit
//! one level short and re-request later if they still need more.

use std::cell::Cell;

use crate::loader::LoadLevel;

// u8::MAX means "no ceiling": the thread is not inside level work.
thread_local! {
    static LEVEL_CEILING: Cell<u8> = const { Cell::new(u8::MAX) };
}

/// RAII guard holding a lowered load-level ceiling for the current thread.
///
/// Created via [`CeilingGuard::push`] right before performing one level of work;
/// dropping the guard restores the previous ceiling. Guards nest: an inner push can
/// only lower the ceiling, never raise it.
pub(crate) struct CeilingGuard {
    previous: u8,
}

impl CeilingGuard {
    /// Lowers the thread's ceiling for the duration of work at `work_level`.
    ///
    /// Nested requests are limited to one level below the level being worked, so a
    /// dependency cycle converges instead of deadlocking.
    pub(crate) fn push(work_level: LoadLevel) -> CeilingGuard {
        let ceiling = (work_level as u8).saturating_sub(1);
        let previous = LEVEL_CEILING.with(|cell| {
            let previous = cell.get();
            cell.set(ceiling.min(previous));
            previous
        });
        CeilingGuard { previous }
    }
}

impl Drop for CeilingGuard {
    fn drop(&mut self) {
        LEVEL_CEILING.with(|cell| cell.set(self.previous));
    }
}

/// Clamps a requested target to the current thread's ceiling.
pub(crate) fn clamp(target: LoadLevel) -> LoadLevel {
    let ceiling = LEVEL_CEILING.with(Cell::get);
    if (target as u8) > ceiling {
        LoadLevel::from_word(ceiling)
    } else {
        target
    }
}
