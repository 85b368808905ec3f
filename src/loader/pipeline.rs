//! The incremental load driver.
//!
//! One request drives one unit toward one target level, a single level at a time.
//! Each level's work runs on exactly one thread under the unit's load lock; other
//! threads asking for the same unit either get satisfied by that thread's completion
//! or, when blocking would close a hold/wait cycle, back off and accept a result one
//! level short. The thread doing the work for level N carries a thread-local ceiling
//! of N − 1 so any load it triggers recursively can never wait on its own stack.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    context::ArenaKind,
    domain::Domain,
    loader::{
        limiter::{self, CeilingGuard},
        lock::{AcquireOutcome, LoadLock, TableGuard},
        LoadLevel, LoadableUnit, NativeArtifacts, UnitFlags, UnitImage,
    },
    Error, Result,
};

/// What a completed piece of level work asks the driver to do next.
enum StepOutcome {
    /// Record the level and keep the normal sequence.
    Completed,
    /// Record the level, release the lock acquisition, *then* run the level's
    /// callbacks. Only notification delivery uses this, so observers can re-enter
    /// the pipeline for the unit they were just told about.
    Release,
}

/// Drives `unit` toward `target`, clamped by the current thread's level ceiling.
///
/// Returns the level actually reached. A result one level short of the (clamped)
/// target is success; more than one short raises [`Error::LoadInProgress`].
pub(crate) fn request_level(
    domain: &Domain,
    unit: &LoadableUnit,
    target: LoadLevel,
) -> Result<LoadLevel> {
    let target = limiter::clamp(target);
    if unit.level() >= target {
        return Ok(unit.level());
    }
    unit.check_no_failure()?;
    load_to(domain, unit, target)?;
    unit.check_no_failure()?;

    let reached = unit.level();
    if reached >= target || target.previous().is_some_and(|p| reached >= p) {
        Ok(reached)
    } else {
        Err(Error::LoadInProgress {
            unit: unit.id(),
            current: reached,
            target,
        })
    }
}

fn load_to(domain: &Domain, unit: &LoadableUnit, target: LoadLevel) -> Result<()> {
    while unit.level() < target {
        unit.check_no_failure()?;
        let Some(work) = unit.level().next() else {
            return Ok(());
        };

        let lock = domain.find_or_create_lock(unit)?;
        match domain.lock_table().acquire(&lock, work)? {
            AcquireOutcome::Acquired => step_one_level(domain, unit, &lock, work)?,
            // Another thread completed this level; re-read the unit and go on.
            AcquireOutcome::Satisfied => continue,
            AcquireOutcome::DeadlockAvoided => {
                debug!(
                    target: "dotload::loader",
                    unit = %unit.id(),
                    level = %work,
                    "level work deferred to the holding thread"
                );
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Performs the work for exactly one level while holding the unit's load lock.
///
/// Completion is recorded on the lock even when the work fails, so waiters stop
/// queueing for it; the unit's own level only advances on success. Permanent failures
/// are cached on the unit and park the lock at the terminal level.
fn step_one_level(
    domain: &Domain,
    unit: &LoadableUnit,
    lock: &LoadLock,
    work: LoadLevel,
) -> Result<()> {
    let guard = TableGuard::new(domain.lock_table(), unit.id());
    let ceiling = CeilingGuard::push(work);

    match do_level_work(domain, unit, work) {
        Ok(StepOutcome::Completed) => {
            unit.advance_level(work);
            lock.complete(work);
            drop(ceiling);
            drop(guard);
            debug!(target: "dotload::loader", unit = %unit.id(), level = %work, "level complete");
            if work.is_terminal() {
                domain.unlink_lock(unit.id());
            }
            Ok(())
        }
        Ok(StepOutcome::Release) => {
            unit.advance_level(work);
            lock.complete(work);
            drop(ceiling);
            drop(guard);
            deliver_notifications(domain, unit);
            Ok(())
        }
        Err(error) if error.is_transient() => {
            // Nothing recorded: the level is simply retried on a later request.
            debug!(
                target: "dotload::loader",
                unit = %unit.id(),
                level = %work,
                %error,
                "level work yielded"
            );
            Err(error)
        }
        Err(error) => {
            warn!(
                target: "dotload::loader",
                unit = %unit.id(),
                level = %work,
                %error,
                "level work failed permanently"
            );
            unit.cache_failure(work, error.clone());
            lock.complete(LoadLevel::TERMINAL);
            drop(ceiling);
            drop(guard);
            domain.unlink_lock(unit.id());
            Err(error)
        }
    }
}

fn do_level_work(domain: &Domain, unit: &LoadableUnit, work: LoadLevel) -> Result<StepOutcome> {
    match work {
        LoadLevel::Created => unreachable!("never a work level"),
        LoadLevel::Begin => {
            unit.set_flags(UnitFlags::BEGUN);
            Ok(StepOutcome::Completed)
        }
        LoadLevel::ResolveImage => resolve_image(domain, unit),
        LoadLevel::AllocateContext => allocate_context(domain, unit),
        LoadLevel::AddDependencies => add_dependencies(domain, unit),
        LoadLevel::PrepareNative => prepare_native(domain, unit),
        LoadLevel::DeliverNotifications => Ok(StepOutcome::Release),
        LoadLevel::Loaded => allocate_managed_object(domain, unit),
        LoadLevel::Active => Ok(StepOutcome::Completed),
    }
}

fn resolve_image(domain: &Domain, unit: &LoadableUnit) -> Result<StepOutcome> {
    let resolved = domain.host().resolve_image(unit.name())?;
    if resolved.bytes.is_empty() {
        return Err(Error::Empty);
    }

    let image = Arc::new(UnitImage::new(
        resolved.bytes,
        resolved.identity,
        resolved.dependencies,
    ));
    debug!(
        target: "dotload::loader",
        unit = %unit.id(),
        identity = %image.identity(),
        size = image.len(),
        dependencies = image.dependencies().len(),
        "image resolved"
    );
    unit.set_image(image)?;
    Ok(StepOutcome::Completed)
}

fn allocate_context(domain: &Domain, unit: &LoadableUnit) -> Result<StepOutcome> {
    if let Some(assigned) = unit.context() {
        // Chosen at definition time; it must still be registered.
        domain.context(assigned)?;
        return Ok(StepOutcome::Completed);
    }

    let context = if unit.is_collectible() {
        domain.create_collectible_context()?
    } else {
        Arc::clone(domain.global_context())
    };
    unit.assign_context(context.id())?;
    debug!(
        target: "dotload::loader",
        unit = %unit.id(),
        context = %context.id(),
        collectible = unit.is_collectible(),
        "context bound"
    );
    Ok(StepOutcome::Completed)
}

fn add_dependencies(domain: &Domain, unit: &LoadableUnit) -> Result<StepOutcome> {
    let image = unit
        .image()
        .ok_or_else(|| load_error!("unit '{}' has no resolved image", unit.name()))?;
    let Some(owner) = unit.context() else {
        return Err(load_error!(
            "unit '{}' has no allocation context",
            unit.name()
        ));
    };

    for name in image.dependencies() {
        let dependency = domain.find_or_define_dependency(name, unit)?;
        // The ceiling pushed for this level clamps the recursive target, so a
        // dependency cycle converges one level short instead of waiting on itself.
        request_level(domain, &dependency, LoadLevel::Active)?;

        let Some(dependency_context) = dependency.context() else {
            return Err(Error::LoadInProgress {
                unit: dependency.id(),
                current: dependency.level(),
                target: LoadLevel::AllocateContext,
            });
        };
        domain.ensure_reference(owner, dependency_context)?;
    }
    Ok(StepOutcome::Completed)
}

fn prepare_native(domain: &Domain, unit: &LoadableUnit) -> Result<StepOutcome> {
    let image = unit
        .image()
        .ok_or_else(|| load_error!("unit '{}' has no resolved image", unit.name()))?;
    let context = domain.context(
        unit.context()
            .ok_or_else(|| load_error!("unit '{}' has no allocation context", unit.name()))?,
    )?;

    let metadata = domain.alloc_raw(&context, ArenaKind::Plain, image.len())?;
    let code = domain.alloc_raw(&context, ArenaKind::Executable, image.len().div_ceil(2))?;
    let stub = domain.alloc_raw(&context, ArenaKind::Interleaved, 16)?;

    unit.set_artifacts(NativeArtifacts {
        metadata_addr: metadata.addr,
        metadata_len: metadata.len,
        code_addr: code.addr,
        code_len: code.len,
        stub_addr: stub.addr,
    })?;
    Ok(StepOutcome::Completed)
}

fn allocate_managed_object(domain: &Domain, unit: &LoadableUnit) -> Result<StepOutcome> {
    let context = domain.context(
        unit.context()
            .ok_or_else(|| load_error!("unit '{}' has no allocation context", unit.name()))?,
    )?;
    let object = domain.host().create_unit_object(unit)?;
    // Anchored in the owning context's table; the anchor dies with the context.
    context.handles().allocate(object)?;
    unit.set_managed_object(object)?;
    Ok(StepOutcome::Completed)
}

fn deliver_notifications(domain: &Domain, unit: &LoadableUnit) {
    if unit.set_flags(UnitFlags::LOAD_NOTIFIED) {
        domain.notify_unit_loaded(unit);
    }
}
