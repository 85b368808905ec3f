//! Integration tests for allocation context collection.
//!
//! These tests exercise the reference-count-plus-cycle-detection model end to end:
//! external counts as roots, context cycles, cascading sweeps across rounds, and the
//! fixed teardown order observers see.

use dotload::prelude::*;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, Weak,
};

struct FlatHost {
    next_object: AtomicU64,
}

impl FlatHost {
    fn new() -> Arc<FlatHost> {
        Arc::new(FlatHost {
            next_object: AtomicU64::new(0x8000),
        })
    }

    fn mint(&self) -> ObjectRef {
        ObjectRef::new(self.next_object.fetch_add(1, Ordering::SeqCst))
    }
}

impl RuntimeHost for FlatHost {
    fn resolve_image(&self, unit: &str) -> Result<ResolvedImage> {
        Ok(ResolvedImage {
            bytes: unit.as_bytes().to_vec(),
            identity: None,
            dependencies: Vec::new(),
        })
    }

    fn create_context_wrapper(&self, _context: ContextId) -> Result<ObjectRef> {
        Ok(self.mint())
    }

    fn create_unit_object(&self, _unit: &LoadableUnit) -> Result<ObjectRef> {
        Ok(self.mint())
    }
}

fn new_domain(config: DomainConfig) -> Arc<Domain> {
    Arc::new(Domain::new(
        "collector-tests",
        FlatHost::new() as Arc<dyn RuntimeHost>,
        config,
    ))
}

/// Records teardown callbacks in the order they arrive.
#[derive(Default)]
struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    fn new() -> Arc<EventLog> {
        Arc::new(EventLog::default())
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl UnloadObserver for EventLog {
    fn context_condemned(&self, context: ContextId) {
        self.events
            .lock()
            .unwrap()
            .push(format!("condemned {context}"));
    }

    fn unit_unloading(&self, _unit: UnitId, name: &str) {
        self.events.lock().unwrap().push(format!("unloading {name}"));
    }

    fn context_destroyed(&self, context: ContextId) {
        self.events
            .lock()
            .unwrap()
            .push(format!("destroyed {context}"));
    }
}

#[test]
fn test_externally_held_contexts_survive_a_pass() -> Result<()> {
    let domain = new_domain(DomainConfig::default());
    let held = domain.create_collectible_context()?;
    let pinned = domain.create_collectible_context()?;
    domain.ensure_reference(held.id(), pinned.id())?;

    // `pinned` is now held only by the edge; `held` still has its creation count.
    assert_eq!(domain.release(pinned.id())?, 1);

    let summary = domain.run_collection_pass()?;
    assert_eq!(summary.contexts_collected, 0);
    assert!(domain.context(held.id()).is_ok());
    assert!(domain.context(pinned.id()).is_ok());

    // Dropping the root's count dooms the pair together.
    assert_eq!(domain.release(held.id())?, 0);
    assert!(domain.context(held.id()).is_err());
    assert!(domain.context(pinned.id()).is_err());
    Ok(())
}

#[test]
fn test_context_cycles_are_collected_as_a_group() -> Result<()> {
    let domain = new_domain(DomainConfig::default());
    let a = domain.create_collectible_context()?;
    let b = domain.create_collectible_context()?;
    let c = domain.create_collectible_context()?;
    domain.ensure_reference(a.id(), b.id())?;
    domain.ensure_reference(b.id(), c.id())?;
    domain.ensure_reference(c.id(), a.id())?;

    // One external count anywhere in the ring keeps all of it alive.
    domain.release(a.id())?;
    domain.release(b.id())?;
    let summary = domain.run_collection_pass()?;
    assert_eq!(summary.contexts_collected, 0);

    // After the last external count goes, only the ring's own edges hold it up.
    // Release alone cannot see that (every count stays above zero), so the
    // garbage waits for the next pass, which collects the ring in one round.
    domain.release(c.id())?;
    assert!(domain.context(c.id()).is_ok());

    let summary = domain.run_collection_pass()?;
    assert_eq!(summary.contexts_collected, 3);
    assert_eq!(summary.rounds, 1);
    assert!(domain.context(a.id()).is_err());
    assert!(domain.context(b.id()).is_err());
    assert!(domain.context(c.id()).is_err());
    Ok(())
}

#[test]
fn test_reference_edges_are_deduplicated() -> Result<()> {
    let domain = new_domain(DomainConfig::default());
    let a = domain.create_collectible_context()?;
    let b = domain.create_collectible_context()?;

    assert!(domain.ensure_reference(a.id(), b.id())?);
    assert!(!domain.ensure_reference(a.id(), b.id())?);
    assert_eq!(b.references(), Some(2));

    // Self references and edges touching the global context are no-ops.
    assert!(!domain.ensure_reference(a.id(), a.id())?);
    assert!(!domain.ensure_reference(a.id(), domain.global_context().id())?);
    assert!(!domain.ensure_reference(domain.global_context().id(), b.id())?);
    assert_eq!(b.references(), Some(2));
    Ok(())
}

#[test]
fn test_unbalanced_release_is_refused() -> Result<()> {
    let domain = new_domain(DomainConfig {
        collect_on_release: false,
        ..DomainConfig::default()
    });
    let context = domain.create_collectible_context()?;

    assert_eq!(domain.add_reference(context.id())?, 2);
    assert_eq!(domain.release(context.id())?, 1);
    assert_eq!(domain.release(context.id())?, 0);
    assert!(matches!(
        domain.release(context.id()),
        Err(Error::ReferenceUnderflow(_))
    ));
    Ok(())
}

#[test]
fn test_teardown_follows_the_fixed_order() -> Result<()> {
    let domain = new_domain(DomainConfig::default());
    let log = EventLog::new();
    domain.register_observer(log.clone())?;

    let unit = domain.define_unit(UnitDefinition::new("plugin.alpha").collectible())?;
    domain.request_level(&unit, LoadLevel::Active)?;
    let context = unit.context().expect("context");

    domain.release(context)?;

    let context_name = format!("{context}");
    assert_eq!(
        log.events(),
        vec![
            format!("condemned {context_name}"),
            "unloading plugin.alpha".to_string(),
            format!("destroyed {context_name}"),
        ]
    );
    Ok(())
}

#[test]
fn test_teardown_returns_memory_and_address_ranges() -> Result<()> {
    let domain = new_domain(DomainConfig::default());
    let unit = domain.define_unit(UnitDefinition::new("plugin.alpha").collectible())?;
    domain.request_level(&unit, LoadLevel::Active)?;

    let context = unit.context().expect("context");
    let artifacts = unit.artifacts().expect("artifacts");
    assert_eq!(domain.context_owning(artifacts.metadata_addr), Some(context));
    let committed_before = domain.stats()?.committed_bytes;
    assert!(committed_before > 0);

    domain.release(context)?;

    assert_eq!(domain.context_owning(artifacts.metadata_addr), None);
    assert_eq!(domain.context_owning(artifacts.stub_addr), None);
    assert!(domain.stats()?.committed_bytes < committed_before);
    Ok(())
}

#[test]
fn test_counts_released_during_teardown_cascade_within_the_pass() -> Result<()> {
    let domain = new_domain(DomainConfig {
        collect_on_release: false,
        ..DomainConfig::default()
    });
    let doomed = domain.create_collectible_context()?;
    let follower = domain.create_collectible_context()?;

    // An observer that drops the follower's creation count the moment the first
    // context is condemned, as an unload callback realistically would.
    struct ChainObserver {
        domain: Weak<Domain>,
        trigger: ContextId,
        follower: ContextId,
    }
    impl UnloadObserver for ChainObserver {
        fn context_condemned(&self, context: ContextId) {
            if context == self.trigger {
                let domain = self.domain.upgrade().expect("domain alive");
                domain.release(self.follower).expect("release follower");
            }
        }
    }

    domain.register_observer(Arc::new(ChainObserver {
        domain: Arc::downgrade(&domain),
        trigger: doomed.id(),
        follower: follower.id(),
    }))?;

    domain.release(doomed.id())?;
    let summary = domain.run_collection_pass()?;

    // Round one sweeps `doomed`; the count its observer released makes
    // `follower` garbage for round two of the same pass.
    assert_eq!(summary.contexts_collected, 2);
    assert_eq!(summary.rounds, 2);
    assert!(domain.context(follower.id()).is_err());
    Ok(())
}

#[test]
fn test_empty_pass_is_a_cheap_no_op() -> Result<()> {
    let domain = new_domain(DomainConfig::default());
    domain.create_collectible_context()?;

    let summary = domain.run_collection_pass()?;
    assert_eq!(summary.contexts_collected, 0);
    assert_eq!(summary.rounds, 0);

    let stats = domain.stats()?;
    assert_eq!(stats.collection_passes, 1);
    assert_eq!(stats.contexts_collected, 0);
    Ok(())
}

#[test]
fn test_collect_on_release_can_be_deferred() -> Result<()> {
    let domain = new_domain(DomainConfig {
        collect_on_release: false,
        ..DomainConfig::default()
    });
    let context = domain.create_collectible_context()?;

    assert_eq!(domain.release(context.id())?, 0);
    // Garbage lingers until a pass is requested explicitly.
    assert!(domain.context(context.id()).is_ok());

    let summary = domain.run_collection_pass()?;
    assert_eq!(summary.contexts_collected, 1);
    assert!(domain.context(context.id()).is_err());
    Ok(())
}

#[test]
fn test_dead_contexts_refuse_new_references() -> Result<()> {
    let domain = new_domain(DomainConfig {
        collect_on_release: false,
        ..DomainConfig::default()
    });
    let context = domain.create_collectible_context()?;
    domain.release(context.id())?;

    // Zero count without a pass yet: resurrection is only legal through the
    // domain, which re-checks liveness.
    assert!(!domain.try_add_reference(context.id())?);

    domain.run_collection_pass()?;
    assert!(matches!(
        domain.try_add_reference(context.id()),
        Err(Error::ContextNotFound(_))
    ));
    Ok(())
}

#[test]
fn test_collected_contexts_refuse_allocations() -> Result<()> {
    let domain = new_domain(DomainConfig::default());
    let log = EventLog::new();
    domain.register_observer(log.clone())?;

    let context = domain.create_collectible_context()?;
    let id = context.id();
    domain.context_alloc(id, ArenaKind::Plain, 128)?;

    domain.release(id)?;

    // The context is unlinked from the registry before its storage goes away,
    // so late allocation attempts miss the lookup entirely.
    assert!(matches!(
        domain.context_alloc(id, ArenaKind::Plain, 128),
        Err(Error::ContextNotFound(_))
    ));
    assert_eq!(log.events().len(), 2, "condemned and destroyed");
    Ok(())
}

#[test]
fn test_interleaved_arena_hands_out_whole_stub_slots() -> Result<()> {
    let domain = new_domain(DomainConfig::default());
    let context = domain.create_collectible_context()?;

    let first = domain.context_alloc(context.id(), ArenaKind::Interleaved, 16)?;
    let second = domain.context_alloc(context.id(), ArenaKind::Interleaved, 16)?;

    // Requests are rounded up to whole stub slots.
    assert_eq!(second - first, 32);
    assert!(matches!(
        domain.context_alloc(context.id(), ArenaKind::Interleaved, 64),
        Err(Error::ResourceExhausted(_))
    ));
    Ok(())
}

#[test]
fn test_arena_reserve_exhaustion_is_transient() -> Result<()> {
    let domain = new_domain(DomainConfig::compact());
    let context = domain.create_collectible_context()?;
    let reserve = domain.config().collectible_reserve;

    // Fill the plain arena to its reserve, then overflow it.
    let mut allocated = 0;
    while allocated + 4096 <= reserve {
        domain.context_alloc(context.id(), ArenaKind::Plain, 4096)?;
        allocated += 4096;
    }
    let overflow = domain.context_alloc(context.id(), ArenaKind::Plain, 4096);
    match overflow {
        Err(error) => assert!(error.is_transient()),
        Ok(_) => panic!("reserve was not enforced"),
    }

    // Other arenas of the same context are unaffected.
    domain.context_alloc(context.id(), ArenaKind::Executable, 64)?;
    Ok(())
}
