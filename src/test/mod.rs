use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    config::DomainConfig,
    context::ContextId,
    domain::Domain,
    host::{ObjectRef, ResolvedImage, RuntimeHost, UnloadObserver},
    loader::{LoadableUnit, UnitId},
    Error, Result,
};

// Image a StubHost hands out for a configured unit name.
pub(crate) struct StubImage {
    pub(crate) bytes: Vec<u8>,
    pub(crate) dependencies: Vec<String>,
}

// Host backed by an in-memory image table. Names without a configured image resolve
// to their own UTF-8 bytes with no dependencies, so most tests need no setup.
pub(crate) struct StubHost {
    images: Mutex<HashMap<String, StubImage>>,
    failures: Mutex<HashMap<String, Error>>,
    next_object: AtomicU64,
}

impl StubHost {
    pub(crate) fn new() -> Arc<StubHost> {
        Arc::new(StubHost {
            images: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            next_object: AtomicU64::new(0x1000),
        })
    }

    // Helper to register an image with explicit bytes and dependency names
    pub(crate) fn add_image(&self, name: &str, bytes: &[u8], dependencies: &[&str]) {
        self.images.lock().unwrap().insert(
            name.to_string(),
            StubImage {
                bytes: bytes.to_vec(),
                dependencies: dependencies.iter().map(|d| (*d).to_string()).collect(),
            },
        );
    }

    // Helper to make resolution of `name` fail with `error`
    pub(crate) fn fail_resolve(&self, name: &str, error: Error) {
        self.failures.lock().unwrap().insert(name.to_string(), error);
    }

    fn mint(&self) -> ObjectRef {
        ObjectRef::new(self.next_object.fetch_add(1, Ordering::Relaxed))
    }
}

impl RuntimeHost for StubHost {
    fn resolve_image(&self, unit: &str) -> Result<ResolvedImage> {
        if let Some(error) = self.failures.lock().unwrap().get(unit) {
            return Err(error.clone());
        }
        let images = self.images.lock().unwrap();
        match images.get(unit) {
            Some(image) => Ok(ResolvedImage {
                bytes: image.bytes.clone(),
                identity: None,
                dependencies: image.dependencies.clone(),
            }),
            None => Ok(ResolvedImage {
                bytes: unit.as_bytes().to_vec(),
                identity: None,
                dependencies: Vec::new(),
            }),
        }
    }

    fn create_context_wrapper(&self, _context: ContextId) -> Result<ObjectRef> {
        Ok(self.mint())
    }

    fn create_unit_object(&self, _unit: &LoadableUnit) -> Result<ObjectRef> {
        Ok(self.mint())
    }
}

// Everything an UnloadObserver sees, in the order it saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnloadEvent {
    Condemned(ContextId),
    UnitUnloading(UnitId, String),
    Destroyed(ContextId),
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    events: Mutex<Vec<UnloadEvent>>,
}

impl RecordingObserver {
    pub(crate) fn new() -> Arc<RecordingObserver> {
        Arc::new(RecordingObserver::default())
    }

    pub(crate) fn events(&self) -> Vec<UnloadEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl UnloadObserver for RecordingObserver {
    fn context_condemned(&self, context: ContextId) {
        self.events
            .lock()
            .unwrap()
            .push(UnloadEvent::Condemned(context));
    }

    fn unit_unloading(&self, unit: UnitId, name: &str) {
        self.events
            .lock()
            .unwrap()
            .push(UnloadEvent::UnitUnloading(unit, name.to_string()));
    }

    fn context_destroyed(&self, context: ContextId) {
        self.events
            .lock()
            .unwrap()
            .push(UnloadEvent::Destroyed(context));
    }
}

// Helper to create a domain wired to a fresh StubHost
pub(crate) fn test_domain() -> (Arc<Domain>, Arc<StubHost>) {
    let host = StubHost::new();
    let domain = Arc::new(Domain::new(
        "test",
        Arc::clone(&host) as Arc<dyn RuntimeHost>,
        DomainConfig::default(),
    ));
    (domain, host)
}
