use bitflags::bitflags;
use sha1::{Digest, Sha1};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU8, Ordering},
        Arc, OnceLock,
    },
};
use uguid::Guid;

use crate::{
    context::ContextId,
    host::ObjectRef,
    loader::LoadLevel,
    Error, Result,
};

/// Identifier of a [`LoadableUnit`], unique within its domain for the lifetime of the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(pub(crate) u64);

impl UnitId {
    /// The numeric value behind the identifier.
    #[must_use]
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit #{}", self.0)
    }
}

bitflags! {
    /// One-way facts recorded about a unit as it progresses.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnitFlags: u32 {
        /// The pipeline has started working on this unit.
        const BEGUN = 0x0000_0001;
        /// Load notifications were delivered; they are never delivered twice.
        const LOAD_NOTIFIED = 0x0000_0002;
        /// A permanent failure is cached and every further request re-raises it.
        const FAILED = 0x0000_0004;
        /// The unit went away with its context.
        const UNLOADED = 0x0000_0008;
    }
}

/// A resolved unit image: the raw bytes, the identity the resolver declared for them,
/// and the names of the units they depend on.
///
/// The digest pins what was actually loaded. When the resolver declares no identity,
/// one is derived from the digest, so identical bytes always carry the same identity.
pub struct UnitImage {
    data: Vec<u8>,
    digest: [u8; 20],
    identity: Guid,
    dependencies: Vec<String>,
}

impl UnitImage {
    /// Wraps resolved image bytes together with their declared identity and
    /// dependencies.
    #[must_use]
    pub fn new(data: Vec<u8>, identity: Option<Guid>, dependencies: Vec<String>) -> UnitImage {
        let digest: [u8; 20] = Sha1::digest(&data).into();
        let identity = identity.unwrap_or_else(|| {
            let mut folded = [0u8; 16];
            folded.copy_from_slice(&digest[..16]);
            Guid::from_bytes(folded)
        });
        UnitImage {
            data,
            digest,
            identity,
            dependencies,
        }
    }

    /// Wraps bare image bytes with a derived identity and no dependencies.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> UnitImage {
        UnitImage::new(data, None, Vec::new())
    }

    /// The raw image bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty. Empty images never reach a unit; resolution
    /// rejects them.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// SHA-1 digest of the image bytes.
    #[must_use]
    pub fn digest(&self) -> &[u8; 20] {
        &self.digest
    }

    /// The image's declared or derived identity.
    #[must_use]
    pub fn identity(&self) -> Guid {
        self.identity
    }

    /// Names of the units this image declares as dependencies.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

/// Addresses of the native structures a unit's context carved out for it.
#[derive(Debug, Clone, Copy)]
pub struct NativeArtifacts {
    /// Runtime metadata block.
    pub metadata_addr: usize,
    /// Size of the metadata block.
    pub metadata_len: usize,
    /// Code block.
    pub code_addr: usize,
    /// Size of the code block.
    pub code_len: usize,
    /// Dispatch stub slot.
    pub stub_addr: usize,
}

/// How a new unit is defined: its name, whether it can unload, and optionally the
/// context it must join.
///
/// ```
/// use dotload::UnitDefinition;
///
/// let plugin = UnitDefinition::new("plugin.alpha").collectible();
/// assert!(plugin.is_collectible());
/// ```
#[derive(Debug, Clone)]
pub struct UnitDefinition {
    name: String,
    collectible: bool,
    context: Option<ContextId>,
}

impl UnitDefinition {
    /// Defines a non-collectible unit named `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> UnitDefinition {
        UnitDefinition {
            name: name.into(),
            collectible: false,
            context: None,
        }
    }

    /// Makes the unit collectible: it will receive its own context that can unload.
    #[must_use]
    pub fn collectible(mut self) -> UnitDefinition {
        self.collectible = true;
        self
    }

    /// Loads the unit into an existing context instead of allocating one. The unit
    /// inherits the context's collectibility.
    #[must_use]
    pub fn in_context(mut self, context: ContextId) -> UnitDefinition {
        self.context = Some(context);
        self
    }

    /// The unit's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the unit is collectible.
    #[must_use]
    pub fn is_collectible(&self) -> bool {
        self.collectible
    }

    pub(crate) fn context(&self) -> Option<ContextId> {
        self.context
    }
}

struct CachedFailure {
    level: LoadLevel,
    error: Error,
}

/// One loadable unit and everything the pipeline has produced for it so far.
///
/// A unit's level only ever moves forward, one level at a time, and every field below
/// the level is written exactly once by whichever thread performs the corresponding
/// level's work. Readers at level N may rely on all products of levels `<= N` being
/// present.
///
/// Failures are sticky: the first permanent error is cached with the level it struck
/// at, and every later attempt to progress the unit re-raises a clone of it. Transient
/// errors (resource exhaustion, progress blocked on another thread) are never cached.
///
/// # Thread Safety
///
/// All state is atomics and write-once cells; `&self` methods are safe from any
/// thread. Cross-field consistency is the pipeline's job via the unit's load lock.
pub struct LoadableUnit {
    id: UnitId,
    name: String,
    collectible: bool,
    level: AtomicU8,
    flags: AtomicU32,
    context: OnceLock<ContextId>,
    image: OnceLock<Arc<UnitImage>>,
    artifacts: OnceLock<NativeArtifacts>,
    managed_object: OnceLock<ObjectRef>,
    failure: OnceLock<CachedFailure>,
}

impl LoadableUnit {
    pub(crate) fn new(id: UnitId, name: String, collectible: bool) -> Arc<LoadableUnit> {
        Arc::new(LoadableUnit {
            id,
            name,
            collectible,
            level: AtomicU8::new(LoadLevel::Created as u8),
            flags: AtomicU32::new(UnitFlags::empty().bits()),
            context: OnceLock::new(),
            image: OnceLock::new(),
            artifacts: OnceLock::new(),
            managed_object: OnceLock::new(),
            failure: OnceLock::new(),
        })
    }

    /// This unit's identifier.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// The name the unit was defined under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the unit lives in a collectible context.
    #[must_use]
    pub fn is_collectible(&self) -> bool {
        self.collectible
    }

    /// Highest level the unit has successfully completed.
    #[must_use]
    pub fn level(&self) -> LoadLevel {
        LoadLevel::from_word(self.level.load(Ordering::Acquire))
    }

    /// Whether the unit has reached full availability.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.level() >= LoadLevel::Active
    }

    /// Whether the unit is still somewhere in the pipeline, neither loaded nor failed.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.level() < LoadLevel::Loaded && self.failure.get().is_none()
    }

    /// Records the successful completion of `level`.
    pub(crate) fn advance_level(&self, level: LoadLevel) {
        let previous = self.level.fetch_max(level as u8, Ordering::AcqRel);
        debug_assert!(
            level as u8 == previous || level as u8 == previous + 1,
            "unit level must advance one step at a time"
        );
    }

    /// Flags recorded so far.
    #[must_use]
    pub fn flags(&self) -> UnitFlags {
        UnitFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Sets `flags`, returning `true` if at least one of them was not set before.
    pub(crate) fn set_flags(&self, flags: UnitFlags) -> bool {
        let previous = self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        previous & flags.bits() != flags.bits()
    }

    /// The context this unit loads into, once assigned.
    #[must_use]
    pub fn context(&self) -> Option<ContextId> {
        self.context.get().copied()
    }

    pub(crate) fn assign_context(&self, context: ContextId) -> Result<()> {
        self.context
            .set(context)
            .map_err(|_| load_error!("unit '{}' already has a context", self.name))
    }

    /// The resolved image, present from [`LoadLevel::ResolveImage`] on.
    #[must_use]
    pub fn image(&self) -> Option<Arc<UnitImage>> {
        self.image.get().cloned()
    }

    pub(crate) fn set_image(&self, image: Arc<UnitImage>) -> Result<()> {
        self.image
            .set(image)
            .map_err(|_| load_error!("unit '{}' already has an image", self.name))
    }

    /// Native structures, present from [`LoadLevel::PrepareNative`] on.
    #[must_use]
    pub fn artifacts(&self) -> Option<NativeArtifacts> {
        self.artifacts.get().copied()
    }

    pub(crate) fn set_artifacts(&self, artifacts: NativeArtifacts) -> Result<()> {
        self.artifacts
            .set(artifacts)
            .map_err(|_| load_error!("unit '{}' already has native artifacts", self.name))
    }

    /// The unit's managed object, present from [`LoadLevel::Loaded`] on.
    #[must_use]
    pub fn managed_object(&self) -> Option<ObjectRef> {
        self.managed_object.get().copied()
    }

    pub(crate) fn set_managed_object(&self, object: ObjectRef) -> Result<()> {
        self.managed_object
            .set(object)
            .map_err(|_| load_error!("unit '{}' already has a managed object", self.name))
    }

    /// The cached permanent failure and the level it struck at, if any.
    #[must_use]
    pub fn failure(&self) -> Option<(LoadLevel, Error)> {
        self.failure
            .get()
            .map(|cached| (cached.level, cached.error.clone()))
    }

    /// Caches a permanent failure. Only the first failure sticks.
    pub(crate) fn cache_failure(&self, level: LoadLevel, error: Error) {
        debug_assert!(!error.is_transient(), "transient errors are never cached");
        let _ = self.failure.set(CachedFailure { level, error });
        self.set_flags(UnitFlags::FAILED);
    }

    /// Re-raises the cached failure if one exists.
    pub(crate) fn check_no_failure(&self) -> Result<()> {
        match self.failure.get() {
            Some(cached) => Err(cached.error.clone()),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for LoadableUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadableUnit")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("level", &self.level())
            .field("collectible", &self.collectible)
            .field("flags", &self.flags())
            .finish()
    }
}
