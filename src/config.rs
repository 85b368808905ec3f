//! Domain tuning knobs.

/// Tunables for one isolation domain.
///
/// All sizes are bytes. Reserves are upper bounds on what an arena may ever commit,
/// not up-front allocations; memory is committed chunk-wise as allocations arrive.
///
/// # Examples
///
/// ```
/// use dotload::DomainConfig;
///
/// let config = DomainConfig {
///     collectible_reserve: 256 * 1024,
///     ..DomainConfig::default()
/// };
/// assert!(config.collectible_reserve < config.global_reserve);
/// ```
#[derive(Debug, Clone)]
pub struct DomainConfig {
    /// Reserve for each arena of a collectible context. Kept small: collectible
    /// contexts are expected to be numerous and short-lived.
    pub collectible_reserve: usize,
    /// Reserve for each arena of the domain's global context.
    pub global_reserve: usize,
    /// Granule arenas commit memory in. Must be non-zero.
    pub commit_granule: usize,
    /// Whether dropping a reference count to zero runs a collection pass inline.
    /// When disabled, garbage accumulates until an explicit pass is requested.
    pub collect_on_release: bool,
}

impl Default for DomainConfig {
    fn default() -> DomainConfig {
        DomainConfig {
            collectible_reserve: 1024 * 1024,
            global_reserve: 64 * 1024 * 1024,
            commit_granule: 4096,
            collect_on_release: true,
        }
    }
}

impl DomainConfig {
    /// A deliberately tiny configuration, useful for exercising reserve exhaustion.
    #[must_use]
    pub fn compact() -> DomainConfig {
        DomainConfig {
            collectible_reserve: 64 * 1024,
            global_reserve: 256 * 1024,
            commit_granule: 4096,
            collect_on_release: true,
        }
    }
}
