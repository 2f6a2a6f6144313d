//! Pool configuration types

/// Extent of execution-context synchronization performed before a freed
/// region becomes reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncScope {
    /// No synchronization required
    #[default]
    None,
    /// Synchronize with the current device
    Device,
    /// Synchronize with all devices in the system
    System,
}

/// Configuration for a pool resource.
///
/// Presets mirror typical use: [`PoolOptions::host`] for heap-backed pools,
/// [`PoolOptions::device`] for device memory (deferred deallocation on,
/// per-device synchronization), [`PoolOptions::pinned`] for page-locked
/// host memory shared by all devices.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Upper bound on block sizes requested from upstream. Growth stops
    /// here; larger blocks appear only when a single allocation needs them.
    pub max_block_size: usize,
    /// Initial size of blocks requested from upstream
    pub min_block_size: usize,
    /// Factor by which the upstream request size grows after each
    /// successful acquisition, until it reaches `max_block_size`
    pub growth_factor: f32,
    /// Retry with halved sizes when upstream cannot satisfy the default
    /// upcoming block
    pub try_smaller_on_failure: bool,
    /// When even the minimum size fails, return wholly-free blocks to
    /// upstream and retry once. Ignored unless `try_smaller_on_failure`
    /// is set.
    pub return_to_upstream_on_failure: bool,
    /// To what extent `deallocate` synchronizes before making memory
    /// available again
    pub sync: SyncScope,
    /// Route deallocations through the background worker, if the pool
    /// variant supports it (otherwise ignored)
    pub enable_deferred_deallocation: bool,
    /// Backpressure threshold: an allocation finding more outstanding
    /// deferred deallocations than this waits for a batch to complete
    pub max_outstanding_deallocations: usize,
    /// Minimum alignment passed to upstream
    pub upstream_alignment: usize,
}

impl PoolOptions {
    /// Preset for heap-backed host pools: 4 KiB initial blocks growing to
    /// at most 256 MiB, no synchronization.
    pub fn host() -> Self {
        PoolOptions {
            max_block_size: 1 << 28,
            min_block_size: 1 << 12,
            growth_factor: 2.0,
            try_smaller_on_failure: true,
            return_to_upstream_on_failure: true,
            sync: SyncScope::None,
            enable_deferred_deallocation: false,
            max_outstanding_deallocations: 16,
            upstream_alignment: 256,
        }
    }

    /// Preset for device-memory pools: 1 MiB initial blocks growing to at
    /// most 4 GiB, per-device synchronization, deferred deallocation.
    pub fn device() -> Self {
        PoolOptions {
            max_block_size: 1 << 32,
            min_block_size: 1 << 20,
            sync: SyncScope::Device,
            enable_deferred_deallocation: true,
            ..Self::host()
        }
    }

    /// Preset for pinned host pools: device-sized blocks, but every device
    /// may be consuming the memory, so synchronize system-wide.
    pub fn pinned() -> Self {
        PoolOptions {
            sync: SyncScope::System,
            ..Self::device()
        }
    }

    pub fn with_max_block_size(mut self, bytes: usize) -> Self {
        self.max_block_size = bytes;
        self
    }

    pub fn with_min_block_size(mut self, bytes: usize) -> Self {
        self.min_block_size = bytes;
        self
    }

    pub fn with_growth_factor(mut self, factor: f32) -> Self {
        self.growth_factor = factor;
        self
    }

    pub fn with_try_smaller_on_failure(mut self, enabled: bool) -> Self {
        self.try_smaller_on_failure = enabled;
        self
    }

    pub fn with_return_to_upstream_on_failure(mut self, enabled: bool) -> Self {
        self.return_to_upstream_on_failure = enabled;
        self
    }

    pub fn with_sync(mut self, sync: SyncScope) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_deferred_deallocation(mut self, enabled: bool) -> Self {
        self.enable_deferred_deallocation = enabled;
        self
    }

    pub fn with_max_outstanding_deallocations(mut self, count: usize) -> Self {
        self.max_outstanding_deallocations = count;
        self
    }

    pub fn with_upstream_alignment(mut self, alignment: usize) -> Self {
        self.upstream_alignment = alignment;
        self
    }
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self::host()
    }
}
