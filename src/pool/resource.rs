//! Coalescing pool resource
//!
//! [`PoolResource`] sits between callers and an expensive upstream resource
//! (heap, `hipMalloc`, pinned allocator). Freed regions land in a merging
//! free list and satisfy later allocations without touching upstream; the
//! free list misses grow upstream blocks geometrically so steady-state
//! workloads stop calling upstream altogether.
//!
//! # Locking
//!
//! Two locks, always taken in the same order: the upstream lock (a real
//! mutex serializing upstream calls, the owned-block list and the growth
//! cursor) before the pool lock (the [`PoolLock`] strategy guarding the
//! free list). The fast path takes only the pool lock.

use std::marker::PhantomData;
use std::ptr;
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::backend::{DeviceExecutor, MemoryContext, MemoryResource};
use crate::error::{PoolError, PoolResult};
use crate::pool::free_list::{CoalescingFreeList, FreeList};
use crate::pool::lock::{PoolLock, StdPoolLock};
use crate::pool::options::{PoolOptions, SyncScope};

/// One deallocation in a batch handed to [`PoolResource::bulk_deallocate`].
#[derive(Debug, Clone, Copy)]
pub struct DeallocParams {
    /// Device whose queues must drain before the region is reusable;
    /// negative means "resolve to the current device at sync time".
    pub sync_device: i32,
    pub ptr: *mut u8,
    pub bytes: usize,
    pub alignment: usize,
}

impl DeallocParams {
    pub fn new(ptr: *mut u8, bytes: usize, alignment: usize) -> Self {
        DeallocParams {
            sync_device: -1,
            ptr,
            bytes,
            alignment,
        }
    }

    pub fn on_device(mut self, device: i32) -> Self {
        self.sync_device = device;
        self
    }
}

// SAFETY: DeallocParams carries its pointer as an opaque address; the pool
// never dereferences it, and the region it names lives inside an upstream
// block the pool owns.
unsafe impl Send for DeallocParams {}
unsafe impl Sync for DeallocParams {}

/// A block acquired from upstream; released as a unit.
#[derive(Debug, Clone, Copy)]
struct UpstreamBlock {
    ptr: *mut u8,
    bytes: usize,
    alignment: usize,
}

// SAFETY: the pointer is an opaque address owned by the pool; it is only
// dereferenced by callers holding regions allocated from it.
unsafe impl Send for UpstreamBlock {}

/// State guarded by the upstream lock: the owned blocks and the growth
/// cursor.
#[derive(Debug)]
struct UpstreamState {
    blocks: Vec<UpstreamBlock>,
    next_block_size: usize,
}

/// Hook the deferred deallocator installs so the acquisition protocol can
/// flush pending deallocations when upstream runs dry.
pub(crate) trait FlushHook: Send + Sync {
    fn flush(&self) -> PoolResult<()>;
}

/// Coalescing memory pool over an upstream [`MemoryResource`].
///
/// `F` selects the free-list data structure and `L` the lock guarding it;
/// the defaults fit shared multi-threaded pools.
///
/// Pool operations must not be reentered from inside the upstream
/// resource's own callbacks; doing so inverts the lock order.
pub struct PoolResource<U, F = CoalescingFreeList, L = StdPoolLock<F>>
where
    U: MemoryResource,
    F: FreeList,
    L: PoolLock<F>,
{
    upstream: Arc<U>,
    executor: Arc<dyn DeviceExecutor>,
    options: PoolOptions,
    free_list: L,
    upstream_state: Mutex<UpstreamState>,
    flush_hook: OnceCell<Arc<dyn FlushHook>>,
    _free_list: PhantomData<fn() -> F>,
}

fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

impl<U, F, L> PoolResource<U, F, L>
where
    U: MemoryResource,
    F: FreeList,
    L: PoolLock<F>,
{
    /// Create a pool over `upstream` with the default device executor.
    pub fn new(upstream: Arc<U>, options: PoolOptions) -> Self {
        Self::with_executor(upstream, options, default_executor())
    }

    /// Create a pool with an explicit device executor.
    pub fn with_executor(
        upstream: Arc<U>,
        options: PoolOptions,
        executor: Arc<dyn DeviceExecutor>,
    ) -> Self {
        let next_block_size = options.min_block_size;
        PoolResource {
            upstream,
            executor,
            options,
            free_list: L::new(F::default()),
            upstream_state: Mutex::new(UpstreamState {
                blocks: Vec::new(),
                next_block_size,
            }),
            flush_hook: OnceCell::new(),
            _free_list: PhantomData,
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn upstream(&self) -> &Arc<U> {
        &self.upstream
    }

    pub(crate) fn executor(&self) -> &Arc<dyn DeviceExecutor> {
        &self.executor
    }

    pub(crate) fn set_flush_hook(&self, hook: Arc<dyn FlushHook>) {
        let _ = self.flush_hook.set(hook);
    }

    /// Number of upstream blocks currently owned by the pool.
    pub fn owned_block_count(&self) -> PoolResult<usize> {
        Ok(self.upstream_state.lock()?.blocks.len())
    }

    /// Allocate `bytes` aligned to `alignment`.
    ///
    /// Served from the free list when possible; otherwise a new upstream
    /// block is acquired and its tail (if any) feeds the free list.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<*mut u8> {
        if bytes == 0 {
            return Ok(ptr::null_mut());
        }

        if let Some(hit) = self.free_list.with(|fl| fl.get(bytes, alignment))? {
            return Ok(hit);
        }

        let alignment = alignment.max(self.options.upstream_alignment);
        let (block, blk_size) = self.get_upstream_block(bytes, alignment)?;
        if blk_size == bytes {
            // An exact-fit block has little chance of ever merging with
            // anything in the pool, so it is returned as-is.
            return Ok(block);
        }
        self.free_list
            .with(|fl| fl.put((block as usize + bytes) as *mut u8, blk_size - bytes))?;
        Ok(block)
    }

    /// Deallocate after synchronizing with the configured scope.
    ///
    /// The synchronize-before-insert rule is what lets a later `allocate`
    /// hand the region out as immediately usable.
    pub fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) -> PoolResult<()> {
        if ptr.is_null() || bytes == 0 {
            return Ok(());
        }
        self.synchronize()?;
        self.deallocate_no_sync(ptr, bytes, alignment)
    }

    /// Place a region in the free list for immediate reuse.
    ///
    /// The caller guarantees no execution context is still consuming the
    /// region.
    pub fn deallocate_no_sync(
        &self,
        ptr: *mut u8,
        bytes: usize,
        _alignment: usize,
    ) -> PoolResult<()> {
        self.free_list.with(|fl| fl.put(ptr, bytes))
    }

    /// Try the free list only; never calls upstream.
    pub fn try_allocate_from_free(
        &self,
        bytes: usize,
        alignment: usize,
    ) -> PoolResult<Option<*mut u8>> {
        if bytes == 0 {
            return Ok(None);
        }
        self.free_list.with(|fl| fl.get(bytes, alignment))
    }

    /// Deallocate many regions with a single synchronization pass.
    ///
    /// Identical pointers must not appear twice in one batch.
    pub fn bulk_deallocate(&self, params: &[DeallocParams]) -> PoolResult<()> {
        if params.is_empty() {
            return Ok(());
        }
        self.synchronize_batch(params)?;
        self.free_list.with(|fl| {
            for par in params {
                fl.put(par.ptr, par.bytes);
            }
        })
    }

    /// Synchronize with the configured scope.
    pub fn synchronize(&self) -> PoolResult<()> {
        match self.options.sync {
            SyncScope::None => Ok(()),
            SyncScope::Device => self.executor.synchronize_current(),
            SyncScope::System => self.executor.synchronize_all(),
        }
    }

    /// Synchronize every distinct device referenced by a batch exactly
    /// once, in arrival order.
    pub fn synchronize_batch(&self, params: &[DeallocParams]) -> PoolResult<()> {
        match self.options.sync {
            SyncScope::None => Ok(()),
            SyncScope::System => self.executor.synchronize_all(),
            SyncScope::Device => {
                const MAX_TRACKED_DEVICES: i32 = 256;
                let mut seen = [0u32; (MAX_TRACKED_DEVICES >> 5) as usize];
                let mut prev = -1i32;
                for par in params {
                    let mut dev = par.sync_device;
                    if dev < 0 {
                        dev = self.executor.current_device()?;
                    }
                    if dev < MAX_TRACKED_DEVICES {
                        let bin = (dev >> 5) as usize;
                        let mask = 1u32 << (dev & 31);
                        if seen[bin] & mask != 0 {
                            continue; // already synchronized
                        }
                        seen[bin] |= mask;
                    } else if dev == prev {
                        // beyond the bitset range, only squash repeats
                        continue;
                    }
                    self.executor.synchronize_device(dev)?;
                    prev = dev;
                }
                Ok(())
            }
        }
    }

    /// Flush deferred deallocations, when a deferred deallocator is
    /// attached. No-op otherwise.
    pub fn flush_deferred(&self) -> PoolResult<()> {
        match self.flush_hook.get() {
            Some(hook) => hook.flush(),
            None => Ok(()),
        }
    }

    /// Return every owned upstream block and drop all free-list regions.
    pub fn free_all(&self) -> PoolResult<()> {
        let mut state = self.upstream_state.lock()?;
        self.free_list.with(|fl| fl.clear())?;
        while let Some(block) = state.blocks.pop() {
            self.upstream
                .deallocate(block.ptr, block.bytes, block.alignment)?;
        }
        Ok(())
    }

    /// Acquire a block of at least `min_bytes` from upstream, following the
    /// shrink-and-reclaim protocol. Returns the block and its actual size.
    fn get_upstream_block(
        &self,
        min_bytes: usize,
        alignment: usize,
    ) -> PoolResult<(*mut u8, usize)> {
        let mut state = self.upstream_state.lock()?;
        let mut blk_size = next_block_size(&mut state, &self.options, min_bytes);
        let mut tried_reclaim = false;

        let new_block = loop {
            match self.upstream.allocate(blk_size, alignment) {
                Ok(block) => break block,
                Err(err) => {
                    // Outstanding deferred deallocations may free memory;
                    // wait for a batch before deciding anything.
                    self.flush_deferred()?;
                    if !self.options.try_smaller_on_failure {
                        return Err(err);
                    }
                    if blk_size == min_bytes {
                        // Minimum size reached and upstream still failing:
                        // returning wholly-free blocks is the last resort.
                        if tried_reclaim
                            || !self.options.return_to_upstream_on_failure
                            || state.blocks.is_empty()
                        {
                            return Err(err);
                        }
                        let removed: Vec<bool> = self.free_list.with(|fl| {
                            state
                                .blocks
                                .iter()
                                .map(|blk| fl.remove_if_in_list(blk.ptr, blk.bytes))
                                .collect()
                        })?;
                        if !removed.iter().any(|&flag| flag) {
                            return Err(err);
                        }
                        // Reverse order keeps remaining indices stable.
                        for i in (0..state.blocks.len()).rev() {
                            if removed[i] {
                                let blk = state.blocks[i];
                                if let Err(release_err) =
                                    self.upstream.deallocate(blk.ptr, blk.bytes, blk.alignment)
                                {
                                    // Keep the block reachable for free_all.
                                    self.free_list.with(|fl| fl.put(blk.ptr, blk.bytes))?;
                                    return Err(release_err);
                                }
                                state.blocks.remove(i);
                            }
                        }
                        tried_reclaim = true;
                    }
                    blk_size = min_bytes.max(blk_size >> 1);
                    // Pin the cursor to the shrunken size so the next
                    // request does not optimistically upsize again.
                    state.next_block_size = blk_size;
                }
            }
        };

        if let Err(err) = state.blocks.try_reserve(1) {
            let _ = self.upstream.deallocate(new_block, blk_size, alignment);
            return Err(PoolError::MemoryAllocationFailed(format!(
                "failed to record upstream block: {}",
                err
            )));
        }
        state.blocks.push(UpstreamBlock {
            ptr: new_block,
            bytes: blk_size,
            alignment,
        });
        Ok((new_block, blk_size))
    }
}

/// Size of the next upstream block for an `upcoming` allocation.
///
/// The result is aligned to 1/1024th of its size or 4 KiB, whichever is
/// larger. Upstream resources often hand out blocks at coarse granularity
/// with hidden padding; rounding the request makes consecutive blocks more
/// likely to be address-adjacent, so the free list can coalesce across the
/// block boundary once both sides are freed. The cursor then grows by the
/// configured factor, capped at the maximum block size.
fn next_block_size(state: &mut UpstreamState, options: &PoolOptions, upcoming: usize) -> usize {
    let mut actual = upcoming.max(state.next_block_size);
    let alignment = 1usize << actual.ilog2().saturating_sub(10).max(12);
    actual = align_up(actual, alignment);
    let grown = (actual as f64 * options.growth_factor as f64) as usize;
    state.next_block_size = grown.min(options.max_block_size);
    actual
}

fn default_executor() -> Arc<dyn DeviceExecutor> {
    #[cfg(feature = "rocm")]
    {
        Arc::new(crate::backend::HipExecutor)
    }
    #[cfg(not(feature = "rocm"))]
    {
        Arc::new(crate::backend::NullExecutor)
    }
}

impl<U, F, L> MemoryResource for PoolResource<U, F, L>
where
    U: MemoryResource,
    F: FreeList,
    L: PoolLock<F> + Sync,
{
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<*mut u8> {
        PoolResource::allocate(self, bytes, alignment)
    }

    fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) -> PoolResult<()> {
        PoolResource::deallocate(self, ptr, bytes, alignment)
    }

    fn context(&self) -> MemoryContext {
        self.upstream.context()
    }
}

impl<U, F, L> Drop for PoolResource<U, F, L>
where
    U: MemoryResource,
    F: FreeList,
    L: PoolLock<F>,
{
    fn drop(&mut self) {
        // Errors cannot propagate from drop; remaining blocks are lost to
        // the upstream resource's own teardown.
        let _ = self.free_all();
    }
}
