//! hippool - Coalescing memory pool for ROCm/HIP workloads
//!
//! A pooling memory resource layered over an expensive upstream allocator
//! (host heap, `hipMalloc`, pinned host memory). Freed regions are cached
//! in a merging free list and handed back to later allocations, with device
//! synchronization folded into deallocation so reused memory is always safe
//! in the execution context the pool serves.
//!
//! The deferred variant moves that synchronization off the caller's thread:
//! deallocations queue up and a background worker returns them to the pool
//! one batch - and one synchronization - at a time.

pub mod backend;
pub mod error;
pub mod logging;
pub mod pool;

pub use backend::{
    DeviceExecutor, HeapResource, MemoryContext, MemoryKind, MemoryResource, NullExecutor,
};
pub use error::{PoolError, PoolResult};
pub use pool::{
    CoalescingFreeList, DeallocParams, DeferredDeallocPool, FreeList, PoolLock, PoolOptions,
    PoolResource, SingleThreadLock, StdPoolLock, SyncScope,
};

#[cfg(feature = "rocm")]
pub use backend::{DeviceResource, HipExecutor, PinnedResource};
