//! Coalescing memory pool
//!
//! The pool caches upstream blocks and recycles freed regions through a
//! merging free list, so the expensive upstream allocator (OS heap,
//! `hipMalloc`) is only consulted when the pool genuinely runs out.
//! [`DeferredDeallocPool`] additionally batches deallocations behind a
//! background worker so device synchronization is paid once per batch.

pub mod deferred;
pub mod free_list;
pub mod lock;
pub mod options;
pub mod resource;

pub use deferred::DeferredDeallocPool;
pub use free_list::{CoalescingFreeList, FreeList};
pub use lock::{PoolLock, SingleThreadLock, StdPoolLock};
pub use options::{PoolOptions, SyncScope};
pub use resource::{DeallocParams, PoolResource};
