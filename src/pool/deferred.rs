//! Deferred deallocation
//!
//! When the execution context is asynchronous, every `deallocate` must
//! synchronize before its region becomes reusable, and paying that cost per
//! call is catastrophic. [`DeferredDeallocPool`] turns `deallocate` into an
//! enqueue: a background worker swaps a double-buffered queue and returns a
//! whole batch with a single synchronization. Callers that outpace the
//! worker hit the backpressure threshold and pay one batch wait themselves.
//!
//! Only the producer side appends to the current queue; only the worker
//! swaps `queue_idx` and drains the previous one.

use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::backend::{MemoryContext, MemoryResource};
use crate::error::PoolResult;
use crate::pool::free_list::{CoalescingFreeList, FreeList};
use crate::pool::lock::StdPoolLock;
use crate::pool::options::PoolOptions;
use crate::pool::resource::{DeallocParams, FlushHook, PoolResource};

#[derive(Debug, Default)]
struct DeferredState {
    queues: [Vec<DeallocParams>; 2],
    queue_idx: usize,
    /// Entries taken by the worker but not yet returned to the free list.
    /// Keeps an in-flight batch visible to `outstanding_dealloc_count`.
    draining: usize,
    started: bool,
    stopped: bool,
}

impl DeferredState {
    fn no_pending(&self) -> bool {
        self.queues[0].is_empty() && self.queues[1].is_empty() && self.draining == 0
    }

    fn outstanding(&self) -> usize {
        self.queues[0].len() + self.queues[1].len() + self.draining
    }
}

#[derive(Debug, Default)]
pub(crate) struct DeferredShared {
    state: Mutex<DeferredState>,
    /// producer -> worker: work available or stop requested
    work_available: Condvar,
    /// worker -> producers: a batch has been fully processed
    batch_done: Condvar,
}

impl FlushHook for DeferredShared {
    /// Wait until one scheduled batch has been flushed.
    ///
    /// Returns immediately when nothing is pending. Otherwise waits for one
    /// `batch_done` notification, which releases backpressure but does not
    /// guarantee both queues are empty; callers needing a full drain loop
    /// on `no_pending_deallocs`.
    fn flush(&self) -> PoolResult<()> {
        let state = self.state.lock()?;
        if state.no_pending() {
            return Ok(());
        }
        let _state = self.batch_done.wait(state)?;
        Ok(())
    }
}

/// Pool variant that batches deallocations through a background worker.
///
/// `allocate` applies backpressure once too many deallocations are
/// outstanding; `deallocate` routes through the queue when deferred
/// deallocation is enabled in the options and falls back to the synchronous
/// path otherwise.
pub struct DeferredDeallocPool<U, F = CoalescingFreeList>
where
    U: MemoryResource + 'static,
    F: FreeList + 'static,
{
    pool: Arc<PoolResource<U, F, StdPoolLock<F>>>,
    shared: Arc<DeferredShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<U, F> DeferredDeallocPool<U, F>
where
    U: MemoryResource + 'static,
    F: FreeList + 'static,
{
    /// Create a deferred pool over `upstream` with the default executor.
    pub fn new(upstream: Arc<U>, options: PoolOptions) -> Self {
        Self::from_pool(PoolResource::new(upstream, options))
    }

    /// Create a deferred pool with an explicit device executor.
    pub fn with_executor(
        upstream: Arc<U>,
        options: PoolOptions,
        executor: Arc<dyn crate::backend::DeviceExecutor>,
    ) -> Self {
        Self::from_pool(PoolResource::with_executor(upstream, options, executor))
    }

    fn from_pool(pool: PoolResource<U, F, StdPoolLock<F>>) -> Self {
        let shared = Arc::new(DeferredShared::default());
        pool.set_flush_hook(shared.clone());
        DeferredDeallocPool {
            pool: Arc::new(pool),
            shared,
            worker: Mutex::new(None),
        }
    }

    /// The wrapped pool resource.
    pub fn base(&self) -> &PoolResource<U, F, StdPoolLock<F>> {
        &self.pool
    }

    /// Allocate with backpressure: when more deallocations are outstanding
    /// than the configured threshold, wait for one batch to flush first.
    pub fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<*mut u8> {
        if self.pool.options().enable_deferred_deallocation
            && self.outstanding_dealloc_count()?
                > self.pool.options().max_outstanding_deallocations
        {
            self.flush_deferred()?;
        }
        self.pool.allocate(bytes, alignment)
    }

    /// Route through the deferred queue, or synchronously when deferred
    /// deallocation is disabled.
    pub fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) -> PoolResult<()> {
        if self.pool.options().enable_deferred_deallocation {
            self.deferred_deallocate(ptr, bytes, alignment, -1)
        } else {
            self.pool.deallocate(ptr, bytes, alignment)
        }
    }

    /// Enqueue a deallocation for the background worker.
    ///
    /// A negative `device_id` is resolved to the current device here, at
    /// call time, so the eventual synchronization knows what to wait on.
    /// Enqueue transfers ownership of the region to the pool.
    pub fn deferred_deallocate(
        &self,
        ptr: *mut u8,
        bytes: usize,
        alignment: usize,
        device_id: i32,
    ) -> PoolResult<()> {
        if ptr.is_null() || bytes == 0 {
            return Ok(());
        }
        let device_id = if device_id < 0 {
            self.pool.executor().current_device()?
        } else {
            device_id
        };

        {
            let mut state = self.shared.state.lock()?;
            let idx = state.queue_idx;
            state.queues[idx].push(DeallocParams {
                sync_device: device_id,
                ptr,
                bytes,
                alignment,
            });
            if !state.started {
                self.spawn_worker()?;
                state.started = true;
            }
        }
        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Deallocations enqueued or in flight, including the batch the worker
    /// is currently processing.
    pub fn outstanding_dealloc_count(&self) -> PoolResult<usize> {
        Ok(self.shared.state.lock()?.outstanding())
    }

    /// True when both queues are empty and no batch is in flight.
    pub fn no_pending_deallocs(&self) -> PoolResult<bool> {
        Ok(self.shared.state.lock()?.no_pending())
    }

    /// Wait until one currently scheduled batch has been flushed.
    ///
    /// Returns immediately when nothing is pending. One completed batch is
    /// enough to release backpressure, but does not mean both queues are
    /// empty; loop on [`no_pending_deallocs`](Self::no_pending_deallocs)
    /// for a full drain.
    pub fn flush_deferred(&self) -> PoolResult<()> {
        FlushHook::flush(&*self.shared)
    }

    // Called with the producer mutex held; the worker handle mutex nests
    // inside it and nowhere else.
    fn spawn_worker(&self) -> PoolResult<()> {
        let pool = Arc::clone(&self.pool);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("hippool-dealloc".to_string())
            .spawn(move || worker_loop(pool, shared))
            .map_err(|err| {
                crate::error::PoolError::DeviceError(format!(
                    "failed to start deallocation worker: {}",
                    err
                ))
            })?;
        *self.worker.lock()? = Some(handle);
        tracing::debug!("deferred deallocation worker started");
        Ok(())
    }
}

fn worker_loop<U, F>(pool: Arc<PoolResource<U, F, StdPoolLock<F>>>, shared: Arc<DeferredShared>)
where
    U: MemoryResource + 'static,
    F: FreeList + 'static,
{
    let mut state = match shared.state.lock() {
        Ok(guard) => guard,
        Err(_) => return,
    };
    loop {
        // Wake when stopped or when the current queue has work.
        while !state.stopped && state.queues[state.queue_idx].is_empty() {
            state = match shared.work_available.wait(state) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
        if state.stopped {
            break;
        }

        let idx = state.queue_idx;
        let batch = mem::take(&mut state.queues[idx]);
        state.queue_idx = 1 - idx;
        state.draining = batch.len();
        drop(state);

        if let Err(err) = pool.bulk_deallocate(&batch) {
            // The regions were never synchronized, so they must not enter
            // the free list; they remain inside owned blocks and are
            // released wholesale by free_all.
            tracing::error!(
                "deferred deallocation batch of {} regions failed: {}",
                batch.len(),
                err
            );
        }

        state = match shared.state.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        state.draining = 0;
        shared.batch_done.notify_all();
    }
    tracing::debug!("deferred deallocation worker stopped");
}

impl<U, F> MemoryResource for DeferredDeallocPool<U, F>
where
    U: MemoryResource + 'static,
    F: FreeList + 'static,
{
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<*mut u8> {
        DeferredDeallocPool::allocate(self, bytes, alignment)
    }

    fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) -> PoolResult<()> {
        DeferredDeallocPool::deallocate(self, ptr, bytes, alignment)
    }

    fn context(&self) -> MemoryContext {
        self.pool.context()
    }
}

impl<U, F> Drop for DeferredDeallocPool<U, F>
where
    U: MemoryResource + 'static,
    F: FreeList + 'static,
{
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.stopped = true;
        }
        self.shared.work_available.notify_all();
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }

        // Enqueues that missed the worker's last queue swap are still
        // returned to the pool before the base pool tears down.
        let (first, second) = match self.shared.state.lock() {
            Ok(mut state) => (
                mem::take(&mut state.queues[0]),
                mem::take(&mut state.queues[1]),
            ),
            Err(_) => return,
        };
        let _ = self.pool.bulk_deallocate(&first);
        let _ = self.pool.bulk_deallocate(&second);
    }
}
