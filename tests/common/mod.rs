//! Shared test doubles: an instrumented upstream resource and a device
//! executor that records which devices it synchronized.

// Each test binary uses its own subset of these helpers.
#![allow(dead_code)]

use std::alloc::Layout;
use std::collections::HashMap;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex};

use hippool::{DeviceExecutor, MemoryContext, MemoryResource, PoolError, PoolResult};

/// Allocation granted by [`MockUpstream`], keyed by the pointer handed out.
struct Grant {
    base: *mut u8,
    layout: Layout,
    bytes: usize,
}

unsafe impl Send for Grant {}

#[derive(Default)]
struct MockState {
    grants: HashMap<usize, Grant>,
    outstanding_bytes: usize,
    alloc_calls: usize,
    alloc_failures: usize,
    dealloc_calls: usize,
    alloc_sizes: Vec<usize>,
}

/// Heap-backed upstream with a capacity cap, call counters and an optional
/// "exact alignment" mode.
///
/// In exact-alignment mode every pointer is aligned to precisely the
/// requested alignment and to nothing coarser, which makes alignment-driven
/// free-list misses deterministic in tests.
pub struct MockUpstream {
    state: Mutex<MockState>,
    capacity: Option<usize>,
    exact_alignment: bool,
}

/// Upper bound on alignments used by tests in exact-alignment mode.
const EXACT_MODE_BASE_ALIGN: usize = 1 << 15;

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(MockUpstream {
            state: Mutex::default(),
            capacity: None,
            exact_alignment: false,
        })
    }

    /// Fail any allocation that would push total outstanding bytes past
    /// `bytes`.
    pub fn with_capacity(bytes: usize) -> Arc<Self> {
        Arc::new(MockUpstream {
            state: Mutex::default(),
            capacity: Some(bytes),
            exact_alignment: false,
        })
    }

    pub fn with_capacity_exact_alignment(bytes: usize) -> Arc<Self> {
        Arc::new(MockUpstream {
            state: Mutex::default(),
            capacity: Some(bytes),
            exact_alignment: true,
        })
    }

    pub fn alloc_calls(&self) -> usize {
        self.state.lock().unwrap().alloc_calls
    }

    pub fn alloc_failures(&self) -> usize {
        self.state.lock().unwrap().alloc_failures
    }

    pub fn dealloc_calls(&self) -> usize {
        self.state.lock().unwrap().dealloc_calls
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.state.lock().unwrap().outstanding_bytes
    }

    pub fn outstanding_grants(&self) -> usize {
        self.state.lock().unwrap().grants.len()
    }

    /// Sizes passed to `allocate`, in call order, including failed calls.
    pub fn alloc_sizes(&self) -> Vec<usize> {
        self.state.lock().unwrap().alloc_sizes.clone()
    }
}

impl MemoryResource for MockUpstream {
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<*mut u8> {
        if bytes == 0 {
            return Ok(ptr::null_mut());
        }
        let mut state = self.state.lock().unwrap();
        state.alloc_calls += 1;
        state.alloc_sizes.push(bytes);

        if let Some(capacity) = self.capacity {
            if state.outstanding_bytes + bytes > capacity {
                state.alloc_failures += 1;
                return Err(PoolError::MemoryAllocationFailed(format!(
                    "mock capacity exceeded: {} outstanding + {} requested > {}",
                    state.outstanding_bytes, bytes, capacity
                )));
            }
        }

        let (base, layout, granted) = if self.exact_alignment {
            assert!(
                alignment <= EXACT_MODE_BASE_ALIGN,
                "test requested alignment beyond exact mode's base"
            );
            // Over-allocate from a coarsely aligned base, then skew the
            // granted pointer by exactly `alignment` bytes: aligned to the
            // request, misaligned to every larger power of two.
            let layout =
                Layout::from_size_align(bytes + alignment, EXACT_MODE_BASE_ALIGN * 2).unwrap();
            let base = unsafe { std::alloc::alloc(layout) };
            assert!(!base.is_null());
            let granted = (base as usize + alignment) as *mut u8;
            (base, layout, granted)
        } else {
            let layout = Layout::from_size_align(bytes, alignment.max(1)).unwrap();
            let base = unsafe { std::alloc::alloc(layout) };
            assert!(!base.is_null());
            (base, layout, base)
        };

        state.outstanding_bytes += bytes;
        state.grants.insert(
            granted as usize,
            Grant {
                base,
                layout,
                bytes,
            },
        );
        Ok(granted)
    }

    fn deallocate(&self, ptr: *mut u8, bytes: usize, _alignment: usize) -> PoolResult<()> {
        if ptr.is_null() || bytes == 0 {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        state.dealloc_calls += 1;
        let grant = state
            .grants
            .remove(&(ptr as usize))
            .expect("deallocate of a pointer the mock never granted");
        assert_eq!(grant.bytes, bytes, "deallocate size mismatch");
        state.outstanding_bytes -= grant.bytes;
        unsafe { std::alloc::dealloc(grant.base, grant.layout) };
        Ok(())
    }

    fn context(&self) -> MemoryContext {
        MemoryContext::device(0)
    }
}

/// Executor that records synchronizations instead of performing them.
///
/// `gate_closed` makes `synchronize_device` block until [`open_gate`] is
/// called, so tests can hold the deferred worker mid-batch.
pub struct RecordingExecutor {
    current: i32,
    device_total: i32,
    synced: Mutex<Vec<i32>>,
    gate: Mutex<bool>,
    gate_open: Condvar,
}

impl RecordingExecutor {
    pub fn new(current: i32, device_total: i32) -> Arc<Self> {
        Arc::new(RecordingExecutor {
            current,
            device_total,
            synced: Mutex::new(Vec::new()),
            gate: Mutex::new(true),
            gate_open: Condvar::new(),
        })
    }

    pub fn with_closed_gate(current: i32, device_total: i32) -> Arc<Self> {
        let exec = Self::new(current, device_total);
        *exec.gate.lock().unwrap() = false;
        exec
    }

    pub fn open_gate(&self) {
        *self.gate.lock().unwrap() = true;
        self.gate_open.notify_all();
    }

    /// Devices synchronized so far, in call order.
    pub fn synced_devices(&self) -> Vec<i32> {
        self.synced.lock().unwrap().clone()
    }
}

impl DeviceExecutor for RecordingExecutor {
    fn current_device(&self) -> PoolResult<i32> {
        Ok(self.current)
    }

    fn device_count(&self) -> PoolResult<i32> {
        Ok(self.device_total)
    }

    fn synchronize_device(&self, device: i32) -> PoolResult<()> {
        let mut open = self.gate.lock().unwrap();
        while !*open {
            open = self.gate_open.wait(open).unwrap();
        }
        drop(open);
        self.synced.lock().unwrap().push(device);
        Ok(())
    }
}
