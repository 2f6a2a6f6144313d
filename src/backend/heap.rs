//! Host heap upstream resource

use std::alloc::Layout;
use std::ptr;

use crate::backend::resource::{MemoryContext, MemoryResource};
use crate::error::{PoolError, PoolResult};

/// Upstream resource backed by the process heap (`std::alloc`).
///
/// Suitable as the upstream of a host pool; every allocation is a real heap
/// allocation, which is exactly the cost the pool exists to amortize.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapResource;

fn layout_for(bytes: usize, alignment: usize) -> PoolResult<Layout> {
    Layout::from_size_align(bytes, alignment.max(1)).map_err(|err| {
        PoolError::MemoryAllocationFailed(format!(
            "invalid layout for {} bytes aligned to {}: {}",
            bytes, alignment, err
        ))
    })
}

impl MemoryResource for HeapResource {
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<*mut u8> {
        if bytes == 0 {
            return Ok(ptr::null_mut());
        }
        let layout = layout_for(bytes, alignment)?;
        // SAFETY: layout has non-zero size; the pointer is checked below.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(PoolError::MemoryAllocationFailed(format!(
                "host heap exhausted allocating {} bytes",
                bytes
            )));
        }
        tracing::trace!("HeapResource: allocated {} bytes at {:p}", bytes, ptr);
        Ok(ptr)
    }

    fn deallocate(&self, ptr: *mut u8, bytes: usize, alignment: usize) -> PoolResult<()> {
        if ptr.is_null() || bytes == 0 {
            return Ok(());
        }
        let layout = layout_for(bytes, alignment)?;
        // SAFETY: the caller passes back the (ptr, bytes, alignment) triple
        // it received from allocate, which is the std::alloc contract.
        unsafe { std::alloc::dealloc(ptr, layout) };
        Ok(())
    }

    fn context(&self) -> MemoryContext {
        MemoryContext::host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocate_honors_alignment() {
        let heap = HeapResource;
        for alignment in [1usize, 8, 64, 256, 4096] {
            let ptr = heap.allocate(100, alignment).unwrap();
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % alignment, 0);
            heap.deallocate(ptr, 100, alignment).unwrap();
        }
    }

    #[test]
    fn test_heap_zero_bytes_returns_null() {
        let heap = HeapResource;
        let ptr = heap.allocate(0, 64).unwrap();
        assert!(ptr.is_null());
        heap.deallocate(ptr, 0, 64).unwrap();
    }

    #[test]
    fn test_heap_rejects_bad_alignment() {
        let heap = HeapResource;
        assert!(heap.allocate(100, 3).is_err());
    }
}
