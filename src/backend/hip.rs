//! HIP-backed upstream resources
//!
//! `hipMalloc` and `hipHostMalloc` have no alignment parameter; they return
//! memory aligned to at least 256 bytes. Requests for stricter alignment
//! are rejected rather than silently mis-served.

use std::ptr;

use crate::backend::device::{get_error_string, DeviceGuard};
use crate::backend::ffi;
use crate::backend::resource::{MemoryContext, MemoryResource};
use crate::error::{PoolError, PoolResult};

/// Alignment guaranteed by the HIP allocation routines.
const HIP_ALLOC_ALIGNMENT: usize = 256;

fn check_alignment(alignment: usize) -> PoolResult<()> {
    if alignment > HIP_ALLOC_ALIGNMENT {
        return Err(PoolError::UnsupportedAlignment {
            requested: alignment,
            supported: HIP_ALLOC_ALIGNMENT,
        });
    }
    Ok(())
}

/// Upstream resource handing out device-local memory on a fixed device.
#[derive(Debug)]
pub struct DeviceResource {
    device_id: i32,
}

impl DeviceResource {
    pub fn new(device_id: i32) -> Self {
        DeviceResource { device_id }
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }
}

impl MemoryResource for DeviceResource {
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<*mut u8> {
        if bytes == 0 {
            return Ok(ptr::null_mut());
        }
        check_alignment(alignment)?;

        let _guard = DeviceGuard::new(self.device_id)?;
        let mut raw: *mut std::ffi::c_void = ptr::null_mut();
        let result = unsafe { ffi::hipMalloc(&mut raw, bytes) };
        if result != ffi::HIP_SUCCESS {
            tracing::debug!(
                "DeviceResource: hipMalloc of {} bytes on device {} failed: {}",
                bytes,
                self.device_id,
                get_error_string(result)
            );
            return Err(PoolError::MemoryAllocationFailed(format!(
                "hipMalloc failed for {} bytes on device {}: {}",
                bytes,
                self.device_id,
                get_error_string(result)
            )));
        }
        if raw.is_null() {
            return Err(PoolError::MemoryAllocationFailed(format!(
                "hipMalloc returned null for {} bytes on device {}",
                bytes, self.device_id
            )));
        }
        tracing::trace!(
            "DeviceResource: allocated {} bytes at {:p} on device {}",
            bytes,
            raw,
            self.device_id
        );
        Ok(raw as *mut u8)
    }

    fn deallocate(&self, ptr: *mut u8, bytes: usize, _alignment: usize) -> PoolResult<()> {
        if ptr.is_null() || bytes == 0 {
            return Ok(());
        }
        let _guard = DeviceGuard::new(self.device_id)?;
        let result = unsafe { ffi::hipFree(ptr as *mut std::ffi::c_void) };
        if result != ffi::HIP_SUCCESS {
            return Err(PoolError::DeviceError(format!(
                "hipFree of {:p} on device {} failed: {}",
                ptr,
                self.device_id,
                get_error_string(result)
            )));
        }
        Ok(())
    }

    fn context(&self) -> MemoryContext {
        MemoryContext::device(self.device_id)
    }
}

/// Upstream resource handing out page-locked host memory.
#[derive(Debug, Default)]
pub struct PinnedResource;

impl MemoryResource for PinnedResource {
    fn allocate(&self, bytes: usize, alignment: usize) -> PoolResult<*mut u8> {
        if bytes == 0 {
            return Ok(ptr::null_mut());
        }
        check_alignment(alignment)?;

        let mut raw: *mut std::ffi::c_void = ptr::null_mut();
        let result =
            unsafe { ffi::hipHostMalloc(&mut raw, bytes, ffi::HIP_HOST_MALLOC_DEFAULT) };
        if result != ffi::HIP_SUCCESS {
            return Err(PoolError::MemoryAllocationFailed(format!(
                "hipHostMalloc failed for {} bytes: {}",
                bytes,
                get_error_string(result)
            )));
        }
        if raw.is_null() {
            return Err(PoolError::MemoryAllocationFailed(format!(
                "hipHostMalloc returned null for {} bytes",
                bytes
            )));
        }
        tracing::trace!("PinnedResource: allocated {} bytes at {:p}", bytes, raw);
        Ok(raw as *mut u8)
    }

    fn deallocate(&self, ptr: *mut u8, bytes: usize, _alignment: usize) -> PoolResult<()> {
        if ptr.is_null() || bytes == 0 {
            return Ok(());
        }
        let result = unsafe { ffi::hipHostFree(ptr as *mut std::ffi::c_void) };
        if result != ffi::HIP_SUCCESS {
            return Err(PoolError::DeviceError(format!(
                "hipHostFree of {:p} failed: {}",
                ptr,
                get_error_string(result)
            )));
        }
        Ok(())
    }

    fn context(&self) -> MemoryContext {
        MemoryContext::pinned()
    }
}
