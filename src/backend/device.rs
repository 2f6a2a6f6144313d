//! HIP device queries and the device guard

use std::ffi::CStr;

use crate::backend::ffi;
use crate::error::{PoolError, PoolResult};

/// Get HIP error string from error code
pub fn get_error_string(error: i32) -> String {
    unsafe {
        let error_ptr = ffi::hipGetErrorString(error);
        if error_ptr.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(error_ptr).to_string_lossy().into_owned()
        }
    }
}

/// Ordinal of the device the calling thread is currently bound to.
pub fn current_device() -> PoolResult<i32> {
    let mut device = -1i32;
    let result = unsafe { ffi::hipGetDevice(&mut device) };
    if result != ffi::HIP_SUCCESS {
        return Err(PoolError::DeviceError(format!(
            "hipGetDevice failed: {}",
            get_error_string(result)
        )));
    }
    Ok(device)
}

/// Bind the calling thread to `device`.
pub fn set_device(device: i32) -> PoolResult<()> {
    let result = unsafe { ffi::hipSetDevice(device) };
    if result != ffi::HIP_SUCCESS {
        return Err(PoolError::DeviceError(format!(
            "hipSetDevice({}) failed: {}",
            device,
            get_error_string(result)
        )));
    }
    Ok(())
}

/// Number of HIP devices visible to the process.
pub fn device_count() -> PoolResult<i32> {
    let mut count = 0i32;
    let result = unsafe { ffi::hipGetDeviceCount(&mut count) };
    if result != ffi::HIP_SUCCESS {
        return Err(PoolError::DeviceError(format!(
            "hipGetDeviceCount failed: {}",
            get_error_string(result)
        )));
    }
    Ok(count)
}

/// RAII device switch: binds the thread to a device and restores the
/// previous binding on drop.
///
/// Passing a negative device keeps the current binding.
pub struct DeviceGuard {
    previous: i32,
}

impl DeviceGuard {
    pub fn new(device: i32) -> PoolResult<Self> {
        let previous = current_device()?;
        if device >= 0 && device != previous {
            set_device(device)?;
        }
        Ok(DeviceGuard { previous })
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        if let Err(err) = set_device(self.previous) {
            tracing::error!("DeviceGuard failed to restore device {}: {}", self.previous, err);
        }
    }
}
