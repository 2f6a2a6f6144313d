//! HIP FFI bindings
//!
//! Minimal subset of the ROCm HIP API used by the device upstream resources
//! and the device executor. The dead_code allowance is needed because FFI
//! symbols appear unused to the compiler (they're only called through
//! unsafe blocks).

use std::ffi::c_void;

#[link(name = "amdhip64")]
#[allow(dead_code)]
extern "C" {
    pub fn hipGetDevice(deviceId: *mut i32) -> i32;
    pub fn hipSetDevice(deviceId: i32) -> i32;
    pub fn hipGetDeviceCount(count: *mut i32) -> i32;
    pub fn hipDeviceSynchronize() -> i32;
    pub fn hipMalloc(ptr: *mut *mut c_void, size: usize) -> i32;
    pub fn hipFree(ptr: *mut c_void) -> i32;
    pub fn hipHostMalloc(ptr: *mut *mut c_void, size: usize, flags: u32) -> i32;
    pub fn hipHostFree(ptr: *mut c_void) -> i32;
    pub fn hipMemGetInfo(free: *mut usize, total: *mut usize) -> i32;
    pub fn hipGetErrorString(error: i32) -> *const i8;
}

/// HIP success code
pub const HIP_SUCCESS: i32 = 0;

/// Default hipHostMalloc flags (portable pinned memory)
pub const HIP_HOST_MALLOC_DEFAULT: u32 = 0x0;
