//! Upstream memory resources and device plumbing
//!
//! This module provides everything the pool treats as "the outside world":
//! the [`MemoryResource`] interface it allocates from, concrete upstream
//! implementations (host heap, pinned host memory, HIP device memory), and
//! the [`DeviceExecutor`] used to synchronize with device queues before a
//! freed region becomes reusable.
//!
//! The HIP-backed pieces are gated behind the `rocm` feature so the pool
//! itself builds and tests on machines without a ROCm installation.

mod executor;
mod heap;
mod resource;

#[cfg(feature = "rocm")]
mod device;
#[cfg(feature = "rocm")]
mod ffi;
#[cfg(feature = "rocm")]
mod hip;

pub use executor::{DeviceExecutor, NullExecutor};
pub use heap::HeapResource;
pub use resource::{MemoryContext, MemoryKind, MemoryResource};

#[cfg(feature = "rocm")]
pub use device::{current_device, device_count, get_error_string, DeviceGuard};
#[cfg(feature = "rocm")]
pub use executor::HipExecutor;
#[cfg(feature = "rocm")]
pub use hip::{DeviceResource, PinnedResource};
