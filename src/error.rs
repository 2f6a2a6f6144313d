//! Unified error handling for hippool
//!
//! Every fallible operation in the crate returns [`PoolResult`]. Errors are
//! classified so callers can decide whether retrying makes sense: upstream
//! exhaustion is usually transient (freeing memory elsewhere may make the
//! next attempt succeed), while a failed device synchronization means the
//! pool can no longer guarantee that a freed region is safe to reuse.

use thiserror::Error;

/// Error type shared by the pool, the upstream resources and the device
/// executor.
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    /// The upstream resource could not satisfy an allocation, even after
    /// the retry/reclaim protocol ran to completion.
    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    /// Synchronizing with a device queue failed. The region being
    /// deallocated is *not* returned to the free list in this case.
    #[error("Device synchronization failed: {0}")]
    SynchronizationFailed(String),

    /// A device query or device switch failed.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// Requested alignment the resource cannot honor.
    #[error("Unsupported alignment: requested {requested}, resource provides at most {supported}")]
    UnsupportedAlignment { requested: usize, supported: usize },

    #[error("Internal lock poisoned - this indicates a bug: {0}")]
    LockPoisoned(String),
}

impl<T> From<std::sync::PoisonError<T>> for PoolError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        PoolError::LockPoisoned(format!("Lock poisoned: {}", err))
    }
}

/// Result type used throughout the crate.
pub type PoolResult<T> = Result<T, PoolError>;

impl PoolError {
    /// Check if this error is recoverable (temporary condition)
    ///
    /// Allocation failures may succeed on retry once other consumers free
    /// memory; device errors may clear after a driver hiccup. A failed
    /// synchronization or a poisoned lock should not be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoolError::MemoryAllocationFailed(_) | PoolError::DeviceError(_)
        )
    }

    /// Check if this error is permanent (should never retry)
    pub fn is_permanent(&self) -> bool {
        !self.is_recoverable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(PoolError::MemoryAllocationFailed("oom".to_string()).is_recoverable());
        assert!(PoolError::DeviceError("busy".to_string()).is_recoverable());

        assert!(PoolError::SynchronizationFailed("queue".to_string()).is_permanent());
        assert!(PoolError::LockPoisoned("bug".to_string()).is_permanent());
        assert!(PoolError::UnsupportedAlignment {
            requested: 512,
            supported: 256
        }
        .is_permanent());
    }

    #[test]
    fn test_poison_error_conversion() {
        use std::sync::PoisonError;

        fn convert<T>(err: PoisonError<T>) -> PoolError {
            PoolError::from(err)
        }

        // Type check verifies the impl exists without actually poisoning a lock.
        let _ = convert::<i32> as fn(PoisonError<i32>) -> PoolError;
    }

    #[test]
    fn test_error_display() {
        let err = PoolError::MemoryAllocationFailed("hipMalloc failed".to_string());
        assert_eq!(
            err.to_string(),
            "Memory allocation failed: hipMalloc failed"
        );

        let err = PoolError::UnsupportedAlignment {
            requested: 4096,
            supported: 256,
        };
        assert!(err.to_string().contains("4096"));
        assert!(err.to_string().contains("256"));
    }
}
