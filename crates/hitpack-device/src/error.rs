//! Error types for compute backends.

use thiserror::Error;

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

/// Errors raised by a compute backend.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No compatible device, or binding to it failed.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// A copy could not schedule the requested number of bytes.
    #[error("transfer failure: requested {requested} bytes, scheduled {scheduled}")]
    TransferFailure { requested: usize, scheduled: usize },

    /// Operation on an unknown, released or unregistered resource.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Operation not legal in the current backend state.
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    /// Device memory limit reached.
    #[error("device allocation failed: requested {requested} bytes, available {available}")]
    OutOfMemory { requested: usize, available: usize },

    /// A fixed-size pool has no free slot.
    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    /// Kernel lookup, argument binding or execution failed.
    #[error("kernel launch failed: {0}")]
    KernelLaunch(String),

    /// Backend configuration rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Dataset layout error raised while preparing device work.
    #[error(transparent)]
    Layout(#[from] hitpack_core::Error),

    /// Configuration could not be parsed.
    #[error("configuration parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CUDA driver error.
    #[cfg(feature = "cuda")]
    #[error("CUDA driver error: {0}")]
    Driver(#[from] cudarc::driver::DriverError),
}

impl DeviceError {
    /// Create a kernel launch error.
    pub fn kernel(message: impl Into<String>) -> Self {
        DeviceError::KernelLaunch(message.into())
    }

    /// Create an invalid handle error.
    pub fn handle(message: impl Into<String>) -> Self {
        DeviceError::InvalidHandle(message.into())
    }

    /// Copy of this error for another waiter on the same fault.
    ///
    /// Variants wrapping foreign errors come back as a kernel launch error
    /// carrying their message.
    pub fn replay(&self) -> Self {
        match self {
            DeviceError::DeviceUnavailable(m) => DeviceError::DeviceUnavailable(m.clone()),
            DeviceError::TransferFailure {
                requested,
                scheduled,
            } => DeviceError::TransferFailure {
                requested: *requested,
                scheduled: *scheduled,
            },
            DeviceError::InvalidHandle(m) => DeviceError::InvalidHandle(m.clone()),
            DeviceError::InvalidState { expected, actual } => DeviceError::InvalidState {
                expected: *expected,
                actual: *actual,
            },
            DeviceError::OutOfMemory {
                requested,
                available,
            } => DeviceError::OutOfMemory {
                requested: *requested,
                available: *available,
            },
            DeviceError::PoolExhausted(m) => DeviceError::PoolExhausted(m.clone()),
            DeviceError::KernelLaunch(m) => DeviceError::KernelLaunch(m.clone()),
            DeviceError::InvalidConfig(m) => DeviceError::InvalidConfig(m.clone()),
            other => DeviceError::kernel(other.to_string()),
        }
    }

    /// Check if the backend stays usable after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DeviceError::TransferFailure { .. }
            | DeviceError::InvalidHandle(_)
            | DeviceError::OutOfMemory { .. }
            | DeviceError::PoolExhausted(_)
            | DeviceError::InvalidConfig(_) => true,
            DeviceError::Layout(e) => e.is_recoverable(),
            _ => false,
        }
    }

    /// Check if this error indicates the device itself is unusable.
    pub fn is_device_error(&self) -> bool {
        match self {
            DeviceError::DeviceUnavailable(_) => true,
            #[cfg(feature = "cuda")]
            DeviceError::Driver(_) => true,
            _ => false,
        }
    }

    /// Get error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            DeviceError::DeviceUnavailable(_) => "device_unavailable",
            DeviceError::TransferFailure { .. } => "transfer_failure",
            DeviceError::InvalidHandle(_) => "invalid_handle",
            DeviceError::InvalidState { .. } => "invalid_state",
            DeviceError::OutOfMemory { .. } => "out_of_memory",
            DeviceError::PoolExhausted(_) => "pool_exhausted",
            DeviceError::KernelLaunch(_) => "kernel_launch",
            DeviceError::InvalidConfig(_) => "invalid_config",
            DeviceError::Layout(e) => e.category(),
            DeviceError::Json(_) => "config",
            DeviceError::Io(_) => "io_error",
            #[cfg(feature = "cuda")]
            DeviceError::Driver(_) => "driver",
        }
    }
}
