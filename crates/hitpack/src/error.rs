//! Error types for the compression processor.

use hitpack_device::DeviceError;
use thiserror::Error;

/// Result type for processor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while planning or running an encode pass.
#[derive(Error, Debug)]
pub enum Error {
    /// Layout, sizing or record error.
    #[error(transparent)]
    Core(#[from] hitpack_core::Error),

    /// Backend error.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// A step was called before the one it depends on.
    #[error("processor not ready: {0}")]
    NotReady(&'static str),
}

impl Error {
    /// Check if the processor stays usable after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Core(e) => e.is_recoverable(),
            Error::Device(e) => e.is_recoverable(),
            Error::NotReady(_) => true,
        }
    }

    /// Get error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Core(e) => e.category(),
            Error::Device(e) => e.category(),
            Error::NotReady(_) => "not_ready",
        }
    }
}
