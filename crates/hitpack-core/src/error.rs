//! Error types for the codec and dataset layout.

use thiserror::Error;

/// Result type alias for layout and codec operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Codec and layout error types.
#[derive(Debug, Error)]
pub enum Error {
    /// A requested population or layout does not fit the sized capacity.
    #[error("sizing failure for {array}: requested {requested}, capacity {capacity}")]
    SizingFailure {
        array: &'static str,
        requested: u64,
        capacity: u64,
    },

    /// A precision setting is inconsistent with the field it applies to.
    #[error("invalid precision for {field}: {bits} significant bits with maximum {max}")]
    PrecisionConfiguration {
        field: &'static str,
        bits: u32,
        max: u32,
    },

    /// A flat buffer does not describe a valid dataset.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// A record handed to the mutation API is malformed.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Configuration could not be parsed.
    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),

    /// I/O error while loading configuration.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a sizing failure.
    pub fn sizing(array: &'static str, requested: u64, capacity: u64) -> Self {
        Error::SizingFailure {
            array,
            requested,
            capacity,
        }
    }

    /// Create a corrupted data error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Error::CorruptedData(message.into())
    }

    /// Check if the caller can recover by re-sizing and retrying.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SizingFailure { .. })
    }

    /// Get error category for metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Error::SizingFailure { .. } => "sizing_failure",
            Error::PrecisionConfiguration { .. } => "precision_configuration",
            Error::CorruptedData(_) => "corrupted_data",
            Error::InvalidRecord(_) => "invalid_record",
            Error::Config(_) => "config",
            Error::Io(_) => "io_error",
        }
    }
}
