//! # Hitpack Core
//!
//! Lossy significant-bit codec and memory layout for compressed cluster
//! datasets.
//!
//! ## Contents
//!
//! - [`truncate_significant_bits`] - round-to-nearest truncation of a value to
//!   its `n` leading significant bits, saturating below a field ceiling
//! - [`LayoutPlan`] - sizing pass that places every array of a dataset inside
//!   one aligned region, for scratch, device output and host output phases
//! - [`DatasetView`] / [`DatasetViewMut`] - typed windows over a region whose
//!   bytes are also its flat serialized form
//! - [`CompressionSettings`] - per-field precision and storage mode
//!
//! ## Example
//!
//! ```
//! use hitpack_core::{truncate_significant_bits, P_MAX_QMAX};
//!
//! assert_eq!(truncate_significant_bits(22, 3, P_MAX_QMAX), 24);
//! assert_eq!(truncate_significant_bits(1023, 3, P_MAX_QMAX), 1023);
//! ```

pub mod constants;
pub mod dataset;
pub mod error;
pub mod layout;
pub mod settings;
pub mod truncate;

pub use constants::{
    QuantizedField, BUFFER_ALIGNMENT, NSLICES, P_MAX_FLAGS, P_MAX_PAD, P_MAX_QMAX, P_MAX_QPT,
    P_MAX_QTOT, P_MAX_SIGMA, P_MAX_TIME, ROW_COUNT,
};
pub use dataset::{
    place, place_mut, AttachedClusterFields, CompressedDataset, DatasetHeader, DatasetView,
    DatasetViewMut, TrackFields, UnattachedClusterFields, TRUNCATED_ARRAYS,
};
pub use error::{Error, Result};
pub use layout::{
    AllocationPhase, ArrayId, ArraySpan, CapacityParams, Counts, DatasetCapacity, InputSizes,
    LayoutPlan, HEADER_SIZE,
};
pub use settings::{validate_precision, CompressionSettings};
pub use truncate::{
    bit_length, truncate_charge, truncate_charge_max, truncate_field, truncate_le_elements,
    truncate_significant_bits, truncate_width, SignificantBits,
};
