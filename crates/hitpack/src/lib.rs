//! # Hitpack
//!
//! Lossy compression of tracked and untracked detector clusters.
//!
//! The encoder sizes its buffers from the event, binds them on a
//! [`ComputeBackend`], and runs an encode pass that truncates charges and
//! widths to a configured number of significant bits. The output is a
//! self-describing flat dataset that [`CompressedDataset::from_flat`]
//! reads back.
//!
//! ## Example
//!
//! ```
//! use hitpack::{compression_kernels, CompressionProcessor};
//! use hitpack_core::{AttachedClusterFields, CompressedDataset, CompressionSettings, InputSizes, TrackFields};
//! use hitpack_device::{create_backend, DeviceBackendConfig, StreamId};
//!
//! let settings = CompressionSettings::default();
//! let mut backend = create_backend(&DeviceBackendConfig::host(), compression_kernels()?)?;
//! let mut processor = CompressionProcessor::new(settings)?;
//! let params = processor.set_max_data(InputSizes { clusters: 64, tracks: 4, track_clusters: 32 })?;
//! processor.allocate(backend.as_mut())?;
//!
//! let mut dataset = CompressedDataset::allocate(params.output_capacity(), &settings)?;
//! let cluster = AttachedClusterFields { q_tot: 1000, q_max: 45, sigma_pad: 13, ..Default::default() };
//! dataset.view_mut().append_track(TrackFields::default(), &[cluster; 3])?;
//!
//! let done = processor.encode_pass(backend.as_mut(), &dataset, StreamId(0))?;
//! backend.synchronize_events(&[&done])?;
//! let encoded = processor.output_dataset()?;
//! assert_eq!(encoded.view().track_clusters(0).unwrap()[0].q_max, 44);
//! # Ok::<(), hitpack::Error>(())
//! ```

pub mod error;
pub mod kernels;
pub mod processor;

pub use error::{Error, Result};
pub use kernels::{
    compression_kernels, decode_settings, encode_settings, TRACK_FIRST_INDEX, TRUNCATE_FIELD,
};
pub use processor::{CompressionProcessor, EncodeReport, PhasePlans, ProcessorAllocation};

pub use hitpack_core::CompressedDataset;
pub use hitpack_device::ComputeBackend;
