//! Compute Backends for hitpack
//!
//! A single [`ComputeBackend`] trait fronts every device the encoder can run
//! on. Each backend owns a fixed pool of asynchronous streams, a pool of event
//! slots, a device memory table and a broadcast constant region.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────── ComputeBackend ────────────────┐
//!  controller  │  streams[0..n]   events[0..m]   memory table    │
//!  ──────────▶ │  ┌──┐┌──┐┌──┐    ┌─┐┌─┐┌─┐       id → buffer    │
//!   copies     │  │s0││s1││s2│ …  │e││e││e│     constant region │
//!   kernels    │  └──┘└──┘└──┘    └─┘└─┘└─┘                       │
//!   events     └──────────────────────────────────────────────────┘
//!                  │ HostBackend: worker thread per stream
//!                  │ CudaBackend: driver API, serialized (feature "cuda")
//! ```
//!
//! Work on one stream executes in submission order. Work on different
//! streams is ordered only through events: record a marker on the producing
//! stream and make the consuming stream wait for it.
//!
//! # Example
//!
//! ```
//! use hitpack_device::{create_backend, DeviceBackendConfig, HostBuffer, KernelRegistry, StreamId, Transfer};
//!
//! let mut backend = create_backend(&DeviceBackendConfig::host(), KernelRegistry::new())?;
//! let device = backend.alloc_device(4)?;
//! let input = HostBuffer::from_slice(&[1, 2, 3, 4]);
//! let output = HostBuffer::new(4);
//!
//! backend.submit_copy(Transfer::upload(&input, device.ptr()), 4, StreamId(0), None)?;
//! backend.submit_copy(Transfer::download(device.ptr(), &output), 4, StreamId(0), None)?;
//! backend.synchronize_stream(StreamId(0))?;
//! assert_eq!(output.to_vec()?, vec![1, 2, 3, 4]);
//! # Ok::<(), hitpack_device::DeviceError>(())
//! ```

pub mod backend;
pub mod config;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod error;
pub mod event;
pub mod host;
pub mod kernels;
pub mod memory;
pub mod stream;

pub use backend::{
    BackendState, ComputeBackend, DeviceInfo, ProfileRegion, Profiler, ThreadContext, Transfer,
    TransferDirection,
};
pub use config::{DeviceBackendConfig, DeviceKind, RuntimeSettings};
#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;
pub use error::{DeviceError, Result};
pub use event::Event;
pub use host::HostBackend;
pub use kernels::{
    KernelArg, KernelBody, KernelContext, KernelDescriptor, KernelId, KernelLaunch,
    KernelOccupancy, KernelRegistry, LaunchShape, PtxSource, ResolvedArg,
};
pub use memory::{BufferView, DeviceBuffer, DevicePtr, HostBuffer, PoolStats};
pub use stream::{StreamId, StreamStatus};

/// Whether a backend of `kind` can be created in this build and environment.
pub fn is_available(kind: DeviceKind) -> bool {
    match kind {
        DeviceKind::Host => true,
        #[cfg(feature = "cuda")]
        DeviceKind::Cuda => cuda::is_available(),
        #[cfg(not(feature = "cuda"))]
        DeviceKind::Cuda => false,
    }
}

/// Create and initialize the backend selected by `config`.
///
/// `kernels` moves into the backend; no kernel can be added afterwards.
pub fn create_backend(config: &DeviceBackendConfig, kernels: KernelRegistry) -> Result<Box<dyn ComputeBackend>> {
    let mut backend: Box<dyn ComputeBackend> = match config.device_kind {
        DeviceKind::Host => Box::new(HostBackend::new(config.clone(), kernels)?),
        #[cfg(feature = "cuda")]
        DeviceKind::Cuda => Box::new(CudaBackend::new(config.clone(), kernels)?),
        #[cfg(not(feature = "cuda"))]
        DeviceKind::Cuda => {
            return Err(DeviceError::DeviceUnavailable(
                "built without the \"cuda\" feature".into(),
            ))
        }
    };
    backend.init_device()?;
    tracing::info!(kind = ?config.device_kind, "compute backend ready");
    Ok(backend)
}
