//! The compute backend interface.
//!
//! ```text
//!  Uninitialized ──init_device──▶ Initialized ──exit_device──▶ ShuttingDown ──▶ Uninitialized
//!                                   │  streams: Ready ⇄ Busy
//!                                   └─ update_settings (any time)
//! ```
//!
//! Calls are made from one controlling thread per backend. Only
//! `synchronize_*`, `init_device` and `exit_device` block; copies and
//! dispatches on a non-default stream return once enqueued.

use crate::config::{DeviceKind, RuntimeSettings};
use crate::error::{DeviceError, Result};
use crate::event::Event;
use crate::kernels::{KernelLaunch, KernelOccupancy};
use crate::memory::{DeviceBuffer, DevicePtr, HostBuffer, PoolStats};
use crate::stream::{StreamId, StreamStatus};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Life-cycle state of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
    Uninitialized,
    Initialized,
    ShuttingDown,
}

impl BackendState {
    /// State name.
    pub fn name(self) -> &'static str {
        match self {
            BackendState::Uninitialized => "uninitialized",
            BackendState::Initialized => "initialized",
            BackendState::ShuttingDown => "shutting down",
        }
    }

    /// Fail unless the backend is initialized.
    pub fn require_initialized(self) -> Result<()> {
        if self != BackendState::Initialized {
            return Err(DeviceError::InvalidState {
                expected: BackendState::Initialized.name(),
                actual: self.name(),
            });
        }
        Ok(())
    }
}

/// Direction of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Endpoints of a copy.
#[derive(Debug, Clone, Copy)]
pub enum Transfer<'a> {
    HostToDevice {
        src: &'a HostBuffer,
        src_offset: usize,
        dst: DevicePtr,
    },
    DeviceToHost {
        src: DevicePtr,
        dst: &'a HostBuffer,
        dst_offset: usize,
    },
    DeviceToDevice {
        src: DevicePtr,
        dst: DevicePtr,
    },
}

impl<'a> Transfer<'a> {
    /// Upload from the start of `src`.
    pub fn upload(src: &'a HostBuffer, dst: DevicePtr) -> Self {
        Transfer::HostToDevice {
            src,
            src_offset: 0,
            dst,
        }
    }

    /// Download into the start of `dst`.
    pub fn download(src: DevicePtr, dst: &'a HostBuffer) -> Self {
        Transfer::DeviceToHost {
            src,
            dst,
            dst_offset: 0,
        }
    }

    /// Direction of the copy.
    pub fn direction(&self) -> TransferDirection {
        match self {
            Transfer::HostToDevice { .. } => TransferDirection::HostToDevice,
            Transfer::DeviceToHost { .. } => TransferDirection::DeviceToHost,
            Transfer::DeviceToDevice { .. } => TransferDirection::DeviceToDevice,
        }
    }

    /// Bytes that can be moved starting at both endpoints.
    pub fn schedulable(&self) -> usize {
        match self {
            Transfer::HostToDevice { src, src_offset, dst } => {
                src.len().saturating_sub(*src_offset).min(dst.remaining())
            }
            Transfer::DeviceToHost { src, dst, dst_offset } => {
                src.remaining().min(dst.len().saturating_sub(*dst_offset))
            }
            Transfer::DeviceToDevice { src, dst } => src.remaining().min(dst.remaining()),
        }
    }

    /// Fail with the schedulable byte count if `size` bytes do not fit.
    pub fn check(&self, size: usize) -> Result<()> {
        let scheduled = self.schedulable();
        if scheduled < size {
            return Err(DeviceError::TransferFailure {
                requested: size,
                scheduled,
            });
        }
        Ok(())
    }
}

/// Description of the bound device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub index: usize,
    pub name: String,
    pub compute_capability: Option<(u32, u32)>,
    pub total_memory: usize,
    pub max_memory: usize,
    pub num_streams: usize,
    pub num_events: usize,
    pub constant_memory_size: usize,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} device {}: {}", self.kind, self.index, self.name)?;
        if let Some((major, minor)) = self.compute_capability {
            write!(f, " (CC {}.{})", major, minor)?;
        }
        write!(
            f,
            ", {:.1}GB limit, {} streams, {} events",
            self.max_memory as f64 / 1e9,
            self.num_streams,
            self.num_events
        )
    }
}

/// A completed profiling region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRegion {
    pub label: String,
    pub elapsed: Duration,
    pub operations: u64,
}

/// Shared bookkeeping for profiling hooks.
#[derive(Debug, Default)]
pub struct Profiler {
    enabled: bool,
    operations: u64,
    open: Option<(String, Instant, u64)>,
    regions: Vec<ProfileRegion>,
}

impl Profiler {
    /// Profiler that records regions when `enabled`.
    pub fn new(enabled: bool) -> Self {
        Profiler {
            enabled,
            ..Self::default()
        }
    }

    /// Count one submitted operation.
    pub fn count(&mut self) {
        self.operations += 1;
    }

    /// Open a region.
    pub fn start(&mut self, label: &str) {
        if !self.enabled {
            tracing::debug!(label, "profiling disabled, region ignored");
            return;
        }
        if let Some((previous, _, _)) = &self.open {
            tracing::warn!(previous = previous.as_str(), label, "profiling region restarted");
        }
        self.open = Some((label.to_string(), Instant::now(), self.operations));
    }

    /// Close the open region.
    pub fn end(&mut self) -> Option<ProfileRegion> {
        let (label, started, ops_before) = self.open.take()?;
        let region = ProfileRegion {
            label,
            elapsed: started.elapsed(),
            operations: self.operations - ops_before,
        };
        tracing::info!(
            label = region.label.as_str(),
            elapsed_us = region.elapsed.as_micros() as u64,
            operations = region.operations,
            "profiling region"
        );
        self.regions.push(region.clone());
        Some(region)
    }

    /// Regions closed so far.
    pub fn regions(&self) -> &[ProfileRegion] {
        &self.regions
    }
}

/// Scoped binding of the calling thread to a backend.
///
/// Nesting is allowed. Dropping the guard releases it; no device action is
/// taken.
#[derive(Debug)]
pub struct ThreadContext {
    depth: Arc<AtomicUsize>,
}

impl ThreadContext {
    /// Acquire a context on the shared depth counter.
    pub fn acquire(depth: &Arc<AtomicUsize>) -> Self {
        depth.fetch_add(1, Ordering::AcqRel);
        ThreadContext {
            depth: Arc::clone(depth),
        }
    }

    /// Number of live contexts, this one included.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A compute device driven by one controlling thread.
pub trait ComputeBackend: Send {
    /// Implementation kind.
    fn kind(&self) -> DeviceKind;

    /// Current life-cycle state.
    fn state(&self) -> BackendState;

    /// Bind the device and create the stream and event pools.
    fn init_device(&mut self) -> Result<()>;

    /// Drain all streams and release every resource. Idempotent.
    fn exit_device(&mut self) -> Result<()>;

    /// Apply runtime launch tunables.
    fn update_settings(&mut self, settings: RuntimeSettings) -> Result<()>;

    /// Bound device description.
    fn device_info(&self) -> Result<DeviceInfo>;

    /// Bind the calling thread for the lifetime of the guard.
    fn acquire_thread_context(&self) -> Result<ThreadContext>;

    /// Allocate zeroed device memory.
    fn alloc_device(&mut self, size: usize) -> Result<DeviceBuffer>;

    /// Free device memory. Queued work keeps it alive until it completes.
    fn free_device(&mut self, buffer: DeviceBuffer) -> Result<()>;

    /// Device memory statistics.
    fn memory_stats(&self) -> PoolStats;

    /// Register host memory for faster transfers.
    fn register_memory(&mut self, buffer: &HostBuffer) -> Result<()>;

    /// Undo a registration. Never-registered memory is an invalid handle.
    fn unregister_memory(&mut self, buffer: &HostBuffer) -> Result<()>;

    /// Whether `buffer` is registered.
    fn is_registered(&self, buffer: &HostBuffer) -> bool;

    /// Enqueue a copy of `size` bytes and return the bytes scheduled.
    ///
    /// On the default stream the copy completes before returning. A
    /// supplied completion event is recorded right after the copy.
    fn submit_copy(
        &mut self,
        transfer: Transfer<'_>,
        size: usize,
        stream: StreamId,
        completion: Option<&Event>,
    ) -> Result<usize>;

    /// Take an event from the pool.
    fn create_event(&mut self) -> Result<Event>;

    /// Return an event to the pool.
    fn release_event(&mut self, event: Event) -> Result<()>;

    /// Record `event` at the current tail of `stream`.
    fn record_marker(&mut self, event: &Event, stream: StreamId) -> Result<()>;

    /// Block until `stream` drains. The default stream synchronizes the device.
    fn synchronize_stream(&mut self, stream: StreamId) -> Result<()>;

    /// Block until every stream drains.
    fn synchronize_device(&mut self) -> Result<()>;

    /// Block until every recorded event completes. Unrecorded events are skipped.
    ///
    /// An event recorded behind a stream fault returns that fault; the
    /// stream itself keeps it until `synchronize_stream` takes it.
    fn synchronize_events(&mut self, events: &[&Event]) -> Result<()>;

    /// Make later work on `stream` wait for the events, without blocking the caller.
    ///
    /// Waiting on a faulted event faults `stream` as well.
    fn stream_wait_for_events(&mut self, stream: StreamId, events: &[&Event]) -> Result<()>;

    /// True only if every event was recorded and has completed.
    ///
    /// A completed event that was recorded behind a stream fault returns the fault.
    fn is_event_done(&self, events: &[&Event]) -> Result<bool>;

    /// Whether `stream` has work queued.
    fn stream_status(&self, stream: StreamId) -> Result<StreamStatus>;

    /// Enqueue a kernel.
    fn dispatch(&mut self, launch: KernelLaunch) -> Result<()>;

    /// Write into the constant region, ordered on `stream`.
    fn write_constant_region(&mut self, offset: usize, src: &[u8], stream: StreamId) -> Result<()>;

    /// Open a profiling region.
    fn start_profiling(&mut self, label: &str);

    /// Close the open profiling region.
    fn end_profiling(&mut self) -> Option<ProfileRegion>;

    /// Closed profiling regions.
    fn profile_regions(&self) -> &[ProfileRegion];

    /// With a debug level above 0, synchronize `stream` and surface faults.
    fn debug_checkpoint(&mut self, state: &str, stream: StreamId) -> Result<()>;

    /// Effective launch shape of every registered kernel.
    fn kernel_occupancies(&self) -> Vec<KernelOccupancy>;
}
