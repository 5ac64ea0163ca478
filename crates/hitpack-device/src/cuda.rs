//! CUDA backend.
//!
//! This backend serializes all work. Every copy, kernel and constant write
//! runs to completion on the device's default stream before the submitting
//! call returns, so submission blocks the caller and every event is complete
//! as soon as it is recorded. Stream ids are validated against the
//! configured pool but neither reorder nor overlap work;
//! `stream_wait_for_events` is satisfied trivially. Code that needs
//! overlapping streams runs on [`HostBackend`](crate::host::HostBackend).
//!
//! Kernels that carry PTX launch as device code with their buffer arguments
//! passed as device pointers and the constant region appended as the last
//! parameter. Kernels without PTX run their host body on staged copies of
//! their buffers.

use crate::backend::{
    BackendState, ComputeBackend, DeviceInfo, ProfileRegion, Profiler, ThreadContext, Transfer,
};
use crate::config::{DeviceBackendConfig, DeviceKind, RuntimeSettings};
use crate::error::{DeviceError, Result};
use crate::event::{Event, EventPool, Marker};
use crate::kernels::{
    KernelArg, KernelContext, KernelLaunch, KernelOccupancy, KernelRegistry, LaunchShape,
    ResolvedArg,
};
use crate::memory::{Allocation, BufferView, DeviceBuffer, DevicePtr, HostBuffer, PoolStats, Registrations};
use crate::stream::{StreamId, StreamStatus};
use cudarc::driver::{
    sys, CudaDevice, CudaFunction, CudaSlice, DevicePtr as _, LaunchAsync, LaunchConfig,
};
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// Check whether a CUDA device can be bound.
pub fn is_available() -> bool {
    CudaDevice::new(0).is_ok()
}

fn compute_capability(device: &CudaDevice) -> Option<(u32, u32)> {
    let major = device
        .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
        .ok()?;
    let minor = device
        .attribute(sys::CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
        .ok()?;
    Some((major as u32, minor as u32))
}

/// Launch parameter storage; pointers into it are handed to the driver.
enum Param {
    Ptr(u64),
    U32(u32),
    U64(u64),
}

struct Bound {
    device: Arc<CudaDevice>,
    buffers: HashMap<u64, CudaSlice<u8>>,
    functions: HashMap<&'static str, CudaFunction>,
    constant: CudaSlice<u8>,
    events: EventPool,
    registrations: Registrations,
    next_id: u64,
    allocated: usize,
    peak: usize,
}

impl Bound {
    fn slice(&self, ptr: DevicePtr, len: usize) -> Result<&CudaSlice<u8>> {
        let slice = self
            .buffers
            .get(&ptr.buffer.id())
            .ok_or_else(|| DeviceError::handle(format!("device buffer {} not allocated", ptr.buffer.id())))?;
        if len > ptr.remaining() {
            return Err(DeviceError::TransferFailure {
                requested: len,
                scheduled: ptr.remaining(),
            });
        }
        Ok(slice)
    }

    fn download(&self, ptr: DevicePtr, len: usize) -> Result<Vec<u8>> {
        let slice = self.slice(ptr, len)?;
        let mut host = vec![0u8; len];
        self.device
            .dtoh_sync_copy_into(&slice.slice(ptr.offset..ptr.offset + len), &mut host)?;
        Ok(host)
    }

    fn upload(&mut self, src: &[u8], ptr: DevicePtr) -> Result<()> {
        self.slice(ptr, src.len())?;
        let device = Arc::clone(&self.device);
        let slice = self
            .buffers
            .get_mut(&ptr.buffer.id())
            .ok_or_else(|| DeviceError::handle(format!("device buffer {} not allocated", ptr.buffer.id())))?;
        device.htod_sync_copy_into(src, &mut slice.slice_mut(ptr.offset..ptr.offset + src.len()))?;
        Ok(())
    }
}

/// Compute backend bound to a CUDA device through the driver API.
pub struct CudaBackend {
    config: DeviceBackendConfig,
    state: BackendState,
    kernels: KernelRegistry,
    bound: Option<Bound>,
    context_depth: Arc<AtomicUsize>,
    profiler: Profiler,
    /// First event generation of the next device context.
    event_generation: u32,
}

impl CudaBackend {
    /// Create an uninitialized backend owning `kernels`.
    pub fn new(config: DeviceBackendConfig, mut kernels: KernelRegistry) -> Result<Self> {
        config.validate()?;
        kernels.apply_runtime(config.runtime);
        Ok(CudaBackend {
            profiler: Profiler::new(config.profiling),
            config,
            state: BackendState::Uninitialized,
            kernels,
            bound: None,
            context_depth: Arc::new(AtomicUsize::new(0)),
            event_generation: 0,
        })
    }

    fn bound(&self) -> Result<&Bound> {
        self.state.require_initialized()?;
        self.bound.as_ref().ok_or(DeviceError::InvalidState {
            expected: "bound device",
            actual: "no device",
        })
    }

    fn bound_mut(&mut self) -> Result<&mut Bound> {
        self.state.require_initialized()?;
        self.bound.as_mut().ok_or(DeviceError::InvalidState {
            expected: "bound device",
            actual: "no device",
        })
    }

    fn check_stream(&self, stream: StreamId) -> Result<()> {
        if stream.is_default() || (stream.0 as usize) < self.config.num_streams {
            return Ok(());
        }
        Err(DeviceError::handle(format!(
            "{} outside pool of {}",
            stream, self.config.num_streams
        )))
    }

    fn launch_device_code(
        bound: &Bound,
        function: &CudaFunction,
        launch: &KernelLaunch,
        cfg: LaunchConfig,
    ) -> Result<()> {
        let mut storage = Vec::with_capacity(launch.args.len() + 1);
        for arg in &launch.args {
            storage.push(match *arg {
                KernelArg::Buffer { ptr, len } => {
                    let slice = bound.slice(ptr, len)?;
                    Param::Ptr(*slice.device_ptr() + ptr.offset as u64)
                }
                KernelArg::U32(v) => Param::U32(v),
                KernelArg::U64(v) => Param::U64(v),
            });
        }
        storage.push(Param::Ptr(*bound.constant.device_ptr()));

        let mut params: Vec<*mut c_void> = storage
            .iter_mut()
            .map(|p| match p {
                Param::Ptr(v) | Param::U64(v) => v as *mut u64 as *mut c_void,
                Param::U32(v) => v as *mut u32 as *mut c_void,
            })
            .collect();
        // SAFETY: every parameter points into `storage`, which outlives the
        // launch, and the device is synchronized before returning.
        unsafe { function.clone().launch(cfg, &mut params[..]) }?;
        bound.device.synchronize()?;
        Ok(())
    }

    fn launch_host_body(&mut self, launch: &KernelLaunch, shape: LaunchShape) -> Result<()> {
        let body = Arc::clone(&self.kernels.get(launch.kernel)?.body);
        let bound = self.bound()?;

        let mut staged = Vec::new();
        let mut args = Vec::with_capacity(launch.args.len());
        for arg in &launch.args {
            args.push(match *arg {
                KernelArg::Buffer { ptr, len } => {
                    let alloc = Allocation::from_vec(bound.download(ptr, len)?);
                    staged.push((ptr, Arc::clone(&alloc)));
                    ResolvedArg::Buffer(BufferView::new(alloc, 0, len))
                }
                KernelArg::U32(v) => ResolvedArg::U32(v),
                KernelArg::U64(v) => ResolvedArg::U64(v),
            });
        }
        let constant_len = self.config.constant_memory_size;
        let mut constant = vec![0u8; constant_len];
        bound.device.dtoh_sync_copy_into(&bound.constant, &mut constant)?;
        let ctx = KernelContext::new(launch.kernel, shape, launch.stream, Allocation::from_vec(constant));

        body(&ctx, &args)?;

        let bound = self.bound_mut()?;
        for (ptr, alloc) in staged {
            let bytes = alloc.bytes()?;
            bound.upload(&bytes, ptr)?;
        }
        Ok(())
    }
}

impl ComputeBackend for CudaBackend {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Cuda
    }

    fn state(&self) -> BackendState {
        self.state
    }

    fn init_device(&mut self) -> Result<()> {
        if self.state != BackendState::Uninitialized {
            return Err(DeviceError::InvalidState {
                expected: BackendState::Uninitialized.name(),
                actual: self.state.name(),
            });
        }
        let device = CudaDevice::new(self.config.device_index).map_err(|e| {
            DeviceError::DeviceUnavailable(format!("CUDA device {}: {}", self.config.device_index, e))
        })?;

        let mut functions = HashMap::new();
        for descriptor in self.kernels.iter() {
            if let Some(ptx) = descriptor.ptx {
                device.load_ptx(ptx.source.into(), ptx.module, &[ptx.function])?;
                let function = device.get_func(ptx.module, ptx.function).ok_or_else(|| {
                    DeviceError::kernel(format!("failed to load {}::{}", ptx.module, ptx.function))
                })?;
                functions.insert(descriptor.id.name(), function);
            }
        }
        let constant = device.alloc_zeros::<u8>(self.config.constant_memory_size)?;

        tracing::info!(
            device = self.config.device_index,
            name = %device.name().unwrap_or_default(),
            device_kernels = functions.len(),
            "CUDA device initialized"
        );
        self.bound = Some(Bound {
            device,
            buffers: HashMap::new(),
            functions,
            constant,
            events: EventPool::new(self.config.num_events, self.event_generation),
            registrations: Registrations::default(),
            next_id: 1,
            allocated: 0,
            peak: 0,
        });
        self.state = BackendState::Initialized;
        Ok(())
    }

    fn exit_device(&mut self) -> Result<()> {
        if self.state == BackendState::Uninitialized {
            return Ok(());
        }
        self.state = BackendState::ShuttingDown;
        if let Some(mut bound) = self.bound.take() {
            bound.events.clear();
            self.event_generation = bound.events.next_generation();
            if !bound.registrations.is_empty() {
                tracing::warn!(
                    buffers = bound.registrations.len(),
                    "host memory still registered at exit"
                );
            }
            if let Err(e) = bound.device.synchronize() {
                tracing::warn!(error = %e, "CUDA synchronize failed during exit");
            }
        }
        self.state = BackendState::Uninitialized;
        tracing::info!(device = self.config.device_index, "CUDA device released");
        Ok(())
    }

    fn update_settings(&mut self, settings: RuntimeSettings) -> Result<()> {
        settings.validate()?;
        self.kernels.apply_runtime(settings);
        self.config.runtime = settings;
        Ok(())
    }

    fn device_info(&self) -> Result<DeviceInfo> {
        let bound = self.bound()?;
        let (_free, total) = cudarc::driver::result::mem_get_info().unwrap_or((0, 0));
        Ok(DeviceInfo {
            kind: DeviceKind::Cuda,
            index: self.config.device_index,
            name: bound.device.name().unwrap_or_default(),
            compute_capability: compute_capability(&bound.device),
            total_memory: total,
            max_memory: self.config.max_memory,
            num_streams: self.config.num_streams,
            num_events: self.config.num_events,
            constant_memory_size: self.config.constant_memory_size,
        })
    }

    fn acquire_thread_context(&self) -> Result<ThreadContext> {
        let bound = self.bound()?;
        bound.device.bind_to_thread()?;
        Ok(ThreadContext::acquire(&self.context_depth))
    }

    fn alloc_device(&mut self, size: usize) -> Result<DeviceBuffer> {
        let limit = self.config.max_memory;
        let bound = self.bound_mut()?;
        let available = limit.saturating_sub(bound.allocated);
        if size > available {
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available,
            });
        }
        let slice = bound.device.alloc_zeros::<u8>(size)?;
        let id = bound.next_id;
        bound.next_id += 1;
        bound.buffers.insert(id, slice);
        bound.allocated += size;
        bound.peak = bound.peak.max(bound.allocated);
        Ok(DeviceBuffer::new(id, size))
    }

    fn free_device(&mut self, buffer: DeviceBuffer) -> Result<()> {
        let bound = self.bound_mut()?;
        bound
            .buffers
            .remove(&buffer.id())
            .ok_or_else(|| DeviceError::handle(format!("device buffer {} not allocated", buffer.id())))?;
        bound.allocated -= buffer.size();
        Ok(())
    }

    fn memory_stats(&self) -> PoolStats {
        match &self.bound {
            Some(b) => PoolStats {
                limit: self.config.max_memory,
                allocated: b.allocated,
                peak: b.peak,
                live_allocations: b.buffers.len(),
                registered_host_bytes: b.registrations.total_bytes(),
            },
            None => PoolStats {
                limit: self.config.max_memory,
                ..PoolStats::default()
            },
        }
    }

    fn register_memory(&mut self, buffer: &HostBuffer) -> Result<()> {
        self.bound_mut()?.registrations.register(buffer)
    }

    fn unregister_memory(&mut self, buffer: &HostBuffer) -> Result<()> {
        self.bound_mut()?.registrations.unregister(buffer)
    }

    fn is_registered(&self, buffer: &HostBuffer) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|b| b.registrations.contains(buffer))
    }

    fn submit_copy(
        &mut self,
        transfer: Transfer<'_>,
        size: usize,
        stream: StreamId,
        completion: Option<&Event>,
    ) -> Result<usize> {
        self.check_stream(stream)?;
        let bound = self.bound_mut()?;
        if let Some(event) = completion {
            bound.events.marker(event)?;
        }
        transfer.check(size)?;

        match transfer {
            Transfer::HostToDevice { src, src_offset, dst } => {
                let staged = src.read(|b| b[src_offset..src_offset + size].to_vec())?;
                bound.upload(&staged, dst)?;
            }
            Transfer::DeviceToHost { src, dst, dst_offset } => {
                let staged = bound.download(src, size)?;
                dst.copy_from_slice(dst_offset, &staged)?;
            }
            Transfer::DeviceToDevice { src, dst } => {
                let staged = bound.download(src, size)?;
                bound.upload(&staged, dst)?;
            }
        }
        if let Some(event) = completion {
            bound.events.record(event, Marker::completed())?;
        }
        self.profiler.count();
        Ok(size)
    }

    fn create_event(&mut self) -> Result<Event> {
        self.bound_mut()?.events.create()
    }

    fn release_event(&mut self, event: Event) -> Result<()> {
        self.bound_mut()?.events.release(event)
    }

    fn record_marker(&mut self, event: &Event, stream: StreamId) -> Result<()> {
        self.check_stream(stream)?;
        let bound = self.bound_mut()?;
        bound.events.marker(event)?;
        bound.events.record(event, Marker::completed())
    }

    fn synchronize_stream(&mut self, stream: StreamId) -> Result<()> {
        self.check_stream(stream)?;
        self.synchronize_device()
    }

    fn synchronize_device(&mut self) -> Result<()> {
        self.bound()?.device.synchronize()?;
        Ok(())
    }

    fn synchronize_events(&mut self, events: &[&Event]) -> Result<()> {
        self.bound()?.events.wait_all(events)
    }

    fn stream_wait_for_events(&mut self, stream: StreamId, events: &[&Event]) -> Result<()> {
        self.check_stream(stream)?;
        self.bound()?.events.recorded(events)?;
        Ok(())
    }

    fn is_event_done(&self, events: &[&Event]) -> Result<bool> {
        self.bound()?.events.all_done(events)
    }

    fn stream_status(&self, stream: StreamId) -> Result<StreamStatus> {
        self.check_stream(stream)?;
        self.bound()?;
        Ok(StreamStatus::Ready)
    }

    fn dispatch(&mut self, launch: KernelLaunch) -> Result<()> {
        self.check_stream(launch.stream)?;
        let shape = self.kernels.shape_for(&launch)?;
        let function = self.bound()?.functions.get(launch.kernel.name()).cloned();
        match function {
            Some(function) => {
                let cfg = LaunchConfig {
                    grid_dim: shape.grid,
                    block_dim: shape.block,
                    shared_mem_bytes: shape.shared_mem,
                };
                Self::launch_device_code(self.bound()?, &function, &launch, cfg)?;
            }
            None => self.launch_host_body(&launch, shape)?,
        }
        tracing::debug!(kernel = launch.kernel.name(), stream = launch.stream.0, "kernel dispatched");
        self.profiler.count();
        Ok(())
    }

    fn write_constant_region(&mut self, offset: usize, src: &[u8], stream: StreamId) -> Result<()> {
        self.check_stream(stream)?;
        let size = self.config.constant_memory_size;
        if offset.checked_add(src.len()).map_or(true, |end| end > size) {
            return Err(DeviceError::TransferFailure {
                requested: src.len(),
                scheduled: size.saturating_sub(offset),
            });
        }
        let bound = self.bound_mut()?;
        let device = Arc::clone(&bound.device);
        device.htod_sync_copy_into(src, &mut bound.constant.slice_mut(offset..offset + src.len()))?;
        self.profiler.count();
        Ok(())
    }

    fn start_profiling(&mut self, label: &str) {
        self.profiler.start(label);
    }

    fn end_profiling(&mut self) -> Option<ProfileRegion> {
        self.profiler.end()
    }

    fn profile_regions(&self) -> &[ProfileRegion] {
        self.profiler.regions()
    }

    fn debug_checkpoint(&mut self, state: &str, stream: StreamId) -> Result<()> {
        if self.config.debug_level == 0 {
            return Ok(());
        }
        tracing::debug!(state, stream = stream.0, "debug checkpoint");
        self.synchronize_stream(stream)
    }

    fn kernel_occupancies(&self) -> Vec<KernelOccupancy> {
        self.kernels.occupancies()
    }
}

impl Drop for CudaBackend {
    fn drop(&mut self) {
        if let Err(e) = self.exit_device() {
            tracing::warn!(error = %e, "CUDA device teardown failed");
        }
    }
}
