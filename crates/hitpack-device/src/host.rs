//! Host-emulated compute device.
//!
//! Device memory lives in host allocations, each stream is a worker thread,
//! and kernels run their host bodies on the stream that launched them. The
//! emulator honours the same ordering contract as a GPU: per-stream FIFO,
//! cross-stream order only through events.

use crate::backend::{
    BackendState, ComputeBackend, DeviceInfo, ProfileRegion, Profiler, ThreadContext, Transfer,
};
use crate::config::{DeviceBackendConfig, DeviceKind, RuntimeSettings};
use crate::error::{DeviceError, Result};
use crate::event::{Event, EventPool, Marker};
use crate::kernels::{KernelArg, KernelContext, KernelLaunch, KernelOccupancy, KernelRegistry, ResolvedArg};
use crate::memory::{
    copy_device_to_device, copy_device_to_host, copy_host_to_device, Allocation, BufferView,
    DeviceBuffer, DeviceMemory, HostBuffer, PoolStats, Registrations,
};
use crate::stream::{StreamId, StreamPool, StreamStatus, Work};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// Resources that exist while the device is initialized.
struct Runtime {
    streams: StreamPool,
    events: EventPool,
    memory: DeviceMemory,
    registrations: Registrations,
    constant: Arc<Allocation>,
}

impl Runtime {
    /// Run `work` on `stream`, or inline for the default stream.
    fn submit(&self, stream: StreamId, work: Work) -> Result<()> {
        if stream.is_default() {
            work()
        } else {
            self.streams.submit(stream, work)
        }
    }

    /// Marker for the current tail of `stream`.
    fn tail(&self, stream: StreamId) -> Result<Arc<Marker>> {
        if stream.is_default() {
            Ok(Marker::completed())
        } else {
            self.streams.tail(stream)
        }
    }
}

/// Compute backend emulating a device in host memory.
pub struct HostBackend {
    config: DeviceBackendConfig,
    state: BackendState,
    kernels: KernelRegistry,
    runtime: Option<Runtime>,
    context_depth: Arc<AtomicUsize>,
    profiler: Profiler,
    /// First event generation of the next device context.
    event_generation: u32,
}

impl HostBackend {
    /// Create an uninitialized backend owning `kernels`.
    pub fn new(config: DeviceBackendConfig, mut kernels: KernelRegistry) -> Result<Self> {
        config.validate()?;
        kernels.apply_runtime(config.runtime);
        Ok(HostBackend {
            profiler: Profiler::new(config.profiling),
            config,
            state: BackendState::Uninitialized,
            kernels,
            runtime: None,
            context_depth: Arc::new(AtomicUsize::new(0)),
            event_generation: 0,
        })
    }

    /// Create and initialize a backend.
    pub fn with_kernels(config: DeviceBackendConfig, kernels: KernelRegistry) -> Result<Self> {
        let mut backend = Self::new(config, kernels)?;
        backend.init_device()?;
        Ok(backend)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &DeviceBackendConfig {
        &self.config
    }

    /// Registered kernels.
    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    fn runtime(&self) -> Result<&Runtime> {
        self.state.require_initialized()?;
        self.runtime.as_ref().ok_or(DeviceError::InvalidState {
            expected: "device resources",
            actual: "no resources",
        })
    }

    fn runtime_mut(&mut self) -> Result<&mut Runtime> {
        self.state.require_initialized()?;
        self.runtime.as_mut().ok_or(DeviceError::InvalidState {
            expected: "device resources",
            actual: "no resources",
        })
    }

    fn resolve_args(memory: &DeviceMemory, launch: &KernelLaunch) -> Result<Vec<ResolvedArg>> {
        launch
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| match *arg {
                KernelArg::Buffer { ptr, len } => memory
                    .resolve(ptr, len)
                    .map(ResolvedArg::Buffer)
                    .map_err(|e| match e {
                        DeviceError::TransferFailure { .. } => DeviceError::kernel(format!(
                            "{} argument {} exceeds its buffer ({} bytes at offset {} of {})",
                            launch.kernel,
                            i,
                            len,
                            ptr.offset,
                            ptr.buffer.size()
                        )),
                        other => other,
                    }),
                KernelArg::U32(v) => Ok(ResolvedArg::U32(v)),
                KernelArg::U64(v) => Ok(ResolvedArg::U64(v)),
            })
            .collect()
    }
}

impl ComputeBackend for HostBackend {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Host
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
        let streams = StreamPool::new(self.config.num_streams, self.config.device_index)
            .map_err(|e| DeviceError::DeviceUnavailable(format!("stream pool: {}", e)))?;
        let runtime = Runtime {
            streams,
            events: EventPool::new(self.config.num_events, self.event_generation),
            memory: DeviceMemory::new(self.config.max_memory),
            registrations: Registrations::default(),
            constant: Allocation::zeroed(self.config.constant_memory_size),
        };
        tracing::info!(
            device = self.config.device_index,
            streams = runtime.streams.len(),
            events = runtime.events.capacity(),
            kernels = self.kernels.len(),
            "host device initialized"
        );
        self.runtime = Some(runtime);
        self.state = BackendState::Initialized;
        Ok(())
    }

    fn exit_device(&mut self) -> Result<()> {
        if self.state == BackendState::Uninitialized {
            return Ok(());
        }
        self.state = BackendState::ShuttingDown;
        if let Some(mut runtime) = self.runtime.take() {
            runtime.streams.shutdown();
            if !runtime.registrations.is_empty() {
                tracing::warn!(
                    buffers = runtime.registrations.len(),
                    "host memory still registered at exit"
                );
            }
            if runtime.events.in_use() > 0 {
                tracing::debug!(events = runtime.events.in_use(), "events outstanding at exit");
            }
            runtime.registrations.clear();
            runtime.events.clear();
            self.event_generation = runtime.events.next_generation();
            runtime.memory.clear();
        }
        self.state = BackendState::Uninitialized;
        tracing::info!(device = self.config.device_index, "host device released");
        Ok(())
    }

    fn update_settings(&mut self, settings: RuntimeSettings) -> Result<()> {
        settings.validate()?;
        self.kernels.apply_runtime(settings);
        self.config.runtime = settings;
        tracing::debug!(
            threads_per_block = settings.threads_per_block,
            blocks_per_multiprocessor = settings.blocks_per_multiprocessor,
            "runtime settings updated"
        );
        Ok(())
    }

    fn device_info(&self) -> Result<DeviceInfo> {
        self.runtime()?;
        Ok(DeviceInfo {
            kind: DeviceKind::Host,
            index: self.config.device_index,
            name: "hitpack host emulator".into(),
            compute_capability: None,
            total_memory: self.config.max_memory,
            max_memory: self.config.max_memory,
            num_streams: self.config.num_streams,
            num_events: self.config.num_events,
            constant_memory_size: self.config.constant_memory_size,
        })
    }

    fn acquire_thread_context(&self) -> Result<ThreadContext> {
        self.state.require_initialized()?;
        Ok(ThreadContext::acquire(&self.context_depth))
    }

    fn alloc_device(&mut self, size: usize) -> Result<DeviceBuffer> {
        self.runtime_mut()?.memory.allocate(size)
    }

    fn free_device(&mut self, buffer: DeviceBuffer) -> Result<()> {
        self.runtime_mut()?.memory.free(buffer)
    }

    fn memory_stats(&self) -> PoolStats {
        match &self.runtime {
            Some(rt) => rt.memory.stats(rt.registrations.total_bytes()),
            None => PoolStats {
                limit: self.config.max_memory,
                ..PoolStats::default()
            },
        }
    }

    fn register_memory(&mut self, buffer: &HostBuffer) -> Result<()> {
        self.runtime_mut()?.registrations.register(buffer)?;
        tracing::debug!(buffer = buffer.id(), bytes = buffer.len(), "host memory registered");
        Ok(())
    }

    fn unregister_memory(&mut self, buffer: &HostBuffer) -> Result<()> {
        self.runtime_mut()?.registrations.unregister(buffer)?;
        tracing::debug!(buffer = buffer.id(), "host memory unregistered");
        Ok(())
    }

    fn is_registered(&self, buffer: &HostBuffer) -> bool {
        self.runtime
            .as_ref()
            .is_some_and(|rt| rt.registrations.contains(buffer))
    }

    fn submit_copy(
        &mut self,
        transfer: Transfer<'_>,
        size: usize,
        stream: StreamId,
        completion: Option<&Event>,
    ) -> Result<usize> {
        let rt = self.runtime_mut()?;
        rt.streams.check(stream)?;
        if let Some(event) = completion {
            rt.events.marker(event)?;
        }
        transfer.check(size)?;

        let work: Work = match transfer {
            Transfer::HostToDevice { src, src_offset, dst } => {
                let view = rt.memory.resolve(dst, size)?;
                let src = src.clone();
                Box::new(move || copy_host_to_device(&src, src_offset, &view))
            }
            Transfer::DeviceToHost { src, dst, dst_offset } => {
                let view = rt.memory.resolve(src, size)?;
                let dst = dst.clone();
                Box::new(move || copy_device_to_host(&view, &dst, dst_offset))
            }
            Transfer::DeviceToDevice { src, dst } => {
                let from = rt.memory.resolve(src, size)?;
                let to = rt.memory.resolve(dst, size)?;
                Box::new(move || copy_device_to_device(&from, &to))
            }
        };
        rt.submit(stream, work)?;
        if let Some(event) = completion {
            let marker = rt.tail(stream)?;
            rt.events.record(event, marker)?;
        }
        tracing::debug!(direction = ?transfer.direction(), size, stream = stream.0, "copy submitted");
        self.profiler.count();
        Ok(size)
    }

    fn create_event(&mut self) -> Result<Event> {
        self.runtime_mut()?.events.create()
    }

    fn release_event(&mut self, event: Event) -> Result<()> {
        self.runtime_mut()?.events.release(event)
    }

    fn record_marker(&mut self, event: &Event, stream: StreamId) -> Result<()> {
        let rt = self.runtime_mut()?;
        rt.streams.check(stream)?;
        rt.events.marker(event)?;
        let marker = rt.tail(stream)?;
        rt.events.record(event, marker)
    }

    fn synchronize_stream(&mut self, stream: StreamId) -> Result<()> {
        if stream.is_default() {
            return self.synchronize_device();
        }
        self.runtime()?.streams.synchronize(stream)
    }

    fn synchronize_device(&mut self) -> Result<()> {
        self.runtime()?.streams.synchronize_all()
    }

    fn synchronize_events(&mut self, events: &[&Event]) -> Result<()> {
        self.runtime()?.events.wait_all(events)
    }

    fn stream_wait_for_events(&mut self, stream: StreamId, events: &[&Event]) -> Result<()> {
        let rt = self.runtime()?;
        rt.streams.check(stream)?;
        let markers = rt.events.recorded(events)?;
        if stream.is_default() {
            let mut first = None;
            for marker in markers {
                if let Err(e) = marker.wait_checked() {
                    first.get_or_insert(e);
                }
            }
            return first.map_or(Ok(()), Err);
        }
        rt.streams.wait_for(stream, markers)
    }

    fn is_event_done(&self, events: &[&Event]) -> Result<bool> {
        self.runtime()?.events.all_done(events)
    }

    fn stream_status(&self, stream: StreamId) -> Result<StreamStatus> {
        let rt = self.runtime()?;
        if stream.is_default() {
            return Ok(StreamStatus::Ready);
        }
        rt.streams.status(stream)
    }

    fn dispatch(&mut self, launch: KernelLaunch) -> Result<()> {
        let shape = self.kernels.shape_for(&launch)?;
        let body = Arc::clone(&self.kernels.get(launch.kernel)?.body);
        let rt = self.runtime()?;
        rt.streams.check(launch.stream)?;
        let args = Self::resolve_args(&rt.memory, &launch)?;
        let ctx = KernelContext::new(launch.kernel, shape, launch.stream, Arc::clone(&rt.constant));

        rt.submit(launch.stream, Box::new(move || body(&ctx, &args)))?;
        tracing::debug!(
            kernel = launch.kernel.name(),
            grid = shape.grid.0,
            block = shape.block.0,
            stream = launch.stream.0,
            "kernel dispatched"
        );
        self.profiler.count();
        Ok(())
    }

    fn write_constant_region(&mut self, offset: usize, src: &[u8], stream: StreamId) -> Result<()> {
        let rt = self.runtime()?;
        rt.streams.check(stream)?;
        let size = self.config.constant_memory_size;
        if offset.checked_add(src.len()).map_or(true, |end| end > size) {
            return Err(DeviceError::TransferFailure {
                requested: src.len(),
                scheduled: size.saturating_sub(offset),
            });
        }
        let view = BufferView::new(Arc::clone(&rt.constant), offset, src.len());
        let data = src.to_vec();
        rt.submit(stream, Box::new(move || view.with_mut(|b| b.copy_from_slice(&data))))?;
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
        self.synchronize_stream(stream).map_err(|e| {
            tracing::warn!(state, error = %e, "fault at debug checkpoint");
            e
        })
    }

    fn kernel_occupancies(&self) -> Vec<KernelOccupancy> {
        self.kernels.occupancies()
    }
}

impl Drop for HostBackend {
    fn drop(&mut self) {
        if let Err(e) = self.exit_device() {
            tracing::warn!(error = %e, "host device teardown failed");
        }
    }
}
