//! Compression processor.
//!
//! Drives one encode pass over a compute backend:
//!
//! ```text
//!  set_max_data ─▶ plan ─▶ allocate ─▶ encode_pass ─▶ output_dataset
//!   capacities     scratch   device      upload          host copy
//!                  device    buffers     truncate        re-parsed
//!                  host      host buf    download
//! ```

use crate::error::{Error, Result};
use crate::kernels::{encode_settings, SETTINGS_OFFSET, TRACK_FIRST_INDEX, TRUNCATE_FIELD};
use hitpack_core::{
    ArrayId, CapacityParams, CompressedDataset, CompressionSettings, Counts, InputSizes,
    LayoutPlan, HEADER_SIZE, TRUNCATED_ARRAYS,
};
use hitpack_device::{
    ComputeBackend, DeviceBuffer, Event, HostBuffer, KernelArg, KernelId, KernelLaunch, StreamId,
    Transfer,
};
use serde::{Deserialize, Serialize};

/// Layouts of every allocation phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlans {
    pub scratch: LayoutPlan,
    pub device_output: LayoutPlan,
    pub host_output: LayoutPlan,
}

/// Buffers bound to a backend by [`CompressionProcessor::allocate`].
#[derive(Debug, Clone)]
pub struct ProcessorAllocation {
    pub plans: PhasePlans,
    pub scratch: DeviceBuffer,
    pub device_output: DeviceBuffer,
    pub host_output: HostBuffer,
}

/// Summary of the last encode pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EncodeReport {
    pub counts: Counts,
    pub bytes: usize,
    pub kernels: usize,
}

/// Lossy encoder for compressed cluster datasets.
#[derive(Debug)]
pub struct CompressionProcessor {
    settings: CompressionSettings,
    params: Option<CapacityParams>,
    allocation: Option<ProcessorAllocation>,
    last_pass: Option<EncodeReport>,
}

fn stored_for(id: ArrayId, counts: &Counts) -> u32 {
    match id {
        ArrayId::QTotU | ArrayId::QMaxU | ArrayId::SigmaPadU | ArrayId::SigmaTimeU => {
            counts.unattached
        }
        _ => counts.attached,
    }
}

/// Register the host output and clear scratch, undoing the registration on failure.
fn bind_host_output(backend: &mut dyn ComputeBackend, host_output: &HostBuffer, scratch: DeviceBuffer) -> Result<()> {
    backend.register_memory(host_output)?;
    if scratch.size() == 0 {
        return Ok(());
    }
    let cleared = backend.dispatch(
        KernelLaunch::new(KernelId::MEMCLEAN, StreamId::DEFAULT)
            .buffer(scratch.ptr(), scratch.size())
            .elements(scratch.size() as u64),
    );
    if let Err(e) = cleared {
        if let Err(undo) = backend.unregister_memory(host_output) {
            tracing::warn!(error = %undo, "host output registration left behind");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Free regions of a failed allocation; the original error is what the caller sees.
fn discard(backend: &mut dyn ComputeBackend, scratch: DeviceBuffer, device_output: DeviceBuffer) {
    for buffer in [scratch, device_output] {
        if let Err(e) = backend.free_device(buffer) {
            tracing::warn!(buffer = buffer.id(), error = %e, "dropping partial allocation");
        }
    }
}

impl CompressionProcessor {
    /// Create a processor, rejecting inconsistent precision settings.
    pub fn new(settings: CompressionSettings) -> Result<Self> {
        settings.validate()?;
        Ok(CompressionProcessor {
            settings,
            params: None,
            allocation: None,
            last_pass: None,
        })
    }

    /// Settings in effect.
    pub fn settings(&self) -> &CompressionSettings {
        &self.settings
    }

    /// Capacities derived by the last [`set_max_data`](Self::set_max_data).
    pub fn capacity_params(&self) -> Option<&CapacityParams> {
        self.params.as_ref()
    }

    /// Derive capacities from event sizes.
    ///
    /// Buffers bound by an earlier allocation must be released first.
    pub fn set_max_data(&mut self, input: InputSizes) -> Result<CapacityParams> {
        if self.allocation.is_some() {
            return Err(Error::NotReady("release the current allocation before resizing"));
        }
        let params = CapacityParams::from_input(input, &self.settings)?;
        tracing::debug!(
            tracks = params.max_tracks,
            clusters = params.max_clusters,
            track_clusters = params.max_track_clusters,
            in_cache = params.max_clusters_in_cache,
            "capacities derived"
        );
        self.params = Some(params);
        Ok(params)
    }

    /// Layouts of every phase for the current capacities.
    pub fn plan(&self) -> Result<PhasePlans> {
        let params = self.params.as_ref().ok_or(Error::NotReady("set_max_data not called"))?;
        let output = params.output_capacity();
        Ok(PhasePlans {
            scratch: LayoutPlan::scratch(params, 0)?,
            device_output: LayoutPlan::device_output(output, 0)?,
            host_output: LayoutPlan::host_output(output, 0)?,
        })
    }

    /// Current allocation.
    pub fn allocation(&self) -> Option<&ProcessorAllocation> {
        self.allocation.as_ref()
    }

    /// Bind scratch and output regions on `backend`.
    ///
    /// Scratch is cleared with the built-in `memclean` kernel. The host
    /// output buffer is registered with the backend.
    pub fn allocate(&mut self, backend: &mut dyn ComputeBackend) -> Result<&ProcessorAllocation> {
        if self.allocation.is_some() {
            return Err(Error::NotReady("already allocated"));
        }
        let plans = self.plan()?;
        let scratch = backend.alloc_device(plans.scratch.total_size())?;
        let device_output = match backend.alloc_device(plans.device_output.total_size()) {
            Ok(buffer) => buffer,
            Err(e) => {
                backend.free_device(scratch)?;
                return Err(e.into());
            }
        };
        let host_output = HostBuffer::new(plans.host_output.total_size());
        if let Err(e) = bind_host_output(backend, &host_output, scratch) {
            discard(backend, scratch, device_output);
            return Err(e);
        }
        tracing::info!(
            scratch = plans.scratch.total_size(),
            device_output = plans.device_output.total_size(),
            host_output = plans.host_output.total_size(),
            "processor buffers allocated; {}",
            backend.memory_stats()
        );
        Ok(self.allocation.insert(ProcessorAllocation {
            plans,
            scratch,
            device_output,
            host_output,
        }))
    }

    /// Return the allocation's buffers to `backend`.
    pub fn release(&mut self, backend: &mut dyn ComputeBackend) -> Result<()> {
        let Some(allocation) = self.allocation.take() else {
            return Ok(());
        };
        backend.synchronize_device()?;
        backend.unregister_memory(&allocation.host_output)?;
        backend.free_device(allocation.scratch)?;
        backend.free_device(allocation.device_output)?;
        tracing::debug!("processor buffers released");
        Ok(())
    }

    /// Apply truncation on the host without a backend.
    ///
    /// Returns the number of values changed.
    pub fn truncate_on_host(&self, dataset: &mut CompressedDataset) -> usize {
        dataset.view_mut().truncate_fields(&self.settings)
    }

    /// Schedule an encode pass of `dataset` on `stream`.
    ///
    /// The returned event completes once the truncated dataset has landed
    /// in the host output buffer and the per-track first-cluster table has
    /// been built in scratch; read them with
    /// [`output_dataset`](Self::output_dataset) and
    /// [`first_index_table`](Self::first_index_table) after waiting on the
    /// event. If a kernel of the pass faults, waiting on the event returns
    /// the fault and the host output no longer parses.
    ///
    /// The previous pass must have completed before the next one is
    /// scheduled, since both land in the same host output buffer.
    pub fn encode_pass(
        &mut self,
        backend: &mut dyn ComputeBackend,
        dataset: &CompressedDataset,
        stream: StreamId,
    ) -> Result<Event> {
        let params = self.params.ok_or(Error::NotReady("set_max_data not called"))?;
        let allocation = self.allocation.as_ref().ok_or(Error::NotReady("allocate not called"))?;

        let counts = dataset.counts();
        params.output_capacity().check(&counts)?;
        let flat = dataset.as_flat();
        if flat.len() > allocation.device_output.size() {
            return Err(hitpack_core::Error::sizing(
                "device output",
                flat.len() as u64,
                allocation.device_output.size() as u64,
            )
            .into());
        }

        // a download skipped behind a stream fault must not leave the
        // previous pass readable as this one
        self.last_pass = None;
        allocation.host_output.write(|bytes| {
            let header = HEADER_SIZE.min(bytes.len());
            bytes[..header].fill(0);
        })?;

        let staging = HostBuffer::from_slice(flat);
        let device = allocation.device_output;

        backend.write_constant_region(SETTINGS_OFFSET, &encode_settings(&self.settings), stream)?;
        backend.submit_copy(Transfer::upload(&staging, device.ptr()), flat.len(), stream, None)?;

        let mut kernels = 0;
        for (id, field) in TRUNCATED_ARRAYS {
            let Some(span) = dataset.plan().span(id) else {
                continue;
            };
            let stored = stored_for(id, &counts).min(span.len);
            if stored == 0 || self.settings.bits_for(field) == 0 {
                continue;
            }
            backend.dispatch(
                KernelLaunch::new(TRUNCATE_FIELD, stream)
                    .buffer(device.at(span.offset), stored as usize * span.elem_size)
                    .arg(KernelArg::U32(span.elem_size as u32))
                    .arg(KernelArg::U32(field.code()))
                    .elements(u64::from(stored)),
            )?;
            kernels += 1;
        }

        if counts.tracks > 0 {
            let missing = || Error::NotReady("layout has no per-track cluster table");
            let track_clusters = dataset.plan().span(ArrayId::NTrackClusters).ok_or_else(missing)?;
            let first_index = allocation
                .plans
                .scratch
                .span(ArrayId::AttachedClusterFirstIndex)
                .ok_or_else(missing)?;
            let tracks = counts.tracks as usize;
            backend.dispatch(
                KernelLaunch::new(TRACK_FIRST_INDEX, stream)
                    .buffer(device.at(track_clusters.offset), tracks * track_clusters.elem_size)
                    .buffer(allocation.scratch.at(first_index.offset), tracks * first_index.elem_size)
                    .arg(KernelArg::U32(counts.attached))
                    .elements(u64::from(counts.tracks)),
            )?;
            kernels += 1;
        }

        let done = backend.create_event()?;
        let finished = backend
            .submit_copy(
                Transfer::download(device.ptr(), &allocation.host_output),
                flat.len(),
                stream,
                Some(&done),
            )
            .and_then(|_| backend.debug_checkpoint("encode pass", stream));
        if let Err(e) = finished {
            backend.release_event(done)?;
            return Err(e.into());
        }

        let report = EncodeReport {
            counts,
            bytes: flat.len(),
            kernels,
        };
        tracing::debug!(
            tracks = counts.tracks,
            attached = counts.attached,
            unattached = counts.unattached,
            bytes = report.bytes,
            kernels,
            stream = stream.0,
            "encode pass scheduled"
        );
        self.last_pass = Some(report);
        Ok(done)
    }

    /// Download the first-cluster index of every track stored by the last pass.
    ///
    /// Only valid once the event returned by `encode_pass` has completed.
    pub fn first_index_table(&self, backend: &mut dyn ComputeBackend) -> Result<Vec<u32>> {
        let allocation = self.allocation.as_ref().ok_or(Error::NotReady("allocate not called"))?;
        let report = self.last_pass.ok_or(Error::NotReady("encode_pass not called"))?;
        let span = allocation
            .plans
            .scratch
            .span(ArrayId::AttachedClusterFirstIndex)
            .ok_or(Error::NotReady("scratch plan has no first-index table"))?;
        let len = report.counts.tracks as usize * span.elem_size;
        if len == 0 {
            return Ok(Vec::new());
        }
        let host = HostBuffer::new(len);
        backend.submit_copy(
            Transfer::download(allocation.scratch.at(span.offset), &host),
            len,
            StreamId::DEFAULT,
            None,
        )?;
        let bytes = host.to_vec()?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Summary of the last scheduled pass.
    pub fn last_pass(&self) -> Option<EncodeReport> {
        self.last_pass
    }

    /// Parse the host output of the last pass.
    ///
    /// Only valid once the event returned by `encode_pass` has completed.
    pub fn output_dataset(&self) -> Result<CompressedDataset> {
        let allocation = self.allocation.as_ref().ok_or(Error::NotReady("allocate not called"))?;
        let report = self.last_pass.ok_or(Error::NotReady("encode_pass not called"))?;
        let mut bytes = allocation.host_output.to_vec()?;
        bytes.truncate(report.bytes);
        Ok(CompressedDataset::from_flat(bytes)?)
    }
}
