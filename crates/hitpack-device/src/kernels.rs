//! Kernel registry and launch descriptions.
//!
//! Work units are looked up by [`KernelId`] in a table built before the
//! backend initializes. Each entry carries a default [`LaunchShape`] and a
//! host body; entries may also carry PTX for backends that run device
//! code. The table moves into the backend at construction and is never
//! extended afterwards.

use crate::config::RuntimeSettings;
use crate::error::{DeviceError, Result};
use crate::memory::{Allocation, BufferView, DevicePtr};
use crate::stream::StreamId;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Logical operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub &'static str);

impl KernelId {
    /// Built-in kernel zeroing its single buffer argument.
    pub const MEMCLEAN: KernelId = KernelId("memclean");

    /// Identifier name.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Grid and block sizing of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchShape {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem: u32,
}

impl Default for LaunchShape {
    fn default() -> Self {
        LaunchShape {
            grid: (1, 1, 1),
            block: (256, 1, 1),
            shared_mem: 0,
        }
    }
}

impl LaunchShape {
    /// One-dimensional shape covering `elements` with `threads_per_block` threads per block.
    pub fn linear(elements: u64, threads_per_block: u32) -> Self {
        let threads = u64::from(threads_per_block.max(1));
        let blocks = elements.div_ceil(threads).clamp(1, u64::from(u32::MAX)) as u32;
        LaunchShape {
            grid: (blocks, 1, 1),
            block: (threads as u32, 1, 1),
            shared_mem: 0,
        }
    }

    /// Threads in one block.
    pub fn threads_per_block(&self) -> u64 {
        u64::from(self.block.0) * u64::from(self.block.1) * u64::from(self.block.2)
    }

    /// Threads across the whole grid.
    pub fn total_threads(&self) -> u64 {
        let blocks = u64::from(self.grid.0) * u64::from(self.grid.1) * u64::from(self.grid.2);
        blocks * self.threads_per_block()
    }
}

/// Argument of a launch, as given by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    /// `len` bytes of device memory at `ptr`.
    Buffer { ptr: DevicePtr, len: usize },
    U32(u32),
    U64(u64),
}

/// Argument of a launch after buffer resolution.
#[derive(Debug, Clone)]
pub enum ResolvedArg {
    Buffer(BufferView),
    U32(u32),
    U64(u64),
}

impl ResolvedArg {
    /// The buffer argument, or a launch error.
    pub fn buffer(&self) -> Result<&BufferView> {
        match self {
            ResolvedArg::Buffer(b) => Ok(b),
            other => Err(DeviceError::kernel(format!("expected buffer argument, got {:?}", other))),
        }
    }

    /// The `u32` argument, or a launch error.
    pub fn u32(&self) -> Result<u32> {
        match self {
            ResolvedArg::U32(v) => Ok(*v),
            other => Err(DeviceError::kernel(format!("expected u32 argument, got {:?}", other))),
        }
    }

    /// The `u64` argument, or a launch error.
    pub fn u64(&self) -> Result<u64> {
        match self {
            ResolvedArg::U64(v) => Ok(*v),
            ResolvedArg::U32(v) => Ok(u64::from(*v)),
            other => Err(DeviceError::kernel(format!("expected u64 argument, got {:?}", other))),
        }
    }
}

/// What a kernel body sees while it runs.
#[derive(Debug, Clone)]
pub struct KernelContext {
    kernel: KernelId,
    shape: LaunchShape,
    stream: StreamId,
    constant: Arc<Allocation>,
}

impl KernelContext {
    pub(crate) fn new(kernel: KernelId, shape: LaunchShape, stream: StreamId, constant: Arc<Allocation>) -> Self {
        KernelContext {
            kernel,
            shape,
            stream,
            constant,
        }
    }

    /// Kernel being executed.
    pub fn kernel(&self) -> KernelId {
        self.kernel
    }

    /// Effective launch shape.
    pub fn shape(&self) -> LaunchShape {
        self.shape
    }

    /// Stream the launch was submitted on.
    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Run `f` over the constant region.
    pub fn with_constant<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let bytes = self.constant.bytes()?;
        Ok(f(&bytes))
    }
}

/// Host implementation of a kernel.
pub type KernelBody = Arc<dyn Fn(&KernelContext, &[ResolvedArg]) -> Result<()> + Send + Sync>;

/// Device code for backends that execute PTX.
///
/// Parameters are the launch arguments in order, buffers passed as device
/// pointers, followed by the constant region pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtxSource {
    pub module: &'static str,
    pub function: &'static str,
    pub source: &'static str,
}

/// One registry entry.
#[derive(Clone)]
pub struct KernelDescriptor {
    pub id: KernelId,
    pub shape: LaunchShape,
    /// Keep `shape.block` when runtime settings change.
    pub pinned_block: bool,
    pub body: KernelBody,
    pub ptx: Option<PtxSource>,
}

impl KernelDescriptor {
    /// Descriptor with a default shape and no device code.
    pub fn new<F>(id: KernelId, body: F) -> Self
    where
        F: Fn(&KernelContext, &[ResolvedArg]) -> Result<()> + Send + Sync + 'static,
    {
        KernelDescriptor {
            id,
            shape: LaunchShape::default(),
            pinned_block: false,
            body: Arc::new(body),
            ptx: None,
        }
    }

    /// Set the default launch shape.
    pub fn with_shape(mut self, shape: LaunchShape) -> Self {
        self.shape = shape;
        self
    }

    /// Keep the block size fixed under `update_settings`.
    pub fn pinned(mut self) -> Self {
        self.pinned_block = true;
        self
    }

    /// Attach device code.
    pub fn with_ptx(mut self, ptx: PtxSource) -> Self {
        self.ptx = Some(ptx);
        self
    }
}

impl fmt::Debug for KernelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDescriptor")
            .field("id", &self.id)
            .field("shape", &self.shape)
            .field("pinned_block", &self.pinned_block)
            .field("ptx", &self.ptx.map(|p| p.function))
            .finish()
    }
}

/// A launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelLaunch {
    pub kernel: KernelId,
    pub stream: StreamId,
    /// Explicit shape; otherwise derived from the registry entry.
    pub shape: Option<LaunchShape>,
    /// Problem size used to size the grid when no explicit shape is given.
    pub elements: Option<u64>,
    pub args: Vec<KernelArg>,
}

impl KernelLaunch {
    /// Launch of `kernel` on `stream` with no arguments.
    pub fn new(kernel: KernelId, stream: StreamId) -> Self {
        KernelLaunch {
            kernel,
            stream,
            shape: None,
            elements: None,
            args: Vec::new(),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: KernelArg) -> Self {
        self.args.push(arg);
        self
    }

    /// Append a buffer argument.
    pub fn buffer(self, ptr: DevicePtr, len: usize) -> Self {
        self.arg(KernelArg::Buffer { ptr, len })
    }

    /// Size the grid for `elements` work items.
    pub fn elements(mut self, elements: u64) -> Self {
        self.elements = Some(elements);
        self
    }

    /// Use an explicit shape.
    pub fn shape(mut self, shape: LaunchShape) -> Self {
        self.shape = Some(shape);
        self
    }
}

/// Effective shape of a registered kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelOccupancy {
    pub kernel: KernelId,
    pub shape: LaunchShape,
    pub threads_per_block: u64,
    pub blocks_per_multiprocessor: u32,
    pub device_code: bool,
}

impl fmt::Display for KernelOccupancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: block {:?}, {} threads/block, {} blocks/SM{}",
            self.kernel,
            self.shape.block,
            self.threads_per_block,
            self.blocks_per_multiprocessor,
            if self.device_code { ", device code" } else { "" }
        )
    }
}

/// Table of kernels keyed by identifier.
#[derive(Debug, Clone)]
pub struct KernelRegistry {
    kernels: BTreeMap<KernelId, KernelDescriptor>,
    runtime: RuntimeSettings,
}

impl Default for KernelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelRegistry {
    /// Registry containing only the built-in kernels.
    pub fn new() -> Self {
        let mut kernels = BTreeMap::new();
        let memclean = memclean();
        kernels.insert(memclean.id, memclean);
        KernelRegistry {
            kernels,
            runtime: RuntimeSettings::default(),
        }
    }

    /// Add a kernel. Identifiers must be unique.
    pub fn register(&mut self, descriptor: KernelDescriptor) -> Result<()> {
        if self.kernels.contains_key(&descriptor.id) {
            return Err(DeviceError::kernel(format!("{} registered twice", descriptor.id)));
        }
        tracing::debug!(kernel = descriptor.id.name(), "kernel registered");
        self.kernels.insert(descriptor.id, descriptor);
        Ok(())
    }

    /// Add every kernel from `other`, skipping built-ins already present.
    pub fn extend(&mut self, other: KernelRegistry) -> Result<()> {
        for (id, descriptor) in other.kernels {
            if id == KernelId::MEMCLEAN {
                continue;
            }
            self.register(descriptor)?;
        }
        Ok(())
    }

    /// Look up a kernel.
    pub fn get(&self, id: KernelId) -> Result<&KernelDescriptor> {
        self.kernels
            .get(&id)
            .ok_or_else(|| DeviceError::kernel(format!("unknown kernel {}", id)))
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: KernelId) -> bool {
        self.kernels.contains_key(&id)
    }

    /// Registered kernels in identifier order.
    pub fn iter(&self) -> impl Iterator<Item = &KernelDescriptor> {
        self.kernels.values()
    }

    /// Number of registered kernels.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    /// Re-shape every kernel without a pinned block size.
    pub(crate) fn apply_runtime(&mut self, runtime: RuntimeSettings) {
        for descriptor in self.kernels.values_mut() {
            if !descriptor.pinned_block {
                descriptor.shape.block = (runtime.threads_per_block, 1, 1);
            }
        }
        self.runtime = runtime;
    }

    /// Shape used for `launch`.
    pub(crate) fn shape_for(&self, launch: &KernelLaunch) -> Result<LaunchShape> {
        let descriptor = self.get(launch.kernel)?;
        let shape = match (launch.shape, launch.elements) {
            (Some(shape), _) => shape,
            (None, Some(elements)) => LaunchShape {
                shared_mem: descriptor.shape.shared_mem,
                ..LaunchShape::linear(elements, descriptor.shape.block.0)
            },
            (None, None) => descriptor.shape,
        };
        if shape.threads_per_block() == 0 || shape.threads_per_block() > u64::from(RuntimeSettings::MAX_THREADS_PER_BLOCK) {
            return Err(DeviceError::kernel(format!(
                "{} launched with {} threads per block",
                launch.kernel,
                shape.threads_per_block()
            )));
        }
        Ok(shape)
    }

    /// Effective shapes of every kernel.
    pub fn occupancies(&self) -> Vec<KernelOccupancy> {
        self.kernels
            .values()
            .map(|d| KernelOccupancy {
                kernel: d.id,
                shape: d.shape,
                threads_per_block: d.shape.threads_per_block(),
                blocks_per_multiprocessor: self.runtime.blocks_per_multiprocessor,
                device_code: d.ptx.is_some(),
            })
            .collect()
    }
}

const MEMCLEAN_CHUNK: usize = 64 * 1024;

/// Built-in kernel: zero every buffer argument.
fn memclean() -> KernelDescriptor {
    KernelDescriptor::new(KernelId::MEMCLEAN, |_ctx, args| {
        if args.is_empty() {
            return Err(DeviceError::kernel("memclean needs a buffer argument"));
        }
        for arg in args {
            arg.buffer()?.with_mut(|bytes| {
                bytes
                    .par_chunks_mut(MEMCLEAN_CHUNK)
                    .for_each(|chunk| chunk.fill(0))
            })?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(id: &'static str) -> KernelDescriptor {
        KernelDescriptor::new(KernelId(id), |_, _| Ok(()))
    }

    #[test]
    fn test_builtin_memclean_present() {
        let registry = KernelRegistry::new();
        assert!(registry.contains(KernelId::MEMCLEAN));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = KernelRegistry::new();
        registry.register(noop("a")).unwrap();
        assert!(registry.register(noop("a")).is_err());
        assert!(registry.register(noop("memclean")).is_err());
    }

    #[test]
    fn test_extend_skips_builtins() {
        let mut a = KernelRegistry::new();
        let mut b = KernelRegistry::new();
        b.register(noop("b")).unwrap();
        a.extend(b).unwrap();
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_linear_shape() {
        let shape = LaunchShape::linear(1000, 256);
        assert_eq!(shape.grid, (4, 1, 1));
        assert!(shape.total_threads() >= 1000);
        assert_eq!(LaunchShape::linear(0, 256).grid, (1, 1, 1));
    }

    #[test]
    fn test_runtime_reshapes_unpinned() {
        let mut registry = KernelRegistry::new();
        registry.register(noop("free")).unwrap();
        registry
            .register(
                noop("pinned")
                    .with_shape(LaunchShape {
                        block: (32, 1, 1),
                        ..LaunchShape::default()
                    })
                    .pinned(),
            )
            .unwrap();
        registry.apply_runtime(RuntimeSettings {
            threads_per_block: 128,
            blocks_per_multiprocessor: 4,
        });
        assert_eq!(registry.get(KernelId("free")).unwrap().shape.block.0, 128);
        assert_eq!(registry.get(KernelId("pinned")).unwrap().shape.block.0, 32);
        let occupancy = registry.occupancies();
        assert!(occupancy.iter().all(|o| o.blocks_per_multiprocessor == 4));
    }

    #[test]
    fn test_device_code_reported_in_occupancy() {
        let mut registry = KernelRegistry::new();
        registry
            .register(noop("ptx").with_ptx(PtxSource {
                module: "test",
                function: "ptx_kernel",
                source: ".version 7.0",
            }))
            .unwrap();
        let occupancy = registry.occupancies();
        let entry = occupancy.iter().find(|o| o.kernel == KernelId("ptx")).unwrap();
        assert!(entry.device_code);
        let builtin = occupancy.iter().find(|o| o.kernel == KernelId::MEMCLEAN).unwrap();
        assert!(!builtin.device_code);
    }

    #[test]
    fn test_shape_for_uses_elements() {
        let mut registry = KernelRegistry::new();
        registry.register(noop("k")).unwrap();
        let launch = KernelLaunch::new(KernelId("k"), StreamId(0)).elements(1 << 20);
        let shape = registry.shape_for(&launch).unwrap();
        assert_eq!(shape.grid.0, (1 << 20) / 256);

        let bad = KernelLaunch::new(KernelId("k"), StreamId(0)).shape(LaunchShape {
            block: (2048, 1, 1),
            ..LaunchShape::default()
        });
        assert!(registry.shape_for(&bad).is_err());
        assert!(registry
            .shape_for(&KernelLaunch::new(KernelId("missing"), StreamId(0)))
            .is_err());
    }
}
