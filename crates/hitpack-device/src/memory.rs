//! Device and host memory resources.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      DeviceMemory                         │
//! │  id -> Arc<Allocation>            limit / allocated / peak│
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐                      │
//! │  │ scratch │ │ output  │ │ const   │   in-flight ops hold │
//! │  └─────────┘ └─────────┘ └─────────┘   their own Arc      │
//! ├───────────────────────────────────────────────────────────┤
//! │  HostBuffer (shared, fixed size)   registration table     │
//! │  ┌─────────┐ ┌─────────┐          id -> registered bytes  │
//! │  │ staging │ │ output  │                                  │
//! │  └─────────┘ └─────────┘                                  │
//! └───────────────────────────────────────────────────────────┘
//! ```

use crate::error::{DeviceError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lock a mutex, mapping poisoning to a backend state error.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| DeviceError::InvalidState {
        expected: what,
        actual: "poisoned lock",
    })
}

static NEXT_HOST_BUFFER: AtomicU64 = AtomicU64::new(1);

/// Backing storage of one emulated device allocation.
#[derive(Debug)]
pub(crate) struct Allocation {
    data: Mutex<Box<[u8]>>,
}

impl Allocation {
    pub(crate) fn zeroed(size: usize) -> Arc<Self> {
        Arc::new(Allocation {
            data: Mutex::new(vec![0u8; size].into_boxed_slice()),
        })
    }

    #[cfg_attr(not(feature = "cuda"), allow(dead_code))]
    pub(crate) fn from_vec(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Allocation {
            data: Mutex::new(data.into_boxed_slice()),
        })
    }

    pub(crate) fn bytes(&self) -> Result<MutexGuard<'_, Box<[u8]>>> {
        lock(&self.data, "device allocation")
    }
}

/// Handle to a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    id: u64,
    size: usize,
}

impl DeviceBuffer {
    pub(crate) fn new(id: u64, size: usize) -> Self {
        DeviceBuffer { id, size }
    }

    /// Allocation identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Pointer to the start of the buffer.
    pub fn ptr(&self) -> DevicePtr {
        self.at(0)
    }

    /// Pointer `offset` bytes into the buffer.
    pub fn at(&self, offset: usize) -> DevicePtr {
        DevicePtr {
            buffer: *self,
            offset,
        }
    }
}

/// A byte position inside a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr {
    pub buffer: DeviceBuffer,
    pub offset: usize,
}

impl DevicePtr {
    /// Bytes between this position and the end of the allocation.
    pub fn remaining(&self) -> usize {
        self.buffer.size.saturating_sub(self.offset)
    }

    /// Pointer advanced by `bytes`.
    pub fn add(self, bytes: usize) -> Self {
        DevicePtr {
            offset: self.offset + bytes,
            ..self
        }
    }
}

/// A resolved range of device memory handed to kernel bodies.
///
/// Each access locks the whole allocation; do not nest accesses to two
/// views inside one closure.
#[derive(Debug, Clone)]
pub struct BufferView {
    alloc: Arc<Allocation>,
    offset: usize,
    len: usize,
}

impl BufferView {
    pub(crate) fn new(alloc: Arc<Allocation>, offset: usize, len: usize) -> Self {
        BufferView { alloc, offset, len }
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `f` over the bytes of the range.
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let bytes = self.alloc.bytes()?;
        Ok(f(&bytes[self.offset..self.offset + self.len]))
    }

    /// Run `f` over the bytes of the range, mutably.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut bytes = self.alloc.bytes()?;
        Ok(f(&mut bytes[self.offset..self.offset + self.len]))
    }
}

// Copies lock host memory before device memory, and device allocations in
// address order, so concurrent streams cannot deadlock on a pair of buffers.

pub(crate) fn copy_host_to_device(src: &HostBuffer, src_offset: usize, dst: &BufferView) -> Result<()> {
    let host = lock(&src.inner.data, "host buffer")?;
    let mut device = dst.alloc.bytes()?;
    device[dst.offset..dst.offset + dst.len].copy_from_slice(&host[src_offset..src_offset + dst.len]);
    Ok(())
}

pub(crate) fn copy_device_to_host(src: &BufferView, dst: &HostBuffer, dst_offset: usize) -> Result<()> {
    let mut host = lock(&dst.inner.data, "host buffer")?;
    let device = src.alloc.bytes()?;
    host[dst_offset..dst_offset + src.len].copy_from_slice(&device[src.offset..src.offset + src.len]);
    Ok(())
}

pub(crate) fn copy_device_to_device(src: &BufferView, dst: &BufferView) -> Result<()> {
    let len = src.len.min(dst.len);
    if Arc::ptr_eq(&src.alloc, &dst.alloc) {
        let mut bytes = src.alloc.bytes()?;
        bytes.copy_within(src.offset..src.offset + len, dst.offset);
        return Ok(());
    }
    let src_first = Arc::as_ptr(&src.alloc) < Arc::as_ptr(&dst.alloc);
    let (a, b) = if src_first { (&src.alloc, &dst.alloc) } else { (&dst.alloc, &src.alloc) };
    let mut first = a.bytes()?;
    let mut second = b.bytes()?;
    let (from, to): (&[u8], &mut [u8]) = if src_first {
        (&first[..], &mut second[..])
    } else {
        (&second[..], &mut first[..])
    };
    to[dst.offset..dst.offset + len].copy_from_slice(&from[src.offset..src.offset + len]);
    Ok(())
}

/// Fixed-size host allocation shared with in-flight copies.
///
/// Clones refer to the same bytes. The size never changes, so a copy
/// validated at submit time stays in bounds when it executes.
#[derive(Debug, Clone)]
pub struct HostBuffer {
    inner: Arc<HostBufferInner>,
}

#[derive(Debug)]
struct HostBufferInner {
    id: u64,
    len: usize,
    data: Mutex<Box<[u8]>>,
}

impl HostBuffer {
    /// Zeroed buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::from_vec(data.to_vec())
    }

    /// Buffer taking ownership of `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        HostBuffer {
            inner: Arc::new(HostBufferInner {
                id: NEXT_HOST_BUFFER.fetch_add(1, Ordering::Relaxed),
                len: data.len(),
                data: Mutex::new(data.into_boxed_slice()),
            }),
        }
    }

    /// Identity used by the registration table.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Run `f` over the contents.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let bytes = lock(&self.inner.data, "host buffer")?;
        Ok(f(&bytes))
    }

    /// Run `f` over the contents, mutably.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let mut bytes = lock(&self.inner.data, "host buffer")?;
        Ok(f(&mut bytes))
    }

    /// Copy of the contents.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.read(|b| b.to_vec())
    }

    /// Overwrite bytes starting at `offset`.
    pub fn copy_from_slice(&self, offset: usize, src: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(src.len())
            .filter(|&end| end <= self.len())
            .ok_or(DeviceError::TransferFailure {
                requested: src.len(),
                scheduled: self.len().saturating_sub(offset),
            })?;
        self.write(|b| b[offset..end].copy_from_slice(src))
    }
}

/// Memory table statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub limit: usize,
    pub allocated: usize,
    pub peak: usize,
    pub live_allocations: usize,
    pub registered_host_bytes: usize,
}

impl std::fmt::Display for PoolStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Device memory: {:.1}MB allocated ({} buffers), {:.1}MB peak, {:.1}MB limit, {:.1}MB host registered",
            self.allocated as f64 / 1e6,
            self.live_allocations,
            self.peak as f64 / 1e6,
            self.limit as f64 / 1e6,
            self.registered_host_bytes as f64 / 1e6,
        )
    }
}

/// Allocation table of an emulated device.
#[derive(Debug)]
pub(crate) struct DeviceMemory {
    limit: usize,
    allocated: usize,
    peak: usize,
    next_id: u64,
    allocations: HashMap<u64, (usize, Arc<Allocation>)>,
}

impl DeviceMemory {
    pub(crate) fn new(limit: usize) -> Self {
        DeviceMemory {
            limit,
            allocated: 0,
            peak: 0,
            next_id: 1,
            allocations: HashMap::new(),
        }
    }

    pub(crate) fn allocate(&mut self, size: usize) -> Result<DeviceBuffer> {
        let available = self.limit.saturating_sub(self.allocated);
        if size > available {
            return Err(DeviceError::OutOfMemory {
                requested: size,
                available,
            });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.allocations.insert(id, (size, Allocation::zeroed(size)));
        self.allocated += size;
        self.peak = self.peak.max(self.allocated);
        tracing::debug!(id, size, allocated = self.allocated, "device allocation");
        Ok(DeviceBuffer::new(id, size))
    }

    pub(crate) fn free(&mut self, buffer: DeviceBuffer) -> Result<()> {
        let (size, _) = self
            .allocations
            .remove(&buffer.id)
            .ok_or_else(|| DeviceError::handle(format!("device buffer {} not allocated", buffer.id)))?;
        self.allocated = self.allocated.saturating_sub(size);
        tracing::debug!(id = buffer.id, size, "device free");
        Ok(())
    }

    pub(crate) fn get(&self, buffer: DeviceBuffer) -> Result<Arc<Allocation>> {
        self.allocations
            .get(&buffer.id)
            .map(|(_, a)| Arc::clone(a))
            .ok_or_else(|| DeviceError::handle(format!("device buffer {} not allocated", buffer.id)))
    }

    /// Resolve `len` bytes at `ptr`, failing with the schedulable byte count.
    pub(crate) fn resolve(&self, ptr: DevicePtr, len: usize) -> Result<BufferView> {
        let alloc = self.get(ptr.buffer)?;
        if ptr.offset.checked_add(len).map_or(true, |end| end > ptr.buffer.size) {
            return Err(DeviceError::TransferFailure {
                requested: len,
                scheduled: ptr.remaining(),
            });
        }
        Ok(BufferView::new(alloc, ptr.offset, len))
    }

    pub(crate) fn clear(&mut self) {
        self.allocations.clear();
        self.allocated = 0;
    }

    pub(crate) fn stats(&self, registered_host_bytes: usize) -> PoolStats {
        PoolStats {
            limit: self.limit,
            allocated: self.allocated,
            peak: self.peak,
            live_allocations: self.allocations.len(),
            registered_host_bytes,
        }
    }
}

/// Host memory registration state, keyed by buffer identity.
#[derive(Debug, Default)]
pub(crate) struct Registrations {
    entries: HashMap<u64, usize>,
}

impl Registrations {
    pub(crate) fn register(&mut self, buffer: &HostBuffer) -> Result<()> {
        if self.entries.contains_key(&buffer.id()) {
            return Err(DeviceError::handle(format!(
                "host buffer {} already registered",
                buffer.id()
            )));
        }
        self.entries.insert(buffer.id(), buffer.len());
        Ok(())
    }

    pub(crate) fn unregister(&mut self, buffer: &HostBuffer) -> Result<()> {
        self.entries
            .remove(&buffer.id())
            .map(|_| ())
            .ok_or_else(|| DeviceError::handle(format!("host buffer {} was never registered", buffer.id())))
    }

    pub(crate) fn contains(&self, buffer: &HostBuffer) -> bool {
        self.entries.contains_key(&buffer.id())
    }

    pub(crate) fn total_bytes(&self) -> usize {
        self.entries.values().sum()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
