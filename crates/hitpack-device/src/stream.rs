//! Stream pool of the host-emulated device.
//!
//! Each stream is a worker thread draining an ordered queue:
//!
//! ```text
//!  controller ──submit──▶ [ copy | kernel | wait(ev) | marker ] ──▶ worker
//!                                                                    │
//!                      sticky fault ◀── first failing op ────────────┘
//! ```
//!
//! Operations run in submission order. `Wait` blocks only the worker, never
//! the controller. After a fault, work on that stream is skipped until the
//! fault is taken by a stream or device synchronization. Markers reached in
//! the meantime complete in the failed state, so events recorded behind the
//! fault report it, and a stream waiting on such an event takes the fault
//! over.

use crate::error::{DeviceError, Result};
use crate::event::Marker;
use crate::memory::lock;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Stream handle. Negative values select the synchronous default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub i32);

impl StreamId {
    /// The default stream: operations complete before the submitting call returns.
    pub const DEFAULT: StreamId = StreamId(-1);

    /// Whether this selects the default stream.
    pub fn is_default(self) -> bool {
        self.0 < 0
    }
}

impl From<i32> for StreamId {
    fn from(id: i32) -> Self {
        StreamId(id)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_default() {
            write!(f, "stream(default)")
        } else {
            write!(f, "stream({})", self.0)
        }
    }
}

/// Activity of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    /// Nothing queued or running.
    Ready,
    /// Work is queued or running.
    Busy,
}

pub(crate) type Work = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

pub(crate) enum StreamOp {
    Work(Work),
    Wait(Vec<Arc<Marker>>),
    Marker(Arc<Marker>),
}

#[derive(Default)]
struct StreamShared {
    pending: AtomicUsize,
    fault: Mutex<Option<DeviceError>>,
}

pub(crate) struct StreamWorker {
    id: StreamId,
    sender: Option<Sender<StreamOp>>,
    handle: Option<JoinHandle<()>>,
    shared: Arc<StreamShared>,
}

impl StreamWorker {
    fn spawn(id: StreamId, device_index: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<StreamOp>();
        let shared = Arc::new(StreamShared::default());
        let worker_shared = Arc::clone(&shared);

        let handle = std::thread::Builder::new()
            .name(format!("hitpack-dev{}-s{}", device_index, id.0))
            .spawn(move || {
                for op in receiver {
                    match op {
                        StreamOp::Work(work) => {
                            let faulted = worker_shared
                                .fault
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .is_some();
                            if !faulted {
                                let outcome = panic::catch_unwind(AssertUnwindSafe(work))
                                    .unwrap_or_else(|_| Err(DeviceError::kernel("stream operation panicked")));
                                if let Err(e) = outcome {
                                    tracing::debug!(stream = id.0, error = %e, "stream fault");
                                    *worker_shared.fault.lock().unwrap_or_else(|p| p.into_inner()) = Some(e);
                                }
                            }
                        }
                        StreamOp::Wait(markers) => {
                            for marker in markers {
                                if let Err(e) = marker.wait_checked() {
                                    let mut fault =
                                        worker_shared.fault.lock().unwrap_or_else(|p| p.into_inner());
                                    if fault.is_none() {
                                        tracing::debug!(stream = id.0, error = %e, "waited on a failed event");
                                        *fault = Some(e);
                                    }
                                }
                            }
                        }
                        StreamOp::Marker(marker) => {
                            let fault = worker_shared
                                .fault
                                .lock()
                                .unwrap_or_else(|p| p.into_inner())
                                .as_ref()
                                .map(DeviceError::replay);
                            // leave the queue before waiters wake
                            worker_shared.pending.fetch_sub(1, Ordering::AcqRel);
                            match fault {
                                Some(e) => marker.fail(e),
                                None => marker.complete(),
                            }
                            continue;
                        }
                    }
                    worker_shared.pending.fetch_sub(1, Ordering::AcqRel);
                }
            })
            .map_err(|e| DeviceError::DeviceUnavailable(format!("cannot spawn {}: {}", id, e)))?;

        Ok(StreamWorker {
            id,
            sender: Some(sender),
            handle: Some(handle),
            shared,
        })
    }

    fn push(&self, op: StreamOp) -> Result<()> {
        let sender = self.sender.as_ref().ok_or(DeviceError::InvalidState {
            expected: "running stream",
            actual: "stopped stream",
        })?;
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        sender.send(op).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            DeviceError::InvalidState {
                expected: "running stream",
                actual: "disconnected stream worker",
            }
        })
    }

    /// Enqueue a marker and return it.
    fn tail(&self) -> Result<Arc<Marker>> {
        let marker = Marker::new();
        self.push(StreamOp::Marker(Arc::clone(&marker)))?;
        Ok(marker)
    }

    fn take_fault(&self) -> Result<Option<DeviceError>> {
        Ok(lock(&self.shared.fault, "stream fault slot")?.take())
    }

    fn status(&self) -> StreamStatus {
        if self.shared.pending.load(Ordering::Acquire) == 0 {
            StreamStatus::Ready
        } else {
            StreamStatus::Busy
        }
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!(stream = self.id.0, "stream worker panicked");
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fixed set of asynchronous streams.
pub(crate) struct StreamPool {
    workers: Vec<StreamWorker>,
}

impl StreamPool {
    pub(crate) fn new(count: usize, device_index: usize) -> Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            workers.push(StreamWorker::spawn(StreamId(i as i32), device_index)?);
        }
        tracing::debug!(count, "stream pool started");
        Ok(StreamPool { workers })
    }

    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    fn worker(&self, stream: StreamId) -> Result<&StreamWorker> {
        usize::try_from(stream.0)
            .ok()
            .and_then(|i| self.workers.get(i))
            .ok_or_else(|| DeviceError::handle(format!("{} outside pool of {}", stream, self.workers.len())))
    }

    /// Check that a non-default stream exists.
    pub(crate) fn check(&self, stream: StreamId) -> Result<()> {
        if stream.is_default() {
            return Ok(());
        }
        self.worker(stream).map(|_| ())
    }

    pub(crate) fn submit(&self, stream: StreamId, work: Work) -> Result<()> {
        self.worker(stream)?.push(StreamOp::Work(work))
    }

    pub(crate) fn wait_for(&self, stream: StreamId, markers: Vec<Arc<Marker>>) -> Result<()> {
        if markers.is_empty() {
            return Ok(());
        }
        self.worker(stream)?.push(StreamOp::Wait(markers))
    }

    /// Marker completing once everything queued so far on `stream` has run.
    pub(crate) fn tail(&self, stream: StreamId) -> Result<Arc<Marker>> {
        self.worker(stream)?.tail()
    }

    /// Block until `stream` drains, surfacing its sticky fault.
    pub(crate) fn synchronize(&self, stream: StreamId) -> Result<()> {
        let worker = self.worker(stream)?;
        worker.tail()?.wait();
        match worker.take_fault()? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Block until every stream drains; the first fault found is returned.
    pub(crate) fn synchronize_all(&self) -> Result<()> {
        let markers = self
            .workers
            .iter()
            .map(StreamWorker::tail)
            .collect::<Result<Vec<_>>>()?;
        for marker in markers {
            marker.wait();
        }
        let mut first = None;
        for worker in &self.workers {
            if let Some(e) = worker.take_fault()? {
                tracing::warn!(stream = worker.id.0, error = %e, "fault surfaced by device synchronize");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    pub(crate) fn status(&self, stream: StreamId) -> Result<StreamStatus> {
        Ok(self.worker(stream)?.status())
    }

    /// Stop and join every worker after draining its queue.
    pub(crate) fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ops_run_in_order() {
        let pool = StreamPool::new(1, 0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let log = Arc::clone(&log);
            pool.submit(
                StreamId(0),
                Box::new(move || {
                    log.lock().unwrap().push(i);
                    Ok(())
                }),
            )
            .unwrap();
        }
        pool.synchronize(StreamId(0)).unwrap();
        assert_eq!(*log.lock().unwrap(), (0..50).collect::<Vec<_>>());
        assert_eq!(pool.status(StreamId(0)).unwrap(), StreamStatus::Ready);
    }

    #[test]
    fn test_stream_ready_once_synchronized() {
        let pool = StreamPool::new(1, 0).unwrap();
        for _ in 0..500 {
            pool.submit(StreamId(0), Box::new(|| Ok(()))).unwrap();
            pool.synchronize(StreamId(0)).unwrap();
            assert_eq!(pool.status(StreamId(0)).unwrap(), StreamStatus::Ready);
        }
        let marker = pool.tail(StreamId(0)).unwrap();
        marker.wait();
        assert_eq!(pool.status(StreamId(0)).unwrap(), StreamStatus::Ready);
    }

    #[test]
    fn test_fault_is_sticky_until_synchronized() {
        let pool = StreamPool::new(1, 0).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        pool.submit(StreamId(0), Box::new(|| Err(DeviceError::kernel("bad")))).unwrap();
        let counter = Arc::clone(&ran);
        pool.submit(
            StreamId(0),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        let err = pool.synchronize(StreamId(0)).unwrap_err();
        assert_eq!(err.category(), "kernel_launch");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        pool.synchronize(StreamId(0)).unwrap();
    }

    #[test]
    fn test_unknown_stream_is_invalid_handle() {
        let pool = StreamPool::new(2, 0).unwrap();
        assert!(pool.check(StreamId(1)).is_ok());
        assert!(pool.check(StreamId::DEFAULT).is_ok());
        assert_eq!(pool.check(StreamId(2)).unwrap_err().category(), "invalid_handle");
    }

    #[test]
    fn test_wait_orders_across_streams() {
        let pool = StreamPool::new(2, 0).unwrap();
        let gate = Marker::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        pool.wait_for(StreamId(1), vec![Arc::clone(&gate)]).unwrap();
        let l = Arc::clone(&log);
        pool.submit(StreamId(1), Box::new(move || {
            l.lock().unwrap().push("after");
            Ok(())
        }))
        .unwrap();
        let l = Arc::clone(&log);
        let g = Arc::clone(&gate);
        pool.submit(StreamId(0), Box::new(move || {
            l.lock().unwrap().push("before");
            g.complete();
            Ok(())
        }))
        .unwrap();

        pool.synchronize_all().unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn test_marker_behind_fault_fails() {
        let pool = StreamPool::new(2, 0).unwrap();
        pool.submit(StreamId(0), Box::new(|| Err(DeviceError::kernel("bad")))).unwrap();
        let behind = pool.tail(StreamId(0)).unwrap();
        assert_eq!(behind.wait_checked().unwrap_err().category(), "kernel_launch");

        // a dependent stream inherits the fault and skips its work
        let ran = Arc::new(AtomicUsize::new(0));
        pool.wait_for(StreamId(1), vec![Arc::clone(&behind)]).unwrap();
        let counter = Arc::clone(&ran);
        pool.submit(
            StreamId(1),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(pool.synchronize(StreamId(1)).unwrap_err().category(), "kernel_launch");
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // taking the fault clears the stream; later markers complete cleanly
        assert!(pool.synchronize(StreamId(0)).is_err());
        pool.tail(StreamId(0)).unwrap().wait_checked().unwrap();
        assert!(behind.fault().is_some());
    }
}
