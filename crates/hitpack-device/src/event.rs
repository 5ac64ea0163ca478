//! Events and completion markers.
//!
//! An event slot points at the marker of the last position it was recorded
//! at. Re-recording swaps the marker, so waiters holding the previous one
//! are unaffected.

use crate::error::{DeviceError, Result};
use std::sync::{Arc, Condvar, Mutex};

/// One-shot completion flag shared between a stream and its waiters.
///
/// A marker reached while its stream holds a sticky fault completes in the
/// failed state, carrying that fault to whoever waits on it.
#[derive(Debug, Default)]
pub(crate) struct Marker {
    state: Mutex<MarkerState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct MarkerState {
    done: bool,
    fault: Option<DeviceError>,
}

impl Marker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Marker::default())
    }

    pub(crate) fn completed() -> Arc<Self> {
        let marker = Marker::new();
        marker.complete();
        marker
    }

    fn finish(&self, fault: Option<DeviceError>) {
        // a poisoned flag still gets set so waiters never hang
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.done = true;
        state.fault = fault;
        self.cv.notify_all();
    }

    pub(crate) fn complete(&self) {
        self.finish(None);
    }

    /// Complete in the failed state.
    pub(crate) fn fail(&self, fault: DeviceError) {
        self.finish(Some(fault));
    }

    pub(crate) fn is_done(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).done
    }

    pub(crate) fn wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        while !state.done {
            state = self.cv.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Fault the marker completed with, if any.
    pub(crate) fn fault(&self) -> Option<DeviceError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.fault.as_ref().map(DeviceError::replay)
    }

    /// Wait for completion and surface the fault it completed with.
    pub(crate) fn wait_checked(&self) -> Result<()> {
        self.wait();
        self.fault().map_or(Ok(()), Err)
    }
}

/// Handle to an event slot.
///
/// Not `Clone`: the handle is given back with `release_event`, after which
/// the stale generation makes any leftover reference an invalid handle.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Event {
    index: u32,
    generation: u32,
}

impl Event {
    /// Slot index inside the pool.
    pub fn index(&self) -> u32 {
        self.index
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    in_use: bool,
    marker: Option<Arc<Marker>>,
}

/// Fixed-capacity event pool.
#[derive(Debug)]
pub(crate) struct EventPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl EventPool {
    /// Create a pool whose slots start at `generation`.
    ///
    /// A backend re-initializing its device passes the
    /// [`next_generation`](Self::next_generation) of the pool it tore down,
    /// so handles from the previous context stay invalid.
    pub(crate) fn new(capacity: usize, generation: u32) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                generation,
                ..Slot::default()
            })
            .collect();
        // pop from the back hands out low indices first
        let free = (0..capacity as u32).rev().collect();
        EventPool { slots, free }
    }

    /// Generation above every handle this pool has issued.
    pub(crate) fn next_generation(&self) -> u32 {
        self.slots
            .iter()
            .map(|s| s.generation)
            .max()
            .map_or(0, |g| g.wrapping_add(1))
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub(crate) fn create(&mut self) -> Result<Event> {
        let index = self.free.pop().ok_or_else(|| {
            DeviceError::PoolExhausted(format!("all {} events in use", self.slots.len()))
        })?;
        let slot = &mut self.slots[index as usize];
        slot.in_use = true;
        slot.marker = None;
        Ok(Event {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, event: &Event) -> Result<&Slot> {
        self.slots
            .get(event.index as usize)
            .filter(|s| s.in_use && s.generation == event.generation)
            .ok_or_else(|| DeviceError::handle(format!("event {} is stale or released", event.index)))
    }

    fn slot_mut(&mut self, event: &Event) -> Result<&mut Slot> {
        self.slots
            .get_mut(event.index as usize)
            .filter(|s| s.in_use && s.generation == event.generation)
            .ok_or_else(|| DeviceError::handle(format!("event {} is stale or released", event.index)))
    }

    /// Marker of the last recorded point, `None` if never recorded.
    pub(crate) fn marker(&self, event: &Event) -> Result<Option<Arc<Marker>>> {
        Ok(self.slot(event)?.marker.clone())
    }

    pub(crate) fn record(&mut self, event: &Event, marker: Arc<Marker>) -> Result<()> {
        self.slot_mut(event)?.marker = Some(marker);
        Ok(())
    }

    pub(crate) fn release(&mut self, event: Event) -> Result<()> {
        let slot = self.slot_mut(&event)?;
        slot.in_use = false;
        slot.marker = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(event.index);
        Ok(())
    }

    /// Markers of every listed event that has been recorded.
    pub(crate) fn recorded(&self, events: &[&Event]) -> Result<Vec<Arc<Marker>>> {
        let mut markers = Vec::with_capacity(events.len());
        for event in events {
            if let Some(m) = self.marker(event)? {
                markers.push(m);
            }
        }
        Ok(markers)
    }

    /// True only if every listed event was recorded and has completed.
    ///
    /// An event that completed behind a stream fault returns that fault.
    pub(crate) fn all_done(&self, events: &[&Event]) -> Result<bool> {
        let mut done = true;
        for event in events {
            match self.marker(event)? {
                Some(m) if m.is_done() => {
                    if let Some(fault) = m.fault() {
                        return Err(fault);
                    }
                }
                _ => done = false,
            }
        }
        Ok(done)
    }

    /// Block until every recorded event completes; the first fault found is returned.
    pub(crate) fn wait_all(&self, events: &[&Event]) -> Result<()> {
        let mut first = None;
        for marker in self.recorded(events)? {
            if let Err(e) = marker.wait_checked() {
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Drop every slot; outstanding handles become stale.
    pub(crate) fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.in_use = false;
            slot.marker = None;
            slot.generation = slot.generation.wrapping_add(1);
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecorded_event_is_not_done() {
        let mut pool = EventPool::new(4, 0);
        let event = pool.create().unwrap();
        assert!(!pool.all_done(&[&event]).unwrap());
        assert!(pool.recorded(&[&event]).unwrap().is_empty());
    }

    #[test]
    fn test_record_and_complete() {
        let mut pool = EventPool::new(4, 0);
        let event = pool.create().unwrap();
        let marker = Marker::new();
        pool.record(&event, Arc::clone(&marker)).unwrap();
        assert!(!pool.all_done(&[&event]).unwrap());
        marker.complete();
        assert!(pool.all_done(&[&event]).unwrap());
    }

    #[test]
    fn test_rerecord_replaces_target() {
        let mut pool = EventPool::new(4, 0);
        let event = pool.create().unwrap();
        pool.record(&event, Marker::completed()).unwrap();
        pool.record(&event, Marker::new()).unwrap();
        assert!(!pool.all_done(&[&event]).unwrap());
    }

    #[test]
    fn test_released_handle_is_stale() {
        let mut pool = EventPool::new(1, 0);
        let event = pool.create().unwrap();
        let stale = Event {
            index: event.index,
            generation: event.generation,
        };
        pool.release(event).unwrap();
        let reused = pool.create().unwrap();
        assert_eq!(reused.index(), stale.index());
        assert_eq!(pool.marker(&stale).unwrap_err().category(), "invalid_handle");
        assert!(pool.marker(&reused).is_ok());
    }

    #[test]
    fn test_exhaustion() {
        let mut pool = EventPool::new(2, 0);
        let _a = pool.create().unwrap();
        let _b = pool.create().unwrap();
        assert_eq!(pool.create().unwrap_err().category(), "pool_exhausted");
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_failed_marker_surfaces_fault() {
        let mut pool = EventPool::new(2, 0);
        let ok = pool.create().unwrap();
        let bad = pool.create().unwrap();
        pool.record(&ok, Marker::completed()).unwrap();
        let marker = Marker::new();
        pool.record(&bad, Arc::clone(&marker)).unwrap();
        assert!(!pool.all_done(&[&ok, &bad]).unwrap());

        marker.fail(DeviceError::kernel("table mismatch"));
        assert!(pool.all_done(&[&ok]).unwrap());
        assert_eq!(pool.all_done(&[&ok, &bad]).unwrap_err().category(), "kernel_launch");
        assert_eq!(pool.wait_all(&[&bad]).unwrap_err().category(), "kernel_launch");
        // the fault stays with the recorded point until it is re-recorded
        assert!(pool.all_done(&[&bad]).is_err());
        pool.record(&bad, Marker::completed()).unwrap();
        pool.wait_all(&[&ok, &bad]).unwrap();
    }

    #[test]
    fn test_generation_carries_across_pools() {
        let mut first = EventPool::new(2, 0);
        let old = first.create().unwrap();
        first.clear();
        let mut second = EventPool::new(2, first.next_generation());
        let fresh = second.create().unwrap();
        assert_eq!(fresh.index(), old.index());
        assert_eq!(second.marker(&old).unwrap_err().category(), "invalid_handle");
        assert!(second.marker(&fresh).is_ok());
    }
}
