//! Request deduplication state: the memoized request log plus the in-flight
//! guard, kept under one lock so admission is atomic.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::server::OpResult;

/// Request ID type. Client-generated, and serves as the idempotency key of
/// one logical operation across all of its retries.
pub type RequestId = u64;

/// Per-request slot held by the tracker.
#[derive(Debug, PartialEq, Eq, Clone)]
enum RequestSlot {
    /// The request is being processed right now.
    InFlight,

    /// The request finished earlier with this recorded result.
    Done(OpResult),
}

/// Admission decision for an incoming request ID.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Admission {
    /// Never seen before; the caller now owns processing it and must later
    /// either `record()` or `abandon()` the ID.
    Fresh,

    /// A previous attempt with this ID is still in flight; reject without
    /// touching anything.
    Busy,

    /// Already completed; deliver this recorded result instead of executing
    /// again.
    Replay(OpResult),
}

/// Tracker of request IDs and their completion results. The combined map
/// makes check-then-set a single critical section, so two concurrent
/// attempts with the same ID can never both be admitted as fresh.
#[derive(Debug, Default)]
pub struct RequestTracker {
    /// Map from request ID -> its current slot.
    slots: Mutex<HashMap<RequestId, RequestSlot>>,
}

impl RequestTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        RequestTracker {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Admits a request ID, marking it in-flight if fresh.
    pub fn admit(&self, id: RequestId) -> Admission {
        let mut slots = self.slots.lock().expect("poisoned request tracker");
        match slots.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(RequestSlot::InFlight);
                Admission::Fresh
            }
            Entry::Occupied(entry) => match entry.get() {
                RequestSlot::InFlight => Admission::Busy,
                RequestSlot::Done(result) => Admission::Replay(result.clone()),
            },
        }
    }

    /// Records the final result of a fresh request. A result already
    /// recorded for this ID stays untouched; results are immutable once
    /// written.
    pub fn record(&self, id: RequestId, result: OpResult) {
        let mut slots = self.slots.lock().expect("poisoned request tracker");
        match slots.get(&id) {
            Some(RequestSlot::Done(_)) => {}
            _ => {
                slots.insert(id, RequestSlot::Done(result));
            }
        }
    }

    /// Releases the in-flight mark of a request that failed before its
    /// result was recorded, so a later retry is admitted as fresh again.
    /// Recorded results are never released.
    pub fn abandon(&self, id: RequestId) {
        let mut slots = self.slots.lock().expect("poisoned request tracker");
        if let Some(RequestSlot::InFlight) = slots.get(&id) {
            slots.remove(&id);
        }
    }

    /// Reads the recorded result of a request ID if it has one.
    pub fn result_of(&self, id: RequestId) -> Option<OpResult> {
        let slots = self.slots.lock().expect("poisoned request tracker");
        match slots.get(&id) {
            Some(RequestSlot::Done(result)) => Some(result.clone()),
            _ => None,
        }
    }

    /// Number of request IDs with a recorded result.
    pub fn num_recorded(&self) -> usize {
        let slots = self.slots.lock().expect("poisoned request tracker");
        slots
            .values()
            .filter(|slot| matches!(slot, RequestSlot::Done(_)))
            .count()
    }
}
