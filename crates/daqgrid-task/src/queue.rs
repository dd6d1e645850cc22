//! Coalescing descriptor hand-off.

use std::sync::Mutex;

use daq_core::Descriptor;

/// Single-slot queue between the environment manager and the matcher.
///
/// Pushes coalesce: a deploy arriving while the previous batch is still
/// unconsumed appends to it, so one offers cycle sees the combined list.
/// `take` is non-blocking and empties the slot.
#[derive(Default)]
pub struct DeployQueue {
    slot: Mutex<Vec<Descriptor>>,
}

impl DeployQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, descriptors: Vec<Descriptor>) {
        let mut slot = self.slot.lock().expect("deploy queue lock poisoned");
        slot.extend(descriptors);
    }

    pub fn take(&self) -> Vec<Descriptor> {
        let mut slot = self.slot.lock().expect("deploy queue lock poisoned");
        std::mem::take(&mut *slot)
    }

    pub fn is_empty(&self) -> bool {
        let slot = self.slot.lock().expect("deploy queue lock poisoned");
        slot.is_empty()
    }
}
