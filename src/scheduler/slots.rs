use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::job::Job;
use crate::worker::ProcessHandle;

/// Identifier of one exclusive GPU execution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn index(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GPU {}", self.0)
    }
}

/// Free slots of a run. Slots are handed out lowest id first.
#[derive(Debug, Clone)]
pub struct SlotPool {
    capacity: u32,
    free: BTreeSet<SlotId>,
}

impl SlotPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            free: (0..capacity).map(SlotId).collect(),
        }
    }

    /// Take the lowest free slot
    pub fn acquire(&mut self) -> Option<SlotId> {
        self.free.pop_first()
    }

    /// Return a slot to the pool. Returns false for slots outside the pool
    /// range or slots that are already free.
    pub fn release(&mut self, slot: SlotId) -> bool {
        if slot.0 >= self.capacity {
            tracing::warn!(slot = %slot, capacity = self.capacity, "Released slot outside pool");
            return false;
        }
        self.free.insert(slot)
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn free_slots(&self) -> Vec<SlotId> {
        self.free.iter().copied().collect()
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// A job that currently occupies a slot, together with its process.
pub struct RunningJob {
    pub job: Job,
    pub handle: Box<dyn ProcessHandle>,
    pub started: Instant,
}

impl std::fmt::Debug for RunningJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningJob")
            .field("job_id", &self.job.id)
            .field("filename", &self.job.filename)
            .field("pid", &self.handle.pid())
            .finish()
    }
}

/// Occupied slots, exactly one entry per slot.
#[derive(Debug, Default)]
pub struct RunningSet {
    entries: BTreeMap<SlotId, RunningJob>,
}

impl RunningSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job on a slot. Returns the previous occupant if the slot was
    /// already taken.
    pub fn insert(&mut self, slot: SlotId, running: RunningJob) -> Option<RunningJob> {
        self.entries.insert(slot, running)
    }

    pub fn remove(&mut self, slot: SlotId) -> Option<RunningJob> {
        self.entries.remove(&slot)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&SlotId, &mut RunningJob)> {
        self.entries.iter_mut()
    }

    /// Job ID per occupied slot
    pub fn job_ids(&self) -> BTreeMap<SlotId, Uuid> {
        self.entries
            .iter()
            .map(|(slot, running)| (*slot, running.job.id))
            .collect()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.entries.values().map(|running| &running.job)
    }

    pub fn drain(&mut self) -> Vec<(SlotId, RunningJob)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_hands_out_lowest_slot_first() {
        let mut pool = SlotPool::new(3);
        assert_eq!(pool.acquire(), Some(SlotId(0)));
        assert_eq!(pool.acquire(), Some(SlotId(1)));

        assert!(pool.release(SlotId(0)));
        assert_eq!(pool.acquire(), Some(SlotId(0)));
        assert_eq!(pool.acquire(), Some(SlotId(2)));
        assert_eq!(pool.acquire(), None);
        assert!(!pool.has_free());
    }

    #[test]
    fn pool_rejects_foreign_and_double_release() {
        let mut pool = SlotPool::new(2);
        assert!(!pool.release(SlotId(5)));
        // Slot 1 was never taken
        assert!(!pool.release(SlotId(1)));
        assert_eq!(pool.free_slots(), vec![SlotId(0), SlotId(1)]);
    }

    #[test]
    fn slot_display() {
        assert_eq!(SlotId(3).to_string(), "GPU 3");
        assert_eq!(SlotId(3).index(), 3);
    }
}
