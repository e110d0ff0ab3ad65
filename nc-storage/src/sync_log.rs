//! Per-slot durable log of mutating events (§4.4), consulted by the sync
//! controller's event-sync path and fed by every committed local mutation
//! and every applied remote event.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::record::RecNum;
use nc_api_types::{PeerId, SlotId, SyncOp};

#[derive(Clone, Debug)]
pub struct SyncEvent {
    pub rec_no: RecNum,
    pub op: SyncOp,
    pub key: Vec<u8>,
    pub orig_time: i64,
    /// The rec-no this event was originally recorded under on the node that
    /// produced it; preserved across replication so re-application is
    /// idempotent (§4.4, §4.8).
    pub orig_rec_no: RecNum,
}

/// Returned by [`SlotSyncLog::events_since`] when the requested tail has
/// already been evicted: the caller must fall back to blob-list sync.
pub struct NeedsFullResync;

struct SlotSyncLog {
    events: Mutex<VecDeque<SyncEvent>>,
    capacity: usize,
    peer_acks: Mutex<HashMap<PeerId, RecNum>>,
    last_forced_clean: Mutex<i64>,
}

impl SlotSyncLog {
    fn new(capacity: usize) -> Self {
        SlotSyncLog {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            peer_acks: Mutex::new(HashMap::new()),
            last_forced_clean: Mutex::new(0),
        }
    }
}

/// Owns every slot's ring buffer and the persisted high-water-mark rec-no
/// side-file value (§6: `max-sync-log-rec-no`).
pub struct SyncLog {
    slots: RwLock<HashMap<SlotId, Arc<SlotSyncLog>>>,
    capacity: usize,
    min_forced_clean_period_secs: i64,
    persisted_max_rec_no: AtomicU64,
}

impl SyncLog {
    pub fn new(capacity: usize, min_forced_clean_period_secs: i64) -> Self {
        SyncLog {
            slots: RwLock::new(HashMap::new()),
            capacity,
            min_forced_clean_period_secs,
            persisted_max_rec_no: AtomicU64::new(0),
        }
    }

    fn slot_log(&self, slot: SlotId) -> Arc<SlotSyncLog> {
        if let Some(existing) = self.slots.read().get(&slot) {
            return existing.clone();
        }
        let mut slots = self.slots.write();
        slots
            .entry(slot)
            .or_insert_with(|| Arc::new(SlotSyncLog::new(self.capacity)))
            .clone()
    }

    /// Append a new event, evicting the oldest one if the ring buffer is at
    /// capacity. `now` gates how often an eviction is logged, not whether it
    /// happens — the buffer is hard-bounded.
    pub fn append(&self, slot: SlotId, event: SyncEvent, now: i64) {
        let slot_log = self.slot_log(slot);
        let rec_no = event.rec_no;
        let mut events = slot_log.events.lock();
        if events.len() >= slot_log.capacity {
            events.pop_front();
            let mut last = slot_log.last_forced_clean.lock();
            if now - *last >= self.min_forced_clean_period_secs {
                log::warn!("sync log for slot {slot} is full, forcibly advancing tail");
                *last = now;
            }
        }
        events.push_back(event);
        self.persisted_max_rec_no.fetch_max(rec_no, Ordering::AcqRel);
    }

    /// Record that `peer` has applied events up to and including `rec_no`.
    pub fn ack(&self, slot: SlotId, peer: PeerId, rec_no: RecNum) {
        let slot_log = self.slot_log(slot);
        let mut acks = slot_log.peer_acks.lock();
        acks.entry(peer)
            .and_modify(|v| *v = (*v).max(rec_no))
            .or_insert(rec_no);
    }

    /// The lowest rec-no acknowledged across `peers`; events at or below this
    /// are eligible for discard once the ring buffer needs the room.
    pub fn min_ack(&self, slot: SlotId, peers: &[PeerId]) -> RecNum {
        let slot_log = self.slot_log(slot);
        let acks = slot_log.peer_acks.lock();
        peers
            .iter()
            .map(|p| acks.get(p).copied().unwrap_or(0))
            .min()
            .unwrap_or(0)
    }

    /// Events strictly newer than `peer_last_rec_no`, in rec-no order, for
    /// the event-sync fast path. `Err(NeedsFullResync)` if the peer's last
    /// applied position has already fallen off the tail.
    pub fn events_since(
        &self,
        slot: SlotId,
        peer_last_rec_no: RecNum,
    ) -> Result<Vec<SyncEvent>, NeedsFullResync> {
        let slot_log = self.slot_log(slot);
        let events = slot_log.events.lock();
        match events.front() {
            Some(oldest) if peer_last_rec_no != 0 && peer_last_rec_no < oldest.rec_no.saturating_sub(1) => {
                Err(NeedsFullResync)
            }
            _ => Ok(events
                .iter()
                .filter(|e| e.rec_no > peer_last_rec_no)
                .cloned()
                .collect()),
        }
    }

    pub fn persisted_max_rec_no(&self) -> RecNum {
        self.persisted_max_rec_no.load(Ordering::Acquire)
    }

    /// Restore the high-water mark read back from the index side-file at
    /// startup, so rec-no allocation does not restart at zero.
    pub fn restore_max_rec_no(&self, value: RecNum) {
        self.persisted_max_rec_no.fetch_max(value, Ordering::AcqRel);
    }

    pub fn slot_len(&self, slot: SlotId) -> usize {
        self.slot_log(slot).events.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(rec_no: RecNum) -> SyncEvent {
        SyncEvent {
            rec_no,
            op: SyncOp::Write,
            key: b"k".to_vec(),
            orig_time: 1,
            orig_rec_no: rec_no,
        }
    }

    #[test]
    fn ring_buffer_evicts_oldest_at_capacity() {
        let log = SyncLog::new(2, 0);
        log.append(1, event(1), 0);
        log.append(1, event(2), 0);
        log.append(1, event(3), 0);
        assert_eq!(log.slot_len(1), 2);
        let events = log.events_since(1, 0).unwrap();
        assert_eq!(events.iter().map(|e| e.rec_no).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn peer_behind_evicted_tail_needs_full_resync() {
        let log = SyncLog::new(2, 0);
        for i in 1..=5 {
            log.append(1, event(i), 0);
        }
        assert!(log.events_since(1, 1).is_err());
        assert!(log.events_since(1, 4).is_ok());
    }

    #[test]
    fn min_ack_is_the_minimum_across_peers() {
        let log = SyncLog::new(10, 0);
        log.ack(1, PeerId::from("a"), 5);
        log.ack(1, PeerId::from("b"), 3);
        assert_eq!(log.min_ack(1, &[PeerId::from("a"), PeerId::from("b")]), 3);
        assert_eq!(log.min_ack(1, &[PeerId::from("a"), PeerId::from("c")]), 0);
    }
}
