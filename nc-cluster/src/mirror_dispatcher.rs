//! Per-peer bounded outbound event queues (§4.6).
//!
//! Two FIFOs per peer separate small blobs from big ones so that mirroring
//! one large blob cannot starve propagation of many small ones. Enqueue
//! never blocks and never fails the originating client write: a full queue
//! just increments `CopyReqsRejected` and leaves the gap for the next sync
//! pass to repair (§7 propagation policy, §8 invariant 4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use nc_api_types::{LwwStamp, PeerId, SlotId};

/// Outbound mirror event kinds (§4.6).
#[derive(Clone, Debug)]
pub enum MirrorEvent {
    /// Peer should fetch the current version of `key` from us (or any peer
    /// serving the slot).
    Write { slot: SlotId, key: Vec<u8>, orig_rec_no: u64 },
    /// Peer should bump TTL if its blob summary still matches `stamp`.
    Prolong {
        slot: SlotId,
        key: Vec<u8>,
        orig_rec_no: u64,
        orig_time: i64,
        stamp: LwwStamp,
        dead_time: i64,
    },
    /// Hint-only: force a TTL bump on a prior-read path, no ack required.
    Update { slot: SlotId, key: Vec<u8>, update_time: i64 },
}

impl MirrorEvent {
    pub fn key(&self) -> &[u8] {
        match self {
            MirrorEvent::Write { key, .. } => key,
            MirrorEvent::Prolong { key, .. } => key,
            MirrorEvent::Update { key, .. } => key,
        }
    }
}

/// Not part of the wire event itself, but carried alongside it so the
/// dispatcher can route a `Write` to the small or big queue without a
/// storage round-trip at enqueue time.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlobSizeHint(pub u64);

struct PeerQueues {
    small: (mpsc::Sender<MirrorEvent>, Arc<parking_lot::Mutex<mpsc::Receiver<MirrorEvent>>>),
    big: (mpsc::Sender<MirrorEvent>, Arc<parking_lot::Mutex<mpsc::Receiver<MirrorEvent>>>),
    rejected: AtomicU64,
}

impl PeerQueues {
    fn new(capacity: usize) -> Self {
        let (small_tx, small_rx) = mpsc::channel(capacity);
        let (big_tx, big_rx) = mpsc::channel(capacity);
        PeerQueues {
            small: (small_tx, Arc::new(parking_lot::Mutex::new(small_rx))),
            big: (big_tx, Arc::new(parking_lot::Mutex::new(big_rx))),
            rejected: AtomicU64::new(0),
        }
    }
}

pub struct MirrorDispatcher {
    small_blob_boundary: u64,
    queue_capacity: usize,
    peers: RwLock<HashMap<PeerId, Arc<PeerQueues>>>,
}

impl MirrorDispatcher {
    pub fn new(small_blob_boundary: u64, queue_capacity: usize) -> Self {
        MirrorDispatcher {
            small_blob_boundary,
            queue_capacity,
            peers: RwLock::new(HashMap::new()),
        }
    }

    fn peer_queues(&self, peer: &PeerId) -> Arc<PeerQueues> {
        if let Some(existing) = self.peers.read().get(peer) {
            return existing.clone();
        }
        let mut peers = self.peers.write();
        peers
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(PeerQueues::new(self.queue_capacity)))
            .clone()
    }

    /// Enqueue `event` for `peer`, routing by `size_hint` to the small- or
    /// big-blob queue. Returns `false` (never an error) when the target
    /// queue is full; the local write itself must already have succeeded.
    pub fn enqueue(&self, peer: &PeerId, event: MirrorEvent, size_hint: BlobSizeHint) -> bool {
        let queues = self.peer_queues(peer);
        let (tx, _) = if size_hint.0 <= self.small_blob_boundary {
            &queues.small
        } else {
            &queues.big
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(_) => {
                queues.rejected.fetch_add(1, Ordering::Relaxed);
                log::warn!("mirror queue for peer {peer} full, dropping event (will be repaired by sync)");
                false
            }
        }
    }

    pub fn copy_reqs_rejected(&self, peer: &PeerId) -> u64 {
        self.peer_queues(peer).rejected.load(Ordering::Relaxed)
    }

    /// Pop the next event for `peer`, preferring the small-blob queue (§4.6:
    /// "separation prevents a single large blob from starving small ones").
    /// Returns `None` when both queues are currently empty.
    pub async fn try_dequeue(&self, peer: &PeerId) -> Option<MirrorEvent> {
        let queues = self.peer_queues(peer);
        {
            let mut small = queues.small.1.lock();
            if let Ok(event) = small.try_recv() {
                return Some(event);
            }
        }
        let mut big = queues.big.1.lock();
        big.try_recv().ok()
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.peers.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_event(n: u64) -> MirrorEvent {
        MirrorEvent::Write {
            slot: 1,
            key: format!("k{n}").into_bytes(),
            orig_rec_no: n,
        }
    }

    #[test]
    fn small_blob_routes_to_small_queue_and_is_preferred() {
        let dispatcher = MirrorDispatcher::new(1000, 4);
        let peer = PeerId::from("p1");
        assert!(dispatcher.enqueue(&peer, write_event(1), BlobSizeHint(10)));
        assert!(dispatcher.enqueue(
            &peer,
            MirrorEvent::Update { slot: 1, key: b"big".to_vec(), update_time: 0 },
            BlobSizeHint(5000)
        ));

        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let first = rt.block_on(dispatcher.try_dequeue(&peer)).unwrap();
        match first {
            MirrorEvent::Write { orig_rec_no, .. } => assert_eq!(orig_rec_no, 1),
            _ => panic!("expected the small-queue write to come first"),
        }
    }

    #[test]
    fn full_queue_is_rejected_without_erroring() {
        let dispatcher = MirrorDispatcher::new(1000, 1);
        let peer = PeerId::from("p1");
        assert!(dispatcher.enqueue(&peer, write_event(1), BlobSizeHint(1)));
        assert!(!dispatcher.enqueue(&peer, write_event(2), BlobSizeHint(1)));
        assert_eq!(dispatcher.copy_reqs_rejected(&peer), 1);
    }
}
