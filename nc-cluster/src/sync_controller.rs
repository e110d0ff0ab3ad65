//! Per-(peer, slot) reconciliation (§4.8).
//!
//! Two modes: event sync (cheap, consumes the peer's sync-log tail) and
//! blob-list sync (expensive fallback, full key enumeration). Concurrency is
//! capped globally and per peer by semaphores; a failed sync is retried
//! after a fixed delay. The wire protocol itself is out of scope and is
//! represented here as an injected [`SyncTransport`] collaborator, the same
//! way `server::pull` takes an `HttpClient`/`BackupReader` rather than
//! hand-rolling the remote side inline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use nc_api_types::{AccessMode, LwwStamp, PeerId, SlotId, SyncOp};
use nc_storage::context::StorageContext;
use nc_storage::record::PasswordPolicy;
use nc_storage::sync_log::{NeedsFullResync, SyncEvent};
use nc_storage::Coordinate;

use crate::distribution_map::DistributionMap;
use crate::peer_pool::PeerConnectionPool;

const FAILED_SYNC_RETRY_DELAY: Duration = Duration::from_secs(1);

/// One key's summary in a blob-list sync exchange (§4.8): enough to decide
/// whether to fetch it without reading its content.
#[derive(Clone, Debug)]
pub struct BlobSummary {
    pub key: Vec<u8>,
    pub stamp: LwwStamp,
    pub dead_time: i64,
    pub deleted: bool,
}

/// The remote content needed to apply a `Write` locally, fetched via `COPY`.
pub struct FetchedBlob {
    pub stamp: LwwStamp,
    pub dead_time: i64,
    pub ttl: u32,
    pub password_hash: Option<[u8; 16]>,
    pub chunks: Vec<Vec<u8>>,
}

/// Abstracts the out-of-scope wire protocol so the reconciliation logic
/// below is independently testable against a fake peer.
pub trait SyncTransport: Send + Sync {
    /// `SYNC_START`: the peer's sync-log tail for `slot` newer than
    /// `since_rec_no`, or a full-resync signal if its tail has been trimmed
    /// past that point.
    fn fetch_events<'a>(
        &'a self,
        peer: &'a PeerId,
        slot: SlotId,
        since_rec_no: u64,
    ) -> BoxFuture<'a, Result<Result<Vec<SyncEvent>, NeedsFullResync>>>;

    /// `SYNC_BLOB_LIST`: every `{key, summary}` the peer holds for `slot`.
    fn fetch_blob_list<'a>(&'a self, peer: &'a PeerId, slot: SlotId) -> BoxFuture<'a, Result<Vec<BlobSummary>>>;

    /// `COPY`: the peer's current content and metadata for `key`.
    fn fetch_blob<'a>(&'a self, peer: &'a PeerId, slot: SlotId, key: &'a [u8]) -> BoxFuture<'a, Result<FetchedBlob>>;

    /// Tell the peer we've applied up through `rec_no`, so it can trim its
    /// own log once every peer has acked (§4.4).
    fn ack<'a>(&'a self, peer: &'a PeerId, slot: SlotId, rec_no: u64) -> BoxFuture<'a, Result<()>>;
}

/// What a single (peer, slot) reconciliation accomplished, returned mainly
/// for logging and for the startup "initially synced" bookkeeping.
#[derive(Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    EventSync { applied: usize, last_rec_no: u64 },
    BlobListSync { applied: usize },
    PeerUnreachable,
}

struct PeerLimiter {
    permits: Arc<Semaphore>,
}

/// Drives reconciliation for every self-served slot against every peer
/// serving it (§4.8).
pub struct SyncController {
    ctx: Arc<StorageContext>,
    dist: Arc<DistributionMap>,
    pool: Arc<PeerConnectionPool>,
    transport: Arc<dyn SyncTransport>,
    active: Arc<Semaphore>,
    per_peer: Mutex<HashMap<PeerId, Arc<PeerLimiter>>>,
    /// Wall-clock time (real, not the logical `now` callers pass in) of the
    /// first failure against a peer since this controller was built; the
    /// baseline for the `NetworkErrorTimeout` fail-open clock.
    first_failure_at: Mutex<HashMap<PeerId, i64>>,
    max_syncs_one_server: usize,
    network_error_timeout_secs: i64,
    ttl_default: u32,
}

impl SyncController {
    pub fn new(
        ctx: Arc<StorageContext>,
        dist: Arc<DistributionMap>,
        pool: Arc<PeerConnectionPool>,
        transport: Arc<dyn SyncTransport>,
    ) -> Self {
        let max_active = ctx.config.mirror.max_active_syncs;
        let max_syncs_one_server = ctx.config.mirror.max_syncs_one_server;
        let network_error_timeout_secs = ctx.config.mirror.network_error_timeout.as_secs() as i64;
        SyncController {
            ctx,
            dist,
            pool,
            transport,
            active: Arc::new(Semaphore::new(max_active)),
            per_peer: Mutex::new(HashMap::new()),
            first_failure_at: Mutex::new(HashMap::new()),
            max_syncs_one_server,
            network_error_timeout_secs,
            ttl_default: 0,
        }
    }

    fn peer_limiter(&self, peer: &PeerId) -> Arc<PeerLimiter> {
        let mut map = self.per_peer.lock();
        map.entry(peer.clone())
            .or_insert_with(|| Arc::new(PeerLimiter { permits: Arc::new(Semaphore::new(self.max_syncs_one_server)) }))
            .clone()
    }

    /// Reconcile one (peer, slot) pairing once, retrying on failure after
    /// [`FAILED_SYNC_RETRY_DELAY`]. Returns once a sync attempt succeeds or
    /// the peer is judged unreachable (§4.7 fail-open). `now` is the logical
    /// timestamp used for any blob stamps this sync ends up writing; the
    /// fail-open clock itself runs on real wall-clock time, independent of
    /// it.
    pub async fn sync_once(&self, peer: &PeerId, slot: SlotId, now: i64) -> SyncOutcome {
        let limiter = self.peer_limiter(peer);
        let _peer_permit = limiter.permits.clone().acquire_owned().await.expect("peer semaphore never closes");
        let _global_permit = self.active.clone().acquire_owned().await.expect("global semaphore never closes");

        loop {
            match self.try_reconcile(peer, slot, now).await {
                Ok(outcome) => {
                    self.pool.record_success(peer);
                    self.first_failure_at.lock().remove(peer);
                    return outcome;
                }
                Err(err) => {
                    self.pool.record_failure(peer);
                    log::warn!("sync of slot {slot} against peer {peer} failed: {err}, retrying");
                    if self.peer_is_unreachable(peer) {
                        return SyncOutcome::PeerUnreachable;
                    }
                    tokio::time::sleep(FAILED_SYNC_RETRY_DELAY).await;
                }
            }
        }
    }

    /// `age >= NetworkErrorTimeout`, either since the peer's last successful
    /// exchange (if it ever had one) or since we first started failing
    /// against it this session.
    fn peer_is_unreachable(&self, peer: &PeerId) -> bool {
        let wall_now = nc_tools::time::now_secs();
        let age = match self.pool.seconds_since_success(peer, wall_now) {
            Some(age) => age,
            None => {
                let mut baselines = self.first_failure_at.lock();
                let baseline = *baselines.entry(peer.clone()).or_insert(wall_now);
                wall_now - baseline
            }
        };
        if age >= self.network_error_timeout_secs {
            log::warn!("peer {peer} unreachable for {age}s, declaring its outstanding sync requirements fail-open");
            true
        } else {
            false
        }
    }

    async fn try_reconcile(&self, peer: &PeerId, slot: SlotId, now: i64) -> Result<SyncOutcome> {
        let last_rec_no = self.ctx.sync_log.persisted_max_rec_no();
        match self.transport.fetch_events(peer, slot, last_rec_no).await? {
            Ok(events) => {
                let mut applied = 0;
                let mut max_rec_no = last_rec_no;
                for event in &events {
                    if self.apply_event(peer, slot, event, now).await? {
                        applied += 1;
                    }
                    max_rec_no = max_rec_no.max(event.rec_no);
                }
                self.transport.ack(peer, slot, max_rec_no).await.ok();
                Ok(SyncOutcome::EventSync { applied, last_rec_no: max_rec_no })
            }
            Err(NeedsFullResync) => {
                let applied = self.blob_list_sync(peer, slot, now).await?;
                Ok(SyncOutcome::BlobListSync { applied })
            }
        }
    }

    /// Apply one remote event idempotently (§8 invariant 6): `Write` and
    /// `Prolong` fetch the peer's current summary/content and only act if it
    /// is strictly newer by LWW than what we already hold; `Remove` only
    /// acts if the local entry isn't already a tombstone at least as new.
    async fn apply_event(&self, peer: &PeerId, slot: SlotId, event: &SyncEvent, now: i64) -> Result<bool> {
        match event.op {
            SyncOp::Write => {
                let remote = self.transport.fetch_blob(peer, slot, &event.key).await?;
                self.apply_write(slot, event.key.clone(), remote, Some(event.orig_rec_no), now)
            }
            SyncOp::Prolong => {
                let list = self.transport.fetch_blob_list(peer, slot).await?;
                let Some(summary) = list.into_iter().find(|s| s.key == event.key) else {
                    return Ok(false);
                };
                self.apply_prolong(slot, event.key.clone(), summary, Some(event.orig_rec_no), now)
            }
            SyncOp::Remove => {
                let list = self.transport.fetch_blob_list(peer, slot).await?;
                let remote_stamp = list
                    .into_iter()
                    .find(|s| s.key == event.key)
                    .map(|s| s.stamp)
                    .unwrap_or_else(|| LwwStamp::new(event.orig_time, 0, 0));
                self.apply_remove(slot, event.key.clone(), remote_stamp, Some(event.orig_rec_no), now)
            }
        }
    }

    /// Record a just-applied remote mutation into our own sync log,
    /// preserving `orig_rec_no` when it came from an event-sync pairing so
    /// a later peer learns about it exactly once (§4.4, §4.8). `coord`, if
    /// given, is read back to learn the rec-no the heap actually assigned
    /// this write; `None` (a `Remove`, whose tombstone coord isn't returned
    /// by `delete_blob`) falls back to the sync log's own next rec-no.
    fn record_applied(
        &self,
        slot: SlotId,
        op: SyncOp,
        key: Vec<u8>,
        orig_time: i64,
        orig_rec_no: Option<u64>,
        coord: Option<Coordinate>,
        now: i64,
    ) {
        let rec_no = coord
            .and_then(|c| self.ctx.heap.read_meta(c).ok())
            .map(|m| m.rec_num)
            .unwrap_or_else(|| self.ctx.sync_log.persisted_max_rec_no() + 1);
        let event = SyncEvent { rec_no, op, key, orig_time, orig_rec_no: orig_rec_no.unwrap_or(rec_no) };
        self.ctx.sync_log.append(slot, event, now);
    }

    fn apply_write(
        &self,
        slot: SlotId,
        key: Vec<u8>,
        remote: FetchedBlob,
        orig_rec_no: Option<u64>,
        now: i64,
    ) -> Result<bool> {
        if let Some(local) = self.ctx.index.lookup(slot, &key) {
            if !local.is_key_deleted() && local.lww_stamp() >= remote.stamp {
                return Ok(false);
            }
        }
        let mut accessor = self.ctx.open_accessor_with_origin(
            slot,
            key.clone(),
            AccessMode::CopyCreate,
            now,
            remote.ttl,
            remote.stamp,
        )?;
        accessor.set_password_hash(remote.password_hash);
        for (i, chunk) in remote.chunks.iter().enumerate() {
            accessor.write_chunk(i as u64, chunk)?;
        }
        let coord = accessor.finalize()?;
        self.record_applied(slot, SyncOp::Write, key, remote.stamp.create_time, orig_rec_no, Some(coord), now);
        Ok(true)
    }

    fn apply_prolong(
        &self,
        slot: SlotId,
        key: Vec<u8>,
        summary: BlobSummary,
        orig_rec_no: Option<u64>,
        now: i64,
    ) -> Result<bool> {
        let Some(local) = self.ctx.index.lookup(slot, &key) else {
            return Ok(false);
        };
        if local.is_key_deleted() || local.lww_stamp() != summary.stamp || local.dead_time() >= summary.dead_time {
            return Ok(false);
        }
        let new_ttl = (summary.dead_time - now).max(0) as u32;
        let coord = self.ctx.prolong_accessor(slot, key.clone(), summary.dead_time, new_ttl, Some(summary.stamp))?;
        self.record_applied(slot, SyncOp::Prolong, key, summary.stamp.create_time, orig_rec_no, Some(coord), now);
        Ok(true)
    }

    fn apply_remove(
        &self,
        slot: SlotId,
        key: Vec<u8>,
        remote_stamp: LwwStamp,
        orig_rec_no: Option<u64>,
        now: i64,
    ) -> Result<bool> {
        let Some(local) = self.ctx.index.lookup(slot, &key) else {
            return Ok(false);
        };
        if local.is_key_deleted() || local.coord().is_absent() {
            return Ok(false);
        }
        if local.lww_stamp() > remote_stamp {
            return Ok(false);
        }
        // `GcDelete` (not `CopyCreate`): it reads the existing on-disk meta
        // rather than minting a blank one, so the real chunk tree still gets
        // garbage-collected instead of being silently orphaned.
        let mut accessor = self.ctx.open_accessor(
            slot,
            key.clone(),
            None,
            AccessMode::GcDelete,
            PasswordPolicy::Any,
            now,
            self.ttl_default,
        )?;
        accessor.delete_blob(i64::MAX, now)?;
        self.record_applied(slot, SyncOp::Remove, key, remote_stamp.create_time, orig_rec_no, None, now);
        Ok(true)
    }

    /// Blob-list sync (§4.8 fallback): fetch the peer's full key listing for
    /// `slot` and pull across anything strictly newer than what we hold.
    async fn blob_list_sync(&self, peer: &PeerId, slot: SlotId, now: i64) -> Result<usize> {
        let remote_list = self.transport.fetch_blob_list(peer, slot).await?;
        let mut applied = 0;
        for summary in remote_list {
            let needs_fetch = match self.ctx.index.lookup(slot, &summary.key) {
                Some(local) if !local.is_key_deleted() => local.lww_stamp() < summary.stamp,
                Some(_) => true,
                None => true,
            };
            if !needs_fetch {
                continue;
            }
            if summary.deleted {
                if self.apply_remove(slot, summary.key.clone(), summary.stamp, None, now)? {
                    applied += 1;
                }
                continue;
            }
            let remote = self.transport.fetch_blob(peer, slot, &summary.key).await?;
            if self.apply_write(slot, summary.key, remote, None, now)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Schedule one startup sync per (peer, slot) for every slot self
    /// serves, declaring the node "initially synced" once each slot has
    /// reconciled with at least one peer or every peer serving it has timed
    /// out (§4.8 startup behaviour).
    pub async fn run_initial_sync(&self, now: i64) {
        for slot in self.dist.self_slots() {
            let peers = self.dist.get_servers_for_slot(slot);
            if peers.is_empty() {
                continue;
            }
            let mut slot_synced = false;
            for peer in &peers {
                match self.sync_once(peer, slot, now).await {
                    SyncOutcome::PeerUnreachable => continue,
                    _ => {
                        slot_synced = true;
                        break;
                    }
                }
            }
            if !slot_synced {
                log::warn!("slot {slot} could not reach any peer during initial sync, proceeding fail-open");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nc_api_types::PeerId;
    use nc_config::Config;
    use parking_lot::Mutex as PMutex;
    use std::collections::HashMap as StdMap;

    /// An in-memory stand-in for the wire protocol: holds a second node's
    /// state directly so tests can drive both sides without sockets.
    struct FakeTransport {
        events: PMutex<StdMap<(PeerId, SlotId), Vec<SyncEvent>>>,
        blobs: PMutex<StdMap<(PeerId, SlotId, Vec<u8>), FetchedBlobClone>>,
        down: PMutex<std::collections::HashSet<PeerId>>,
    }

    #[derive(Clone)]
    struct FetchedBlobClone {
        stamp: LwwStamp,
        dead_time: i64,
        ttl: u32,
        chunks: Vec<Vec<u8>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            FakeTransport {
                events: PMutex::new(StdMap::new()),
                blobs: PMutex::new(StdMap::new()),
                down: PMutex::new(std::collections::HashSet::new()),
            }
        }

        fn mark_down(&self, peer: &PeerId) {
            self.down.lock().insert(peer.clone());
        }

        fn seed_write(&self, peer: &PeerId, slot: SlotId, key: &[u8], stamp: LwwStamp, dead_time: i64, ttl: u32, data: &[u8]) {
            self.events.lock().entry((peer.clone(), slot)).or_default().push(SyncEvent {
                rec_no: 1,
                op: SyncOp::Write,
                key: key.to_vec(),
                orig_time: stamp.create_time,
                orig_rec_no: 1,
            });
            self.blobs.lock().insert(
                (peer.clone(), slot, key.to_vec()),
                FetchedBlobClone { stamp, dead_time, ttl, chunks: vec![data.to_vec()] },
            );
        }
    }

    impl SyncTransport for FakeTransport {
        fn fetch_events<'a>(
            &'a self,
            peer: &'a PeerId,
            slot: SlotId,
            _since_rec_no: u64,
        ) -> BoxFuture<'a, Result<Result<Vec<SyncEvent>, NeedsFullResync>>> {
            if self.down.lock().contains(peer) {
                return Box::pin(async move { Err(anyhow::anyhow!("connection refused")) });
            }
            let events = self.events.lock().get(&(peer.clone(), slot)).cloned().unwrap_or_default();
            Box::pin(async move { Ok(Ok(events)) })
        }

        fn fetch_blob_list<'a>(&'a self, _peer: &'a PeerId, _slot: SlotId) -> BoxFuture<'a, Result<Vec<BlobSummary>>> {
            Box::pin(async move { Ok(Vec::new()) })
        }

        fn fetch_blob<'a>(&'a self, peer: &'a PeerId, slot: SlotId, key: &'a [u8]) -> BoxFuture<'a, Result<FetchedBlob>> {
            let found = self.blobs.lock().get(&(peer.clone(), slot, key.to_vec())).cloned();
            Box::pin(async move {
                let b = found.ok_or_else(|| anyhow::anyhow!("no such blob"))?;
                Ok(FetchedBlob { stamp: b.stamp, dead_time: b.dead_time, ttl: b.ttl, password_hash: None, chunks: b.chunks })
            })
        }

        fn ack<'a>(&'a self, _peer: &'a PeerId, _slot: SlotId, _rec_no: u64) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move { Ok(()) })
        }
    }

    fn test_ctx(dir: &std::path::Path, self_slots: Vec<SlotId>) -> Arc<StorageContext> {
        let mut config = Config::default();
        config.storage.path = dir.to_path_buf();
        config.storage.each_file_size = 1 << 20;
        config.self_slots = self_slots;
        config.self_peer = Some(PeerId::from("self"));
        Arc::new(StorageContext::open(config).unwrap())
    }

    #[tokio::test]
    async fn event_sync_applies_a_remote_write() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), vec![1]);
        let mut cfg = Config::default();
        cfg.self_slots = vec![1];
        cfg.self_peer = Some(PeerId::from("self"));
        cfg.mirror.peers = vec![(PeerId::from("peer-a"), vec![1])];
        let dist = Arc::new(DistributionMap::from_config(&cfg));
        let pool = Arc::new(PeerConnectionPool::new(10, 5, 10, Duration::from_secs(10)));
        let transport = Arc::new(FakeTransport::new());
        let peer = PeerId::from("peer-a");
        transport.seed_write(&peer, 1, b"k1", LwwStamp::new(1000, 99, 1), 2000, 60, b"remote payload");

        let controller = SyncController::new(ctx.clone(), dist, pool, transport.clone());
        let outcome = controller.sync_once(&peer, 1, 1500).await;
        match outcome {
            SyncOutcome::EventSync { applied, .. } => assert_eq!(applied, 1),
            other => panic!("expected event sync, got {other:?}"),
        }
        let data = ctx.index.lookup(1, b"k1").unwrap();
        assert!(!data.coord().is_absent());
        assert_eq!(data.lww_stamp(), LwwStamp::new(1000, 99, 1));
    }

    #[tokio::test]
    async fn reapplying_the_same_write_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), vec![1]);
        let mut cfg = Config::default();
        cfg.self_slots = vec![1];
        cfg.mirror.peers = vec![(PeerId::from("peer-a"), vec![1])];
        let dist = Arc::new(DistributionMap::from_config(&cfg));
        let pool = Arc::new(PeerConnectionPool::new(10, 5, 10, Duration::from_secs(10)));
        let transport = Arc::new(FakeTransport::new());
        let peer = PeerId::from("peer-a");
        transport.seed_write(&peer, 1, b"k1", LwwStamp::new(1000, 99, 1), 2000, 60, b"payload");

        let controller = SyncController::new(ctx.clone(), dist, pool, transport);
        let first = controller.sync_once(&peer, 1, 1500).await;
        assert_eq!(first, SyncOutcome::EventSync { applied: 1, last_rec_no: 1 });
        let second = controller.sync_once(&peer, 1, 1500).await;
        assert_eq!(second, SyncOutcome::EventSync { applied: 0, last_rec_no: 1 });
    }

    #[tokio::test]
    async fn unreachable_peer_is_declared_fail_open() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_ctx(dir.path(), vec![1]);
        let mut cfg = Config::default();
        cfg.self_slots = vec![1];
        cfg.mirror.peers = vec![(PeerId::from("gone"), vec![1])];
        cfg.mirror.network_error_timeout = Duration::from_millis(50);
        let dist = Arc::new(DistributionMap::from_config(&cfg));
        let pool = Arc::new(PeerConnectionPool::new(10, 5, 100, Duration::from_secs(0)));
        let transport = Arc::new(FakeTransport::new());
        let peer = PeerId::from("gone");
        transport.mark_down(&peer);

        let controller = SyncController::new(ctx, dist, pool, transport);
        let outcome = controller.sync_once(&peer, 1, 10_000).await;
        assert_eq!(outcome, SyncOutcome::PeerUnreachable);
    }
}
