//! In-memory primary index (§4.2): one ordered map per slot from raw key
//! bytes to [`CacheData`], plus the expiry multiset that drives GC (§4.9)
//! and the fair suspension queue the Blob Accessor uses to serialise writers
//! per key.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::coordinate::Coordinate;
use nc_api_types::{LwwStamp, SlotId};

/// Enforces "at-most-one-writer-per-key": `Create`/`CopyCreate`/`GCDelete`
/// accessors acquire this exclusively and in FIFO order; `Read` accessors
/// never take it (they read the published snapshot directly, §4.3).
pub struct VersionManager {
    inner: Mutex<VmState>,
    cond: Condvar,
}

struct VmState {
    writer_active: bool,
    next_ticket: u64,
    serving_ticket: u64,
}

impl VersionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(VersionManager {
            inner: Mutex::new(VmState {
                writer_active: false,
                next_ticket: 0,
                serving_ticket: 0,
            }),
            cond: Condvar::new(),
        })
    }

    /// Block until this caller is the sole writer for the key this manager
    /// belongs to. Tickets are served strictly in arrival order.
    pub fn acquire_writer(self: &Arc<Self>) -> VersionManagerGuard {
        let mut state = self.inner.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        while state.writer_active || state.serving_ticket != ticket {
            self.cond.wait(&mut state);
        }
        state.writer_active = true;
        VersionManagerGuard { vm: self.clone() }
    }
}

pub struct VersionManagerGuard {
    vm: Arc<VersionManager>,
}

impl Drop for VersionManagerGuard {
    fn drop(&mut self) {
        let mut state = self.vm.inner.lock();
        state.writer_active = false;
        state.serving_ticket += 1;
        self.vm.cond.notify_all();
    }
}

/// Fields that change together under `UpdateCoord` (§4.2). The LWW stamp
/// lives here too, not as a fixed-at-creation field: every overwrite
/// publishes a new version with its own `{create-time, create-server,
/// create-id}`, and the Key Index entry must track the *latest* one so
/// cross-node LWW comparisons (§8 invariant 3) see the current stamp rather
/// than the key's original creation stamp.
#[derive(Clone, Copy, Debug)]
struct Mutable {
    coord: Coordinate,
    size: u64,
    create_time: i64,
    create_server: u32,
    create_id: u64,
    dead_time: i64,
    expire: u32,
    ver_expire: u32,
}

/// One entry of the Key Index: everything a reader needs without touching
/// the record heap, plus the version-manager backpointer the Blob Accessor
/// suspends on.
pub struct CacheData {
    pub key: Vec<u8>,
    pub slot: SlotId,
    mutable: RwLock<Mutable>,
    key_deleted: AtomicBool,
    key_del_time: AtomicI64,
    pub version_manager: Arc<VersionManager>,
}

impl CacheData {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        key: Vec<u8>,
        slot: SlotId,
        coord: Coordinate,
        size: u64,
        create_time: i64,
        create_server: u32,
        create_id: u64,
        dead_time: i64,
        expire: u32,
        ver_expire: u32,
    ) -> Arc<Self> {
        Arc::new(CacheData {
            key,
            slot,
            mutable: RwLock::new(Mutable {
                coord,
                size,
                create_time,
                create_server,
                create_id,
                dead_time,
                expire,
                ver_expire,
            }),
            key_deleted: AtomicBool::new(false),
            key_del_time: AtomicI64::new(0),
            version_manager: VersionManager::new(),
        })
    }

    pub fn coord(&self) -> Coordinate {
        self.mutable.read().coord
    }

    pub fn size(&self) -> u64 {
        self.mutable.read().size
    }

    pub fn create_time(&self) -> i64 {
        self.mutable.read().create_time
    }

    pub fn create_server(&self) -> u32 {
        self.mutable.read().create_server
    }

    pub fn create_id(&self) -> u64 {
        self.mutable.read().create_id
    }

    pub fn dead_time(&self) -> i64 {
        self.mutable.read().dead_time
    }

    pub fn lww_stamp(&self) -> LwwStamp {
        let m = self.mutable.read();
        LwwStamp::new(m.create_time, m.create_server, m.create_id)
    }

    pub fn is_key_deleted(&self) -> bool {
        self.key_deleted.load(Ordering::Acquire)
    }

    fn set_coord(&self, coord: Coordinate, size: u64, dead_time: i64, stamp: LwwStamp) {
        let mut m = self.mutable.write();
        m.coord = coord;
        m.size = size;
        m.dead_time = dead_time;
        m.create_time = stamp.create_time;
        m.create_server = stamp.create_server;
        m.create_id = stamp.create_id;
    }
}

struct SlotIndex {
    map: RwLock<BTreeMap<Vec<u8>, Arc<CacheData>>>,
    /// Ordered by `dead_time`; entries are `(dead_time, key)` so GC can walk
    /// strictly in expiry order even with duplicate dead-times.
    expiry: Mutex<BTreeSet<(i64, Vec<u8>)>>,
    /// FIFO of tombstoned keys awaiting physical removal once their grace
    /// period elapses.
    deleter: Mutex<VecDeque<(i64, Vec<u8>)>>,
}

impl SlotIndex {
    fn new() -> Self {
        SlotIndex {
            map: RwLock::new(BTreeMap::new()),
            expiry: Mutex::new(BTreeSet::new()),
            deleter: Mutex::new(VecDeque::new()),
        }
    }
}

/// The grace period a tombstoned key waits in the deleter queue before
/// physical removal (§4.2: "a grace period (>= 2 s)").
pub const KEY_DELETE_GRACE_SECS: i64 = 2;

pub struct KeyIndex {
    slots: RwLock<HashMap<SlotId, Arc<SlotIndex>>>,
    next_create_id: AtomicU64,
}

impl Default for KeyIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyIndex {
    pub fn new() -> Self {
        KeyIndex {
            slots: RwLock::new(HashMap::new()),
            next_create_id: AtomicU64::new(1),
        }
    }

    /// Process-unique `create-id` for the LWW triple (§3); distinct from the
    /// record heap's `rec-num` counter.
    pub fn next_create_id(&self) -> u64 {
        self.next_create_id.fetch_add(1, Ordering::SeqCst)
    }

    fn slot_index(&self, slot: SlotId) -> Arc<SlotIndex> {
        if let Some(existing) = self.slots.read().get(&slot) {
            return existing.clone();
        }
        let mut slots = self.slots.write();
        slots
            .entry(slot)
            .or_insert_with(|| Arc::new(SlotIndex::new()))
            .clone()
    }

    pub fn lookup(&self, slot: SlotId, key: &[u8]) -> Option<Arc<CacheData>> {
        self.slot_index(slot).map.read().get(key).cloned()
    }

    /// `LookupOrCreate(slot, key, create)`: returns the existing entry
    /// (clearing any tombstone) or builds a fresh one via `build`.
    pub fn lookup_or_create(
        &self,
        slot: SlotId,
        key: &[u8],
        build: impl FnOnce() -> Arc<CacheData>,
    ) -> Arc<CacheData> {
        let slot_index = self.slot_index(slot);
        let mut map = slot_index.map.write();
        if let Some(existing) = map.get(key) {
            existing.key_deleted.store(false, Ordering::Release);
            return existing.clone();
        }
        let data = build();
        slot_index.expiry.lock().insert((data.dead_time(), key.to_vec()));
        map.insert(key.to_vec(), data.clone());
        data
    }

    /// `MarkKeyDeleted(slot, key)`: flags the entry for physical removal iff
    /// its coord has already been unpublished.
    pub fn mark_key_deleted(&self, slot: SlotId, key: &[u8], now: i64) -> bool {
        let slot_index = self.slot_index(slot);
        let data = match slot_index.map.read().get(key).cloned() {
            Some(d) => d,
            None => return false,
        };
        if !data.coord().is_absent() {
            return false;
        }
        if data.key_deleted.swap(true, Ordering::AcqRel) {
            return false;
        }
        data.key_del_time.store(now, Ordering::Release);
        slot_index.deleter.lock().push_back((now, key.to_vec()));
        true
    }

    /// `UpdateCoord(data, new-coord, new-dead-time)`: re-homes the entry in
    /// the expiry multiset under the slot's time-table lock, and publishes
    /// the new version's LWW stamp alongside its coordinate so the Key
    /// Index always reflects the latest write, not the key's first one.
    pub fn update_coord(
        &self,
        data: &CacheData,
        new_coord: Coordinate,
        new_size: u64,
        new_dead_time: i64,
        new_stamp: LwwStamp,
    ) {
        let slot_index = self.slot_index(data.slot);
        let mut expiry = slot_index.expiry.lock();
        let old_dead_time = data.dead_time();
        expiry.remove(&(old_dead_time, data.key.clone()));
        data.set_coord(new_coord, new_size, new_dead_time, new_stamp);
        expiry.insert((new_dead_time, data.key.clone()));
    }

    /// Pull up to `limit` entries whose `dead_time <= now`, in expiry order,
    /// for the GC walker (§4.9). Does not remove them; the caller re-checks
    /// liveness via `DeleteBlob` before acting.
    pub fn expired_batch(&self, slot: SlotId, now: i64, limit: usize) -> Vec<Arc<CacheData>> {
        let slot_index = self.slot_index(slot);
        let expiry = slot_index.expiry.lock();
        let map = slot_index.map.read();
        expiry
            .iter()
            .take_while(|(dead_time, _)| *dead_time <= now)
            .take(limit)
            .filter_map(|(_, key)| map.get(key).cloned())
            .collect()
    }

    /// Physically remove every tombstoned key whose grace period has
    /// elapsed; called by the GC loop alongside expiry sweeps.
    pub fn sweep_deleted(&self, slot: SlotId, now: i64, grace_period_secs: i64) -> usize {
        let slot_index = self.slot_index(slot);
        let mut removed = 0usize;
        let mut deleter = slot_index.deleter.lock();
        while let Some((del_time, key)) = deleter.front().cloned() {
            if now - del_time < grace_period_secs {
                break;
            }
            deleter.pop_front();
            let mut map = slot_index.map.write();
            if let Some(data) = map.get(&key) {
                if data.is_key_deleted() && data.coord().is_absent() {
                    map.remove(&key);
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn slot_len(&self, slot: SlotId) -> usize {
        self.slot_index(slot).map.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(key: &str, slot: SlotId, dead_time: i64) -> Arc<CacheData> {
        CacheData::new(
            key.as_bytes().to_vec(),
            slot,
            Coordinate::new(1, 8),
            10,
            1,
            1,
            1,
            dead_time,
            0,
            0,
        )
    }

    #[test]
    fn lookup_or_create_clears_tombstone() {
        let index = KeyIndex::new();
        let data = index.lookup_or_create(1, b"k", || make("k", 1, 100));
        index.mark_key_deleted(1, b"k", 50); // coord not absent -> ignored
        assert!(!data.is_key_deleted());

        index.update_coord(&data, Coordinate::ABSENT, 0, 100, data.lww_stamp());
        assert!(index.mark_key_deleted(1, b"k", 51));
        assert!(data.is_key_deleted());

        // A fresh create clears the tombstone again.
        let again = index.lookup_or_create(1, b"k", || make("k", 1, 200));
        assert!(!again.is_key_deleted());
    }

    #[test]
    fn expired_batch_respects_order_and_limit() {
        let index = KeyIndex::new();
        index.lookup_or_create(1, b"a", || make("a", 1, 10));
        index.lookup_or_create(1, b"b", || make("b", 1, 5));
        index.lookup_or_create(1, b"c", || make("c", 1, 20));

        let batch = index.expired_batch(1, 15, 10);
        let keys: Vec<_> = batch.iter().map(|d| d.key.clone()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn sweep_removes_only_after_grace_period() {
        let index = KeyIndex::new();
        let data = index.lookup_or_create(1, b"k", || make("k", 1, 0));
        index.update_coord(&data, Coordinate::ABSENT, 0, 0, data.lww_stamp());
        index.mark_key_deleted(1, b"k", 100);

        assert_eq!(index.sweep_deleted(1, 101, KEY_DELETE_GRACE_SECS), 0);
        assert_eq!(index.sweep_deleted(1, 103, KEY_DELETE_GRACE_SECS), 1);
        assert!(index.lookup(1, b"k").is_none());
    }

    #[test]
    fn version_manager_serves_writers_in_fifo_order() {
        use std::sync::Mutex as StdMutex;
        use std::thread;

        let vm = VersionManager::new();
        let order = Arc::new(StdMutex::new(Vec::new()));
        let first = vm.acquire_writer();

        let vm2 = vm.clone();
        let order2 = order.clone();
        let handle = thread::spawn(move || {
            let _guard = vm2.acquire_writer();
            order2.lock().unwrap().push(2);
        });

        // Give the second thread a chance to enqueue behind the held guard.
        thread::sleep(std::time::Duration::from_millis(20));
        order.lock().unwrap().push(1);
        drop(first);
        handle.join().unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
