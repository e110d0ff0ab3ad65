//! The handle all blob reads and writes pass through (§4.3).
//!
//! A `BlobAccessor` is opened for one `{slot, key}` pair in one of four
//! modes. `Create`/`CopyCreate`/`GcDelete` acquire the key's version-manager
//! ticket so writers are strictly serialised; `Read` never blocks on it and
//! instead works against the currently published snapshot (copy-on-write: a
//! new `Create` publishing a fresh coord never disturbs an in-flight read of
//! the old one).

use std::sync::Arc;

use anyhow::{bail, Result};
use openssl::sha::Sha256;
use parking_lot::Mutex;

use nc_api_types::{AccessMode, LwwStamp, StorageError};

use crate::coordinate::Coordinate;
use crate::key_index::{CacheData, KeyIndex, VersionManagerGuard};
use crate::record::{ChunkDataRecord, ChunkMapRecord, MetaRecord, PasswordPolicy, PASSWORD_HASH_LEN};
use crate::record_heap::RecordHeap;
use nc_tools::lru_cache::{Cacher, LruCache};

/// Depth cap of the chunk-map tree (§4.3: "recursing up to `MaxMapDepth` (= 3)").
pub const MAX_MAP_DEPTH: u32 = 3;
/// Default fan-out of one chunk-map record, used when a blob is created.
pub const DEFAULT_MAP_SIZE: u32 = 256;
/// Default chunk size for newly created blobs.
pub const DEFAULT_CHUNK_SIZE: u32 = 65536;
const MAP_CACHE_CAPACITY: usize = MAX_MAP_DEPTH as usize + 1;

pub fn hash_password(password: &[u8]) -> [u8; PASSWORD_HASH_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(password);
    let digest = hasher.finish();
    let mut out = [0u8; PASSWORD_HASH_LEN];
    out.copy_from_slice(&digest[..PASSWORD_HASH_LEN]);
    out
}

struct MapCacher<'a> {
    heap: &'a RecordHeap,
}

impl<'a> Cacher<Coordinate, ChunkMapRecord> for MapCacher<'a> {
    fn fetch(&mut self, key: Coordinate) -> Result<Option<ChunkMapRecord>> {
        Ok(Some(self.heap.read_chunk_map(key)?))
    }
}

/// Accumulates children for one level of the chunk-map tree while a blob is
/// being written; flushed to a persisted `ChunkMapRecord` once full (or at
/// `Finalize`, however full it got).
#[derive(Default)]
struct PendingLevel {
    children: Vec<Coordinate>,
}

struct WriteState {
    levels: [PendingLevel; MAX_MAP_DEPTH as usize],
    last_flushed: Option<Coordinate>,
    next_chunk_num: u64,
    total_size: u64,
}

impl Default for WriteState {
    fn default() -> Self {
        WriteState {
            levels: Default::default(),
            last_flushed: None,
            next_chunk_num: 0,
            total_size: 0,
        }
    }
}

pub struct BlobAccessor {
    heap: Arc<RecordHeap>,
    index: Arc<KeyIndex>,
    mode: AccessMode,
    slot: u32,
    key: Vec<u8>,
    data: Arc<CacheData>,
    meta: MetaRecord,
    map_size: u32,
    chunk_size: u32,
    _writer_guard: Option<VersionManagerGuard>,
    map_cache: Mutex<LruCache<Coordinate, ChunkMapRecord>>,
    pending: Mutex<WriteState>,
}

impl BlobAccessor {
    /// Open an accessor for `key` in `mode`. `now`/`create_server`/`create_id`
    /// drive the LWW stamp on a new version; `password`/`policy` gate access
    /// per §4.3.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        heap: Arc<RecordHeap>,
        index: Arc<KeyIndex>,
        slot: u32,
        key: Vec<u8>,
        password: Option<&[u8]>,
        mode: AccessMode,
        policy: PasswordPolicy,
        now: i64,
        ttl: u32,
        create_server: u32,
    ) -> Result<Self> {
        Self::open_with_origin(heap, index, slot, key, password, mode, policy, now, ttl, create_server, None)
    }

    /// Like [`Self::open`], but for `CopyCreate` lets the caller supply the
    /// origin peer's own `{create-time, create-server, create-id}` instead
    /// of stamping a fresh one. The Sync Controller (§4.8) needs this: a
    /// mirrored write must keep the stamp it was created with elsewhere, or
    /// cross-node LWW comparisons (§8 invariant 3) would see every replica's
    /// local application time instead of the original author's.
    #[allow(clippy::too_many_arguments)]
    pub fn open_with_origin(
        heap: Arc<RecordHeap>,
        index: Arc<KeyIndex>,
        slot: u32,
        key: Vec<u8>,
        password: Option<&[u8]>,
        mode: AccessMode,
        policy: PasswordPolicy,
        now: i64,
        ttl: u32,
        create_server: u32,
        origin_stamp: Option<LwwStamp>,
    ) -> Result<Self> {
        match mode {
            AccessMode::Read => Self::open_read(heap, index, slot, key, password, policy),
            AccessMode::Create | AccessMode::CopyCreate | AccessMode::GcDelete => {
                Self::open_writer(heap, index, slot, key, mode, now, ttl, create_server, origin_stamp)
            }
        }
    }

    fn open_read(
        heap: Arc<RecordHeap>,
        index: Arc<KeyIndex>,
        slot: u32,
        key: Vec<u8>,
        password: Option<&[u8]>,
        policy: PasswordPolicy,
    ) -> Result<Self> {
        let data = index
            .lookup(slot, &key)
            .filter(|d| !d.coord().is_absent() && !d.is_key_deleted())
            .ok_or(StorageError::NotFound)?;
        let meta = heap.read_meta(data.coord())?;
        check_password(&meta, password, policy)?;
        let map_size = meta.map_size.max(1);
        let chunk_size = meta.chunk_size.max(1);
        Ok(BlobAccessor {
            heap,
            index,
            mode: AccessMode::Read,
            slot,
            key,
            data,
            meta,
            map_size,
            chunk_size,
            _writer_guard: None,
            map_cache: Mutex::new(LruCache::new(MAP_CACHE_CAPACITY)),
            pending: Mutex::new(WriteState::default()),
        })
    }

    fn open_writer(
        heap: Arc<RecordHeap>,
        index: Arc<KeyIndex>,
        slot: u32,
        key: Vec<u8>,
        mode: AccessMode,
        now: i64,
        ttl: u32,
        create_server: u32,
        origin_stamp: Option<LwwStamp>,
    ) -> Result<Self> {
        let (data, meta) = if mode == AccessMode::GcDelete {
            // GC only ever operates on an entry that already exists; it never
            // materialises a new key.
            let data = index.lookup(slot, &key).ok_or(StorageError::NotFound)?;
            let meta = heap.read_meta(data.coord())?;
            (data, meta)
        } else {
            // One stamp, shared by the fresh `CacheData` (if this key is new)
            // and the meta record about to be written, so the two can never
            // disagree on which version they represent (§8 invariant 3).
            let stamp = origin_stamp.unwrap_or_else(|| LwwStamp::new(now, create_server, index.next_create_id()));
            let data = index.lookup_or_create(slot, &key, || {
                CacheData::new(
                    key.clone(),
                    slot,
                    Coordinate::ABSENT,
                    0,
                    stamp.create_time,
                    stamp.create_server,
                    stamp.create_id,
                    now + ttl as i64,
                    0,
                    0,
                )
            });
            let meta = MetaRecord {
                rec_num: 0,
                key: key.clone(),
                slot,
                create_time: stamp.create_time,
                create_server: stamp.create_server,
                create_id: stamp.create_id,
                dead_time: now + ttl as i64,
                ttl,
                expire: 0,
                ver_ttl: 0,
                ver_expire: 0,
                size: 0,
                chunk_size: DEFAULT_CHUNK_SIZE,
                map_size: DEFAULT_MAP_SIZE,
                password_hash: None,
                data_root: Coordinate::ABSENT,
                deleted: false,
            };
            (data, meta)
        };
        let guard = data.version_manager.acquire_writer();
        let map_size = meta.map_size.max(1);
        let chunk_size = meta.chunk_size.max(1);
        Ok(BlobAccessor {
            heap,
            index,
            mode,
            slot,
            key,
            data,
            meta,
            map_size,
            chunk_size,
            _writer_guard: Some(guard),
            map_cache: Mutex::new(LruCache::new(MAP_CACHE_CAPACITY)),
            pending: Mutex::new(WriteState::default()),
        })
    }

    /// `Prolong`: republishes the existing blob under a bumped `dead-time`
    /// without touching its chunk tree (§4.3 prolong-on-read, §4.8 remote
    /// Prolong events). `origin_stamp` lets a replicated Prolong keep the
    /// stamp of the write it is extending rather than minting a new one.
    #[allow(clippy::too_many_arguments)]
    pub fn prolong(
        heap: Arc<RecordHeap>,
        index: Arc<KeyIndex>,
        slot: u32,
        key: Vec<u8>,
        new_dead_time: i64,
        new_ttl: u32,
        origin_stamp: Option<LwwStamp>,
    ) -> Result<Coordinate> {
        let data = index
            .lookup(slot, &key)
            .filter(|d| !d.coord().is_absent() && !d.is_key_deleted())
            .ok_or(StorageError::NotFound)?;
        let _guard = data.version_manager.acquire_writer();
        let mut meta = heap.read_meta(data.coord())?;
        let stamp = origin_stamp.unwrap_or_else(|| meta.lww_stamp());
        meta.rec_num = 0;
        meta.dead_time = new_dead_time;
        meta.ttl = new_ttl;
        meta.create_time = stamp.create_time;
        meta.create_server = stamp.create_server;
        meta.create_id = stamp.create_id;
        let old_coord = data.coord();
        let new_coord = heap.append_meta(&meta)?;
        let old_total = crate::record::RECORD_HEADER_SIZE as u32 + meta.encode().len() as u32;
        heap.mark_garbage(old_coord, crate::heap_file::FileKind::Meta, old_total)?;
        index.update_coord(&data, new_coord, meta.size, meta.dead_time, meta.lww_stamp());
        Ok(new_coord)
    }

    pub fn get_size(&self) -> u64 {
        self.meta.size
    }

    pub fn get_cur_blob_create_time(&self) -> i64 {
        self.meta.create_time
    }

    pub fn lww_stamp(&self) -> nc_api_types::LwwStamp {
        self.meta.lww_stamp()
    }

    pub fn dead_time(&self) -> i64 {
        self.meta.dead_time
    }

    pub fn password_hash(&self) -> Option<[u8; PASSWORD_HASH_LEN]> {
        self.meta.password_hash
    }

    pub fn set_password(&mut self, password: Option<&[u8]>) {
        self.meta.password_hash = password.map(hash_password);
    }

    /// Like [`Self::set_password`], but takes an already-hashed value
    /// directly. The Sync Controller only ever sees a peer's stored hash,
    /// never the original password, so it cannot go through
    /// [`Self::set_password`].
    pub fn set_password_hash(&mut self, hash: Option<[u8; PASSWORD_HASH_LEN]>) {
        self.meta.password_hash = hash;
    }

    /// `WriteChunk(chunk-num, data)`. Chunks must be written in order
    /// starting from 0; this mirrors the sequential append discipline the
    /// record heap itself uses.
    pub fn write_chunk(&mut self, chunk_num: u64, data: &[u8]) -> Result<()> {
        if !matches!(self.mode, AccessMode::Create | AccessMode::CopyCreate) {
            bail!("write_chunk on a non-writer accessor");
        }
        let mut pending = self.pending.lock();
        if chunk_num != pending.next_chunk_num {
            bail!("out-of-order chunk write: expected {}, got {chunk_num}", pending.next_chunk_num);
        }
        let record = ChunkDataRecord {
            rec_num: 0,
            up_coord: Coordinate::ABSENT,
            data: data.to_vec(),
        };
        let coord = self.heap.append_chunk_data(&record)?;
        pending.total_size += data.len() as u64;
        pending.next_chunk_num += 1;
        pending.levels[0].children.push(coord);
        if pending.levels[0].children.len() as u32 >= self.map_size {
            self.flush_level(&mut pending, 0)?;
        }
        Ok(())
    }

    fn flush_level(&self, pending: &mut WriteState, level: usize) -> Result<()> {
        if pending.levels[level].children.is_empty() {
            return Ok(());
        }
        let children = std::mem::take(&mut pending.levels[level].children);
        let record = ChunkMapRecord {
            rec_num: 0,
            up_coord: Coordinate::ABSENT,
            children: children.clone(),
        };
        let coord = self.heap.append_chunk_map(&record)?;
        for child in &children {
            self.heap.patch_up_coord(*child, coord)?;
        }
        pending.last_flushed = Some(coord);

        if level + 1 < MAX_MAP_DEPTH as usize {
            pending.levels[level + 1].children.push(coord);
            if pending.levels[level + 1].children.len() as u32 >= self.map_size {
                self.flush_level(pending, level + 1)?;
            }
        }
        Ok(())
    }

    /// `ReadChunk(chunk-num, buffer)`: walks the chunk-map tree, caching
    /// intermediate maps so a sequential scan visits each non-leaf exactly
    /// once.
    pub fn read_chunk(&self, chunk_num: u64) -> Result<Vec<u8>> {
        if self.meta.data_root.is_absent() {
            bail!(StorageError::NotFound);
        }
        let total_chunks = (self.meta.size + self.chunk_size as u64 - 1) / self.chunk_size.max(1) as u64;
        let total_chunks = total_chunks.max(1);
        if chunk_num >= total_chunks {
            bail!(StorageError::NotFound);
        }
        let depth = tree_depth(total_chunks, self.map_size);

        let mut coord = self.meta.data_root;
        let mut remaining = chunk_num;
        let mut cache = self.map_cache.lock();
        let mut cacher = MapCacher { heap: &self.heap };
        for level in (0..depth).rev() {
            let span = (self.map_size as u64).pow(level);
            let child_index = (remaining / span) as usize;
            remaining %= span;
            let map = cache
                .access(coord, &mut cacher)?
                .ok_or_else(|| anyhow::anyhow!(StorageError::CorruptStorage("missing chunk map".into())))?;
            coord = *map
                .children
                .get(child_index)
                .filter(|c| !c.is_absent())
                .ok_or_else(|| anyhow::anyhow!(StorageError::CorruptStorage("missing chunk child".into())))?;
        }
        let record = self.heap.read_chunk_data(coord)?;
        Ok(record.data)
    }

    /// `Finalize()`: cascades any partially-filled levels, writes the meta
    /// record and atomically publishes the new coord in the Key Index.
    pub fn finalize(&mut self) -> Result<Coordinate> {
        if !matches!(self.mode, AccessMode::Create | AccessMode::CopyCreate) {
            bail!("finalize on a non-writer accessor");
        }
        {
            let mut pending = self.pending.lock();
            // Flush exactly as many levels as the chunk count needs: rolling
            // every blob up to `MAX_MAP_DEPTH` regardless of its size would
            // wrap a single map in redundant parents, leaving `data_root`
            // deeper than `tree_depth` (and `read_chunk`) expect to descend.
            let total_chunks = pending.next_chunk_num.max(1);
            let depth = tree_depth(total_chunks, self.map_size) as usize;
            for level in 0..depth {
                self.flush_level(&mut pending, level)?;
            }
            self.meta.data_root = pending.last_flushed.unwrap_or(Coordinate::ABSENT);
            self.meta.size = pending.total_size;
        }
        let coord = self.heap.append_meta(&self.meta)?;
        self.index
            .update_coord(&self.data, coord, self.meta.size, self.meta.dead_time, self.meta.lww_stamp());
        Ok(coord)
    }

    /// `DeleteBlob(dead-before)`: tombstones the meta record and garbages
    /// every chunk-map/chunk-data record reachable from its root. `now` is
    /// the wall-clock time recorded on the tombstone's deleter entry.
    pub fn delete_blob(&mut self, dead_before: i64, now: i64) -> Result<()> {
        if !matches!(self.mode, AccessMode::GcDelete | AccessMode::Create | AccessMode::CopyCreate) {
            bail!("delete_blob requires a writer accessor");
        }
        if self.meta.dead_time > dead_before {
            bail!("refusing to delete a blob whose dead-time is still in the future");
        }
        self.garbage_chunk_tree(self.meta.data_root)?;
        self.meta.deleted = true;
        let tombstone = self.heap.append_meta(&self.meta)?;
        let total = crate::record::RECORD_HEADER_SIZE as u32 + self.meta.encode().len() as u32;
        self.heap.mark_garbage(tombstone, crate::heap_file::FileKind::Meta, total)?;
        self.index
            .update_coord(&self.data, Coordinate::ABSENT, 0, self.meta.dead_time, self.meta.lww_stamp());
        self.index.mark_key_deleted(self.slot, &self.key, now);
        Ok(())
    }

    fn garbage_chunk_tree(&self, coord: Coordinate) -> Result<()> {
        if coord.is_absent() {
            return Ok(());
        }
        let file = self
            .heap
            .data_file(coord.file_id().unwrap())
            .ok_or_else(|| anyhow::anyhow!("corrupt storage: unknown data file"))?;
        let (header, _) = file.read_record_at(coord.offset())?;
        if header.kind == nc_api_types::RecordKind::ChunkMap {
            let map = self.heap.read_chunk_map(coord)?;
            for child in &map.children {
                self.garbage_chunk_tree(*child)?;
            }
        }
        let total = crate::record::RECORD_HEADER_SIZE as u32 + header.rec_size as u32;
        self.heap.mark_garbage(coord, crate::heap_file::FileKind::Data, total)
    }
}

fn tree_depth(total_chunks: u64, map_size: u32) -> u32 {
    let map_size = map_size.max(2) as u64;
    let mut depth = 1u32;
    let mut capacity = map_size;
    while capacity < total_chunks && depth < MAX_MAP_DEPTH {
        depth += 1;
        capacity = capacity.saturating_mul(map_size);
    }
    depth
}

fn check_password(meta: &MetaRecord, password: Option<&[u8]>, policy: PasswordPolicy) -> Result<()> {
    match policy {
        PasswordPolicy::OnlyWithPassword if meta.password_hash.is_none() => {
            bail!(StorageError::AuthError)
        }
        PasswordPolicy::OnlyWithoutPassword if meta.password_hash.is_some() => {
            bail!(StorageError::AuthError)
        }
        _ => {}
    }
    match (meta.password_hash, password) {
        (None, _) => Ok(()),
        (Some(_), None) => bail!(StorageError::AuthError),
        (Some(stored), Some(presented)) => {
            if hash_password(presented) == stored {
                Ok(())
            } else {
                bail!(StorageError::AuthError)
            }
        }
    }
}

/// Recomputes whether a read should prolong the blob's TTL (§4.3): enabled
/// and the blob is past the halfway point to expiry.
pub fn should_prolong(dead_time: i64, now: i64, ttl: u32, prolong_on_read: bool) -> bool {
    prolong_on_read && dead_time - now < ttl as i64 / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record_heap::RecordHeap;

    fn setup() -> (tempfile::TempDir, Arc<RecordHeap>, Arc<KeyIndex>) {
        let dir = tempfile::tempdir().unwrap();
        let heap = Arc::new(RecordHeap::open(dir.path(), "nc", 1 << 20).unwrap());
        (dir, heap, Arc::new(KeyIndex::new()))
    }

    #[test]
    fn write_read_roundtrip_single_chunk() {
        let (_dir, heap, index) = setup();
        let mut writer = BlobAccessor::open(
            heap.clone(),
            index.clone(),
            1,
            b"k1".to_vec(),
            None,
            AccessMode::Create,
            PasswordPolicy::Any,
            1000,
            60,
            7,
        )
        .unwrap();
        writer.write_chunk(0, b"hello world").unwrap();
        writer.finalize().unwrap();

        let reader = BlobAccessor::open(
            heap,
            index,
            1,
            b"k1".to_vec(),
            None,
            AccessMode::Read,
            PasswordPolicy::Any,
            1001,
            60,
            7,
        )
        .unwrap();
        assert_eq!(reader.get_size(), 11);
        assert_eq!(reader.read_chunk(0).unwrap(), b"hello world");
    }

    #[test]
    fn password_mismatch_is_rejected() {
        let (_dir, heap, index) = setup();
        let mut writer = BlobAccessor::open(
            heap.clone(),
            index.clone(),
            1,
            b"k2".to_vec(),
            None,
            AccessMode::Create,
            PasswordPolicy::Any,
            1000,
            60,
            7,
        )
        .unwrap();
        writer.set_password(Some(b"secret"));
        writer.write_chunk(0, b"x").unwrap();
        writer.finalize().unwrap();

        let err = BlobAccessor::open(
            heap,
            index,
            1,
            b"k2".to_vec(),
            Some(b"wrong"),
            AccessMode::Read,
            PasswordPolicy::Any,
            1001,
            60,
            7,
        )
        .unwrap_err();
        assert!(err.to_string().contains("password mismatch"));
    }

    #[test]
    fn delete_then_read_is_not_found() {
        let (_dir, heap, index) = setup();
        let mut writer = BlobAccessor::open(
            heap.clone(),
            index.clone(),
            1,
            b"k3".to_vec(),
            None,
            AccessMode::Create,
            PasswordPolicy::Any,
            1000,
            60,
            7,
        )
        .unwrap();
        writer.write_chunk(0, b"bye").unwrap();
        writer.finalize().unwrap();

        let mut deleter = BlobAccessor::open(
            heap.clone(),
            index.clone(),
            1,
            b"k3".to_vec(),
            None,
            AccessMode::GcDelete,
            PasswordPolicy::Any,
            2000,
            60,
            7,
        )
        .unwrap();
        deleter.delete_blob(i64::MAX, 2000).unwrap();

        let result = BlobAccessor::open(
            heap,
            index,
            1,
            b"k3".to_vec(),
            None,
            AccessMode::Read,
            PasswordPolicy::Any,
            2001,
            60,
            7,
        );
        assert!(result.is_err());
    }

    #[test]
    fn tree_depth_grows_with_chunk_count() {
        assert_eq!(tree_depth(10, 256), 1);
        assert_eq!(tree_depth(70_000, 256), 2);
        assert_eq!(tree_depth(20_000_000, 256), 3);
    }
}
