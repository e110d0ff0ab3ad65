//! Dependency-injected handle tying the storage engine together (§9 design
//! notes: "wrap process-wide singletons in a context object passed to
//! constructors" replaces the source's `s_MirrorConf`/`s_TimeTable` statics).

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context as _, Result};
use parking_lot::Mutex;

use nc_api_types::{AccessMode, LwwStamp, SlotId};
use nc_config::Config;

use crate::blob_accessor::BlobAccessor;
use crate::compactor::WriteGate;
use crate::coordinate::{Coordinate, FileId};
use crate::key_index::{CacheData, KeyIndex};
use crate::record::{MetaRecord, PasswordPolicy};
use crate::record_heap::RecordHeap;
use crate::sync_log::SyncLog;

/// How often a forced sync-log tail advance is allowed to repeat its
/// warning (§4.4); distinct from the slot log capacity itself.
const MIN_FORCED_CLEAN_PERIOD_SECS: i64 = 60;
const EXTRA_GC_TIME_SECS: i64 = 0;
/// Minimum time between two compaction attempts on the same data file, so a
/// file that didn't clear the garbage threshold isn't re-scanned every tick.
const COMPACTION_RETRY_SECS: i64 = 300;

pub struct StorageContext {
    pub config: Config,
    pub heap: Arc<RecordHeap>,
    pub index: Arc<KeyIndex>,
    pub sync_log: Arc<SyncLog>,
    pub write_gate: Arc<WriteGate>,
    pub stopped: Arc<AtomicBool>,
    create_server_id: u32,
    lockfile_path: PathBuf,
    last_compaction_attempt: Mutex<HashMap<FileId, i64>>,
}

impl StorageContext {
    /// Opens (or initialises) the on-disk heap, replays meta records into
    /// the Key Index with LWW conflict resolution, and detects an unclean
    /// prior shutdown via the advisory lockfile (§6).
    pub fn open(config: Config) -> Result<Self> {
        let pid = std::process::id();
        let lockfile_path = config
            .storage
            .path
            .join(nc_buildcfg::started_lockfile_name(&config.storage.prefix, pid));

        for entry in fs::read_dir(&config.storage.path).into_iter().flatten().flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&format!("{}_started_", config.storage.prefix)) {
                    log::warn!("found stale lockfile {name}: prior shutdown was unclean, rebuilding index from heap");
                }
            }
        }
        fs::create_dir_all(&config.storage.path)
            .with_context(|| format!("creating storage dir {}", config.storage.path.display()))?;
        fs::write(&lockfile_path, pid.to_string())
            .with_context(|| format!("writing lockfile {}", lockfile_path.display()))?;

        let heap = Arc::new(RecordHeap::open(
            &config.storage.path,
            &config.storage.prefix,
            config.storage.each_file_size as u32,
        )?);
        heap.ensure_spares()?;

        let index = Arc::new(KeyIndex::new());
        replay_meta_into_index(&heap, &index)?;

        let sync_log = Arc::new(SyncLog::new(
            config.mirror.max_slot_log_records,
            MIN_FORCED_CLEAN_PERIOD_SECS,
        ));
        if let Some(saved) = load_side_file(&config.storage.path, &config.storage.prefix) {
            sync_log.restore_max_rec_no(saved);
        }

        let create_server_id = config
            .self_peer
            .as_ref()
            .map(|p| crc32fast::hash(p.0.as_bytes()))
            .unwrap_or(0);

        Ok(StorageContext {
            config,
            heap,
            index,
            sync_log,
            write_gate: Arc::new(WriteGate::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            create_server_id,
            lockfile_path,
            last_compaction_attempt: Mutex::new(HashMap::new()),
        })
    }

    pub fn create_server_id(&self) -> u32 {
        self.create_server_id
    }

    /// Opens a `BlobAccessor` for `key` under this context's storage and
    /// index, with `now`/`ttl` feeding a fresh version's LWW stamp when
    /// `mode` is a writer mode.
    pub fn open_accessor(
        &self,
        slot: SlotId,
        key: Vec<u8>,
        password: Option<&[u8]>,
        mode: AccessMode,
        policy: PasswordPolicy,
        now: i64,
        ttl: u32,
    ) -> Result<BlobAccessor> {
        if matches!(mode, AccessMode::Create | AccessMode::CopyCreate) && !self.write_gate.allows_writes() {
            anyhow::bail!(nc_api_types::StorageError::ServerError("disk pressure: writes suspended".into()));
        }
        BlobAccessor::open(
            self.heap.clone(),
            self.index.clone(),
            slot,
            key,
            password,
            mode,
            policy,
            now,
            ttl,
            self.create_server_id,
        )
    }

    /// Like [`Self::open_accessor`], but for a `CopyCreate` driven by the
    /// Sync Controller (§4.8): `origin_stamp` preserves the remote peer's
    /// LWW stamp instead of minting a fresh local one.
    #[allow(clippy::too_many_arguments)]
    pub fn open_accessor_with_origin(
        &self,
        slot: SlotId,
        key: Vec<u8>,
        mode: AccessMode,
        now: i64,
        ttl: u32,
        origin_stamp: LwwStamp,
    ) -> Result<BlobAccessor> {
        if matches!(mode, AccessMode::Create | AccessMode::CopyCreate) && !self.write_gate.allows_writes() {
            anyhow::bail!(nc_api_types::StorageError::ServerError("disk pressure: writes suspended".into()));
        }
        BlobAccessor::open_with_origin(
            self.heap.clone(),
            self.index.clone(),
            slot,
            key,
            None,
            mode,
            PasswordPolicy::Any,
            now,
            ttl,
            self.create_server_id,
            Some(origin_stamp),
        )
    }

    /// Republish a blob under a bumped `dead-time` without rewriting its
    /// content, for prolong-on-read and replicated `Prolong` events (§4.3,
    /// §4.8).
    pub fn prolong_accessor(
        &self,
        slot: SlotId,
        key: Vec<u8>,
        new_dead_time: i64,
        new_ttl: u32,
        origin_stamp: Option<LwwStamp>,
    ) -> Result<Coordinate> {
        BlobAccessor::prolong(self.heap.clone(), self.index.clone(), slot, key, new_dead_time, new_ttl, origin_stamp)
    }

    /// One iteration of the periodic mmap flush + spare-file maintenance
    /// loop (§4.1).
    pub fn flush_tick(&self) -> Result<()> {
        self.heap.msync_all()?;
        self.heap.ensure_spares()?;
        self.save_side_file()
    }

    /// One iteration of expiry GC across every slot this node serves,
    /// followed by at most one heap-compaction pass (§4.9). Returns the
    /// number of blobs expired; relocated records from compaction are
    /// logged, not counted here.
    pub fn gc_tick(&self, now: i64) -> Result<usize> {
        let mut total = 0usize;
        for slot in &self.config.self_slots {
            total += crate::compactor::run_expiry_gc(
                &self.heap,
                &self.index,
                *slot,
                now,
                EXTRA_GC_TIME_SECS,
                self.config.storage.gc_batch_size,
                self.create_server_id,
            )?;
        }
        self.write_gate.reevaluate(
            self.heap_used_size(),
            free_disk_bytes(&self.config.storage.path).unwrap_or(u64::MAX),
            self.config.storage.min_storage_size,
            self.config.storage.min_storage_size / 2,
            self.config.storage.disk_free_limit,
        );
        self.compaction_tick(now)?;
        Ok(total)
    }

    /// Pick the data file with the worst garbage ratio (excluding the
    /// current write file and anything tried too recently) and compact it
    /// if that ratio is at least `storage.max_garbage_pct` (§4.9).
    fn compaction_tick(&self, now: i64) -> Result<usize> {
        let current = self.heap.current_data_file_id();
        let mut attempted = self.last_compaction_attempt.lock();
        let candidate = crate::compactor::pick_compaction_candidate(&self.heap, current, |id| {
            attempted.get(&id).is_some_and(|last| now - *last < COMPACTION_RETRY_SECS)
        });
        let Some(file_id) = candidate else {
            return Ok(0);
        };
        let Some(file) = self.heap.data_file(file_id) else {
            return Ok(0);
        };
        let counters = file.counters();
        let live_plus_garbage = counters.used_size + counters.garb_size;
        let ratio = if live_plus_garbage == 0 {
            0.0
        } else {
            counters.garb_size as f64 / live_plus_garbage as f64
        };
        attempted.insert(file_id, now);
        drop(attempted);
        if ratio * 100.0 < self.config.storage.max_garbage_pct as f64 {
            return Ok(0);
        }
        let relocated = crate::compactor::compact_file(&self.heap, file_id, 0, self.config.storage.each_file_size)?;
        log::info!("compacted data file {file_id}: relocated {relocated} live records (garbage ratio {ratio:.2})");
        Ok(relocated)
    }

    fn heap_used_size(&self) -> u64 {
        self.heap
            .data_file_ids()
            .into_iter()
            .filter_map(|id| self.heap.data_file(id))
            .map(|f| f.counters().used_size)
            .sum()
    }

    fn save_side_file(&self) -> Result<()> {
        save_side_file(
            &self.config.storage.path,
            &self.config.storage.prefix,
            self.sync_log.persisted_max_rec_no(),
        )
    }

    /// Spawn the long-lived background loops (flush/GC); the record-heap
    /// spare-file thread is folded into the flush loop since both run on
    /// the same cadence. Returns join handles the caller should await after
    /// flipping `stopped` (§5 cancellation policy).
    pub fn spawn_background_threads(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let flush_ctx = self.clone();
        let flush_period = self.config.storage.sync_time_period;
        let flush_handle = std::thread::Builder::new()
            .name("nc-flush".into())
            .spawn(move || run_periodic(&flush_ctx.stopped, flush_period, || {
                if let Err(err) = flush_ctx.flush_tick() {
                    log::error!("flush tick failed: {err}");
                }
            }))
            .expect("spawn flush thread");

        let gc_ctx = self.clone();
        let gc_handle = std::thread::Builder::new()
            .name("nc-gc".into())
            .spawn(move || run_periodic(&gc_ctx.stopped, Duration::from_secs(1), || {
                let now = nc_tools::time::now_secs();
                if let Err(err) = gc_ctx.gc_tick(now) {
                    log::error!("gc tick failed: {err}");
                }
            }))
            .expect("spawn gc thread");

        vec![flush_handle, gc_handle]
    }

    /// Removes the advisory lockfile on a clean shutdown (§6).
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(err) = fs::remove_file(&self.lockfile_path) {
            log::warn!("failed to remove lockfile {}: {err}", self.lockfile_path.display());
        }
    }
}

fn run_periodic(stopped: &AtomicBool, period: Duration, mut tick: impl FnMut()) {
    while !stopped.load(Ordering::Acquire) {
        tick();
        std::thread::sleep(period);
    }
}

fn replay_meta_into_index(heap: &RecordHeap, index: &KeyIndex) -> Result<()> {
    let mut best: HashMap<(SlotId, Vec<u8>), (Coordinate, MetaRecord)> = HashMap::new();

    for file_id in heap.meta_file_ids() {
        let Some(file) = heap.meta_file(file_id) else {
            continue;
        };
        for (offset, header, payload) in file.iter_records() {
            if header.kind != nc_api_types::RecordKind::Meta {
                continue;
            }
            let meta = match MetaRecord::decode(header.rec_num, payload) {
                Ok(m) => m,
                Err(err) => {
                    log::warn!("corrupt meta record in file {file_id} at offset {offset}: {err}");
                    break;
                }
            };
            let coord = Coordinate::new(file_id, offset);
            let entry_key = (meta.slot, meta.key.clone());
            let should_replace = match best.get(&entry_key) {
                None => true,
                Some((_, existing)) => meta.lww_stamp() > existing.lww_stamp(),
            };
            if should_replace {
                best.insert(entry_key, (coord, meta));
            }
        }
    }

    for ((slot, key), (coord, meta)) in best {
        if meta.deleted {
            continue;
        }
        let data = CacheData::new(
            key.clone(),
            slot,
            coord,
            meta.size,
            meta.create_time,
            meta.create_server,
            meta.create_id,
            meta.dead_time,
            meta.expire,
            meta.ver_expire,
        );
        index.lookup_or_create(slot, &key, || data);
    }
    Ok(())
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SideFile {
    max_sync_log_rec_no: u64,
}

fn side_file_path(dir: &std::path::Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}.index.db"))
}

fn load_side_file(dir: &std::path::Path, prefix: &str) -> Option<u64> {
    let path = side_file_path(dir, prefix);
    let bytes = fs::read(path).ok()?;
    match serde_json::from_slice::<SideFile>(&bytes) {
        Ok(sf) => Some(sf.max_sync_log_rec_no),
        Err(err) => {
            log::warn!("index side-file corrupt, will be recreated: {err}");
            None
        }
    }
}

fn save_side_file(dir: &std::path::Path, prefix: &str, max_sync_log_rec_no: u64) -> Result<()> {
    let path = side_file_path(dir, prefix);
    let bytes = serde_json::to_vec(&SideFile { max_sync_log_rec_no })?;
    fs::write(path, bytes)?;
    Ok(())
}

fn free_disk_bytes(path: &std::path::Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    Some(stat.blocks_available() as u64 * stat.fragment_size())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.storage.path = dir.to_path_buf();
        config.storage.each_file_size = 1 << 20;
        config.self_slots = vec![1];
        config
    }

    #[test]
    fn open_creates_lockfile_and_replays_empty_heap() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StorageContext::open(test_config(dir.path())).unwrap();
        assert!(ctx.lockfile_path.exists());
        ctx.shutdown();
        assert!(!ctx.lockfile_path.exists());
    }

    #[test]
    fn reopen_replays_writes_with_lww() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ctx = StorageContext::open(test_config(dir.path())).unwrap();
            let mut accessor = ctx
                .open_accessor(1, b"k".to_vec(), None, AccessMode::Create, PasswordPolicy::Any, 100, 600)
                .unwrap();
            accessor.write_chunk(0, b"payload").unwrap();
            accessor.finalize().unwrap();
            ctx.shutdown();
        }
        let ctx2 = StorageContext::open(test_config(dir.path())).unwrap();
        let data = ctx2.index.lookup(1, b"k").unwrap();
        assert!(!data.coord().is_absent());
    }
}
