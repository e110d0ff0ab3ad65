//! Multi-file record heap: tracks the bank of meta and data files backing a
//! slot directory, owns file-id/rec-num allocation, and rolls the "current
//! write" file over to a pre-built spare when it seals (§4.1).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};

use crate::coordinate::{Coordinate, FileId};
use crate::heap_file::{FileKind, HeapFile};
use crate::record::{
    ChunkDataRecord, ChunkMapRecord, MetaRecord, RecNum, RecordHeader, RECORD_HEADER_SIZE,
};
use nc_api_types::RecordKind;

fn file_name(prefix: &str, kind: FileKind, id: FileId) -> String {
    let letter = match kind {
        FileKind::Meta => 'm',
        FileKind::Data => 'd',
    };
    format!("{prefix}{letter}{id}.db")
}

/// Owns every [`HeapFile`] for one slot directory: the current write file of
/// each kind, any pre-built spares, and everything else kept around only to
/// be read (or compacted) until the garbage collector reclaims it.
pub struct RecordHeap {
    dir: PathBuf,
    prefix: String,
    file_size: u32,
    next_file_id: AtomicU32,
    next_rec_num: AtomicU64,
    meta_files: RwLock<BTreeMap<FileId, Arc<HeapFile>>>,
    data_files: RwLock<BTreeMap<FileId, Arc<HeapFile>>>,
    current_meta: RwLock<Arc<HeapFile>>,
    current_data: RwLock<Arc<HeapFile>>,
    spare_meta: Mutex<Option<Arc<HeapFile>>>,
    spare_data: Mutex<Option<Arc<HeapFile>>>,
}

impl RecordHeap {
    /// Open (or initialize) the heap rooted at `dir`, replaying every file
    /// already on disk so `next_file_id`/`next_rec_num` resume correctly.
    pub fn open(dir: &Path, prefix: &str, file_size: u32) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("creating storage dir {}", dir.display()))?;

        let mut meta_files = BTreeMap::new();
        let mut data_files = BTreeMap::new();
        let mut max_file_id: FileId = 0;
        let mut max_rec_num: RecNum = 0;

        for entry in fs::read_dir(dir).with_context(|| format!("reading storage dir {}", dir.display()))? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((kind, id)) = parse_file_name(name, prefix) else {
                continue;
            };
            let heap_file = match HeapFile::open_existing(&path, id) {
                Ok(f) => f,
                Err(err) => {
                    log::warn!("skipping unreadable heap file {name}: {err}");
                    continue;
                }
            };
            max_file_id = max_file_id.max(id);
            for (_, header, _) in heap_file.iter_records() {
                max_rec_num = max_rec_num.max(header.rec_num);
            }
            let arc = Arc::new(heap_file);
            match kind {
                FileKind::Meta => {
                    meta_files.insert(id, arc);
                }
                FileKind::Data => {
                    data_files.insert(id, arc);
                }
            }
        }

        let next_file_id = AtomicU32::new(max_file_id + 1);
        let next_rec_num = AtomicU64::new(max_rec_num + 1);

        let current_meta = match meta_files.values().rev().find(|f| !f.is_sealed()) {
            Some(f) => f.clone(),
            None => {
                let id = next_file_id.fetch_add(1, Ordering::SeqCst);
                let path = dir.join(file_name(prefix, FileKind::Meta, id));
                let f = Arc::new(HeapFile::create(&path, id, FileKind::Meta, file_size)?);
                meta_files.insert(id, f.clone());
                f
            }
        };
        let current_data = match data_files.values().rev().find(|f| !f.is_sealed()) {
            Some(f) => f.clone(),
            None => {
                let id = next_file_id.fetch_add(1, Ordering::SeqCst);
                let path = dir.join(file_name(prefix, FileKind::Data, id));
                let f = Arc::new(HeapFile::create(&path, id, FileKind::Data, file_size)?);
                data_files.insert(id, f.clone());
                f
            }
        };

        Ok(RecordHeap {
            dir: dir.to_path_buf(),
            prefix: prefix.to_string(),
            file_size,
            next_file_id,
            next_rec_num,
            meta_files: RwLock::new(meta_files),
            data_files: RwLock::new(data_files),
            current_meta: RwLock::new(current_meta),
            current_data: RwLock::new(current_data),
            spare_meta: Mutex::new(None),
            spare_data: Mutex::new(None),
        })
    }

    fn alloc_rec_num(&self) -> RecNum {
        self.next_rec_num.fetch_add(1, Ordering::SeqCst)
    }

    fn alloc_file_id(&self) -> FileId {
        self.next_file_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Ensure a spare file of each kind exists, building one if missing. A
    /// background thread (owned by [`crate::context::StorageContext`]) calls
    /// this periodically so rollover never blocks a writer on file creation.
    pub fn ensure_spares(&self) -> Result<()> {
        {
            let mut spare = self.spare_meta.lock();
            if spare.is_none() {
                let id = self.alloc_file_id();
                let path = self.dir.join(file_name(&self.prefix, FileKind::Meta, id));
                let f = Arc::new(HeapFile::create(&path, id, FileKind::Meta, self.file_size)?);
                self.meta_files.write().insert(id, f.clone());
                *spare = Some(f);
            }
        }
        {
            let mut spare = self.spare_data.lock();
            if spare.is_none() {
                let id = self.alloc_file_id();
                let path = self.dir.join(file_name(&self.prefix, FileKind::Data, id));
                let f = Arc::new(HeapFile::create(&path, id, FileKind::Data, self.file_size)?);
                self.data_files.write().insert(id, f.clone());
                *spare = Some(f);
            }
        }
        Ok(())
    }

    fn current(&self, kind: FileKind) -> Arc<HeapFile> {
        match kind {
            FileKind::Meta => self.current_meta.read().clone(),
            FileKind::Data => self.current_data.read().clone(),
        }
    }

    /// Roll `kind`'s current file over to its spare, building one inline (at
    /// the cost of blocking this writer) if the background thread hasn't
    /// prepared one yet.
    fn rollover(&self, kind: FileKind) -> Result<Arc<HeapFile>> {
        let spare_slot = match kind {
            FileKind::Meta => &self.spare_meta,
            FileKind::Data => &self.spare_data,
        };
        let next = {
            let mut slot = spare_slot.lock();
            match slot.take() {
                Some(f) => f,
                None => {
                    log::warn!("no spare {kind:?} file ready, building one synchronously");
                    let id = self.alloc_file_id();
                    let path = self.dir.join(file_name(&self.prefix, kind, id));
                    let f = Arc::new(HeapFile::create(&path, id, kind, self.file_size)?);
                    let mut files = match kind {
                        FileKind::Meta => self.meta_files.write(),
                        FileKind::Data => self.data_files.write(),
                    };
                    files.insert(id, f.clone());
                    f
                }
            }
        };
        match kind {
            FileKind::Meta => *self.current_meta.write() = next.clone(),
            FileKind::Data => *self.current_data.write() = next.clone(),
        }
        Ok(next)
    }

    fn append(&self, kind: FileKind, record_kind: RecordKind, payload: &[u8]) -> Result<Coordinate> {
        if payload.len() > u16::MAX as usize {
            bail!("record payload too large ({} bytes)", payload.len());
        }
        let total = RECORD_HEADER_SIZE as u16 + payload.len() as u16;
        let rec_num = self.alloc_rec_num();

        let mut file = self.current(kind);
        let offset = loop {
            if let Some(off) = file.reserve(total) {
                break off;
            }
            file = self.rollover(kind)?;
        };

        let header = RecordHeader {
            rec_num,
            rec_size: payload.len() as u16,
            kind: record_kind,
        };
        let buf = file.slice_mut(offset, total)?;
        header.write_to(&mut buf[0..RECORD_HEADER_SIZE])?;
        buf[RECORD_HEADER_SIZE..].copy_from_slice(payload);

        Ok(Coordinate::new(file.file_id, offset))
    }

    pub fn append_meta(&self, meta: &MetaRecord) -> Result<Coordinate> {
        self.append(FileKind::Meta, RecordKind::Meta, &meta.encode())
    }

    pub fn append_chunk_map(&self, rec: &ChunkMapRecord) -> Result<Coordinate> {
        self.append(FileKind::Data, RecordKind::ChunkMap, &rec.encode())
    }

    pub fn append_chunk_data(&self, rec: &ChunkDataRecord) -> Result<Coordinate> {
        self.append(FileKind::Data, RecordKind::ChunkData, &rec.encode())
    }

    fn resolve(&self, coord: Coordinate, kind: FileKind) -> Result<Arc<HeapFile>> {
        let file_id = coord
            .file_id()
            .ok_or_else(|| anyhow::anyhow!("attempted to resolve an absent coordinate"))?;
        let files = match kind {
            FileKind::Meta => self.meta_files.read(),
            FileKind::Data => self.data_files.read(),
        };
        files
            .get(&file_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("corrupt storage: unknown file id {file_id}"))
    }

    pub fn read_meta(&self, coord: Coordinate) -> Result<MetaRecord> {
        let file = self.resolve(coord, FileKind::Meta)?;
        let (header, payload) = file.read_record_at(coord.offset())?;
        if header.kind != RecordKind::Meta {
            bail!("corrupt storage: expected meta record, found {:?}", header.kind);
        }
        MetaRecord::decode(header.rec_num, payload)
    }

    pub fn read_chunk_map(&self, coord: Coordinate) -> Result<ChunkMapRecord> {
        let file = self.resolve(coord, FileKind::Data)?;
        let (header, payload) = file.read_record_at(coord.offset())?;
        if header.kind != RecordKind::ChunkMap {
            bail!("corrupt storage: expected chunk-map record, found {:?}", header.kind);
        }
        ChunkMapRecord::decode(header.rec_num, payload)
    }

    pub fn read_chunk_data(&self, coord: Coordinate) -> Result<ChunkDataRecord> {
        let file = self.resolve(coord, FileKind::Data)?;
        let (header, payload) = file.read_record_at(coord.offset())?;
        if header.kind != RecordKind::ChunkData {
            bail!("corrupt storage: expected chunk-data record, found {:?}", header.kind);
        }
        ChunkDataRecord::decode(header.rec_num, payload)
    }

    /// Patch a chunk record's `up-coord` back-pointer in place. Used both
    /// when a parent map first learns its children's identities and by the
    /// compactor when relocating a child (§4.1 step 3).
    pub fn patch_up_coord(&self, coord: Coordinate, new_up: Coordinate) -> Result<()> {
        if coord.is_absent() {
            return Ok(());
        }
        let file = self.resolve(coord, FileKind::Data)?;
        let (header, _) = file.read_record_at(coord.offset())?;
        if !matches!(header.kind, RecordKind::ChunkMap | RecordKind::ChunkData) {
            bail!("corrupt storage: patch_up_coord on non-chunk record {:?}", header.kind);
        }
        let payload_off = coord.offset() + RECORD_HEADER_SIZE as u32;
        let buf = file.slice_mut(payload_off, 8)?;
        buf.copy_from_slice(&new_up.raw().to_le_bytes());
        Ok(())
    }

    /// Patch the coordinate stored at `child_index` of the chunk-map record
    /// at `parent_coord`. This is the one edit a chunk-map record ever
    /// undergoes after being written (§4.1 step 3).
    pub fn patch_child_slot(&self, parent_coord: Coordinate, child_index: usize, new_child: Coordinate) -> Result<()> {
        let file = self.resolve(parent_coord, FileKind::Data)?;
        let (header, _) = file.read_record_at(parent_coord.offset())?;
        if header.kind != RecordKind::ChunkMap {
            bail!("corrupt storage: patch_child_slot on non-chunk-map record {:?}", header.kind);
        }
        let payload_off = parent_coord.offset() + RECORD_HEADER_SIZE as u32;
        let child_off = payload_off + 12 + (child_index as u32) * 8;
        let buf = file.slice_mut(child_off, 8)?;
        buf.copy_from_slice(&new_child.raw().to_le_bytes());
        Ok(())
    }

    /// Mark the bytes a now-stale record occupied as garbage, used by GC and
    /// the compactor once a record has been superseded or relocated.
    pub fn mark_garbage(&self, coord: Coordinate, kind: FileKind, rec_total_size: u32) -> Result<()> {
        self.resolve(coord, kind)?.mark_garbage(coord.offset(), rec_total_size)
    }

    pub fn data_file_ids(&self) -> Vec<FileId> {
        self.data_files.read().keys().copied().collect()
    }

    /// The data file currently accepting new appends; compaction must never
    /// pick this one (§4.9).
    pub fn current_data_file_id(&self) -> FileId {
        self.current_data.read().file_id
    }

    pub fn meta_file_ids(&self) -> Vec<FileId> {
        self.meta_files.read().keys().copied().collect()
    }

    pub fn data_file(&self, id: FileId) -> Option<Arc<HeapFile>> {
        self.data_files.read().get(&id).cloned()
    }

    pub fn meta_file(&self, id: FileId) -> Option<Arc<HeapFile>> {
        self.meta_files.read().get(&id).cloned()
    }

    /// Flush every mapped file to disk. Called from the periodic sync loop
    /// at `sync_time_period` (§10.4).
    pub fn msync_all(&self) -> Result<()> {
        for f in self.meta_files.read().values() {
            f.msync()?;
        }
        for f in self.data_files.read().values() {
            f.msync()?;
        }
        Ok(())
    }
}

fn parse_file_name(name: &str, prefix: &str) -> Option<(FileKind, FileId)> {
    let rest = name.strip_prefix(prefix)?;
    let rest = rest.strip_suffix(".db")?;
    let (letter, digits) = rest.split_at(1);
    let kind = match letter {
        "m" => FileKind::Meta,
        "d" => FileKind::Data,
        _ => return None,
    };
    let id: FileId = digits.parse().ok()?;
    Some((kind, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_meta_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let heap = RecordHeap::open(dir.path(), "nc", 4096).unwrap();

        let meta = MetaRecord {
            rec_num: 0,
            key: b"k1".to_vec(),
            slot: 1,
            create_time: 1,
            create_server: 1,
            create_id: 1,
            dead_time: 0,
            ttl: 60,
            expire: 0,
            ver_ttl: 0,
            ver_expire: 0,
            size: 0,
            chunk_size: 4096,
            map_size: 16,
            password_hash: None,
            data_root: Coordinate::ABSENT,
            deleted: false,
        };
        let coord = heap.append_meta(&meta).unwrap();
        let read = heap.read_meta(coord).unwrap();
        assert_eq!(read.key, meta.key);
    }

    #[test]
    fn rollover_uses_spare_when_available() {
        let dir = tempfile::tempdir().unwrap();
        // File small enough that a handful of records seals it.
        let heap = RecordHeap::open(dir.path(), "nc", 128).unwrap();
        heap.ensure_spares().unwrap();

        let data = ChunkDataRecord {
            rec_num: 0,
            up_coord: Coordinate::ABSENT,
            data: vec![7u8; 64],
        };
        let first = heap.append_chunk_data(&data).unwrap();
        let second = heap.append_chunk_data(&data).unwrap();
        assert_ne!(first.file_id(), second.file_id(), "second write should have rolled to a new file");
    }

    #[test]
    fn reopen_replays_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let meta = MetaRecord {
            rec_num: 0,
            key: b"persisted".to_vec(),
            slot: 2,
            create_time: 5,
            create_server: 1,
            create_id: 1,
            dead_time: 0,
            ttl: 0,
            expire: 0,
            ver_ttl: 0,
            ver_expire: 0,
            size: 0,
            chunk_size: 4096,
            map_size: 16,
            password_hash: None,
            data_root: Coordinate::ABSENT,
            deleted: false,
        };
        let coord = {
            let heap = RecordHeap::open(dir.path(), "nc", 4096).unwrap();
            heap.append_meta(&meta).unwrap()
        };
        let heap2 = RecordHeap::open(dir.path(), "nc", 4096).unwrap();
        let read = heap2.read_meta(coord).unwrap();
        assert_eq!(read.key, meta.key);
    }
}
