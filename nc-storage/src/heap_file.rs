//! A single memory-mapped, fixed-size heap file (§4.1, §6 "on-disk layout").
//!
//! Mirrors the mmap-management idiom used for the fixed index files
//! elsewhere in this codebase (open with `O_RDWR`, `mmap` `MAP_SHARED`,
//! `munmap` on drop) but is append-only and variable-record rather than a
//! fixed digest array: records are appended by atomically reserving a byte
//! range, and a record is "sealed" (no further writes) once a reservation
//! would overrun the file.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use crate::coordinate::FileId;
use crate::record::RECORD_HEADER_SIZE;

pub const META_MAGIC: [u8; 8] = *b"NCMETA01";
pub const DATA_MAGIC: [u8; 8] = *b"NCDATA01";
const HEADER_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Meta,
    Data,
}

impl FileKind {
    fn magic(self) -> [u8; 8] {
        match self {
            FileKind::Meta => META_MAGIC,
            FileKind::Data => DATA_MAGIC,
        }
    }

    fn from_magic(magic: &[u8]) -> Result<Self> {
        if magic == META_MAGIC {
            Ok(FileKind::Meta)
        } else if magic == DATA_MAGIC {
            Ok(FileKind::Data)
        } else {
            bail!("unrecognised heap file magic")
        }
    }
}

#[derive(Default, Debug, Clone, Copy)]
pub struct FileCounters {
    pub used_size: u64,
    pub garb_size: u64,
}

/// A single mmap'd, fixed-size heap file. Exactly one meta file and one data
/// file are "current write" at a time (§4.1); this struct is agnostic to
/// that role, which [`crate::record_heap::RecordHeap`] tracks.
pub struct HeapFile {
    pub file_id: FileId,
    pub kind: FileKind,
    pub path: PathBuf,
    file: File,
    map_ptr: *mut u8,
    map_len: usize,
    /// Next free byte offset relative to the start of the file (including
    /// the 8-byte magic header). Advanced by [`HeapFile::reserve`].
    write_cursor: AtomicU32,
    sealed: AtomicBool,
    counters: Mutex<FileCounters>,
    /// Header offsets already credited to `garb_size`, so a record reachable
    /// by more than one path (a delete racing a compaction relocation, or a
    /// second compaction pass over the same file) is never double-counted.
    garbage_offsets: Mutex<std::collections::HashSet<u32>>,
}

// The mmap region is shared and not thread-local; concurrent access is
// bounds-checked and non-overlapping writes are disjoint byte ranges.
unsafe impl Send for HeapFile {}
unsafe impl Sync for HeapFile {}

impl Drop for HeapFile {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            log::error!("failed to unmap heap file {:?}: {err}", self.path);
        }
    }
}

impl HeapFile {
    /// Create a new file pre-sized to `size` bytes and map it read-write.
    pub fn create(path: &Path, file_id: FileId, kind: FileKind, size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("creating heap file {}", path.display()))?;

        nix::unistd::ftruncate(file.as_raw_fd(), size as i64)
            .with_context(|| format!("sizing heap file {}", path.display()))?;

        let map_len = size as usize;
        let map_ptr = map_file(&file, map_len)?;

        unsafe {
            std::ptr::copy_nonoverlapping(kind.magic().as_ptr(), map_ptr, HEADER_LEN);
        }

        Ok(HeapFile {
            file_id,
            kind,
            path: path.to_path_buf(),
            file,
            map_ptr,
            map_len,
            write_cursor: AtomicU32::new(HEADER_LEN as u32),
            sealed: AtomicBool::new(false),
            counters: Mutex::new(FileCounters::default()),
            garbage_offsets: Mutex::new(std::collections::HashSet::new()),
        })
    }

    /// Open an existing heap file, validating its magic and file size.
    pub fn open_existing(path: &Path, file_id: FileId) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("opening heap file {}", path.display()))?;

        let stat = nix::sys::stat::fstat(file.as_raw_fd())
            .with_context(|| format!("fstat heap file {}", path.display()))?;
        let map_len = stat.st_size as usize;
        if map_len < HEADER_LEN {
            bail!("heap file {} too small to contain a header", path.display());
        }

        let map_ptr = map_file(&file, map_len)?;
        let kind = FileKind::from_magic(unsafe { std::slice::from_raw_parts(map_ptr, HEADER_LEN) })?;

        Ok(HeapFile {
            file_id,
            kind,
            path: path.to_path_buf(),
            file,
            map_ptr,
            map_len,
            write_cursor: AtomicU32::new(HEADER_LEN as u32),
            sealed: AtomicBool::new(false),
            counters: Mutex::new(FileCounters::default()),
            garbage_offsets: Mutex::new(std::collections::HashSet::new()),
        })
    }

    pub fn file_size(&self) -> u32 {
        self.map_len as u32
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> FileCounters {
        *self.counters.lock()
    }

    /// Reserve `size` bytes at the current write cursor. Returns the start
    /// offset on success, or `None` if the file has no room (it is sealed as
    /// a side effect of the first such failure, per §4.1).
    pub fn reserve(&self, size: u16) -> Option<u32> {
        if self.is_sealed() {
            return None;
        }
        let size = size as u32;
        let mut cur = self.write_cursor.load(Ordering::Acquire);
        loop {
            let end = cur as u64 + size as u64;
            if end > self.map_len as u64 {
                // No room: seal the file, crediting the unused tail to used-size
                // (invariant 4, §3) so book-keeping stays exact.
                if !self.sealed.swap(true, Ordering::AcqRel) {
                    let remaining = self.map_len as u32 - cur;
                    if remaining > 0 {
                        self.counters.lock().used_size += remaining as u64;
                    }
                }
                return None;
            }
            match self.write_cursor.compare_exchange_weak(
                cur,
                end as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.counters.lock().used_size += size as u64;
                    return Some(cur);
                }
                Err(observed) => cur = observed,
            }
        }
    }

    /// Bounds-checked mutable view of `size` bytes at `offset`, for the
    /// caller to write the record header+payload into.
    pub fn slice_mut(&self, offset: u32, size: u16) -> Result<&mut [u8]> {
        let end = offset as u64 + size as u64;
        if end > self.map_len as u64 {
            bail!(
                "corrupt storage: record at offset {offset} size {size} exceeds file {}",
                self.path.display()
            );
        }
        Ok(unsafe { std::slice::from_raw_parts_mut(self.map_ptr.add(offset as usize), size as usize) })
    }

    pub fn slice(&self, offset: u32, size: u16) -> Result<&[u8]> {
        let end = offset as u64 + size as u64;
        if end > self.map_len as u64 || (offset as usize) < HEADER_LEN {
            bail!(
                "corrupt storage: record at offset {offset} size {size} exceeds file {}",
                self.path.display()
            );
        }
        Ok(unsafe { std::slice::from_raw_parts(self.map_ptr.add(offset as usize), size as usize) })
    }

    /// Read the whole record range (header + payload) starting at `header_offset`,
    /// peeking the header first to learn `rec_size`.
    pub fn read_record_at(&self, header_offset: u32) -> Result<(crate::record::RecordHeader, &[u8])> {
        let header_bytes = self.slice(header_offset, RECORD_HEADER_SIZE as u16)?;
        let header = crate::record::RecordHeader::read_from(header_bytes)?;
        let payload_off = header_offset + RECORD_HEADER_SIZE as u32;
        let payload = self.slice(payload_off, header.rec_size)?;
        Ok((header, payload))
    }

    /// Mark the record at `offset` (its total on-disk size, header
    /// included, is `size`) as garbage. Idempotent: a record already marked
    /// garbage (by an earlier delete, or a previous compaction pass over
    /// this same file) is left alone rather than double-counted.
    pub fn mark_garbage(&self, offset: u32, size: u32) -> Result<()> {
        if !self.garbage_offsets.lock().insert(offset) {
            return Ok(());
        }
        let mut counters = self.counters.lock();
        if size as u64 > counters.used_size {
            bail!(
                "corrupt storage: used-size underflow on file {}",
                self.path.display()
            );
        }
        counters.used_size -= size as u64;
        counters.garb_size += size as u64;
        Ok(())
    }

    /// Iterate over every record from the start of the payload area, in file
    /// order, used by startup replay (§4.1) and by the compactor's scan.
    pub fn iter_records(&self) -> HeapFileIter<'_> {
        HeapFileIter {
            file: self,
            offset: HEADER_LEN as u32,
        }
    }

    pub fn msync(&self) -> Result<()> {
        unsafe {
            nix::sys::mman::msync(
                self.map_ptr as *mut std::ffi::c_void,
                self.map_len,
                nix::sys::mman::MsFlags::MS_SYNC,
            )
        }
        .with_context(|| format!("msync heap file {}", self.path.display()))
    }

    fn unmap(&mut self) -> Result<()> {
        if self.map_ptr.is_null() {
            return Ok(());
        }
        unsafe {
            nix::sys::mman::munmap(self.map_ptr as *mut std::ffi::c_void, self.map_len)
        }
        .context("munmap heap file")?;
        self.map_ptr = std::ptr::null_mut();
        Ok(())
    }
}

fn map_file(file: &File, len: usize) -> Result<*mut u8> {
    let ptr = unsafe {
        nix::sys::mman::mmap(
            None,
            std::num::NonZeroUsize::new(len).context("zero-length heap file")?,
            nix::sys::mman::ProtFlags::PROT_READ | nix::sys::mman::ProtFlags::PROT_WRITE,
            nix::sys::mman::MapFlags::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    }
    .context("mmap heap file")?;
    Ok(ptr as *mut u8)
}

/// Sequential scan over every record in a heap file, used for startup replay.
/// Stops (without error) at the first byte range that no longer contains a
/// valid header, matching "corrupted records terminate the scan" (§4.1).
pub struct HeapFileIter<'a> {
    file: &'a HeapFile,
    offset: u32,
}

impl<'a> Iterator for HeapFileIter<'a> {
    type Item = (u32, crate::record::RecordHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset as usize + RECORD_HEADER_SIZE > self.file.map_len {
            return None;
        }
        let header_offset = self.offset;
        let (header, payload) = match self.file.read_record_at(header_offset) {
            Ok(v) => v,
            Err(_) => return None,
        };
        if matches!(header.kind, nc_api_types::RecordKind::None) {
            return None;
        }
        self.offset = header_offset + RECORD_HEADER_SIZE as u32 + header.rec_size as u32;
        Some((header_offset, header, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordHeader;

    #[test]
    fn reserve_tracks_used_size_and_seals_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta1.db");
        let file = HeapFile::create(&path, 1, FileKind::Meta, 64).unwrap();

        let off = file.reserve(20).expect("fits");
        assert_eq!(off, 8);
        assert_eq!(file.counters().used_size, 20);

        // 64 - 28 = 36 remain, a 40-byte record does not fit -> seals.
        assert!(file.reserve(40).is_none());
        assert!(file.is_sealed());
        // Unused tail (36 bytes) credited to used-size.
        assert_eq!(file.counters().used_size, 20 + 36);
    }

    #[test]
    fn write_and_read_record_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data1.db");
        let file = HeapFile::create(&path, 1, FileKind::Data, 4096).unwrap();

        let payload = b"chunk-bytes";
        let total = crate::record::RECORD_HEADER_SIZE as u16 + payload.len() as u16;
        let off = file.reserve(total).unwrap();

        let header = RecordHeader {
            rec_num: 1,
            rec_size: payload.len() as u16,
            kind: nc_api_types::RecordKind::ChunkData,
        };
        let buf = file.slice_mut(off, total).unwrap();
        header.write_to(&mut buf[0..crate::record::RECORD_HEADER_SIZE]).unwrap();
        buf[crate::record::RECORD_HEADER_SIZE..].copy_from_slice(payload);

        let (read_header, read_payload) = file.read_record_at(off).unwrap();
        assert_eq!(read_header.rec_num, 1);
        assert_eq!(read_payload, payload);
    }
}
