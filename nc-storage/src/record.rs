//! On-disk record layout (§3, §6 "on-disk layout").
//!
//! Every record begins with a fixed [`RecordHeader`]; everything after it is
//! kind-specific payload. Meta records are the tree root and additionally
//! carry a `deleted` tombstone flag; chunk-map and chunk-data records carry
//! an `up-coord` back-pointer so a single relocation (§4.1 compaction) only
//! ever has to patch one parent slot.

use anyhow::{bail, Result};

use crate::coordinate::Coordinate;
use nc_api_types::RecordKind;

/// Size in bytes of the fixed header every record begins with.
pub const RECORD_HEADER_SIZE: usize = 16;

/// `rec-num` is a process-wide monotonic counter (§5 ordering guarantees).
pub type RecNum = u64;

#[derive(Clone, Copy, Debug)]
pub struct RecordHeader {
    pub rec_num: RecNum,
    pub rec_size: u16,
    pub kind: RecordKind,
}

impl RecordHeader {
    pub fn write_to(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < RECORD_HEADER_SIZE {
            bail!("buffer too small for record header");
        }
        buf[0..8].copy_from_slice(&self.rec_num.to_le_bytes());
        buf[8..10].copy_from_slice(&self.rec_size.to_le_bytes());
        buf[10] = self.kind as u8;
        for b in &mut buf[11..RECORD_HEADER_SIZE] {
            *b = 0;
        }
        Ok(())
    }

    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_SIZE {
            bail!("buffer too small for record header");
        }
        let rec_num = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let rec_size = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let kind = RecordKind::from_u8(buf[10])
            .ok_or_else(|| anyhow::anyhow!("unknown record kind byte {}", buf[10]))?;
        Ok(RecordHeader {
            rec_num,
            rec_size,
            kind,
        })
    }
}

/// Password policy applied by a Blob Accessor before comparing hashes (§4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PasswordPolicy {
    Any,
    OnlyWithPassword,
    OnlyWithoutPassword,
}

pub const PASSWORD_HASH_LEN: usize = 16;

/// In-memory view of a decoded meta record. The `deleted` tombstone flag and
/// `slot` are validated by the Record Heap against invariants 1-2 (§3) before
/// the Key Index ever sees them.
#[derive(Clone, Debug)]
pub struct MetaRecord {
    pub rec_num: RecNum,
    pub key: Vec<u8>,
    pub slot: u32,
    pub create_time: i64,
    pub create_server: u32,
    pub create_id: u64,
    pub dead_time: i64,
    pub ttl: u32,
    pub expire: u32,
    pub ver_ttl: u32,
    pub ver_expire: u32,
    pub size: u64,
    pub chunk_size: u32,
    pub map_size: u32,
    pub password_hash: Option<[u8; PASSWORD_HASH_LEN]>,
    pub data_root: Coordinate,
    pub deleted: bool,
}

impl MetaRecord {
    /// Encode the kind-specific payload (header is written separately by the
    /// heap). Layout: fixed fields, then `password_hash` flag+bytes, then the
    /// key's length-prefixed bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(80 + self.key.len());
        buf.extend_from_slice(&self.create_time.to_le_bytes());
        buf.extend_from_slice(&self.create_server.to_le_bytes());
        buf.extend_from_slice(&self.create_id.to_le_bytes());
        buf.extend_from_slice(&self.dead_time.to_le_bytes());
        buf.extend_from_slice(&self.ttl.to_le_bytes());
        buf.extend_from_slice(&self.expire.to_le_bytes());
        buf.extend_from_slice(&self.ver_ttl.to_le_bytes());
        buf.extend_from_slice(&self.ver_expire.to_le_bytes());
        buf.extend_from_slice(&self.size.to_le_bytes());
        buf.extend_from_slice(&self.chunk_size.to_le_bytes());
        buf.extend_from_slice(&self.map_size.to_le_bytes());
        buf.extend_from_slice(&self.slot.to_le_bytes());
        buf.extend_from_slice(&self.data_root.raw().to_le_bytes());
        buf.push(self.deleted as u8);
        match self.password_hash {
            Some(hash) => {
                buf.push(1);
                buf.extend_from_slice(&hash);
            }
            None => buf.push(0),
        }
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);
        buf
    }

    pub fn decode(rec_num: RecNum, buf: &[u8]) -> Result<Self> {
        let mut cur = 0usize;
        macro_rules! take {
            ($n:expr) => {{
                if buf.len() < cur + $n {
                    bail!("truncated meta record");
                }
                let slice = &buf[cur..cur + $n];
                cur += $n;
                slice
            }};
        }
        let create_time = i64::from_le_bytes(take!(8).try_into().unwrap());
        let create_server = u32::from_le_bytes(take!(4).try_into().unwrap());
        let create_id = u64::from_le_bytes(take!(8).try_into().unwrap());
        let dead_time = i64::from_le_bytes(take!(8).try_into().unwrap());
        let ttl = u32::from_le_bytes(take!(4).try_into().unwrap());
        let expire = u32::from_le_bytes(take!(4).try_into().unwrap());
        let ver_ttl = u32::from_le_bytes(take!(4).try_into().unwrap());
        let ver_expire = u32::from_le_bytes(take!(4).try_into().unwrap());
        let size = u64::from_le_bytes(take!(8).try_into().unwrap());
        let chunk_size = u32::from_le_bytes(take!(4).try_into().unwrap());
        let map_size = u32::from_le_bytes(take!(4).try_into().unwrap());
        let slot = u32::from_le_bytes(take!(4).try_into().unwrap());
        let data_root = Coordinate::from_raw(u64::from_le_bytes(take!(8).try_into().unwrap()));
        let deleted = take!(1)[0] != 0;
        let has_password = take!(1)[0] != 0;
        let password_hash = if has_password {
            let mut hash = [0u8; PASSWORD_HASH_LEN];
            hash.copy_from_slice(take!(PASSWORD_HASH_LEN));
            Some(hash)
        } else {
            None
        };
        let key_len = u32::from_le_bytes(take!(4).try_into().unwrap()) as usize;
        let key = take!(key_len).to_vec();

        Ok(MetaRecord {
            rec_num,
            key,
            slot,
            create_time,
            create_server,
            create_id,
            dead_time,
            ttl,
            expire,
            ver_ttl,
            ver_expire,
            size,
            chunk_size,
            map_size,
            password_hash,
            data_root,
            deleted,
        })
    }

    pub fn lww_stamp(&self) -> nc_api_types::LwwStamp {
        nc_api_types::LwwStamp::new(self.create_time, self.create_server, self.create_id)
    }
}

/// An inner node of the chunk-map tree: a fixed fan-out array of child
/// coordinates plus the back-pointer to its parent.
#[derive(Clone, Debug)]
pub struct ChunkMapRecord {
    pub rec_num: RecNum,
    pub up_coord: Coordinate,
    pub children: Vec<Coordinate>,
}

impl ChunkMapRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.children.len() * 8);
        buf.extend_from_slice(&self.up_coord.raw().to_le_bytes());
        buf.extend_from_slice(&(self.children.len() as u32).to_le_bytes());
        for c in &self.children {
            buf.extend_from_slice(&c.raw().to_le_bytes());
        }
        buf
    }

    pub fn decode(rec_num: RecNum, buf: &[u8]) -> Result<Self> {
        if buf.len() < 12 {
            bail!("truncated chunk-map record");
        }
        let up_coord = Coordinate::from_raw(u64::from_le_bytes(buf[0..8].try_into().unwrap()));
        let count = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
        let mut children = Vec::with_capacity(count);
        let mut cur = 12usize;
        for _ in 0..count {
            if buf.len() < cur + 8 {
                bail!("truncated chunk-map record children");
            }
            children.push(Coordinate::from_raw(u64::from_le_bytes(
                buf[cur..cur + 8].try_into().unwrap(),
            )));
            cur += 8;
        }
        Ok(ChunkMapRecord {
            rec_num,
            up_coord,
            children,
        })
    }

    /// Set the coordinate at `index`, growing the child array if needed.
    pub fn set_child(&mut self, index: usize, coord: Coordinate) {
        if index >= self.children.len() {
            self.children.resize(index + 1, Coordinate::ABSENT);
        }
        self.children[index] = coord;
    }
}

/// A leaf: raw payload bytes plus the back-pointer to its parent.
#[derive(Clone, Debug)]
pub struct ChunkDataRecord {
    pub rec_num: RecNum,
    pub up_coord: Coordinate,
    pub data: Vec<u8>,
}

impl ChunkDataRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.data.len());
        buf.extend_from_slice(&self.up_coord.raw().to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(rec_num: RecNum, buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            bail!("truncated chunk-data record");
        }
        let up_coord = Coordinate::from_raw(u64::from_le_bytes(buf[0..8].try_into().unwrap()));
        Ok(ChunkDataRecord {
            rec_num,
            up_coord,
            data: buf[8..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_record_roundtrips() {
        let meta = MetaRecord {
            rec_num: 42,
            key: b"hello-key".to_vec(),
            slot: 7,
            create_time: 123456,
            create_server: 1,
            create_id: 9,
            dead_time: 999999,
            ttl: 60,
            expire: 0,
            ver_ttl: 0,
            ver_expire: 0,
            size: 1024,
            chunk_size: 65536,
            map_size: 128,
            password_hash: Some([9u8; PASSWORD_HASH_LEN]),
            data_root: Coordinate::new(3, 512),
            deleted: false,
        };
        let encoded = meta.encode();
        let decoded = MetaRecord::decode(meta.rec_num, &encoded).unwrap();
        assert_eq!(decoded.key, meta.key);
        assert_eq!(decoded.slot, meta.slot);
        assert_eq!(decoded.password_hash, meta.password_hash);
        assert_eq!(decoded.data_root, meta.data_root);
    }

    #[test]
    fn chunk_map_roundtrips() {
        let mut map = ChunkMapRecord {
            rec_num: 1,
            up_coord: Coordinate::new(1, 0),
            children: Vec::new(),
        };
        map.set_child(5, Coordinate::new(2, 64));
        let encoded = map.encode();
        let decoded = ChunkMapRecord::decode(1, &encoded).unwrap();
        assert_eq!(decoded.children.len(), 6);
        assert_eq!(decoded.children[5], Coordinate::new(2, 64));
        assert!(decoded.children[0].is_absent());
    }
}
