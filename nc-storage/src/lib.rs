//! On-disk record heap, in-memory key index, blob accessor, sync log and
//! GC/compactor (§4.1-§4.4, §4.9). Everything a peer node needs to serve
//! reads and writes for the slots it hosts, independent of networking.

pub mod blob_accessor;
pub mod compactor;
pub mod context;
pub mod coordinate;
pub mod heap_file;
pub mod key_index;
pub mod record;
pub mod record_heap;
pub mod sync_log;

pub use blob_accessor::BlobAccessor;
pub use context::StorageContext;
pub use coordinate::Coordinate;
pub use key_index::KeyIndex;
pub use record_heap::RecordHeap;
pub use sync_log::SyncLog;
