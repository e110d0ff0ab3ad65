//! Small, dependency-light utilities shared by the netcache storage and
//! cluster crates. Mirrors the role `pbs-tools` plays for pbs-datastore:
//! this must not depend on any of the more storage-specific crates.

pub mod lru_cache;
pub mod time;
