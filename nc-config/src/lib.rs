//! Loads the `storage.*` / `mirror.*` key space (§6, §10.3) from a simple
//! `key = value` text configuration file.
//!
//! This intentionally does not reach for a schema-macro config crate: the
//! core's only contract with configuration is "hand the `StorageContext` a
//! fully validated, typed [`Config`]". Unknown keys are rejected and
//! malformed values fail fast, before a single storage file is opened,
//! mirroring the fail-fast style of the section-config loaders elsewhere in
//! this codebase (see `pbs-config::remote`) without requiring their
//! schema-derive machinery.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Error};

use nc_api_types::{PeerId, SlotId};

/// `storage.*` keys (§6).
#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub path: PathBuf,
    pub prefix: String,
    pub each_file_size: u64,
    pub max_garbage_pct: u32,
    pub min_storage_size: u64,
    pub gc_batch_size: usize,
    pub sync_time_period: Duration,
    pub disk_free_limit: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: PathBuf::from(nc_buildcfg::NETCACHE_STATE_DIR),
            prefix: nc_buildcfg::DEFAULT_STORAGE_PREFIX.to_string(),
            each_file_size: 100 * MIB,
            max_garbage_pct: 50,
            min_storage_size: 10 * GIB,
            gc_batch_size: 500,
            sync_time_period: Duration::from_secs(3),
            disk_free_limit: 5 * GIB,
        }
    }
}

/// `mirror.*` keys (§6), including the statically configured peer list.
#[derive(Clone, Debug)]
pub struct MirrorConfig {
    /// `(peer, slots served by that peer)`, parsed from `mirror.server_<i>` /
    /// `mirror.srv_slots_<i>` pairs.
    pub peers: Vec<(PeerId, Vec<SlotId>)>,
    pub cnt_slot_buckets: u32,
    pub max_active_syncs: usize,
    pub max_syncs_one_server: usize,
    pub max_peer_connections: usize,
    pub max_peer_bg_connections: usize,
    pub peer_errors_for_throttle: u32,
    pub peer_throttle_period: Duration,
    pub max_instant_queue_size: usize,
    pub small_blob_max_size: u64,
    pub max_slot_log_records: usize,
    pub deferred_sync_interval: Duration,
    pub network_error_timeout: Duration,
    pub max_blob_size_sync: u64,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        MirrorConfig {
            peers: Vec::new(),
            cnt_slot_buckets: 10,
            max_active_syncs: 4,
            max_syncs_one_server: 2,
            max_peer_connections: 100,
            max_peer_bg_connections: 50,
            peer_errors_for_throttle: 10,
            peer_throttle_period: Duration::from_secs(10),
            max_instant_queue_size: 10_000,
            small_blob_max_size: 100 * KB,
            max_slot_log_records: 100_000,
            deferred_sync_interval: Duration::from_secs(10),
            network_error_timeout: Duration::from_secs(300),
            max_blob_size_sync: GIB,
        }
    }
}

/// Top level, fully validated configuration for one node.
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub storage: StorageConfig,
    pub mirror: MirrorConfig,
    /// This node's own identity among `mirror.peers`.
    pub self_peer: Option<PeerId>,
    /// The fixed set of slots this node serves; immutable after startup (§9).
    pub self_slots: Vec<SlotId>,
    pub max_slot: SlotId,
}

const KB: u64 = 1000;
const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * 1024 * 1024;

fn parse_size(raw: &str) -> Result<u64, Error> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    let (number, mult) = if let Some(n) = lower.strip_suffix("kb") {
        (n, KB)
    } else if let Some(n) = lower.strip_suffix("mb") {
        (n, MIB)
    } else if let Some(n) = lower.strip_suffix("gb") {
        (n, GIB)
    } else {
        (lower.as_str(), 1)
    };
    let number: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid size value '{raw}'"))?;
    Ok(number * mult)
}

fn parse_duration(raw: &str) -> Result<Duration, Error> {
    let raw = raw.trim();
    let lower = raw.to_ascii_lowercase();
    let (number, mult) = if let Some(n) = lower.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = lower.strip_suffix('s') {
        (n, 1000)
    } else {
        (lower.as_str(), 1000)
    };
    let number: u64 = number
        .trim()
        .parse()
        .with_context(|| format!("invalid duration value '{raw}'"))?;
    Ok(Duration::from_millis(number * mult))
}

fn parse_slot_list(raw: &str) -> Result<Vec<SlotId>, Error> {
    let mut slots = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: SlotId = lo.trim().parse().context("invalid slot range start")?;
            let hi: SlotId = hi.trim().parse().context("invalid slot range end")?;
            if lo > hi {
                bail!("invalid slot range '{part}': start after end");
            }
            slots.extend(lo..=hi);
        } else {
            slots.push(part.parse().with_context(|| format!("invalid slot id '{part}'"))?);
        }
    }
    Ok(slots)
}

/// Parse `text` (the contents of a `key = value` config file) into raw
/// key/value rows, skipping blank lines and `#` comments.
fn parse_lines(text: &str) -> Result<BTreeMap<String, String>, Error> {
    let mut rows = BTreeMap::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .with_context(|| format!("line {}: expected 'key = value', got '{line}'", lineno + 1))?;
        rows.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(rows)
}

/// Recognised configuration keys. Anything else in the file is an error.
const KNOWN_KEYS: &[&str] = &[
    "storage.path",
    "storage.prefix",
    "storage.each_file_size",
    "storage.max_garbage_pct",
    "storage.min_storage_size",
    "storage.gc_batch_size",
    "storage.sync_time_period",
    "storage.disk_free_limit",
    "mirror.self_peer",
    "mirror.self_slots",
    "mirror.max_slot",
    "mirror.cnt_slot_buckets",
    "mirror.max_active_syncs",
    "mirror.max_syncs_one_server",
    "mirror.max_peer_connections",
    "mirror.max_peer_bg_connections",
    "mirror.peer_errors_for_throttle",
    "mirror.peer_throttle_period",
    "mirror.max_instant_queue_size",
    "mirror.small_blob_max_size",
    "mirror.max_slot_log_records",
    "mirror.deferred_sync_interval",
    "mirror.network_error_timeout",
    "mirror.max_blob_size_sync",
];

fn is_peer_key(key: &str) -> bool {
    key.starts_with("mirror.server_") || key.starts_with("mirror.srv_slots_")
}

/// Parse and validate a complete configuration file's contents.
///
/// Errors are reported with enough line context to diagnose a typo before
/// the engine ever opens a storage file, per the fail-fast contract in §10.3.
pub fn parse(text: &str) -> Result<Config, Error> {
    let rows = parse_lines(text)?;

    for key in rows.keys() {
        if !KNOWN_KEYS.contains(&key.as_str()) && !is_peer_key(key) {
            bail!("unknown configuration key '{key}'");
        }
    }

    let mut cfg = Config::default();
    cfg.max_slot = 1024;

    if let Some(v) = rows.get("storage.path") {
        cfg.storage.path = PathBuf::from(v);
    }
    if let Some(v) = rows.get("storage.prefix") {
        cfg.storage.prefix = v.clone();
    }
    if let Some(v) = rows.get("storage.each_file_size") {
        cfg.storage.each_file_size = parse_size(v)?;
    }
    if let Some(v) = rows.get("storage.max_garbage_pct") {
        cfg.storage.max_garbage_pct = v.parse().context("invalid storage.max_garbage_pct")?;
    }
    if let Some(v) = rows.get("storage.min_storage_size") {
        cfg.storage.min_storage_size = parse_size(v)?;
    }
    if let Some(v) = rows.get("storage.gc_batch_size") {
        cfg.storage.gc_batch_size = v.parse().context("invalid storage.gc_batch_size")?;
    }
    if let Some(v) = rows.get("storage.sync_time_period") {
        cfg.storage.sync_time_period = parse_duration(v)?;
    }
    if let Some(v) = rows.get("storage.disk_free_limit") {
        cfg.storage.disk_free_limit = parse_size(v)?;
    }

    if let Some(v) = rows.get("mirror.self_peer") {
        cfg.self_peer = Some(PeerId::from(v.as_str()));
    }
    if let Some(v) = rows.get("mirror.self_slots") {
        cfg.self_slots = parse_slot_list(v)?;
    }
    if let Some(v) = rows.get("mirror.max_slot") {
        cfg.max_slot = v.parse().context("invalid mirror.max_slot")?;
    }
    if let Some(v) = rows.get("mirror.cnt_slot_buckets") {
        cfg.mirror.cnt_slot_buckets = v.parse().context("invalid mirror.cnt_slot_buckets")?;
    }
    if let Some(v) = rows.get("mirror.max_active_syncs") {
        cfg.mirror.max_active_syncs = v.parse().context("invalid mirror.max_active_syncs")?;
    }
    if let Some(v) = rows.get("mirror.max_syncs_one_server") {
        cfg.mirror.max_syncs_one_server =
            v.parse().context("invalid mirror.max_syncs_one_server")?;
    }
    if let Some(v) = rows.get("mirror.max_peer_connections") {
        cfg.mirror.max_peer_connections =
            v.parse().context("invalid mirror.max_peer_connections")?;
    }
    if let Some(v) = rows.get("mirror.max_peer_bg_connections") {
        cfg.mirror.max_peer_bg_connections =
            v.parse().context("invalid mirror.max_peer_bg_connections")?;
    }
    if let Some(v) = rows.get("mirror.peer_errors_for_throttle") {
        cfg.mirror.peer_errors_for_throttle =
            v.parse().context("invalid mirror.peer_errors_for_throttle")?;
    }
    if let Some(v) = rows.get("mirror.peer_throttle_period") {
        cfg.mirror.peer_throttle_period = parse_duration(v)?;
    }
    if let Some(v) = rows.get("mirror.max_instant_queue_size") {
        cfg.mirror.max_instant_queue_size =
            v.parse().context("invalid mirror.max_instant_queue_size")?;
    }
    if let Some(v) = rows.get("mirror.small_blob_max_size") {
        cfg.mirror.small_blob_max_size = parse_size(v)?;
    }
    if let Some(v) = rows.get("mirror.max_slot_log_records") {
        cfg.mirror.max_slot_log_records =
            v.parse().context("invalid mirror.max_slot_log_records")?;
    }
    if let Some(v) = rows.get("mirror.deferred_sync_interval") {
        cfg.mirror.deferred_sync_interval = parse_duration(v)?;
    }
    if let Some(v) = rows.get("mirror.network_error_timeout") {
        cfg.mirror.network_error_timeout = parse_duration(v)?;
    }
    if let Some(v) = rows.get("mirror.max_blob_size_sync") {
        cfg.mirror.max_blob_size_sync = parse_size(v)?;
    }

    cfg.mirror.peers = collect_peers(&rows)?;

    if !cfg.storage.path.is_absolute() {
        bail!(
            "storage.path must be absolute, got '{}'",
            cfg.storage.path.display()
        );
    }

    Ok(cfg)
}

fn collect_peers(rows: &BTreeMap<String, String>) -> Result<Vec<(PeerId, Vec<SlotId>)>, Error> {
    let mut servers: HashMap<u32, String> = HashMap::new();
    let mut slot_lists: HashMap<u32, String> = HashMap::new();

    for (key, value) in rows {
        if let Some(idx) = key.strip_prefix("mirror.server_") {
            let idx: u32 = idx.parse().with_context(|| format!("invalid peer index in '{key}'"))?;
            servers.insert(idx, value.clone());
        } else if let Some(idx) = key.strip_prefix("mirror.srv_slots_") {
            let idx: u32 = idx.parse().with_context(|| format!("invalid peer index in '{key}'"))?;
            slot_lists.insert(idx, value.clone());
        }
    }

    let mut indices: Vec<u32> = servers.keys().copied().collect();
    indices.sort_unstable();

    let mut peers = Vec::with_capacity(indices.len());
    for idx in indices {
        let host = servers.remove(&idx).expect("index came from servers map");
        let slots = match slot_lists.remove(&idx) {
            Some(raw) => parse_slot_list(&raw)?,
            None => bail!("mirror.server_{idx} has no matching mirror.srv_slots_{idx}"),
        };
        peers.push((PeerId::from(host), slots));
    }

    Ok(peers)
}

/// Load and parse a configuration file from disk.
pub fn load(path: &Path) -> Result<Config, Error> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    parse(&text).with_context(|| format!("parsing config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_file_is_minimal() {
        let cfg = parse("storage.path = /var/lib/netcache\n").unwrap();
        assert_eq!(cfg.storage.each_file_size, 100 * MIB);
        assert_eq!(cfg.storage.max_garbage_pct, 50);
        assert_eq!(cfg.mirror.max_peer_connections, 100);
        assert!(cfg.mirror.peers.is_empty());
    }

    #[test]
    fn parses_peer_list_and_sizes() {
        let text = "
            storage.path = /var/lib/netcache
            storage.each_file_size = 200Mb
            mirror.self_peer = node-a:9000
            mirror.self_slots = 1-4,9
            mirror.server_0 = node-b:9000
            mirror.srv_slots_0 = 1,2,3
            mirror.server_1 = node-c:9000
            mirror.srv_slots_1 = 4-6
        ";
        let cfg = parse(text).unwrap();
        assert_eq!(cfg.storage.each_file_size, 200 * MIB);
        assert_eq!(cfg.self_slots, vec![1, 2, 3, 4, 9]);
        assert_eq!(cfg.mirror.peers.len(), 2);
        assert_eq!(cfg.mirror.peers[0].0, PeerId::from("node-b:9000"));
        assert_eq!(cfg.mirror.peers[0].1, vec![1, 2, 3]);
        assert_eq!(cfg.mirror.peers[1].1, vec![4, 5, 6]);
    }

    #[test]
    fn rejects_unknown_key() {
        let err = parse("storage.bogus = 1\n").unwrap_err();
        assert!(err.to_string().contains("unknown configuration key"));
    }

    #[test]
    fn rejects_relative_path() {
        let err = parse("storage.path = relative/dir\n").unwrap_err();
        assert!(err.to_string().contains("must be absolute"));
    }

    #[test]
    fn peer_without_slots_is_rejected() {
        let text = "mirror.server_0 = node-b:9000\n";
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("srv_slots_0"));
    }
}
