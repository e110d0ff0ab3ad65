//! Process-level wiring for a netcache node (§10.4): loads configuration,
//! builds the `StorageContext` and cluster machinery, and starts the
//! long-lived background loops. The binary crate (`src/main.rs`) is a thin
//! shell around [`Node::start`].
//!
//! The wire protocol and the listening socket are out of scope here (they
//! belong to an external TCP acceptor); this crate only constructs the
//! [`SyncTransport`] seam that acceptor plugs into.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use nc_cluster::{DistributionMap, MirrorDispatcher, PeerConnectionPool, SyncController, SyncTransport};
use nc_config::Config;
use nc_storage::context::StorageContext;

/// Default config path under [`nc_buildcfg::CONFIGDIR`].
pub fn default_config_path() -> PathBuf {
    Path::new(nc_buildcfg::CONFIGDIR).join(nc_buildcfg::DEFAULT_CONFIG_FILE)
}

pub fn load_config(path: &Path) -> Result<Config> {
    nc_config::load(path).with_context(|| format!("loading configuration from {}", path.display()))
}

/// A fully assembled, running node: the storage engine plus the cluster
/// machinery layered on top of it (§2 data flow).
pub struct Node {
    pub ctx: Arc<StorageContext>,
    pub dist: Arc<DistributionMap>,
    pub pool: Arc<PeerConnectionPool>,
    pub dispatcher: Arc<MirrorDispatcher>,
    pub sync: Arc<SyncController>,
    background: Vec<std::thread::JoinHandle<()>>,
}

impl Node {
    /// Build a node and start its background loops (record-heap writer, GC,
    /// sync orchestrator). `transport` is the injected peer-protocol
    /// collaborator; a real deployment hands in the actual wire client,
    /// tests and this skeleton hand in a stand-in.
    pub fn start(config: Config, transport: Arc<dyn SyncTransport>) -> Result<Self> {
        let mirror_cfg = config.mirror.clone();
        let dist = Arc::new(DistributionMap::from_config(&config));
        let pool = Arc::new(PeerConnectionPool::new(
            mirror_cfg.max_peer_connections,
            mirror_cfg.max_peer_bg_connections,
            mirror_cfg.peer_errors_for_throttle,
            mirror_cfg.peer_throttle_period,
        ));
        let dispatcher =
            Arc::new(MirrorDispatcher::new(mirror_cfg.small_blob_max_size, mirror_cfg.max_instant_queue_size));
        let ctx = Arc::new(StorageContext::open(config).context("opening storage context")?);
        let sync = Arc::new(SyncController::new(ctx.clone(), dist.clone(), pool.clone(), transport));
        let background = ctx.clone().spawn_background_threads();

        Ok(Node { ctx, dist, pool, dispatcher, sync, background })
    }

    /// Run the sync controller's startup reconciliation (§4.8: every
    /// self-served slot against every peer serving it) followed by periodic
    /// passes until `self.ctx.stopped` is set.
    pub async fn run_sync_loop(&self, period: std::time::Duration) {
        self.sync.run_initial_sync(nc_tools::time::now_secs()).await;
        while !self.ctx.stopped.load(std::sync::atomic::Ordering::Acquire) {
            tokio::time::sleep(period).await;
            if self.ctx.stopped.load(std::sync::atomic::Ordering::Acquire) {
                break;
            }
            // Seconds, not microseconds: this `now` feeds `dead_time = now +
            // ttl` (blob_accessor::open_writer), and the GC thread expires
            // blobs by comparing dead_time against now_secs().
            let now = nc_tools::time::now_secs();
            for slot in self.dist.self_slots() {
                for peer in self.dist.get_servers_for_slot(slot) {
                    self.sync.sync_once(&peer, slot, now).await;
                }
            }
        }
    }

    /// Flip the shutdown flag and join the background storage threads.
    pub fn shutdown(mut self) {
        self.ctx.shutdown();
        for handle in self.background.drain(..) {
            let _ = handle.join();
        }
    }
}
