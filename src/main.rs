//! `netcached`: process entry point (§10.4).
//!
//! Loads the config file named by `argv[1]` (or the default path under
//! `/etc/netcache`), opens the storage engine, and runs its background
//! loops plus the sync controller until told to stop. Binding the client
//! listening socket and speaking the peer wire protocol are an external
//! acceptor's job; this binary wires up everything around that seam.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::BoxFuture;

use nc_api_types::{exit_code, PeerId, SlotId};
use nc_cluster::sync_controller::{BlobSummary, FetchedBlob, SyncTransport};
use nc_storage::sync_log::{NeedsFullResync, SyncEvent};

use netcache::Node;

/// Placeholder for the out-of-scope wire protocol: every call fails, which
/// the sync controller treats as an unreachable peer (§4.7 fail-open). The
/// real acceptor replaces this with a client that actually talks to peers.
struct UnwiredTransport;

impl SyncTransport for UnwiredTransport {
    fn fetch_events<'a>(
        &'a self,
        _peer: &'a PeerId,
        _slot: SlotId,
        _since_rec_no: u64,
    ) -> BoxFuture<'a, Result<Result<Vec<SyncEvent>, NeedsFullResync>>> {
        Box::pin(async { Err(anyhow::anyhow!("peer wire protocol not wired up")) })
    }

    fn fetch_blob_list<'a>(&'a self, _peer: &'a PeerId, _slot: SlotId) -> BoxFuture<'a, Result<Vec<BlobSummary>>> {
        Box::pin(async { Err(anyhow::anyhow!("peer wire protocol not wired up")) })
    }

    fn fetch_blob<'a>(&'a self, _peer: &'a PeerId, _slot: SlotId, _key: &'a [u8]) -> BoxFuture<'a, Result<FetchedBlob>> {
        Box::pin(async { Err(anyhow::anyhow!("peer wire protocol not wired up")) })
    }

    fn ack<'a>(&'a self, _peer: &'a PeerId, _slot: SlotId, _rec_no: u64) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Err(anyhow::anyhow!("peer wire protocol not wired up")) })
    }
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let config_path =
        std::env::args().nth(1).map(PathBuf::from).unwrap_or_else(netcache::default_config_path);

    let config = match netcache::load_config(&config_path) {
        Ok(c) => c,
        Err(err) => {
            log::error!("configuration error: {err:#}");
            std::process::exit(exit_code::CONFIG_ERROR);
        }
    };

    let node = match Node::start(config, Arc::new(UnwiredTransport)) {
        Ok(n) => n,
        Err(err) => {
            log::error!("failed to start storage engine: {err:#}");
            std::process::exit(exit_code::STORAGE_UNRECOVERABLE);
        }
    };

    log::info!("netcached started, serving slots {:?}", node.dist.self_slots());

    let sync_period = Duration::from_secs(10);
    let sync_loop = tokio::spawn({
        let ctx = node.ctx.clone();
        let dist = node.dist.clone();
        let sync = node.sync.clone();
        async move {
            sync.run_initial_sync(nc_tools::time::now_secs()).await;
            while !ctx.stopped.load(std::sync::atomic::Ordering::Acquire) {
                tokio::time::sleep(sync_period).await;
                if ctx.stopped.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
                // Seconds, not microseconds: feeds dead_time = now + ttl,
                // which the GC thread expires by comparing against now_secs().
                let now = nc_tools::time::now_secs();
                for slot in dist.self_slots() {
                    for peer in dist.get_servers_for_slot(slot) {
                        sync.sync_once(&peer, slot, now).await;
                    }
                }
            }
        }
    });

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, stopping");

    sync_loop.abort();
    node.shutdown();

    std::process::exit(exit_code::NORMAL);
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
