//! Cluster-facing machinery that sits above the single-node storage engine
//! (§4.5-§4.8): which peers serve which slots, how outbound mirror traffic
//! is queued and throttled, and how two nodes reconcile a slot's contents.

pub mod distribution_map;
pub mod mirror_dispatcher;
pub mod peer_pool;
pub mod sync_controller;

pub use distribution_map::DistributionMap;
pub use mirror_dispatcher::{BlobSizeHint, MirrorDispatcher, MirrorEvent};
pub use peer_pool::{ConnGuard, PeerConnectionPool};
pub use sync_controller::{SyncController, SyncOutcome, SyncTransport};
