//! Per-peer TCP connection reuse and failure-based throttling (§4.7).
//!
//! Idle connections are kept in a LIFO deque (replacing the source's
//! intrusive list per §9); a semaphore pair bounds total vs. background
//! concurrency so foreground client traffic always has headroom.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use nc_api_types::PeerId;
use nc_tools::time::now_secs;

struct PeerState {
    idle: Mutex<VecDeque<TcpStream>>,
    total_permits: Arc<Semaphore>,
    bg_permits: Arc<Semaphore>,
    nw_errors: AtomicU32,
    throttled_until: Mutex<Option<i64>>,
    /// Wall-clock time of the last successful exchange, `None` until the
    /// first one; drives the `NetworkErrorTimeout` fail-open in §4.7.
    last_success: Mutex<Option<i64>>,
}

impl PeerState {
    fn new(max_total: usize, max_bg: usize) -> Self {
        PeerState {
            idle: Mutex::new(VecDeque::new()),
            total_permits: Arc::new(Semaphore::new(max_total)),
            bg_permits: Arc::new(Semaphore::new(max_bg)),
            nw_errors: AtomicU32::new(0),
            throttled_until: Mutex::new(None),
            last_success: Mutex::new(None),
        }
    }

    fn is_throttled(&self, now: i64) -> bool {
        match *self.throttled_until.lock() {
            Some(until) if now < until => true,
            Some(_) => {
                *self.throttled_until.lock() = None;
                false
            }
            None => false,
        }
    }
}

/// A foreground or background connection-budget permit plus the reusable
/// socket it guards; returning the handle to the pool via [`Drop`] (when the
/// caller didn't take the socket out) would require `TcpStream: Clone`,
/// which it isn't, so callers explicitly call [`PeerConnectionPool::release`].
pub struct ConnGuard {
    pub stream: TcpStream,
    _permit: OwnedSemaphorePermit,
}

/// Per-peer pool of idle outbound connections with `CntErrorsToThrottle` /
/// `PeerThrottlePeriod` failure throttling (§4.7).
pub struct PeerConnectionPool {
    max_total: usize,
    max_bg: usize,
    errors_to_throttle: u32,
    throttle_period: Duration,
    peers: Mutex<HashMap<PeerId, Arc<PeerState>>>,
}

impl PeerConnectionPool {
    pub fn new(max_total: usize, max_bg: usize, errors_to_throttle: u32, throttle_period: Duration) -> Self {
        PeerConnectionPool {
            max_total,
            max_bg,
            errors_to_throttle,
            throttle_period,
            peers: Mutex::new(HashMap::new()),
        }
    }

    fn peer_state(&self, peer: &PeerId) -> Arc<PeerState> {
        let mut peers = self.peers.lock();
        peers
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(PeerState::new(self.max_total, self.max_bg)))
            .clone()
    }

    /// Acquire a connection to `peer` for foreground (client-initiated)
    /// traffic: only the total-connection budget is checked, it never
    /// competes with background traffic's own `bg_permits`.
    pub async fn acquire_foreground(&self, peer: &PeerId) -> Result<ConnGuard> {
        self.acquire(peer, false).await
    }

    /// Acquire a connection for mirror/sync background traffic, capped by
    /// both the total and the smaller `MaxPeerBGConns` budget (§4.6).
    pub async fn acquire_background(&self, peer: &PeerId) -> Result<ConnGuard> {
        self.acquire(peer, true).await
    }

    async fn acquire(&self, peer: &PeerId, background: bool) -> Result<ConnGuard> {
        let state = self.peer_state(peer);
        if state.is_throttled(now_secs()) {
            bail!(nc_api_types::StorageError::Timeout(format!("peer {peer} is throttled")));
        }

        let _bg_permit = if background {
            Some(
                state
                    .bg_permits
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow::anyhow!("bg semaphore closed"))?,
            )
        } else {
            None
        };
        let total_permit = state
            .total_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| anyhow::anyhow!("total semaphore closed"))?;

        if let Some(stream) = state.idle.lock().pop_back() {
            return Ok(ConnGuard { stream, _permit: total_permit });
        }

        match TcpStream::connect(peer_addr(peer)).await {
            Ok(stream) => {
                stream.set_nodelay(true).ok();
                Ok(ConnGuard { stream, _permit: total_permit })
            }
            Err(err) => {
                self.record_failure(peer);
                Err(err.into())
            }
        }
    }

    /// Return a still-healthy connection to the idle pool (LIFO) instead of
    /// closing it.
    pub fn release(&self, peer: &PeerId, guard: ConnGuard) {
        let state = self.peer_state(peer);
        state.idle.lock().push_back(guard.stream);
    }

    /// Register a connect or I/O failure; throttles the peer once
    /// `CntErrorsToThrottle` consecutive failures accumulate.
    pub fn record_failure(&self, peer: &PeerId) {
        let state = self.peer_state(peer);
        let count = state.nw_errors.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= self.errors_to_throttle {
            let until = now_secs() + self.throttle_period.as_secs() as i64;
            *state.throttled_until.lock() = Some(until);
            log::warn!("peer {peer} throttled for {:?} after {count} network errors", self.throttle_period);
        }
    }

    /// Reset the failure counter after a successful exchange.
    pub fn record_success(&self, peer: &PeerId) {
        let state = self.peer_state(peer);
        state.nw_errors.store(0, Ordering::Release);
        *state.last_success.lock() = Some(now_secs());
    }

    pub fn is_throttled(&self, peer: &PeerId) -> bool {
        self.peer_state(peer).is_throttled(now_secs())
    }

    /// Seconds since the last successful exchange with `peer`, or `None` if
    /// there has never been one (a brand-new node at startup is treated the
    /// same as "just failed now" by the caller, not as "never unreachable").
    pub fn seconds_since_success(&self, peer: &PeerId, now: i64) -> Option<i64> {
        self.peer_state(peer).last_success.lock().map(|last| now - last)
    }
}

fn peer_addr(peer: &PeerId) -> String {
    peer.0.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_engages_after_threshold_and_expires() {
        let pool = PeerConnectionPool::new(10, 5, 3, Duration::from_secs(0));
        let peer = PeerId::from("x:1");
        assert!(!pool.is_throttled(&peer));
        pool.record_failure(&peer);
        pool.record_failure(&peer);
        assert!(!pool.is_throttled(&peer));
        pool.record_failure(&peer);
        assert!(pool.is_throttled(&peer));
        // zero-length throttle period: next check clears the expired state.
        assert!(!pool.is_throttled(&peer));
    }

    #[test]
    fn success_resets_failure_counter() {
        let pool = PeerConnectionPool::new(10, 5, 2, Duration::from_secs(60));
        let peer = PeerId::from("x:1");
        pool.record_failure(&peer);
        pool.record_success(&peer);
        pool.record_failure(&peer);
        assert!(!pool.is_throttled(&peer), "counter should have reset on success");
    }
}
