//! Static view of the cluster (§4.5): `slot -> peers`, `peer -> slots`, and
//! each peer's common-slot set with self, derived once from configuration
//! and swapped as a whole on reconfiguration rather than mutated in place.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::thread_rng;

use nc_api_types::{PeerId, SlotId};
use nc_config::Config;

struct Inner {
    self_peer: Option<PeerId>,
    self_slots: Vec<SlotId>,
    slot_to_peers: HashMap<SlotId, Vec<PeerId>>,
    peer_to_slots: HashMap<PeerId, Vec<SlotId>>,
    common_slots: HashMap<PeerId, Vec<SlotId>>,
}

fn build(self_peer: Option<PeerId>, self_slots: &[SlotId], peers: &[(PeerId, Vec<SlotId>)]) -> Inner {
    let mut slot_to_peers: HashMap<SlotId, Vec<PeerId>> = HashMap::new();
    let mut peer_to_slots: HashMap<PeerId, Vec<SlotId>> = HashMap::new();
    let mut common_slots: HashMap<PeerId, Vec<SlotId>> = HashMap::new();

    let self_slot_set: HashSet<SlotId> = self_slots.iter().copied().collect();

    for (peer, slots) in peers {
        peer_to_slots.insert(peer.clone(), slots.clone());
        for slot in slots {
            slot_to_peers.entry(*slot).or_default().push(peer.clone());
        }
        let common: Vec<SlotId> = slots.iter().copied().filter(|s| self_slot_set.contains(s)).collect();
        common_slots.insert(peer.clone(), common);
    }

    Inner {
        self_peer,
        self_slots: self_slots.to_vec(),
        slot_to_peers,
        peer_to_slots,
        common_slots,
    }
}

/// Held behind a reader-writer lock rather than mutated field-by-field, so a
/// reconfiguration is a single atomic pointer swap and readers never observe
/// a half-updated map (§9: "rewrite process-wide singletons as explicit
/// dependency-injected contexts").
pub struct DistributionMap {
    inner: RwLock<Arc<Inner>>,
}

impl DistributionMap {
    pub fn from_config(config: &Config) -> Self {
        let inner = build(config.self_peer.clone(), &config.self_slots, &config.mirror.peers);
        DistributionMap {
            inner: RwLock::new(Arc::new(inner)),
        }
    }

    /// Apply a reconfiguration. Self's own slot list is immutable after
    /// startup (§4.5, §9): only the peer set may change.
    pub fn reconfigure(&self, peers: &[(PeerId, Vec<SlotId>)]) -> Result<()> {
        let current = self.inner.read().clone();
        let next = build(current.self_peer.clone(), &current.self_slots, peers);
        *self.inner.write() = Arc::new(next);
        Ok(())
    }

    /// Rejects any attempt to change self's own slot list; a caller that
    /// already decided to reconfigure should check this before calling
    /// [`Self::reconfigure`] if the new self-slots differ from startup.
    pub fn validate_self_slots_unchanged(&self, proposed_self_slots: &[SlotId]) -> Result<()> {
        let current = self.inner.read();
        let mut a = current.self_slots.clone();
        let mut b = proposed_self_slots.to_vec();
        a.sort_unstable();
        b.sort_unstable();
        if a != b {
            bail!(nc_api_types::StorageError::ReconfigRejected(
                "self slot list may not change after startup".into()
            ));
        }
        Ok(())
    }

    pub fn self_slots(&self) -> Vec<SlotId> {
        self.inner.read().self_slots.clone()
    }

    pub fn self_peer(&self) -> Option<PeerId> {
        self.inner.read().self_peer.clone()
    }

    pub fn is_served_locally(&self, slot: SlotId) -> bool {
        self.inner.read().self_slots.contains(&slot)
    }

    /// `GetServersForSlot(slot)`: peers serving `slot`, self's group shuffled
    /// first, then out-of-group peers shuffled (§4.5). There is no explicit
    /// peer-group concept in configuration here, so "self's group" is
    /// approximated by peers that share at least one other slot with self;
    /// ties within each half are broken by a fresh random shuffle per call.
    pub fn get_servers_for_slot(&self, slot: SlotId) -> Vec<PeerId> {
        let inner = self.inner.read();
        let Some(all) = inner.slot_to_peers.get(&slot) else {
            return Vec::new();
        };
        let mut in_group: Vec<PeerId> = Vec::new();
        let mut out_group: Vec<PeerId> = Vec::new();
        for peer in all {
            let shares_other_slot = inner
                .common_slots
                .get(peer)
                .map(|common| !common.is_empty())
                .unwrap_or(false);
            if shares_other_slot {
                in_group.push(peer.clone());
            } else {
                out_group.push(peer.clone());
            }
        }
        in_group.shuffle(&mut thread_rng());
        out_group.shuffle(&mut thread_rng());
        in_group.extend(out_group);
        in_group
    }

    pub fn peer_slots(&self, peer: &PeerId) -> Vec<SlotId> {
        self.inner.read().peer_to_slots.get(peer).cloned().unwrap_or_default()
    }

    pub fn common_slots(&self, peer: &PeerId) -> Vec<SlotId> {
        self.inner.read().common_slots.get(peer).cloned().unwrap_or_default()
    }

    pub fn all_peers(&self) -> Vec<PeerId> {
        self.inner.read().peer_to_slots.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(self_slots: Vec<SlotId>, peers: Vec<(PeerId, Vec<SlotId>)>) -> Config {
        let mut cfg = Config::default();
        cfg.self_peer = Some(PeerId::from("self"));
        cfg.self_slots = self_slots;
        cfg.mirror.peers = peers;
        cfg
    }

    #[test]
    fn slot_lookup_and_served_locally() {
        let cfg = config(
            vec![1, 2],
            vec![
                (PeerId::from("a"), vec![1, 3]),
                (PeerId::from("b"), vec![2]),
            ],
        );
        let map = DistributionMap::from_config(&cfg);
        assert!(map.is_served_locally(1));
        assert!(!map.is_served_locally(3));
        let servers = map.get_servers_for_slot(1);
        assert_eq!(servers, vec![PeerId::from("a")]);
        assert!(map.get_servers_for_slot(99).is_empty());
    }

    #[test]
    fn common_slots_is_intersection() {
        let cfg = config(vec![1, 2, 3], vec![(PeerId::from("a"), vec![2, 3, 9])]);
        let map = DistributionMap::from_config(&cfg);
        let mut common = map.common_slots(&PeerId::from("a"));
        common.sort_unstable();
        assert_eq!(common, vec![2, 3]);
    }

    #[test]
    fn reconfigure_preserves_self_slots() {
        let cfg = config(vec![1], vec![(PeerId::from("a"), vec![1])]);
        let map = DistributionMap::from_config(&cfg);
        map.reconfigure(&[(PeerId::from("a"), vec![1]), (PeerId::from("c"), vec![1])])
            .unwrap();
        assert_eq!(map.all_peers().len(), 2);
        assert_eq!(map.self_slots(), vec![1]);
    }

    #[test]
    fn rejects_self_slot_change() {
        let cfg = config(vec![1, 2], vec![]);
        let map = DistributionMap::from_config(&cfg);
        assert!(map.validate_self_slots_unchanged(&[1, 2]).is_ok());
        assert!(map.validate_self_slots_unchanged(&[1, 3]).is_err());
    }
}
