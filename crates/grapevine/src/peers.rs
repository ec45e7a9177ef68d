//! Peer table
//!
//! One descriptor per peer id, ordered by the per-peer `lifetime` logical
//! clock. Merges are monotone: a remote descriptor is applied only when its
//! lifetime is strictly greater than what we hold, so replayed or reordered
//! `list` messages cannot roll the table back.

use grapevine_core::{Peer, PeerId};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use tracing::debug;

/// How a remote descriptor was applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Previously unknown peer; a failure timer should be armed.
    Inserted,
    /// Known peer advanced; the failure timer should be reset.
    Updated { revived: bool },
    /// Stale descriptor, nothing changed.
    Ignored,
    /// The descriptor describes this node itself.
    SelfEntry,
}

/// Map of peer id to descriptor, including the local node's own entry.
pub struct PeerTable {
    local_id: PeerId,
    peers: RwLock<HashMap<PeerId, Peer>>,
}

impl PeerTable {
    /// Create a table seeded with the local descriptor.
    pub fn new(local: Peer) -> Self {
        let local_id = local.id;
        let mut peers = HashMap::new();
        peers.insert(local_id, local);
        Self {
            local_id,
            peers: RwLock::new(peers),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Snapshot of the local descriptor.
    pub fn local(&self) -> Peer {
        self.peers.read()[&self.local_id].clone()
    }

    /// Record the actual bound address once the listener is up.
    pub fn set_local_addr(&self, addr: std::net::SocketAddr) {
        if let Some(local) = self.peers.write().get_mut(&self.local_id) {
            local.addr = addr;
        }
    }

    /// Bump the local logical clock and return the new value.
    pub fn bump_local(&self) -> u64 {
        let mut peers = self.peers.write();
        let local = peers.get_mut(&self.local_id).expect("local entry present");
        local.lifetime += 1;
        local.lifetime
    }

    /// Current local lifetime.
    pub fn local_lifetime(&self) -> u64 {
        self.peers.read()[&self.local_id].lifetime
    }

    /// Apply a remote descriptor under the lifetime-ordering rules.
    ///
    /// The local entry is special: a strictly greater remote lifetime is
    /// adopted (a restarted node catching up with the cluster's memory of
    /// itself), but the entry stays alive and never arms a timer.
    pub fn add_or_merge(&self, remote: Peer) -> MergeOutcome {
        let mut peers = self.peers.write();

        if remote.id == self.local_id {
            let local = peers.get_mut(&self.local_id).expect("local entry present");
            if remote.lifetime > local.lifetime {
                local.lifetime = remote.lifetime;
            }
            return MergeOutcome::SelfEntry;
        }

        match peers.get_mut(&remote.id) {
            None => {
                debug!(peer = %remote.id, addr = %remote.addr, "discovered peer");
                peers.insert(remote.id, remote);
                MergeOutcome::Inserted
            }
            Some(existing) if remote.lifetime > existing.lifetime => {
                let revived = remote.alive && !existing.alive;
                existing.lifetime = remote.lifetime;
                existing.addr = remote.addr;
                existing.timeout_ms = remote.timeout_ms;
                existing.heartbeat_ms = remote.heartbeat_ms;
                existing.list_ms = remote.list_ms;
                existing.hash_ms = remote.hash_ms;
                if revived {
                    existing.alive = true;
                    debug!(peer = %remote.id, "peer revived");
                }
                MergeOutcome::Updated { revived }
            }
            Some(_) => MergeOutcome::Ignored,
        }
    }

    /// Mark a peer dead, keeping the descriptor so a later higher-lifetime
    /// message can revive it. Returns whether the flag changed.
    pub fn mark_dead(&self, id: &PeerId) -> bool {
        if *id == self.local_id {
            return false;
        }
        let mut peers = self.peers.write();
        match peers.get_mut(id) {
            Some(peer) if peer.alive => {
                peer.alive = false;
                true
            }
            _ => false,
        }
    }

    /// One peer chosen uniformly among live non-self entries.
    ///
    /// Up to ten uniform draws over the keyset; absence after that means
    /// "skip this round" rather than scanning a mostly-dead table.
    pub fn random_alive_peer(&self) -> Option<Peer> {
        let peers = self.peers.read();
        if peers.len() <= 1 {
            return None;
        }
        let ids: Vec<PeerId> = peers.keys().copied().collect();
        let mut rng = rand::thread_rng();
        for _ in 0..10 {
            let id = ids[rng.gen_range(0..ids.len())];
            if id == self.local_id {
                continue;
            }
            let peer = &peers[&id];
            if peer.alive {
                return Some(peer.clone());
            }
        }
        None
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    /// Full table snapshot, local entry included.
    pub fn snapshot(&self) -> HashMap<PeerId, Peer> {
        self.peers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn alive_count(&self) -> usize {
        self.peers.read().values().filter(|p| p.alive).count()
    }
}
