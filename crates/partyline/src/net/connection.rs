use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use super::tracking::{AckAccumulator, DedupWindow, PendingList};

pub type PeerId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer registry full ({max_peers} peers), refusing {addr}")]
pub struct RegistryError {
    pub addr: SocketAddr,
    pub max_peers: usize,
}

/// Everything the local node knows about one remote endpoint.
#[derive(Debug)]
pub struct PeerConnection {
    pub id: PeerId,
    pub addr: SocketAddr,
    /// Empty until the peer's JOIN has been processed.
    pub name: String,
    pub last_sent: Instant,
    pub last_received: Instant,
    pub consecutive_timeouts: u32,
    pub pending: PendingList,
    pub acks: AckAccumulator,
    pub dedup: DedupWindow,
}

impl PeerConnection {
    pub fn new(id: PeerId, addr: SocketAddr, dedup_window: usize, now: Instant) -> Self {
        Self {
            id,
            addr,
            name: String::new(),
            last_sent: now,
            last_received: now,
            consecutive_timeouts: 0,
            pending: PendingList::new(),
            acks: AckAccumulator::new(),
            dedup: DedupWindow::new(dedup_window),
        }
    }

    pub fn has_joined(&self) -> bool {
        !self.name.is_empty()
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Display name, or the address while the peer has not joined yet.
    pub fn label(&self) -> String {
        if self.has_joined() {
            self.name.clone()
        } else {
            self.addr.to_string()
        }
    }
}

#[derive(Debug)]
pub struct PeerRegistry {
    peers_by_addr: HashMap<SocketAddr, PeerId>,
    peers: HashMap<PeerId, PeerConnection>,
    next_peer_id: PeerId,
    max_peers: usize,
    dedup_window: usize,
}

impl PeerRegistry {
    pub fn new(max_peers: usize, dedup_window: usize) -> Self {
        Self {
            peers_by_addr: HashMap::new(),
            peers: HashMap::new(),
            next_peer_id: 1,
            max_peers,
            dedup_window,
        }
    }

    /// Returns the connection for `addr`, registering a fresh one if the
    /// address has not been seen before. The flag is `true` when created.
    pub fn connection_for(
        &mut self,
        addr: SocketAddr,
        now: Instant,
    ) -> Result<(&mut PeerConnection, bool), RegistryError> {
        let (peer_id, created) = match self.peers_by_addr.get(&addr) {
            Some(&peer_id) if self.peers.contains_key(&peer_id) => (peer_id, false),
            _ => {
                if self.peers.len() >= self.max_peers {
                    return Err(RegistryError {
                        addr,
                        max_peers: self.max_peers,
                    });
                }

                let peer_id = self.next_peer_id;
                self.next_peer_id += 1;
                self.peers_by_addr.insert(addr, peer_id);
                (peer_id, true)
            }
        };

        let dedup_window = self.dedup_window;
        let peer = self
            .peers
            .entry(peer_id)
            .or_insert_with(|| PeerConnection::new(peer_id, addr, dedup_window, now));

        Ok((peer, created))
    }

    pub fn get_by_addr(&self, addr: &SocketAddr) -> Option<&PeerConnection> {
        self.peers_by_addr
            .get(addr)
            .and_then(|id| self.peers.get(id))
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut PeerConnection> {
        if let Some(&id) = self.peers_by_addr.get(addr) {
            self.peers.get_mut(&id)
        } else {
            None
        }
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&PeerConnection> {
        self.peers.get(&peer_id)
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers_by_addr.contains_key(addr)
    }

    /// Tears down all state kept for `addr`. Removing an unknown address is a no-op.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<PeerConnection> {
        let peer_id = self.peers_by_addr.remove(addr)?;
        self.peers.remove(&peer_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    /// Addresses in registration order.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        let mut peers: Vec<&PeerConnection> = self.peers.values().collect();
        peers.sort_by_key(|p| p.id);
        peers.into_iter().map(|p| p.addr).collect()
    }

    /// Display names of joined peers in registration order.
    pub fn joined_names(&self) -> Vec<String> {
        let mut joined: Vec<&PeerConnection> =
            self.peers.values().filter(|p| p.has_joined()).collect();
        joined.sort_by_key(|p| p.id);
        joined.into_iter().map(|p| p.name.clone()).collect()
    }

    pub fn joined_count(&self) -> usize {
        self.peers.values().filter(|p| p.has_joined()).count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.peers_by_addr.clear();
    }
}
