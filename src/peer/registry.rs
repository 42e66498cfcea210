use super::error::PeerError;
use super::peer_id::PeerId;
use crate::pieces::ChunkKey;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::SocketAddr;
use tokio::sync::mpsc;

/// Commands delivered to a session from the rest of the torrent.
///
/// Reverse-direction events (HAVE broadcast, endgame cancels, choke
/// policy decisions) arrive asynchronously so sessions never wait on each
/// other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCommand {
    /// We committed a piece; send HAVE unless the remote already has it.
    Have(u32),
    /// Another peer delivered this chunk first; cancel ours.
    Cancel(ChunkKey),
    /// Choke-policy decision for this peer.
    SetChoke(bool),
    /// Tear the session down.
    Shutdown,
}

/// Addressing handle for a live session.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    cmd: mpsc::UnboundedSender<PeerCommand>,
}

impl PeerHandle {
    pub fn new(peer_id: PeerId, addr: SocketAddr, cmd: mpsc::UnboundedSender<PeerCommand>) -> Self {
        Self { peer_id, addr, cmd }
    }

    /// Delivers a command; returns false if the session is gone.
    pub fn send(&self, cmd: PeerCommand) -> bool {
        self.cmd.send(cmd).is_ok()
    }
}

/// Per-torrent index of active peer sessions.
pub struct PeerRegistry {
    max_peers: usize,
    peers: DashMap<PeerId, PeerHandle>,
    by_addr: DashMap<SocketAddr, PeerId>,
    bad: Mutex<HashSet<(SocketAddr, PeerId)>>,
}

impl PeerRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            max_peers,
            peers: DashMap::new(),
            by_addr: DashMap::new(),
            bad: Mutex::new(HashSet::new()),
        }
    }

    /// Admits a session. A second connection for the same peer id or
    /// address is refused, as is any connection past the slot limit.
    pub fn register(&self, handle: PeerHandle) -> Result<(), PeerError> {
        if self.peers.len() >= self.max_peers {
            return Err(PeerError::TooManyPeers);
        }
        if self.peers.contains_key(&handle.peer_id) || self.by_addr.contains_key(&handle.addr) {
            return Err(PeerError::DuplicatePeer);
        }
        self.by_addr.insert(handle.addr, handle.peer_id);
        self.peers.insert(handle.peer_id, handle);
        Ok(())
    }

    pub fn deregister(&self, peer_id: PeerId) {
        if let Some((_, handle)) = self.peers.remove(&peer_id) {
            self.by_addr.remove(&handle.addr);
        }
    }

    /// Fans a committed piece out to every session; each session applies
    /// its own suppression.
    pub fn broadcast_have(&self, piece: u32) {
        for entry in self.peers.iter() {
            entry.value().send(PeerCommand::Have(piece));
        }
    }

    /// Targeted endgame cancel.
    pub fn send_cancel(&self, peer_id: PeerId, key: ChunkKey) {
        if let Some(handle) = self.peers.get(&peer_id) {
            handle.send(PeerCommand::Cancel(key));
        }
    }

    /// Choke-policy entry point.
    pub fn set_choke(&self, peer_id: PeerId, choke: bool) {
        if let Some(handle) = self.peers.get(&peer_id) {
            handle.send(PeerCommand::SetChoke(choke));
        }
    }

    pub fn shutdown_all(&self) {
        for entry in self.peers.iter() {
            entry.value().send(PeerCommand::Shutdown);
        }
    }

    /// Fire-and-forget hint for the reconnection policy.
    pub fn enter_bad(&self, addr: SocketAddr, peer_id: PeerId) {
        self.bad.lock().insert((addr, peer_id));
    }

    pub fn is_bad(&self, addr: SocketAddr) -> bool {
        self.bad.lock().iter().any(|(a, _)| *a == addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, peer_id: PeerId) -> bool {
        self.peers.contains_key(&peer_id)
    }
}
