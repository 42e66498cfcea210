//! Torrent coordinator.
//!
//! Owns the authoritative bitfield and transfer counters for one torrent,
//! hosts the chunk registry, file directory, piece committer, and peer
//! registry, and wires peer sessions into them.

use crate::committer::PieceCommitter;
use crate::config::{Config, ConfigError};
use crate::peer::{run_incoming, run_outgoing, Handshake, PeerId, PeerRegistry, SessionParams};
use crate::pieces::PieceSet;
use crate::scheduler::ChunkRegistry;
use crate::storage::{FileDirectory, Layout, StorageError, TorrentFile};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What the (external) metainfo parser yields for one torrent.
#[derive(Debug, Clone)]
pub struct TorrentMeta {
    pub name: String,
    pub info_hash: [u8; 20],
    pub piece_length: u32,
    /// Paths relative to the torrent's directory, in metainfo order.
    pub files: Vec<(PathBuf, u64)>,
    pub hashes: Vec<[u8; 20]>,
}

/// Counter snapshot for the external tracker client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerDelta {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// State shared between the coordinator, the committer, and every peer
/// session. The bitfield is mutated only by the committer; readers take a
/// snapshot per request.
pub struct TorrentShared {
    num_pieces: usize,
    bitfield: RwLock<PieceSet>,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    left: AtomicU64,
    hash_failures: AtomicU64,
}

impl TorrentShared {
    pub fn new(layout: &Layout) -> Self {
        Self {
            num_pieces: layout.piece_count(),
            bitfield: RwLock::new(PieceSet::empty(layout.piece_count())),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            left: AtomicU64::new(layout.total_length()),
            hash_failures: AtomicU64::new(0),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    /// Consistent snapshot of the local bitfield.
    pub fn bitfield(&self) -> PieceSet {
        self.bitfield.read().clone()
    }

    pub fn has_piece(&self, piece: u32) -> bool {
        self.bitfield.read().contains(piece as usize)
    }

    pub fn is_seeding(&self) -> bool {
        self.bitfield.read().is_full()
    }

    /// True when the peer has a piece we still lack.
    pub fn check_interest(&self, peer_pieces: &PieceSet) -> bool {
        !peer_pieces.difference(&self.bitfield.read()).is_empty()
    }

    /// Publishes a verified piece. Called only by the committer.
    pub fn commit_piece(&self, piece: u32, length: u64) {
        self.bitfield.write().insert(piece as usize);
        self.left.fetch_sub(length, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_hash_failure(&self) {
        self.hash_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn left(&self) -> u64 {
        self.left.load(Ordering::Relaxed)
    }

    pub fn hash_failures(&self) -> u64 {
        self.hash_failures.load(Ordering::Relaxed)
    }
}

/// One torrent's peer engine.
///
/// Must be created inside a tokio runtime: construction spawns the file
/// workers and the committer task.
pub struct Torrent {
    info_hash: [u8; 20],
    local_peer_id: PeerId,
    config: Arc<Config>,
    layout: Arc<Layout>,
    shared: Arc<TorrentShared>,
    registry: Arc<ChunkRegistry>,
    directory: Arc<FileDirectory>,
    peers: Arc<PeerRegistry>,
    committer: mpsc::UnboundedSender<u32>,
}

impl Torrent {
    pub fn new(meta: TorrentMeta, config: Config) -> Result<Self, TorrentError> {
        config.validate()?;

        let files = meta
            .files
            .iter()
            .map(|(path, length)| TorrentFile::new(path.clone(), *length))
            .collect();
        let layout = Arc::new(Layout::new(meta.piece_length, files, meta.hashes)?);

        let directory = Arc::new(FileDirectory::new(
            &config.download_dir,
            &meta.name,
            &layout,
            config.max_open_files,
        ));
        let shared = Arc::new(TorrentShared::new(&layout));
        let registry = Arc::new(ChunkRegistry::new(layout.clone(), config.chunk_size));
        let peers = Arc::new(PeerRegistry::new(config.max_peers));

        let committer = PieceCommitter::new(
            layout.clone(),
            directory.clone(),
            registry.clone(),
            peers.clone(),
            shared.clone(),
        )
        .spawn();

        Ok(Self {
            info_hash: meta.info_hash,
            local_peer_id: PeerId::generate(),
            config: Arc::new(config),
            layout,
            shared,
            registry,
            directory,
            peers,
            committer,
        })
    }

    /// Pre-allocates every file to its expected size. Run once before
    /// connecting peers.
    pub async fn start(&self) -> Result<(), TorrentError> {
        self.directory.preallocate_all(&self.layout).await?;
        Ok(())
    }

    /// Dials a peer and runs its session in the background.
    pub fn connect_peer(&self, addr: SocketAddr) {
        let params = self.session_params();
        tokio::spawn(async move {
            if let Err(err) = run_outgoing(params, addr).await {
                tracing::debug!(%addr, error = %err, "outgoing session ended");
            }
        });
    }

    /// Adopts a connection the listener accepted. The listener has already
    /// consumed the remote handshake for capability detection.
    pub fn accept_peer(&self, stream: TcpStream, remote_handshake: Handshake) {
        let params = self.session_params();
        tokio::spawn(async move {
            if let Err(err) = run_incoming(params, stream, remote_handshake).await {
                tracing::debug!(error = %err, "incoming session ended");
            }
        });
    }

    /// Choke-policy entry points; the policy itself lives outside.
    pub fn choke_peer(&self, peer_id: PeerId) {
        self.peers.set_choke(peer_id, true);
    }

    pub fn unchoke_peer(&self, peer_id: PeerId) {
        self.peers.set_choke(peer_id, false);
    }

    pub fn num_pieces(&self) -> usize {
        self.shared.num_pieces()
    }

    pub fn is_seeding(&self) -> bool {
        self.shared.is_seeding()
    }

    pub fn bitfield(&self) -> PieceSet {
        self.shared.bitfield()
    }

    pub fn check_interest(&self, peer_pieces: &PieceSet) -> bool {
        self.shared.check_interest(peer_pieces)
    }

    pub fn in_endgame(&self) -> bool {
        self.registry.in_endgame()
    }

    /// Counter snapshot for the tracker client's announces.
    pub fn tracker_delta(&self) -> TrackerDelta {
        TrackerDelta {
            uploaded: self.shared.uploaded(),
            downloaded: self.shared.downloaded(),
            left: self.shared.left(),
        }
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> &Arc<PeerRegistry> {
        &self.peers
    }

    pub fn shutdown(&self) {
        self.peers.shutdown_all();
    }

    fn session_params(&self) -> SessionParams {
        SessionParams {
            info_hash: self.info_hash,
            local_peer_id: self.local_peer_id,
            config: self.config.clone(),
            layout: self.layout.clone(),
            shared: self.shared.clone(),
            registry: self.registry.clone(),
            directory: self.directory.clone(),
            peers: self.peers.clone(),
            committer: self.committer.clone(),
        }
    }
}

#[cfg(test)]
mod tests;
