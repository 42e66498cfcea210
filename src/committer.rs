//! Verify-and-commit pipeline.
//!
//! Completed pieces arrive on a mailbox, one at a time per torrent: the
//! committer assembles the piece from its file spans, checks the SHA-1
//! against the metainfo, and either publishes the piece (bitfield bit,
//! counters, HAVE broadcast) or throws the piece's chunks back to the
//! scheduler.

use crate::peer::PeerRegistry;
use crate::scheduler::ChunkRegistry;
use crate::storage::{FileDirectory, Layout, StorageError};
use crate::torrent::TorrentShared;
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct PieceCommitter {
    layout: Arc<Layout>,
    directory: Arc<FileDirectory>,
    registry: Arc<ChunkRegistry>,
    peers: Arc<PeerRegistry>,
    shared: Arc<TorrentShared>,
}

impl PieceCommitter {
    pub fn new(
        layout: Arc<Layout>,
        directory: Arc<FileDirectory>,
        registry: Arc<ChunkRegistry>,
        peers: Arc<PeerRegistry>,
        shared: Arc<TorrentShared>,
    ) -> Self {
        Self {
            layout,
            directory,
            registry,
            peers,
            shared,
        }
    }

    /// Spawns the committer task; the returned sender takes piece indices
    /// whose chunks have all been stored.
    pub fn spawn(self) -> mpsc::UnboundedSender<u32> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(piece) = rx.recv().await {
                self.commit(piece).await;
            }
        });
        tx
    }

    /// Verifies one piece and publishes or rejects it.
    ///
    /// Serialized per torrent, so "piece committed" is observable
    /// atomically: the bitfield bit, the counters, and the HAVE broadcast
    /// are all applied before the next piece is taken up.
    pub async fn commit(&self, piece: u32) {
        let data = match self.assemble(piece).await {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(piece, error = %err, "piece read failed, refetching");
                self.registry.release_piece(piece);
                return;
            }
        };

        let Some(expected) = self.layout.hash(piece).copied() else {
            tracing::warn!(piece, "piece has no hash entry");
            return;
        };

        let valid = tokio::task::spawn_blocking(move || {
            let mut hasher = Sha1::new();
            hasher.update(&data);
            let digest: [u8; 20] = hasher.finalize().into();
            digest == expected
        })
        .await
        .unwrap_or(false);

        if valid {
            self.registry.finish_piece(piece);
            self.shared
                .commit_piece(piece, self.layout.piece_length(piece) as u64);
            self.peers.broadcast_have(piece);
            tracing::debug!(piece, left = self.shared.left(), "piece committed");
        } else {
            self.shared.record_hash_failure();
            self.registry.reset_piece(piece);
            tracing::warn!(piece, "piece hash mismatch, discarding");
        }
    }

    async fn assemble(&self, piece: u32) -> Result<Bytes, StorageError> {
        let spans = self.layout.piece_spans(piece)?;
        let mut data = BytesMut::with_capacity(self.layout.piece_length(piece) as usize);
        for span in spans {
            let part = self
                .directory
                .read(span.file, span.offset, span.length as u32)
                .await?;
            data.put_slice(&part);
        }
        Ok(data.freeze())
    }
}
