use crate::peer::PeerId;
use crate::pieces::{ChunkKey, PieceSet};
use crate::storage::Layout;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;

/// Endgame starts when fewer unfetched chunks remain than remaining
/// pieces times this factor.
const ENDGAME_CHUNKS_PER_PIECE: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PieceState {
    NotFetched,
    Chunked,
    Fetched,
    /// Quarantined after a verification failure. The commit path retries
    /// failed pieces immediately (reset to Chunked), so nothing enters
    /// this state today; it exists so a stricter error policy can pin a
    /// piece out of scheduling without a new state table.
    #[allow(dead_code)]
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkState {
    NotRequested,
    /// Outside endgame at most one assignee; duplicates are endgame-only.
    Assigned(Vec<PeerId>),
    Fetched,
    Stored,
}

#[derive(Debug)]
struct PieceProgress {
    /// Chunk state keyed by offset within the piece.
    chunks: HashMap<u32, ChunkState>,
    /// Set once `piece_complete` has been handed out for this fill cycle.
    complete_emitted: bool,
}

struct Inner {
    states: Vec<PieceState>,
    progress: HashMap<u32, PieceProgress>,
    /// Peer-observed frequency per piece, for rarest-first selection.
    availability: Vec<u32>,
    pieces_left: u64,
    chunks_left: u64,
    endgame: bool,
}

/// Outcome of a request for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkRequestOutcome {
    /// Chunks assigned to the caller.
    Assigned(Vec<ChunkKey>),
    /// The peer has no piece we still need; the session should drop
    /// interest.
    NotInterested,
    /// The peer has pieces we need but every chunk is already spoken for.
    NoneAvailable,
}

/// Per-torrent chunk allocation table.
///
/// Tracks, for every piece being fetched, which chunks are unrequested,
/// assigned to a peer, fetched, or durably stored. All operations lock the
/// inner table; none of them block.
pub struct ChunkRegistry {
    layout: Arc<Layout>,
    chunk_size: u32,
    inner: Mutex<Inner>,
}

impl ChunkRegistry {
    pub fn new(layout: Arc<Layout>, chunk_size: u32) -> Self {
        let piece_count = layout.piece_count();
        let chunks_left = (0..piece_count as u32)
            .map(|p| layout.chunk_count(p, chunk_size) as u64)
            .sum();
        Self {
            chunk_size,
            inner: Mutex::new(Inner {
                states: vec![PieceState::NotFetched; piece_count],
                progress: HashMap::new(),
                availability: vec![0; piece_count],
                pieces_left: piece_count as u64,
                chunks_left,
                endgame: false,
            }),
            layout,
        }
    }

    /// Seeds the registry from pieces already on disk (resume).
    pub fn mark_have(&self, have: &PieceSet) {
        let mut inner = self.inner.lock();
        for piece in have.iter() {
            if inner.states[piece] != PieceState::Fetched {
                inner.states[piece] = PieceState::Fetched;
                inner.pieces_left -= 1;
                inner.chunks_left -= self.layout.chunk_count(piece as u32, self.chunk_size) as u64;
            }
        }
        inner.update_endgame();
    }

    /// Hands out up to `num` chunks the peer can supply.
    ///
    /// Candidate pieces are those in the peer's set still NotFetched or
    /// Chunked. Already-chunked pieces are preferred, then rarest-first by
    /// observed availability with random tie-breaking. In endgame, chunks
    /// assigned to other peers may be handed out again.
    pub fn request_chunks(
        &self,
        peer: PeerId,
        peer_pieces: &PieceSet,
        num: usize,
    ) -> ChunkRequestOutcome {
        let mut inner = self.inner.lock();

        let mut chunked = Vec::new();
        let mut fresh = Vec::new();
        for piece in peer_pieces.iter() {
            match inner.states[piece] {
                PieceState::Chunked => chunked.push(piece as u32),
                PieceState::NotFetched => fresh.push(piece as u32),
                // Fetched pieces are done; Invalid ones stay quarantined
                // until something resets them.
                PieceState::Fetched | PieceState::Invalid => {}
            }
        }

        if chunked.is_empty() && fresh.is_empty() {
            return ChunkRequestOutcome::NotInterested;
        }

        let mut rng = rand::rng();
        fresh.shuffle(&mut rng);
        fresh.sort_by_key(|&p| inner.availability[p as usize]);

        let endgame = inner.endgame;
        let mut assigned = Vec::new();

        'pieces: for piece in chunked.into_iter().chain(fresh) {
            if assigned.len() >= num {
                break;
            }
            self.chunk_piece(&mut inner, piece);
            let Some(progress) = inner.progress.get_mut(&piece) else {
                continue;
            };

            let mut offsets: Vec<u32> = progress.chunks.keys().copied().collect();
            offsets.sort_unstable();
            for offset in offsets {
                if assigned.len() >= num {
                    break 'pieces;
                }
                let Some(state) = progress.chunks.get_mut(&offset) else {
                    continue;
                };
                match state {
                    ChunkState::NotRequested => {
                        *state = ChunkState::Assigned(vec![peer]);
                    }
                    ChunkState::Assigned(holders) if endgame => {
                        if holders.contains(&peer) {
                            continue;
                        }
                        holders.push(peer);
                    }
                    _ => continue,
                }
                assigned.push(ChunkKey::new(
                    piece,
                    offset,
                    self.layout.chunk_length(piece, offset, self.chunk_size),
                ));
            }
        }

        if assigned.is_empty() {
            ChunkRequestOutcome::NoneAvailable
        } else {
            ChunkRequestOutcome::Assigned(assigned)
        }
    }

    /// Records that `by` delivered the chunk. Idempotent; a chunk that is
    /// not currently assigned is a stray and leaves the table unchanged.
    ///
    /// Returns the peers that still hold an endgame assignment for this
    /// chunk, so the caller can fan cancels out to them.
    pub fn mark_fetched(&self, key: ChunkKey, by: PeerId) -> Vec<(PeerId, ChunkKey)> {
        let mut inner = self.inner.lock();
        let Some(progress) = inner.progress.get_mut(&key.piece) else {
            return Vec::new();
        };
        let Some(state) = progress.chunks.get_mut(&key.offset) else {
            return Vec::new();
        };

        let holders = match state {
            ChunkState::Assigned(holders) => std::mem::take(holders),
            // Repeat delivery (endgame duplicate) or stray.
            _ => return Vec::new(),
        };
        *state = ChunkState::Fetched;
        inner.chunks_left -= 1;
        inner.update_endgame();

        holders
            .into_iter()
            .filter(|h| *h != by)
            .map(|h| (h, key))
            .collect()
    }

    /// Records the durable write of a fetched chunk. Returns the piece
    /// index exactly once, when its last chunk stores.
    pub fn mark_stored(&self, key: ChunkKey) -> Option<u32> {
        let mut inner = self.inner.lock();
        let progress = inner.progress.get_mut(&key.piece)?;
        match progress.chunks.get_mut(&key.offset) {
            Some(state) if *state == ChunkState::Fetched => *state = ChunkState::Stored,
            _ => return None,
        }

        let all_stored = progress
            .chunks
            .values()
            .all(|c| *c == ChunkState::Stored);
        if all_stored && !progress.complete_emitted {
            progress.complete_emitted = true;
            Some(key.piece)
        } else {
            None
        }
    }

    /// Returns an assigned chunk to the pool, e.g. after a REJECT or when
    /// a peer choked us without the fast extension.
    pub fn mark_dropped(&self, key: ChunkKey, peer: PeerId) {
        let mut inner = self.inner.lock();
        if let Some(progress) = inner.progress.get_mut(&key.piece) {
            if let Some(state) = progress.chunks.get_mut(&key.offset) {
                if let ChunkState::Assigned(holders) = state {
                    holders.retain(|h| *h != peer);
                    if holders.is_empty() {
                        *state = ChunkState::NotRequested;
                    }
                }
            }
        }
    }

    /// Drops every assignment held by `peer` across all pieces. Used on
    /// disconnect and on choke without the fast extension.
    pub fn mark_all_dropped(&self, peer: PeerId) {
        let mut inner = self.inner.lock();
        for progress in inner.progress.values_mut() {
            for state in progress.chunks.values_mut() {
                if let ChunkState::Assigned(holders) = state {
                    holders.retain(|h| *h != peer);
                    if holders.is_empty() {
                        *state = ChunkState::NotRequested;
                    }
                }
            }
        }
    }

    /// Marks a verified piece Fetched and re-evaluates the endgame bound.
    pub fn finish_piece(&self, piece: u32) {
        let mut inner = self.inner.lock();
        if inner.states[piece as usize] == PieceState::Fetched {
            return;
        }
        inner.states[piece as usize] = PieceState::Fetched;
        inner.progress.remove(&piece);
        inner.pieces_left -= 1;
        inner.update_endgame();
    }

    /// Returns a piece to Chunked with every chunk unrequested, after a
    /// hash mismatch.
    pub fn reset_piece(&self, piece: u32) {
        let mut inner = self.inner.lock();
        if inner.states[piece as usize] == PieceState::Fetched {
            return;
        }
        let restored = self.fresh_progress(piece);
        let count = restored.chunks.len() as u64;
        let previously_left = inner
            .progress
            .get(&piece)
            .map(|p| {
                p.chunks
                    .values()
                    .filter(|c| !matches!(c, ChunkState::Fetched | ChunkState::Stored))
                    .count() as u64
            })
            .unwrap_or(count);
        inner.chunks_left += count - previously_left;
        inner.progress.insert(piece, restored);
        inner.states[piece as usize] = PieceState::Chunked;
        inner.update_endgame();
    }

    /// Drops a piece back to NotFetched entirely, after a transient I/O
    /// failure; its chunk set is rebuilt on the next request.
    pub fn release_piece(&self, piece: u32) {
        let mut inner = self.inner.lock();
        if inner.states[piece as usize] == PieceState::Fetched {
            return;
        }
        let count = self.layout.chunk_count(piece, self.chunk_size) as u64;
        let previously_left = inner
            .progress
            .get(&piece)
            .map(|p| {
                p.chunks
                    .values()
                    .filter(|c| !matches!(c, ChunkState::Fetched | ChunkState::Stored))
                    .count() as u64
            })
            .unwrap_or(count);
        inner.chunks_left += count - previously_left;
        inner.progress.remove(&piece);
        inner.states[piece as usize] = PieceState::NotFetched;
        inner.update_endgame();
    }

    /// Availability accounting for rarest-first selection.
    pub fn record_have(&self, piece: u32) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.availability.get_mut(piece as usize) {
            *slot += 1;
        }
    }

    pub fn forget_have(&self, piece: u32) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.availability.get_mut(piece as usize) {
            *slot = slot.saturating_sub(1);
        }
    }

    pub fn record_piece_set(&self, pieces: &PieceSet) {
        let mut inner = self.inner.lock();
        for piece in pieces.iter() {
            inner.availability[piece] += 1;
        }
    }

    pub fn forget_piece_set(&self, pieces: &PieceSet) {
        let mut inner = self.inner.lock();
        for piece in pieces.iter() {
            inner.availability[piece] = inner.availability[piece].saturating_sub(1);
        }
    }

    pub fn in_endgame(&self) -> bool {
        self.inner.lock().endgame
    }

    /// Pieces not yet verified and committed.
    pub fn pieces_left(&self) -> u64 {
        self.inner.lock().pieces_left
    }

    /// Chunks not yet fetched across the torrent.
    pub fn chunks_left(&self) -> u64 {
        self.inner.lock().chunks_left
    }

    fn chunk_piece(&self, inner: &mut Inner, piece: u32) {
        if inner.states[piece as usize] == PieceState::NotFetched {
            inner.states[piece as usize] = PieceState::Chunked;
            let progress = self.fresh_progress(piece);
            inner.progress.insert(piece, progress);
        }
    }

    fn fresh_progress(&self, piece: u32) -> PieceProgress {
        let count = self.layout.chunk_count(piece, self.chunk_size);
        let chunks = (0..count)
            .map(|i| (i * self.chunk_size, ChunkState::NotRequested))
            .collect();
        PieceProgress {
            chunks,
            complete_emitted: false,
        }
    }
}

impl Inner {
    fn update_endgame(&mut self) {
        // Entry and exit use the same boundary: a reset piece lifting the
        // remaining count back above the threshold leaves endgame.
        self.endgame =
            self.chunks_left > 0 && self.chunks_left < self.pieces_left * ENDGAME_CHUNKS_PER_PIECE;
    }
}
