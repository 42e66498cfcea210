use super::*;
use crate::peer::PeerId;
use crate::pieces::{ChunkKey, PieceSet};
use crate::storage::{Layout, TorrentFile};
use std::sync::Arc;

const CHUNK: u32 = 16;

fn pid(n: u8) -> PeerId {
    PeerId([n; 20])
}

/// `pieces` pieces of 32 bytes, two 16-byte chunks each.
fn registry(pieces: usize) -> ChunkRegistry {
    let files = vec![TorrentFile::new("data.bin", 32 * pieces as u64)];
    let layout = Layout::new(32, files, vec![[0u8; 20]; pieces]).unwrap();
    ChunkRegistry::new(Arc::new(layout), CHUNK)
}

fn assigned(outcome: ChunkRequestOutcome) -> Vec<ChunkKey> {
    match outcome {
        ChunkRequestOutcome::Assigned(chunks) => chunks,
        other => panic!("expected assignment, got {other:?}"),
    }
}

#[test]
fn test_hands_out_each_chunk_once_outside_endgame() {
    let reg = registry(4);
    let everything = PieceSet::full(4);

    let a = assigned(reg.request_chunks(pid(1), &everything, 8));
    assert_eq!(a.len(), 8);

    // All chunks are assigned to peer 1; peer 2 gets nothing.
    assert_eq!(
        reg.request_chunks(pid(2), &everything, 8),
        ChunkRequestOutcome::NoneAvailable
    );

    // And the first peer's assignment is duplicate-free.
    let mut keys = a.clone();
    keys.sort_by_key(|k| (k.piece, k.offset));
    keys.dedup();
    assert_eq!(keys.len(), 8);
}

#[test]
fn test_not_interested_when_peer_has_nothing_we_need() {
    let reg = registry(2);
    let empty = PieceSet::empty(2);
    assert_eq!(
        reg.request_chunks(pid(1), &empty, 4),
        ChunkRequestOutcome::NotInterested
    );

    // Once every piece the peer holds is finished, the answer flips from
    // NoneAvailable to NotInterested.
    let mut only_zero = PieceSet::empty(2);
    only_zero.insert(0);
    let chunks = assigned(reg.request_chunks(pid(1), &only_zero, 4));
    assert_eq!(chunks.len(), 2);
    for key in chunks {
        reg.mark_fetched(key, pid(1));
        reg.mark_stored(key);
    }
    reg.finish_piece(0);
    assert_eq!(
        reg.request_chunks(pid(1), &only_zero, 4),
        ChunkRequestOutcome::NotInterested
    );
}

#[test]
fn test_last_chunk_of_short_last_piece_is_truncated() {
    let files = vec![TorrentFile::new("data.bin", 40)];
    let layout = Layout::new(32, files, vec![[0u8; 20]; 2]).unwrap();
    let reg = ChunkRegistry::new(Arc::new(layout), CHUNK);

    let mut last = PieceSet::empty(2);
    last.insert(1);
    let chunks = assigned(reg.request_chunks(pid(1), &last, 4));
    assert_eq!(chunks, vec![ChunkKey::new(1, 0, 8)]);
}

#[test]
fn test_mark_all_dropped_returns_chunks_to_pool() {
    let reg = registry(1);
    let everything = PieceSet::full(1);

    let first = assigned(reg.request_chunks(pid(1), &everything, 4));
    assert_eq!(first.len(), 2);
    assert_eq!(
        reg.request_chunks(pid(2), &everything, 4),
        ChunkRequestOutcome::NoneAvailable
    );

    reg.mark_all_dropped(pid(1));

    let second = assigned(reg.request_chunks(pid(2), &everything, 4));
    assert_eq!(second.len(), 2);
}

#[test]
fn test_mark_dropped_releases_single_chunk() {
    let reg = registry(1);
    let everything = PieceSet::full(1);

    let chunks = assigned(reg.request_chunks(pid(1), &everything, 4));
    reg.mark_dropped(chunks[0], pid(1));

    let retry = assigned(reg.request_chunks(pid(2), &everything, 4));
    assert_eq!(retry, vec![chunks[0]]);
}

#[test]
fn test_piece_complete_emitted_exactly_once() {
    let reg = registry(1);
    let everything = PieceSet::full(1);
    let chunks = assigned(reg.request_chunks(pid(1), &everything, 4));

    let mut completions = 0;
    for &key in &chunks {
        assert!(reg.mark_fetched(key, pid(1)).is_empty());
        if reg.mark_stored(key).is_some() {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);

    // Repeat stores change nothing.
    assert_eq!(reg.mark_stored(chunks[1]), None);
}

#[test]
fn test_stray_fetch_leaves_state_unchanged() {
    let reg = registry(1);
    // Never-requested chunk: no piece progress exists.
    assert!(reg
        .mark_fetched(ChunkKey::new(0, 0, CHUNK), pid(1))
        .is_empty());
    assert_eq!(reg.chunks_left(), 2);

    // A requested-then-fetched chunk reported again is also a stray.
    let everything = PieceSet::full(1);
    let chunks = assigned(reg.request_chunks(pid(1), &everything, 1));
    reg.mark_fetched(chunks[0], pid(1));
    assert!(reg.mark_fetched(chunks[0], pid(2)).is_empty());
    assert_eq!(reg.chunks_left(), 1);
}

#[test]
fn test_endgame_duplicates_and_cancels() {
    let reg = registry(2);
    let everything = PieceSet::full(2);

    // Peer X takes all four chunks; fetch three of them to push the
    // remaining-chunk count below the endgame threshold.
    let chunks = assigned(reg.request_chunks(pid(1), &everything, 8));
    assert_eq!(chunks.len(), 4);
    for &key in &chunks[..3] {
        reg.mark_fetched(key, pid(1));
    }
    assert!(reg.in_endgame());

    // Peer Y now receives the chunk X still holds.
    let last = chunks[3];
    let dup = assigned(reg.request_chunks(pid(2), &everything, 8));
    assert_eq!(dup, vec![last]);

    // Y delivers first; the registry emits a cancel aimed at X.
    let cancels = reg.mark_fetched(last, pid(2));
    assert_eq!(cancels, vec![(pid(1), last)]);

    // X's late delivery is a stray.
    assert!(reg.mark_fetched(last, pid(1)).is_empty());
}

#[test]
fn test_endgame_does_not_duplicate_to_same_peer() {
    let reg = registry(2);
    let everything = PieceSet::full(2);

    let chunks = assigned(reg.request_chunks(pid(1), &everything, 8));
    for &key in &chunks[..3] {
        reg.mark_fetched(key, pid(1));
    }
    assert!(reg.in_endgame());
    assert_eq!(
        reg.request_chunks(pid(1), &everything, 8),
        ChunkRequestOutcome::NoneAvailable
    );
}

#[test]
fn test_reset_piece_allows_refetch_and_recompletion() {
    let reg = registry(1);
    let everything = PieceSet::full(1);

    let chunks = assigned(reg.request_chunks(pid(1), &everything, 4));
    for &key in &chunks {
        reg.mark_fetched(key, pid(1));
        reg.mark_stored(key);
    }
    assert_eq!(reg.chunks_left(), 0);

    // Hash mismatch: everything back to NotRequested.
    reg.reset_piece(0);
    assert_eq!(reg.chunks_left(), 2);

    let again = assigned(reg.request_chunks(pid(2), &everything, 4));
    assert_eq!(again.len(), 2);
    let mut completions = 0;
    for &key in &again {
        reg.mark_fetched(key, pid(2));
        if reg.mark_stored(key).is_some() {
            completions += 1;
        }
    }
    assert_eq!(completions, 1);
}

#[test]
fn test_release_piece_restores_chunk_budget() {
    let reg = registry(2);
    let everything = PieceSet::full(2);

    let chunks = assigned(reg.request_chunks(pid(1), &everything, 8));
    for &key in &chunks {
        reg.mark_fetched(key, pid(1));
    }
    assert_eq!(reg.chunks_left(), 0);

    reg.release_piece(0);
    assert_eq!(reg.chunks_left(), 2);

    let mut zero = PieceSet::empty(2);
    zero.insert(0);
    let again = assigned(reg.request_chunks(pid(2), &zero, 8));
    assert_eq!(again.len(), 2);
}

#[test]
fn test_prefers_pieces_already_chunked() {
    let reg = registry(3);
    let mut one = PieceSet::empty(3);
    one.insert(1);

    // Peer A starts piece 1 and takes one of its chunks.
    let first = assigned(reg.request_chunks(pid(1), &one, 1));
    assert_eq!(first[0].piece, 1);

    // Peer B sees everything; it should finish piece 1 before opening a
    // fresh one.
    let everything = PieceSet::full(3);
    let second = assigned(reg.request_chunks(pid(2), &everything, 1));
    assert_eq!(second[0].piece, 1);
}

#[test]
fn test_rarest_piece_selected_first() {
    let reg = registry(3);

    // Piece 2 is observed on one peer, pieces 0 and 1 on three.
    for _ in 0..3 {
        reg.record_have(0);
        reg.record_have(1);
    }
    reg.record_have(2);

    let everything = PieceSet::full(3);
    let chunks = assigned(reg.request_chunks(pid(1), &everything, 2));
    assert!(chunks.iter().all(|k| k.piece == 2));
}

#[test]
fn test_mark_have_seeds_resume_state() {
    let reg = registry(2);
    let mut have = PieceSet::empty(2);
    have.insert(0);
    reg.mark_have(&have);

    assert_eq!(reg.pieces_left(), 1);
    assert_eq!(reg.chunks_left(), 2);

    let mut zero = PieceSet::empty(2);
    zero.insert(0);
    assert_eq!(
        reg.request_chunks(pid(1), &zero, 4),
        ChunkRequestOutcome::NotInterested
    );
}
