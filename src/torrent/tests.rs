use super::*;
use crate::peer::{Handshake, Message, HANDSHAKE_LEN};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

// a.dat = [1,2,3], b.dat = [4,5,6,7,8], piece length 4:
// piece 0 spans a.dat fully plus the first byte of b.dat.
const FILE_A: [u8; 3] = [1, 2, 3];
const FILE_B: [u8; 5] = [4, 5, 6, 7, 8];
const PIECE_0: [u8; 4] = [1, 2, 3, 4];
const PIECE_1: [u8; 4] = [5, 6, 7, 8];
const INFO_HASH: [u8; 20] = [7u8; 20];

fn small_meta() -> TorrentMeta {
    TorrentMeta {
        name: "small".into(),
        info_hash: INFO_HASH,
        piece_length: 4,
        files: vec![
            (PathBuf::from("a.dat"), 3),
            (PathBuf::from("b.dat"), 5),
        ],
        hashes: vec![sha1(&PIECE_0), sha1(&PIECE_1)],
    }
}

async fn read_message(stream: &mut TcpStream) -> Message {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.unwrap();
    let length = u32::from_be_bytes(prefix) as usize;
    let mut frame = Vec::with_capacity(4 + length);
    frame.extend_from_slice(&prefix);
    frame.resize(4 + length, 0);
    stream.read_exact(&mut frame[4..]).await.unwrap();
    Message::decode(Bytes::from(frame)).unwrap()
}

fn piece_data(index: u32) -> Bytes {
    match index {
        0 => Bytes::copy_from_slice(&PIECE_0),
        1 => Bytes::copy_from_slice(&PIECE_1),
        _ => panic!("unexpected piece {index}"),
    }
}

/// Scripted seeder: handshakes with the fast bit, claims every piece via
/// HAVE_ALL, unchokes, serves requests, and records what the client sent.
async fn run_seeder(listener: TcpListener) -> Vec<Message> {
    let (mut stream, _) = listener.accept().await.unwrap();

    let mut raw = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut raw).await.unwrap();
    let theirs = Handshake::decode(&raw).unwrap();
    assert_eq!(theirs.info_hash, INFO_HASH);
    assert!(theirs.supports_fast());

    let mut ours = Handshake::new(INFO_HASH, *b"-XX0001-abcdefghijkl");
    ours.reserved[5] = 0; // no extension protocol, fast only
    stream.write_all(&ours.encode()).await.unwrap();

    stream.write_all(&Message::HaveAll.encode()).await.unwrap();
    stream.write_all(&Message::Unchoke.encode()).await.unwrap();

    let mut observed = Vec::new();
    loop {
        let msg = read_message(&mut stream).await;
        observed.push(msg.clone());
        match msg {
            Message::Request { index, offset, .. } => {
                let reply = Message::Piece {
                    index,
                    offset,
                    data: piece_data(index),
                };
                stream.write_all(&reply.encode()).await.unwrap();
            }
            Message::NotInterested => break,
            _ => {}
        }
    }
    observed
}

#[tokio::test]
async fn test_downloads_small_torrent_from_fast_seeder() {
    let temp = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let seeder_addr = listener.local_addr().unwrap();
    let seeder = tokio::spawn(run_seeder(listener));

    let config = Config {
        download_dir: temp.path().to_path_buf(),
        ..Config::default()
    };
    let torrent = Torrent::new(small_meta(), config).unwrap();
    torrent.start().await.unwrap();
    assert_eq!(torrent.num_pieces(), 2);
    assert!(!torrent.is_seeding());

    torrent.connect_peer(seeder_addr);

    let done = tokio::time::timeout(Duration::from_secs(10), async {
        while !torrent.is_seeding() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(done.is_ok(), "download did not complete");

    let observed = seeder.await.unwrap();

    // HAVE_NONE announces our empty start; interest precedes requests.
    assert!(matches!(observed[0], Message::HaveNone));
    assert!(observed.iter().any(|m| matches!(m, Message::Interested)));
    let requested: Vec<u32> = observed
        .iter()
        .filter_map(|m| match m {
            Message::Request {
                index,
                offset: 0,
                length: 4,
            } => Some(*index),
            _ => None,
        })
        .collect();
    let mut sorted = requested.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![0, 1]);

    // The seeder already has both pieces: every HAVE is suppressed.
    assert!(observed.iter().all(|m| !matches!(m, Message::Have { .. })));
    assert!(matches!(observed.last(), Some(Message::NotInterested)));

    // Committed data landed in the right files.
    let a = tokio::fs::read(temp.path().join("small").join("a.dat"))
        .await
        .unwrap();
    assert_eq!(a, FILE_A);
    let b = tokio::fs::read(temp.path().join("small").join("b.dat"))
        .await
        .unwrap();
    assert_eq!(b, FILE_B);

    let delta = torrent.tracker_delta();
    assert_eq!(delta.downloaded, 8);
    assert_eq!(delta.left, 0);

    torrent.shutdown();
}

#[tokio::test]
async fn test_rejects_metainfo_with_wrong_hash_count() {
    let mut meta = small_meta();
    meta.hashes.pop();
    let config = Config {
        download_dir: std::env::temp_dir(),
        ..Config::default()
    };
    assert!(matches!(
        Torrent::new(meta, config),
        Err(TorrentError::Storage(StorageError::HashCountMismatch { .. }))
    ));
}

#[tokio::test]
async fn test_tracker_delta_starts_at_full_left() {
    let temp = TempDir::new().unwrap();
    let config = Config {
        download_dir: temp.path().to_path_buf(),
        ..Config::default()
    };
    let torrent = Torrent::new(small_meta(), config).unwrap();
    assert_eq!(
        torrent.tracker_delta(),
        TrackerDelta {
            uploaded: 0,
            downloaded: 0,
            left: 8
        }
    );
}
