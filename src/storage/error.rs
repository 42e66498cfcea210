use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid piece index: {0}")]
    InvalidPiece(u32),

    #[error("invalid range in piece {piece}: offset {offset} length {length}")]
    InvalidRange { piece: u32, offset: u32, length: u32 },

    #[error("piece hash count {hashes} does not cover {pieces} pieces")]
    HashCountMismatch { hashes: usize, pieces: usize },

    #[error("file worker for file {0} is gone")]
    WorkerGone(usize),
}
