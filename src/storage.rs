//! Disk layout and I/O.
//!
//! Maps variable-length pieces onto the torrent's file list, resolves
//! chunks to file sub-ranges, and performs the actual reads and writes
//! through per-file worker tasks whose open handles are bounded by an LRU.
//!
//! # Components
//!
//! - [`Layout`] - piece/chunk to file-span mapping
//! - [`FileWorker`] - per-file read/write/allocate actor
//! - [`FileDirectory`] - worker ownership and the open-handle LRU

mod directory;
mod error;
mod layout;
mod worker;

pub use directory::FileDirectory;
pub use error::StorageError;
pub use layout::{FileSpan, Layout, TorrentFile};
pub use worker::{FileWorker, WorkerHandle};
