//! Chunk scheduling.
//!
//! The chunk registry is the per-torrent allocation table: it hands out
//! chunk requests to peer sessions, tracks their lifecycle through fetch
//! and durable store, and drives the endgame phase near completion.

mod registry;

pub use registry::{ChunkRegistry, ChunkRequestOutcome};

#[cfg(test)]
mod tests;
