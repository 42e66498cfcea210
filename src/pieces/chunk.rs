/// Identifies a sub-range of a piece.
///
/// Chunks are the unit of peer requests; the last chunk of a piece may be
/// shorter than the default size. The triple is the key for in-flight sets
/// and the chunk registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    /// The piece index.
    pub piece: u32,
    /// Byte offset within the piece.
    pub offset: u32,
    /// Length of the chunk in bytes.
    pub length: u32,
}

impl ChunkKey {
    pub fn new(piece: u32, offset: u32, length: u32) -> Self {
        Self {
            piece,
            offset,
            length,
        }
    }
}

impl std::fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}+{}", self.piece, self.offset, self.length)
    }
}
