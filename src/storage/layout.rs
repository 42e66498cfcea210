use super::error::StorageError;
use std::path::PathBuf;

/// A file in the torrent, with its path relative to the download root.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub path: PathBuf,
    pub length: u64,
}

impl TorrentFile {
    pub fn new(path: impl Into<PathBuf>, length: u64) -> Self {
        Self {
            path: path.into(),
            length,
        }
    }
}

/// A contiguous byte range inside one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSpan {
    /// Index into the torrent's file list.
    pub file: usize,
    /// Byte offset within that file.
    pub offset: u64,
    /// Length of the range.
    pub length: u64,
}

/// Maps piece indices onto the torrent's files.
///
/// Built once from the metainfo; every piece resolves to an ordered list of
/// [`FileSpan`]s whose lengths sum to the piece's length. The last piece may
/// be shorter than the nominal piece length.
#[derive(Debug)]
pub struct Layout {
    files: Vec<TorrentFile>,
    hashes: Vec<[u8; 20]>,
    piece_length: u32,
    last_piece_length: u32,
    total_length: u64,
    spans: Vec<Vec<FileSpan>>,
}

impl Layout {
    /// Computes the piece-to-file mapping.
    ///
    /// Sweeps the file list once, filling pieces in order: a piece whose
    /// remaining bytes fit in the current file takes one span; one that
    /// overflows takes the rest of the file and continues into the next.
    pub fn new(
        piece_length: u32,
        files: Vec<TorrentFile>,
        hashes: Vec<[u8; 20]>,
    ) -> Result<Self, StorageError> {
        let total_length: u64 = files.iter().map(|f| f.length).sum();
        let piece_count = total_length.div_ceil(piece_length as u64) as usize;
        if hashes.len() != piece_count {
            return Err(StorageError::HashCountMismatch {
                hashes: hashes.len(),
                pieces: piece_count,
            });
        }

        let rem = total_length % piece_length as u64;
        let last_piece_length = if rem == 0 { piece_length } else { rem as u32 };

        let mut spans: Vec<Vec<FileSpan>> = Vec::with_capacity(piece_count);
        let mut current: Vec<FileSpan> = Vec::new();
        let mut piece_fill = 0u64;
        let mut piece_index = 0usize;

        for (file_index, file) in files.iter().enumerate() {
            let mut file_offset = 0u64;
            while file_offset < file.length {
                let piece_len = if piece_index + 1 == piece_count {
                    last_piece_length as u64
                } else {
                    piece_length as u64
                };
                let need = piece_len - piece_fill;
                let avail = file.length - file_offset;
                let take = need.min(avail);

                current.push(FileSpan {
                    file: file_index,
                    offset: file_offset,
                    length: take,
                });
                file_offset += take;
                piece_fill += take;

                if piece_fill == piece_len {
                    spans.push(std::mem::take(&mut current));
                    piece_fill = 0;
                    piece_index += 1;
                }
            }
        }
        if !current.is_empty() {
            spans.push(current);
        }

        Ok(Self {
            files,
            hashes,
            piece_length,
            last_piece_length,
            total_length,
            spans,
        })
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    pub fn piece_count(&self) -> usize {
        self.hashes.len()
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn nominal_piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn last_piece_length(&self) -> u32 {
        self.last_piece_length
    }

    /// Length of the given piece; the last piece may be shorter.
    pub fn piece_length(&self, piece: u32) -> u32 {
        if piece as usize + 1 == self.piece_count() {
            self.last_piece_length
        } else {
            self.piece_length
        }
    }

    /// Expected SHA-1 of the given piece.
    pub fn hash(&self, piece: u32) -> Option<&[u8; 20]> {
        self.hashes.get(piece as usize)
    }

    /// Number of chunks in a piece for the given chunk size.
    pub fn chunk_count(&self, piece: u32, chunk_size: u32) -> u32 {
        self.piece_length(piece).div_ceil(chunk_size)
    }

    /// Length of the chunk starting at `offset`; the final chunk of a piece
    /// may be shorter than `chunk_size`.
    pub fn chunk_length(&self, piece: u32, offset: u32, chunk_size: u32) -> u32 {
        let piece_len = self.piece_length(piece);
        chunk_size.min(piece_len - offset)
    }

    /// Spans of a whole piece.
    pub fn piece_spans(&self, piece: u32) -> Result<&[FileSpan], StorageError> {
        self.spans
            .get(piece as usize)
            .map(Vec::as_slice)
            .ok_or(StorageError::InvalidPiece(piece))
    }

    /// Resolves a chunk to file sub-ranges.
    ///
    /// Walks the piece's spans, skipping whole spans while the chunk offset
    /// exceeds them, then emits spans until the chunk length is exhausted,
    /// truncating the first and last as needed.
    pub fn chunk_spans(
        &self,
        piece: u32,
        offset: u32,
        length: u32,
    ) -> Result<Vec<FileSpan>, StorageError> {
        let piece_len = self.piece_length(piece) as u64;
        if offset as u64 + length as u64 > piece_len {
            return Err(StorageError::InvalidRange {
                piece,
                offset,
                length,
            });
        }

        let mut skip = offset as u64;
        let mut remaining = length as u64;
        let mut out = Vec::new();

        for span in self.piece_spans(piece)? {
            if remaining == 0 {
                break;
            }
            if skip >= span.length {
                skip -= span.length;
                continue;
            }
            let take = (span.length - skip).min(remaining);
            out.push(FileSpan {
                file: span.file,
                offset: span.offset + skip,
                length: take,
            });
            remaining -= take;
            skip = 0;
        }

        Ok(out)
    }
}
