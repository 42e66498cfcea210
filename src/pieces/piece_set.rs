use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PieceSetError {
    /// The bitfield byte count does not match the piece count.
    #[error("bitfield length {got} bytes, expected {expected} for {pieces} pieces")]
    BadLength {
        got: usize,
        expected: usize,
        pieces: usize,
    },

    /// Trailing pad bits past the last piece were set.
    #[error("bitfield has non-zero padding bits")]
    DirtyPadding,
}

/// An ordered set of piece indices in `[0, capacity)`.
///
/// Backed by the wire bitfield representation: `ceil(N/8)` bytes with bit 7
/// of the first byte standing for piece 0. Membership is O(1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceSet {
    bits: Vec<u8>,
    capacity: usize,
    len: usize,
}

impl PieceSet {
    /// Creates an empty set for `capacity` pieces.
    pub fn empty(capacity: usize) -> Self {
        Self {
            bits: vec![0; capacity.div_ceil(8)],
            capacity,
            len: 0,
        }
    }

    /// Creates a set containing every piece in `[0, capacity)`.
    pub fn full(capacity: usize) -> Self {
        let mut set = Self {
            bits: vec![0xFF; capacity.div_ceil(8)],
            capacity,
            len: capacity,
        };
        set.zero_padding();
        set
    }

    /// Parses a wire bitfield.
    ///
    /// Rejects byte counts other than `ceil(capacity/8)` and any set bit at
    /// an index `>= capacity`; peers sending non-zero pad bits are invalid.
    pub fn parse(bytes: &[u8], capacity: usize) -> Result<Self, PieceSetError> {
        let expected = capacity.div_ceil(8);
        if bytes.len() != expected {
            return Err(PieceSetError::BadLength {
                got: bytes.len(),
                expected,
                pieces: capacity,
            });
        }

        let pad = expected * 8 - capacity;
        if pad > 0 {
            let mask = (1u16 << pad) as u8 - 1;
            if bytes[expected - 1] & mask != 0 {
                return Err(PieceSetError::DirtyPadding);
            }
        }

        let len = bytes.iter().map(|b| b.count_ones() as usize).sum();
        Ok(Self {
            bits: bytes.to_vec(),
            capacity,
            len,
        })
    }

    /// Serializes to the wire representation; pad bits are zero.
    pub fn serialize(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    pub fn contains(&self, index: usize) -> bool {
        if index >= self.capacity {
            return false;
        }
        self.bits[index / 8] >> (7 - index % 8) & 1 == 1
    }

    /// Inserts `index`; returns true if it was newly added.
    pub fn insert(&mut self, index: usize) -> bool {
        if index >= self.capacity || self.contains(index) {
            return false;
        }
        self.bits[index / 8] |= 1 << (7 - index % 8);
        self.len += 1;
        true
    }

    /// Removes `index`; returns true if it was present.
    pub fn remove(&mut self, index: usize) -> bool {
        if index >= self.capacity || !self.contains(index) {
            return false;
        }
        self.bits[index / 8] &= !(1 << (7 - index % 8));
        self.len -= 1;
        true
    }

    /// Number of pieces in the set.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Total number of pieces the set can index.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Pieces in `self` that are not in `other`.
    ///
    /// With `self` as a remote peer's set and `other` as ours, a non-empty
    /// difference means the peer is interesting.
    pub fn difference(&self, other: &PieceSet) -> PieceSet {
        self.combine(other, |a, b| a & !b)
    }

    pub fn intersection(&self, other: &PieceSet) -> PieceSet {
        self.combine(other, |a, b| a & b)
    }

    pub fn union(&self, other: &PieceSet) -> PieceSet {
        self.combine(other, |a, b| a | b)
    }

    /// Iterates members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity).filter(|&i| self.contains(i))
    }

    fn combine(&self, other: &PieceSet, op: impl Fn(u8, u8) -> u8) -> PieceSet {
        let capacity = self.capacity.min(other.capacity);
        let bytes = capacity.div_ceil(8);
        let mut bits = vec![0u8; bytes];
        for (i, out) in bits.iter_mut().enumerate() {
            *out = op(self.bits[i], other.bits[i]);
        }
        let mut set = PieceSet {
            bits,
            capacity,
            len: 0,
        };
        set.zero_padding();
        set.len = set.bits.iter().map(|b| b.count_ones() as usize).sum();
        set
    }

    fn zero_padding(&mut self) {
        let pad = self.bits.len() * 8 - self.capacity;
        if pad > 0 {
            let last = self.bits.len() - 1;
            self.bits[last] &= 0xFF << pad;
        }
    }
}
