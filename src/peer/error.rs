use crate::pieces::PieceSetError;
use thiserror::Error;

/// Errors that terminate a peer session.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer took too long to respond.
    #[error("timeout")]
    Timeout,

    /// The connection was closed by the peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The handshake record was malformed.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// The peer's info hash does not match this torrent.
    #[error("info hash mismatch")]
    InfoHashMismatch,

    /// Opcode outside the protocol.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// A message payload did not match its opcode.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The peer's bitfield failed to parse.
    #[error("malformed bitfield: {0}")]
    MalformedBitfield(#[from] PieceSetError),

    /// A bitfield arrived after the piece set was already known.
    #[error("bitfield after piece set was known")]
    BitfieldAfterPieceSet,

    /// HAVE (or SUGGEST et al.) referenced a piece outside the torrent.
    #[error("invalid piece index: {0}")]
    InvalidPieceIndex(u32),

    /// A fast-extension message arrived without the extension negotiated.
    #[error("fast extension message without negotiation")]
    FastNotNegotiated,

    /// An extended message arrived without extension-protocol negotiation.
    #[error("extended message without negotiation")]
    ExtendedNotNegotiated,

    /// A second session for the same peer id or address.
    #[error("duplicate peer")]
    DuplicatePeer,

    /// The torrent's peer slots are exhausted.
    #[error("too many peers")]
    TooManyPeers,
}
