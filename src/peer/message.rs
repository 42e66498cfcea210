use super::error::PeerError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The BitTorrent protocol identifier.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";
/// Length of the handshake record in bytes.
pub const HANDSHAKE_LEN: usize = 68;

/// Message type identifiers in the peer wire protocol.
///
/// Each message except keep-alive carries a one-byte ID after the length
/// prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    /// DHT port announcement; parsed and ignored.
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = PeerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(PeerError::UnknownMessageId(value)),
        }
    }
}

/// The 68-byte handshake record.
///
/// `pstrlen=19 || "BitTorrent protocol" || reserved:8 || info_hash:20 ||
/// peer_id:20`. Reserved-byte flags: byte 5 bit 4 is the extension
/// protocol, byte 7 bit 2 the fast extension.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub reserved: [u8; 8],
}

impl Handshake {
    /// Creates our handshake, advertising the fast extension and the
    /// extension protocol.
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10;
        reserved[7] |= 0x04;
        Self {
            info_hash,
            peer_id,
            reserved,
        }
    }

    pub fn supports_fast(&self) -> bool {
        (self.reserved[7] & 0x04) != 0
    }

    pub fn supports_extended(&self) -> bool {
        (self.reserved[5] & 0x10) != 0
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(19);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Decodes a handshake record; wrong pstrlen or protocol string is
    /// fatal for the session.
    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(PeerError::InvalidHandshake);
        }
        if data[0] != 19 || &data[1..20] != PROTOCOL {
            return Err(PeerError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        Ok(Self {
            info_hash,
            peer_id,
            reserved,
        })
    }
}

/// A peer wire message: 4-byte big-endian length prefix, then a 1-byte ID
/// and payload. A zero length is a keep-alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bytes),
    Request { index: u32, offset: u32, length: u32 },
    Piece { index: u32, offset: u32, data: Bytes },
    Cancel { index: u32, offset: u32, length: u32 },
    Port(u16),
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, offset: u32, length: u32 },
    AllowedFast { piece: u32 },
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::put_bare(&mut buf, MessageId::Choke),
            Message::Unchoke => Self::put_bare(&mut buf, MessageId::Unchoke),
            Message::Interested => Self::put_bare(&mut buf, MessageId::Interested),
            Message::NotInterested => Self::put_bare(&mut buf, MessageId::NotInterested),
            Message::Have { piece } => Self::put_piece_index(&mut buf, MessageId::Have, *piece),
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                offset,
                length,
            } => Self::put_range(&mut buf, MessageId::Request, *index, *offset, *length),
            Message::Piece {
                index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(*index);
                buf.put_u32(*offset);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                offset,
                length,
            } => Self::put_range(&mut buf, MessageId::Cancel, *index, *offset, *length),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(MessageId::Port as u8);
                buf.put_u16(*port);
            }
            Message::Suggest { piece } => {
                Self::put_piece_index(&mut buf, MessageId::Suggest, *piece)
            }
            Message::HaveAll => Self::put_bare(&mut buf, MessageId::HaveAll),
            Message::HaveNone => Self::put_bare(&mut buf, MessageId::HaveNone),
            Message::Reject {
                index,
                offset,
                length,
            } => Self::put_range(&mut buf, MessageId::Reject, *index, *offset, *length),
            Message::AllowedFast { piece } => {
                Self::put_piece_index(&mut buf, MessageId::AllowedFast, *piece)
            }
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }

        buf.freeze()
    }

    /// Decodes a framed message. `data` must contain the length prefix and
    /// exactly the frame it announces; an unknown opcode is an error the
    /// session treats as fatal.
    pub fn decode(mut data: Bytes) -> Result<Self, PeerError> {
        if data.len() < 4 {
            return Err(PeerError::InvalidMessage("missing length prefix".into()));
        }

        let length = data.get_u32() as usize;
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if data.remaining() < length {
            return Err(PeerError::InvalidMessage("truncated frame".into()));
        }

        let id = MessageId::try_from(data.get_u8())?;

        match id {
            MessageId::Choke => Ok(Message::Choke),
            MessageId::Unchoke => Ok(Message::Unchoke),
            MessageId::Interested => Ok(Message::Interested),
            MessageId::NotInterested => Ok(Message::NotInterested),
            MessageId::Have => Ok(Message::Have {
                piece: Self::get_u32(&mut data, "have")?,
            }),
            MessageId::Bitfield => Ok(Message::Bitfield(data.copy_to_bytes(length - 1))),
            MessageId::Request => {
                let (index, offset, len) = Self::get_range(&mut data, "request")?;
                Ok(Message::Request {
                    index,
                    offset,
                    length: len,
                })
            }
            MessageId::Piece => {
                if data.remaining() < 8 {
                    return Err(PeerError::InvalidMessage("piece too short".into()));
                }
                let index = data.get_u32();
                let offset = data.get_u32();
                Ok(Message::Piece {
                    index,
                    offset,
                    data: data.copy_to_bytes(length - 9),
                })
            }
            MessageId::Cancel => {
                let (index, offset, len) = Self::get_range(&mut data, "cancel")?;
                Ok(Message::Cancel {
                    index,
                    offset,
                    length: len,
                })
            }
            MessageId::Port => {
                if data.remaining() < 2 {
                    return Err(PeerError::InvalidMessage("port too short".into()));
                }
                Ok(Message::Port(data.get_u16()))
            }
            MessageId::Suggest => Ok(Message::Suggest {
                piece: Self::get_u32(&mut data, "suggest")?,
            }),
            MessageId::HaveAll => Ok(Message::HaveAll),
            MessageId::HaveNone => Ok(Message::HaveNone),
            MessageId::Reject => {
                let (index, offset, len) = Self::get_range(&mut data, "reject")?;
                Ok(Message::Reject {
                    index,
                    offset,
                    length: len,
                })
            }
            MessageId::AllowedFast => Ok(Message::AllowedFast {
                piece: Self::get_u32(&mut data, "allowed fast")?,
            }),
            MessageId::Extended => {
                if data.remaining() < 1 {
                    return Err(PeerError::InvalidMessage("extended too short".into()));
                }
                let ext_id = data.get_u8();
                Ok(Message::Extended {
                    id: ext_id,
                    payload: data.copy_to_bytes(length - 2),
                })
            }
        }
    }

    fn put_bare(buf: &mut BytesMut, id: MessageId) {
        buf.put_u32(1);
        buf.put_u8(id as u8);
    }

    fn put_piece_index(buf: &mut BytesMut, id: MessageId, piece: u32) {
        buf.put_u32(5);
        buf.put_u8(id as u8);
        buf.put_u32(piece);
    }

    fn put_range(buf: &mut BytesMut, id: MessageId, index: u32, offset: u32, length: u32) {
        buf.put_u32(13);
        buf.put_u8(id as u8);
        buf.put_u32(index);
        buf.put_u32(offset);
        buf.put_u32(length);
    }

    fn get_u32(data: &mut Bytes, what: &str) -> Result<u32, PeerError> {
        if data.remaining() < 4 {
            return Err(PeerError::InvalidMessage(format!("{what} too short")));
        }
        Ok(data.get_u32())
    }

    fn get_range(data: &mut Bytes, what: &str) -> Result<(u32, u32, u32), PeerError> {
        if data.remaining() < 12 {
            return Err(PeerError::InvalidMessage(format!("{what} too short")));
        }
        Ok((data.get_u32(), data.get_u32(), data.get_u32()))
    }
}
