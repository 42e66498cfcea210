use super::error::PeerError;
use super::message::{Handshake, Message, HANDSHAKE_LEN};
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Largest frame we accept: one chunk plus header slack.
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn send_handshake(
    stream: &mut TcpStream,
    handshake: &Handshake,
    deadline: Duration,
) -> Result<(), PeerError> {
    let data = handshake.encode();
    timeout(deadline, stream.write_all(&data))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Ok(())
}

pub async fn receive_handshake(
    stream: &mut TcpStream,
    deadline: Duration,
) -> Result<Handshake, PeerError> {
    let mut buf = [0u8; HANDSHAKE_LEN];
    timeout(deadline, stream.read_exact(&mut buf))
        .await
        .map_err(|_| PeerError::Timeout)??;
    Handshake::decode(&buf)
}

/// Framed read half of a peer connection.
pub struct MessageReader {
    half: OwnedReadHalf,
    buf: BytesMut,
    idle_timeout: Duration,
}

impl MessageReader {
    pub fn new(half: OwnedReadHalf, idle_timeout: Duration) -> Self {
        Self {
            half,
            buf: BytesMut::with_capacity(32 * 1024),
            idle_timeout,
        }
    }

    /// Reads one complete frame.
    ///
    /// A connection idle past the keep-alive span times out; peers are
    /// expected to keep-alive within it.
    pub async fn receive(&mut self) -> Result<Message, PeerError> {
        while self.buf.len() < 4 {
            self.fill().await?;
        }

        let length =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(PeerError::InvalidMessage(format!(
                "frame too large: {length}"
            )));
        }

        let total = 4 + length;
        while self.buf.len() < total {
            self.fill().await?;
        }

        let frame = self.buf.split_to(total);
        Message::decode(frame.freeze())
    }

    async fn fill(&mut self) -> Result<(), PeerError> {
        let n = timeout(self.idle_timeout, self.half.read_buf(&mut self.buf))
            .await
            .map_err(|_| PeerError::Timeout)??;
        if n == 0 {
            return Err(PeerError::ConnectionClosed);
        }
        Ok(())
    }
}

/// Framed write half of a peer connection.
pub struct MessageWriter {
    half: OwnedWriteHalf,
}

impl MessageWriter {
    pub fn new(half: OwnedWriteHalf) -> Self {
        Self { half }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), PeerError> {
        let data = message.encode();
        timeout(WRITE_TIMEOUT, self.half.write_all(&data))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Ok(())
    }
}
