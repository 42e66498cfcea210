//! Peer wire protocol.
//!
//! Implements the per-peer session state machine: handshake, message
//! framing, choke/interest bookkeeping, the fast extension (BEP-6), the
//! request-queue watermark discipline, and the per-torrent registry that
//! indexes live sessions for HAVE broadcast and endgame cancels.

mod error;
mod fast;
mod message;
mod peer_id;
mod registry;
mod session;
mod transport;

pub use error::PeerError;
pub use fast::{generate_allowed_fast_set, FastState};
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN};
pub use peer_id::PeerId;
pub use registry::{PeerCommand, PeerHandle, PeerRegistry};
pub use session::{Action, SessionParams, SessionState};
pub use transport::{receive_handshake, send_handshake, MessageReader, MessageWriter};

pub(crate) use session::{run_incoming, run_outgoing};
