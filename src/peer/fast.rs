use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::net::IpAddr;

/// Number of allowed-fast pieces we advertise (BEP-6 recommendation).
pub const ALLOWED_FAST_SET_SIZE: usize = 10;

/// Per-session fast-extension state.
#[derive(Debug, Clone, Default)]
pub struct FastState {
    /// Pieces the remote allows us to request while it chokes us.
    pub allowed_incoming: HashSet<u32>,
    /// Pieces we allow the remote to request while we choke it.
    pub allowed_outgoing: HashSet<u32>,
    /// Pieces the remote suggested; may bias selection, ignoring is valid.
    pub suggested: Vec<u32>,
}

impl FastState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_allowed_incoming(&mut self, piece: u32) {
        self.allowed_incoming.insert(piece);
    }

    pub fn add_suggested(&mut self, piece: u32) {
        if !self.suggested.contains(&piece) {
            self.suggested.push(piece);
        }
    }

    /// Whether we may request this piece while choked by the remote.
    pub fn may_request_choked(&self, piece: u32) -> bool {
        self.allowed_incoming.contains(&piece)
    }

    /// Whether a request from a peer we choke should be served anyway.
    pub fn should_serve_choked(&self, piece: u32) -> bool {
        self.allowed_outgoing.contains(&piece)
    }
}

/// Generates the canonical allowed-fast set for a peer (BEP-6).
///
/// The set is a deterministic function of the peer's masked address (/24
/// for IPv4, first four bytes for IPv6) and the info hash: the seed is
/// hashed, each of the digest's five big-endian words names a piece
/// modulo the piece count, and the digest is rehashed until enough
/// distinct pieces have been drawn.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    num_pieces: u32,
    set_size: usize,
) -> Vec<u32> {
    if num_pieces == 0 {
        return Vec::new();
    }
    let want = set_size.min(num_pieces as usize);

    let masked: [u8; 4] = match peer_ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            [a, b, c, 0]
        }
        IpAddr::V6(v6) => {
            let mut prefix = [0u8; 4];
            prefix.copy_from_slice(&v6.octets()[..4]);
            prefix
        }
    };

    let mut digest: [u8; 20] = {
        let mut hasher = Sha1::new();
        hasher.update(masked);
        hasher.update(info_hash);
        hasher.finalize().into()
    };

    let mut seen = HashSet::with_capacity(want);
    let mut grants = Vec::with_capacity(want);
    loop {
        for word in 0..5 {
            let i = word * 4;
            let piece =
                u32::from_be_bytes([digest[i], digest[i + 1], digest[i + 2], digest[i + 3]])
                    % num_pieces;
            if seen.insert(piece) {
                grants.push(piece);
                if grants.len() == want {
                    return grants;
                }
            }
        }
        let mut hasher = Sha1::new();
        hasher.update(digest);
        digest = hasher.finalize().into();
    }
}
