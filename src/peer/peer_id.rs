use rand::Rng as _;
use std::fmt;

/// 20-byte peer identifier exchanged in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    /// Generates a fresh id: our Azureus-style client tag followed by
    /// twelve random bytes.
    pub fn generate() -> Self {
        let mut id = [0u8; 20];
        let tag = b"-BS0001-";
        id[..tag.len()].copy_from_slice(tag);
        rand::rng().fill(&mut id[tag.len()..]);
        Self(id)
    }

    /// The six-character client tag, when the id follows the Azureus
    /// convention of wrapping it in dashes.
    pub fn client_id(&self) -> Option<&str> {
        let head = &self.0[..8];
        if head.starts_with(b"-") && head.ends_with(b"-") {
            std::str::from_utf8(&head[1..7]).ok()
        } else {
            None
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Azureus-style ids render as tag plus hex tail; anything else
        // as plain hex.
        let tail = match self.client_id() {
            Some(tag) => {
                write!(f, "{tag}:")?;
                &self.0[8..]
            }
            None => &self.0[..],
        };
        for byte in tail {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
