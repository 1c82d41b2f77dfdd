use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of a node id on the wire. Ids are the first 8 bytes of a stable
/// server hash and never change for the lifetime of a server.
pub const ID_LEN: usize = 8;

/// Identity of a peer in a consensus group.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// Build an id from raw bytes, truncating or zero-padding to 8 bytes.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let mut id = [0u8; ID_LEN];
        let n = raw.len().min(ID_LEN);
        id[..n].copy_from_slice(&raw[..n]);
        NodeId(id)
    }

    /// Build an id from a server hash string (first 8 bytes).
    pub fn from_hash(hash: &str) -> Self {
        Self::from_bytes(hash.as_bytes())
    }

    /// A random alphanumeric id, for demos and tests.
    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        let mut rng = rand::thread_rng();
        for b in id.iter_mut() {
            *b = rng.sample(Alphanumeric);
        }
        NodeId(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// True when every byte is zero, the wire representation of "no id".
    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; ID_LEN]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            for b in self.0 {
                write!(f, "{}", b as char)?;
            }
            Ok(())
        } else {
            for b in self.0 {
                write!(f, "{:02x}", b)?;
            }
            Ok(())
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_pads_and_truncates() {
        let short = NodeId::from_bytes(b"abc");
        assert_eq!(short.as_bytes(), b"abc\0\0\0\0\0");

        let long = NodeId::from_bytes(b"abcdefghij");
        assert_eq!(long.as_bytes(), b"abcdefgh");
    }

    #[test]
    fn test_from_hash_takes_prefix() {
        let id = NodeId::from_hash("S1Nunr6R_extra_hash_material");
        assert_eq!(id.to_string(), "S1Nunr6R");
    }

    #[test]
    fn test_empty_id() {
        assert!(NodeId::from_bytes(&[]).is_empty());
        assert!(!NodeId::random().is_empty());
    }

    #[test]
    fn test_display_falls_back_to_hex() {
        let id = NodeId::from_bytes(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(id.to_string(), "0102030405060708");
    }
}
