//! Peer identity and group-address types.

use crate::consts::{PEER_ID_SIZE, RAW_ID_PREFIX, RAW_ID_SIZE};
use ring::digest;
use std::fmt;

/// A 32-byte opaque peer identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(pub [u8; PEER_ID_SIZE]);

impl PeerId {
    /// Creates a peer id from bytes.
    pub fn new(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the 34-byte raw wire form (`21 0F` prefix + id).
    pub fn raw(&self) -> [u8; RAW_ID_SIZE] {
        let mut out = [0u8; RAW_ID_SIZE];
        out[..2].copy_from_slice(&RAW_ID_PREFIX);
        out[2..].copy_from_slice(&self.0);
        out
    }

    /// Parses a raw wire token, validating the `21 0F` prefix.
    pub fn from_raw(raw: &[u8]) -> Option<Self> {
        if raw.len() != RAW_ID_SIZE || raw[..2] != RAW_ID_PREFIX {
            return None;
        }
        let mut bytes = [0u8; PEER_ID_SIZE];
        bytes.copy_from_slice(&raw[2..]);
        Some(Self(bytes))
    }

    /// Creates a peer id from a 64-char hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != PEER_ID_SIZE {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; PEER_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns the id as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the first 8 hex characters, for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Computes the group address of this peer.
    pub fn group_address(&self) -> GroupAddress {
        GroupAddress::of(self)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({}...)", self.short_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// SHA-256 of a raw peer id; the key of the distance ring.
///
/// Ordering over the digest bytes equals the lexicographic order of the
/// 64-char lowercase hex rendering, which is the ring order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupAddress([u8; PEER_ID_SIZE]);

impl GroupAddress {
    /// Computes the group address of a peer id.
    pub fn of(peer_id: &PeerId) -> Self {
        Self::from_raw_id(&peer_id.raw())
    }

    /// Computes the group address from a raw 34-byte id.
    pub fn from_raw_id(raw: &[u8; RAW_ID_SIZE]) -> Self {
        let hash = digest::digest(&digest::SHA256, raw);
        let mut bytes = [0u8; PEER_ID_SIZE];
        bytes.copy_from_slice(hash.as_ref());
        Self(bytes)
    }

    /// Builds a group address directly from digest bytes (tests).
    pub fn from_bytes(bytes: [u8; PEER_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the 64-char lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the first 16 hex digits as an unsigned 64-bit value.
    pub fn prefix64(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().unwrap())
    }
}

impl fmt::Debug for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupAddress({}...)", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_roundtrip() {
        let id = PeerId::new([7u8; PEER_ID_SIZE]);
        let raw = id.raw();
        assert_eq!(raw.len(), RAW_ID_SIZE);
        assert_eq!(&raw[..2], &RAW_ID_PREFIX);
        assert_eq!(PeerId::from_raw(&raw), Some(id));
    }

    #[test]
    fn test_from_raw_rejects_bad_prefix() {
        let mut raw = PeerId::new([7u8; PEER_ID_SIZE]).raw();
        raw[0] = 0x22;
        assert_eq!(PeerId::from_raw(&raw), None);
        assert_eq!(PeerId::from_raw(&raw[..33]), None);
    }

    #[test]
    fn test_group_address_deterministic() {
        let id = PeerId::new([0xAB; PEER_ID_SIZE]);
        let a = id.group_address();
        let b = GroupAddress::from_raw_id(&id.raw());
        assert_eq!(a, b);
        assert_eq!(a.to_hex().len(), 64);
        assert!(a.to_hex().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hex_order_matches_byte_order() {
        let mut lo = [0u8; PEER_ID_SIZE];
        let mut hi = [0u8; PEER_ID_SIZE];
        lo[0] = 0x20;
        hi[0] = 0xC0;
        let (lo, hi) = (GroupAddress::from_bytes(lo), GroupAddress::from_bytes(hi));
        assert!(lo < hi);
        assert!(lo.to_hex() < hi.to_hex());
    }

    #[test]
    fn test_prefix64() {
        let mut bytes = [0u8; PEER_ID_SIZE];
        bytes[..8].copy_from_slice(&0x8000_0000_0000_0001u64.to_be_bytes());
        let ga = GroupAddress::from_bytes(bytes);
        assert_eq!(ga.prefix64(), 0x8000_0000_0000_0001);
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = PeerId::new([0x5A; PEER_ID_SIZE]);
        assert_eq!(PeerId::from_hex(&id.to_hex()).unwrap(), id);
        assert!(PeerId::from_hex("abcd").is_err());
    }
}
