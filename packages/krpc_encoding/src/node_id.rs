//! 160-bit node/info-hash identifiers.

use std::fmt;

use num_bigint::BigUint;
use rand::RngCore;
use thiserror::Error;

pub const NODE_ID_LEN: usize = 20;

/// An opaque 160-bit identifier: a DHT node id or a torrent info-hash (both
/// are 20-byte SHA-1-shaped values and share this representation).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected a {NODE_ID_LEN}-byte node id, got {0} bytes")]
pub struct NodeIdLengthError(pub usize);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> NodeId {
        NodeId(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<NodeId, NodeIdLengthError> {
        if bytes.len() != NODE_ID_LEN {
            return Err(NodeIdLengthError(bytes.len()));
        }
        let mut out = [0u8; NODE_ID_LEN];
        out.copy_from_slice(bytes);
        Ok(NodeId(out))
    }

    /// A fresh, uniformly random node id. Used for a provisional identity
    /// at startup and as the search target of the periodic discovery loop.
    pub fn random() -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Overwrites the first `n` bytes, leaving the rest untouched. Used to
    /// graft the BEP-42 prefix onto an already-generated random id.
    pub fn set_prefix(&mut self, prefix: &[u8]) {
        let n = prefix.len().min(NODE_ID_LEN);
        self.0[..n].copy_from_slice(&prefix[..n]);
    }

    /// The unsigned big-endian integer interpretation of the id, used for
    /// the XOR metric.
    pub fn as_uint(&self) -> BigUint {
        BigUint::from_bytes_be(&self.0)
    }

    /// XOR distance to `other`, as an unsigned integer: the metric used to
    /// rank nodes by closeness to a target.
    pub fn distance(&self, other: &NodeId) -> BigUint {
        let mut xor = [0u8; NODE_ID_LEN];
        for i in 0..NODE_ID_LEN {
            xor[i] = self.0[i] ^ other.0[i];
        }
        BigUint::from_bytes_be(&xor)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_zero_for_identical_ids() {
        let id = NodeId::random();
        assert_eq!(id.distance(&id), BigUint::from(0u32));
    }

    #[test]
    fn distance_ranks_closer_ids_lower() {
        let target = NodeId::from_bytes([0u8; NODE_ID_LEN]);
        let mut near = [0u8; NODE_ID_LEN];
        near[19] = 0x01;
        let mut far = [0u8; NODE_ID_LEN];
        far[0] = 0x80;
        let near = NodeId::from_bytes(near);
        let far = NodeId::from_bytes(far);
        assert!(target.distance(&near) < target.distance(&far));
    }

    #[test]
    fn set_prefix_overwrites_only_leading_bytes() {
        let mut id = NodeId::from_bytes([0xFFu8; NODE_ID_LEN]);
        id.set_prefix(&[0x01, 0x02, 0x03]);
        assert_eq!(id.as_bytes()[0..3], [0x01, 0x02, 0x03]);
        assert_eq!(id.as_bytes()[3], 0xFF);
    }
}
