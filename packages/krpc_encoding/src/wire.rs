//! Fixed-width big-endian integer packing and the compact `(ip, port)` /
//! `(id, ip, port)` encodings used throughout the KRPC wire format.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

use crate::node_id::{NodeId, NODE_ID_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer too short to decode")]
    Truncated,
}

/// A remote endpoint: an IPv4 address and a UDP port. Ports below 1024 are
/// always rejected on ingest (see [`Endpoint::is_privileged`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Endpoint {
        Endpoint { ip, port }
    }

    /// Ports below 1024 are never admitted into the routing table.
    pub fn is_privileged(&self) -> bool {
        self.port < 1024
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

pub fn encode_uint16(value: u16) -> [u8; 2] {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value);
    buf
}

pub fn encode_uint32(value: u32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    buf
}

pub fn encode_uint64(value: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, value);
    buf
}

pub fn encode_int32(value: i32) -> [u8; 4] {
    let mut buf = [0u8; 4];
    BigEndian::write_i32(&mut buf, value);
    buf
}

pub fn decode_uint16(bytes: &[u8]) -> Result<u16, WireError> {
    if bytes.len() < 2 {
        return Err(WireError::Truncated);
    }
    Ok(BigEndian::read_u16(bytes))
}

pub fn decode_uint32(bytes: &[u8]) -> Result<u32, WireError> {
    if bytes.len() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(BigEndian::read_u32(bytes))
}

pub fn decode_uint64(bytes: &[u8]) -> Result<u64, WireError> {
    if bytes.len() < 8 {
        return Err(WireError::Truncated);
    }
    Ok(BigEndian::read_u64(bytes))
}

pub fn encode_ip(ip: Ipv4Addr) -> [u8; 4] {
    ip.octets()
}

pub fn decode_ip(bytes: &[u8]) -> Result<Ipv4Addr, WireError> {
    if bytes.len() < 4 {
        return Err(WireError::Truncated);
    }
    Ok(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

/// Compact endpoint encoding: 4-byte IPv4 big-endian, then 2-byte port
/// big-endian — 6 bytes total, no delimiters.
pub fn encode_connection(endpoint: &Endpoint) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[0..4].copy_from_slice(&encode_ip(endpoint.ip));
    out[4..6].copy_from_slice(&encode_uint16(endpoint.port));
    out
}

pub fn decode_connection(bytes: &[u8]) -> Result<Endpoint, WireError> {
    if bytes.len() < 6 {
        return Err(WireError::Truncated);
    }
    Ok(Endpoint::new(
        decode_ip(&bytes[0..4])?,
        decode_uint16(&bytes[4..6])?,
    ))
}

/// Scans `data` for back-to-back 6-byte compact endpoints, silently
/// dropping a trailing partial endpoint and any endpoint with a privileged
/// port.
pub fn decode_connections(data: &[u8]) -> Vec<Endpoint> {
    data.chunks_exact(6)
        .filter_map(|chunk| decode_connection(chunk).ok())
        .filter(|ep| !ep.is_privileged())
        .collect()
}

/// Compact node encoding: 20-byte id followed by the 6-byte compact
/// endpoint — 26 bytes total, concatenated without delimiters.
pub fn encode_nodes(nodes: &[(NodeId, Endpoint)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * 26);
    for (id, endpoint) in nodes {
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&encode_connection(endpoint));
    }
    out
}

/// Decodes back-to-back compact node records, silently dropping a trailing
/// partial record and any record whose port is privileged.
pub fn decode_nodes(data: &[u8]) -> Vec<(NodeId, Endpoint)> {
    data.chunks_exact(NODE_ID_LEN + 6)
        .filter_map(|chunk| {
            let id = NodeId::try_from_slice(&chunk[0..NODE_ID_LEN]).ok()?;
            let endpoint = decode_connection(&chunk[NODE_ID_LEN..]).ok()?;
            if endpoint.is_privileged() {
                None
            } else {
                Some((id, endpoint))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_ip() {
        assert_eq!(encode_ip("127.0.2.1".parse().unwrap()), [0x7f, 0x00, 0x02, 0x01]);
        assert_eq!(decode_ip(&[0x7f, 0x00, 0x02, 0x01]).unwrap(), Ipv4Addr::new(127, 0, 2, 1));
    }

    #[test]
    fn encode_decode_uint16() {
        assert_eq!(encode_uint16(65535), [0xff, 0xff]);
        assert_eq!(encode_uint16(1234), [0x04, 0xd2]);
        assert_eq!(decode_uint16(&[0xff, 0xff]).unwrap(), 65535);
        assert_eq!(decode_uint16(&[0xf0, 0x00]).unwrap(), 61440);
    }

    #[test]
    fn encode_decode_uint32() {
        assert_eq!(encode_uint32(65536), [0x00, 0x01, 0x00, 0x00]);
        assert_eq!(encode_uint32(4294967295), [0xff, 0xff, 0xff, 0xff]);
        assert_eq!(decode_uint32(&[0xff, 0xff, 0xff, 0xff]).unwrap(), 2u32.pow(32) - 1);
        assert_eq!(decode_uint32(&[0xba, 0xdf, 0x00, 0x0d]).unwrap(), 0xBADF000D);
    }

    #[test]
    fn encode_decode_uint64() {
        assert_eq!(encode_uint64(0), [0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            encode_uint64(1234567890),
            [0x00, 0x00, 0x00, 0x00, 0x49, 0x96, 0x02, 0xd2]
        );
        assert_eq!(
            decode_uint64(&[0xff; 8]).unwrap(),
            u64::MAX
        );
        assert_eq!(
            decode_uint64(&[0xde, 0xad, 0xbe, 0xef, 0xba, 0xdf, 0x00, 0x0d]).unwrap(),
            0xDEADBEEFBADF000D
        );
    }

    #[test]
    fn encode_int32_negative() {
        assert_eq!(encode_int32(-1), [0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn encode_decode_connection() {
        let ep = Endpoint::new("111.122.133.144".parse().unwrap(), 5900);
        let encoded = encode_connection(&ep);
        assert_eq!(encoded, [0x6f, 0x7a, 0x85, 0x90, 0x17, 0x0c]);
        assert_eq!(decode_connection(&encoded).unwrap(), ep);
    }

    #[test]
    fn decode_connections_filters_privileged_ports() {
        let good = Endpoint::new("1.2.3.4".parse().unwrap(), 6881);
        let bad = Endpoint::new("1.2.3.4".parse().unwrap(), 80);
        let mut data = Vec::new();
        data.extend_from_slice(&encode_connection(&good));
        data.extend_from_slice(&encode_connection(&bad));
        let decoded = decode_connections(&data);
        assert_eq!(decoded, vec![good]);
    }

    #[test]
    fn encode_decode_nodes_round_trip() {
        let id = NodeId::random();
        let ep = Endpoint::new("10.0.0.1".parse().unwrap(), 6881);
        let blob = encode_nodes(&[(id, ep)]);
        assert_eq!(blob.len(), 26);
        let decoded = decode_nodes(&blob);
        assert_eq!(decoded, vec![(id, ep)]);
    }

    #[test]
    fn decode_nodes_drops_privileged_port_entries() {
        let id = NodeId::random();
        let bad_ep = Endpoint::new("10.0.0.1".parse().unwrap(), 80);
        let blob = encode_nodes(&[(id, bad_ep)]);
        assert!(decode_nodes(&blob).is_empty());
    }
}
