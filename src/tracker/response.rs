use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde_bytes::ByteBuf;

use crate::error::TrackerError;

/// The bencoded response body of an HTTP tracker announce (BEP 3).
///
/// Only the compact peer list representation (BEP 23) is supported, as
/// every modern tracker offers it and it is dramatically cheaper to parse
/// than the original list-of-dictionaries form.
#[derive(Debug, Deserialize)]
pub(crate) struct HttpAnnounceResponse {
    #[serde(rename = "failure reason")]
    pub failure_reason: Option<String>,
    pub interval: Option<i64>,
    #[serde(rename = "min interval")]
    pub min_interval: Option<i64>,
    pub peers: Option<ByteBuf>,
}

impl HttpAnnounceResponse {
    /// Parses the `peers` field's compact representation into socket
    /// addresses: a flat byte string of 6-byte records, each a 4-byte
    /// big-endian IPv4 address followed by a 2-byte big-endian port.
    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>, TrackerError> {
        let Some(peers) = &self.peers else {
            return Ok(Vec::new());
        };
        parse_compact_peers(peers)
    }
}

/// Parses a BEP 23 compact peer list (a flat byte string of 6-byte
/// records) into socket addresses. Shared by the HTTP and UDP tracker
/// clients, which both receive peers in this form.
///
/// A trailing partial record (length `6n+k` for `k<6`) is ignored rather
/// than rejected: trackers occasionally pad or truncate the field, and the
/// leading `n` complete records are still perfectly usable.
pub(crate) fn parse_compact_peers(
    bytes: &[u8],
) -> Result<Vec<SocketAddr>, TrackerError> {
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect())
}
