use std::{net::SocketAddr, time::Duration};

use rand::Rng;
use tokio::{net::UdpSocket, time::timeout};

use super::{response::parse_compact_peers, AnnounceEvent, AnnounceParams};
use crate::error::TrackerError;

/// The magic constant that identifies the very first connect request of a
/// UDP tracker session (BEP 15).
const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;

/// BEP 15's retransmission schedule: `15 * 2^n` seconds, for up to 3
/// attempts per endpoint, after which the tracker is considered
/// unreachable (§6, SPEC_FULL §6.2).
const MAX_ATTEMPTS: u32 = 3;

fn retry_timeout(attempt: u32) -> Duration {
    Duration::from_secs(15 * 2u64.pow(attempt))
}

/// Sends `datagram` and waits for a response, retrying with BEP 15's
/// exponential backoff schedule for up to `MAX_ATTEMPTS` attempts.
async fn send_and_receive(
    socket: &UdpSocket,
    datagram: &[u8],
) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 2048];
    for attempt in 0..MAX_ATTEMPTS {
        socket.send(datagram).await.map_err(TrackerError::Udp)?;
        match timeout(retry_timeout(attempt), socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                return Ok(buf);
            }
            Ok(Err(e)) => return Err(TrackerError::Udp(e)),
            Err(_elapsed) => continue,
        }
    }
    Err(TrackerError::NoResponse(MAX_ATTEMPTS as usize))
}

/// Performs the connect handshake, returning the connection id to use for
/// the subsequent announce.
async fn connect(socket: &UdpSocket) -> Result<u64, TrackerError> {
    let transaction_id: u32 = rand::thread_rng().gen();

    let mut req = Vec::with_capacity(16);
    req.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
    req.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
    req.extend_from_slice(&transaction_id.to_be_bytes());

    let resp = send_and_receive(socket, &req).await?;
    if resp.len() < 16 {
        return Err(TrackerError::MalformedPeers);
    }

    let action = u32::from_be_bytes(resp[0..4].try_into().unwrap());
    let resp_transaction_id = u32::from_be_bytes(resp[4..8].try_into().unwrap());
    if resp_transaction_id != transaction_id {
        return Err(TrackerError::MismatchedTransaction);
    }
    if action != ACTION_CONNECT {
        return Err(TrackerError::MalformedPeers);
    }

    Ok(u64::from_be_bytes(resp[8..16].try_into().unwrap()))
}

fn event_code(event: AnnounceEvent) -> u32 {
    match event {
        AnnounceEvent::None => 0,
        AnnounceEvent::Completed => 1,
        AnnounceEvent::Started => 2,
        AnnounceEvent::Stopped => 3,
    }
}

/// Connects to and announces on a UDP tracker, per BEP 15, returning the
/// peers it offers and, if given, its re-announce interval in seconds.
pub(crate) async fn announce(
    addr: SocketAddr,
    params: &AnnounceParams,
) -> Result<(Vec<SocketAddr>, Option<i64>), TrackerError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let socket = UdpSocket::bind(bind_addr).await.map_err(TrackerError::Udp)?;
    socket.connect(addr).await.map_err(TrackerError::Udp)?;

    let connection_id = connect(&socket).await?;
    let transaction_id: u32 = rand::thread_rng().gen();
    let key: u32 = rand::thread_rng().gen();

    let mut req = Vec::with_capacity(98);
    req.extend_from_slice(&connection_id.to_be_bytes());
    req.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    req.extend_from_slice(&transaction_id.to_be_bytes());
    req.extend_from_slice(&params.info_hash);
    req.extend_from_slice(&params.peer_id);
    req.extend_from_slice(&params.downloaded.to_be_bytes());
    req.extend_from_slice(&params.left.to_be_bytes());
    req.extend_from_slice(&params.uploaded.to_be_bytes());
    req.extend_from_slice(&event_code(params.event).to_be_bytes());
    req.extend_from_slice(&0u32.to_be_bytes()); // ip address: 0 = use sender's
    req.extend_from_slice(&key.to_be_bytes());
    req.extend_from_slice(&(-1i32).to_be_bytes()); // num_want: -1 = default
    req.extend_from_slice(&params.port.to_be_bytes());

    let resp = send_and_receive(&socket, &req).await?;
    if resp.len() < 20 {
        return Err(TrackerError::MalformedPeers);
    }

    let action = u32::from_be_bytes(resp[0..4].try_into().unwrap());
    let resp_transaction_id = u32::from_be_bytes(resp[4..8].try_into().unwrap());
    if resp_transaction_id != transaction_id {
        return Err(TrackerError::MismatchedTransaction);
    }
    if action != ACTION_ANNOUNCE {
        return Err(TrackerError::MalformedPeers);
    }

    let interval = i64::from(u32::from_be_bytes(resp[8..12].try_into().unwrap()));
    let peers = parse_compact_peers(&resp[20..])?;

    Ok((peers, Some(interval)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_timeout_doubles() {
        assert_eq!(retry_timeout(0), Duration::from_secs(15));
        assert_eq!(retry_timeout(1), Duration::from_secs(30));
        assert_eq!(retry_timeout(2), Duration::from_secs(60));
    }

    #[test]
    fn test_event_code_mapping() {
        assert_eq!(event_code(AnnounceEvent::None), 0);
        assert_eq!(event_code(AnnounceEvent::Completed), 1);
        assert_eq!(event_code(AnnounceEvent::Started), 2);
        assert_eq!(event_code(AnnounceEvent::Stopped), 3);
    }
}
