//! This module defines types used to configure the engine and its parts.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use rand::Rng;

use crate::PeerId;

/// The Azureus-style client id prefix every peer id this engine generates
/// starts with.
const CLIENT_ID_PREFIX: &[u8; 8] = b"-bL0001-";

/// Generates a fresh peer id: the client id prefix followed by 12 random
/// ASCII digits. Called once at engine startup (§6 "peer_id (20 random
/// bytes, generated once at startup)"); the prefix is kept readable instead
/// of fully random so a `tcpdump` trace can be eyeballed back to this
/// client.
pub fn random_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_PREFIX);
    let mut rng = rand::thread_rng();
    for byte in &mut id[8..] {
        *byte = b'0' + rng.gen_range(0..10);
    }
    id
}

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default bitleech client id, [`CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf::default(),
            torrent: TorrentConf::new(download_dir),
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new(".")
    }
}

/// Configuration related to the engine itself, shared by every torrent it
/// drives.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
    /// An optional local address to bind outbound peer connections to.
    ///
    /// The source mixes the local bind address with the address used for
    /// outbound connections; this engine keeps the two concerns separate by
    /// exposing only this configuration knob and leaving the choice of
    /// syntax/parsing of it to the caller.
    pub bind_addr: Option<SocketAddr>,

    /// The port announced to trackers (§6 `AnnounceParams::port`). This
    /// engine never listens for inbound connections -- it is leecher-only --
    /// so this value has no corresponding open socket; it exists purely so
    /// announces carry a plausible port.
    pub announce_port: u16,
}

impl Default for EngineConf {
    fn default() -> Self {
        Self {
            client_id: random_peer_id(),
            bind_addr: None,
            announce_port: 6881,
        }
    }
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have. This is
    /// also the cap on the number of candidates tried during the initial
    /// fill (§4.5).
    pub max_connected_peer_count: usize,

    /// The starting value of the adaptive target peer count.
    pub initial_target_peer_count: usize,

    /// The upper bound the adaptive target peer count may grow to.
    pub target_peer_count_max: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to this value.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,

    /// How often the swarm checks whether it should replenish its peer set
    /// (§4.5 "Replenishment loop").
    pub replenish_interval: Duration,

    /// How many new connection attempts the replenishment loop makes per
    /// tick.
    pub replenish_batch: usize,

    /// How often the swarm samples verified-piece throughput to adjust its
    /// target peer count (§4.5 "Adaptive target").
    pub adaptive_target_interval: Duration,

    /// The minimum number of pieces that must verify within one adaptive
    /// target sampling window before the target is lowered.
    pub adaptive_target_high_watermark: usize,

    /// The maximum number of pieces that may verify within one adaptive
    /// target sampling window before the target is raised.
    pub adaptive_target_low_watermark: usize,

    /// How often the swarm re-announces to the tracker to refresh its
    /// candidate peer pool (§4.5 "Tracker refresh").
    pub tracker_refresh_interval: Duration,

    /// How long the swarm may go without verifying a single piece before it
    /// is considered stalled (§4.5 "Stall recovery", §5).
    pub stall_timeout: Duration,

    /// How many aggressive recovery rounds the swarm attempts before giving
    /// up and reporting [`crate::error::EngineError::SwarmStalled`].
    pub stall_recovery_rounds: usize,

    /// How many extra sessions each stall recovery round opens.
    pub stall_recovery_batch: usize,

    /// TCP connect timeout for a single peer (§4.2 step 1).
    pub connect_timeout: Duration,

    /// Timeout waiting for the peer's handshake (§4.2 step 2).
    pub handshake_timeout: Duration,

    /// Socket read timeout inside a session's main loop (§4.2, §5).
    pub read_timeout: Duration,

    /// Time since the last frame after which a `KeepAlive` is sent.
    pub keepalive_interval: Duration,

    /// Time since the last frame, while choked, after which `Interested` is
    /// resent.
    pub reinterest_interval: Duration,

    /// Time without block progress on the current piece after which
    /// outstanding requests for it are reissued.
    pub block_reissue_interval: Duration,

    /// Time without any progress on a single block after which it is force-
    /// reissued, bypassing the normal reissue interval.
    pub block_force_reissue_interval: Duration,

    /// Maximum number of force-reissues allowed per burst (§4.2).
    pub max_force_reissues_per_burst: usize,

    /// Number of consecutive I/O errors that end a session.
    pub max_consecutive_errors: usize,

    /// Time since the last frame after which a session is ended outright.
    pub inactivity_timeout: Duration,

    /// Maximum number of outstanding block requests a session keeps open at
    /// once (§4.2 "Request pipelining").
    pub max_pipelined_requests: usize,

    /// Soft cap on the number of simultaneously in-progress pieces (§4.3
    /// `begin_piece`).
    pub max_in_progress_pieces: usize,

    /// How old an in-progress piece's `last_activity_ts` must be before it
    /// is considered stale and swept back to `Missing`.
    pub piece_stale_after: Duration,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in
            // mind not to overwhelm the host; also the initial-fill cap.
            max_connected_peer_count: 50,
            initial_target_peer_count: 10,
            target_peer_count_max: 30,
            announce_interval: Duration::from_secs(5 * 60),
            tracker_error_threshold: 15,
            replenish_interval: Duration::from_secs(5),
            replenish_batch: 3,
            adaptive_target_interval: Duration::from_secs(30),
            adaptive_target_high_watermark: 20,
            adaptive_target_low_watermark: 5,
            tracker_refresh_interval: Duration::from_secs(5 * 60),
            stall_timeout: Duration::from_secs(2 * 60),
            stall_recovery_rounds: 3,
            stall_recovery_batch: 5,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            reinterest_interval: Duration::from_secs(15),
            block_reissue_interval: Duration::from_secs(10),
            block_force_reissue_interval: Duration::from_secs(60),
            max_force_reissues_per_burst: 5,
            max_consecutive_errors: 5,
            inactivity_timeout: Duration::from_secs(90),
            max_pipelined_requests: 16,
            max_in_progress_pieces: 50,
            piece_stale_after: Duration::from_secs(2 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let conf = TorrentConf::new("/tmp/downloads");
        assert_eq!(conf.max_pipelined_requests, 16);
        assert_eq!(conf.max_in_progress_pieces, 50);
        assert_eq!(conf.inactivity_timeout, Duration::from_secs(90));
        assert_eq!(conf.stall_recovery_rounds, 3);
    }

    #[test]
    fn random_peer_id_keeps_client_prefix() {
        let id = random_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_PREFIX);
        assert!(id[8..].iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn random_peer_id_varies_across_calls() {
        // not a strict guarantee, but with 10^12 possibilities a collision
        // across a handful of calls would indicate a broken rng, not bad luck
        let ids: std::collections::HashSet<_> =
            (0..8).map(|_| random_peer_id()).collect();
        assert!(ids.len() > 1);
    }
}
