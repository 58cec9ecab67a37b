//! Drives a single torrent's peer population (§4.5): fills it from the
//! tracker's candidate list, keeps it topped up, adapts its target size to
//! observed throughput, and recovers from stalls.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
};

use rand::seq::SliceRandom;
use tokio::{sync::Mutex as AsyncMutex, task::JoinSet, time::MissedTickBehavior};

use crate::{
    conf::TorrentConf,
    disk::FileMapper,
    error::{EngineError, PeerError},
    metrics::Metrics,
    peer::PeerSession,
    piece::PieceEngine,
    torrent::Torrent,
    tracker::{AnnounceEvent, AnnounceParams, TrackerClient},
    PeerId,
};

/// Everything a torrent's peer sessions need and would otherwise have to be
/// threaded through piecemeal: the shared piece table (behind the single
/// mutex that is this engine's sole point of cross-session coordination),
/// the disk writer, and the metrics sink.
pub(crate) struct Shared {
    pub torrent: Arc<Torrent>,
    pub conf: TorrentConf,
    pub client_id: PeerId,
    pub announce_port: u16,
    pub piece_engine: AsyncMutex<PieceEngine>,
    pub disk: FileMapper,
    pub metrics: Arc<Metrics>,
    pub total_len: u64,
}

/// Owns a torrent's live peer connections and keeps the pool healthy for
/// the lifetime of the download.
pub(crate) struct Swarm {
    shared: Arc<Shared>,
    tracker: TrackerClient,
    candidates: Vec<SocketAddr>,
    tried: HashSet<SocketAddr>,
    sessions: JoinSet<(SocketAddr, Result<(), PeerError>)>,
    target_peer_count: usize,
}

impl Swarm {
    pub fn new(
        shared: Arc<Shared>,
        tracker: TrackerClient,
        initial_peers: Vec<SocketAddr>,
    ) -> Self {
        let target_peer_count = shared.conf.initial_target_peer_count;
        Self {
            shared,
            tracker,
            candidates: initial_peers,
            tried: HashSet::new(),
            sessions: JoinSet::new(),
            target_peer_count,
        }
    }

    /// Drives the swarm until the torrent completes or an unrecoverable
    /// condition (§7 `SwarmStalled`) is hit.
    pub async fn run(mut self) -> Result<(), EngineError> {
        self.initial_fill().await;

        let mut replenish_interval =
            tokio::time::interval(self.shared.conf.replenish_interval);
        replenish_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        replenish_interval.tick().await;

        let mut adaptive_interval =
            tokio::time::interval(self.shared.conf.adaptive_target_interval);
        adaptive_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        adaptive_interval.tick().await;

        let mut tracker_interval =
            tokio::time::interval(self.shared.conf.tracker_refresh_interval);
        tracker_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracker_interval.tick().await;

        let mut stall_interval =
            tokio::time::interval(self.shared.conf.stall_timeout);
        stall_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        stall_interval.tick().await;

        let mut rate_interval =
            tokio::time::interval(std::time::Duration::from_secs(1));
        rate_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rate_interval.tick().await;

        let mut last_verified_adaptive = self.verified_count().await;
        let mut last_verified_stall = last_verified_adaptive;
        let mut stall_rounds = 0usize;

        let result = loop {
            if self.is_complete().await {
                break Ok(());
            }

            tokio::select! {
                res = self.sessions.join_next(), if !self.sessions.is_empty() => {
                    if let Some(res) = res {
                        self.handle_session_exit(res).await;
                    }
                }
                _ = replenish_interval.tick() => {
                    self.replenish().await;
                }
                _ = rate_interval.tick() => {
                    self.shared.metrics.sample_rate();
                }
                _ = adaptive_interval.tick() => {
                    let verified = self.verified_count().await;
                    let delta = verified.saturating_sub(last_verified_adaptive);
                    last_verified_adaptive = verified;
                    self.adjust_target(delta);
                }
                _ = tracker_interval.tick() => {
                    self.refresh_tracker().await;
                }
                _ = stall_interval.tick() => {
                    let verified = self.verified_count().await;
                    if verified == last_verified_stall {
                        stall_rounds += 1;
                        if stall_rounds > self.shared.conf.stall_recovery_rounds {
                            break Err(EngineError::SwarmStalled(
                                self.shared.conf.stall_recovery_rounds,
                            ));
                        }
                        log::warn!(
                            "Swarm stalled, starting recovery round {}",
                            stall_rounds
                        );
                        self.spawn_batch(self.shared.conf.stall_recovery_batch)
                            .await;
                    } else {
                        stall_rounds = 0;
                    }
                    last_verified_stall = verified;
                }
            }
        };

        while self.sessions.join_next().await.is_some() {}

        result
    }

    async fn is_complete(&self) -> bool {
        self.shared.piece_engine.lock().await.is_complete()
    }

    async fn verified_count(&self) -> usize {
        self.shared.piece_engine.lock().await.verified_count()
    }

    /// Concurrently spawns sessions for as many candidates as fit under
    /// `max_connected_peer_count`, without waiting for any of them to
    /// finish connecting.
    async fn initial_fill(&mut self) {
        let max = self.shared.conf.max_connected_peer_count;
        while self.sessions.len() < max {
            let Some(addr) = self.next_candidate() else { break };
            self.spawn_session(addr);
        }
        self.shared.metrics.set_active_peers(self.sessions.len());
    }

    /// Pops the next untried candidate address, if any.
    fn next_candidate(&mut self) -> Option<SocketAddr> {
        while let Some(addr) = self.candidates.pop() {
            if self.tried.insert(addr) {
                return Some(addr);
            }
        }
        None
    }

    fn spawn_session(&mut self, addr: SocketAddr) {
        self.shared.metrics.record_connection_attempt();
        let shared = Arc::clone(&self.shared);
        self.sessions.spawn(async move {
            let result = PeerSession::new(shared, addr).run().await;
            (addr, result)
        });
    }

    async fn handle_session_exit(
        &mut self,
        res: Result<(SocketAddr, Result<(), PeerError>), tokio::task::JoinError>,
    ) {
        match res {
            Ok((addr, Ok(()))) => {
                log::debug!("Session with peer {} ended cleanly", addr);
            }
            Ok((addr, Err(err))) => {
                log::debug!("Session with peer {} ended: {}", addr, err);
            }
            Err(err) => {
                log::warn!("Peer session task panicked: {}", err);
            }
        }
        self.shared.metrics.set_active_peers(self.sessions.len());
    }

    /// Tops the pool back up to `target_peer_count`, a small batch at a
    /// time (§4.5 "Replenishment loop").
    async fn replenish(&mut self) {
        if self.sessions.len() >= self.target_peer_count {
            return;
        }
        if self.candidates.is_empty() {
            self.refresh_tracker().await;
        }
        self.spawn_batch(self.shared.conf.replenish_batch).await;
    }

    /// Spawns up to `n` new sessions from the candidate pool, refreshing
    /// the tracker first if the pool has run dry.
    async fn spawn_batch(&mut self, n: usize) {
        if self.candidates.is_empty() {
            self.refresh_tracker().await;
        }
        let mut addrs = Vec::new();
        for _ in 0..n {
            match self.next_candidate() {
                Some(addr) => addrs.push(addr),
                None => break,
            }
        }
        for addr in addrs {
            self.spawn_session(addr);
        }
        self.shared.metrics.set_active_peers(self.sessions.len());
    }

    /// Adjusts `target_peer_count` in response to observed verified-piece
    /// throughput over the last sampling window (§4.5 "Adaptive target").
    fn adjust_target(&mut self, verified_delta: usize) {
        let conf = &self.shared.conf;
        if verified_delta < conf.adaptive_target_low_watermark {
            self.target_peer_count =
                (self.target_peer_count + 5).min(conf.target_peer_count_max);
            log::debug!(
                "Raising target peer count to {} (verified {} pieces)",
                self.target_peer_count,
                verified_delta
            );
        } else if verified_delta > conf.adaptive_target_high_watermark
            && self.target_peer_count > 15
        {
            self.target_peer_count = self.target_peer_count.saturating_sub(2);
            log::debug!(
                "Lowering target peer count to {} (verified {} pieces)",
                self.target_peer_count,
                verified_delta
            );
        }
    }

    /// Re-announces to the tracker and merges any newly offered peers into
    /// the candidate pool. Failures are logged and otherwise ignored: a
    /// tracker refresh is never fatal to an already-running swarm.
    async fn refresh_tracker(&mut self) {
        let downloaded = {
            let engine = self.shared.piece_engine.lock().await;
            engine.verified_count() as u64 * self.shared.torrent.piece_len as u64
        };
        let left = self.shared.total_len.saturating_sub(downloaded);

        let params = AnnounceParams {
            info_hash: self.shared.torrent.info_hash,
            peer_id: self.shared.client_id,
            port: self.shared.announce_port,
            uploaded: 0,
            downloaded,
            left,
            event: AnnounceEvent::None,
        };

        match self.tracker.announce(&params).await {
            Ok(result) => {
                let mut added = 0;
                for addr in result.peers {
                    if !self.tried.contains(&addr)
                        && !self.candidates.contains(&addr)
                    {
                        self.candidates.push(addr);
                        added += 1;
                    }
                }
                log::debug!("Tracker refresh added {} new candidates", added);
            }
            Err(err) => {
                log::warn!("Tracker refresh failed: {}", err);
            }
        }

        self.candidates.shuffle(&mut rand::thread_rng());
    }
}
