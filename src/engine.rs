//! The engine's public entry point: parses a torrent's metainfo, wires up
//! its shared state, and drives its [`crate::swarm::Swarm`] to completion.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;

use crate::{
    conf::Conf,
    disk::FileMapper,
    error::{EngineError, Result},
    metainfo::Metainfo,
    metrics::Metrics,
    piece::PieceEngine,
    storage_info::StorageInfo,
    swarm::{Shared, Swarm},
    torrent::Torrent,
    tracker::{AnnounceEvent, AnnounceParams, TrackerClient},
    MetricsSnapshot,
};

/// Drives a single torrent download from parsed metainfo to completion.
///
/// Construction (parsing the metainfo, preparing the download directory,
/// opening its files) is synchronous and fallible; [`Self::run`] is the
/// long-running async half that announces to the tracker and drives the
/// swarm until every piece verifies.
pub struct Engine {
    torrent: Arc<Torrent>,
    shared: Arc<Shared>,
}

impl Engine {
    /// Parses `metainfo_bytes` and prepares everything the download needs
    /// before a single byte is requested from a peer: the normalized
    /// [`Torrent`], the on-disk file layout, and the shared piece engine.
    pub fn new(metainfo_bytes: &[u8], conf: Conf) -> Result<Self> {
        let metainfo = Metainfo::from_bytes(metainfo_bytes)?;
        let torrent = Arc::new(Torrent::from_metainfo(metainfo)?);

        let storage =
            StorageInfo::new(&torrent, conf.torrent.download_dir.clone());
        let total_len = storage.download_len;

        let metrics = Arc::new(Metrics::new(torrent.piece_count()));
        let disk = FileMapper::new(storage.clone()).map_err(EngineError::Disk)?;
        let piece_engine = AsyncMutex::new(PieceEngine::new(
            Arc::clone(&torrent),
            storage,
            conf.torrent.clone(),
        ));

        let shared = Arc::new(Shared {
            torrent: Arc::clone(&torrent),
            conf: conf.torrent,
            client_id: conf.engine.client_id,
            announce_port: conf.engine.announce_port,
            piece_engine,
            disk,
            metrics,
            total_len,
        });

        Ok(Self { torrent, shared })
    }

    /// Returns a point-in-time snapshot of this download's progress and
    /// throughput (§4.6). Cheap and safe to call from another task while
    /// [`Self::run`] is in progress.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Returns the torrent this engine is driving.
    pub fn torrent(&self) -> &Torrent {
        &self.torrent
    }

    /// Announces to the torrent's tracker(s) and drives its swarm until
    /// every piece has been downloaded and verified, or an unrecoverable
    /// error occurs (§7).
    pub async fn run(self) -> Result<()> {
        if self.torrent.trackers.is_empty() {
            return Err(EngineError::TrackerUnreachable);
        }

        let tracker = TrackerClient::new(self.torrent.trackers.clone());
        let params = AnnounceParams {
            info_hash: self.torrent.info_hash,
            peer_id: self.shared.client_id,
            port: self.shared.announce_port,
            uploaded: 0,
            downloaded: 0,
            left: self.shared.total_len,
            event: AnnounceEvent::Started,
        };

        let announce = tracker
            .announce(&params)
            .await
            .map_err(|_| EngineError::TrackerUnreachable)?;
        log::info!(
            "Tracker announce for {} returned {} peers",
            self.torrent.name,
            announce.peers.len()
        );

        let swarm = Swarm::new(Arc::clone(&self.shared), tracker, announce.peers);
        swarm.run().await
    }
}
