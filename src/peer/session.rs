use std::{net::SocketAddr, sync::Arc, time::Instant};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    error::PeerError,
    piece::BlockOutcome,
    swarm::Shared,
    wire::{Handshake, HandshakeCodec, Message, PeerCodec},
    Bitfield, BlockInfo, PieceIndex,
};

/// Scoped acquisition of one outbound TCP connection to a single peer: owns
/// the connection for its whole lifetime and guarantees it is closed on
/// every exit path (drop of the underlying `TcpStream`).
///
/// The session's own state (`am_choked`, `peer_pieces`, `current_piece`, ...)
/// is private to this struct; everything shared across sessions of the same
/// torrent -- the piece/block table, the file mapper, metrics -- lives in
/// [`Shared`] and is reached through `self.shared`.
pub(crate) struct PeerSession {
    shared: Arc<Shared>,
    addr: SocketAddr,

    /// Whether the peer is choking us.
    am_choked: bool,
    /// Whether we've told the peer we're interested.
    am_interested: bool,
    /// Pieces we believe this peer has, as announced via `Bitfield`/`Have`.
    peer_pieces: Bitfield,
    /// The piece this session currently owns in the piece engine, if any.
    current_piece: Option<PieceIndex>,
    /// Whether a `Bitfield` message is still admissible: only directly
    /// after the handshake, mirroring the wire protocol's intent that
    /// piece-availability messages precede ordinary traffic.
    availability_exchange_done: bool,

    consecutive_errors: usize,
    /// How many force-reissues this session has done for `current_piece`
    /// without making progress; reset whenever `current_piece` changes.
    reissue_count: usize,
    last_frame_at: Instant,
}

impl PeerSession {
    /// Creates a new outbound session for the peer at `addr`. The session
    /// does nothing until [`Self::run`] is awaited.
    pub fn new(shared: Arc<Shared>, addr: SocketAddr) -> Self {
        let piece_count = shared.torrent.piece_count();
        Self {
            shared,
            addr,
            am_choked: true,
            am_interested: false,
            peer_pieces: Bitfield::repeat(false, piece_count),
            current_piece: None,
            availability_exchange_done: false,
            consecutive_errors: 0,
            reissue_count: 0,
            last_frame_at: Instant::now(),
        }
    }

    /// Runs the session to completion: connects, handshakes, and then
    /// drives the main loop until the download completes, the peer drops
    /// the connection, or an unrecoverable error occurs.
    ///
    /// On every exit path, if this session still holds a piece in the
    /// engine, its claim is released so another session may pick it up.
    pub async fn run(mut self) -> Result<(), PeerError> {
        log::info!("Connecting to peer {}", self.addr);
        let socket = match timeout(
            self.shared.conf.connect_timeout,
            TcpStream::connect(self.addr),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(err)) => {
                self.shared.metrics.record_failed_connection();
                return Err(PeerError::Io(err));
            }
            Err(_elapsed) => {
                self.shared.metrics.record_failed_connection();
                return Err(PeerError::ConnectTimeout);
            }
        };

        let mut framed = match self.handshake(socket).await {
            Ok(framed) => framed,
            Err(err) => {
                self.shared.metrics.record_failed_connection();
                return Err(err);
            }
        };
        self.shared.metrics.record_successful_connection();
        log::info!("Handshake complete with peer {}", self.addr);

        framed.send(Message::Interested).await?;
        self.am_interested = true;
        self.last_frame_at = Instant::now();

        let result = self.main_loop(&mut framed).await;

        if let Some(index) = self.current_piece.take() {
            self.shared.piece_engine.lock().await.release_piece(index);
        }

        result
    }

    /// Sends our handshake, reads the peer's, and swaps the connection's
    /// codec from [`HandshakeCodec`] to [`PeerCodec`] for the rest of the
    /// session, carrying over any bytes already buffered past the
    /// handshake.
    async fn handshake(
        &mut self,
        socket: TcpStream,
    ) -> Result<Framed<TcpStream, PeerCodec>, PeerError> {
        let mut framed = Framed::new(socket, HandshakeCodec);

        let handshake =
            Handshake::new(self.shared.torrent.info_hash, self.shared.client_id);
        framed.send(handshake).await?;

        let peer_handshake = match timeout(
            self.shared.conf.handshake_timeout,
            framed.next(),
        )
        .await
        {
            Ok(Some(Ok(handshake))) => handshake,
            Ok(Some(Err(err))) => return Err(err),
            Ok(None) => {
                return Err(PeerError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed during handshake",
                )))
            }
            Err(_elapsed) => return Err(PeerError::HandshakeTimeout),
        };

        if peer_handshake.info_hash != self.shared.torrent.info_hash {
            return Err(PeerError::InvalidInfoHash);
        }

        let old_parts = framed.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        Ok(Framed::from_parts(new_parts))
    }

    /// The session's core loop: reads frames with a bounded timeout,
    /// handling both incoming messages and read-timeout housekeeping
    /// (keep-alives, re-interest, stalled-piece reissue).
    async fn main_loop(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<(), PeerError> {
        loop {
            if self.shared.piece_engine.lock().await.is_complete() {
                return Ok(());
            }
            if Instant::now().duration_since(self.last_frame_at)
                >= self.shared.conf.inactivity_timeout
            {
                return Err(PeerError::InactivityTimeout);
            }

            match timeout(self.shared.conf.read_timeout, framed.next()).await {
                Ok(Some(Ok(msg))) => {
                    self.consecutive_errors = 0;
                    self.last_frame_at = Instant::now();
                    self.handle_message(framed, msg).await?;
                }
                Ok(Some(Err(PeerError::Io(err)))) => {
                    self.consecutive_errors += 1;
                    log::warn!("Peer {} i/o error: {}", self.addr, err);
                    if self.consecutive_errors >= self.shared.conf.max_consecutive_errors
                    {
                        return Err(PeerError::TooManyErrors);
                    }
                }
                Ok(Some(Err(err))) => {
                    // decode/protocol errors are fatal to the session
                    return Err(err);
                }
                Ok(None) => return Ok(()),
                Err(_elapsed) => self.handle_read_timeout(framed).await?,
            }
        }
    }

    /// Handles a read timeout: sends a keep-alive or re-interest if the
    /// connection has been idle long enough, and reissues outstanding block
    /// requests for a stalled `current_piece`.
    async fn handle_read_timeout(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<(), PeerError> {
        let idle = Instant::now().duration_since(self.last_frame_at);

        if idle >= self.shared.conf.keepalive_interval {
            framed.send(Message::KeepAlive).await?;
        }
        if self.am_choked && idle >= self.shared.conf.reinterest_interval {
            framed.send(Message::Interested).await?;
        }
        if !self.am_choked {
            self.reissue_stalled_piece(framed).await?;
        }

        Ok(())
    }

    /// If `current_piece` has made no block progress in
    /// `block_reissue_interval`, reissues its outstanding requests; if it
    /// has made none in `block_force_reissue_interval`, bypasses the normal
    /// per-block age gate entirely and reissues every outstanding block,
    /// bounded to `max_force_reissues_per_burst` per piece.
    async fn reissue_stalled_piece(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<(), PeerError> {
        let Some(index) = self.current_piece else { return Ok(()) };

        let idle = {
            let engine = self.shared.piece_engine.lock().await;
            engine.piece_idle_for(index)
        };
        let Some(idle) = idle else { return Ok(()) };

        let blocks = if idle >= self.shared.conf.block_force_reissue_interval
            && self.reissue_count < self.shared.conf.max_force_reissues_per_burst
        {
            self.reissue_count += 1;
            let mut engine = self.shared.piece_engine.lock().await;
            engine.force_reissue_blocks(index)
        } else if idle >= self.shared.conf.block_reissue_interval {
            let mut engine = self.shared.piece_engine.lock().await;
            engine.overdue_blocks(index, self.shared.conf.block_reissue_interval)
        } else {
            Vec::new()
        };

        for block in blocks {
            framed.send(Message::Request(block)).await?;
        }
        Ok(())
    }

    /// Dispatches a single received message.
    async fn handle_message(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        msg: Message,
    ) -> Result<(), PeerError> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                log::debug!("Peer {} choked us", self.addr);
                self.am_choked = true;
                self.availability_exchange_done = true;
            }
            Message::Unchoke => {
                log::debug!("Peer {} unchoked us", self.addr);
                self.am_choked = false;
                self.availability_exchange_done = true;
                if self.current_piece.is_none() {
                    self.adopt_piece().await?;
                }
                self.fill_pipeline(framed).await?;
            }
            Message::Interested | Message::NotInterested => {
                self.availability_exchange_done = true;
            }
            Message::Have { piece_index } => {
                if piece_index < self.peer_pieces.len() {
                    self.peer_pieces.set(piece_index, true);
                }
                self.availability_exchange_done = true;
                if !self.am_choked && self.current_piece.is_none() {
                    self.adopt_piece().await?;
                    self.fill_pipeline(framed).await?;
                }
            }
            Message::Bitfield(bitfield) => {
                if self.availability_exchange_done {
                    return Err(PeerError::BitfieldNotAfterHandshake);
                }
                self.availability_exchange_done = true;

                let len = self.peer_pieces.len().min(bitfield.len());
                for i in 0..len {
                    if bitfield.get(i).map_or(false, |b| *b) {
                        self.peer_pieces.set(i, true);
                    }
                }

                if !self.am_choked && self.current_piece.is_none() {
                    self.adopt_piece().await?;
                    self.fill_pipeline(framed).await?;
                }
            }
            Message::Piece { piece_index, offset, data } => {
                self.availability_exchange_done = true;
                self.handle_block(framed, piece_index, offset, data).await?;
            }
            Message::Request(_) | Message::Cancel(_) => {
                // this is a download-only engine: we never serve blocks
                log::trace!("Peer {} sent a request message, ignoring", self.addr);
            }
        }
        Ok(())
    }

    /// Picks a piece for this session to work on and claims it in the
    /// engine, if one is available.
    async fn adopt_piece(&mut self) -> Result<(), PeerError> {
        let mut engine = self.shared.piece_engine.lock().await;
        if let Some(index) = engine.next_needed_piece(&self.peer_pieces) {
            engine.begin_piece(index).map_err(PeerError::Disk)?;
            log::debug!("Peer {} adopted piece {}", self.addr, index);
            self.current_piece = Some(index);
            self.reissue_count = 0;
        }
        Ok(())
    }

    /// Fills the outstanding request pipeline for `current_piece` up to
    /// [`crate::conf::TorrentConf::max_pipelined_requests`].
    async fn fill_pipeline(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
    ) -> Result<(), PeerError> {
        if self.am_choked {
            return Ok(());
        }
        let Some(index) = self.current_piece else { return Ok(()) };

        let blocks = {
            let mut engine = self.shared.piece_engine.lock().await;
            engine.blocks_to_request(index, self.shared.conf.max_pipelined_requests)
        };
        for block in blocks {
            framed.send(Message::Request(block)).await?;
        }
        Ok(())
    }

    /// Feeds a received block into the piece engine, persisting and
    /// verifying its piece if this was the last missing block, then tops
    /// off the request pipeline.
    async fn handle_block(
        &mut self,
        framed: &mut Framed<TcpStream, PeerCodec>,
        piece_index: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<(), PeerError> {
        let block = BlockInfo { piece_index, offset, len: data.len() as u32 };
        self.shared.metrics.record_block(data.len());

        let completed_index = {
            let mut engine = self.shared.piece_engine.lock().await;
            let outcome = engine.on_block(block, &data);
            match outcome {
                BlockOutcome::Pending => None,
                BlockOutcome::PieceVerified { index, data } => {
                    self.shared.metrics.record_piece_downloaded();
                    self.shared.metrics.record_piece_verified();
                    self.shared
                        .disk
                        .write_piece(index, data)
                        .await
                        .map_err(PeerError::Disk)?;
                    log::info!("Piece {} verified via peer {}", index, self.addr);
                    Some(index)
                }
                BlockOutcome::HashMismatch { index } => {
                    self.shared.metrics.record_piece_downloaded();
                    self.shared.metrics.record_piece_failed();
                    log::warn!(
                        "Piece {} failed hash check (peer {})",
                        index,
                        self.addr
                    );
                    None
                }
            }
        };

        if let Some(index) = completed_index {
            if self.current_piece == Some(index) {
                self.current_piece = None;
                self.reissue_count = 0;
                if !self.am_choked {
                    self.adopt_piece().await?;
                }
            }
        }

        self.fill_pipeline(framed).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conf::TorrentConf,
        disk::FileMapper,
        metrics::Metrics,
        piece::PieceEngine,
        storage_info::{FileInfo, FsStructure, StorageInfo},
        torrent::Torrent,
    };
    use sha1::Digest;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream as TokioTcpStream};

    fn tmp_dir(name: &str) -> std::path::PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "bitleech-session-test-{}-{}-{}",
            name,
            std::process::id(),
            name.len()
        ));
        dir
    }

    /// Builds a single-file, two-piece torrent (each piece a single block,
    /// since both are far smaller than the 16 KiB block length) plus the
    /// `Shared` state a `PeerSession` needs, with the given conf applied on
    /// top of sensible fast-test defaults.
    fn test_shared(
        dir: &std::path::Path,
        piece_data: &[Vec<u8>],
        conf_override: impl FnOnce(&mut TorrentConf),
    ) -> Arc<Shared> {
        let piece_len = piece_data[0].len() as u32;
        let piece_hashes: Vec<_> = piece_data
            .iter()
            .map(|data| {
                let digest = sha1::Sha1::digest(data);
                let mut hash = [0; 20];
                hash.copy_from_slice(&digest);
                hash
            })
            .collect();
        let total_len: u64 =
            piece_data.iter().map(|d| d.len() as u64).sum();

        let torrent = Arc::new(Torrent {
            name: "test.bin".to_string(),
            info_hash: [7; 20],
            piece_len,
            piece_hashes,
            structure: FsStructure::File(FileInfo {
                path: "test.bin".into(),
                len: total_len,
                torrent_offset: 0,
            }),
            trackers: vec![],
        });

        let storage = StorageInfo::new(&torrent, dir.to_path_buf());
        let disk = FileMapper::new(storage.clone()).unwrap();

        let mut conf = TorrentConf::new(dir.to_path_buf());
        conf.connect_timeout = Duration::from_millis(500);
        conf.handshake_timeout = Duration::from_millis(500);
        conf.read_timeout = Duration::from_millis(30);
        conf.keepalive_interval = Duration::from_millis(200);
        conf.reinterest_interval = Duration::from_millis(80);
        conf.inactivity_timeout = Duration::from_millis(600);
        conf_override(&mut conf);

        let piece_engine = tokio::sync::Mutex::new(PieceEngine::new(
            Arc::clone(&torrent),
            storage,
            conf.clone(),
        ));

        Arc::new(Shared {
            torrent,
            conf,
            client_id: [1; 20],
            announce_port: 6881,
            piece_engine,
            disk,
            metrics: Arc::new(Metrics::new(piece_data.len())),
            total_len,
        })
    }

    /// Accepts one connection, performs the handshake (optionally with a
    /// mismatched info hash), and returns the established peer-side framed
    /// connection for the test to drive further.
    async fn accept_and_handshake(
        listener: &TcpListener,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Framed<TokioTcpStream, PeerCodec> {
        let (socket, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(socket, HandshakeCodec);

        let _their_handshake = framed.next().await.unwrap().unwrap();
        framed.send(Handshake::new(info_hash, peer_id)).await.unwrap();

        let parts = framed.into_parts();
        let mut new_parts = FramedParts::new(parts.io, PeerCodec);
        new_parts.read_buf = parts.read_buf;
        new_parts.write_buf = parts.write_buf;
        Framed::from_parts(new_parts)
    }

    #[tokio::test]
    async fn test_session_downloads_and_verifies_all_pieces() {
        let dir = tmp_dir("complete");
        let _ = std::fs::remove_dir_all(&dir);

        let piece_a = vec![0xAAu8; 8];
        let piece_b = vec![0xBBu8; 8];
        let pieces = vec![piece_a.clone(), piece_b.clone()];
        let shared = test_shared(&dir, &pieces, |_| {});
        let info_hash = shared.torrent.info_hash;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer_task = tokio::spawn(async move {
            let mut framed =
                accept_and_handshake(&listener, info_hash, [2; 20]).await;

            // we are interested immediately after the handshake
            assert_eq!(framed.next().await.unwrap().unwrap(), Message::Interested);

            let mut bitfield = Bitfield::repeat(false, 2);
            bitfield.set(0, true);
            bitfield.set(1, true);
            framed.send(Message::Bitfield(bitfield)).await.unwrap();
            framed.send(Message::Unchoke).await.unwrap();

            // serve whatever blocks are requested until both pieces are sent
            let mut served = 0;
            while served < 2 {
                match framed.next().await.unwrap().unwrap() {
                    Message::Request(BlockInfo { piece_index, offset, len }) => {
                        let data = if piece_index == 0 {
                            &piece_a
                        } else {
                            &piece_b
                        };
                        let chunk =
                            data[offset as usize..offset as usize + len as usize]
                                .to_vec();
                        framed
                            .send(Message::Piece {
                                piece_index,
                                offset,
                                data: Bytes::from(chunk),
                            })
                            .await
                            .unwrap();
                        served += 1;
                    }
                    _ => {}
                }
            }
        });

        let session = PeerSession::new(Arc::clone(&shared), addr);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            session.run(),
        )
        .await
        .expect("session should finish once the download completes");
        assert!(result.is_ok(), "session ended with error: {:?}", result);

        peer_task.await.unwrap();

        assert!(shared.piece_engine.lock().await.is_complete());
        let written = std::fs::read(dir.join("test.bin")).unwrap();
        assert_eq!(written, [piece_a, piece_b].concat());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_session_ends_on_info_hash_mismatch() {
        let dir = tmp_dir("mismatch");
        let _ = std::fs::remove_dir_all(&dir);

        let pieces = vec![vec![0u8; 8]];
        let shared = test_shared(&dir, &pieces, |_| {});

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer_task = tokio::spawn(async move {
            // reply with a handshake carrying the wrong info hash
            let _framed = accept_and_handshake(&listener, [9; 20], [2; 20]).await;
        });

        let session = PeerSession::new(Arc::clone(&shared), addr);
        let result =
            tokio::time::timeout(Duration::from_secs(2), session.run())
                .await
                .expect("session should end promptly on a mismatched handshake");
        assert!(matches!(result, Err(PeerError::InvalidInfoHash)));

        peer_task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_session_sends_keepalive_and_reinterest_under_silence() {
        let dir = tmp_dir("keepalive");
        let _ = std::fs::remove_dir_all(&dir);

        let pieces = vec![vec![0u8; 8]];
        let shared = test_shared(&dir, &pieces, |conf| {
            conf.read_timeout = Duration::from_millis(20);
            conf.reinterest_interval = Duration::from_millis(50);
            conf.keepalive_interval = Duration::from_millis(90);
            conf.inactivity_timeout = Duration::from_millis(400);
        });
        let info_hash = shared.torrent.info_hash;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer_task = tokio::spawn(async move {
            let mut framed =
                accept_and_handshake(&listener, info_hash, [2; 20]).await;

            // peer never unchokes or sends anything else: am_choked stays
            // true, so we expect a resent Interested and, eventually, a
            // KeepAlive, without ever completing the download
            let mut saw_reinterest = false;
            let mut saw_keepalive = false;
            let mut interested_count = 0;
            let deadline = tokio::time::Instant::now() + Duration::from_millis(350);
            while tokio::time::Instant::now() < deadline {
                if let Ok(Some(Ok(msg))) =
                    tokio::time::timeout(Duration::from_millis(50), framed.next())
                        .await
                {
                    match msg {
                        Message::Interested => {
                            interested_count += 1;
                            if interested_count > 1 {
                                saw_reinterest = true;
                            }
                        }
                        Message::KeepAlive => saw_keepalive = true,
                        _ => {}
                    }
                }
            }
            assert!(saw_reinterest, "expected a resent Interested message");
            assert!(saw_keepalive, "expected a KeepAlive message");
        });

        let session = PeerSession::new(Arc::clone(&shared), addr);
        let _ = tokio::time::timeout(Duration::from_secs(2), session.run()).await;

        peer_task.await.unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_session_survives_choke_unchoke_cycle_mid_piece() {
        let dir = tmp_dir("choke-cycle");
        let _ = std::fs::remove_dir_all(&dir);

        // a piece with two blocks (16384 + 100 bytes), so we can deliver
        // the first block, choke, and confirm the second is still picked
        // up once the peer unchokes again rather than the piece being
        // discarded and restarted
        let mut piece = vec![0u8; 16384];
        piece.extend(vec![1u8; 100]);
        let piece_len = piece.len();
        let pieces = vec![piece.clone()];
        let shared = test_shared(&dir, &pieces, |_| {});
        let info_hash = shared.torrent.info_hash;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peer_task = tokio::spawn(async move {
            let mut framed =
                accept_and_handshake(&listener, info_hash, [2; 20]).await;

            assert_eq!(framed.next().await.unwrap().unwrap(), Message::Interested);

            let mut bitfield = Bitfield::repeat(false, 1);
            bitfield.set(0, true);
            framed.send(Message::Bitfield(bitfield)).await.unwrap();
            framed.send(Message::Unchoke).await.unwrap();

            // serve only the first requested block, then choke
            match framed.next().await.unwrap().unwrap() {
                Message::Request(BlockInfo { piece_index, offset, len }) => {
                    let chunk = piece[offset as usize..offset as usize + len as usize]
                        .to_vec();
                    framed
                        .send(Message::Piece {
                            piece_index,
                            offset,
                            data: Bytes::from(chunk),
                        })
                        .await
                        .unwrap();
                }
                other => panic!("expected a Request, got {:?}", other),
            }
            framed.send(Message::Choke).await.unwrap();

            tokio::time::sleep(Duration::from_millis(100)).await;

            framed.send(Message::Unchoke).await.unwrap();

            // the session must re-request only the still-missing block,
            // not restart the whole piece
            match framed.next().await.unwrap().unwrap() {
                Message::Request(BlockInfo { piece_index, offset, len }) => {
                    assert_eq!(offset, 16384, "expected the second block, not a restart");
                    let chunk = piece[offset as usize..offset as usize + len as usize]
                        .to_vec();
                    framed
                        .send(Message::Piece {
                            piece_index,
                            offset,
                            data: Bytes::from(chunk),
                        })
                        .await
                        .unwrap();
                }
                other => panic!("expected a Request for the remaining block, got {:?}", other),
            }
        });

        let session = PeerSession::new(Arc::clone(&shared), addr);
        let result =
            tokio::time::timeout(Duration::from_secs(5), session.run())
                .await
                .expect("session should finish once the piece completes");
        assert!(result.is_ok(), "session ended with error: {:?}", result);

        peer_task.await.unwrap();

        assert!(shared.piece_engine.lock().await.is_complete());
        let written = std::fs::read(dir.join("test.bin")).unwrap();
        assert_eq!(written.len(), piece_len);
        assert_eq!(written, piece);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
