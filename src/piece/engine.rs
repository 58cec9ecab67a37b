use std::{collections::HashMap, sync::Arc, time::Duration};

use rand::seq::IteratorRandom;

use super::piece::Piece;
use crate::{
    conf::TorrentConf,
    error::DiskError,
    storage_info::StorageInfo,
    torrent::Torrent,
    Bitfield, BlockInfo, PieceIndex,
};

/// The result of feeding a received block into the engine.
pub(crate) enum BlockOutcome {
    /// The block was accepted but its piece is not yet complete.
    Pending,
    /// The block completed and hash-verified its piece. The caller is
    /// responsible for persisting the returned bytes via
    /// [`crate::disk::FileMapper`]; the piece is already marked as owned.
    PieceVerified { index: PieceIndex, data: Vec<u8> },
    /// The block completed its piece but the assembled data failed its
    /// SHA-1 check. The piece has been reset and its blocks are available
    /// to be requested again.
    HashMismatch { index: PieceIndex },
}

/// Owns piece selection, in-flight block accounting, and hash verification
/// for a single torrent.
///
/// Every method here is called with the engine's mutex held (see
/// [`crate::swarm::Swarm`]); this is the single logical lock around which
/// peer sessions coordinate, so its methods are synchronous and never do
/// I/O themselves -- disk writes are the caller's responsibility once a
/// piece verifies.
pub(crate) struct PieceEngine {
    torrent: Arc<Torrent>,
    storage: StorageInfo,
    conf: TorrentConf,
    /// Pieces we have fully verified.
    have: Bitfield,
    /// Pieces currently being assembled.
    in_progress: HashMap<PieceIndex, Piece>,
    /// In-progress pieces currently owned by a session (invariant 5: at
    /// most one session may hold a given piece as its `current_piece` at
    /// once). An in-progress piece absent from this set is available for
    /// any session to adopt via [`Self::next_needed_piece`].
    claimed: std::collections::HashSet<PieceIndex>,
}

impl PieceEngine {
    pub fn new(
        torrent: Arc<Torrent>,
        storage: StorageInfo,
        conf: TorrentConf,
    ) -> Self {
        let piece_count = torrent.piece_count();
        Self {
            torrent,
            storage,
            conf,
            have: Bitfield::repeat(false, piece_count),
            in_progress: HashMap::new(),
            claimed: std::collections::HashSet::new(),
        }
    }

    /// Returns true once every piece has been verified.
    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    /// The number of pieces verified so far.
    pub fn verified_count(&self) -> usize {
        self.have.count_ones()
    }

    /// Our own bitfield, as announced to peers.
    pub fn bitfield(&self) -> &Bitfield {
        &self.have
    }

    /// Picks a piece to start downloading that the peer (per its bitfield)
    /// has and we don't (§4.3 "next_needed_piece"). Prefers a piece in
    /// state Missing (never yet started), chosen uniformly at random among
    /// the eligible set to spread load across pieces; only when no Missing
    /// piece is eligible does it fall back to an already in-progress piece
    /// with the fewest received blocks, to help complete stragglers.
    ///
    /// An in-progress piece already [`Self::claimed`] by another session is
    /// not offered for continuation (invariant 5); it only becomes eligible
    /// again once that session calls [`Self::release_piece`].
    ///
    /// Returns `None` if the peer has nothing we need, or if we are already
    /// juggling [`crate::conf::TorrentConf::max_in_progress_pieces`] pieces
    /// and none of the ones in progress are ones this peer has.
    pub fn next_needed_piece(
        &mut self,
        peer_bitfield: &Bitfield,
    ) -> Option<PieceIndex> {
        if self.in_progress.len() < self.conf.max_in_progress_pieces {
            let mut rng = rand::thread_rng();
            let missing = (0..self.torrent.piece_count())
                .filter(|&i| {
                    let we_have = self.have.get(i).map(|b| *b).unwrap_or(false);
                    let peer_has =
                        peer_bitfield.get(i).map(|b| *b).unwrap_or(false);
                    !we_have && peer_has && !self.in_progress.contains_key(&i)
                })
                .choose(&mut rng);
            if missing.is_some() {
                return missing;
            }
        }

        self.in_progress
            .iter()
            .filter(|(&i, _)| {
                !self.claimed.contains(&i)
                    && peer_bitfield.get(i).map_or(false, |b| *b)
            })
            .min_by_key(|(_, piece)| piece.received_count())
            .map(|(&i, _)| i)
    }

    /// Marks `index` as in progress if it isn't already, and claims it for
    /// the calling session (invariant 5). No-op if the piece is already
    /// verified. Re-claiming a piece that's already in progress but
    /// unclaimed always succeeds, even at the in-progress cap; only
    /// starting a brand new piece is subject to
    /// [`crate::conf::TorrentConf::max_in_progress_pieces`].
    pub fn begin_piece(&mut self, index: PieceIndex) -> Result<(), DiskError> {
        if self.have.get(index).map_or(false, |b| *b) {
            return Ok(());
        }
        if !self.in_progress.contains_key(&index) {
            if self.in_progress.len() >= self.conf.max_in_progress_pieces {
                let swept = self.sweep_stale();
                if !swept.is_empty() {
                    log::debug!(
                        "Swept {} stale in-progress piece(s) before failing begin_piece({})",
                        swept.len(),
                        index
                    );
                }
                if self.in_progress.len() >= self.conf.max_in_progress_pieces {
                    return Err(DiskError::TooManyInProgress);
                }
            }
            let len = self.storage.piece_len(index)?;
            self.in_progress.insert(index, Piece::new(index, len));
        }
        self.claimed.insert(index);
        Ok(())
    }

    /// Releases a session's claim on `index`, making it eligible again for
    /// [`Self::next_needed_piece`] to hand to another session. Called when a
    /// session ends or disconnects while holding an in-progress piece; a
    /// mere Choke does *not* release the claim, since the owning session
    /// should resume the same piece once unchoked.
    pub fn release_piece(&mut self, index: PieceIndex) {
        self.claimed.remove(&index);
    }

    /// Returns every currently outstanding block of the given in-progress
    /// piece, regardless of how recently it was requested, for the
    /// force-reissue path that bypasses the normal age gate on a piece with
    /// no progress (§4.2).
    pub fn force_reissue_blocks(&mut self, index: PieceIndex) -> Vec<BlockInfo> {
        self.in_progress
            .get_mut(&index)
            .map(|piece| piece.requested_blocks())
            .unwrap_or_default()
    }

    /// Picks up to `count` not-yet-requested blocks of the given in-progress
    /// piece.
    pub fn blocks_to_request(
        &mut self,
        index: PieceIndex,
        count: usize,
    ) -> Vec<BlockInfo> {
        self.in_progress
            .get_mut(&index)
            .map(|piece| piece.pick_blocks(count))
            .unwrap_or_default()
    }

    /// Returns how long it has been since the given in-progress piece last
    /// saw any block activity (a request, a receipt, or a reset), or `None`
    /// if the piece isn't in progress. Used by [`crate::peer::PeerSession`]
    /// to decide when to reissue or force-reissue a stalled piece's
    /// outstanding block requests (§4.2).
    pub fn piece_idle_for(&self, index: PieceIndex) -> Option<Duration> {
        self.in_progress
            .get(&index)
            .map(|piece| std::time::Instant::now().duration_since(piece.last_activity))
    }

    /// Returns blocks of the given piece that have been outstanding for
    /// longer than `after`, for request reissue (§4.2).
    pub fn overdue_blocks(
        &mut self,
        index: PieceIndex,
        after: Duration,
    ) -> Vec<BlockInfo> {
        self.in_progress
            .get_mut(&index)
            .map(|piece| piece.overdue_blocks(after))
            .unwrap_or_default()
    }

    /// Feeds a received block into its piece. If this completes the piece,
    /// the piece is hash-verified and removed from the in-progress set
    /// either way: on success it's marked in our bitfield and its bytes are
    /// handed back for the caller to persist; on a hash mismatch its blocks
    /// are reset and it goes back in as in-progress so its blocks may be
    /// requested anew.
    pub fn on_block(
        &mut self,
        block: BlockInfo,
        data: &[u8],
    ) -> BlockOutcome {
        let index = block.piece_index;
        let Some(piece) = self.in_progress.get_mut(&index) else {
            return BlockOutcome::Pending;
        };

        piece.receive_block(block.offset, data);

        if !piece.is_complete() {
            return BlockOutcome::Pending;
        }

        let expected = self.torrent.piece_hash(index).copied();
        let Some(expected) = expected else {
            // a piece index past the end of our hash list should never
            // reach here, as it could never have been selected
            return BlockOutcome::Pending;
        };

        if piece.verify(&expected) {
            let piece = self.in_progress.remove(&index).unwrap();
            self.have.set(index, true);
            self.claimed.remove(&index);
            BlockOutcome::PieceVerified { index, data: piece.into_data() }
        } else {
            log::warn!("Piece {} failed hash check, resetting", index);
            piece.reset();
            BlockOutcome::HashMismatch { index }
        }
    }

    /// Sweeps in-progress pieces that haven't seen activity in
    /// [`crate::conf::TorrentConf::piece_stale_after`], returning them to
    /// the pool of pieces eligible for [`Self::next_needed_piece`] by
    /// dropping their in-progress state entirely.
    pub fn sweep_stale(&mut self) -> Vec<PieceIndex> {
        let stale_after = self.conf.piece_stale_after;
        let now = std::time::Instant::now();
        let stale: Vec<PieceIndex> = self
            .in_progress
            .iter()
            .filter(|(_, piece)| {
                now.duration_since(piece.last_activity) >= stale_after
            })
            .map(|(&index, _)| index)
            .collect();
        for index in &stale {
            self.in_progress.remove(index);
            self.claimed.remove(index);
        }
        stale
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::{FileInfo, FsStructure};
    use sha1::Digest;

    fn test_torrent(piece_count: usize) -> (Arc<Torrent>, StorageInfo) {
        let piece_len = 16;
        let download_len = piece_len as u64 * piece_count as u64;
        let torrent = Arc::new(Torrent {
            name: "t".to_string(),
            info_hash: [0; 20],
            piece_len,
            piece_hashes: (0..piece_count).map(|_| [0; 20]).collect(),
            structure: FsStructure::File(FileInfo {
                path: "t".into(),
                len: download_len,
                torrent_offset: 0,
            }),
            trackers: vec![],
        });
        let storage = StorageInfo::new(&torrent, "/tmp".into());
        (torrent, storage)
    }

    #[test]
    fn test_next_needed_piece_respects_peer_bitfield() {
        let (torrent, storage) = test_torrent(4);
        let mut engine =
            PieceEngine::new(torrent, storage, TorrentConf::new("/tmp"));

        let mut peer_bitfield = Bitfield::repeat(false, 4);
        peer_bitfield.set(2, true);

        let picked = engine.next_needed_piece(&peer_bitfield);
        assert_eq!(picked, Some(2));
    }

    #[test]
    fn test_next_needed_piece_none_when_peer_has_nothing_we_need() {
        let (torrent, storage) = test_torrent(2);
        let mut engine =
            PieceEngine::new(torrent, storage, TorrentConf::new("/tmp"));
        let peer_bitfield = Bitfield::repeat(false, 2);
        assert_eq!(engine.next_needed_piece(&peer_bitfield), None);
    }

    #[test]
    fn test_begin_piece_respects_in_progress_cap() {
        let (torrent, storage) = test_torrent(4);
        let mut conf = TorrentConf::new("/tmp");
        conf.max_in_progress_pieces = 1;
        let mut engine = PieceEngine::new(torrent, storage, conf);

        engine.begin_piece(0).unwrap();
        assert!(matches!(
            engine.begin_piece(1),
            Err(DiskError::TooManyInProgress)
        ));
    }

    #[test]
    fn test_on_block_completes_and_verifies_piece() {
        let (torrent, storage) = test_torrent(1);
        // a single 16-byte piece is its own one block
        let piece_len = 16u32;
        let data = vec![0x55; piece_len as usize];
        let digest = sha1::Sha1::digest(&data);
        let mut expected = [0; 20];
        expected.copy_from_slice(&digest);

        let mut torrent = (*torrent).clone();
        torrent.piece_hashes = vec![expected];
        let torrent = Arc::new(torrent);
        let mut engine =
            PieceEngine::new(torrent, storage, TorrentConf::new("/tmp"));

        engine.begin_piece(0).unwrap();
        let blocks = engine.blocks_to_request(0, 10);
        assert_eq!(blocks.len(), 1);

        let outcome = engine.on_block(blocks[0], &data);
        match outcome {
            BlockOutcome::PieceVerified { index, data: got } => {
                assert_eq!(index, 0);
                assert_eq!(got, data);
            }
            _ => panic!("expected piece to verify"),
        }
        assert!(engine.is_complete());
    }

    #[test]
    fn test_next_needed_piece_skips_claimed_in_progress_piece() {
        let (torrent, storage) = test_torrent(4);
        let mut engine =
            PieceEngine::new(torrent, storage, TorrentConf::new("/tmp"));

        let mut peer_bitfield = Bitfield::repeat(false, 4);
        peer_bitfield.set(2, true);

        engine.begin_piece(2).unwrap();
        // a second session offering the same peer bitfield should not be
        // handed piece 2 again while the first session still holds it
        assert_eq!(engine.next_needed_piece(&peer_bitfield), None);

        engine.release_piece(2);
        assert_eq!(engine.next_needed_piece(&peer_bitfield), Some(2));
    }

    #[test]
    fn test_begin_piece_reclaim_bypasses_in_progress_cap() {
        let (torrent, storage) = test_torrent(4);
        let mut conf = TorrentConf::new("/tmp");
        conf.max_in_progress_pieces = 1;
        let mut engine = PieceEngine::new(torrent, storage, conf);

        engine.begin_piece(0).unwrap();
        engine.release_piece(0);
        // re-claiming an already in-progress piece must succeed even at cap
        assert!(engine.begin_piece(0).is_ok());
    }

    #[test]
    fn test_on_block_hash_mismatch_resets_piece() {
        let (torrent, storage) = test_torrent(1);
        let mut engine =
            PieceEngine::new(torrent, storage, TorrentConf::new("/tmp"));
        engine.begin_piece(0).unwrap();
        let blocks = engine.blocks_to_request(0, 10);
        let outcome = engine.on_block(blocks[0], &vec![0xFF; blocks[0].len as usize]);
        assert!(matches!(outcome, BlockOutcome::HashMismatch { index: 0 }));
        assert!(!engine.is_complete());
        // the piece should still be in progress, with its block requestable again
        let blocks_again = engine.blocks_to_request(0, 10);
        assert_eq!(blocks_again.len(), 1);
    }

    #[test]
    fn test_begin_piece_sweeps_stale_before_failing() {
        let (torrent, storage) = test_torrent(4);
        let mut conf = TorrentConf::new("/tmp");
        conf.max_in_progress_pieces = 1;
        conf.piece_stale_after = Duration::from_secs(0);
        let mut engine = PieceEngine::new(torrent, storage, conf);

        engine.begin_piece(0).unwrap();
        // backdate piece 0's activity so it's immediately stale
        engine.in_progress.get_mut(&0).unwrap().last_activity -=
            Duration::from_secs(1);

        // starting piece 1 would exceed the cap, but sweeping the stale
        // piece 0 first should make room for it instead of failing
        assert!(engine.begin_piece(1).is_ok());
        assert!(!engine.in_progress.contains_key(&0));
        assert!(engine.in_progress.contains_key(&1));
    }
}
