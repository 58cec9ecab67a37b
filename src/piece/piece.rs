use std::time::{Duration, Instant};

use sha1::{Digest, Sha1};

use super::block::BlockStatus;
use crate::{block_count, block_len, BlockInfo, PieceIndex, Sha1Hash};

/// An in-progress piece: its per-block request/receipt state and the buffer
/// its blocks are assembled into as they arrive.
pub(crate) struct Piece {
    pub index: PieceIndex,
    len: u32,
    blocks: Vec<BlockStatus>,
    buf: Vec<u8>,
    /// The last time any block of this piece was requested or received;
    /// used to detect and sweep stale in-progress pieces (§4.3).
    pub last_activity: Instant,
}

impl Piece {
    pub fn new(index: PieceIndex, len: u32) -> Self {
        Self {
            index,
            len,
            blocks: vec![BlockStatus::Missing; block_count(len)],
            buf: vec![0; len as usize],
            last_activity: Instant::now(),
        }
    }

    /// Picks up to `max_new` not-yet-requested blocks and marks them as
    /// requested, returning their [`BlockInfo`]s.
    pub fn pick_blocks(&mut self, max_new: usize) -> Vec<BlockInfo> {
        let now = Instant::now();
        let mut picked = Vec::new();
        for (i, status) in self.blocks.iter_mut().enumerate() {
            if picked.len() >= max_new {
                break;
            }
            if let BlockStatus::Missing = status {
                *status = BlockStatus::Requested { since: now };
                picked.push(BlockInfo {
                    piece_index: self.index,
                    offset: i as u32 * crate::BLOCK_LEN,
                    len: block_len(self.len, i),
                });
            }
        }
        if !picked.is_empty() {
            self.last_activity = now;
        }
        picked
    }

    /// Returns the blocks that have been outstanding (requested but not
    /// received) for longer than `after`, refreshing their request
    /// timestamp so the same block isn't immediately reissued again next
    /// tick.
    pub fn overdue_blocks(&mut self, after: Duration) -> Vec<BlockInfo> {
        let now = Instant::now();
        let mut overdue = Vec::new();
        for (i, status) in self.blocks.iter_mut().enumerate() {
            if let BlockStatus::Requested { since } = status {
                if now.duration_since(*since) >= after {
                    *status = BlockStatus::Requested { since: now };
                    overdue.push(BlockInfo {
                        piece_index: self.index,
                        offset: i as u32 * crate::BLOCK_LEN,
                        len: block_len(self.len, i),
                    });
                }
            }
        }
        overdue
    }

    /// Returns every currently outstanding (requested but not received)
    /// block, refreshing each one's request timestamp. Unlike
    /// [`Self::overdue_blocks`] this ignores how long a block has been
    /// outstanding; it backs the session-level force-reissue path (§4.2),
    /// which bypasses the normal age gate once a piece has made no
    /// progress for `block_force_reissue_interval`.
    pub fn requested_blocks(&mut self) -> Vec<BlockInfo> {
        let now = Instant::now();
        let mut requested = Vec::new();
        for (i, status) in self.blocks.iter_mut().enumerate() {
            if let BlockStatus::Requested { since } = status {
                *since = now;
                requested.push(BlockInfo {
                    piece_index: self.index,
                    offset: i as u32 * crate::BLOCK_LEN,
                    len: block_len(self.len, i),
                });
            }
        }
        requested
    }

    /// Copies a received block's data into the assembly buffer and marks it
    /// received. Returns `false` if the block was not within this piece's
    /// bounds or was already received (a duplicate, e.g. from a reissued
    /// request racing the original).
    pub fn receive_block(&mut self, offset: u32, data: &[u8]) -> bool {
        let index_in_piece = (offset / crate::BLOCK_LEN) as usize;
        let Some(status) = self.blocks.get_mut(index_in_piece) else {
            return false;
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > self.buf.len() {
            return false;
        }
        self.buf[start..end].copy_from_slice(data);
        *status = BlockStatus::Received;
        self.last_activity = Instant::now();
        true
    }

    /// Returns true once every block of the piece has been received.
    pub fn is_complete(&self) -> bool {
        self.blocks
            .iter()
            .all(|status| matches!(status, BlockStatus::Received))
    }

    /// Returns how many of the piece's blocks have been received so far.
    /// Used by the engine's fallback selection (§4.3 "an InProgress piece
    /// with the fewest received blocks") once no Missing piece is eligible.
    pub fn received_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|status| matches!(status, BlockStatus::Received))
            .count()
    }

    /// Checks the assembled buffer's SHA-1 digest against `expected`.
    pub fn verify(&self, expected: &Sha1Hash) -> bool {
        let digest = Sha1::digest(&self.buf);
        digest.as_slice() == expected
    }

    /// Consumes the piece, returning its assembled bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.buf
    }

    /// Resets every block back to `Missing`, discarding in-flight and
    /// received block state. Used when a piece fails its hash check (§4.3
    /// "Hash mismatch recovery").
    pub fn reset(&mut self) {
        for status in &mut self.blocks {
            *status = BlockStatus::Missing;
        }
        self.buf.iter_mut().for_each(|b| *b = 0);
        self.last_activity = Instant::now();
    }
}
