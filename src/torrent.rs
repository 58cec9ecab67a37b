//! The engine's own view of a torrent, derived from a parsed [`Metainfo`].
//!
//! [`crate::metainfo::Metainfo`] mirrors the wire/bencode shape of a
//! `.torrent` file; [`Torrent`] is the normalized, ready-to-drive form the
//! rest of the engine works with (flattened file list, chunked piece
//! hashes, precomputed info hash).

use crate::{
    metainfo::Metainfo,
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

/// A single torrent's normalized metadata, produced by
/// [`Metainfo::into_torrent`].
#[derive(Clone, Debug)]
pub struct Torrent {
    /// The name of the torrent, used as the download directory name for
    /// archive downloads.
    pub name: String,
    /// The SHA-1 hash of the bencoded `info` dictionary, uniquely
    /// identifying this torrent to trackers and peers.
    pub info_hash: Sha1Hash,
    /// The nominal length of a piece, in bytes.
    pub piece_len: u32,
    /// The expected SHA-1 hash of each piece, in piece order.
    pub piece_hashes: Vec<Sha1Hash>,
    /// The files that make up the torrent's contents.
    pub structure: FsStructure,
    /// The trackers to announce to, in the order they should be tried
    /// (primary first, then announce-list alternates).
    pub trackers: Vec<String>,
}

impl Torrent {
    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Returns the expected hash of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Option<&Sha1Hash> {
        self.piece_hashes.get(index)
    }

    /// Builds a [`Torrent`] straight from a parsed [`Metainfo`].
    ///
    /// This is a convenience that forwards to [`Metainfo::into_torrent`];
    /// it exists so callers that only have the metainfo bytes can get a
    /// driveable torrent without naming the metainfo type explicitly.
    pub fn from_metainfo(metainfo: Metainfo) -> crate::error::Result<Self, crate::error::MetainfoError> {
        metainfo.into_torrent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_torrent() -> Torrent {
        Torrent {
            name: "foo".to_string(),
            info_hash: [0; 20],
            piece_len: 16,
            piece_hashes: vec![[1; 20], [2; 20], [3; 20]],
            structure: FsStructure::File(FileInfo {
                path: "foo".into(),
                len: 40,
                torrent_offset: 0,
            }),
            trackers: vec!["http://tracker.example.com/announce".to_string()],
        }
    }

    #[test]
    fn test_piece_count_and_hash() {
        let torrent = dummy_torrent();
        assert_eq!(torrent.piece_count(), 3);
        assert_eq!(torrent.piece_hash(1), Some(&[2; 20]));
        assert_eq!(torrent.piece_hash(3), None);
    }
}
