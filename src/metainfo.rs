//! Parsing of `.torrent` metainfo files (BEP 3).
//!
//! [`Metainfo`] mirrors the bencoded structure of the file as closely as
//! `serde_bencode` allows. [`Metainfo::into_torrent`] normalizes it into the
//! engine's own [`crate::torrent::Torrent`], which is what the rest of the
//! crate is built against.

use sha1::{Digest, Sha1};

use crate::{
    error::MetainfoError,
    storage_info::{FileInfo, FsStructure},
    torrent::Torrent,
    Sha1Hash,
};

/// The raw, bencode-shaped contents of a `.torrent` file.
#[derive(Debug, Serialize, Deserialize)]
pub struct Metainfo {
    pub info: Info,
    /// The primary tracker's announce URL.
    pub announce: Option<String>,
    /// BEP 12 announce-list: a list of tiers, each a list of tracker URLs.
    /// Trackers within the same tier are tried in random order; tiers are
    /// tried in order.
    #[serde(rename = "announce-list")]
    pub announce_list: Option<Vec<Vec<String>>>,
}

impl Metainfo {
    /// Parses a metainfo file from its raw bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, MetainfoError> {
        Ok(serde_bencode::from_bytes(buf)?)
    }

    /// Computes the info hash: the SHA-1 digest of the bencoded `info`
    /// dictionary, verbatim as it appeared in the torrent file.
    pub fn create_info_hash(&self) -> Result<Sha1Hash, MetainfoError> {
        let info = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&info);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }

    /// Flattens the primary `announce` URL and the `announce-list` tiers
    /// into a single ordered list of trackers to try, primary first.
    fn trackers(&self) -> Vec<String> {
        let mut trackers = Vec::new();
        if let Some(announce) = &self.announce {
            trackers.push(announce.clone());
        }
        if let Some(tiers) = &self.announce_list {
            for tier in tiers {
                for url in tier {
                    if !trackers.contains(url) {
                        trackers.push(url.clone());
                    }
                }
            }
        }
        trackers
    }

    /// Splits the concatenated `pieces` byte string into its constituent
    /// 20-byte SHA-1 hashes.
    fn piece_hashes(&self) -> Result<Vec<Sha1Hash>, MetainfoError> {
        let pieces = &self.info.pieces;
        if pieces.len() % 20 != 0 {
            return Err(MetainfoError::InvalidPiecesLength(pieces.len()));
        }
        Ok(pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Normalizes this metainfo into the engine's internal [`Torrent`]
    /// representation: flattens the announce-list, chunks the piece
    /// hashes, and resolves the file system structure.
    pub fn into_torrent(self) -> Result<Torrent, MetainfoError> {
        let info_hash = self.create_info_hash()?;
        let piece_hashes = self.piece_hashes()?;
        let trackers = self.trackers();
        let piece_len = self.info.piece_length as u32;
        let name = self.info.name.clone();
        let structure = self.info.into_fs_structure()?;

        Ok(Torrent {
            name,
            info_hash,
            piece_len,
            piece_hashes,
            structure,
            trackers,
        })
    }
}

/// The bencoded `info` dictionary: the part of the metainfo that is hashed
/// to produce the info hash, and so must round-trip through
/// (de)serialization byte for byte.
#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    pub piece_length: u64,
    pub length: Option<u64>,
    pub files: Option<Vec<File>>,
    pub private: Option<u8>,
}

impl Info {
    /// Resolves this `info` dictionary into either a single-file or
    /// multi-file [`FsStructure`], per BEP 3: exactly one of `length` or
    /// `files` must be present.
    fn into_fs_structure(self) -> Result<FsStructure, MetainfoError> {
        match (self.length, self.files) {
            (Some(len), None) => Ok(FsStructure::File(FileInfo {
                path: self.name.into(),
                len,
                torrent_offset: 0,
            })),
            (None, Some(files)) => {
                let mut torrent_offset = 0;
                let mut infos = Vec::with_capacity(files.len());
                for file in files {
                    if file.path.iter().any(|c| c.is_empty()) {
                        return Err(MetainfoError::EmptyFilePath);
                    }
                    let len = file.length as u64;
                    // relative to the download directory `StorageInfo`
                    // nests archives under (the torrent's own name), not
                    // prefixed with it again here
                    let path: std::path::PathBuf = file.path.iter().collect();
                    infos.push(FileInfo {
                        path,
                        len,
                        torrent_offset,
                    });
                    torrent_offset += len;
                }
                Ok(FsStructure::Archive { files: infos })
            }
            (Some(_), Some(_)) | (None, None) => {
                Err(MetainfoError::MissingFileLength)
            }
        }
    }
}

/// A single file entry within a multi-file torrent's `info.files` list.
#[derive(Debug, Serialize, Deserialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
}
