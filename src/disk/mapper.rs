use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    sync::{Arc, Mutex},
};

use crate::{
    error::DiskError,
    storage_info::{FileInfo, FsStructure, StorageInfo},
    FileIndex, PieceIndex,
};

/// Maps a torrent's pieces onto the files that make up its download, opening
/// (and creating, with directories as needed) every file up front and
/// handing out plain seek-then-write access to the slice of each file a
/// piece overlaps.
///
/// Unlike the reference this engine's I/O layer is modeled on, writes here
/// go through ordinary [`std::fs::File`] seeks rather than vectored I/O: a
/// download-only engine never needs to satisfy a single read spanning
/// multiple files in one syscall, so the extra platform-specific
/// surface isn't worth carrying.
pub(crate) struct FileMapper {
    storage: StorageInfo,
    files: Vec<Arc<Mutex<std::fs::File>>>,
}

impl FileMapper {
    /// Creates the download directory structure and opens (creating, if
    /// necessary) every file the torrent needs, pre-allocating each to its
    /// final length so writes never need to grow a file mid-download.
    pub fn new(storage: StorageInfo) -> Result<Self, DiskError> {
        std::fs::create_dir_all(&storage.download_dir)?;

        let infos: Vec<&FileInfo> = match &storage.structure {
            FsStructure::File(info) => vec![info],
            FsStructure::Archive { files } => files.iter().collect(),
        };

        let mut files = Vec::with_capacity(infos.len());
        for info in infos {
            let path = storage.download_dir.join(&info.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.set_len(info.len)?;
            files.push(Arc::new(Mutex::new(file)));
        }

        Ok(Self { storage, files })
    }

    fn file_info(&self, file_index: FileIndex) -> &FileInfo {
        match &self.storage.structure {
            FsStructure::File(info) => {
                debug_assert_eq!(file_index, 0);
                info
            }
            FsStructure::Archive { files } => &files[file_index],
        }
    }

    /// Writes a complete, hash-verified piece to disk, splitting it across
    /// however many files it overlaps.
    ///
    /// The blocking file I/O runs on the blocking thread pool so it never
    /// stalls the async runtime's workers.
    pub async fn write_piece(
        &self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<(), DiskError> {
        let piece_offset = self.storage.torrent_piece_offset(index);
        let piece_len = self.storage.piece_len(index)?;
        let piece_end = piece_offset + piece_len as u64;
        let file_range = self.storage.files_intersecting_piece(index)?;

        let mut writes = Vec::new();
        for file_index in file_range {
            let info = self.file_info(file_index);
            let file_start = info.torrent_offset.max(piece_offset);
            let file_end = info.torrent_end_offset().min(piece_end);
            if file_end <= file_start {
                continue;
            }
            let piece_local_start = (file_start - piece_offset) as usize;
            let piece_local_end = (file_end - piece_offset) as usize;
            let file_seek_offset = file_start - info.torrent_offset;
            let chunk = data[piece_local_start..piece_local_end].to_vec();
            let file = Arc::clone(&self.files[file_index]);

            writes.push(tokio::task::spawn_blocking(move || {
                let mut file = file.lock().expect("file mutex poisoned");
                file.seek(SeekFrom::Start(file_seek_offset))?;
                file.write_all(&chunk)?;
                Ok::<_, std::io::Error>(())
            }));
        }

        for write in writes {
            write
                .await
                .expect("blocking disk write task panicked")?;
        }

        Ok(())
    }
}
