//! Durable torrent records.
//!
//! # Design
//!
//! - [`TorrentStore`] is the persistence seam; the session only reads from it at startup and
//!   the worker writes batch outcomes to it.
//! - [`FastResumeStore`] keeps three files per torrent under one directory: `<hex>.json`
//!   metadata, the `<hex>.torrent` blob and an optional `<hex>.fastresume` blob. Writes go
//!   through a temporary file and a rename.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

use seedbank_core::InfoHash;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

const METADATA_EXTENSION: &str = "json";
const TORRENT_EXTENSION: &str = "torrent";
const FASTRESUME_EXTENSION: &str = "fastresume";

/// A persisted torrent as read back at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredTorrent {
    /// Row identifier.
    pub row_id: i64,
    /// Torrent identifier.
    pub info_hash: InfoHash,
    /// Raw metainfo.
    pub torrent: Vec<u8>,
    /// Payload directory.
    pub download_path: String,
    /// Display name override.
    pub name: Option<String>,
    /// Latest resume data.
    pub resume_data: Option<Vec<u8>>,
}

/// A torrent about to be persisted for the first time.
#[derive(Debug, Clone, Copy)]
pub struct NewTorrent<'a> {
    /// Torrent identifier.
    pub info_hash: InfoHash,
    /// Raw metainfo.
    pub torrent: &'a [u8],
    /// Payload directory.
    pub download_path: &'a str,
    /// Display name override.
    pub name: Option<&'a str>,
}

/// Persistence collaborator.
pub trait TorrentStore: Send + Sync {
    /// Every stored torrent, ordered by row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn load_all(&self) -> StoreResult<Vec<StoredTorrent>>;

    /// Persist a new torrent and return its row id. Inserting a known hash returns the
    /// existing row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    fn insert(&self, torrent: &NewTorrent<'_>) -> StoreResult<i64>;

    /// Replace a torrent's resume data.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown or the write fails.
    fn write_resume_data(&self, info_hash: InfoHash, resume_data: &[u8]) -> StoreResult<()>;

    /// Record a new payload directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown or the write fails.
    fn update_download_path(&self, info_hash: InfoHash, download_path: &str)
    -> StoreResult<()>;

    /// Record a new display name.
    ///
    /// # Errors
    ///
    /// Returns an error if the torrent is unknown or the write fails.
    fn update_name(&self, info_hash: InfoHash, name: &str) -> StoreResult<()>;

    /// Delete a torrent's record. Missing records are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be deleted.
    fn remove(&self, info_hash: InfoHash) -> StoreResult<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredTorrentMetadata {
    row_id: i64,
    info_hash: InfoHash,
    download_path: String,
    #[serde(default)]
    name: Option<String>,
}

/// Directory-backed [`TorrentStore`].
#[derive(Debug)]
pub struct FastResumeStore {
    root: PathBuf,
    last_row_id: AtomicI64,
}

impl FastResumeStore {
    /// Store rooted at `root`. Call [`Self::ensure_initialized`] before use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            last_row_id: AtomicI64::new(0),
        }
    }

    #[must_use]
    /// Directory holding the records.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory and pick up the highest stored row id.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or scanned.
    pub fn ensure_initialized(&self) -> StoreResult<()> {
        fs::create_dir_all(&self.root).map_err(|source| StoreError::Io {
            operation: "create_dir",
            path: self.root.clone(),
            source,
        })?;
        let highest = self
            .read_all_metadata()?
            .iter()
            .map(|metadata| metadata.row_id)
            .max()
            .unwrap_or(0);
        self.last_row_id.fetch_max(highest, Ordering::SeqCst);
        Ok(())
    }

    fn path_for(&self, info_hash: InfoHash, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{extension}", info_hash.to_hex()))
    }

    fn read_all_metadata(&self) -> StoreResult<Vec<StoredTorrentMetadata>> {
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            operation: "read_dir",
            path: self.root.clone(),
            source,
        })?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                operation: "read_dir_entry",
                path: self.root.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(METADATA_EXTENSION) {
                continue;
            }
            records.push(read_metadata(&path)?);
        }
        Ok(records)
    }

    fn read_metadata_for(&self, info_hash: InfoHash) -> StoreResult<StoredTorrentMetadata> {
        let path = self.path_for(info_hash, METADATA_EXTENSION);
        if !path.exists() {
            return Err(StoreError::NotFound { info_hash });
        }
        read_metadata(&path)
    }

    fn write_metadata(&self, metadata: &StoredTorrentMetadata) -> StoreResult<()> {
        let path = self.path_for(metadata.info_hash, METADATA_EXTENSION);
        let encoded = serde_json::to_vec_pretty(metadata).map_err(|source| StoreError::Parse {
            operation: "encode_metadata",
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &encoded)
    }

    fn update_metadata<F>(&self, info_hash: InfoHash, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut StoredTorrentMetadata),
    {
        let mut metadata = self.read_metadata_for(info_hash)?;
        mutate(&mut metadata);
        self.write_metadata(&metadata)
    }
}

impl TorrentStore for FastResumeStore {
    fn load_all(&self) -> StoreResult<Vec<StoredTorrent>> {
        let mut records = Vec::new();
        for metadata in self.read_all_metadata()? {
            let torrent_path = self.path_for(metadata.info_hash, TORRENT_EXTENSION);
            let torrent = fs::read(&torrent_path).map_err(|source| StoreError::Io {
                operation: "read_torrent",
                path: torrent_path,
                source,
            })?;
            let resume_path = self.path_for(metadata.info_hash, FASTRESUME_EXTENSION);
            let resume_data = match fs::read(&resume_path) {
                Ok(payload) => Some(payload),
                Err(err) if err.kind() == ErrorKind::NotFound => None,
                Err(source) => {
                    return Err(StoreError::Io {
                        operation: "read_fastresume",
                        path: resume_path,
                        source,
                    });
                }
            };
            records.push(StoredTorrent {
                row_id: metadata.row_id,
                info_hash: metadata.info_hash,
                torrent,
                download_path: metadata.download_path,
                name: metadata.name,
                resume_data,
            });
        }
        records.sort_by_key(|record| record.row_id);
        Ok(records)
    }

    fn insert(&self, torrent: &NewTorrent<'_>) -> StoreResult<i64> {
        match self.read_metadata_for(torrent.info_hash) {
            Ok(existing) => return Ok(existing.row_id),
            Err(StoreError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
        let row_id = self.last_row_id.fetch_add(1, Ordering::SeqCst) + 1;
        write_atomic(
            &self.path_for(torrent.info_hash, TORRENT_EXTENSION),
            torrent.torrent,
        )?;
        self.write_metadata(&StoredTorrentMetadata {
            row_id,
            info_hash: torrent.info_hash,
            download_path: torrent.download_path.to_string(),
            name: torrent.name.map(str::to_string),
        })?;
        debug!(info_hash = %torrent.info_hash, row_id, "persisted torrent record");
        Ok(row_id)
    }

    fn write_resume_data(&self, info_hash: InfoHash, resume_data: &[u8]) -> StoreResult<()> {
        if !self.path_for(info_hash, METADATA_EXTENSION).exists() {
            return Err(StoreError::NotFound { info_hash });
        }
        write_atomic(
            &self.path_for(info_hash, FASTRESUME_EXTENSION),
            resume_data,
        )
    }

    fn update_download_path(
        &self,
        info_hash: InfoHash,
        download_path: &str,
    ) -> StoreResult<()> {
        self.update_metadata(info_hash, |metadata| {
            download_path.clone_into(&mut metadata.download_path);
        })
    }

    fn update_name(&self, info_hash: InfoHash, name: &str) -> StoreResult<()> {
        self.update_metadata(info_hash, |metadata| {
            metadata.name = Some(name.to_string());
        })
    }

    fn remove(&self, info_hash: InfoHash) -> StoreResult<()> {
        for extension in [METADATA_EXTENSION, TORRENT_EXTENSION, FASTRESUME_EXTENSION] {
            let path = self.path_for(info_hash, extension);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(StoreError::Io {
                        operation: "remove",
                        path,
                        source,
                    });
                }
            }
        }
        Ok(())
    }
}

fn read_metadata(path: &Path) -> StoreResult<StoredTorrentMetadata> {
    let raw = fs::read(path).map_err(|source| StoreError::Io {
        operation: "read_metadata",
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| StoreError::Parse {
        operation: "parse_metadata",
        path: path.to_path_buf(),
        source,
    })
}

/// `<file>.tmp` next to `path`, distinct for each file of one torrent.
fn staging_path(path: &Path) -> PathBuf {
    let mut staging = path.as_os_str().to_owned();
    staging.push(".tmp");
    PathBuf::from(staging)
}

fn write_atomic(path: &Path, contents: &[u8]) -> StoreResult<()> {
    let staging = staging_path(path);
    fs::write(&staging, contents).map_err(|source| StoreError::Io {
        operation: "write",
        path: staging.clone(),
        source,
    })?;
    fs::rename(&staging, path).map_err(|source| StoreError::Io {
        operation: "rename",
        path: path.to_path_buf(),
        source,
    })
}
