//! Persistence for verified backups.
//!
//! The dispatcher talks to storage only through [`FileStore`]. The disk
//! implementation lays files out as `<root>/<client id hex>/<filename>`,
//! writes through a `.part` staging file, and renames on commit, so a
//! reader never sees a half-written backup.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vaultline_core::message::{ClientId, MAX_NAME_LEN};

/// Opaque handle for one write in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreHandle(u64);

pub trait FileStore: Send + Sync {
    fn begin(
        &self,
        client_id: &ClientId,
        filename: &str,
        expected_size: u64,
    ) -> Result<StoreHandle, StoreError>;

    fn append(&self, handle: StoreHandle, bytes: &[u8]) -> Result<(), StoreError>;

    /// Make the file visible at its final path.
    fn commit(&self, handle: StoreHandle) -> Result<PathBuf, StoreError>;

    /// Drop everything written under `handle`.
    fn discard(&self, handle: StoreHandle) -> Result<(), StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid filename {name:?}: {reason}")]
    InvalidFilename { name: String, reason: &'static str },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unknown store handle")]
    UnknownHandle,

    #[error("wrote {written} bytes, expected {expected}")]
    SizeMismatch { expected: u64, written: u64 },

    #[error("failed to write metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Sidecar written next to each committed file as `<filename>.meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedMeta {
    pub client_id: String,
    pub filename: String,
    pub size: u64,
    /// Unix seconds.
    pub committed_at: u64,
}

/// Reject names that could escape the client's directory or hide files.
pub fn validate_filename(name: &str) -> Result<(), StoreError> {
    let bad = |reason| {
        Err(StoreError::InvalidFilename {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return bad("empty");
    }
    if name.len() > MAX_NAME_LEN {
        return bad("longer than 255 bytes");
    }
    if name.contains('\0') {
        return bad("contains NUL");
    }
    if name.contains('\\') {
        return bad("contains a backslash");
    }
    if name.starts_with('/') {
        return bad("absolute path");
    }
    if name.contains("//") {
        return bad("empty path component");
    }
    if name.split('/').any(|part| part.starts_with('.')) {
        return bad("hidden or relative path component");
    }
    Ok(())
}

struct PendingFile {
    file: File,
    staging: PathBuf,
    target: PathBuf,
    client_id: ClientId,
    filename: String,
    expected_size: u64,
    written: u64,
}

pub struct DiskFileStore {
    root: PathBuf,
    pending: DashMap<StoreHandle, PendingFile>,
    next_handle: AtomicU64,
}

impl DiskFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self {
            root,
            pending: DashMap::new(),
            next_handle: AtomicU64::new(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of a committed file.
    pub fn path_for(&self, client_id: &ClientId, filename: &str) -> PathBuf {
        self.root.join(client_id.to_hex()).join(filename)
    }

    /// Writes that have begun but not been committed or discarded.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn io_err(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn write_meta(path: &Path, meta: &CommittedMeta) -> Result<(), StoreError> {
    let text = serde_json::to_vec_pretty(meta)?;
    std::fs::write(path, text).map_err(|e| io_err(path, e))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

impl FileStore for DiskFileStore {
    fn begin(
        &self,
        client_id: &ClientId,
        filename: &str,
        expected_size: u64,
    ) -> Result<StoreHandle, StoreError> {
        validate_filename(filename)?;

        let target = self.path_for(client_id, filename);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let staging = with_suffix(&target, ".part");
        let file = File::create(&staging).map_err(|e| io_err(&staging, e))?;

        let handle = StoreHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.pending.insert(
            handle,
            PendingFile {
                file,
                staging,
                target,
                client_id: *client_id,
                filename: filename.to_string(),
                expected_size,
                written: 0,
            },
        );
        Ok(handle)
    }

    fn append(&self, handle: StoreHandle, bytes: &[u8]) -> Result<(), StoreError> {
        let mut pending = self.pending.get_mut(&handle).ok_or(StoreError::UnknownHandle)?;
        let written = pending.written + bytes.len() as u64;
        if written > pending.expected_size {
            return Err(StoreError::SizeMismatch {
                expected: pending.expected_size,
                written,
            });
        }
        let staging = pending.staging.clone();
        pending
            .file
            .write_all(bytes)
            .map_err(|e| io_err(&staging, e))?;
        pending.written = written;
        Ok(())
    }

    fn commit(&self, handle: StoreHandle) -> Result<PathBuf, StoreError> {
        let (_, pending) = self.pending.remove(&handle).ok_or(StoreError::UnknownHandle)?;
        let PendingFile {
            file,
            staging,
            target,
            client_id,
            filename,
            expected_size,
            written,
        } = pending;

        if written != expected_size {
            let _ = std::fs::remove_file(&staging);
            return Err(StoreError::SizeMismatch {
                expected: expected_size,
                written,
            });
        }

        let meta = CommittedMeta {
            client_id: client_id.to_hex(),
            filename,
            size: written,
            committed_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let meta_path = with_suffix(&target, ".meta.json");
        let meta_staging = with_suffix(&meta_path, ".part");

        // Nothing is visible at `target` until the data rename succeeds.
        let synced = file.sync_all().map_err(|e| io_err(&staging, e));
        drop(file);
        let staged = synced
            .and_then(|()| write_meta(&meta_staging, &meta))
            .and_then(|()| std::fs::rename(&staging, &target).map_err(|e| io_err(&target, e)));
        if let Err(e) = staged {
            let _ = std::fs::remove_file(&staging);
            let _ = std::fs::remove_file(&meta_staging);
            return Err(e);
        }

        // The backup is committed; a missing sidecar is only worth a warning.
        if let Err(e) = std::fs::rename(&meta_staging, &meta_path) {
            tracing::warn!(
                path = %meta_path.display(),
                error = %e,
                "failed to publish metadata sidecar"
            );
            let _ = std::fs::remove_file(&meta_staging);
        }

        tracing::info!(
            client = %client_id,
            filename = %meta.filename,
            bytes = meta.size,
            path = %target.display(),
            "backup committed"
        );
        Ok(target)
    }

    fn discard(&self, handle: StoreHandle) -> Result<(), StoreError> {
        let (_, pending) = self.pending.remove(&handle).ok_or(StoreError::UnknownHandle)?;
        drop(pending.file);
        match std::fs::remove_file(&pending.staging) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&pending.staging, e)),
        }
    }
}
