//! On-disk cache store
//!
//! One blob per directory lives under the cache root at
//! `<root>/<segments...>/<metadata_file>`. The store only opens, creates and maps
//! blobs; deciding when to rewrite one belongs to the refresher.
//!
//! Submodules:
//! - `blob`: binary layout, bounds-checked view and encoder
//! - `mmap`: per-request shared mapping of a blob file
pub mod blob;
pub mod mmap;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::config::Config;
use crate::path::CacheKey;
use mmap::BlobMapping;

pub struct CacheStore {
    root: PathBuf,
    metadata_file: String,
}

impl CacheStore {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.cache_root.clone(),
            metadata_file: config.metadata_file.clone(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root)
    }

    pub fn blob_path(&self, key: &CacheKey) -> PathBuf {
        key.blob_path(&self.root, &self.metadata_file)
    }

    /// Open the blob of `key` read/write, creating it (empty) and any missing parent
    /// directories first.
    pub fn open_or_create(&self, key: &CacheKey) -> io::Result<File> {
        let path = self.blob_path(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to create cache directory {}: {e}", dir.display()),
                )
            })?;
        }
        trace!("opening cache blob {}", path.display());
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&path)
            .map_err(|e| {
                io::Error::new(
                    e.kind(),
                    format!("Failed to open cache blob {}: {e}", path.display()),
                )
            })
    }

    pub fn map(&self, file: File) -> io::Result<BlobMapping> {
        BlobMapping::map(file)
    }
}
