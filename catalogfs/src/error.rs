use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the filesystem operations. Each maps onto one POSIX errno.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such entry")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("not a directory")]
    NotADirectory,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

impl FsError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::PermissionDenied => libc::EACCES,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::Io(_) | FsError::Refresh(_) => libc::EIO,
        }
    }
}

impl From<FsError> for rfuse3::Errno {
    fn from(err: FsError) -> Self {
        err.errno().into()
    }
}

/// Failures while repopulating a cache blob from the provider. None of them touch the
/// blob that was in place before the refresh started.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("failed to stage provider output for {key}: {source}")]
    Staging { key: String, source: io::Error },

    #[error("failed to spawn provider {provider:?}: {source}")]
    Spawn { provider: PathBuf, source: io::Error },

    #[error("failed to wait for provider refreshing {key}: {source}")]
    Wait { key: String, source: io::Error },

    #[error("provider timed out after {timeout:?} refreshing {key}")]
    Timeout { key: String, timeout: Duration },

    #[error("provider exited with {status} refreshing {key}")]
    ExitStatus { key: String, status: ExitStatus },

    #[error("provider emitted an invalid blob for {key}: {source}")]
    InvalidOutput { key: String, source: BlobError },

    #[error("failed to install refreshed blob for {key}: {source}")]
    Persist { key: String, source: io::Error },
}

/// Structural problems found while decoding or building a cache blob.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob is {len} bytes, shorter than its header")]
    TruncatedHeader { len: usize },

    #[error("header claims {count} entries but only {available} bytes follow it")]
    EntryTableOverflow { count: u64, available: usize },

    #[error("invalid entry name {0:?}")]
    InvalidName(String),

    #[error("duplicate entry name {0:?}")]
    DuplicateName(String),
}
