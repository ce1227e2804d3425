//! Path normalization and cache keys.
//!
//! Every request path is reduced to a [`LogicalPath`]: root-anchored, with no empty,
//! `.` or `..` segments. A directory's [`CacheKey`] is its logical path, and it maps
//! deterministically onto the blob location under the cache root.

use std::fmt;
use std::path::{Path, PathBuf};

/// Normalized, root-anchored path inside the mounted tree.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LogicalPath {
    segments: Vec<String>,
}

impl LogicalPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Normalize a raw request path. Empty input and `.` both collapse to `/`;
    /// `..` never climbs above the root.
    pub fn new(raw: &str) -> Self {
        let mut segments: Vec<String> = Vec::new();
        for seg in raw.split('/') {
            match seg {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                s => segments.push(s.to_string()),
            }
        }
        Self { segments }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Parent directory; the root has none.
    pub fn parent(&self) -> Option<LogicalPath> {
        self.split_parent().map(|(parent, _)| parent)
    }

    /// Last segment; `None` for the root.
    pub fn leaf(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    /// Split into (parent directory, leaf name). Callers use `None` to short-circuit
    /// the root, which has no entry inside any blob.
    pub fn split_parent(&self) -> Option<(LogicalPath, &str)> {
        let (leaf, rest) = self.segments.split_last()?;
        Some((
            LogicalPath {
                segments: rest.to_vec(),
            },
            leaf.as_str(),
        ))
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.segments.iter().map(String::as_str)
    }

    /// Append a child name. The name goes through the same normalization as a full
    /// path, so `join("..")` yields the parent.
    pub fn join(&self, name: &str) -> LogicalPath {
        let mut joined = self.to_string();
        joined.push('/');
        joined.push_str(name);
        LogicalPath::new(&joined)
    }
}

impl fmt::Display for LogicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

impl From<&str> for LogicalPath {
    fn from(raw: &str) -> Self {
        LogicalPath::new(raw)
    }
}

impl From<&String> for LogicalPath {
    fn from(raw: &String) -> Self {
        LogicalPath::new(raw)
    }
}

impl From<&LogicalPath> for LogicalPath {
    fn from(path: &LogicalPath) -> Self {
        path.clone()
    }
}

/// Identifies the cache blob of one directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    dir: LogicalPath,
}

impl CacheKey {
    pub fn new(dir: LogicalPath) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &LogicalPath {
        &self.dir
    }

    /// `<cache_root>/<seg_1>/.../<seg_n>/<metadata_file>`
    ///
    /// Directories and blob files share one namespace, so a segment equal to
    /// `metadata_file` has no blob of its own.
    pub fn blob_path(&self, cache_root: &Path, metadata_file: &str) -> PathBuf {
        let mut path = cache_root.to_path_buf();
        for seg in self.dir.segments() {
            path.push(seg);
        }
        path.push(metadata_file);
        path
    }

    /// Arguments handed to the provider: one per path segment, none for the root.
    pub fn provider_args(&self) -> impl Iterator<Item = &str> + '_ {
        self.dir.segments()
    }
}

impl From<&LogicalPath> for CacheKey {
    fn from(dir: &LogicalPath) -> Self {
        CacheKey::new(dir.clone())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.dir.fmt(f)
    }
}
