//! Path-based filesystem operations answered from the cache.
//!
//! Each operation normalizes its path, opens the blob of the directory that holds
//! the answer, lets the refresher bring it up to date, maps it and scans the entry
//! table. The mapping (and its descriptor) is dropped before the operation returns.

use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::cache::blob::{BlobView, Entry, EntryKind};
use crate::cache::mmap::BlobMapping;
use crate::config::Config;
use crate::error::FsError;
use crate::path::{CacheKey, LogicalPath};
use crate::refresh::{Freshness, Refresher};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileKind {
    Directory,
    File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub kind: FileKind,
    pub size: u64,
    pub perm: u16,
    pub nlink: u32,
    pub mtime: SystemTime,
}

impl Attributes {
    pub fn directory(mtime: SystemTime) -> Self {
        Self {
            kind: FileKind::Directory,
            size: 0,
            perm: 0o755,
            nlink: 2,
            mtime,
        }
    }

    pub fn file(size: u64, mtime: SystemTime) -> Self {
        Self {
            kind: FileKind::File,
            size,
            perm: 0o444,
            nlink: 1,
            mtime,
        }
    }

    fn of(entry: &Entry<'_>, mtime: SystemTime) -> Self {
        match entry.kind {
            EntryKind::File => Self::file(entry.size(), mtime),
            _ => Self::directory(mtime),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub attr: Attributes,
}

pub struct CatalogFs {
    config: Config,
    store: CacheStore,
    refresher: Refresher,
    mounted_at: SystemTime,
}

impl CatalogFs {
    pub fn new(config: Config) -> Self {
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        Self {
            config,
            store,
            refresher,
            mounted_at: SystemTime::now(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Prepare the cache root. Called once when the filesystem is mounted.
    pub fn init(&self) -> io::Result<()> {
        self.store.ensure_root()
    }

    /// Open, freshen and map the blob of `key`.
    async fn snapshot(&self, key: &CacheKey) -> Result<BlobMapping, FsError> {
        // Blob files share the directory namespace, so no catalog directory can
        // carry their name.
        if key.dir().segments().any(|seg| seg == self.config.metadata_file) {
            return Err(FsError::NotFound);
        }
        let lock = self.refresher.lock_for(key);
        let _guard = lock.lock().await;

        let file = self.store.open_or_create(key)?;
        let file = match self.refresher.ensure_fresh(&self.store, key, &file).await? {
            Freshness::Fresh => file,
            Freshness::Refreshed => {
                drop(file);
                self.store.open_or_create(key)?
            }
        };
        Ok(self.store.map(file)?)
    }

    /// A corrupt blob has no entries.
    fn view<'m>(mapping: &'m BlobMapping, key: &CacheKey) -> Option<BlobView<'m>> {
        match mapping.view() {
            Ok(view) => Some(view),
            Err(e) => {
                warn!("ignoring corrupt cache blob for {key}: {e}");
                None
            }
        }
    }

    pub async fn getattr(&self, path: impl Into<LogicalPath>) -> Result<Attributes, FsError> {
        let path: LogicalPath = path.into();
        let Some((parent, leaf)) = path.split_parent() else {
            return Ok(Attributes::directory(self.mounted_at));
        };
        let key = CacheKey::from(&parent);
        let mapping = self.snapshot(&key).await?;
        let view = Self::view(&mapping, &key).ok_or(FsError::NotFound)?;
        let entry = view.find(leaf).ok_or(FsError::NotFound)?;
        Ok(Attributes::of(&entry, refresh_time(&view)))
    }

    /// List a directory from its own blob: `.` and `..` first, then the entries in
    /// the order the provider emitted them.
    pub async fn readdir(&self, path: impl Into<LogicalPath>) -> Result<Vec<DirEntry>, FsError> {
        let path: LogicalPath = path.into();
        let key = CacheKey::from(&path);
        let mapping = self.snapshot(&key).await?;

        let view = Self::view(&mapping, &key);
        let mtime = view.as_ref().map(refresh_time).unwrap_or(self.mounted_at);
        let mut out = vec![
            DirEntry {
                name: ".".into(),
                attr: Attributes::directory(mtime),
            },
            DirEntry {
                name: "..".into(),
                attr: Attributes::directory(mtime),
            },
        ];
        if let Some(view) = view {
            out.extend(view.entries().map(|e| DirEntry {
                name: e.name.to_string(),
                attr: Attributes::of(&e, mtime),
            }));
        }
        debug!("listed {path}: {} entries", out.len() - 2);
        Ok(out)
    }

    /// Only regular files opened read-only are allowed.
    pub async fn open(
        &self,
        path: impl Into<LogicalPath>,
        flags: u32,
    ) -> Result<Attributes, FsError> {
        let attr = self.getattr(path).await?;
        if attr.kind != FileKind::File {
            return Err(FsError::NotFound);
        }
        if flags as libc::c_int & libc::O_ACCMODE != libc::O_RDONLY {
            return Err(FsError::PermissionDenied);
        }
        Ok(attr)
    }

    /// Copy up to `size` bytes of the file at `path` starting at `offset`. Reads at or
    /// past the end return no bytes.
    pub async fn read(
        &self,
        path: impl Into<LogicalPath>,
        offset: u64,
        size: u32,
    ) -> Result<Vec<u8>, FsError> {
        let path: LogicalPath = path.into();
        let Some((parent, leaf)) = path.split_parent() else {
            return Err(FsError::NotFound);
        };
        let key = CacheKey::from(&parent);
        let mapping = self.snapshot(&key).await?;
        let view = Self::view(&mapping, &key).ok_or(FsError::NotFound)?;
        let entry = view
            .find(leaf)
            .filter(|e| e.kind == EntryKind::File)
            .ok_or(FsError::NotFound)?;
        Ok(entry.read(offset, size as usize).to_vec())
    }
}

fn refresh_time(view: &BlobView<'_>) -> SystemTime {
    let secs = view.last_refresh();
    if secs.is_finite() && secs > 0.0 {
        Duration::try_from_secs_f64(secs)
            .ok()
            .and_then(|d| UNIX_EPOCH.checked_add(d))
            .unwrap_or(UNIX_EPOCH)
    } else {
        UNIX_EPOCH
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::blob::{BlobBuilder, unix_now};
    use crate::error::RefreshError;
    use crate::test_utils::ScriptProvider;
    use std::fs;

    fn catalog() -> (ScriptProvider, CatalogFs) {
        let provider = ScriptProvider::new();
        let mut root = BlobBuilder::new();
        root.directory("alpha").unwrap();
        root.file("beta.txt", "hello world").unwrap();
        provider.publish(&[], &root.encode(unix_now()));

        let mut alpha = BlobBuilder::new();
        alpha.file("zeta", "last").unwrap();
        alpha.directory("deeper").unwrap();
        alpha.file("a", "first").unwrap();
        provider.publish(&["alpha"], &alpha.encode(unix_now()));

        let fs = CatalogFs::new(provider.config());
        fs.init().unwrap();
        (provider, fs)
    }

    fn names(entries: &[DirEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_alpha_beta_scenario() {
        let (_provider, fs) = catalog();

        let listing = fs.readdir("/").await.unwrap();
        assert_eq!(names(&listing), [".", "..", "alpha", "beta.txt"]);

        let attr = fs.getattr("/beta.txt").await.unwrap();
        assert_eq!(attr.kind, FileKind::File);
        assert_eq!(attr.size, 11);
        assert_eq!(attr.perm, 0o444);

        let data = fs.read("/beta.txt", 0, 20).await.unwrap();
        assert_eq!(data, b"hello world");

        assert!(fs.getattr("/alpha").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_listing_keeps_provider_order() {
        let (_provider, fs) = catalog();
        let listing = fs.readdir("/alpha").await.unwrap();
        assert_eq!(names(&listing), [".", "..", "zeta", "deeper", "a"]);
    }

    #[tokio::test]
    async fn test_listed_names_resolve() {
        let (_provider, fs) = catalog();
        for dir in ["/", "/alpha"] {
            let listing = fs.readdir(dir).await.unwrap();
            for entry in listing.iter().skip(2) {
                let path = LogicalPath::new(dir).join(&entry.name);
                let attr = fs.getattr(&path).await.unwrap();
                assert_eq!(attr.kind, entry.attr.kind, "{path}");
                assert_eq!(attr.size, entry.attr.size, "{path}");
            }
        }
    }

    #[tokio::test]
    async fn test_root_getattr_needs_no_cache() {
        let provider = ScriptProvider::new();
        let fs = CatalogFs::new(provider.config().provider("/nonexistent/provider"));

        let attr = fs.getattr("/").await.unwrap();
        assert!(attr.is_dir());
        assert_eq!(attr.nlink, 2);
        assert_eq!(attr.perm, 0o755);
        assert!(provider.calls().is_empty());
        assert!(!fs.store().root().exists());
    }

    #[tokio::test]
    async fn test_missing_entry_is_not_found() {
        let (_provider, fs) = catalog();
        assert!(matches!(fs.getattr("/gamma").await, Err(FsError::NotFound)));
        assert!(matches!(fs.read("/gamma", 0, 4).await, Err(FsError::NotFound)));
        assert!(matches!(
            fs.getattr("/alpha/missing").await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_one_refresh_per_window() {
        let (provider, fs) = catalog();
        fs.readdir("/").await.unwrap();
        fs.readdir("/").await.unwrap();
        fs.getattr("/beta.txt").await.unwrap();
        fs.read("/beta.txt", 0, 5).await.unwrap();
        assert_eq!(provider.calls(), vec![String::new()]);

        fs.getattr("/alpha/zeta").await.unwrap();
        fs.readdir("/alpha").await.unwrap();
        assert_eq!(provider.calls(), vec![String::new(), "alpha".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_stale_access_spawns_once() {
        let (provider, fs) = catalog();
        let fs = std::sync::Arc::new(fs);
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let fs = fs.clone();
            tasks.push(tokio::spawn(async move { fs.readdir("/").await.map(|l| l.len()) }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 4);
        }
        assert_eq!(provider.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_open_rules() {
        let (_provider, fs) = catalog();
        let attr = fs.open("/beta.txt", libc::O_RDONLY as u32).await.unwrap();
        assert_eq!(attr.size, 11);

        assert!(matches!(
            fs.open("/alpha", libc::O_RDONLY as u32).await,
            Err(FsError::NotFound)
        ));
        assert!(matches!(fs.open("/", 0).await, Err(FsError::NotFound)));
        for flags in [libc::O_WRONLY, libc::O_RDWR] {
            assert!(matches!(
                fs.open("/beta.txt", flags as u32).await,
                Err(FsError::PermissionDenied)
            ));
        }
        assert!(matches!(
            fs.open("/nope", libc::O_RDWR as u32).await,
            Err(FsError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_read_offsets() {
        let (_provider, fs) = catalog();
        assert_eq!(fs.read("/beta.txt", 6, 100).await.unwrap(), b"world");
        assert_eq!(fs.read("/beta.txt", 0, 5).await.unwrap(), b"hello");
        assert!(fs.read("/beta.txt", 11, 10).await.unwrap().is_empty());
        assert!(fs.read("/beta.txt", 4096, 10).await.unwrap().is_empty());
        assert!(matches!(fs.read("/alpha", 0, 1).await, Err(FsError::NotFound)));
        assert!(matches!(fs.read("/", 0, 1).await, Err(FsError::NotFound)));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces_as_io() {
        let provider = ScriptProvider::new();
        let config = provider.config().provider("/nonexistent/provider");
        let fs = CatalogFs::new(config);
        let key = CacheKey::from(&LogicalPath::root());

        let mut old = BlobBuilder::new();
        old.file("kept", "1").unwrap();
        let old = old.encode(1.0);
        fs.store().open_or_create(&key).unwrap();
        fs::write(fs.store().blob_path(&key), &old).unwrap();

        let err = fs.getattr("/kept").await.unwrap_err();
        assert!(
            matches!(err, FsError::Refresh(RefreshError::Spawn { .. })),
            "{err:?}"
        );
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(fs::read(fs.store().blob_path(&key)).unwrap(), old);
    }

    #[tokio::test]
    async fn test_corrupt_fresh_blob_reads_as_empty() {
        let provider = ScriptProvider::new();
        let fs = CatalogFs::new(provider.config());
        let key = CacheKey::from(&LogicalPath::root());

        let mut blob = BlobBuilder::new();
        blob.file("x", "payload").unwrap();
        let mut blob = blob.encode(unix_now());
        // point the payload past the end of the blob
        let rec = crate::cache::blob::HEADER_SIZE;
        let size_at = rec + crate::cache::blob::NAME_CAPACITY;
        blob[size_at..size_at + 8].copy_from_slice(&1_000_000u64.to_le_bytes());
        fs.store().open_or_create(&key).unwrap();
        fs::write(fs.store().blob_path(&key), &blob).unwrap();

        assert!(matches!(fs.getattr("/x").await, Err(FsError::NotFound)));
        assert_eq!(names(&fs.readdir("/").await.unwrap()), [".", ".."]);
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mtime_follows_refresh_stamp() {
        let provider = ScriptProvider::new();
        let stamp = unix_now().floor();
        let mut root = BlobBuilder::new();
        root.file("f", "1").unwrap();
        provider.publish(&[], &root.encode(stamp));
        let fs = CatalogFs::new(provider.config());

        let attr = fs.getattr("/f").await.unwrap();
        let secs = attr.mtime.duration_since(UNIX_EPOCH).unwrap().as_secs_f64();
        assert_eq!(secs, stamp);
    }

    #[tokio::test]
    async fn test_blob_file_name_is_not_a_directory() {
        let (provider, fs) = catalog();
        assert!(matches!(
            fs.getattr("/__metadata.dat").await,
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            fs.getattr("/__metadata.dat/inner").await,
            Err(FsError::NotFound)
        ));
        assert!(matches!(
            fs.readdir("/alpha/__metadata.dat").await,
            Err(FsError::NotFound)
        ));
        assert!(fs.store().blob_path(&CacheKey::from(&LogicalPath::root())).is_file());
        assert_eq!(provider.calls(), vec![String::new()]);
    }
}
