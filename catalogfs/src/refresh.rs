//! Staleness checks and provider-driven refresh of cache blobs.
//!
//! A blob is fresh while `now - last_refresh <= ttl`. Otherwise the provider is run
//! with one argument per path segment and its stdout is captured into a staging file
//! next to the blob. The staging file replaces the blob by rename only when the
//! provider exited successfully and its output decodes as a blob, so a failed refresh
//! never disturbs what was cached before.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File, Permissions};
use std::io;
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::cache::blob::{self, BlobView, HEADER_SIZE, RECORD_SIZE};
use crate::cache::mmap::BlobMapping;
use crate::config::Config;
use crate::error::{BlobError, RefreshError};
use crate::path::CacheKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// The blob already on disk may be served.
    Fresh,
    /// A new blob was installed; descriptors opened before this point see the old one.
    Refreshed,
}

/// One async mutex per cache key, serializing the stale-check/refresh sequence.
#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    /// Entries nobody holds are dropped on the way, so the map tracks only keys
    /// with a request in flight.
    fn get(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(key.clone()).or_default().clone()
    }
}

pub struct Refresher {
    provider: PathBuf,
    provider_args: Vec<OsString>,
    ttl: Duration,
    timeout: Duration,
    locks: KeyLocks,
}

impl Refresher {
    pub fn new(config: &Config) -> Self {
        Self {
            provider: config.provider.clone(),
            provider_args: config.provider_args.clone(),
            ttl: config.ttl,
            timeout: config.refresh_timeout,
            locks: KeyLocks::default(),
        }
    }

    /// Lock guarding the refresh decision for `key`. Hold it from the stale check
    /// until the fresh blob has been opened.
    pub fn lock_for(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks.get(key)
    }

    /// Whether the blob behind `file` can be served without asking the provider.
    /// Short, never-refreshed, expired and structurally impossible blobs are stale.
    pub fn is_fresh(&self, file: &File) -> io::Result<bool> {
        let len = file.metadata()?.len();
        let mut header = [0u8; HEADER_SIZE];
        if len < HEADER_SIZE as u64 || !read_full_at(file, &mut header)? {
            return Ok(false);
        }
        let count = u64::from_le_bytes(header[0..8].try_into().unwrap_or_default());
        let last_refresh = f64::from_le_bytes(header[8..16].try_into().unwrap_or_default());
        let fits = count
            .checked_mul(RECORD_SIZE as u64)
            .and_then(|table| table.checked_add(HEADER_SIZE as u64))
            .is_some_and(|end| end <= len);
        Ok(fits && blob::is_fresh(last_refresh, blob::unix_now(), self.ttl.as_secs_f64()))
    }

    /// Refresh the blob of `key` unless `file` (the currently installed blob) is
    /// still fresh.
    pub async fn ensure_fresh(
        &self,
        store: &CacheStore,
        key: &CacheKey,
        file: &File,
    ) -> Result<Freshness, RefreshError> {
        let fresh = self.is_fresh(file).map_err(|source| RefreshError::Staging {
            key: key.to_string(),
            source,
        })?;
        if fresh {
            debug!("cache hit for {key}");
            return Ok(Freshness::Fresh);
        }
        debug!("cache for {key} is stale, refreshing");
        self.refresh(store, key).await?;
        Ok(Freshness::Refreshed)
    }

    /// Run the provider for `key` and install its output as the new blob.
    pub async fn refresh(&self, store: &CacheStore, key: &CacheKey) -> Result<(), RefreshError> {
        let staging_err = |source: io::Error| RefreshError::Staging {
            key: key.to_string(),
            source,
        };
        let blob_path = store.blob_path(key);
        let dir = blob_path
            .parent()
            .ok_or_else(|| staging_err(io::Error::other("blob path has no parent")))?;
        fs::create_dir_all(dir).map_err(staging_err)?;
        let staging = tempfile::Builder::new()
            .prefix(".refresh-")
            .tempfile_in(dir)
            .map_err(staging_err)?;
        let sink = staging.reopen().map_err(staging_err)?;

        self.run_provider(key, sink).await?;

        let written = staging.reopen().map_err(staging_err)?;
        let mapping = BlobMapping::map(written).map_err(staging_err)?;
        validate_output(&mapping).map_err(|source| RefreshError::InvalidOutput {
            key: key.to_string(),
            source,
        })?;
        drop(mapping);

        staging
            .as_file()
            .set_permissions(Permissions::from_mode(0o644))
            .map_err(staging_err)?;
        staging
            .persist(&blob_path)
            .map_err(|e| RefreshError::Persist {
                key: key.to_string(),
                source: e.error,
            })?;
        debug!("installed refreshed blob {}", blob_path.display());
        Ok(())
    }

    /// Spawn the provider with stdout redirected into `sink` and wait for it, killing
    /// it once the refresh timeout passes.
    async fn run_provider(&self, key: &CacheKey, sink: File) -> Result<(), RefreshError> {
        let mut command = Command::new(&self.provider);
        command
            .args(&self.provider_args)
            .args(key.provider_args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(sink))
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("spawning provider {} for {key}", self.provider.display());
        let child = command.spawn().map_err(|source| RefreshError::Spawn {
            provider: self.provider.clone(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(res) => res.map_err(|source| RefreshError::Wait {
                key: key.to_string(),
                source,
            })?,
            Err(_) => {
                warn!("provider for {key} exceeded {:?}, killed", self.timeout);
                return Err(RefreshError::Timeout {
                    key: key.to_string(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.stderr.is_empty() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("provider stderr for {key}: {}", stderr.trim_end());
        }
        if !output.status.success() {
            return Err(RefreshError::ExitStatus {
                key: key.to_string(),
                status: output.status,
            });
        }
        Ok(())
    }
}

fn validate_output(mapping: &BlobMapping) -> Result<(), BlobError> {
    if mapping.is_empty() {
        return Err(BlobError::TruncatedHeader { len: 0 });
    }
    let view: BlobView<'_> = mapping.view()?;
    if view.last_refresh() <= 0.0 {
        debug!("provider emitted a blob without a refresh timestamp");
    }
    Ok(())
}

fn read_full_at(file: &File, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], filled as u64) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::blob::{BlobBuilder, unix_now};
    use crate::path::LogicalPath;
    use crate::test_utils::ScriptProvider;
    use std::fs;
    use std::path::Path;

    fn root_key() -> CacheKey {
        CacheKey::from(&LogicalPath::root())
    }

    fn one_file_blob(stamp: f64) -> Vec<u8> {
        let mut b = BlobBuilder::new();
        b.file("x", "1").unwrap();
        b.encode(stamp)
    }

    #[tokio::test]
    async fn test_empty_blob_triggers_one_refresh() {
        let provider = ScriptProvider::new();
        provider.publish(&[], &one_file_blob(unix_now()));
        let config = provider.config();
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        let key = root_key();

        let file = store.open_or_create(&key).unwrap();
        assert!(!refresher.is_fresh(&file).unwrap());
        let state = refresher.ensure_fresh(&store, &key, &file).await.unwrap();
        assert_eq!(state, Freshness::Refreshed);
        assert_eq!(provider.calls(), vec![String::new()]);

        let file = store.open_or_create(&key).unwrap();
        let state = refresher.ensure_fresh(&store, &key, &file).await.unwrap();
        assert_eq!(state, Freshness::Fresh);
        assert_eq!(provider.calls().len(), 1);

        let mapping = store.map(file).unwrap();
        assert!(mapping.view().unwrap().find("x").is_some());
    }

    #[tokio::test]
    async fn test_segments_passed_as_arguments() {
        let provider = ScriptProvider::new();
        provider.publish(&["2025", "Spring"], &one_file_blob(unix_now()));
        let config = provider.config();
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        let key = CacheKey::from(&LogicalPath::new("/2025/Spring"));

        refresher.refresh(&store, &key).await.unwrap();
        assert_eq!(provider.calls(), vec!["2025 Spring".to_string()]);
        assert!(store.blob_path(&key).is_file());
    }

    #[tokio::test]
    async fn test_expired_blob_is_refreshed_every_time() {
        let provider = ScriptProvider::new();
        provider.publish(&[], &one_file_blob(1.0));
        let config = provider.config();
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        let key = root_key();

        for _ in 0..2 {
            let file = store.open_or_create(&key).unwrap();
            let state = refresher.ensure_fresh(&store, &key, &file).await.unwrap();
            assert_eq!(state, Freshness::Refreshed);
        }
        assert_eq!(provider.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_spawn_failure_keeps_previous_blob() {
        let provider = ScriptProvider::new();
        let config = provider.config().provider(provider.dir().join("missing-provider"));
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        let key = root_key();

        let old = one_file_blob(1.0);
        store.open_or_create(&key).unwrap();
        fs::write(store.blob_path(&key), &old).unwrap();

        let file = store.open_or_create(&key).unwrap();
        let err = refresher.ensure_fresh(&store, &key, &file).await.unwrap_err();
        assert!(matches!(err, RefreshError::Spawn { .. }), "{err:?}");
        assert_eq!(fs::read(store.blob_path(&key)).unwrap(), old);
    }

    #[tokio::test]
    async fn test_failed_exit_keeps_previous_blob() {
        let provider = ScriptProvider::new();
        // nothing published for the root, so the script's `cat` fails
        let config = provider.config();
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        let key = root_key();

        let old = one_file_blob(1.0);
        store.open_or_create(&key).unwrap();
        fs::write(store.blob_path(&key), &old).unwrap();

        let err = refresher.refresh(&store, &key).await.unwrap_err();
        assert!(matches!(err, RefreshError::ExitStatus { .. }), "{err:?}");
        assert_eq!(fs::read(store.blob_path(&key)).unwrap(), old);
    }

    #[tokio::test]
    async fn test_malformed_output_rejected() {
        let provider = ScriptProvider::new();
        let mut bogus = one_file_blob(unix_now());
        bogus[0..8].copy_from_slice(&9u64.to_le_bytes());
        provider.publish(&[], &bogus);
        let config = provider.config();
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        let key = root_key();
        store.open_or_create(&key).unwrap();

        let err = refresher.refresh(&store, &key).await.unwrap_err();
        assert!(
            matches!(
                err,
                RefreshError::InvalidOutput {
                    source: BlobError::EntryTableOverflow { .. },
                    ..
                }
            ),
            "{err:?}"
        );
        assert_eq!(fs::metadata(store.blob_path(&key)).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_empty_output_rejected() {
        let provider = ScriptProvider::new();
        provider.publish(&[], &[]);
        let config = provider.config();
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        let key = root_key();
        store.open_or_create(&key).unwrap();

        let err = refresher.refresh(&store, &key).await.unwrap_err();
        assert!(matches!(err, RefreshError::InvalidOutput { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_hung_provider_times_out() {
        let provider = ScriptProvider::with_body("exec sleep 30\n");
        let config = provider
            .config()
            .refresh_timeout(Duration::from_millis(200));
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);
        let key = root_key();
        store.open_or_create(&key).unwrap();

        let started = std::time::Instant::now();
        let err = refresher.refresh(&store, &key).await.unwrap_err();
        assert!(matches!(err, RefreshError::Timeout { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_corrupt_header_is_stale() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob");
        let mut blob = one_file_blob(unix_now());
        blob[0..8].copy_from_slice(&5u64.to_le_bytes());
        fs::write(&path, &blob).unwrap();

        let config = Config::with_home(tmp.path());
        let refresher = Refresher::new(&config);
        let file = File::open(&path).unwrap();
        assert!(!refresher.is_fresh(&file).unwrap());

        fs::write(&path, one_file_blob(unix_now())).unwrap();
        let file = File::open(&path).unwrap();
        assert!(refresher.is_fresh(&file).unwrap());
    }

    #[tokio::test]
    async fn test_refreshed_blob_is_world_readable() {
        let provider = ScriptProvider::new();
        provider.publish(&[], &one_file_blob(unix_now()));
        let config = provider.config();
        let store = CacheStore::new(&config);
        let refresher = Refresher::new(&config);

        refresher.refresh(&store, &root_key()).await.unwrap();
        let mode = fs::metadata(store.blob_path(&root_key()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_idle_locks_are_dropped() {
        let config = Config::with_home(Path::new("/unused"));
        let refresher = Refresher::new(&config);
        let held = refresher.lock_for(&CacheKey::from(&LogicalPath::new("/held")));
        for dir in ["/a", "/b", "/c"] {
            drop(refresher.lock_for(&CacheKey::from(&LogicalPath::new(dir))));
        }
        let tracked = refresher.locks.inner.lock().unwrap().len();
        // "/held" plus the most recent "/c"
        assert_eq!(tracked, 2);

        let again = refresher.lock_for(&CacheKey::from(&LogicalPath::new("/held")));
        assert!(Arc::ptr_eq(&held, &again));
    }
}
