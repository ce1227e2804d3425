use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the blob file inside each cached directory.
pub static METADATA_FILE: &str = "__metadata.dat";
/// Cache root relative to the user's home directory.
static CACHE_DIR: &str = ".local/share/catalogfs";
/// Provider looked up through `PATH` when none is configured.
pub static DEFAULT_PROVIDER: &str = "catalogfs-provider";

pub const DEFAULT_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings shared by the cache store, the refresher and the dispatcher. Resolved once
/// at startup and handed to every component.
#[derive(Clone, Debug)]
pub struct Config {
    pub cache_root: PathBuf,
    pub provider: PathBuf,
    /// Fixed arguments placed before the path segments, e.g. a script for an
    /// interpreter given as `provider`.
    pub provider_args: Vec<OsString>,
    pub ttl: Duration,
    pub refresh_timeout: Duration,
    pub metadata_file: String,
}

impl Config {
    /// Defaults anchored at the current user's home directory.
    pub fn new() -> io::Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "Failed to get user home directory",
            )
        })?;
        Ok(Self::with_home(&home))
    }

    pub fn with_home(home: &Path) -> Self {
        Self {
            cache_root: home.join(CACHE_DIR),
            provider: PathBuf::from(DEFAULT_PROVIDER),
            provider_args: Vec::new(),
            ttl: DEFAULT_TTL,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            metadata_file: METADATA_FILE.to_string(),
        }
    }

    pub fn cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    pub fn provider(mut self, provider: impl Into<PathBuf>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn provider_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.provider_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }
}
