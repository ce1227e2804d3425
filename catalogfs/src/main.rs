use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use catalogfs::config::{Config, DEFAULT_PROVIDER};
use catalogfs::dispatch::CatalogFs;
use catalogfs::fuse::CatalogFuse;
use catalogfs::fuse::mount::{mount_privileged, mount_unprivileged};

#[derive(Parser, Debug)]
#[command(author, version, about = "Mount a provider-backed catalog as a read-only filesystem")]
struct Args {
    /// Directory to mount the catalog on; created if missing
    mountpoint: PathBuf,

    /// Cache root; defaults to ~/.local/share/catalogfs
    #[arg(long, env = "CATALOGFS_CACHE_ROOT")]
    cache_root: Option<PathBuf>,

    /// Provider executable, invoked with the path segments of one directory
    #[arg(long, env = "CATALOGFS_PROVIDER", default_value = DEFAULT_PROVIDER)]
    provider: PathBuf,

    /// Seconds a cached listing stays fresh
    #[arg(long, env = "CATALOGFS_TTL", default_value_t = 120)]
    ttl: u64,

    /// Seconds a provider may run before it is killed
    #[arg(long, env = "CATALOGFS_REFRESH_TIMEOUT", default_value_t = 30)]
    refresh_timeout: u64,

    /// Mount through /dev/fuse directly instead of fusermount3
    #[arg(long, env = "CATALOGFS_PRIVILEGED")]
    privileged: bool,
}

impl Args {
    fn config(&self) -> Result<Config> {
        let mut config = Config::new()?
            .provider(&self.provider)
            .ttl(Duration::from_secs(self.ttl))
            .refresh_timeout(Duration::from_secs(self.refresh_timeout));
        if let Some(root) = &self.cache_root {
            config = config.cache_root(root);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = args.config().context("Failed to resolve configuration")?;
    info!(
        "cache root {}, provider {}, ttl {:?}",
        config.cache_root.display(),
        config.provider.display(),
        config.ttl
    );

    std::fs::create_dir_all(&args.mountpoint).with_context(|| {
        format!("Failed to create mountpoint {}", args.mountpoint.display())
    })?;

    let fs = CatalogFuse::new(CatalogFs::new(config));
    let mut mount_handle = if args.privileged {
        mount_privileged(fs, &args.mountpoint).await
    } else {
        mount_unprivileged(fs, &args.mountpoint).await
    }
    .with_context(|| format!("Failed to mount at {}", args.mountpoint.display()))?;
    info!("mounted at {}, press Ctrl+C to unmount", args.mountpoint.display());

    let handle = &mut mount_handle;
    tokio::select! {
        res = handle => res.context("FUSE session ended with an error")?,
        _ = signal::ctrl_c() => {
            info!("unmounting {}", args.mountpoint.display());
            mount_handle.unmount().await.context("Failed to unmount")?;
        }
    }
    Ok(())
}
