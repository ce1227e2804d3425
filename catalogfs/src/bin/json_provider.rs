// Reference catalog provider: serves directory blobs out of a JSON document.
//
// Invoked by catalogfs with the path segments of one directory as arguments; writes
// that directory's blob to stdout. Logs go to stderr, which catalogfs forwards.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use catalogfs::cache::blob::unix_now;
use catalogfs::provider::directory_blob;

#[derive(Parser, Debug)]
#[command(version, about = "Serve catalogfs directory blobs from a JSON catalog")]
struct Args {
    /// JSON catalog file
    #[arg(long, env = "CATALOGFS_CATALOG")]
    catalog: PathBuf,

    /// Path segments of the directory to list; none means the root
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    segments: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();
    let raw = fs::read(&args.catalog)
        .with_context(|| format!("Failed to read catalog {}", args.catalog.display()))?;
    let catalog: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("Failed to parse catalog {}", args.catalog.display()))?;

    let blob = directory_blob(&catalog, args.segments.as_slice())
        .with_context(|| format!("Failed to build blob for /{}", args.segments.join("/")))?;
    debug!("emitting {} entries for /{}", blob.len(), args.segments.join("/"));

    let mut out = io::stdout().lock();
    blob.write_to(&mut out, unix_now())
        .context("Failed to write blob to stdout")?;
    out.flush()?;
    Ok(())
}
