//! Mount helpers for starting/stopping FUSE
//!
//! Thin wrappers over rfuse3 raw Session APIs. Unprivileged mounting goes through
//! fusermount3 and is only available on Linux.

use std::path::Path;

use nix::unistd::{getgid, getuid};
use rfuse3::MountOptions;
use rfuse3::raw::{MountHandle, Session};
use tracing::info;

use crate::fuse::CatalogFuse;

/// Read-only mount owned by the calling user.
fn default_mount_options() -> MountOptions {
    let mut mo = MountOptions::default();
    mo.fs_name("catalogfs")
        .read_only(true)
        .uid(getuid().as_raw())
        .gid(getgid().as_raw());
    mo
}

/// Mount `fs` at `mount_point` via fusermount3.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: CatalogFuse,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    info!("mounting catalogfs (unprivileged) at {}", mount_point.as_ref().display());
    Session::new(default_mount_options())
        .mount_with_unprivileged(fs, mount_point.as_ref())
        .await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: CatalogFuse,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "unprivileged FUSE mount is only supported on Linux in this build",
    ))
}

/// Mount `fs` directly through /dev/fuse. Needs CAP_SYS_ADMIN.
pub async fn mount_privileged(
    fs: CatalogFuse,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    info!("mounting catalogfs (privileged) at {}", mount_point.as_ref().display());
    Session::new(default_mount_options())
        .mount(fs, mount_point.as_ref())
        .await
}
