//! FUSE adapter and request handling
//!
//! Translates inode-addressed kernel requests into path-based `CatalogFs` calls and
//! maps the answers back into rfuse3 replies.
//!
//! Main components:
//! - `inode`: stable path <-> inode numbering for the life of a mount.
//! - `mount`: mounting the adapter through rfuse3 sessions.
//! - Implementation of the `Filesystem` trait for `CatalogFuse`. Only the read side
//!   is implemented; every mutating request falls through to the trait defaults and
//!   the mount itself is read-only.
pub mod inode;
pub mod mount;

use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{self, Stream};
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyData, ReplyDirectory, ReplyDirectoryPlus,
    ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
};
use rfuse3::{Errno, FileType as FuseFileType, Result as FuseResult, Timestamp};
use tracing::{debug, error};

use crate::dispatch::{Attributes, CatalogFs, FileKind};
use crate::error::FsError;
use crate::path::LogicalPath;
use inode::{InodeTable, ROOT_INODE};

const TTL: Duration = Duration::from_secs(1);
const MAX_WRITE: NonZeroU32 = NonZeroU32::new(128 * 1024).unwrap();

pub struct CatalogFuse {
    fs: CatalogFs,
    inodes: InodeTable,
}

/// A listed child with the inode it was assigned.
#[derive(Clone, Debug)]
pub struct InodeEntry {
    pub ino: u64,
    pub name: String,
    pub attr: Attributes,
}

impl CatalogFuse {
    pub fn new(fs: CatalogFs) -> Self {
        Self {
            fs,
            inodes: InodeTable::new(),
        }
    }

    pub fn catalog(&self) -> &CatalogFs {
        &self.fs
    }

    fn path_of(&self, ino: u64) -> Result<LogicalPath, Errno> {
        self.inodes.path_of(ino).ok_or_else(|| libc::ENOENT.into())
    }

    /// Resolve `name` inside directory `parent`, assigning the child an inode.
    pub async fn lookup_child(
        &self,
        parent: u64,
        name: &OsStr,
    ) -> Result<(u64, Attributes), Errno> {
        let dir = self.path_of(parent)?;
        let Some(name) = name.to_str() else {
            return Err(libc::ENOENT.into());
        };
        let path = dir.join(name);
        let attr = self.fs.getattr(&path).await.map_err(|e| reply_err("lookup", &path, e))?;
        Ok((self.inodes.inode_of(&path), attr))
    }

    pub async fn attr_of(&self, ino: u64) -> Result<Attributes, Errno> {
        let path = self.path_of(ino)?;
        self.fs
            .getattr(&path)
            .await
            .map_err(|e| reply_err("getattr", &path, e))
    }

    /// Directory listing of `ino`, `.` and `..` included, each with its inode.
    pub async fn list(&self, ino: u64) -> Result<Vec<InodeEntry>, Errno> {
        let path = self.path_of(ino)?;
        let listing = self
            .fs
            .readdir(&path)
            .await
            .map_err(|e| reply_err("readdir", &path, e))?;
        let parent = self.inodes.parent_of(ino).unwrap_or(ROOT_INODE);
        Ok(listing
            .into_iter()
            .map(|entry| {
                let ino = match entry.name.as_str() {
                    "." => ino,
                    ".." => parent,
                    name => self.inodes.inode_of(&path.join(name)),
                };
                InodeEntry {
                    ino,
                    name: entry.name,
                    attr: entry.attr,
                }
            })
            .collect())
    }
}

impl Filesystem for CatalogFuse {
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        self.fs.init().map_err(|e| {
            error!(
                "failed to prepare cache root {}: {e}",
                self.fs.store().root().display()
            );
            Errno::from(libc::EIO)
        })?;
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {
        debug!("catalogfs unmounted, {} inodes handed out", self.inodes.len());
    }

    async fn lookup(&self, req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let (ino, attr) = self.lookup_child(parent, name).await?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr, &req),
            generation: 0,
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        self.fs
            .open(&path, flags)
            .await
            .map_err(|e| reply_err("open", &path, e))?;
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        if !self.attr_of(ino).await?.is_dir() {
            return Err(FsError::NotADirectory.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let path = self.path_of(ino)?;
        let data = self
            .fs
            .read(&path, offset, size)
            .await
            .map_err(|e| reply_err("read", &path, e))?;
        Ok(ReplyData {
            data: Bytes::from(data),
        })
    }

    async fn getattr(
        &self,
        req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let attr = self.attr_of(ino).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: to_fuse_attr(ino, &attr, &req),
        })
    }

    // offset is the offset of the last entry already returned
    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let start = usize::try_from(offset).unwrap_or(0);
        let entries: Vec<DirectoryEntry> = self
            .list(ino)
            .await?
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(i, e)| DirectoryEntry {
                inode: e.ino,
                kind: to_fuse_kind(e.attr.kind),
                name: OsString::from(e.name),
                offset: i as i64 + 1,
            })
            .collect();
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn readdirplus<'a>(
        &'a self,
        req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        let entries: Vec<DirectoryEntryPlus> = self
            .list(ino)
            .await?
            .into_iter()
            .enumerate()
            .skip(start)
            .map(|(i, e)| DirectoryEntryPlus {
                inode: e.ino,
                generation: 0,
                kind: to_fuse_kind(e.attr.kind),
                name: OsString::from(e.name),
                offset: i as i64 + 1,
                attr: to_fuse_attr(e.ino, &e.attr, &req),
                entry_ttl: TTL,
                attr_ttl: TTL,
            })
            .collect();
        let boxed: Self::DirEntryPlusStream<'a> =
            Box::pin(stream::iter(entries.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }

    // Nothing here is backed by real capacity.
    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.inodes.len() as u64,
            ffree: 0,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        Ok(())
    }

    async fn releasedir(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
    ) -> FuseResult<()> {
        Ok(())
    }

    // inodes live as long as the mount
    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }
}

fn reply_err(op: &str, path: &LogicalPath, err: FsError) -> Errno {
    match &err {
        FsError::Io(_) | FsError::Refresh(_) => error!("{op} {path}: {err}"),
        _ => debug!("{op} {path}: {err}"),
    }
    err.into()
}

fn to_fuse_kind(kind: FileKind) -> FuseFileType {
    match kind {
        FileKind::Directory => FuseFileType::Directory,
        FileKind::File => FuseFileType::RegularFile,
    }
}

fn to_fuse_attr(ino: u64, attr: &Attributes, req: &Request) -> rfuse3::raw::reply::FileAttr {
    let mtime = Timestamp::from(attr.mtime);
    rfuse3::raw::reply::FileAttr {
        ino,
        size: attr.size,
        blocks: attr.size.div_ceil(512),
        atime: mtime,
        mtime,
        ctime: mtime,
        #[cfg(target_os = "macos")]
        crtime: mtime,
        kind: to_fuse_kind(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: req.uid,
        gid: req.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}
