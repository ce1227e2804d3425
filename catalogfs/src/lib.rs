// Library crate for catalogfs: a read-only FUSE view of a catalog whose listings are
// produced on demand by an external provider and cached as per-directory blobs.
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fuse;
pub mod path;
pub mod provider;
pub mod refresh;

pub use config::Config;
pub use dispatch::{Attributes, CatalogFs, DirEntry, FileKind};
pub use error::{BlobError, FsError, RefreshError};
pub use path::{CacheKey, LogicalPath};
