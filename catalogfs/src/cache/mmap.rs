use std::fs::File;
use std::io;

use crate::cache::blob::BlobView;
use crate::error::BlobError;

/// Shared mapping of one blob file for the duration of a single request.
///
/// Owns the descriptor as well, so dropping the mapping unmaps and closes on every
/// exit path.
pub struct BlobMapping {
    mmap: Option<memmap2::MmapMut>,
    _file: File,
}

impl BlobMapping {
    /// Map the whole current length of `file` read/write and shared. A zero-length
    /// file gets an empty view without calling mmap.
    pub fn map(file: File) -> io::Result<Self> {
        let file_size = file.metadata()?.len();
        if file_size == 0 {
            return Ok(Self {
                mmap: None,
                _file: file,
            });
        }
        let map_size = usize::try_from(file_size).map_err(|_| {
            io::Error::other(format!("blob of {file_size} bytes does not fit in memory"))
        })?;

        // Blobs are only ever replaced by rename, never rewritten in place, so the
        // mapped inode does not shrink underneath us from within this process.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .len(map_size)
                .map_mut(&file)
        }
        .map_err(|e| {
            io::Error::other(format!(
                "Failed to create mmap for blob size {file_size}: {e}",
            ))
        })?;

        Ok(Self {
            mmap: Some(mmap),
            _file: file,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.mmap {
            Some(m) => &m[..],
            None => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_none()
    }

    pub fn view(&self) -> Result<BlobView<'_>, BlobError> {
        BlobView::parse(self.bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::blob::BlobBuilder;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn open_rw(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_map_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mapping = BlobMapping::map(open_rw(&tmp.path().join("blob"))).unwrap();
        assert!(mapping.is_empty());
        assert_eq!(mapping.len(), 0);
        let view = mapping.view().unwrap();
        assert_eq!(view.entry_count(), 0);
    }

    #[test]
    fn test_map_sees_written_blob() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob");
        let mut b = BlobBuilder::new();
        b.file("a", "xyz").unwrap();
        let encoded = b.encode(42.0);
        open_rw(&path).write_all(&encoded).unwrap();

        let mapping = BlobMapping::map(open_rw(&path)).unwrap();
        assert_eq!(mapping.bytes(), &encoded[..]);
        let view = mapping.view().unwrap();
        assert_eq!(view.last_refresh(), 42.0);
        assert_eq!(view.find("a").unwrap().content(), b"xyz");
    }
}
