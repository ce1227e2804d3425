//! Inode numbering for the FUSE adapter.
//!
//! The kernel addresses everything by inode while the dispatcher works on paths, so
//! each path seen through `lookup` or `readdir` gets a number on first sight and
//! keeps it for the life of the mount. Numbers are never reused.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use crate::path::LogicalPath;

pub const ROOT_INODE: u64 = 1;

#[derive(Default)]
struct Maps {
    by_ino: HashMap<u64, LogicalPath>,
    by_path: HashMap<LogicalPath, u64>,
}

pub struct InodeTable {
    maps: Mutex<Maps>,
    next: AtomicU64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    pub fn new() -> Self {
        let mut maps = Maps::default();
        maps.by_ino.insert(ROOT_INODE, LogicalPath::root());
        maps.by_path.insert(LogicalPath::root(), ROOT_INODE);
        Self {
            maps: Mutex::new(maps),
            next: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    pub fn path_of(&self, ino: u64) -> Option<LogicalPath> {
        let maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.by_ino.get(&ino).cloned()
    }

    /// Inode for `path`, allocating one if the path is new.
    pub fn inode_of(&self, path: &LogicalPath) -> u64 {
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(&ino) = maps.by_path.get(path) {
            return ino;
        }
        let ino = self.next.fetch_add(1, Ordering::Relaxed);
        maps.by_ino.insert(ino, path.clone());
        maps.by_path.insert(path.clone(), ino);
        ino
    }

    /// Inode of the directory holding `ino`. The root is its own parent.
    pub fn parent_of(&self, ino: u64) -> Option<u64> {
        let path = self.path_of(ino)?;
        match path.parent() {
            Some(parent) => Some(self.inode_of(&parent)),
            None => Some(ROOT_INODE),
        }
    }

    pub fn len(&self) -> usize {
        let maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
