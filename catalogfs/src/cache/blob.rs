//! Binary layout of a directory cache blob.
//!
//! ```text
//! 0                 entry_count   u64
//! 8                 last_refresh  f64 (seconds since epoch, 0 = never)
//! 16                entry_count * RECORD_SIZE fixed records
//! 16 + n*RECORD     variable region, payloads referenced by absolute offset
//! ```
//!
//! Record: `name[NAME_CAPACITY]` (NUL terminated), `content_size u64`,
//! `content_offset u64`, `is_directory u32`, `is_file u32`. All integers are
//! little-endian. Nothing in a blob is trusted until [`BlobView::parse`] and the
//! per-entry range checks have accepted it.

use std::collections::HashSet;
use std::io::{self, Write};
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::METADATA_FILE;
use crate::error::BlobError;

pub const HEADER_SIZE: usize = 16;
pub const NAME_CAPACITY: usize = 4096;
pub const RECORD_SIZE: usize = NAME_CAPACITY + 8 + 8 + 4 + 4;

const SIZE_AT: usize = NAME_CAPACITY;
const OFFSET_AT: usize = NAME_CAPACITY + 8;
const IS_DIR_AT: usize = NAME_CAPACITY + 16;
const IS_FILE_AT: usize = NAME_CAPACITY + 20;

/// Seconds since the epoch, as stored in `last_refresh`.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    Unknown,
}

/// One fixed record exactly as stored, before any validation of its fields.
#[derive(Clone, Copy, Debug)]
pub struct FixedEntry<'a> {
    raw_name: &'a [u8],
    pub content_size: u64,
    pub content_offset: u64,
    pub kind: EntryKind,
}

impl<'a> FixedEntry<'a> {
    fn decode(record: &'a [u8]) -> Self {
        let name_buf = &record[..NAME_CAPACITY];
        let is_dir = read_u32(record, IS_DIR_AT) != 0;
        let is_file = read_u32(record, IS_FILE_AT) != 0;
        let kind = match (is_dir, is_file) {
            (true, false) => EntryKind::Directory,
            (false, true) => EntryKind::File,
            _ => EntryKind::Unknown,
        };
        Self {
            raw_name: name_buf,
            content_size: read_u64(record, SIZE_AT),
            content_offset: read_u64(record, OFFSET_AT),
            kind,
        }
    }

    /// The entry name, if the buffer holds a NUL-terminated, valid path segment.
    pub fn name(&self) -> Option<&'a str> {
        let end = self.raw_name.iter().position(|&b| b == 0)?;
        let name = std::str::from_utf8(&self.raw_name[..end]).ok()?;
        is_valid_name(name).then_some(name)
    }
}

/// A record that passed every check: valid name, known kind, payload in bounds.
#[derive(Clone, Copy, Debug)]
pub struct Entry<'a> {
    pub name: &'a str,
    pub kind: EntryKind,
    content: &'a [u8],
}

impl<'a> Entry<'a> {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn content(&self) -> &'a [u8] {
        self.content
    }

    /// Up to `size` bytes starting at `offset`; empty at or past the end.
    pub fn read(&self, offset: u64, size: usize) -> &'a [u8] {
        let Ok(start) = usize::try_from(offset) else {
            return &[];
        };
        if start >= self.content.len() {
            return &[];
        }
        let end = start.saturating_add(size).min(self.content.len());
        &self.content[start..end]
    }
}

/// Bounds-checked view over the bytes of one blob.
#[derive(Clone, Copy, Debug)]
pub struct BlobView<'a> {
    bytes: &'a [u8],
    entry_count: usize,
    last_refresh: f64,
}

impl<'a> BlobView<'a> {
    /// Validate the header and the fixed table. A zero-length blob is a valid,
    /// never-refreshed, empty directory.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, BlobError> {
        if bytes.is_empty() {
            return Ok(Self {
                bytes,
                entry_count: 0,
                last_refresh: 0.0,
            });
        }
        if bytes.len() < HEADER_SIZE {
            return Err(BlobError::TruncatedHeader { len: bytes.len() });
        }
        let count = read_u64(bytes, 0);
        let last_refresh = f64::from_le_bytes(array_at(bytes, 8));
        let available = bytes.len() - HEADER_SIZE;
        let entry_count = usize::try_from(count)
            .ok()
            .filter(|&n| {
                n.checked_mul(RECORD_SIZE)
                    .is_some_and(|table| table <= available)
            })
            .ok_or(BlobError::EntryTableOverflow { count, available })?;
        Ok(Self {
            bytes,
            entry_count,
            last_refresh,
        })
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn last_refresh(&self) -> f64 {
        self.last_refresh
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes after the fixed table.
    pub fn variable_region(&self) -> &'a [u8] {
        let start = (HEADER_SIZE + self.entry_count * RECORD_SIZE).min(self.bytes.len());
        &self.bytes[start..]
    }

    /// Raw record `index`, `None` past `entry_count`.
    pub fn record(&self, index: usize) -> Option<FixedEntry<'a>> {
        if index >= self.entry_count {
            return None;
        }
        let start = HEADER_SIZE + index * RECORD_SIZE;
        let bytes: &'a [u8] = self.bytes;
        bytes.get(start..start + RECORD_SIZE).map(FixedEntry::decode)
    }

    pub fn records(&self) -> impl Iterator<Item = FixedEntry<'a>> + '_ {
        (0..self.entry_count).filter_map(move |i| self.record(i))
    }

    /// Validate one record. Unknown kinds, bad names and payloads that would read
    /// past the blob are rejected.
    pub fn validate(&self, record: &FixedEntry<'a>) -> Option<Entry<'a>> {
        let name = record.name()?;
        let content: &'a [u8] = match record.kind {
            EntryKind::Unknown => return None,
            EntryKind::Directory => &[],
            EntryKind::File => {
                let bytes: &'a [u8] = self.bytes;
                &bytes[self.payload_range(record)?]
            }
        };
        Some(Entry {
            name,
            kind: record.kind,
            content,
        })
    }

    fn payload_range(&self, record: &FixedEntry<'_>) -> Option<Range<usize>> {
        let start = usize::try_from(record.content_offset).ok()?;
        let len = usize::try_from(record.content_size).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }

    /// Valid entries in stored order; a repeated name keeps its first occurrence.
    pub fn entries(&self) -> impl Iterator<Item = Entry<'a>> + '_ {
        let mut seen = HashSet::new();
        self.records()
            .filter_map(move |r| self.validate(&r))
            .filter(move |e| seen.insert(e.name))
    }

    /// First valid entry called `name`.
    pub fn find(&self, name: &str) -> Option<Entry<'a>> {
        self.records()
            .filter(|r| r.name() == Some(name))
            .find_map(|r| self.validate(&r))
    }

    /// Whether this snapshot may be served at time `now` under `ttl_secs`.
    pub fn is_fresh(&self, now: f64, ttl_secs: f64) -> bool {
        is_fresh(self.last_refresh, now, ttl_secs)
    }
}

pub(crate) fn is_fresh(last_refresh: f64, now: f64, ttl_secs: f64) -> bool {
    last_refresh > 0.0 && last_refresh.is_finite() && now - last_refresh <= ttl_secs
}

pub(crate) fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name != METADATA_FILE
        && !name.contains('/')
        && !name.contains('\0')
        && name.len() < NAME_CAPACITY
}

enum Pending {
    Directory,
    File(Vec<u8>),
}

/// Encoder for blobs, used by providers and tests.
#[derive(Default)]
pub struct BlobBuilder {
    entries: Vec<(String, Pending)>,
    names: HashSet<String>,
}

impl BlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &str, pending: Pending) -> Result<&mut Self, BlobError> {
        if !is_valid_name(name) {
            return Err(BlobError::InvalidName(name.to_string()));
        }
        if !self.names.insert(name.to_string()) {
            return Err(BlobError::DuplicateName(name.to_string()));
        }
        self.entries.push((name.to_string(), pending));
        Ok(self)
    }

    pub fn directory(&mut self, name: &str) -> Result<&mut Self, BlobError> {
        self.push(name, Pending::Directory)
    }

    pub fn file(
        &mut self,
        name: &str,
        contents: impl Into<Vec<u8>>,
    ) -> Result<&mut Self, BlobError> {
        self.push(name, Pending::File(contents.into()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn encode(&self, last_refresh: f64) -> Vec<u8> {
        let table_end = HEADER_SIZE + self.entries.len() * RECORD_SIZE;
        let payload_len: usize = self
            .entries
            .iter()
            .map(|(_, p)| match p {
                Pending::File(data) => data.len(),
                Pending::Directory => 0,
            })
            .sum();
        let mut out = vec![0u8; table_end];
        out.reserve(payload_len);
        out[0..8].copy_from_slice(&(self.entries.len() as u64).to_le_bytes());
        out[8..16].copy_from_slice(&last_refresh.to_le_bytes());

        for (i, (name, pending)) in self.entries.iter().enumerate() {
            let rec = HEADER_SIZE + i * RECORD_SIZE;
            out[rec..rec + name.len()].copy_from_slice(name.as_bytes());
            let (size, offset, is_dir, is_file) = match pending {
                Pending::Directory => (0u64, 0u64, 1u32, 0u32),
                Pending::File(data) => {
                    let offset = out.len() as u64;
                    out.extend_from_slice(data);
                    (data.len() as u64, offset, 0, 1)
                }
            };
            out[rec + SIZE_AT..rec + SIZE_AT + 8].copy_from_slice(&size.to_le_bytes());
            out[rec + OFFSET_AT..rec + OFFSET_AT + 8].copy_from_slice(&offset.to_le_bytes());
            out[rec + IS_DIR_AT..rec + IS_DIR_AT + 4].copy_from_slice(&is_dir.to_le_bytes());
            out[rec + IS_FILE_AT..rec + IS_FILE_AT + 4].copy_from_slice(&is_file.to_le_bytes());
        }
        out
    }

    pub fn write_to(&self, mut w: impl Write, last_refresh: f64) -> io::Result<()> {
        w.write_all(&self.encode(last_refresh))?;
        w.flush()
    }
}

fn array_at<const N: usize>(bytes: &[u8], at: usize) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[at..at + N]);
    buf
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(array_at(bytes, at))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(array_at(bytes, at))
}
