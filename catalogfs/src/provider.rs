//! Reference provider backed by a static JSON catalog.
//!
//! Objects are directories, strings are files holding the string's bytes, and any
//! other value is a file holding its JSON text. Listing a path that is missing or
//! names a file yields an empty directory.

use serde_json::Value;

use crate::cache::blob::BlobBuilder;
use crate::error::BlobError;

/// Build the blob describing the directory at `segments` inside `catalog`.
pub fn directory_blob<S: AsRef<str>>(
    catalog: &Value,
    segments: &[S],
) -> Result<BlobBuilder, BlobError> {
    let mut node = catalog;
    for segment in segments {
        match node.get(segment.as_ref()) {
            Some(child) if child.is_object() => node = child,
            _ => return Ok(BlobBuilder::new()),
        }
    }

    let mut blob = BlobBuilder::new();
    let Some(children) = node.as_object() else {
        return Ok(blob);
    };
    for (name, value) in children {
        match value {
            Value::Object(_) => blob.directory(name)?,
            Value::String(text) => blob.file(name, text.as_bytes())?,
            other => blob.file(name, other.to_string())?,
        };
    }
    Ok(blob)
}
