//! On-disk layout conventions of a content store.
//!
//! ```text
//! <store>/
//!   _schemas/<namespace>.<name>.avsc     one definition per content type
//!   _mappings/<namespace>.<name>.json    optional custom index mapping
//!   <namespace>.<name>/<uuid>.json       one file per content object
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::errors::StoreError;
use crate::models::ObjectKey;

pub const SCHEMA_DIR: &str = "_schemas";
pub const SCHEMA_EXT: &str = "avsc";
pub const MAPPING_DIR: &str = "_mappings";
pub const OBJECT_EXT: &str = "json";

pub fn schema_path(content_type: &str) -> PathBuf {
    Path::new(SCHEMA_DIR).join(format!("{}.{}", content_type, SCHEMA_EXT))
}

pub fn mapping_path(content_type: &str) -> PathBuf {
    Path::new(MAPPING_DIR).join(format!("{}.{}", content_type, OBJECT_EXT))
}

pub fn object_path(content_type: &str, uuid: &str) -> String {
    format!("{}/{}.{}", content_type, uuid, OBJECT_EXT)
}

/// Parse a store-relative path of the form `<type>/<uuid>.json`.
///
/// Returns `None` for anything else: reserved directories, nested paths,
/// top-level files, other extensions.
pub fn object_key(path: &str) -> Option<ObjectKey> {
    let mut parts = path.split('/');
    let (dir, file) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || dir.is_empty() || dir.starts_with('_') || dir.starts_with('.') {
        return None;
    }
    let uuid = file.strip_suffix(&format!(".{}", OBJECT_EXT))?;
    if uuid.is_empty() {
        return None;
    }
    Some(ObjectKey {
        content_type: dir.to_string(),
        uuid: uuid.to_string(),
    })
}

/// Reject a `(content_type, uuid)` pair that would not be stored at a plain
/// `<type>/<uuid>.json` path parsing back to the same pair.
pub fn check_key(content_type: &str, uuid: &str) -> Result<(), StoreError> {
    let path = object_path(content_type, uuid);
    let clean = !path.contains(|c: char| c == '\\' || c.is_control());
    match object_key(&path) {
        Some(key) if clean && key.content_type == content_type && key.uuid == uuid => Ok(()),
        _ => Err(StoreError::InvalidObjectKey {
            content_type: content_type.to_string(),
            uuid: uuid.to_string(),
        }),
    }
}

/// Canonical identity of the store at `path`, used to key per-store locks.
pub fn store_key(path: &Path) -> Result<PathBuf, StoreError> {
    std::fs::canonicalize(path)
        .map_err(|_| StoreError::RepositoryNotFound(path.display().to_string()))
}

/// List the git working trees directly under `dir`, sorted by name.
pub fn discover(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut stores = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.join(".git").is_dir() {
            stores.push(path);
        }
    }
    stores.sort();
    debug!(dir = %dir.display(), count = stores.len(), "discovered stores");
    Ok(stores)
}
