//! In-process index backend.
//!
//! Keeps every index in a map behind an `RwLock`. Used for tests and for
//! running without a search cluster; contents do not survive the process.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::IndexError;
use crate::index::backend::IndexBackend;

/// A document as held by [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub content_type: String,
    pub body: Value,
}

#[derive(Debug, Default)]
struct MemoryIndex {
    mappings: BTreeMap<String, Value>,
    documents: BTreeMap<String, StoredDocument>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    indices: RwLock<HashMap<String, MemoryIndex>>,
}

fn index_not_found(index: &str) -> IndexError {
    IndexError::Backend {
        status: 404,
        body: format!("index_not_found_exception: no such index [{}]", index),
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, MemoryIndex>> {
        self.indices.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, MemoryIndex>> {
        self.indices.write().unwrap_or_else(|p| p.into_inner())
    }

    /// Names of all indices, sorted.
    pub fn index_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Ids of every document in `index`; empty if the index is absent.
    pub fn document_ids(&self, index: &str) -> BTreeSet<String> {
        self.read()
            .get(index)
            .map(|i| i.documents.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document(&self, index: &str, id: &str) -> Option<StoredDocument> {
        self.read()
            .get(index)
            .and_then(|i| i.documents.get(id).cloned())
    }

    pub fn mapping(&self, index: &str, content_type: &str) -> Option<Value> {
        self.read()
            .get(index)
            .and_then(|i| i.mappings.get(content_type).cloned())
    }
}

#[async_trait]
impl IndexBackend for MemoryBackend {
    async fn exists(&self, index: &str) -> Result<bool, IndexError> {
        Ok(self.read().contains_key(index))
    }

    async fn is_ready(&self, index: &str) -> Result<bool, IndexError> {
        Ok(self.read().contains_key(index))
    }

    async fn create_index(&self, index: &str) -> Result<(), IndexError> {
        let mut indices = self.write();
        if indices.contains_key(index) {
            return Err(IndexError::AlreadyExists(index.to_string()));
        }
        indices.insert(index.to_string(), MemoryIndex::default());
        Ok(())
    }

    async fn put_mapping(
        &self,
        index: &str,
        content_type: &str,
        mapping: &Value,
    ) -> Result<(), IndexError> {
        let mut indices = self.write();
        let entry = indices.get_mut(index).ok_or_else(|| index_not_found(index))?;
        entry
            .mappings
            .insert(content_type.to_string(), mapping.clone());
        Ok(())
    }

    async fn mapped_types(&self, index: &str) -> Result<Vec<String>, IndexError> {
        Ok(self
            .read()
            .get(index)
            .map(|i| i.mappings.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        index: &str,
        content_type: &str,
        id: &str,
        document: &Value,
    ) -> Result<(), IndexError> {
        let mut indices = self.write();
        let entry = indices.get_mut(index).ok_or_else(|| index_not_found(index))?;
        entry.documents.insert(
            id.to_string(),
            StoredDocument {
                content_type: content_type.to_string(),
                body: document.clone(),
            },
        );
        Ok(())
    }

    async fn remove(&self, index: &str, id: &str) -> Result<bool, IndexError> {
        Ok(self
            .write()
            .get_mut(index)
            .map(|i| i.documents.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn delete_index(&self, index: &str) -> Result<bool, IndexError> {
        Ok(self.write().remove(index).is_some())
    }

    async fn refresh(&self, index: &str) -> Result<(), IndexError> {
        if self.read().contains_key(index) {
            Ok(())
        } else {
            Err(index_not_found(index))
        }
    }

    async fn count(&self, index: &str, content_type: Option<&str>) -> Result<u64, IndexError> {
        let indices = self.read();
        let entry = indices.get(index).ok_or_else(|| index_not_found(index))?;
        let count = entry
            .documents
            .values()
            .filter(|d| content_type.map_or(true, |t| d.content_type == t))
            .count();
        Ok(count as u64)
    }
}
