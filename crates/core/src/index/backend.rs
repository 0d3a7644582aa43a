//! The seam between the index manager and a concrete search engine.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::IndexError;

/// Field added to every indexed document naming its content type.
pub const DOC_TYPE_FIELD: &str = "doc_type";

/// Operations the index manager needs from a search engine.
///
/// Documents are addressed by id alone (the object's uuid); the content type
/// travels inside the document so that a rename can never produce a second
/// document for the same object.
#[async_trait]
pub trait IndexBackend: Send + Sync {
    async fn exists(&self, index: &str) -> Result<bool, IndexError>;

    /// Whether the index exists and can serve reads.
    async fn is_ready(&self, index: &str) -> Result<bool, IndexError>;

    /// Create an empty index. Fails with `AlreadyExists` if present.
    async fn create_index(&self, index: &str) -> Result<(), IndexError>;

    async fn put_mapping(
        &self,
        index: &str,
        content_type: &str,
        mapping: &Value,
    ) -> Result<(), IndexError>;

    /// Content types that have a mapping registered in `index`.
    async fn mapped_types(&self, index: &str) -> Result<Vec<String>, IndexError>;

    /// Insert or replace the document with this id.
    async fn upsert(
        &self,
        index: &str,
        content_type: &str,
        id: &str,
        document: &Value,
    ) -> Result<(), IndexError>;

    /// Remove a document. Returns `false` if it was not there.
    async fn remove(&self, index: &str, id: &str) -> Result<bool, IndexError>;

    /// Drop the whole index. Returns `false` if it was not there.
    async fn delete_index(&self, index: &str) -> Result<bool, IndexError>;

    /// Make recent writes visible to readers.
    async fn refresh(&self, index: &str) -> Result<(), IndexError>;

    async fn count(&self, index: &str, content_type: Option<&str>) -> Result<u64, IndexError>;
}
