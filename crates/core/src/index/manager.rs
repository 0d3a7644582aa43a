//! Lifecycle and document operations for a single branch index.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::errors::IndexError;
use crate::index::backend::{IndexBackend, DOC_TYPE_FIELD};
use crate::index::{IndexState, ReadinessPolicy};
use crate::models::{ContentObject, ObjectKey};

/// Handle on one named index in a backend.
///
/// The manager tracks the index's lifecycle state and which content types
/// have mappings, and enforces that documents are only written to an index
/// that is being built or is ready, for types that are mapped.
pub struct IndexManager {
    backend: Arc<dyn IndexBackend>,
    name: String,
    state: IndexState,
    mapped: HashSet<String>,
}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("name", &self.name)
            .field("state", &self.state)
            .finish()
    }
}

/// The document sent to the backend for `object`.
pub fn document_body(object: &ContentObject) -> Value {
    let mut doc = object.to_json();
    if let Value::Object(ref mut map) = doc {
        map.insert(
            DOC_TYPE_FIELD.to_string(),
            Value::String(object.content_type.clone()),
        );
    }
    doc
}

impl IndexManager {
    /// A manager for an index not yet known to exist.
    pub fn new(backend: Arc<dyn IndexBackend>, name: impl Into<String>) -> Self {
        Self {
            backend,
            name: name.into(),
            state: IndexState::Absent,
            mapped: HashSet::new(),
        }
    }

    /// A manager for `name`, picking up its state and mapped types from the
    /// backend. An index that exists is treated as complete.
    pub async fn attach(
        backend: Arc<dyn IndexBackend>,
        name: impl Into<String>,
    ) -> Result<Self, IndexError> {
        let mut manager = Self::new(backend, name);
        if manager.backend.exists(&manager.name).await? {
            manager.state = IndexState::Ready;
            manager.mapped = manager
                .backend
                .mapped_types(&manager.name)
                .await?
                .into_iter()
                .collect();
        }
        debug!(index = %manager.name, state = %manager.state, "attached index");
        Ok(manager)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> IndexState {
        self.state
    }

    pub fn is_mapped(&self, content_type: &str) -> bool {
        self.mapped.contains(content_type)
    }

    pub async fn exists(&self) -> Result<bool, IndexError> {
        self.backend.exists(&self.name).await
    }

    pub async fn ready(&self) -> Result<bool, IndexError> {
        self.backend.is_ready(&self.name).await
    }

    fn ensure_writable(&self, operation: &str) -> Result<(), IndexError> {
        match self.state {
            IndexState::Building | IndexState::Ready => Ok(()),
            state => Err(IndexError::InvalidState {
                index: self.name.clone(),
                state: state.to_string(),
                operation: operation.to_string(),
            }),
        }
    }

    /// Create the index empty. Fails with `AlreadyExists` if it is present.
    #[instrument(skip(self), fields(index = %self.name))]
    pub async fn create(&mut self) -> Result<(), IndexError> {
        if self.backend.exists(&self.name).await? {
            return Err(IndexError::AlreadyExists(self.name.clone()));
        }
        self.backend.create_index(&self.name).await?;
        self.state = IndexState::Building;
        self.mapped.clear();
        info!("index created");
        Ok(())
    }

    pub async fn setup_mapping(
        &mut self,
        content_type: &str,
        mapping: &Value,
    ) -> Result<(), IndexError> {
        self.ensure_writable("map")?;
        self.backend
            .put_mapping(&self.name, content_type, mapping)
            .await?;
        self.mapped.insert(content_type.to_string());
        debug!(index = %self.name, content_type, "mapping registered");
        Ok(())
    }

    /// Upsert the document for `object`, keyed by its uuid.
    pub async fn index(&self, object: &ContentObject) -> Result<(), IndexError> {
        self.ensure_writable("index")?;
        if !self.mapped.contains(&object.content_type) {
            return Err(IndexError::UnmappedType {
                index: self.name.clone(),
                content_type: object.content_type.clone(),
            });
        }
        self.backend
            .upsert(
                &self.name,
                &object.content_type,
                &object.uuid,
                &document_body(object),
            )
            .await
    }

    pub async fn unindex(&self, object: &ContentObject) -> Result<bool, IndexError> {
        self.unindex_key(&object.key()).await
    }

    /// Remove the document for `key`. A missing document, or a missing
    /// index, is not an error.
    pub async fn unindex_key(&self, key: &ObjectKey) -> Result<bool, IndexError> {
        if matches!(self.state, IndexState::Absent | IndexState::Destroying) {
            return Ok(false);
        }
        let removed = self.backend.remove(&self.name, &key.uuid).await?;
        debug!(index = %self.name, content_type = %key.content_type, uuid = %key.uuid, removed, "unindexed");
        Ok(removed)
    }

    /// Remove the index and everything in it. Succeeds if already absent.
    #[instrument(skip(self), fields(index = %self.name))]
    pub async fn destroy(&mut self) -> Result<(), IndexError> {
        let previous = self.state;
        self.state = IndexState::Destroying;
        match self.backend.delete_index(&self.name).await {
            Ok(existed) => {
                self.state = IndexState::Absent;
                self.mapped.clear();
                info!(existed, "index destroyed");
                Ok(())
            }
            Err(e) => {
                self.state = previous;
                Err(e)
            }
        }
    }

    pub async fn refresh(&self) -> Result<(), IndexError> {
        self.backend.refresh(&self.name).await
    }

    pub async fn count(&self, content_type: Option<&str>) -> Result<u64, IndexError> {
        self.backend.count(&self.name, content_type).await
    }

    /// Poll readiness with exponential backoff until `policy.timeout`.
    pub async fn wait_until_ready(&self, policy: &ReadinessPolicy) -> Result<(), IndexError> {
        let started = tokio::time::Instant::now();
        let mut delay = policy.initial_backoff;
        loop {
            if self.backend.is_ready(&self.name).await? {
                debug!(index = %self.name, waited_ms = started.elapsed().as_millis() as u64, "index ready");
                return Ok(());
            }
            let elapsed = started.elapsed();
            if elapsed >= policy.timeout {
                warn!(index = %self.name, "index did not become ready");
                return Err(IndexError::ReadyTimeout {
                    index: self.name.clone(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay.min(policy.timeout - elapsed)).await;
            delay = (delay * 2).min(policy.max_backoff);
        }
    }

    /// Make the build visible and wait for readiness, then mark `Ready`.
    pub async fn finish(&mut self, policy: &ReadinessPolicy) -> Result<(), IndexError> {
        self.ensure_writable("finish")?;
        self.refresh().await?;
        self.wait_until_ready(policy).await?;
        self.state = IndexState::Ready;
        Ok(())
    }

    /// Build the index from scratch: create it, register `mappings`, index
    /// every object, and wait for readiness.
    ///
    /// Any failure along the way destroys the index before the error is
    /// returned, so afterwards the index is either complete or absent.
    pub async fn populate<I, E>(
        &mut self,
        mappings: Vec<(String, Value)>,
        objects: I,
        policy: &ReadinessPolicy,
    ) -> Result<u64, E>
    where
        I: IntoIterator<Item = Result<ContentObject, E>> + Send,
        I::IntoIter: Send,
        E: From<IndexError> + std::fmt::Display + Send,
    {
        let result = self.fill(mappings, objects, policy).await;
        match result {
            Ok(count) => {
                info!(index = %self.name, count, "index populated");
                Ok(count)
            }
            Err(e) => {
                warn!(index = %self.name, error = %e, "population failed, destroying index");
                if let Err(destroy_err) = self.destroy().await {
                    error!(index = %self.name, error = %destroy_err, "failed to destroy partial index");
                }
                Err(e)
            }
        }
    }

    async fn fill<I, E>(
        &mut self,
        mappings: Vec<(String, Value)>,
        objects: I,
        policy: &ReadinessPolicy,
    ) -> Result<u64, E>
    where
        I: IntoIterator<Item = Result<ContentObject, E>> + Send,
        I::IntoIter: Send,
        E: From<IndexError> + Send,
    {
        self.create().await?;
        for (content_type, mapping) in &mappings {
            self.setup_mapping(content_type, mapping).await?;
        }
        let mut indexed = 0u64;
        for item in objects {
            let object = item?;
            self.index(&object).await?;
            indexed += 1;
        }
        self.finish(policy).await?;
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::MemoryBackend;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Wraps the memory backend with injectable faults.
    #[derive(Default)]
    struct FaultyBackend {
        inner: MemoryBackend,
        fail_upsert_after: Option<usize>,
        never_ready: bool,
        upserts: AtomicUsize,
        ready_polls: AtomicUsize,
    }

    #[async_trait]
    impl IndexBackend for FaultyBackend {
        async fn exists(&self, index: &str) -> Result<bool, IndexError> {
            self.inner.exists(index).await
        }
        async fn is_ready(&self, index: &str) -> Result<bool, IndexError> {
            self.ready_polls.fetch_add(1, Ordering::SeqCst);
            if self.never_ready {
                return Ok(false);
            }
            self.inner.is_ready(index).await
        }
        async fn create_index(&self, index: &str) -> Result<(), IndexError> {
            self.inner.create_index(index).await
        }
        async fn put_mapping(&self, index: &str, t: &str, m: &Value) -> Result<(), IndexError> {
            self.inner.put_mapping(index, t, m).await
        }
        async fn mapped_types(&self, index: &str) -> Result<Vec<String>, IndexError> {
            self.inner.mapped_types(index).await
        }
        async fn upsert(&self, index: &str, t: &str, id: &str, d: &Value) -> Result<(), IndexError> {
            let n = self.upserts.fetch_add(1, Ordering::SeqCst);
            if self.fail_upsert_after.is_some_and(|limit| n >= limit) {
                return Err(IndexError::Backend {
                    status: 500,
                    body: "injected".into(),
                });
            }
            self.inner.upsert(index, t, id, d).await
        }
        async fn remove(&self, index: &str, id: &str) -> Result<bool, IndexError> {
            self.inner.remove(index, id).await
        }
        async fn delete_index(&self, index: &str) -> Result<bool, IndexError> {
            self.inner.delete_index(index).await
        }
        async fn refresh(&self, index: &str) -> Result<(), IndexError> {
            self.inner.refresh(index).await
        }
        async fn count(&self, index: &str, t: Option<&str>) -> Result<u64, IndexError> {
            self.inner.count(index, t).await
        }
    }

    fn person(uuid: &str, name: &str) -> ContentObject {
        let mut fields = serde_json::Map::new();
        fields.insert("name".into(), json!(name));
        ContentObject::with_uuid("people.Person", uuid, fields)
    }

    fn fast_policy() -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: Duration::from_secs(1),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        }
    }

    fn mappings() -> Vec<(String, Value)> {
        vec![("people.Person".into(), json!({ "properties": {} }))]
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let mut manager = IndexManager::new(Arc::new(MemoryBackend::new()), "idx");
        manager.create().await.unwrap();
        assert_eq!(manager.state(), IndexState::Building);
        assert!(matches!(
            manager.create().await,
            Err(IndexError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_index_requires_mapping_and_state() {
        let mut manager = IndexManager::new(Arc::new(MemoryBackend::new()), "idx");
        assert!(matches!(
            manager.index(&person("u1", "a")).await,
            Err(IndexError::InvalidState { .. })
        ));
        manager.create().await.unwrap();
        assert!(matches!(
            manager.index(&person("u1", "a")).await,
            Err(IndexError::UnmappedType { .. })
        ));
        manager
            .setup_mapping("people.Person", &json!({}))
            .await
            .unwrap();
        manager.index(&person("u1", "a")).await.unwrap();
        assert_eq!(manager.count(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_index_and_unindex_are_idempotent() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = IndexManager::new(backend.clone(), "idx");
        manager
            .populate::<_, IndexError>(mappings(), Vec::new(), &fast_policy())
            .await
            .unwrap();
        let obj = person("u1", "a");
        manager.index(&obj).await.unwrap();
        manager.index(&obj).await.unwrap();
        assert_eq!(manager.count(Some("people.Person")).await.unwrap(), 1);
        let doc = backend.document("idx", "u1").unwrap();
        assert_eq!(doc.body[DOC_TYPE_FIELD], "people.Person");
        assert_eq!(doc.body["uuid"], "u1");

        assert!(manager.unindex(&obj).await.unwrap());
        assert!(!manager.unindex(&obj).await.unwrap());
        assert_eq!(manager.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let mut manager = IndexManager::new(Arc::new(MemoryBackend::new()), "idx");
        manager.create().await.unwrap();
        manager.destroy().await.unwrap();
        assert_eq!(manager.state(), IndexState::Absent);
        assert!(!manager.exists().await.unwrap());
        manager.destroy().await.unwrap();
        assert!(!manager.unindex_key(&person("u1", "a").key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_populate_success() {
        let mut manager = IndexManager::new(Arc::new(MemoryBackend::new()), "idx");
        let objects = vec![Ok(person("u1", "a")), Ok(person("u2", "b"))];
        let count = manager
            .populate::<_, IndexError>(mappings(), objects, &fast_policy())
            .await
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(manager.state(), IndexState::Ready);
        assert!(manager.is_mapped("people.Person"));
    }

    #[tokio::test]
    async fn test_populate_failure_leaves_no_index() {
        let backend = Arc::new(FaultyBackend {
            fail_upsert_after: Some(1),
            ..Default::default()
        });
        let mut manager = IndexManager::new(backend.clone(), "idx");
        let objects = vec![Ok(person("u1", "a")), Ok(person("u2", "b"))];
        let err = manager
            .populate::<_, IndexError>(mappings(), objects, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Backend { status: 500, .. }));
        assert_eq!(manager.state(), IndexState::Absent);
        assert!(!backend.exists("idx").await.unwrap());
    }

    #[tokio::test]
    async fn test_populate_object_error_leaves_no_index() {
        let backend = Arc::new(MemoryBackend::new());
        let mut manager = IndexManager::new(backend.clone(), "idx");
        let objects = vec![
            Ok(person("u1", "a")),
            Err(IndexError::Backend {
                status: 0,
                body: "unreadable".into(),
            }),
        ];
        assert!(manager
            .populate(mappings(), objects, &fast_policy())
            .await
            .is_err());
        assert!(backend.index_names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_timeout_destroys_index() {
        let backend = Arc::new(FaultyBackend {
            never_ready: true,
            ..Default::default()
        });
        let mut manager = IndexManager::new(backend.clone(), "idx");
        let err = manager
            .populate::<_, IndexError>(mappings(), vec![Ok(person("u1", "a"))], &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::ReadyTimeout { .. }));
        assert!(!backend.exists("idx").await.unwrap());
        // 10 + 20 + 40 + 80 + 100 * 8 ms fits in the 1s window, plus the final poll.
        assert!(backend.ready_polls.load(Ordering::SeqCst) >= 5);
    }

    #[tokio::test]
    async fn test_attach_reads_existing_state() {
        let backend: Arc<dyn IndexBackend> = Arc::new(MemoryBackend::new());
        let mut first = IndexManager::new(backend.clone(), "idx");
        first
            .populate::<_, IndexError>(mappings(), Vec::new(), &fast_policy())
            .await
            .unwrap();

        let attached = IndexManager::attach(backend.clone(), "idx").await.unwrap();
        assert_eq!(attached.state(), IndexState::Ready);
        assert!(attached.is_mapped("people.Person"));

        let missing = IndexManager::attach(backend, "other").await.unwrap();
        assert_eq!(missing.state(), IndexState::Absent);
    }
}
