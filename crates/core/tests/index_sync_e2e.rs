//! End-to-end tests for keeping branch indexes in step with content stores.
//!
//! These tests drive the real `SyncOrchestrator` with:
//! - Real git stores created in temp directories
//! - The in-process `MemoryBackend`, optionally wrapped to inject failures
//! - The `EventBus` and `Poller` for the wired-up paths
//!
//! No network I/O: remotes are local paths.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use gitindex_core::errors::{ErrorKind, IndexError, SyncError};
use gitindex_core::events::{ChangeSet, ChangeType, Event, EventBus, EventHandler, EventKind};
use gitindex_core::index::{index_name, IndexBackend, IndexState, MemoryBackend, ReadinessPolicy};
use gitindex_core::models::{ContentObject, ContentTypeSchema};
use gitindex_core::poller::Poller;
use gitindex_core::store::{RepositoryStore, StoreLocks};
use gitindex_core::sync_engine::SyncOrchestrator;

// ===========================================================================
// Helpers
// ===========================================================================

fn person_schema() -> ContentTypeSchema {
    serde_json::from_value(json!({
        "type": "record",
        "namespace": "people",
        "name": "Person",
        "fields": [
            { "name": "name", "type": "string" },
            { "name": "age", "type": ["null", "int"], "default": null }
        ]
    }))
    .unwrap()
}

fn person(name: &str) -> ContentObject {
    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), json!(name));
    ContentObject::new("people.Person", fields)
}

fn new_store(dir: &Path) -> Arc<RepositoryStore> {
    let store = RepositoryStore::init(dir.join("Content")).unwrap();
    store.put_schema(&person_schema()).unwrap();
    Arc::new(store)
}

fn branch_of(store: &RepositoryStore) -> String {
    store.current_branch().unwrap().unwrap()
}

fn index_of(store: &RepositoryStore) -> String {
    index_name(&store.index_prefix(), &branch_of(store))
}

fn fast() -> ReadinessPolicy {
    ReadinessPolicy {
        timeout: Duration::from_millis(500),
        initial_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(50),
    }
}

fn orchestrator(backend: Arc<dyn IndexBackend>) -> SyncOrchestrator {
    SyncOrchestrator::new(backend).with_readiness(fast())
}

fn range(from: &str, to: &str) -> ChangeSet {
    ChangeSet::Range {
        from: from.to_string(),
        to: to.to_string(),
    }
}

/// Memory backend whose writes and readiness can be switched off, and whose
/// upserts can be slowed down while counting how many overlap.
#[derive(Default)]
struct FaultyBackend {
    inner: MemoryBackend,
    fail_upserts: AtomicBool,
    never_ready: AtomicBool,
    upsert_delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FaultyBackend {
    fn failing_upserts() -> Self {
        let backend = Self::default();
        backend.fail_upserts.store(true, Ordering::SeqCst);
        backend
    }

    fn slow_upserts(delay_ms: u64) -> Self {
        let backend = Self::default();
        backend.upsert_delay_ms.store(delay_ms, Ordering::SeqCst);
        backend
    }
}

#[async_trait]
impl IndexBackend for FaultyBackend {
    async fn exists(&self, index: &str) -> Result<bool, IndexError> {
        self.inner.exists(index).await
    }
    async fn is_ready(&self, index: &str) -> Result<bool, IndexError> {
        if self.never_ready.load(Ordering::SeqCst) {
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
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(IndexError::Backend {
                status: 503,
                body: "injected failure".into(),
            });
        }
        let delay = self.upsert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
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

// ===========================================================================
// Scenarios
// ===========================================================================

#[tokio::test]
async fn test_clone_builds_index_with_every_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();
    store.save(&person("Bar"), None).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    let stats = sync.on_store_cloned(&store, None).await.unwrap();

    assert!(stats.rebuilt);
    assert_eq!(stats.indexed, 2);
    let manager = sync.branch_index(&store, &branch_of(&store), None).await.unwrap();
    assert_eq!(manager.state(), IndexState::Ready);
    assert!(manager.ready().await.unwrap());
    assert_eq!(manager.count(Some("people.Person")).await.unwrap(), 2);
    assert!(backend.mapping(&index_of(&store), "people.Person").is_some());
}

#[tokio::test]
async fn test_delete_then_update_leaves_one_document() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let foo = person("Foo");
    store.save(&foo, None).unwrap();
    store.save(&person("Bar"), None).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();

    let old = store.head_commit().unwrap();
    store.delete("people.Person", &foo.uuid).unwrap();
    let new = store.head_commit().unwrap();

    let stats = sync
        .on_store_updated(&store, &branch_of(&store), &range(&old, &new), None)
        .await
        .unwrap();
    assert_eq!(stats.unindexed, 1);
    assert!(!stats.rebuilt);
    assert_eq!(backend.count(&index_of(&store), None).await.unwrap(), 1);
    assert!(backend.document(&index_of(&store), &foo.uuid).is_none());
}

#[tokio::test]
async fn test_renaming_non_content_file_keeps_count() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();
    std::fs::write(store.root().join("README"), "content store\n").unwrap();
    store.commit_all("Add README").unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();
    let before = backend.count(&index_of(&store), None).await.unwrap();

    let old = store.head_commit().unwrap();
    std::fs::rename(store.root().join("README"), store.root().join("README.md")).unwrap();
    store.commit_all("Rename README").unwrap();
    let new = store.head_commit().unwrap();

    let stats = sync
        .on_store_updated(&store, &branch_of(&store), &range(&old, &new), None)
        .await
        .unwrap();
    assert!(stats.skipped >= 1);
    assert_eq!(backend.count(&index_of(&store), None).await.unwrap(), before);
}

#[tokio::test]
async fn test_renaming_object_file_does_not_duplicate() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let foo = person("Foo");
    store.save(&foo, None).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();

    let old = store.head_commit().unwrap();
    let type_dir = store.root().join("people.Person");
    std::fs::rename(
        type_dir.join(format!("{}.json", foo.uuid)),
        type_dir.join("moved.json"),
    )
    .unwrap();
    store.commit_all("Move object file").unwrap();
    let new = store.head_commit().unwrap();

    sync.on_store_updated(&store, &branch_of(&store), &range(&old, &new), None)
        .await
        .unwrap();
    let ids = backend.document_ids(&index_of(&store));
    assert_eq!(ids.len(), 1);
    assert!(ids.contains(&foo.uuid));
}

#[tokio::test]
async fn test_delete_after_file_rename_matches_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let foo = person("Foo");
    store.save(&foo, None).unwrap();
    store.save(&person("Bar"), None).unwrap();

    let incremental = Arc::new(MemoryBackend::new());
    let sync = orchestrator(incremental.clone());
    sync.on_store_cloned(&store, None).await.unwrap();
    let branch = branch_of(&store);
    let type_dir = store.root().join("people.Person");

    let old = store.head_commit().unwrap();
    std::fs::rename(
        type_dir.join(format!("{}.json", foo.uuid)),
        type_dir.join("moved.json"),
    )
    .unwrap();
    let new = store.commit_all("Move object file").unwrap();
    sync.on_store_updated(&store, &branch, &range(&old, &new), None)
        .await
        .unwrap();

    std::fs::remove_file(type_dir.join("moved.json")).unwrap();
    let newest = store.commit_all("Remove moved file").unwrap();
    let stats = sync
        .on_store_updated(&store, &branch, &range(&new, &newest), None)
        .await
        .unwrap();
    assert_eq!(stats.unindexed, 1);

    let rebuilt = Arc::new(MemoryBackend::new());
    orchestrator(rebuilt.clone())
        .on_store_cloned(&store, None)
        .await
        .unwrap();
    let index = index_of(&store);
    assert_eq!(incremental.document_ids(&index), rebuilt.document_ids(&index));
    assert!(incremental.document(&index, &foo.uuid).is_none());
}

#[tokio::test]
async fn test_moving_uuid_between_files_keeps_it_indexed() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let type_dir = store.root().join("people.Person");
    std::fs::create_dir_all(&type_dir).unwrap();
    std::fs::write(type_dir.join("zz.json"), r#"{"uuid":"shared","name":"Foo"}"#).unwrap();
    store.commit_all("Add zz").unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();

    // The same uuid now lives in a file that sorts before the removed one.
    let old = store.head_commit().unwrap();
    std::fs::remove_file(type_dir.join("zz.json")).unwrap();
    let mut fields = serde_json::Map::new();
    for i in 0..12 {
        fields.insert(format!("note{}", i), json!(format!("line {}", i)));
    }
    fields.insert("uuid".into(), json!("shared"));
    std::fs::write(
        type_dir.join("aa.json"),
        serde_json::to_string_pretty(&Value::Object(fields)).unwrap(),
    )
    .unwrap();
    let new = store.commit_all("Move uuid").unwrap();
    sync.on_store_updated(&store, &branch_of(&store), &range(&old, &new), None)
        .await
        .unwrap();

    let index = index_of(&store);
    assert_eq!(backend.document_ids(&index).len(), 1);
    assert!(backend.document(&index, "shared").is_some());
}

#[tokio::test]
async fn test_rename_without_target_reindexing_only_unindexes() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let mut fields = serde_json::Map::new();
    fields.insert("name".into(), json!("Foo"));
    for i in 0..12 {
        fields.insert(format!("note{}", i), json!(format!("line {} about Foo", i)));
    }
    let foo = ContentObject::new("people.Person", fields);
    store.save(&foo, None).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone()).with_rename_targets(false);
    sync.on_store_cloned(&store, None).await.unwrap();

    let old = store.head_commit().unwrap();
    let type_dir = store.root().join("people.Person");
    std::fs::remove_file(type_dir.join(format!("{}.json", foo.uuid))).unwrap();
    let mut edited = foo.to_json();
    edited["age"] = json!(42);
    std::fs::write(
        type_dir.join("moved.json"),
        serde_json::to_string_pretty(&edited).unwrap(),
    )
    .unwrap();
    let new = store.commit_all("Move and edit").unwrap();
    assert!(matches!(
        store.changes_between(&old, &new).unwrap().as_slice(),
        [gitindex_core::diff::ChangeRecord::Renamed { .. }]
    ));

    let stats = sync
        .on_store_updated(&store, &branch_of(&store), &range(&old, &new), None)
        .await
        .unwrap();
    assert_eq!(stats.unindexed, 1);
    assert_eq!(stats.indexed, 0);
    assert!(backend.document_ids(&index_of(&store)).is_empty());
}

#[tokio::test]
async fn test_incremental_sync_matches_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let foo = person("Foo");
    let bar = person("Bar");
    store.save(&foo, None).unwrap();
    store.save(&bar, None).unwrap();

    let incremental = Arc::new(MemoryBackend::new());
    let sync = orchestrator(incremental.clone());
    sync.on_store_cloned(&store, None).await.unwrap();

    let old = store.head_commit().unwrap();
    let mut renamed_bar = bar.clone();
    renamed_bar
        .fields
        .insert("name".into(), json!("Bar Baz"));
    store.save(&renamed_bar, None).unwrap();
    store.delete("people.Person", &foo.uuid).unwrap();
    let qux = person("Qux");
    store.save(&qux, None).unwrap();
    let new = store.head_commit().unwrap();
    sync.on_store_updated(&store, &branch_of(&store), &range(&old, &new), None)
        .await
        .unwrap();

    let rebuilt = Arc::new(MemoryBackend::new());
    orchestrator(rebuilt.clone())
        .on_store_cloned(&store, None)
        .await
        .unwrap();

    let index = index_of(&store);
    let ids = incremental.document_ids(&index);
    assert_eq!(ids, rebuilt.document_ids(&index));
    for id in &ids {
        assert_eq!(incremental.document(&index, id), rebuilt.document(&index, id));
    }
    assert_eq!(
        incremental.document(&index, &bar.uuid).unwrap().body["name"],
        "Bar Baz"
    );
}

#[tokio::test]
async fn test_repeated_update_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();

    let old = store.head_commit().unwrap();
    let doomed = person("Doomed");
    store.save(&person("Bar"), None).unwrap();
    store.save(&doomed, None).unwrap();
    store.delete("people.Person", &doomed.uuid).unwrap();
    let new = store.head_commit().unwrap();

    let branch = branch_of(&store);
    sync.on_store_updated(&store, &branch, &range(&old, &new), None)
        .await
        .unwrap();
    let first = backend.document_ids(&index_of(&store));
    sync.on_store_updated(&store, &branch, &range(&old, &new), None)
        .await
        .unwrap();
    assert_eq!(backend.document_ids(&index_of(&store)), first);
    assert_eq!(first.len(), 2);
}

#[tokio::test]
async fn test_update_without_index_builds_branch() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let old = store.head_commit().unwrap();
    store.save(&person("Foo"), None).unwrap();
    store.save(&person("Bar"), None).unwrap();
    let new = store.head_commit().unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    let stats = sync
        .on_store_updated(&store, &branch_of(&store), &range(&old, &new), None)
        .await
        .unwrap();
    assert!(stats.rebuilt);
    assert_eq!(backend.count(&index_of(&store), None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_records_for_unknown_types_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();

    let old = store.head_commit().unwrap();
    let notes = store.root().join("misc.Note");
    std::fs::create_dir_all(&notes).unwrap();
    std::fs::write(notes.join("n1.json"), r#"{"uuid":"n1","text":"hi"}"#).unwrap();
    store.commit_all("Add untyped note").unwrap();
    let new = store.head_commit().unwrap();

    let stats = sync
        .on_store_updated(&store, &branch_of(&store), &range(&old, &new), None)
        .await
        .unwrap();
    assert_eq!(stats.skipped, 1);
    assert_eq!(backend.count(&index_of(&store), None).await.unwrap(), 0);
}

// ===========================================================================
// Failure handling
// ===========================================================================

#[tokio::test]
async fn test_failed_build_leaves_no_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();

    let backend = Arc::new(FaultyBackend::failing_upserts());
    let sync = orchestrator(backend.clone());
    let err = sync.on_store_cloned(&store, None).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::IndexBackend);
    assert!(!backend.exists(&index_of(&store)).await.unwrap());
}

#[tokio::test]
async fn test_failed_rebuild_removes_previous_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();

    let backend = Arc::new(FaultyBackend::default());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();
    assert!(backend.exists(&index_of(&store)).await.unwrap());

    backend.fail_upserts.store(true, Ordering::SeqCst);
    assert!(sync.on_store_cloned(&store, None).await.is_err());
    assert!(!backend.exists(&index_of(&store)).await.unwrap());
}

#[tokio::test]
async fn test_branch_restored_after_failed_sync() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();
    let home = branch_of(&store);

    store.create_branch("feature").unwrap();
    store.checkout_branch("feature").unwrap();
    let old = store.head_commit().unwrap();
    let extra = person("Feature only");
    store.save(&extra, None).unwrap();
    let new = store.head_commit().unwrap();
    store.checkout_branch(&home).unwrap();

    let backend = Arc::new(FaultyBackend::failing_upserts());
    let sync = orchestrator(backend.clone());
    let result = sync
        .on_store_updated(&store, "feature", &range(&old, &new), None)
        .await;

    assert!(result.is_err());
    assert_eq!(branch_of(&store), home);
    assert!(store.get("people.Person", &extra.uuid).is_err());
    // The store is not rolled back.
    store.checkout_branch("feature").unwrap();
    assert!(store.get("people.Person", &extra.uuid).is_ok());
    assert!(!backend
        .exists(&index_name(&store.index_prefix(), "feature"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_branch_restored_after_successful_sync() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let home = branch_of(&store);
    store.create_branch("feature").unwrap();
    store.checkout_branch("feature").unwrap();
    let old = store.head_commit().unwrap();
    store.save(&person("Feature only"), None).unwrap();
    let new = store.head_commit().unwrap();
    store.checkout_branch(&home).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_updated(&store, "feature", &range(&old, &new), None)
        .await
        .unwrap();
    assert_eq!(branch_of(&store), home);
    let feature_index = index_name(&store.index_prefix(), "feature");
    assert_eq!(backend.count(&feature_index, None).await.unwrap(), 1);
    assert!(!backend.exists(&index_of(&store)).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_is_typed() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();

    let backend = Arc::new(FaultyBackend::default());
    backend.never_ready.store(true, Ordering::SeqCst);
    let sync = orchestrator(backend.clone());
    let err = sync.on_store_cloned(&store, None).await.unwrap_err();

    assert!(matches!(
        err,
        SyncError::Index(IndexError::ReadyTimeout { .. })
    ));
    assert!(!backend.inner.exists(&index_of(&store)).await.unwrap());
}

#[tokio::test]
async fn test_bad_commit_range_is_git_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();

    let head = store.head_commit().unwrap();
    let err = sync
        .on_store_updated(
            &store,
            &branch_of(&store),
            &range("0123456789abcdef0123456789abcdef01234567", &head),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::GitOperation);
}

// ===========================================================================
// Concurrency
// ===========================================================================

/// A store with one object on its home branch and one more on `feature`.
/// Returns the home branch and the commit range that added the extra object.
fn store_with_feature(store: &RepositoryStore) -> (String, String, String, ContentObject) {
    store.save(&person("Foo"), None).unwrap();
    let home = branch_of(store);
    store.create_branch("feature").unwrap();
    store.checkout_branch("feature").unwrap();
    let old = store.head_commit().unwrap();
    let extra = person("Feature only");
    store.save(&extra, None).unwrap();
    let new = store.head_commit().unwrap();
    store.checkout_branch(&home).unwrap();
    (home, old, new, extra)
}

#[tokio::test]
async fn test_handlers_on_one_store_do_not_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let (home, old, new, extra) = store_with_feature(&store);

    let backend = Arc::new(FaultyBackend::slow_upserts(20));
    let sync = orchestrator(backend.clone());
    let commit_range = range(&old, &new);
    let (cloned, updated) = tokio::join!(
        sync.on_store_cloned(&store, None),
        sync.on_store_updated(&store, "feature", &commit_range, None),
    );
    cloned.unwrap();
    updated.unwrap();

    assert_eq!(backend.peak_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(branch_of(&store), home);
    let home_index = index_of(&store);
    let feature_index = index_name(&store.index_prefix(), "feature");
    assert_eq!(backend.inner.document_ids(&home_index).len(), 1);
    assert!(backend.inner.document(&home_index, &extra.uuid).is_none());
    assert_eq!(backend.inner.document_ids(&feature_index).len(), 2);
}

#[tokio::test]
async fn test_save_during_branch_sync_lands_on_checked_out_branch() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let (home, old, new, _) = store_with_feature(&store);

    let backend = Arc::new(FaultyBackend::slow_upserts(20));
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();

    let late = person("Late");
    let commit_range = range(&old, &new);
    let (updated, saved) = tokio::join!(
        sync.on_store_updated(&store, "feature", &commit_range, None),
        sync.save_object(&store, &late, None, None),
    );
    updated.unwrap();
    saved.unwrap();

    assert_eq!(branch_of(&store), home);
    assert!(store.get("people.Person", &late.uuid).is_ok());
    assert!(backend.inner.document(&index_of(&store), &late.uuid).is_some());
    store.checkout_branch("feature").unwrap();
    assert!(store.get("people.Person", &late.uuid).is_err());
}

#[tokio::test]
async fn test_poller_waits_for_store_lock() {
    let dir = tempfile::tempdir().unwrap();
    let origin = new_store(&dir.path().join("origin"));
    origin.save(&person("Foo"), None).unwrap();
    let repo_dir = dir.path().join("stores");
    std::fs::create_dir_all(&repo_dir).unwrap();
    let mirror = repo_dir.join("mirror");
    let before = RepositoryStore::clone_from(origin.root().to_str().unwrap(), &mirror)
        .unwrap()
        .head_commit()
        .unwrap();
    origin.save(&person("Bar"), None).unwrap();

    let locks = Arc::new(StoreLocks::new());
    let poller = Poller::new(Arc::new(EventBus::new()), &repo_dir).with_locks(locks.clone());
    let guard = locks.acquire(&mirror).await.unwrap();
    let blocked = tokio::time::timeout(Duration::from_millis(100), poller.poll_once()).await;
    assert!(blocked.is_err());
    assert_eq!(RepositoryStore::open(&mirror).unwrap().head_commit().unwrap(), before);

    drop(guard);
    let report = poller.poll_once().await.unwrap();
    assert_eq!(report.updated.len(), 1);
    assert_eq!(
        RepositoryStore::open(&mirror).unwrap().head_commit().unwrap(),
        origin.head_commit().unwrap()
    );
}

// ===========================================================================
// Wiring
// ===========================================================================

struct CountRecorder {
    backend: Arc<MemoryBackend>,
    index: String,
    seen: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl EventHandler for CountRecorder {
    async fn handle(&self, _event: &Event) -> Result<(), SyncError> {
        let count = self.backend.document_ids(&self.index).len() as u64;
        self.seen.lock().unwrap().push(count);
        Ok(())
    }
}

#[tokio::test]
async fn test_bus_runs_orchestrator_before_later_handlers() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = Arc::new(orchestrator(backend.clone()));
    let bus = EventBus::new();
    sync.register(&bus);
    let seen = Arc::new(Mutex::new(Vec::new()));
    bus.subscribe(
        EventKind::StoreCloned,
        Arc::new(CountRecorder {
            backend: backend.clone(),
            index: index_of(&store),
            seen: seen.clone(),
        }),
    );
    assert_eq!(bus.handler_count(EventKind::StoreCloned), 2);
    assert_eq!(bus.handler_count(EventKind::ObjectChanged), 1);

    bus.publish(&Event::StoreCloned {
        store: store.clone(),
        index_prefix: None,
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);

    let bar = person("Bar");
    store.save(&bar, None).unwrap();
    bus.publish(&Event::ObjectChanged {
        store: store.clone(),
        branch: None,
        object: bar.clone(),
        change_type: ChangeType::Update,
        index_prefix: None,
    })
    .await
    .unwrap();
    assert_eq!(backend.count(&index_of(&store), None).await.unwrap(), 2);
}

#[tokio::test]
async fn test_teardown_destroys_every_branch_index() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    store.save(&person("Foo"), None).unwrap();
    let home = branch_of(&store);
    store.create_branch("feature").unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = orchestrator(backend.clone());
    sync.on_store_cloned(&store, None).await.unwrap();
    store.checkout_branch("feature").unwrap();
    sync.on_store_cloned(&store, None).await.unwrap();
    store.checkout_branch(&home).unwrap();
    assert_eq!(backend.index_names().len(), 2);

    let root = store.root().to_path_buf();
    drop(store);
    let destroyed = sync.teardown_store(&root, None).await.unwrap();
    assert_eq!(destroyed.len(), 2);
    assert!(backend.index_names().is_empty());
    assert!(!root.exists());
}

#[tokio::test]
async fn test_poller_syncs_pulled_commits() {
    let dir = tempfile::tempdir().unwrap();
    let origin = new_store(&dir.path().join("origin"));
    origin.save(&person("Foo"), None).unwrap();

    let repo_dir = dir.path().join("stores");
    std::fs::create_dir_all(&repo_dir).unwrap();
    let clone = RepositoryStore::clone_from(
        origin.root().to_str().unwrap(),
        &repo_dir.join("mirror"),
    )
    .unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let sync = Arc::new(orchestrator(backend.clone()));
    sync.on_store_cloned(&clone, None).await.unwrap();
    let index = index_of(&clone);
    drop(clone);
    assert_eq!(backend.count(&index, None).await.unwrap(), 1);

    origin.save(&person("Bar"), None).unwrap();

    let bus = Arc::new(EventBus::new());
    sync.register(&bus);
    let poller = Poller::new(bus, &repo_dir);
    let report = poller.poll_once().await.unwrap();
    assert_eq!(report.checked, 1);
    assert!(report.failed.is_empty(), "{:?}", report.failed);
    assert_eq!(report.updated.len(), 1);
    assert_eq!(backend.count(&index, None).await.unwrap(), 2);

    let report = poller.poll_once().await.unwrap();
    assert!(report.updated.is_empty());
}
