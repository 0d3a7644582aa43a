//! Event-driven index synchronisation.
//!
//! The [`SyncOrchestrator`] keeps each store branch's search index equal to
//! the content reachable from that branch:
//!
//! - **StoreCloned**: destroy any existing index for the active branch and
//!   build it from scratch.
//! - **StoreUpdated**: check out the branch, apply the classified changes to
//!   its index, and put the previous head back. Builds from scratch instead
//!   when the branch has no index yet.
//! - **ObjectChanged**: index or unindex a single object, if the index exists.
//!
//! Every handler runs under the store's lock from a shared [`StoreLocks`], so
//! at most one of them touches a given store at a time. Content writes made
//! through [`SyncOrchestrator::save_object`] and the
//! [`Poller`](crate::poller::Poller) take the same lock. A failed build leaves
//! no index behind; a failed incremental sync does not revert the store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::diff::ChangeRecord;
use crate::errors::{StoreError, SyncError};
use crate::events::{ChangeSet, ChangeType, Event, EventBus, EventHandler, EventKind};
use crate::index::{index_name, IndexBackend, IndexManager, IndexState, ReadinessPolicy};
use crate::models::{ContentObject, ObjectKey};
use crate::store::{layout, RepositoryStore, StoreLocks};

/// What one handler invocation did to an index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub index: String,
    /// True when the index was (re)built from scratch.
    pub rebuilt: bool,
    pub indexed: u64,
    pub unindexed: u64,
    /// Records ignored: non-object paths, types without a schema, or an
    /// absent index for a single-object change.
    pub skipped: u64,
}

impl SyncStats {
    fn for_index(index: &str) -> Self {
        Self {
            index: index.to_string(),
            ..Default::default()
        }
    }
}

pub struct SyncOrchestrator {
    backend: Arc<dyn IndexBackend>,
    readiness: ReadinessPolicy,
    index_rename_targets: bool,
    locks: Arc<StoreLocks>,
}

impl SyncOrchestrator {
    pub fn new(backend: Arc<dyn IndexBackend>) -> Self {
        Self {
            backend,
            readiness: ReadinessPolicy::default(),
            index_rename_targets: true,
            locks: Arc::new(StoreLocks::new()),
        }
    }

    pub fn from_config(config: &AppConfig, backend: Arc<dyn IndexBackend>) -> Self {
        info!(
            rename_targets = config.sync.index_rename_targets,
            "initializing sync orchestrator"
        );
        Self::new(backend)
            .with_readiness(config.index.readiness())
            .with_rename_targets(config.sync.index_rename_targets)
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_rename_targets(mut self, enabled: bool) -> Self {
        self.index_rename_targets = enabled;
        self
    }

    /// Share a lock registry with other components that mutate stores.
    pub fn with_locks(mut self, locks: Arc<StoreLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    pub fn locks(&self) -> &Arc<StoreLocks> {
        &self.locks
    }

    /// Subscribe to every event kind on `bus`.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        for kind in [
            EventKind::StoreCloned,
            EventKind::StoreUpdated,
            EventKind::ObjectChanged,
        ] {
            bus.subscribe(kind, self.clone());
        }
        info!("sync orchestrator registered");
    }

    /// Handle on the index of `branch`, with its current state.
    pub async fn branch_index(
        &self,
        store: &RepositoryStore,
        branch: &str,
        index_prefix: Option<&str>,
    ) -> Result<IndexManager, SyncError> {
        let name = index_name(&prefix_for(store, index_prefix), branch);
        Ok(IndexManager::attach(self.backend.clone(), name).await?)
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    /// Build the index of the store's checked-out branch from scratch.
    #[instrument(skip(self, store), fields(store = %store.name()))]
    pub async fn on_store_cloned(
        &self,
        store: &RepositoryStore,
        index_prefix: Option<&str>,
    ) -> Result<SyncStats, SyncError> {
        let _guard = self.locks.acquire(store.root()).await?;
        let branch = store
            .current_branch()?
            .ok_or_else(|| StoreError::RefNotFound("HEAD is detached".into()))?;
        let name = index_name(&prefix_for(store, index_prefix), &branch);
        let mut manager = IndexManager::attach(self.backend.clone(), &name).await?;
        if manager.state() != IndexState::Absent {
            info!(index = %name, "destroying existing index before rebuild");
            manager.destroy().await?;
        }
        let indexed = self.build(store, &mut manager).await?;
        Ok(SyncStats {
            index: name,
            rebuilt: true,
            indexed,
            ..Default::default()
        })
    }

    /// Apply `changes` on `branch` to the branch index.
    ///
    /// The store's head is restored afterwards whether or not the sync
    /// succeeded. The store itself is never rolled back.
    #[instrument(skip(self, store, changes), fields(store = %store.name()))]
    pub async fn on_store_updated(
        &self,
        store: &RepositoryStore,
        branch: &str,
        changes: &ChangeSet,
        index_prefix: Option<&str>,
    ) -> Result<SyncStats, SyncError> {
        let _guard = self.locks.acquire(store.root()).await?;
        let snapshot = store.head_snapshot()?;
        let name = index_name(&prefix_for(store, index_prefix), branch);

        let result = self.apply_update(store, branch, changes, &name).await;

        let restored = store.restore_head(&snapshot);
        match (result, restored) {
            (Ok(stats), Ok(())) => {
                info!(
                    index = %stats.index,
                    rebuilt = stats.rebuilt,
                    indexed = stats.indexed,
                    unindexed = stats.unindexed,
                    skipped = stats.skipped,
                    "incremental sync complete"
                );
                Ok(stats)
            }
            (Err(e), Ok(())) => {
                warn!(index = %name, error = %e, "incremental sync failed");
                Err(e)
            }
            (Ok(_), Err(restore_err)) => Err(SyncError::RestoreFailed {
                store: store.name(),
                source: restore_err,
            }),
            (Err(e), Err(restore_err)) => {
                error!(error = %restore_err, "failed to restore head after failed sync");
                Err(e)
            }
        }
    }

    /// Mirror a single saved or deleted object into its branch index.
    #[instrument(skip(self, store, object), fields(store = %store.name(), uuid = %object.uuid))]
    pub async fn on_object_changed(
        &self,
        store: &RepositoryStore,
        branch: Option<&str>,
        object: &ContentObject,
        change_type: ChangeType,
        index_prefix: Option<&str>,
    ) -> Result<SyncStats, SyncError> {
        let _guard = self.locks.acquire(store.root()).await?;
        self.apply_object_change(store, branch, object, change_type, index_prefix)
            .await
    }

    /// Commit `object` to the checked-out branch and mirror it into that
    /// branch's index, all under the store lock. Returns the commit id.
    #[instrument(skip(self, store, object), fields(store = %store.name(), uuid = %object.uuid))]
    pub async fn save_object(
        &self,
        store: &RepositoryStore,
        object: &ContentObject,
        message: Option<&str>,
        index_prefix: Option<&str>,
    ) -> Result<(String, SyncStats), SyncError> {
        let _guard = self.locks.acquire(store.root()).await?;
        let commit = store.save(object, message)?;
        let stats = self
            .apply_object_change(store, None, object, ChangeType::Update, index_prefix)
            .await?;
        Ok((commit, stats))
    }

    /// Delete an object from the checked-out branch and from its index,
    /// under the store lock. Returns the commit id.
    #[instrument(skip(self, store), fields(store = %store.name()))]
    pub async fn delete_object(
        &self,
        store: &RepositoryStore,
        content_type: &str,
        uuid: &str,
        index_prefix: Option<&str>,
    ) -> Result<(String, SyncStats), SyncError> {
        let _guard = self.locks.acquire(store.root()).await?;
        let object = store.get(content_type, uuid)?;
        let commit = store.delete(content_type, uuid)?;
        let stats = self
            .apply_object_change(store, None, &object, ChangeType::Delete, index_prefix)
            .await?;
        Ok((commit, stats))
    }

    /// Destroy every branch index of the store at `path`, then delete the
    /// store. Returns the names of the indexes that were destroyed.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub async fn teardown_store(
        &self,
        path: &Path,
        index_prefix: Option<&str>,
    ) -> Result<Vec<String>, SyncError> {
        let key = layout::store_key(path)?;
        let guard = self.locks.acquire(&key).await?;
        let store = RepositoryStore::open(&key)?;
        let prefix = prefix_for(&store, index_prefix);

        let mut destroyed = Vec::new();
        for branch in store.list_branches()? {
            let mut manager =
                IndexManager::attach(self.backend.clone(), index_name(&prefix, &branch)).await?;
            if manager.state() != IndexState::Absent {
                manager.destroy().await?;
                destroyed.push(manager.name().to_string());
            }
        }
        store.teardown()?;
        drop(guard);
        self.locks.forget(&key);
        info!(indexes = destroyed.len(), "store torn down");
        Ok(destroyed)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn apply_object_change(
        &self,
        store: &RepositoryStore,
        branch: Option<&str>,
        object: &ContentObject,
        change_type: ChangeType,
        index_prefix: Option<&str>,
    ) -> Result<SyncStats, SyncError> {
        let branch = match branch {
            Some(b) => b.to_string(),
            None => store
                .current_branch()?
                .ok_or_else(|| StoreError::RefNotFound("HEAD is detached".into()))?,
        };
        let name = index_name(&prefix_for(store, index_prefix), &branch);
        let mut stats = SyncStats::for_index(&name);
        let mut manager = IndexManager::attach(self.backend.clone(), &name).await?;
        if manager.state() == IndexState::Absent {
            info!(index = %name, "index absent, skipping object change");
            stats.skipped += 1;
            return Ok(stats);
        }

        match change_type {
            ChangeType::Update => {
                if !manager.is_mapped(&object.content_type) {
                    let mapping = store.mapping_for(&object.content_type)?;
                    manager
                        .setup_mapping(&object.content_type, &mapping)
                        .await?;
                }
                manager.index(object).await?;
                stats.indexed += 1;
            }
            ChangeType::Delete => {
                if manager.unindex(object).await? {
                    stats.unindexed += 1;
                }
            }
        }
        manager.refresh().await?;
        debug!(index = %name, ?change_type, "object change applied");
        Ok(stats)
    }

    /// Populate an absent index from the checked-out tree.
    async fn build(
        &self,
        store: &RepositoryStore,
        manager: &mut IndexManager,
    ) -> Result<u64, SyncError> {
        let types = store.list_content_types()?;
        let mut mappings = Vec::with_capacity(types.len());
        let mut sources = Vec::with_capacity(types.len());
        for content_type in &types {
            mappings.push((content_type.clone(), store.mapping_for(content_type)?));
            sources.push(store.iterate(content_type)?);
        }
        info!(index = %manager.name(), types = types.len(), "building index");
        let objects = sources
            .into_iter()
            .flatten()
            .map(|item| item.map_err(SyncError::from));
        manager.populate(mappings, objects, &self.readiness).await
    }

    async fn apply_update(
        &self,
        store: &RepositoryStore,
        branch: &str,
        changes: &ChangeSet,
        name: &str,
    ) -> Result<SyncStats, SyncError> {
        store.checkout_branch(branch)?;
        let mut stats = SyncStats::for_index(name);
        let mut manager = IndexManager::attach(self.backend.clone(), name).await?;

        if manager.state() == IndexState::Absent {
            info!(index = %name, "index absent, building branch");
            stats.indexed = self.build(store, &mut manager).await?;
            stats.rebuilt = true;
            return Ok(stats);
        }

        let changes = changes.resolve(store)?;
        debug!(index = %name, records = changes.len(), "applying change records");
        // Removals first: an object that moved between paths must end up indexed.
        for change in &changes {
            match &change.record {
                ChangeRecord::Deleted { path } | ChangeRecord::Renamed { from: path, .. } => {
                    let retired = change.retired_uuid.as_deref();
                    self.unindex_path(store, &manager, path, retired, &mut stats)
                        .await?;
                }
                ChangeRecord::Modified { path } => {
                    if let Some(retired) = change.retired_uuid.as_deref() {
                        if store.object_key(path).is_some() {
                            self.unindex_path(store, &manager, path, Some(retired), &mut stats)
                                .await?;
                        }
                    }
                }
                ChangeRecord::Added { .. } => {}
            }
        }
        for change in &changes {
            match &change.record {
                ChangeRecord::Added { path } | ChangeRecord::Modified { path } => {
                    self.index_path(store, &mut manager, path, &mut stats)
                        .await?;
                }
                ChangeRecord::Renamed { to, .. } => {
                    if self.index_rename_targets {
                        self.index_path(store, &mut manager, to, &mut stats)
                            .await?;
                    } else {
                        debug!(path = %to, "rename target not re-indexed");
                    }
                }
                ChangeRecord::Deleted { .. } => {}
            }
        }
        manager.refresh().await?;
        Ok(stats)
    }

    async fn index_path(
        &self,
        store: &RepositoryStore,
        manager: &mut IndexManager,
        path: &str,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let Some(key) = store.object_key(path) else {
            debug!(path, "not a content object, ignoring");
            stats.skipped += 1;
            return Ok(());
        };
        if !store.has_schema(&key.content_type) {
            debug!(path, content_type = %key.content_type, "no schema for type, ignoring");
            stats.skipped += 1;
            return Ok(());
        }
        if !manager.is_mapped(&key.content_type) {
            let mapping = store.mapping_for(&key.content_type)?;
            manager.setup_mapping(&key.content_type, &mapping).await?;
        }
        let object = store.load(path)?;
        manager.index(&object).await?;
        stats.indexed += 1;
        Ok(())
    }

    /// Remove the document a path held. `retired_uuid` is the uuid read
    /// from the old blob; the file name stands in when it is unknown.
    async fn unindex_path(
        &self,
        store: &RepositoryStore,
        manager: &IndexManager,
        path: &str,
        retired_uuid: Option<&str>,
        stats: &mut SyncStats,
    ) -> Result<(), SyncError> {
        let Some(mut key) = store.object_key(path) else {
            debug!(path, "not a content object, ignoring");
            stats.skipped += 1;
            return Ok(());
        };
        if let Some(uuid) = retired_uuid {
            key = ObjectKey {
                uuid: uuid.to_string(),
                ..key
            };
        }
        if manager.unindex_key(&key).await? {
            stats.unindexed += 1;
        }
        Ok(())
    }
}

fn prefix_for(store: &RepositoryStore, index_prefix: Option<&str>) -> String {
    index_prefix
        .map(str::to_string)
        .unwrap_or_else(|| store.index_prefix())
}

#[async_trait]
impl EventHandler for SyncOrchestrator {
    async fn handle(&self, event: &Event) -> Result<(), SyncError> {
        match event {
            Event::StoreCloned {
                store,
                index_prefix,
            } => {
                self.on_store_cloned(store, index_prefix.as_deref())
                    .await?;
            }
            Event::StoreUpdated {
                store,
                branch,
                changes,
                index_prefix,
            } => {
                self.on_store_updated(store, branch, changes, index_prefix.as_deref())
                    .await?;
            }
            Event::ObjectChanged {
                store,
                branch,
                object,
                change_type,
                index_prefix,
            } => {
                self.on_object_changed(
                    store,
                    branch.as_deref(),
                    object,
                    *change_type,
                    index_prefix.as_deref(),
                )
                .await?;
            }
        }
        Ok(())
    }
}
