//! Typed publish/subscribe for store lifecycle notifications.
//!
//! Publishers (the CLI, the poller, content write paths) announce what
//! happened to a store; subscribers such as the
//! [`SyncOrchestrator`](crate::sync_engine::SyncOrchestrator) react.
//! [`EventBus::publish`] awaits each subscribed handler in registration
//! order and stops at the first error.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::diff::{classify, classify_all, ChangeRecord, RawChange};
use crate::errors::{StoreError, SyncError};
use crate::models::ContentObject;
use crate::store::RepositoryStore;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// What changed between two positions of a branch.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeSet {
    /// Already classified.
    Records(Vec<ChangeRecord>),
    /// Raw deltas still to classify.
    Raw(Vec<RawChange>),
    /// A commit range to diff in the store.
    Range { from: String, to: String },
}

/// A classified change plus the uuid its old side held, when known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChange {
    pub record: ChangeRecord,
    /// Uuid whose document the change retires: the old blob's uuid for
    /// deletions and renames, and for modifications that changed the uuid.
    /// `None` when only the path is known.
    pub retired_uuid: Option<String>,
}

impl ChangeSet {
    /// Resolve to classified records, diffing in `store` if needed.
    pub fn records(&self, store: &RepositoryStore) -> Result<Vec<ChangeRecord>, StoreError> {
        match self {
            Self::Records(records) => Ok(records.clone()),
            Self::Raw(raw) => Ok(classify_all(raw)),
            Self::Range { from, to } => store.changes_between(from, to),
        }
    }

    /// Like [`records`](Self::records), also reading the uuid stored in each
    /// retired blob. Pre-classified records carry no blobs.
    pub fn resolve(&self, store: &RepositoryStore) -> Result<Vec<ResolvedChange>, StoreError> {
        match self {
            Self::Records(records) => Ok(records
                .iter()
                .cloned()
                .map(|record| ResolvedChange {
                    record,
                    retired_uuid: None,
                })
                .collect()),
            Self::Raw(raw) => Ok(resolve_raw(store, raw)),
            Self::Range { from, to } => Ok(resolve_raw(store, &store.diff(from, to)?)),
        }
    }
}

fn resolve_raw(store: &RepositoryStore, raw: &[RawChange]) -> Vec<ResolvedChange> {
    raw.iter()
        .filter_map(|change| {
            let record = classify(change)?;
            let old_uuid = change.old_blob.as_deref().and_then(|b| store.blob_uuid(b));
            let retired_uuid = match &record {
                ChangeRecord::Deleted { .. } | ChangeRecord::Renamed { .. } => old_uuid,
                ChangeRecord::Modified { .. } => {
                    let new_uuid = change.new_blob.as_deref().and_then(|b| store.blob_uuid(b));
                    old_uuid.filter(|old| new_uuid.as_ref() != Some(old))
                }
                ChangeRecord::Added { .. } => None,
            };
            Some(ResolvedChange {
                record,
                retired_uuid,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StoreCloned,
    StoreUpdated,
    ObjectChanged,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StoreCloned => write!(f, "store_cloned"),
            Self::StoreUpdated => write!(f, "store_updated"),
            Self::ObjectChanged => write!(f, "object_changed"),
        }
    }
}

/// A notification about a store.
///
/// `index_prefix` overrides the store's own prefix when naming indexes.
#[derive(Debug, Clone)]
pub enum Event {
    /// A store was cloned or otherwise needs a full index build.
    StoreCloned {
        store: Arc<RepositoryStore>,
        index_prefix: Option<String>,
    },
    /// `branch` moved; `changes` describes how.
    StoreUpdated {
        store: Arc<RepositoryStore>,
        branch: String,
        changes: ChangeSet,
        index_prefix: Option<String>,
    },
    /// One object was saved or deleted through the write path.
    ObjectChanged {
        store: Arc<RepositoryStore>,
        branch: Option<String>,
        object: ContentObject,
        change_type: ChangeType,
        index_prefix: Option<String>,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::StoreCloned { .. } => EventKind::StoreCloned,
            Self::StoreUpdated { .. } => EventKind::StoreUpdated,
            Self::ObjectChanged { .. } => EventKind::ObjectChanged,
        }
    }

    pub fn store(&self) -> &Arc<RepositoryStore> {
        match self {
            Self::StoreCloned { store, .. }
            | Self::StoreUpdated { store, .. }
            | Self::ObjectChanged { store, .. } => store,
        }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), SyncError>;
}

#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().unwrap_or_else(|poisoned| {
            warn!("event bus lock was poisoned, recovering");
            poisoned.into_inner()
        });
        handlers.entry(kind).or_default().push(handler);
        debug!(kind = %kind, "handler subscribed");
    }

    /// Run every handler for the event's kind, in registration order.
    pub async fn publish(&self, event: &Event) -> Result<(), SyncError> {
        let kind = event.kind();
        let handlers = self.handlers_for(kind);
        debug!(kind = %kind, store = %event.store().name(), handlers = handlers.len(), "publishing event");
        for handler in handlers {
            handler.handle(event).await?;
        }
        Ok(())
    }

    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }

    // The guard must not be held across handler awaits.
    fn handlers_for(&self, kind: EventKind) -> Vec<Arc<dyn EventHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }
}
