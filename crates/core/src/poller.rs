//! Pulls every store under the storage directory and announces movement.
//!
//! For each store, [`Poller::poll_once`] fast-forwards the checked-out
//! branch from its remote. A store whose head moved gets a `StoreUpdated`
//! event carrying the commit range, or `StoreCloned` if the branch had no
//! commits before. A failure on one store is logged and recorded, and the
//! pass continues with the next.
//!
//! The fast-forward runs under the store's lock. Share the registry with the
//! [`SyncOrchestrator`](crate::sync_engine::SyncOrchestrator) through
//! [`Poller::with_locks`]; the lock is released before the event is published
//! because the handlers take it themselves.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::errors::{StoreError, SyncError};
use crate::events::{ChangeSet, Event, EventBus};
use crate::store::{layout, Author, RepositoryStore, StoreLocks};

/// Outcome of one polling pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollReport {
    pub checked: usize,
    /// Stores whose head moved, as `(name, old, new)`.
    pub updated: Vec<(String, String, String)>,
    /// Stores that could not be pulled or synced, as `(name, error)`.
    pub failed: Vec<(String, String)>,
}

pub struct Poller {
    bus: Arc<EventBus>,
    repo_dir: PathBuf,
    remote: Option<String>,
    author: Author,
    locks: Arc<StoreLocks>,
}

impl Poller {
    pub fn new(bus: Arc<EventBus>, repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            bus,
            repo_dir: repo_dir.into(),
            remote: None,
            author: Author::default(),
            locks: Arc::new(StoreLocks::new()),
        }
    }

    pub fn from_config(config: &AppConfig, bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            repo_dir: config.storage.repo_dir.clone(),
            remote: config.sync.remote.clone(),
            author: Author {
                name: config.storage.author_name.clone(),
                email: config.storage.author_email.clone(),
            },
            locks: Arc::new(StoreLocks::new()),
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = Some(remote.into());
        self
    }

    pub fn with_locks(mut self, locks: Arc<StoreLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// One pass over every store.
    pub async fn poll_once(&self) -> Result<PollReport, StoreError> {
        let mut report = PollReport::default();
        for path in layout::discover(&self.repo_dir)? {
            report.checked += 1;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.poll_store(path).await {
                Ok(Some((old, new))) => report.updated.push((name, old, new)),
                Ok(None) => {}
                Err(e) => {
                    warn!(store = %name, error = %e, "poll failed");
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        info!(
            checked = report.checked,
            updated = report.updated.len(),
            failed = report.failed.len(),
            "poll pass complete"
        );
        Ok(report)
    }

    async fn poll_store(&self, path: PathBuf) -> Result<Option<(String, String)>, SyncError> {
        let store = Arc::new(RepositoryStore::open(&path)?.with_author(self.author.clone()));
        let (old, new, branch) = {
            let _guard = self.locks.acquire(store.root()).await?;
            let (old, new) = store.fast_forward(self.remote.as_deref())?;
            (old, new, store.current_branch()?)
        };
        if old == new {
            debug!(store = %store.name(), "no new commits");
            return Ok(None);
        }
        let event = if old.is_empty() {
            Event::StoreCloned {
                store: store.clone(),
                index_prefix: None,
            }
        } else {
            let branch =
                branch.ok_or_else(|| StoreError::RefNotFound("HEAD is detached".into()))?;
            Event::StoreUpdated {
                store: store.clone(),
                branch,
                changes: ChangeSet::Range {
                    from: old.clone(),
                    to: new.clone(),
                },
                index_prefix: None,
            }
        };
        self.bus.publish(&event).await?;
        Ok(Some((old, new)))
    }

    /// Poll forever at `interval`. The first pass runs immediately.
    pub async fn run(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "poller started");
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "poll pass failed");
            }
        }
    }
}
