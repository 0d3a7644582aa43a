//! Search indexes derived from content stores.
//!
//! One index exists per store branch, named `<store prefix>-<branch>`. An
//! index moves through [`IndexState`]s: it is `Building` from `create` until
//! population finishes and it reports ready, then `Ready`, and `Absent` after
//! `destroy`.

pub mod backend;
pub mod elasticsearch;
pub mod manager;
pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::{BackendKind, IndexConfig};
use crate::errors::IndexError;

pub use backend::{IndexBackend, DOC_TYPE_FIELD};
pub use elasticsearch::ElasticsearchBackend;
pub use manager::IndexManager;
pub use memory::{MemoryBackend, StoredDocument};

/// Lifecycle of one branch index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Absent,
    Building,
    Ready,
    Destroying,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Building => write!(f, "building"),
            Self::Ready => write!(f, "ready"),
            Self::Destroying => write!(f, "destroying"),
        }
    }
}

/// Bounds for polling an index until it can serve reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

/// Index name for a branch of a store.
///
/// Lowercased; anything other than ASCII alphanumerics, `-`, `_` and `.`
/// becomes `-` so branch names like `feature/x` stay legal.
pub fn index_name(prefix: &str, branch: &str) -> String {
    let raw = format!("{}-{}", prefix, branch).to_lowercase();
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned
        .trim_start_matches(|c: char| matches!(c, '-' | '_' | '.'))
        .to_string()
}

/// The backend selected by `[index] backend`.
pub fn backend_from_config(config: &IndexConfig) -> Result<Arc<dyn IndexBackend>, IndexError> {
    match config.backend {
        BackendKind::Memory => {
            info!("using in-memory index backend");
            Ok(Arc::new(MemoryBackend::new()))
        }
        BackendKind::Elasticsearch => Ok(Arc::new(ElasticsearchBackend::new(
            &config.url,
            config.request_timeout(),
        )?)),
    }
}
