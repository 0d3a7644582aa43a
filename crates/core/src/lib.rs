//! gitindex core library.
//!
//! Content lives as JSON files in git repositories ("stores"); this crate
//! keeps a search index per store branch consistent with them: the store
//! layer, diff classification, index management, the event bus, and the
//! sync orchestrator that ties them together.

pub mod config;
pub mod diff;
pub mod errors;
pub mod events;
pub mod index;
pub mod models;
pub mod poller;
pub mod store;
pub mod sync_engine;

// Re-exports for convenience.
pub use config::AppConfig;
pub use events::{Event, EventBus};
pub use index::{IndexBackend, IndexManager};
pub use store::{RepositoryStore, StoreLocks};
pub use sync_engine::SyncOrchestrator;
