//! The git-backed content store.

pub mod layout;
pub mod locks;
pub mod repository;

pub use locks::{StoreGuard, StoreLocks};
pub use repository::{Author, HeadSnapshot, ObjectIter, RepositoryStore};
