//! Error types for the gitindex core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them for callers that want a single
//! error type. [`ErrorKind`] folds every error onto the coarse taxonomy the
//! dispatch layer reports on.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Coarse classification surfaced to the dispatch layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A store, schema, or object is absent.
    NotFound,
    /// The versioned store rejected an operation.
    GitOperation,
    /// The search backend rejected an operation.
    IndexBackend,
    /// Invalid or missing configuration.
    Config,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::GitOperation => write!(f, "git_operation"),
            Self::IndexBackend => write!(f, "index_backend"),
            Self::Config => write!(f, "config"),
        }
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Index(_) => ErrorKind::IndexBackend,
            Self::Sync(e) => e.kind(),
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

/// Errors from the git-backed content store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The path does not exist or is not a git repository.
    #[error("repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// No schema definition exists for the content type.
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    /// No object with this uuid exists for the content type.
    #[error("{content_type} object not found: {uuid}")]
    ObjectNotFound { content_type: String, uuid: String },

    /// A content type or uuid that cannot name an object file.
    #[error("invalid object key '{content_type}/{uuid}'")]
    InvalidObjectKey { content_type: String, uuid: String },

    /// A commit requested for an interactive diff does not exist.
    #[error("commit not found: {0}")]
    CommitNotFound(String),

    /// A commit id, branch or ref could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// A pull could not be fast-forwarded.
    #[error("cannot fast-forward '{branch}': {detail}")]
    MergeConflict { branch: String, detail: String },

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A schema or object file could not be parsed.
    #[error("invalid content at '{path}': {detail}")]
    InvalidContent { path: String, detail: String },

    /// Generic I/O wrapper.
    #[error("store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RepositoryNotFound(_)
            | Self::SchemaNotFound(_)
            | Self::ObjectNotFound { .. }
            | Self::CommitNotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::GitOperation,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

// ---------------------------------------------------------------------------
// Index errors
// ---------------------------------------------------------------------------

/// Errors from the search index manager and its backends.
#[derive(Debug, Error)]
pub enum IndexError {
    /// `create` was called for an index that already exists.
    #[error("index '{0}' already exists")]
    AlreadyExists(String),

    /// The operation is not allowed in the index's current state.
    #[error("cannot {operation} index '{index}' while {state}")]
    InvalidState {
        index: String,
        state: String,
        operation: String,
    },

    /// A document was indexed before its content type's mapping was set up.
    #[error("no mapping registered for '{content_type}' in index '{index}'")]
    UnmappedType { index: String, content_type: String },

    /// The backend returned a non-success status.
    #[error("index backend error (HTTP {status}): {body}")]
    Backend { status: u16, body: String },

    /// HTTP-level transport error (connectivity, TLS, etc.).
    #[error("index HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The index did not become ready within the allowed time.
    #[error("index '{index}' not ready after {waited_ms}ms")]
    ReadyTimeout { index: String, waited_ms: u64 },

    /// A document could not be encoded for the backend.
    #[error("index serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Sync orchestration errors
// ---------------------------------------------------------------------------

/// Errors from the event handlers that keep an index in step with a store.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Underlying store error during sync.
    #[error("sync store error: {0}")]
    Store(#[from] StoreError),

    /// Underlying index error during sync.
    #[error("sync index error: {0}")]
    Index(#[from] IndexError),

    /// The store's previous head could not be restored after a branch switch.
    #[error("failed to restore head of '{store}': {source}")]
    RestoreFailed {
        store: String,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::Index(_) => ErrorKind::IndexBackend,
            Self::RestoreFailed { .. } => ErrorKind::GitOperation,
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
