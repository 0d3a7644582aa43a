//! Classification of raw tree deltas into index-relevant change records.
//!
//! A [`RawChange`] is one entry of a git tree-to-tree diff, reduced to the
//! facts classification needs. [`classify`] turns it into at most one
//! [`ChangeRecord`]. Renames win over content edits: a delta that is both a
//! rename and a modification yields only [`ChangeRecord::Renamed`].

use git2::{Delta, DiffDelta};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// One file-level entry of a diff between two commits.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawChange {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    /// Blob id on the old side; `None` when the file did not exist there.
    pub old_blob: Option<String>,
    /// Blob id on the new side; `None` when the file does not exist there.
    pub new_blob: Option<String>,
    /// Whether rename detection paired the two sides.
    pub renamed: bool,
}

/// A classified file-level change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChangeRecord {
    #[serde(rename = "A")]
    Added { path: String },
    #[serde(rename = "D")]
    Deleted { path: String },
    #[serde(rename = "R")]
    Renamed {
        #[serde(rename = "rename_from")]
        from: String,
        #[serde(rename = "rename_to")]
        to: String,
    },
    #[serde(rename = "M")]
    Modified { path: String },
}

impl ChangeRecord {
    /// Single-letter code matching `git diff --name-status`.
    pub fn code(&self) -> char {
        match self {
            Self::Added { .. } => 'A',
            Self::Deleted { .. } => 'D',
            Self::Renamed { .. } => 'R',
            Self::Modified { .. } => 'M',
        }
    }
}

impl std::fmt::Display for ChangeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Renamed { from, to } => write!(f, "R {} -> {}", from, to),
            Self::Added { path } | Self::Deleted { path } | Self::Modified { path } => {
                write!(f, "{} {}", self.code(), path)
            }
        }
    }
}

impl RawChange {
    pub fn added(path: &str, blob: &str) -> Self {
        Self {
            new_path: Some(path.into()),
            new_blob: Some(blob.into()),
            ..Default::default()
        }
    }

    pub fn deleted(path: &str, blob: &str) -> Self {
        Self {
            old_path: Some(path.into()),
            old_blob: Some(blob.into()),
            ..Default::default()
        }
    }

    pub fn modified(path: &str, old_blob: &str, new_blob: &str) -> Self {
        Self {
            old_path: Some(path.into()),
            new_path: Some(path.into()),
            old_blob: Some(old_blob.into()),
            new_blob: Some(new_blob.into()),
            renamed: false,
        }
    }

    pub fn renamed(from: &str, to: &str, old_blob: &str, new_blob: &str) -> Self {
        Self {
            old_path: Some(from.into()),
            new_path: Some(to.into()),
            old_blob: Some(old_blob.into()),
            new_blob: Some(new_blob.into()),
            renamed: true,
        }
    }

    /// Reduce a `git2` delta. Sides that do not exist get no path or blob.
    pub fn from_delta(delta: &DiffDelta<'_>) -> Self {
        let status = delta.status();
        let old = delta.old_file();
        let new = delta.new_file();
        let old_exists = !matches!(status, Delta::Added | Delta::Untracked) && !old.id().is_zero();
        let new_exists = status != Delta::Deleted && !new.id().is_zero();
        let path_of = |file: &git2::DiffFile<'_>| {
            file.path().map(|p| p.to_string_lossy().replace('\\', "/"))
        };
        Self {
            old_path: if old_exists { path_of(&old) } else { None },
            new_path: if new_exists { path_of(&new) } else { None },
            old_blob: old_exists.then(|| old.id().to_string()),
            new_blob: new_exists.then(|| new.id().to_string()),
            renamed: status == Delta::Renamed,
        }
    }
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Classify one raw change. Returns `None` for entries that carry no
/// content change (unchanged or mode-only).
pub fn classify(change: &RawChange) -> Option<ChangeRecord> {
    match (&change.old_blob, &change.new_blob) {
        (None, Some(_)) => change
            .new_path
            .clone()
            .map(|path| ChangeRecord::Added { path }),
        (Some(_), None) => change
            .old_path
            .clone()
            .map(|path| ChangeRecord::Deleted { path }),
        (Some(old), Some(new)) => {
            if change.renamed {
                match (&change.old_path, &change.new_path) {
                    (Some(from), Some(to)) => Some(ChangeRecord::Renamed {
                        from: from.clone(),
                        to: to.clone(),
                    }),
                    _ => None,
                }
            } else if old != new {
                change
                    .new_path
                    .clone()
                    .or_else(|| change.old_path.clone())
                    .map(|path| ChangeRecord::Modified { path })
            } else {
                None
            }
        }
        (None, None) => None,
    }
}

/// Classify a sequence, preserving diff order.
pub fn classify_all<'a, I>(changes: I) -> Vec<ChangeRecord>
where
    I: IntoIterator<Item = &'a RawChange>,
{
    changes.into_iter().filter_map(classify).collect()
}
