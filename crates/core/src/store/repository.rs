//! Git-backed content store via `git2`.

use std::collections::{BTreeMap, HashMap};
use std::fs::ReadDir;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use git2::build::CheckoutBuilder;
use git2::{BranchType, DiffFindOptions, IndexAddOption, Oid, Repository, Signature};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::diff::{classify_all, ChangeRecord, RawChange};
use crate::errors::StoreError;
use crate::models::{
    ContentObject, ContentTypeSchema, DiffSummary, ObjectKey, PullSummary, StoreDump, StoreSummary,
    UUID_FIELD,
};
use crate::store::layout;

/// Identity recorded on content commits.
#[derive(Debug, Clone)]
pub struct Author {
    pub name: String,
    pub email: String,
}

impl Default for Author {
    fn default() -> Self {
        Self {
            name: "gitindex".into(),
            email: "gitindex@localhost".into(),
        }
    }
}

/// Where HEAD pointed before a temporary branch switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadSnapshot {
    Branch(String),
    Detached(String),
}

/// A content store: one git working tree plus its full history.
///
/// The repository handle sits behind a `Mutex` so the store is `Sync` and
/// can be held across `.await` points by the sync handlers.
pub struct RepositoryStore {
    repo: Mutex<Repository>,
    root: PathBuf,
    author: Author,
    schemas: Mutex<HashMap<String, Arc<ContentTypeSchema>>>,
}

impl std::fmt::Debug for RepositoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryStore")
            .field("root", &self.root)
            .finish()
    }
}

impl RepositoryStore {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Open the store whose working tree is at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        debug!(path = %path.display(), "opening store");
        let repo = Repository::open(path)
            .map_err(|_| StoreError::RepositoryNotFound(path.display().to_string()))?;
        Self::from_repo(repo, path)
    }

    /// Create an empty store at `path`.
    pub fn init<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        info!(path = %path.display(), "initialising store");
        let repo = Repository::init(path)?;
        Self::from_repo(repo, path)
    }

    /// Clone a remote store to `path`.
    #[instrument(fields(path = %path.display()))]
    pub fn clone_from(url: &str, path: &Path) -> Result<Self, StoreError> {
        info!("cloning store");
        let repo = git2::build::RepoBuilder::new().clone(url, path)?;
        info!("clone completed");
        Self::from_repo(repo, path)
    }

    fn from_repo(repo: Repository, path: &Path) -> Result<Self, StoreError> {
        let root = repo
            .workdir()
            .map(Path::to_path_buf)
            .ok_or_else(|| StoreError::RepositoryNotFound(path.display().to_string()))?;
        Ok(Self {
            repo: Mutex::new(repo),
            root,
            author: Author::default(),
            schemas: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_author(mut self, author: Author) -> Self {
        self.author = author;
        self
    }

    fn repo(&self) -> MutexGuard<'_, Repository> {
        self.repo.lock().unwrap_or_else(|poisoned| {
            warn!("repository mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn schema_cache(&self) -> MutexGuard<'_, HashMap<String, Arc<ContentTypeSchema>>> {
        self.schemas.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn invalidate_schemas(&self) {
        self.schema_cache().clear();
    }

    // -----------------------------------------------------------------------
    // Identity & position
    // -----------------------------------------------------------------------

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory name of the working tree.
    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Index prefix for this store: the case-normalised directory name.
    pub fn index_prefix(&self) -> String {
        self.name().to_lowercase()
    }

    /// The checked-out branch, or `None` when HEAD is detached.
    pub fn current_branch(&self) -> Result<Option<String>, StoreError> {
        let repo = self.repo();
        let head = repo.find_reference("HEAD")?;
        Ok(head
            .symbolic_target()
            .and_then(|t| t.strip_prefix("refs/heads/"))
            .map(str::to_string))
    }

    /// SHA of the commit HEAD points at.
    pub fn head_commit(&self) -> Result<String, StoreError> {
        let repo = self.repo();
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn head_snapshot(&self) -> Result<HeadSnapshot, StoreError> {
        match self.current_branch()? {
            Some(branch) => Ok(HeadSnapshot::Branch(branch)),
            None => Ok(HeadSnapshot::Detached(self.head_commit()?)),
        }
    }

    /// Point HEAD at `branch` and force the working tree to match it.
    #[instrument(skip(self), fields(store = %self.name()))]
    pub fn checkout_branch(&self, branch: &str) -> Result<(), StoreError> {
        if self.current_branch()?.as_deref() == Some(branch) {
            return Ok(());
        }
        let refname = format!("refs/heads/{}", branch);
        {
            let repo = self.repo();
            let target = repo
                .find_reference(&refname)
                .map_err(|_| StoreError::RefNotFound(branch.to_string()))?
                .peel_to_commit()?;
            repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().force()))?;
            repo.set_head(&refname)?;
        }
        self.invalidate_schemas();
        debug!("checked out branch");
        Ok(())
    }

    /// Put HEAD back where a [`HeadSnapshot`] recorded it.
    pub fn restore_head(&self, snapshot: &HeadSnapshot) -> Result<(), StoreError> {
        match snapshot {
            HeadSnapshot::Branch(branch) => self.checkout_branch(branch),
            HeadSnapshot::Detached(sha) => {
                {
                    let repo = self.repo();
                    let oid = Oid::from_str(sha).map_err(|_| StoreError::RefNotFound(sha.clone()))?;
                    let target = repo.find_commit(oid)?;
                    repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().force()))?;
                    repo.set_head_detached(oid)?;
                }
                self.invalidate_schemas();
                Ok(())
            }
        }
    }

    /// Create a local branch at HEAD.
    #[instrument(skip(self))]
    pub fn create_branch(&self, name: &str) -> Result<(), StoreError> {
        let repo = self.repo();
        let commit = repo.head()?.peel_to_commit()?;
        repo.branch(name, &commit, false)?;
        info!(name, "created branch");
        Ok(())
    }

    /// List all local branch names.
    pub fn list_branches(&self) -> Result<Vec<String>, StoreError> {
        let repo = self.repo();
        let mut names = Vec::new();
        for branch_result in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch_result?;
            if let Some(name) = branch.name()? {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }

    // -----------------------------------------------------------------------
    // Schemas
    // -----------------------------------------------------------------------

    /// Names of all content types with a schema definition, sorted.
    pub fn list_content_types(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.root.join(layout::SCHEMA_DIR);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(layout::SCHEMA_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn list_schemas(&self) -> Result<BTreeMap<String, ContentTypeSchema>, StoreError> {
        let mut schemas = BTreeMap::new();
        for name in self.list_content_types()? {
            let schema = self.get_schema(&name)?;
            schemas.insert(name, schema.as_ref().clone());
        }
        Ok(schemas)
    }

    pub fn has_schema(&self, content_type: &str) -> bool {
        self.root.join(layout::schema_path(content_type)).is_file()
    }

    /// Parsed schema for `content_type`, cached until the tree changes.
    pub fn get_schema(&self, content_type: &str) -> Result<Arc<ContentTypeSchema>, StoreError> {
        if let Some(schema) = self.schema_cache().get(content_type) {
            return Ok(schema.clone());
        }
        let rel = layout::schema_path(content_type);
        let data = match std::fs::read_to_string(self.root.join(&rel)) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::SchemaNotFound(content_type.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let schema: ContentTypeSchema =
            serde_json::from_str(&data).map_err(|e| StoreError::InvalidContent {
                path: rel.display().to_string(),
                detail: e.to_string(),
            })?;
        if schema.full_name() != content_type {
            warn!(
                file = content_type,
                declared = %schema.full_name(),
                "schema file name does not match its namespace.name"
            );
        }
        let schema = Arc::new(schema);
        self.schema_cache()
            .insert(content_type.to_string(), schema.clone());
        Ok(schema)
    }

    /// Write a schema definition and commit it.
    pub fn put_schema(&self, schema: &ContentTypeSchema) -> Result<String, StoreError> {
        let name = schema.full_name();
        let rel = layout::schema_path(&name);
        let body = serde_json::to_string_pretty(schema).map_err(|e| StoreError::InvalidContent {
            path: rel.display().to_string(),
            detail: e.to_string(),
        })?;
        self.write_file(&rel, &body)?;
        self.schema_cache().remove(&name);
        self.commit_paths(&[rel], &[], &format!("Add schema {}", name))
    }

    /// Custom index mapping shipped with the store, if any.
    pub fn get_mapping(&self, content_type: &str) -> Result<Option<Value>, StoreError> {
        let rel = layout::mapping_path(content_type);
        match std::fs::read_to_string(self.root.join(&rel)) {
            Ok(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|e| StoreError::InvalidContent {
                    path: rel.display().to_string(),
                    detail: e.to_string(),
                }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The custom mapping when present, else one derived from the schema.
    pub fn mapping_for(&self, content_type: &str) -> Result<Value, StoreError> {
        match self.get_mapping(content_type)? {
            Some(mapping) => Ok(mapping),
            None => Ok(self.get_schema(content_type)?.default_mapping()),
        }
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Lazily read every object of `content_type` from the working tree.
    ///
    /// Each call re-reads the directory, so the sequence can be restarted.
    pub fn iterate(&self, content_type: &str) -> Result<ObjectIter, StoreError> {
        let entries = match std::fs::read_dir(self.root.join(content_type)) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(ObjectIter {
            content_type: content_type.to_string(),
            entries,
        })
    }

    pub fn get(&self, content_type: &str, uuid: &str) -> Result<ContentObject, StoreError> {
        self.load(&layout::object_path(content_type, uuid))
    }

    /// Load the object stored at a store-relative path.
    pub fn load(&self, path: &str) -> Result<ContentObject, StoreError> {
        let key = self.object_key(path).ok_or_else(|| StoreError::InvalidContent {
            path: path.to_string(),
            detail: "not a content object path".into(),
        })?;
        let abs = self.root.join(path);
        if !abs.is_file() {
            return Err(StoreError::ObjectNotFound {
                content_type: key.content_type,
                uuid: key.uuid,
            });
        }
        read_object(&key.content_type, &abs, path)
    }

    /// Identity of the object a path would hold, from the path alone.
    pub fn object_key(&self, path: &str) -> Option<ObjectKey> {
        layout::object_key(path)
    }

    /// Write `object` and commit it. Returns the new commit id.
    ///
    /// The working tree is put back as it was if the commit fails.
    #[instrument(skip(self, object), fields(content_type = %object.content_type, uuid = %object.uuid))]
    pub fn save(&self, object: &ContentObject, message: Option<&str>) -> Result<String, StoreError> {
        layout::check_key(&object.content_type, &object.uuid)?;
        self.get_schema(&object.content_type)?;
        let rel = PathBuf::from(object.relative_path());
        let body = serde_json::to_string_pretty(&object.to_json()).map_err(|e| {
            StoreError::InvalidContent {
                path: rel.display().to_string(),
                detail: e.to_string(),
            }
        })?;
        let previous = match std::fs::read(self.root.join(&rel)) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        self.write_file(&rel, &body)?;
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Save {} {}", object.content_type, object.uuid));
        let result = self.commit_paths(&[rel.clone()], &[], &message);
        if result.is_err() {
            self.put_back(&rel, previous.as_deref());
        }
        result
    }

    /// Remove an object and commit the removal. Returns the new commit id.
    #[instrument(skip(self))]
    pub fn delete(&self, content_type: &str, uuid: &str) -> Result<String, StoreError> {
        layout::check_key(content_type, uuid)?;
        let rel = PathBuf::from(layout::object_path(content_type, uuid));
        let abs = self.root.join(&rel);
        if !abs.is_file() {
            return Err(StoreError::ObjectNotFound {
                content_type: content_type.to_string(),
                uuid: uuid.to_string(),
            });
        }
        let previous = std::fs::read(&abs)?;
        std::fs::remove_file(&abs)?;
        let message = format!("Delete {} {}", content_type, uuid);
        let result = self.commit_paths(&[], &[rel.clone()], &message);
        if result.is_err() {
            self.put_back(&rel, Some(&previous));
        }
        result
    }

    /// Restore a file after a failed commit; `None` means it did not exist.
    fn put_back(&self, rel: &Path, previous: Option<&[u8]>) {
        let abs = self.root.join(rel);
        let restored = match previous {
            Some(bytes) => std::fs::write(&abs, bytes),
            None => std::fs::remove_file(&abs),
        };
        match restored {
            Ok(()) => debug!(path = %rel.display(), "working tree restored after failed commit"),
            Err(e) => warn!(path = %rel.display(), error = %e, "could not restore working tree"),
        }
    }

    fn write_file(&self, rel: &Path, body: &str) -> Result<(), StoreError> {
        let abs = self.root.join(rel);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&abs, format!("{}\n", body))?;
        Ok(())
    }

    fn commit_paths(
        &self,
        added: &[PathBuf],
        removed: &[PathBuf],
        message: &str,
    ) -> Result<String, StoreError> {
        let repo = self.repo();
        let mut index = repo.index()?;
        // Drop entries staged by an earlier commit attempt that failed.
        index.read(true)?;
        for path in added {
            index.add_path(path)?;
        }
        for path in removed {
            index.remove_path(path)?;
        }
        index.write()?;
        commit_index(&repo, &mut index, &self.author, message)
    }

    /// Stage every change in the working tree and commit it.
    pub fn commit_all(&self, message: &str) -> Result<String, StoreError> {
        let repo = self.repo();
        let mut index = repo.index()?;
        index.read(true)?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        commit_index(&repo, &mut index, &self.author, message)
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Raw tree changes between two commits, with rename detection.
    #[instrument(skip(self), fields(store = %self.name()))]
    pub fn diff(&self, from: &str, to: &str) -> Result<Vec<RawChange>, StoreError> {
        let repo = self.repo();
        let old_tree = resolve_commit(&repo, from)?.tree()?;
        let new_tree = resolve_commit(&repo, to)?.tree()?;
        let mut diff = repo.diff_tree_to_tree(Some(&old_tree), Some(&new_tree), None)?;
        diff.find_similar(Some(DiffFindOptions::new().renames(true)))?;
        let changes: Vec<RawChange> = diff.deltas().map(|d| RawChange::from_delta(&d)).collect();
        debug!(count = changes.len(), "computed diff");
        Ok(changes)
    }

    /// Classified changes between two commits.
    pub fn changes_between(&self, from: &str, to: &str) -> Result<Vec<ChangeRecord>, StoreError> {
        Ok(classify_all(&self.diff(from, to)?))
    }

    /// Uuid recorded inside a stored object blob.
    ///
    /// `None` when the blob is missing or is not a JSON object with a uuid.
    pub fn blob_uuid(&self, blob: &str) -> Option<String> {
        let repo = self.repo();
        let oid = Oid::from_str(blob).ok()?;
        let blob = repo.find_blob(oid).ok()?;
        let value: Value = serde_json::from_slice(blob.content()).ok()?;
        value
            .get(UUID_FIELD)?
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn require_commit(&self, commit: &str) -> Result<(), StoreError> {
        let repo = self.repo();
        resolve_commit(&repo, commit)
            .map(|_| ())
            .map_err(|_| StoreError::CommitNotFound(commit.to_string()))
    }

    /// Changes from `commit` to HEAD, for clients catching up.
    pub fn diff_summary(&self, commit: &str) -> Result<DiffSummary, StoreError> {
        self.require_commit(commit)?;
        let current = self.head_commit()?;
        Ok(DiffSummary {
            name: self.name(),
            previous: commit.to_string(),
            diff: self.changes_between(commit, &current)?,
            current,
        })
    }

    /// Bodies of the objects added or modified since `commit`, grouped by
    /// content type. Renames and deletions are listed under `other`.
    ///
    /// Objects are read from the working tree, which must match HEAD.
    #[instrument(skip(self), fields(store = %self.name()))]
    pub fn pull_summary(&self, commit: &str) -> Result<PullSummary, StoreError> {
        self.require_commit(commit)?;
        let current = self.head_commit()?;
        let mut objects: BTreeMap<String, Vec<Value>> = self
            .list_content_types()?
            .into_iter()
            .map(|name| (name, Vec::new()))
            .collect();
        let mut renamed = Vec::new();
        let mut deleted = Vec::new();
        for record in self.changes_between(commit, &current)? {
            match record {
                ChangeRecord::Added { ref path } | ChangeRecord::Modified { ref path } => {
                    let Some(key) = self.object_key(path) else {
                        continue;
                    };
                    if let Some(bucket) = objects.get_mut(&key.content_type) {
                        bucket.push(self.load(path)?.to_json());
                    }
                }
                ChangeRecord::Renamed { .. } => renamed.push(record),
                ChangeRecord::Deleted { .. } => deleted.push(record),
            }
        }
        renamed.extend(deleted);
        Ok(PullSummary {
            objects,
            other: renamed,
            commit: current,
        })
    }

    /// Every object of every content type, with the head commit.
    #[instrument(skip(self), fields(store = %self.name()))]
    pub fn dump(&self) -> Result<StoreDump, StoreError> {
        let mut objects = BTreeMap::new();
        for content_type in self.list_content_types()? {
            let bodies = self
                .iterate(&content_type)?
                .map(|item| item.map(|obj| obj.to_json()))
                .collect::<Result<Vec<_>, _>>()?;
            objects.insert(content_type, bodies);
        }
        Ok(StoreDump {
            objects,
            commit: self.head_commit()?,
        })
    }

    pub fn summary(&self) -> Result<StoreSummary, StoreError> {
        let (commit, timestamp, author) = {
            let repo = self.repo();
            let commit = repo.head()?.peel_to_commit()?;
            let timestamp = chrono::DateTime::from_timestamp(commit.time().seconds(), 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default();
            let sig = commit.author();
            let author = format!(
                "{} <{}>",
                sig.name().unwrap_or(""),
                sig.email().unwrap_or("")
            );
            (commit.id().to_string(), timestamp, author)
        };
        Ok(StoreSummary {
            name: self.name(),
            branch: self.current_branch()?,
            commit,
            timestamp,
            author,
            schemas: self.list_schemas()?,
        })
    }

    // -----------------------------------------------------------------------
    // Remote sync
    // -----------------------------------------------------------------------

    /// Fetch and fast-forward the current branch.
    ///
    /// Returns `(old, new)` head commits; equal when already up to date.
    /// `old` is empty when the branch was unborn.
    #[instrument(skip(self), fields(store = %self.name()))]
    pub fn fast_forward(&self, remote: Option<&str>) -> Result<(String, String), StoreError> {
        let branch = self
            .current_branch()?
            .ok_or_else(|| StoreError::RefNotFound("HEAD is detached".into()))?;
        let refname = format!("refs/heads/{}", branch);
        let (old, new) = {
            let repo = self.repo();
            let remote_name = match remote {
                Some(name) => name.to_string(),
                None => default_remote(&repo, &refname)?,
            };
            info!(remote = %remote_name, branch = %branch, "fetching");
            repo.find_remote(&remote_name)?
                .fetch(&[] as &[&str], None, None)?;

            let tracking = format!("refs/remotes/{}/{}", remote_name, branch);
            let fetched = repo
                .find_reference(&tracking)
                .map_err(|_| StoreError::RefNotFound(tracking.clone()))?
                .peel_to_commit()?
                .id();
            let old = match repo.head() {
                Ok(head) => head.peel_to_commit()?.id().to_string(),
                Err(_) => String::new(),
            };
            let annotated = repo.find_annotated_commit(fetched)?;
            let (analysis, _) = repo.merge_analysis(&[&annotated])?;

            if analysis.is_up_to_date() {
                debug!("already up to date");
                return Ok((old.clone(), old));
            }
            if !(analysis.is_unborn() || analysis.is_fast_forward()) {
                return Err(StoreError::MergeConflict {
                    branch,
                    detail: format!("local and {} have diverged", tracking),
                });
            }
            let target = repo.find_commit(fetched)?;
            repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().force()))?;
            if analysis.is_unborn() {
                repo.reference(&refname, fetched, true, "gitindex: initial fast-forward")?;
            } else {
                repo.find_reference(&refname)?
                    .set_target(fetched, "gitindex: fast-forward")?;
            }
            repo.set_head(&refname)?;
            (old, fetched.to_string())
        };
        self.invalidate_schemas();
        info!(old = %old, new = %new, "fast-forwarded");
        Ok((old, new))
    }

    /// Remove the store's working tree and history from disk.
    pub fn teardown(self) -> Result<(), StoreError> {
        let root = self.root.clone();
        drop(self);
        info!(path = %root.display(), "removing store");
        std::fs::remove_dir_all(&root)?;
        Ok(())
    }
}

fn resolve_commit<'r>(repo: &'r Repository, spec: &str) -> Result<git2::Commit<'r>, StoreError> {
    repo.revparse_single(spec)
        .and_then(|obj| obj.peel_to_commit())
        .map_err(|_| StoreError::RefNotFound(spec.to_string()))
}

fn default_remote(repo: &Repository, refname: &str) -> Result<String, StoreError> {
    if let Ok(buf) = repo.branch_upstream_remote(refname) {
        if let Some(name) = buf.as_str() {
            return Ok(name.to_string());
        }
    }
    let remotes = repo.remotes()?;
    remotes
        .get(0)
        .map(str::to_string)
        .ok_or_else(|| StoreError::RefNotFound("no remote configured".into()))
}

fn commit_index(
    repo: &Repository,
    index: &mut git2::Index,
    author: &Author,
    message: &str,
) -> Result<String, StoreError> {
    let tree = repo.find_tree(index.write_tree()?)?;
    let sig = Signature::now(&author.name, &author.email)?;
    let parent = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(_) => None,
    };
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
    info!(sha = %oid, message, "created commit");
    Ok(oid.to_string())
}

fn read_object(content_type: &str, abs: &Path, display: &str) -> Result<ContentObject, StoreError> {
    let data = std::fs::read_to_string(abs)?;
    let invalid = |detail: String| StoreError::InvalidContent {
        path: display.to_string(),
        detail,
    };
    let value: Value = serde_json::from_str(&data).map_err(|e| invalid(e.to_string()))?;
    let stem = abs.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    ContentObject::from_json(content_type, stem, value).map_err(invalid)
}

/// Lazy sequence of the objects of one content type.
pub struct ObjectIter {
    content_type: String,
    entries: Option<ReadDir>,
}

impl Iterator for ObjectIter {
    type Item = Result<ContentObject, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.entries.as_mut()?;
        loop {
            let path = match entries.next()? {
                Ok(entry) => entry.path(),
                Err(e) => return Some(Err(e.into())),
            };
            if path.extension().and_then(|e| e.to_str()) != Some(layout::OBJECT_EXT) || !path.is_file() {
                continue;
            }
            let file = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            let display = format!("{}/{}", self.content_type, file);
            return Some(read_object(&self.content_type, &path, &display));
        }
    }
}
