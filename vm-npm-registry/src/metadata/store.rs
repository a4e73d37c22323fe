//! # Metadata Store
//!
//! Durable per-repository package records. [`MetadataStore`] is the contract
//! the metadata services rely on; [`FileMetadataStore`] keeps one JSON
//! document per package next to a small freshness record.
//!
//! ## Layout
//!
//! ```text
//! {root}/{repository}/packages/{name}.json        stored package document
//! {root}/{repository}/packages/{name}.state.json  freshness record
//! ```
//!
//! Scoped names store their `/` as `%2f`. Documents are replaced atomically
//! (temp file + rename) and all writers of one (repository, name) pair are
//! serialized on a per-key lock, so an overlay always merges onto the latest
//! committed record.

use super::model::PackageRoot;
use crate::validation::{validate_filename, validate_package_name};
use crate::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const DOCUMENT_SUFFIX: &str = ".json";
const STATE_SUFFIX: &str = ".state.json";

/// Freshness record of a stored package, kept apart from the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageState {
    /// When the record was last confirmed against its source.
    pub checked_at: DateTime<Utc>,
    /// Explicitly marked stale.
    pub expired: bool,
}

impl PackageState {
    pub fn fresh_now() -> Self {
        Self {
            checked_at: Utc::now(),
            expired: false,
        }
    }
}

/// Which packages an expiry applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireScope<'a> {
    Package(&'a str),
    All,
}

/// Persistence contract of the metadata services.
///
/// Absent records are `Ok(None)`; every `Err` is a store fault.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_package_by_name(
        &self,
        repository_id: &str,
        name: &str,
    ) -> AppResult<Option<PackageRoot>>;

    async fn package_state(&self, repository_id: &str, name: &str)
        -> AppResult<Option<PackageState>>;

    async fn list_package_names(&self, repository_id: &str) -> AppResult<BTreeSet<String>>;

    /// Overlay `root` onto the stored record (or store it as-is when there is
    /// none), mark it fresh and return the committed result.
    async fn put_or_overlay(&self, repository_id: &str, root: &PackageRoot)
        -> AppResult<PackageRoot>;

    /// Confirm the stored record without rewriting the document.
    async fn mark_fresh(&self, repository_id: &str, name: &str) -> AppResult<()>;

    /// Mark package(s) stale without deleting data. Returns whether any
    /// stored record was marked.
    async fn expire(&self, repository_id: &str, scope: ExpireScope<'_>) -> AppResult<bool>;

    async fn remove_package(&self, repository_id: &str, name: &str) -> AppResult<bool>;
}

/// File-system backed [`MetadataStore`].
#[derive(Debug)]
pub struct FileMetadataStore {
    root: PathBuf,
    locks: LockTable,
}

impl FileMetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn packages_dir(&self, repository_id: &str) -> AppResult<PathBuf> {
        validate_filename(repository_id)?;
        Ok(self.root.join(repository_id).join("packages"))
    }

    fn record_paths(&self, repository_id: &str, name: &str) -> AppResult<(PathBuf, PathBuf)> {
        validate_package_name(name)?;
        let dir = self.packages_dir(repository_id)?;
        let key = encode_name(name);
        Ok((
            dir.join(format!("{key}{DOCUMENT_SUFFIX}")),
            dir.join(format!("{key}{STATE_SUFFIX}")),
        ))
    }

    /// Serialize writers of one (repository, name) pair. The table entry is
    /// dropped again once no task holds or awaits it.
    async fn lock_key(&self, repository_id: &str, name: &str) -> AppResult<KeyGuard<'_>> {
        let key = format!("{repository_id}:{name}");
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| AppError::Store("package lock table poisoned".to_string()))?;
            locks.entry(key.clone()).or_default().clone()
        };
        Ok(KeyGuard {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        })
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }

    async fn read_document(&self, repository_id: &str, path: &Path) -> AppResult<Option<PackageRoot>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let document: Map<String, Value> = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Store(format!("corrupt package record {}: {e}", path.display()))
        })?;
        let root = PackageRoot::from_raw(repository_id, document).map_err(|e| {
            AppError::Store(format!("corrupt package record {}: {e}", path.display()))
        })?;
        Ok(Some(root))
    }

    async fn read_state(&self, path: &Path) -> AppResult<Option<PackageState>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| AppError::Store(format!("corrupt state record {}: {e}", path.display())))
    }

    async fn write_state(&self, path: &Path, state: &PackageState) -> AppResult<()> {
        write_atomic(path, &serde_json::to_vec(state)?).await
    }

    async fn expire_one(&self, repository_id: &str, name: &str) -> AppResult<bool> {
        let (document_path, state_path) = self.record_paths(repository_id, name)?;
        let _guard = self.lock_key(repository_id, name).await?;

        if !tokio::fs::try_exists(&document_path).await? {
            return Ok(false);
        }
        let state = match self.read_state(&state_path).await? {
            Some(state) => PackageState {
                expired: true,
                ..state
            },
            None => PackageState {
                checked_at: Utc::now(),
                expired: true,
            },
        };
        self.write_state(&state_path, &state).await?;
        Ok(true)
    }
}

type LockTable = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

/// Held per-key lock; releasing it prunes the table entry when unused.
struct KeyGuard<'a> {
    locks: &'a LockTable,
    key: String,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        // the table's own reference is the last one once the guard is gone
        self.guard.take();
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    async fn get_package_by_name(
        &self,
        repository_id: &str,
        name: &str,
    ) -> AppResult<Option<PackageRoot>> {
        let (document_path, _) = self.record_paths(repository_id, name)?;
        self.read_document(repository_id, &document_path).await
    }

    async fn package_state(
        &self,
        repository_id: &str,
        name: &str,
    ) -> AppResult<Option<PackageState>> {
        let (_, state_path) = self.record_paths(repository_id, name)?;
        self.read_state(&state_path).await
    }

    async fn list_package_names(&self, repository_id: &str) -> AppResult<BTreeSet<String>> {
        let dir = self.packages_dir(repository_id)?;
        let mut names = BTreeSet::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.ends_with(STATE_SUFFIX) || file_name.starts_with('.') {
                continue;
            }
            if let Some(key) = file_name.strip_suffix(DOCUMENT_SUFFIX) {
                names.insert(decode_name(key));
            }
        }
        Ok(names)
    }

    async fn put_or_overlay(
        &self,
        repository_id: &str,
        root: &PackageRoot,
    ) -> AppResult<PackageRoot> {
        if root.repository_id() != repository_id {
            return Err(AppError::BadRequest(format!(
                "Package '{}' belongs to repository '{}', not '{}'",
                root.name(),
                root.repository_id(),
                repository_id
            )));
        }
        let (document_path, state_path) = self.record_paths(repository_id, root.name())?;
        let _guard = self.lock_key(repository_id, root.name()).await?;

        let merged = match self.read_document(repository_id, &document_path).await? {
            Some(stored) => stored.overlay(root),
            None => root.clone(),
        };
        let document = serde_json::to_vec(&Value::Object(merged.to_stored_document()))?;
        write_atomic(&document_path, &document).await?;
        self.write_state(&state_path, &PackageState::fresh_now()).await?;

        tracing::debug!(
            repository = %repository_id,
            package = %merged.name(),
            versions = merged.versions().len(),
            "Stored package root"
        );
        Ok(merged)
    }

    async fn mark_fresh(&self, repository_id: &str, name: &str) -> AppResult<()> {
        let (_, state_path) = self.record_paths(repository_id, name)?;
        let _guard = self.lock_key(repository_id, name).await?;
        self.write_state(&state_path, &PackageState::fresh_now()).await
    }

    async fn expire(&self, repository_id: &str, scope: ExpireScope<'_>) -> AppResult<bool> {
        let marked = match scope {
            ExpireScope::Package(name) => self.expire_one(repository_id, name).await?,
            ExpireScope::All => {
                let mut marked = false;
                for name in self.list_package_names(repository_id).await? {
                    marked |= self.expire_one(repository_id, &name).await?;
                }
                marked
            }
        };
        tracing::info!(repository = %repository_id, scope = ?scope, marked, "Expired package metadata");
        Ok(marked)
    }

    async fn remove_package(&self, repository_id: &str, name: &str) -> AppResult<bool> {
        let (document_path, state_path) = self.record_paths(repository_id, name)?;
        let _guard = self.lock_key(repository_id, name).await?;

        let removed = match tokio::fs::remove_file(&document_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_file(&state_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if removed {
            tracing::info!(repository = %repository_id, package = %name, "Removed package record");
        }
        Ok(removed)
    }
}

fn encode_name(name: &str) -> String {
    name.replace('/', "%2f")
}

fn decode_name(key: &str) -> String {
    key.replace("%2f", "/")
}

/// Replace `path` with `bytes` so readers see either the old or new content.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| AppError::Store(format!("no parent directory for {}", path.display())))?;
    tokio::fs::create_dir_all(dir).await?;
    let temp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)?
        .into_temp_path();
    tokio::fs::write(&temp, bytes).await?;
    temp.persist(path).map_err(|e| AppError::Io(e.error))?;
    Ok(())
}
