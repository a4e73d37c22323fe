//! # Artifact Storage
//!
//! Local tarball storage shared by hosted repositories (published attachments)
//! and proxy repositories (cached downloads).
//!
//! ```text
//! {root}/{repository}/tarballs/{package}/{filename}
//! {root}/{repository}/tarballs/{package}/{filename}.sha1
//! ```
//!
//! The `.sha1` sidecar is written after the artifact itself, so an artifact
//! without a sidecar is treated as absent. Both are replaced atomically, so a
//! reader never sees a partial digest.

use crate::hash_utils::sha1_file;
use crate::metadata::model::PackageAttachment;
use crate::metadata::store::write_atomic;
use crate::tarball::Tarball;
use crate::validation::{validate_filename, validate_package_name};
use crate::{AppError, AppResult};
use std::path::{Path, PathBuf};

const SHA1_SUFFIX: &str = ".sha1";

/// A stored artifact and its recorded digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub sha1sum: String,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> AppResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn artifact_path(&self, repository_id: &str, package: &str, filename: &str) -> AppResult<PathBuf> {
        validate_filename(repository_id)?;
        validate_package_name(package)?;
        validate_filename(filename)?;
        Ok(self
            .root
            .join(repository_id)
            .join("tarballs")
            .join(package.replace('/', "%2f"))
            .join(filename))
    }

    /// The stored artifact, if present and complete.
    pub async fn get(
        &self,
        repository_id: &str,
        package: &str,
        filename: &str,
    ) -> AppResult<Option<StoredArtifact>> {
        let path = self.artifact_path(repository_id, package, filename)?;
        let sha1sum = match tokio::fs::read_to_string(sidecar(&path)).await {
            Ok(sha1sum) => sha1sum.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let length = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(StoredArtifact {
            path,
            sha1sum,
            length,
        }))
    }

    /// Move a validated download into the cache.
    pub async fn store_tarball(
        &self,
        repository_id: &str,
        package: &str,
        filename: &str,
        tarball: Tarball,
    ) -> AppResult<StoredArtifact> {
        let path = self.artifact_path(repository_id, package, filename)?;
        let parent = parent_dir(&path)?;
        tokio::fs::create_dir_all(parent).await?;

        let sha1sum = tarball.sha1sum().to_string();
        let length = tarball.length();
        let dest = path.clone();
        tokio::task::spawn_blocking(move || tarball.persist(&dest))
            .await
            .map_err(|e| AppError::InternalError(format!("Tarball persist task failed: {e}")))??;
        write_atomic(&sidecar(&path), sha1sum.as_bytes()).await?;

        tracing::info!(repository = %repository_id, package = %package, file = %filename, bytes = length, "Cached tarball");
        Ok(StoredArtifact {
            path,
            sha1sum,
            length,
        })
    }

    /// Copy a published attachment into storage, hashing the stored copy.
    pub async fn store_attachment(
        &self,
        repository_id: &str,
        package: &str,
        attachment: &PackageAttachment,
    ) -> AppResult<StoredArtifact> {
        let path = self.artifact_path(repository_id, package, attachment.name())?;
        let parent = parent_dir(&path)?;
        tokio::fs::create_dir_all(parent).await?;

        let staged = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(parent)?
            .into_temp_path();
        let length = tokio::fs::copy(attachment.path(), &staged).await?;
        let sha1sum = sha1_file(&staged)?;
        staged.persist(&path).map_err(|e| AppError::Io(e.error))?;
        write_atomic(&sidecar(&path), sha1sum.as_bytes()).await?;

        tracing::info!(repository = %repository_id, package = %package, file = %attachment.name(), bytes = length, "Stored attachment");
        Ok(StoredArtifact {
            path,
            sha1sum,
            length,
        })
    }
}

fn sidecar(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(SHA1_SUFFIX);
    PathBuf::from(name)
}

fn parent_dir(path: &Path) -> AppResult<&Path> {
    path.parent()
        .ok_or_else(|| AppError::InternalError(format!("no parent directory for {}", path.display())))
}
