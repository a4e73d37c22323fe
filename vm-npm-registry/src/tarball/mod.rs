//! # Tarball Retrieval
//!
//! A [`TarballSource`] fetches the artifact a [`PackageVersion`] points at and
//! hands back a [`Tarball`] backed by a fresh temporary file. Before a tarball
//! is returned it passes the validator chain in [`validator`]; a rejected
//! download is deleted and reported as "not available" (`Ok(None)`).

use crate::metadata::model::PackageVersion;
use crate::AppResult;
use async_trait::async_trait;
use std::path::Path;
use tempfile::TempPath;

mod http;
pub mod validator;

pub use http::HttpTarballSource;
pub use validator::{default_validators, run_validators, ValidationResult, Validator};

/// One artifact fetch: which repository asks, for which version, for which file.
#[derive(Debug, Clone)]
pub struct TarballRequest {
    pub repository_id: String,
    pub package_version: PackageVersion,
    pub target_file: String,
}

/// A downloaded artifact. The backing file is deleted on drop unless persisted.
#[derive(Debug)]
pub struct Tarball {
    file: TempPath,
    sha1sum: String,
    length: u64,
    origin_url: String,
    package_version: PackageVersion,
}

impl Tarball {
    pub fn new(
        file: TempPath,
        sha1sum: String,
        length: u64,
        origin_url: String,
        package_version: PackageVersion,
    ) -> Self {
        Self {
            file,
            sha1sum,
            length,
            origin_url,
            package_version,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file
    }

    /// SHA1 of the bytes as received.
    pub fn sha1sum(&self) -> &str {
        &self.sha1sum
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn origin_url(&self) -> &str {
        &self.origin_url
    }

    pub fn package_version(&self) -> &PackageVersion {
        &self.package_version
    }

    /// Move the file to `dest`, copying when a rename is not possible
    /// (temp dir on another filesystem).
    pub fn persist(self, dest: &Path) -> AppResult<()> {
        match self.file.persist(dest) {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::debug!(error = %e.error, dest = %dest.display(), "Rename failed, copying tarball");
                std::fs::copy(&e.path, dest)?;
                Ok(())
            }
        }
    }
}

/// Fetches tarballs for proxy repositories.
#[async_trait]
pub trait TarballSource: Send + Sync {
    /// The validated tarball, or `None` when the remote does not have it or it
    /// failed validation. Incomplete versions are invalid input.
    async fn get(&self, request: &TarballRequest) -> AppResult<Option<Tarball>>;
}
