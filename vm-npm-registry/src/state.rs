//! # Application State Management
//!
//! Shared state of the registry server: the configuration and the
//! repositories built from it.
//!
//! ## Key Types
//!
//! - [`AppState`]: configuration plus the repositories by id
//! - [`SuccessResponse`]: standardized success response for API endpoints
//!
//! ## Usage
//!
//! ```rust,no_run
//! use vm_npm_registry::{AppState, Config};
//!
//! let state = AppState::from_config(Config::default())?;
//! let repository = state.repository("npm")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Tests substitute the remote collaborators with [`AppState::with_remotes`].

use crate::artifacts::ArtifactStore;
use crate::config::{Config, RepositoryConfig, UpstreamConfig};
use crate::metadata::{
    FileMetadataStore, HttpMetadataTransport, MetadataGenerator, MetadataParser,
    ProxyMetadataService, ProxyMetadataTransport,
};
use crate::repository::{NpmRepository, RepositoryKind};
use crate::tarball::{HttpTarballSource, TarballSource};
use crate::{AppError, AppResult};
use indexmap::IndexMap;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Application state containing shared configuration and resources.
///
/// Cloning is cheap; every field is reference counted.
///
/// # Fields
///
/// * `config` - Application configuration
/// * `server_addr` - Public base URL (scheme://host:port) used when rewriting tarball URLs
/// * `repositories` - Configured repositories in declaration order
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub server_addr: String,
    pub repositories: Arc<IndexMap<String, Arc<NpmRepository>>>,
}

/// Standardized success response for API consistency.
///
/// Serializes to: `{"message": "Operation completed successfully"}`
#[derive(Serialize)]
pub struct SuccessResponse {
    /// Human-readable success message describing the completed operation
    pub message: String,
}

/// HTTP client shared by metadata and tarball fetches.
pub fn build_http_client(config: &UpstreamConfig) -> AppResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(&config.user_agent)
        .build()
        .map_err(|e| AppError::InternalError(format!("Failed to create HTTP client: {e}")))
}

impl AppState {
    /// Build the state with HTTP remotes.
    pub fn from_config(config: Config) -> AppResult<Self> {
        let client = build_http_client(&config.upstream)?;
        let parser = MetadataParser::new(config.storage.temp_dir())?;
        let transport = Arc::new(HttpMetadataTransport::new(client.clone(), parser));
        let tarballs = Arc::new(HttpTarballSource::new(client, config.storage.temp_dir())?);
        Self::with_remotes(config, transport, tarballs)
    }

    /// Build the state with the given remote collaborators.
    pub fn with_remotes(
        config: Config,
        transport: Arc<dyn ProxyMetadataTransport>,
        tarballs: Arc<dyn TarballSource>,
    ) -> AppResult<Self> {
        config.validate()?;
        let server_addr = config.server.public_base();
        let parser = MetadataParser::new(config.storage.temp_dir())?;
        let store = Arc::new(FileMetadataStore::new(config.storage.metadata_dir())?);
        let artifacts = ArtifactStore::new(config.storage.artifacts_dir())?;

        let mut repositories: IndexMap<String, Arc<NpmRepository>> = IndexMap::new();
        for repo in &config.repositories {
            let tarball_base = format!("{server_addr}/{}", repo.id);
            let repository = match repo.kind {
                RepositoryKind::Hosted => {
                    let generator = MetadataGenerator::new(&repo.id, store.clone(), parser.clone());
                    NpmRepository::hosted(Arc::new(generator), artifacts.clone())
                }
                RepositoryKind::Proxy => {
                    let generator = MetadataGenerator::new(&repo.id, store.clone(), parser.clone());
                    let service = ProxyMetadataService::new(
                        generator,
                        remote_url(repo)?,
                        transport.clone(),
                        max_age(repo)?,
                    )
                    .with_tarball_base(tarball_base);
                    NpmRepository::proxy(Arc::new(service), tarballs.clone(), artifacts.clone())
                }
                RepositoryKind::Group => {
                    let members = repo
                        .members
                        .iter()
                        .map(|member| {
                            repositories.get(member).cloned().ok_or_else(|| {
                                AppError::BadRequest(format!(
                                    "Group '{}' references unknown member '{member}'",
                                    repo.id
                                ))
                            })
                        })
                        .collect::<AppResult<Vec<_>>>()?;
                    NpmRepository::group(&repo.id, members, parser.clone(), Some(tarball_base))
                }
            };
            tracing::debug!(repository = %repo.id, kind = repo.kind.as_str(), "Repository configured");
            repositories.insert(repo.id.clone(), Arc::new(repository));
        }

        Ok(Self {
            config: Arc::new(config),
            server_addr,
            repositories: Arc::new(repositories),
        })
    }

    /// Repository by id, [`AppError::NotFound`] when not configured.
    pub fn repository(&self, id: &str) -> AppResult<Arc<NpmRepository>> {
        self.repositories
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Repository '{id}' not found")))
    }
}

fn remote_url(repo: &RepositoryConfig) -> AppResult<&str> {
    repo.remote_url
        .as_deref()
        .ok_or_else(|| AppError::BadRequest(format!("Proxy '{}' has no remote_url", repo.id)))
}

fn max_age(repo: &RepositoryConfig) -> AppResult<chrono::Duration> {
    chrono::Duration::try_minutes(repo.metadata_max_age_minutes).ok_or_else(|| {
        AppError::BadRequest(format!(
            "Repository '{}' metadata_max_age_minutes is out of range",
            repo.id
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(temp: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = temp.path().join("data");
        config.server.public_url = Some("http://registry.test".to_string());
        config
    }

    #[test]
    fn test_builds_default_repositories() {
        let temp = TempDir::new().unwrap();
        let state = AppState::from_config(config(&temp)).unwrap();

        let kinds: Vec<(&str, RepositoryKind)> = state
            .repositories
            .values()
            .map(|r| (r.id(), r.kind()))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("npm-hosted", RepositoryKind::Hosted),
                ("npm-proxy", RepositoryKind::Proxy),
                ("npm", RepositoryKind::Group),
            ]
        );
        assert_eq!(state.server_addr, "http://registry.test");
        assert!(temp.path().join("data/metadata").is_dir());
        assert!(temp.path().join("data/tmp").is_dir());
    }

    #[test]
    fn test_unknown_repository() {
        let temp = TempDir::new().unwrap();
        let state = AppState::from_config(config(&temp)).unwrap();
        let err = state.repository("pypi").err().unwrap();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = config(&temp);
        config.repositories = vec![RepositoryConfig::group("npm", &["missing"])];
        assert!(AppState::from_config(config).is_err());
    }
}
