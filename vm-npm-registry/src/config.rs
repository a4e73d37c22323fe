//! # Configuration Management
//!
//! Configuration for the npm registry server, loaded from a JSON document.
//!
//! - [`ServerConfig`]: bind address and the public base URL used when
//!   rewriting tarball links
//! - [`StorageConfig`]: data and temporary directories
//! - [`UpstreamConfig`]: HTTP client settings for remote registries
//! - [`LimitsConfig`]: request size limits
//! - [`RepositoryConfig`]: the hosted, proxy and group repositories to serve
//!
//! ```rust,no_run
//! # use vm_npm_registry::config::Config;
//! // Load from file with fallback to defaults
//! let config = Config::load_or_default("npm-registry.json")?;
//!
//! // Load from file (fails if file doesn't exist)
//! let config = Config::load("npm-registry.json")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{AppError, AppResult};
use crate::repository::RepositoryKind;
use crate::validation::validate_filename;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure for the registry server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Repositories in declaration order. Group members must be declared
    /// before the group.
    #[serde(default = "default_repositories")]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// URL scheme ("http" or "https")
    pub scheme: String,
    /// Base URL clients reach this server at, when it differs from
    /// `{scheme}://{host}:{port}` (reverse proxies, containers).
    #[serde(default)]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "0.0.0.0".to_string(),
            port: 3080,
            scheme: "http".to_string(),
            public_url: None,
        }
    }
}

impl ServerConfig {
    /// Base URL of this server without a trailing slash.
    pub fn public_base(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("{}://{}:{}", self.scheme, self.host, self.port),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for metadata records and artifacts
    pub data_dir: PathBuf,
    /// Directory for spooled downloads and extracted attachments.
    /// Defaults to `{data_dir}/tmp`.
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            data_dir: PathBuf::from("./data"),
            temp_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("tmp"))
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

/// HTTP client settings for remote registries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        UpstreamConfig {
            timeout_secs: 30,
            user_agent: format!("vm-npm-registry/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Largest accepted publish document, attachments included
    pub max_request_body_size_mb: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_request_body_size_mb: 150,
        }
    }
}

/// One configured repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepositoryConfig {
    pub id: String,
    pub kind: RepositoryKind,
    /// Remote registry base URL (proxy only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
    /// Minutes a proxied package record stays fresh
    #[serde(default = "default_max_age_minutes")]
    pub metadata_max_age_minutes: i64,
    /// Member repository ids in delegation order (group only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

impl RepositoryConfig {
    pub fn hosted(id: &str) -> Self {
        RepositoryConfig {
            id: id.to_string(),
            kind: RepositoryKind::Hosted,
            remote_url: None,
            metadata_max_age_minutes: default_max_age_minutes(),
            members: Vec::new(),
        }
    }

    pub fn proxy(id: &str, remote_url: &str) -> Self {
        RepositoryConfig {
            id: id.to_string(),
            kind: RepositoryKind::Proxy,
            remote_url: Some(remote_url.to_string()),
            metadata_max_age_minutes: default_max_age_minutes(),
            members: Vec::new(),
        }
    }

    pub fn group(id: &str, members: &[&str]) -> Self {
        RepositoryConfig {
            id: id.to_string(),
            kind: RepositoryKind::Group,
            remote_url: None,
            metadata_max_age_minutes: default_max_age_minutes(),
            members: members.iter().map(|m| m.to_string()).collect(),
        }
    }
}

fn default_max_age_minutes() -> i64 {
    30
}

fn default_repositories() -> Vec<RepositoryConfig> {
    vec![
        RepositoryConfig::hosted("npm-hosted"),
        RepositoryConfig::proxy("npm-proxy", "https://registry.npmjs.org"),
        RepositoryConfig::group("npm", &["npm-hosted", "npm-proxy"]),
    ]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            upstream: UpstreamConfig::default(),
            limits: LimitsConfig::default(),
            repositories: default_repositories(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config_str = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, or use defaults when it doesn't exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn max_request_body_size_bytes(&self) -> usize {
        self.limits.max_request_body_size_mb * 1024 * 1024
    }

    pub fn repository(&self, id: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|r| r.id == id)
    }

    /// Check repository declarations for consistency.
    pub fn validate(&self) -> AppResult<()> {
        let mut declared = HashSet::new();
        for repo in &self.repositories {
            validate_filename(&repo.id)
                .map_err(|e| invalid(format!("repository id '{}': {e}", repo.id)))?;
            if repo.id.starts_with('-') {
                return Err(invalid(format!("repository id '{}' must not start with '-'", repo.id)));
            }
            if !declared.insert(repo.id.as_str()) {
                return Err(invalid(format!("duplicate repository id '{}'", repo.id)));
            }
            if repo.metadata_max_age_minutes < 0 {
                return Err(invalid(format!(
                    "repository '{}' has a negative metadata_max_age_minutes",
                    repo.id
                )));
            }

            match repo.kind {
                RepositoryKind::Hosted => {}
                RepositoryKind::Proxy => {
                    let remote = repo
                        .remote_url
                        .as_deref()
                        .ok_or_else(|| invalid(format!("proxy '{}' has no remote_url", repo.id)))?;
                    let url = url::Url::parse(remote)
                        .map_err(|e| invalid(format!("proxy '{}' remote_url: {e}", repo.id)))?;
                    if !matches!(url.scheme(), "http" | "https") {
                        return Err(invalid(format!(
                            "proxy '{}' remote_url must be http or https",
                            repo.id
                        )));
                    }
                }
                RepositoryKind::Group => {
                    for member in &repo.members {
                        if member == &repo.id || !declared.contains(member.as_str()) {
                            return Err(invalid(format!(
                                "group '{}' member '{member}' must be declared before the group",
                                repo.id
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: String) -> AppError {
    AppError::BadRequest(format!("Invalid configuration: {message}"))
}
