//! # npm Repositories
//!
//! [`NpmRepository`] is what the serving boundary talks to. A request path is
//! first classified as package coordinates and answered by the repository's
//! [`MetadataService`]; paths that are not coordinates are tried as tarball
//! paths (`/{name}/-/{file}.tgz`).
//!
//! - **Hosted** repositories serve published attachments from artifact storage.
//! - **Proxy** repositories resolve the requested file against the raw package
//!   root, serve a cached copy whose SHA1 matches `dist.shasum`, and otherwise
//!   fetch through their [`TarballSource`] into the cache.
//! - **Group** repositories serve metadata through their group service and
//!   tarballs from the first member that has them.

use crate::artifacts::{ArtifactStore, StoredArtifact};
use crate::content::{Content, TARBALL_MIME_TYPE};
use crate::metadata::generator::MetadataGenerator;
use crate::metadata::model::{PackageRoot, PackageVersion};
use crate::metadata::parser::MetadataParser;
use crate::metadata::service::{GroupMetadataService, MetadataService, ProxyMetadataService};
use crate::request::PackageRequest;
use crate::tarball::{TarballRequest, TarballSource};
use crate::{AppError, AppResult};
use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};

/// Kind of repository, as configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryKind {
    Hosted,
    Proxy,
    Group,
}

impl RepositoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryKind::Hosted => "hosted",
            RepositoryKind::Proxy => "proxy",
            RepositoryKind::Group => "group",
        }
    }
}

enum Backend {
    Hosted {
        generator: Arc<MetadataGenerator>,
        artifacts: ArtifactStore,
    },
    Proxy {
        service: Arc<ProxyMetadataService>,
        tarballs: Arc<dyn TarballSource>,
        artifacts: ArtifactStore,
    },
    Group {
        members: Vec<Arc<NpmRepository>>,
    },
}

pub struct NpmRepository {
    id: String,
    metadata: MetadataService,
    backend: Backend,
}

/// `(package name, tarball filename)` of a tarball path, or `None`.
pub fn parse_tarball_path(path: &str) -> Option<(String, String)> {
    static TARBALL_PATH_REGEX: OnceLock<Regex> = OnceLock::new();
    let re = TARBALL_PATH_REGEX.get_or_init(|| {
        Regex::new(r"^/((?:@[A-Za-z0-9_.~-]+/)?[A-Za-z0-9_.~-]+)/-/([A-Za-z0-9_.~-]+\.tgz)$")
            .unwrap_or_else(|e| panic!("Failed to compile tarball path regex: {}", e))
    });
    let normalized = path.replace("%2f", "/").replace("%2F", "/");
    let captures = re.captures(&normalized)?;
    Some((captures[1].to_string(), captures[2].to_string()))
}

/// Version whose distribution URL ends with `filename`.
///
/// Suffix matching: a filename that is a suffix of several URLs resolves to
/// the first such version in document order.
pub fn find_tarball_version<'a>(root: &'a PackageRoot, filename: &str) -> Option<&'a PackageVersion> {
    root.versions().values().find(|version| {
        version
            .dist_tarball()
            .is_some_and(|tarball| tarball.ends_with(filename))
    })
}

fn artifact_content(artifact: StoredArtifact) -> Content {
    Content::file(TARBALL_MIME_TYPE, artifact.path, artifact.length)
}

impl NpmRepository {
    pub fn hosted(generator: Arc<MetadataGenerator>, artifacts: ArtifactStore) -> Self {
        Self {
            id: generator.repository_id().to_string(),
            metadata: MetadataService::Hosted(generator.clone()),
            backend: Backend::Hosted {
                generator,
                artifacts,
            },
        }
    }

    pub fn proxy(
        service: Arc<ProxyMetadataService>,
        tarballs: Arc<dyn TarballSource>,
        artifacts: ArtifactStore,
    ) -> Self {
        Self {
            id: service.repository_id().to_string(),
            metadata: MetadataService::Proxy(service.clone()),
            backend: Backend::Proxy {
                service,
                tarballs,
                artifacts,
            },
        }
    }

    /// Group delegating to `members` in order.
    pub fn group(
        id: &str,
        members: Vec<Arc<NpmRepository>>,
        parser: MetadataParser,
        tarball_base: Option<String>,
    ) -> Self {
        let member_services = members.iter().map(|m| m.metadata.clone()).collect();
        let mut service = GroupMetadataService::new(id, member_services, parser);
        if let Some(base) = tarball_base {
            service = service.with_tarball_base(base);
        }
        Self {
            id: id.to_string(),
            metadata: MetadataService::Group(Arc::new(service)),
            backend: Backend::Group { members },
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> RepositoryKind {
        match self.backend {
            Backend::Hosted { .. } => RepositoryKind::Hosted,
            Backend::Proxy { .. } => RepositoryKind::Proxy,
            Backend::Group { .. } => RepositoryKind::Group,
        }
    }

    pub fn metadata(&self) -> &MetadataService {
        &self.metadata
    }

    /// Content for a repository-relative path, `None` when there is none.
    pub async fn retrieve(&self, path: &str) -> AppResult<Option<Content>> {
        match PackageRequest::parse(path) {
            Ok(request) => self.metadata.produce(&request).await,
            Err(e) if e.is_invalid_input() => self.retrieve_tarball(path).await,
            Err(e) => Err(e),
        }
    }

    /// Serve a tarball path. Anything that is not one is "no content".
    pub fn retrieve_tarball<'a>(&'a self, path: &'a str) -> BoxFuture<'a, AppResult<Option<Content>>> {
        async move {
            let Some((package, filename)) = parse_tarball_path(path) else {
                tracing::debug!(repository = %self.id, path = %path, "Not a package or tarball path");
                return Ok(None);
            };
            match &self.backend {
                Backend::Hosted { artifacts, .. } => Ok(artifacts
                    .get(&self.id, &package, &filename)
                    .await?
                    .map(artifact_content)),
                Backend::Proxy {
                    service,
                    tarballs,
                    artifacts,
                } => {
                    self.retrieve_proxy_tarball(service, tarballs.as_ref(), artifacts, &package, &filename)
                        .await
                }
                Backend::Group { members } => {
                    for member in members {
                        if let Some(content) = member.retrieve_tarball(path).await? {
                            return Ok(Some(content));
                        }
                    }
                    Ok(None)
                }
            }
        }
        .boxed()
    }

    async fn retrieve_proxy_tarball(
        &self,
        service: &ProxyMetadataService,
        tarballs: &dyn TarballSource,
        artifacts: &ArtifactStore,
        package: &str,
        filename: &str,
    ) -> AppResult<Option<Content>> {
        let Some(root) = service.generate_raw_package_root(package).await? else {
            return Ok(None);
        };
        let Some(version) = find_tarball_version(&root, filename) else {
            tracing::debug!(repository = %self.id, package = %package, file = %filename, "No version matches tarball");
            return Ok(None);
        };
        if version.is_incomplete() {
            tracing::debug!(repository = %self.id, package = %package, version = %version.version(), "Matched version is incomplete, no tarball to fetch");
            return Ok(None);
        }

        if let Some(cached) = artifacts.get(&self.id, package, filename).await? {
            if version
                .dist_shasum()
                .is_some_and(|shasum| shasum.eq_ignore_ascii_case(&cached.sha1sum))
            {
                tracing::debug!(repository = %self.id, package = %package, file = %filename, "Serving cached tarball");
                return Ok(Some(artifact_content(cached)));
            }
        }

        let request = TarballRequest {
            repository_id: self.id.clone(),
            package_version: version.clone(),
            target_file: filename.to_string(),
        };
        let Some(tarball) = tarballs.get(&request).await? else {
            return Ok(None);
        };
        let stored = artifacts
            .store_tarball(&self.id, package, filename, tarball)
            .await?;
        Ok(Some(artifact_content(stored)))
    }

    /// Publish a package document into a hosted repository.
    ///
    /// Attachments are persisted to artifact storage and their SHA1 fills any
    /// missing `dist.shasum` of the version they belong to.
    pub async fn publish(&self, package: &str, body: Bytes) -> AppResult<PackageRoot> {
        let Backend::Hosted {
            generator,
            artifacts,
        } = &self.backend
        else {
            return Err(AppError::BadRequest(format!(
                "Repository '{}' does not accept publishes",
                self.id
            )));
        };

        let mut root = generator.parse_package_root(body).await?;
        if root.name() != package {
            return Err(AppError::BadRequest(format!(
                "Package document '{}' published to '{package}'",
                root.name()
            )));
        }

        for attachment in root.attachments().values().cloned().collect::<Vec<_>>() {
            let stored = artifacts
                .store_attachment(&self.id, root.name(), &attachment)
                .await?;
            let unsummed: Vec<PackageVersion> = root
                .versions()
                .values()
                .filter(|v| v.tarball_filename() == Some(attachment.name()) && v.dist_shasum().is_none())
                .map(|v| v.with_dist_shasum(&stored.sha1sum))
                .collect();
            for version in unsummed {
                root = root.with_version(version);
            }
        }

        let merged = generator.overlay_package_root(&root).await?;
        tracing::info!(repository = %self.id, package = %package, attachments = root.attachments().len(), "Package published");
        Ok(merged)
    }

    /// Expire cached metadata addressed by `path`.
    pub async fn expire_caches(&self, path: &str) -> AppResult<bool> {
        let request = PackageRequest::parse(path)?;
        self.metadata.expire_metadata_caches(&request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pkg_root() -> PackageRoot {
        let doc = json!({
            "name": "pkg",
            "versions": {
                "0.0.1": {
                    "name": "pkg",
                    "version": "0.0.1",
                    "dist": { "tarball": "https://registry.npmjs.org/pkg/-/pkg-0.0.1.tgz" }
                },
                "0.0.2": {
                    "name": "pkg",
                    "version": "0.0.2",
                    "dist": { "tarball": "https://registry.npmjs.org/pkg/-/pkg-0.0.2.tgz" }
                }
            }
        });
        PackageRoot::from_raw("proxy", doc.as_object().unwrap().clone()).unwrap()
    }

    #[test]
    fn test_parse_tarball_path() {
        assert_eq!(
            parse_tarball_path("/pkg/-/pkg-0.0.2.tgz"),
            Some(("pkg".to_string(), "pkg-0.0.2.tgz".to_string()))
        );
        assert_eq!(
            parse_tarball_path("/@types/node/-/node-20.1.0.tgz"),
            Some(("@types/node".to_string(), "node-20.1.0.tgz".to_string()))
        );
        assert_eq!(
            parse_tarball_path("/@types%2fnode/-/node-20.1.0.tgz"),
            Some(("@types/node".to_string(), "node-20.1.0.tgz".to_string()))
        );
        assert_eq!(parse_tarball_path("/pkg/-/pkg-0.0.2.zip"), None);
        assert_eq!(parse_tarball_path("/pkg/pkg-0.0.2.tgz"), None);
        assert_eq!(parse_tarball_path("/a/b/-/c.tgz"), None);
    }

    #[test]
    fn test_find_tarball_version() {
        let root = pkg_root();
        assert_eq!(
            find_tarball_version(&root, "pkg-0.0.2.tgz").map(PackageVersion::version),
            Some("0.0.2")
        );
        assert_eq!(
            find_tarball_version(&root, "pkg-0.0.1.tgz").map(PackageVersion::version),
            Some("0.0.1")
        );
        assert!(find_tarball_version(&root, "pkg-9.9.9.tgz").is_none());
    }

    #[test]
    fn test_find_tarball_version_is_suffix_match() {
        let root = pkg_root();
        assert_eq!(
            find_tarball_version(&root, "0.0.2.tgz").map(PackageVersion::version),
            Some("0.0.2")
        );
    }
}
