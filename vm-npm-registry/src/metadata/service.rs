//! # Metadata Services
//!
//! [`MetadataService`] is the one capability every repository kind exposes:
//! produce the registry root, a package root or a package version, and (for
//! hosted repositories) consume a published package root.
//!
//! ## Proxy freshness
//!
//! Each (repository, package) pair of a proxy is in one of three states:
//!
//! - **absent**: nothing stored. The remote is fetched unconditionally and a
//!   result is overlaid into the store. A failed fetch is "no content".
//! - **fresh**: stored complete and confirmed within the repository's freshness
//!   horizon. Served from the store without a remote call.
//! - **stale**: explicitly expired, past the horizon, or holding placeholder
//!   versions. The remote is fetched
//!   conditionally with the stored validators. "Unchanged" only refreshes the
//!   freshness record, new content is overlaid, and a failed fetch serves the
//!   stale copy.
//!
//! Store faults always propagate.

use super::cursor::PackageRootCursor;
use super::generator::MetadataGenerator;
use super::model::PackageRoot;
use super::parser::MetadataParser;
use super::store::{ExpireScope, MetadataStore, PackageState};
use super::transport::{FetchOutcome, ProxyMetadataTransport, RemoteRegistry};
use crate::content::Content;
use crate::request::{PackageRequest, REGISTRY_ALL};
use crate::{AppError, AppResult};
use chrono::{Duration, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use std::sync::Arc;

#[derive(Clone)]
pub enum MetadataService {
    Hosted(Arc<MetadataGenerator>),
    Proxy(Arc<ProxyMetadataService>),
    Group(Arc<GroupMetadataService>),
}

impl MetadataService {
    pub fn repository_id(&self) -> &str {
        match self {
            MetadataService::Hosted(generator) => generator.repository_id(),
            MetadataService::Proxy(proxy) => proxy.repository_id(),
            MetadataService::Group(group) => &group.repository_id,
        }
    }

    fn parser(&self) -> &MetadataParser {
        match self {
            MetadataService::Hosted(generator) => generator.parser(),
            MetadataService::Proxy(proxy) => proxy.generator.parser(),
            MetadataService::Group(group) => &group.parser,
        }
    }

    /// Base that served tarball URLs are rewritten to, if any.
    fn tarball_base(&self) -> Option<&str> {
        match self {
            MetadataService::Hosted(_) => None,
            MetadataService::Proxy(proxy) => proxy.tarball_base.as_deref(),
            MetadataService::Group(group) => group.tarball_base.as_deref(),
        }
    }

    /// Raw-form package root, untranslated and with upstream tarball URLs.
    pub fn package_root<'a>(&'a self, name: &'a str) -> BoxFuture<'a, AppResult<Option<PackageRoot>>> {
        async move {
            match self {
                MetadataService::Hosted(generator) => generator.package_root(name).await,
                MetadataService::Proxy(proxy) => proxy.generate_raw_package_root(name).await,
                MetadataService::Group(group) => {
                    for member in &group.members {
                        if let Some(root) = member.package_root(name).await? {
                            return Ok(Some(root));
                        }
                    }
                    Ok(None)
                }
            }
        }
        .boxed()
    }

    /// Raw-form lazy registry root. Never triggers a remote fetch.
    pub fn registry_root(&self) -> BoxFuture<'_, AppResult<PackageRootCursor>> {
        async move {
            match self {
                MetadataService::Hosted(generator) => generator.registry_root().await,
                MetadataService::Proxy(proxy) => proxy.generator.registry_root().await,
                MetadataService::Group(group) => {
                    let mut cursors = Vec::with_capacity(group.members.len());
                    for member in &group.members {
                        cursors.push(member.registry_root().await?);
                    }
                    Ok(PackageRootCursor::chain_distinct(cursors))
                }
            }
        }
        .boxed()
    }

    pub async fn produce_registry_root(&self) -> AppResult<Content> {
        let cursor = self.registry_root().await?;
        let cursor = match self.tarball_base() {
            Some(base) => {
                let base = base.to_string();
                cursor.map(move |root| root.with_tarball_base(&base))
            }
            None => cursor,
        };
        Ok(self.parser().produce_registry_root(cursor))
    }

    pub async fn produce_package_root(&self, name: &str) -> AppResult<Option<Content>> {
        let root = self.package_root(name).await?;
        let root = served_form(root, self.tarball_base());
        self.parser().produce_package_root(root.as_ref())
    }

    pub async fn produce_package_version(
        &self,
        name: &str,
        version: &str,
    ) -> AppResult<Option<Content>> {
        let root = self.package_root(name).await?;
        let root = served_form(root, self.tarball_base());
        self.parser().produce_package_version(root.as_ref(), version)
    }

    /// Serve a classified metadata request.
    pub async fn produce(&self, request: &PackageRequest) -> AppResult<Option<Content>> {
        match request {
            PackageRequest::RegistryRoot => self.produce_registry_root().await.map(Some),
            PackageRequest::RegistrySpecial { path } if path == REGISTRY_ALL => {
                self.produce_registry_root().await.map(Some)
            }
            PackageRequest::RegistrySpecial { .. } => Ok(None),
            PackageRequest::PackageRoot { name } => self.produce_package_root(name).await,
            PackageRequest::PackageVersion { name, version } => {
                self.produce_package_version(name, version).await
            }
        }
    }

    /// Mark cached metadata stale. Hosted metadata has nothing to expire.
    pub fn expire_metadata_caches<'a>(
        &'a self,
        request: &'a PackageRequest,
    ) -> BoxFuture<'a, AppResult<bool>> {
        async move {
            match self {
                MetadataService::Hosted(_) => Ok(false),
                MetadataService::Proxy(proxy) => proxy.expire_metadata_caches(request).await,
                MetadataService::Group(group) => {
                    let mut expired = false;
                    for member in &group.members {
                        expired |= member.expire_metadata_caches(request).await?;
                    }
                    Ok(expired)
                }
            }
        }
        .boxed()
    }
}

fn served_form(root: Option<PackageRoot>, tarball_base: Option<&str>) -> Option<PackageRoot> {
    match tarball_base {
        Some(base) => root.map(|root| root.with_tarball_base(base)),
        None => root,
    }
}

/// A package is stale without a freshness record, when expired, or once the
/// record is older than `max_age`.
pub fn is_stale(state: Option<&PackageState>, max_age: Duration) -> bool {
    match state {
        None => true,
        Some(state) => state.expired || Utc::now() - state.checked_at > max_age,
    }
}

/// Proxy repository metadata: store-backed with conditional remote refresh.
pub struct ProxyMetadataService {
    generator: MetadataGenerator,
    remote: RemoteRegistry,
    transport: Arc<dyn ProxyMetadataTransport>,
    max_age: Duration,
    tarball_base: Option<String>,
}

impl ProxyMetadataService {
    pub fn new(
        generator: MetadataGenerator,
        remote_url: &str,
        transport: Arc<dyn ProxyMetadataTransport>,
        max_age: Duration,
    ) -> Self {
        let remote = RemoteRegistry::new(generator.repository_id(), remote_url);
        Self {
            generator,
            remote,
            transport,
            max_age,
            tarball_base: None,
        }
    }

    /// Rewrite served tarball URLs to `{base}/{name}/-/{file}`.
    pub fn with_tarball_base(mut self, base: impl Into<String>) -> Self {
        self.tarball_base = Some(base.into());
        self
    }

    pub fn repository_id(&self) -> &str {
        self.generator.repository_id()
    }

    fn store(&self) -> &Arc<dyn MetadataStore> {
        self.generator.store()
    }

    /// Stored root of `name` after applying the freshness protocol. `None`
    /// when the package exists neither locally nor upstream.
    pub async fn generate_raw_package_root(&self, name: &str) -> AppResult<Option<PackageRoot>> {
        let repository_id = self.repository_id();
        let Some(stored) = self.store().get_package_by_name(repository_id, name).await? else {
            return self.fetch_absent(name).await;
        };

        // a placeholder root (e.g. from an abbreviated registry root) is never authoritative
        let state = self.store().package_state(repository_id, name).await?;
        if !stored.is_incomplete() && !is_stale(state.as_ref(), self.max_age) {
            tracing::trace!(repository = %repository_id, package = %name, "Serving fresh metadata");
            return Ok(Some(stored));
        }
        self.refresh_stale(name, stored).await
    }

    async fn fetch_absent(&self, name: &str) -> AppResult<Option<PackageRoot>> {
        let repository_id = self.repository_id();
        match self.transport.fetch_package_root(&self.remote, name, None).await {
            Ok(FetchOutcome::Fetched(root)) => {
                let merged = self.store().put_or_overlay(repository_id, &root).await?;
                tracing::info!(repository = %repository_id, package = %name, versions = merged.versions().len(), "Cached remote metadata");
                Ok(Some(merged))
            }
            Ok(FetchOutcome::NotFound) => {
                tracing::debug!(repository = %repository_id, package = %name, "Package not found upstream");
                Ok(None)
            }
            Ok(FetchOutcome::Unchanged) => {
                tracing::warn!(repository = %repository_id, package = %name, "Remote reported unchanged for an unconditional fetch");
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(repository = %repository_id, package = %name, error = %e, "Remote fetch failed, nothing cached");
                Ok(None)
            }
        }
    }

    async fn refresh_stale(&self, name: &str, stored: PackageRoot) -> AppResult<Option<PackageRoot>> {
        let repository_id = self.repository_id();
        match self
            .transport
            .fetch_package_root(&self.remote, name, Some(&stored))
            .await
        {
            Ok(FetchOutcome::Unchanged) => {
                self.store().mark_fresh(repository_id, name).await?;
                tracing::debug!(repository = %repository_id, package = %name, "Remote metadata unchanged");
                Ok(Some(stored))
            }
            Ok(FetchOutcome::Fetched(root)) => {
                let merged = self.store().put_or_overlay(repository_id, &root).await?;
                tracing::info!(repository = %repository_id, package = %name, versions = merged.versions().len(), "Refreshed remote metadata");
                Ok(Some(merged))
            }
            Ok(FetchOutcome::NotFound) => {
                tracing::debug!(repository = %repository_id, package = %name, "Package gone upstream, serving stored copy");
                Ok(Some(stored))
            }
            Err(e) => {
                tracing::warn!(repository = %repository_id, package = %name, error = %e, "Remote refresh failed, serving stale metadata");
                Ok(Some(stored))
            }
        }
    }

    /// Registry-wide requests expire every stored package, package requests
    /// just the named one. Returns whether anything was marked.
    pub async fn expire_metadata_caches(&self, request: &PackageRequest) -> AppResult<bool> {
        let scope = match request.package_name() {
            Some(name) => ExpireScope::Package(name),
            None => ExpireScope::All,
        };
        self.store().expire(self.repository_id(), scope).await
    }

    /// Pull the whole remote registry root into the store, one package at a
    /// time. Returns the number of roots ingested.
    pub async fn ingest_registry_root(&self) -> AppResult<usize> {
        let repository_id = self.repository_id();
        let mut cursor = self.transport.fetch_registry_root(&self.remote).await?;
        let mut count = 0;
        let result = async {
            while let Some(root) = cursor.next().await? {
                self.store().put_or_overlay(repository_id, &root).await?;
                count += 1;
            }
            Ok::<_, AppError>(())
        }
        .await;
        cursor.close();
        result?;
        tracing::info!(repository = %repository_id, packages = count, "Ingested remote registry root");
        Ok(count)
    }
}

/// Group repository metadata: delegation to members in order.
pub struct GroupMetadataService {
    repository_id: String,
    members: Vec<MetadataService>,
    parser: MetadataParser,
    tarball_base: Option<String>,
}

impl GroupMetadataService {
    pub fn new(repository_id: &str, members: Vec<MetadataService>, parser: MetadataParser) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            members,
            parser,
            tarball_base: None,
        }
    }

    pub fn with_tarball_base(mut self, base: impl Into<String>) -> Self {
        self.tarball_base = Some(base.into());
        self
    }
}
