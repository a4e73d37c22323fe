//! Store-backed metadata generation for one repository.
//!
//! A hosted repository answers every metadata request straight from the store.
//! Its only write path is [`MetadataGenerator::parse_package_root`] followed by
//! [`MetadataGenerator::overlay_package_root`], with attachments persisted in
//! between. Proxy repositories reuse the read-through and registry-root walk.

use super::cursor::{PackageRootCursor, PackageRootSource};
use super::model::PackageRoot;
use super::parser::MetadataParser;
use super::store::MetadataStore;
use crate::{AppError, AppResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub struct MetadataGenerator {
    repository_id: String,
    store: Arc<dyn MetadataStore>,
    parser: MetadataParser,
}

impl MetadataGenerator {
    pub fn new(repository_id: &str, store: Arc<dyn MetadataStore>, parser: MetadataParser) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            store,
            parser,
        }
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub fn parser(&self) -> &MetadataParser {
        &self.parser
    }

    /// Stored root of `name`, if any.
    pub async fn package_root(&self, name: &str) -> AppResult<Option<PackageRoot>> {
        self.store.get_package_by_name(&self.repository_id, name).await
    }

    /// Lazy walk over every stored root, in name order.
    ///
    /// Names listed up front but removed before they are reached are skipped.
    pub async fn registry_root(&self) -> AppResult<PackageRootCursor> {
        let names = self.store.list_package_names(&self.repository_id).await?;
        Ok(PackageRootCursor::new(StoreSource {
            repository_id: self.repository_id.clone(),
            store: Arc::clone(&self.store),
            names: names.into_iter(),
        }))
    }

    /// Parse an inbound package document on the blocking pool.
    pub async fn parse_package_root(&self, body: Bytes) -> AppResult<PackageRoot> {
        let parser = self.parser.clone();
        let repository_id = self.repository_id.clone();
        tokio::task::spawn_blocking(move || parser.parse_package_root(&repository_id, body.as_ref()))
            .await
            .map_err(|e| AppError::InternalError(format!("Package parse task failed: {e}")))?
    }

    /// Overlay an already parsed root into the store.
    pub async fn overlay_package_root(&self, root: &PackageRoot) -> AppResult<PackageRoot> {
        let merged = self.store.put_or_overlay(&self.repository_id, root).await?;
        tracing::info!(
            repository = %self.repository_id,
            package = %merged.name(),
            versions = merged.versions().len(),
            "Package root consumed"
        );
        Ok(merged)
    }
}

struct StoreSource {
    repository_id: String,
    store: Arc<dyn MetadataStore>,
    names: std::collections::btree_set::IntoIter<String>,
}

#[async_trait]
impl PackageRootSource for StoreSource {
    async fn next_root(&mut self) -> AppResult<Option<PackageRoot>> {
        for name in self.names.by_ref() {
            if let Some(root) = self.store.get_package_by_name(&self.repository_id, &name).await? {
                return Ok(Some(root));
            }
            tracing::debug!(repository = %self.repository_id, package = %name, "Package vanished during registry walk");
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::service::MetadataService;
    use crate::metadata::store::FileMetadataStore;
    use serde_json::{json, Value};
    use tempfile::TempDir;

    fn generator() -> (Arc<MetadataGenerator>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileMetadataStore::new(temp_dir.path().join("metadata")).unwrap();
        let parser = MetadataParser::new(temp_dir.path().join("tmp")).unwrap();
        (Arc::new(MetadataGenerator::new("hosted", Arc::new(store), parser)), temp_dir)
    }

    fn publish_body(name: &str, version: &str) -> Bytes {
        let doc = json!({
            "name": name,
            "dist-tags": { "latest": version },
            "versions": {
                version: {
                    "name": name,
                    "version": version,
                    "dist": { "tarball": format!("http://localhost/hosted/{name}/-/{name}-{version}.tgz") }
                }
            }
        });
        Bytes::from(serde_json::to_vec(&doc).unwrap())
    }

    async fn publish(generator: &MetadataGenerator, name: &str, version: &str) -> PackageRoot {
        let root = generator.parse_package_root(publish_body(name, version)).await.unwrap();
        generator.overlay_package_root(&root).await.unwrap()
    }

    #[tokio::test]
    async fn test_overlay_then_serve() {
        let (generator, _temp) = generator();
        publish(&generator, "pkg", "1.0.0").await;
        let merged = publish(&generator, "pkg", "1.1.0").await;
        assert_eq!(merged.versions().len(), 2);

        let service = MetadataService::Hosted(generator);
        let content = service.produce_package_root("pkg").await.unwrap().unwrap();
        let doc: Value = serde_json::from_slice(&content.into_bytes().await.unwrap()).unwrap();
        assert_eq!(doc["dist-tags"]["latest"], "1.1.0");
        assert!(doc["versions"].get("1.0.0").is_some());
        assert!(doc["versions"].get("1.1.0").is_some());

        let version = service
            .produce_package_version("pkg", "1.0.0")
            .await
            .unwrap()
            .unwrap();
        let version: Value = serde_json::from_slice(&version.into_bytes().await.unwrap()).unwrap();
        assert_eq!(version["version"], "1.0.0");
    }

    #[tokio::test]
    async fn test_missing_entities_are_no_content() {
        let (generator, _temp) = generator();
        assert!(generator.package_root("absent").await.unwrap().is_none());
        publish(&generator, "pkg", "1.0.0").await;

        let service = MetadataService::Hosted(generator);
        assert!(service.produce_package_root("absent").await.unwrap().is_none());
        assert!(service
            .produce_package_version("pkg", "2.0.0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_parse_rejects_invalid_document() {
        let (generator, _temp) = generator();
        let err = generator
            .parse_package_root(Bytes::from_static(b"{\"versions\": {}}"))
            .await
            .unwrap_err();
        assert!(err.is_invalid_input());
    }

    #[tokio::test]
    async fn test_registry_root_streams_all_packages() {
        let (generator, _temp) = generator();
        for name in ["b", "a", "c"] {
            publish(&generator, name, "1.0.0").await;
        }
        let service = MetadataService::Hosted(generator);
        let content = service.produce_registry_root().await.unwrap();
        let doc: serde_json::Map<String, Value> =
            serde_json::from_slice(&content.into_bytes().await.unwrap()).unwrap();
        assert_eq!(doc.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(doc["a"]["versions"]["1.0.0"]["name"], "a");
    }

    #[tokio::test]
    async fn test_registry_walk_skips_removed_packages() {
        let (generator, _temp) = generator();
        for name in ["a", "b"] {
            publish(&generator, name, "1.0.0").await;
        }
        let mut cursor = generator.registry_root().await.unwrap();
        generator.store().remove_package("hosted", "b").await.unwrap();

        assert_eq!(cursor.next().await.unwrap().unwrap().name(), "a");
        assert!(cursor.next().await.unwrap().is_none());
    }
}
