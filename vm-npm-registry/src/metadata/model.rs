//! # Package Metadata Model
//!
//! In-memory representation of one npm package document ("package root") and
//! its versions. Every instance is an immutable snapshot: [`PackageRoot::overlay`]
//! and the `with_*` helpers return a new root and never touch their operands,
//! so a root held by a reader can be shared with a concurrent refresher.
//!
//! Fields the model does not interpret are kept verbatim in an ordered raw map,
//! so a parse/produce cycle never drops unknown document fields.

use crate::{AppError, AppResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempPath;

/// Document key holding the version map.
pub const VERSIONS_FIELD: &str = "versions";
/// Document key holding inline publish attachments.
pub const ATTACHMENTS_FIELD: &str = "_attachments";
/// Document key holding the upstream cache validators of a proxied root.
///
/// Only present in stored documents; produced documents never carry it.
pub const CACHE_FIELD: &str = "_cache";

/// Top-level object fields merged key-by-key on overlay instead of replaced.
const MERGED_OBJECT_FIELDS: &[&str] = &["dist-tags", "time"];

/// Cache validation metadata of a proxied package root (ETag and friends).
///
/// Round-tripped opaquely through the store; only checked for presence when
/// building a conditional request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl CacheInfo {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// One version entry of a package document.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageVersion {
    name: String,
    version: String,
    raw: Map<String, Value>,
}

impl PackageVersion {
    /// Build a version from its raw document.
    ///
    /// `package_name` and `version_key` are used for identification when the
    /// document itself lacks `name`/`version`; such a version is incomplete.
    pub fn from_raw(package_name: &str, version_key: &str, raw: Map<String, Value>) -> Self {
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(package_name)
            .to_string();
        let version = raw
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or(version_key)
            .to_string();
        Self { name, version, raw }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    fn dist(&self) -> Option<&Map<String, Value>> {
        self.raw.get("dist").and_then(Value::as_object)
    }

    /// Distribution tarball URL (`dist.tarball`).
    pub fn dist_tarball(&self) -> Option<&str> {
        self.dist()?.get("tarball").and_then(Value::as_str)
    }

    /// Recorded SHA1 hex digest of the tarball (`dist.shasum`).
    pub fn dist_shasum(&self) -> Option<&str> {
        self.dist()?
            .get("shasum")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Last path segment of the distribution URL, e.g. `pkg-1.0.0.tgz`.
    pub fn tarball_filename(&self) -> Option<&str> {
        let tarball = self.dist_tarball()?;
        let path = tarball.split(['?', '#']).next().unwrap_or(tarball);
        path.rsplit('/').next().filter(|s| !s.is_empty())
    }

    /// A version without name, version or distribution info is a placeholder
    /// and cannot be sourced for an artifact fetch.
    pub fn is_incomplete(&self) -> bool {
        !self.raw.get("name").is_some_and(Value::is_string)
            || !self.raw.get("version").is_some_and(Value::is_string)
            || self.dist_tarball().is_none()
    }

    pub fn with_dist_shasum(&self, shasum: &str) -> Self {
        self.with_dist_field("shasum", shasum)
    }

    pub fn with_dist_tarball(&self, url: &str) -> Self {
        self.with_dist_field("tarball", url)
    }

    fn with_dist_field(&self, key: &str, value: &str) -> Self {
        let mut raw = self.raw.clone();
        let dist = raw
            .entry("dist")
            .or_insert_with(|| Value::Object(Map::new()));
        if !dist.is_object() {
            *dist = Value::Object(Map::new());
        }
        if let Some(dist) = dist.as_object_mut() {
            dist.insert(key.to_string(), Value::String(value.to_string()));
        }
        Self {
            name: self.name.clone(),
            version: self.version.clone(),
            raw,
        }
    }
}

/// Binary payload uploaded inline with a publish document, spooled to a
/// temporary file. The file is deleted when the last holder drops it.
#[derive(Debug)]
pub struct PackageAttachment {
    name: String,
    mime_type: String,
    length: u64,
    file: TempPath,
}

impl PackageAttachment {
    pub fn new(name: String, mime_type: String, length: u64, file: TempPath) -> Self {
        Self {
            name,
            mime_type,
            length,
            file,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn path(&self) -> &Path {
        &self.file
    }
}

/// The full metadata document of one package in one repository.
#[derive(Debug, Clone)]
pub struct PackageRoot {
    repository_id: String,
    name: String,
    raw: Map<String, Value>,
    versions: IndexMap<String, PackageVersion>,
    attachments: IndexMap<String, Arc<PackageAttachment>>,
    cache: CacheInfo,
}

impl PackageRoot {
    /// Interpret a raw document as a package root.
    ///
    /// Unknown fields are always accepted. Fails only when the document has no
    /// usable `name` or a `versions` value that is not an object. Version
    /// entries that are not objects become incomplete placeholders.
    pub fn from_raw(repository_id: &str, mut raw: Map<String, Value>) -> AppResult<Self> {
        let name = match raw.get("name") {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => {
                return Err(AppError::BadRequest(
                    "Package document has no 'name' field".to_string(),
                ))
            }
        };

        let versions = match raw.shift_remove(VERSIONS_FIELD) {
            None | Some(Value::Null) => IndexMap::new(),
            Some(Value::Object(entries)) => entries
                .into_iter()
                .map(|(key, value)| {
                    let version_raw = match value {
                        Value::Object(map) => map,
                        _ => Map::new(),
                    };
                    let version = PackageVersion::from_raw(&name, &key, version_raw);
                    (key, version)
                })
                .collect(),
            Some(_) => {
                return Err(AppError::BadRequest(format!(
                    "Package '{name}': 'versions' field is not an object"
                )))
            }
        };

        raw.shift_remove(ATTACHMENTS_FIELD);
        let cache = raw
            .shift_remove(CACHE_FIELD)
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        Ok(Self {
            repository_id: repository_id.to_string(),
            name,
            raw,
            versions,
            attachments: IndexMap::new(),
            cache,
        })
    }

    pub fn repository_id(&self) -> &str {
        &self.repository_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Identifier correlating snapshots of the same package across merges.
    pub fn component_id(&self) -> String {
        format!("{}:{}", self.repository_id, self.name)
    }

    /// Raw top-level fields other than versions, attachments and cache info.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.raw
    }

    pub fn versions(&self) -> &IndexMap<String, PackageVersion> {
        &self.versions
    }

    pub fn attachments(&self) -> &IndexMap<String, Arc<PackageAttachment>> {
        &self.attachments
    }

    pub fn cache_info(&self) -> &CacheInfo {
        &self.cache
    }

    /// Look a version up by exact version string, then by dist-tag.
    pub fn version(&self, version_or_tag: &str) -> Option<&PackageVersion> {
        if let Some(version) = self.versions.get(version_or_tag) {
            return Some(version);
        }
        let tagged = self
            .raw
            .get("dist-tags")
            .and_then(|tags| tags.get(version_or_tag))
            .and_then(Value::as_str)?;
        self.versions.get(tagged)
    }

    /// The root carries only withdrawal information and no versions.
    pub fn is_unpublished(&self) -> bool {
        self.versions.is_empty()
            && self
                .raw
                .get("time")
                .and_then(|time| time.get("unpublished"))
                .is_some()
    }

    /// Any version of the root is a placeholder.
    pub fn is_incomplete(&self) -> bool {
        self.versions.values().any(PackageVersion::is_incomplete)
    }

    pub fn with_attachments(mut self, attachments: IndexMap<String, Arc<PackageAttachment>>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_cache_info(mut self, cache: CacheInfo) -> Self {
        self.cache = cache;
        self
    }

    /// Replace (or add) the version keyed by `version.version()`.
    pub fn with_version(&self, version: PackageVersion) -> Self {
        let mut root = self.clone();
        root.versions.insert(version.version().to_string(), version);
        root
    }

    /// Point every version's `dist.tarball` at `{base_url}/{name}/-/{filename}`.
    pub fn with_tarball_base(&self, base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/');
        let mut root = self.clone();
        for version in root.versions.values_mut() {
            if let Some(filename) = version.tarball_filename() {
                let url = format!("{base_url}/{}/-/{filename}", self.name);
                *version = version.with_dist_tarball(&url);
            }
        }
        root
    }

    /// Merge `other` onto this root and return the merged snapshot.
    ///
    /// Versions are united by version string. A version present on both sides
    /// is taken from `other` unless `other`'s entry is incomplete while ours is
    /// complete. Existing versions are only dropped when `other` is an
    /// unpublished root.
    ///
    /// # Panics
    ///
    /// Panics when the component ids differ; merging different packages is a
    /// programming error.
    pub fn overlay(&self, other: &PackageRoot) -> PackageRoot {
        assert_eq!(
            self.component_id(),
            other.component_id(),
            "overlay of package roots with different component ids"
        );

        if other.is_unpublished() {
            let mut merged = other.clone();
            merged.attachments = merge_attachments(&self.attachments, &other.attachments);
            return merged;
        }

        let mut raw = self.raw.clone();
        for (key, incoming) in &other.raw {
            let merge_keys = MERGED_OBJECT_FIELDS.contains(&key.as_str());
            match (raw.get_mut(key), incoming) {
                (Some(Value::Object(existing)), Value::Object(incoming)) if merge_keys => {
                    for (k, v) in incoming {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    raw.insert(key.clone(), incoming.clone());
                }
            }
        }

        let mut versions = self.versions.clone();
        for (key, incoming) in &other.versions {
            let keep_existing = versions
                .get(key)
                .is_some_and(|existing| !existing.is_incomplete() && incoming.is_incomplete());
            if !keep_existing {
                versions.insert(key.clone(), incoming.clone());
            }
        }

        if !versions.is_empty() {
            if let Some(Value::Object(time)) = raw.get_mut("time") {
                time.shift_remove("unpublished");
            }
        }

        let cache = if other.cache.is_empty() {
            self.cache.clone()
        } else {
            other.cache.clone()
        };

        PackageRoot {
            repository_id: self.repository_id.clone(),
            name: self.name.clone(),
            raw,
            versions,
            attachments: merge_attachments(&self.attachments, &other.attachments),
            cache,
        }
    }

    /// The package document as served downstream.
    pub fn to_document(&self) -> Map<String, Value> {
        let mut document = self.raw.clone();
        if !self.versions.is_empty() || !self.is_unpublished() {
            let versions: Map<String, Value> = self
                .versions
                .iter()
                .map(|(key, version)| (key.clone(), Value::Object(version.raw.clone())))
                .collect();
            document.insert(VERSIONS_FIELD.to_string(), Value::Object(versions));
        }
        document
    }

    /// The package document as persisted, including cache validators.
    pub fn to_stored_document(&self) -> Map<String, Value> {
        let mut document = self.to_document();
        if !self.cache.is_empty() {
            if let Ok(cache) = serde_json::to_value(&self.cache) {
                document.insert(CACHE_FIELD.to_string(), cache);
            }
        }
        document
    }
}

fn merge_attachments(
    base: &IndexMap<String, Arc<PackageAttachment>>,
    incoming: &IndexMap<String, Arc<PackageAttachment>>,
) -> IndexMap<String, Arc<PackageAttachment>> {
    let mut merged = base.clone();
    for (name, attachment) in incoming {
        merged.insert(name.clone(), Arc::clone(attachment));
    }
    merged
}
