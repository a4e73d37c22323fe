//! # Metadata Parser
//!
//! Translation between npm JSON documents and the [`PackageRoot`] model.
//!
//! ## Parsing
//!
//! Package documents are parsed with a streaming `serde_json` deserializer.
//! Inline publish attachments (`_attachments.*.data`, base64) are decoded into
//! temporary files under the parser's temp directory as the deserializer
//! reaches them, so the decoded payload never lives in memory.
//!
//! Registry-root documents (`/-/all`, one entry per package) are parsed on a
//! blocking worker that hands each package root over a bounded channel to a
//! [`PackageRootCursor`]. The worker only runs ahead of the consumer by the
//! channel capacity and stops parsing once the cursor is closed.
//!
//! ## Producing
//!
//! Single entities serialize to an in-memory JSON body. Registry roots are
//! produced as a chunked stream with one package entry per chunk.

use super::cursor::{PackageRootCursor, PackageRootSource};
use super::model::{PackageAttachment, PackageRoot, ATTACHMENTS_FIELD};
use crate::content::{Content, JSON_MIME_TYPE};
use crate::{AppError, AppResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::read::DecoderReader;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use indexmap::IndexMap;
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, Visitor};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Mime type recorded for attachments that do not declare one.
pub const DEFAULT_ATTACHMENT_MIME_TYPE: &str = "application/octet-stream";

const REGISTRY_ROOT_CHANNEL_CAPACITY: usize = 16;
const CURSOR_CLOSED: &str = "registry root cursor closed";

/// JSON ⇄ model translator. Attachments are spooled under `temp_dir`.
#[derive(Debug, Clone)]
pub struct MetadataParser {
    temp_dir: PathBuf,
}

impl MetadataParser {
    pub fn new(temp_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let temp_dir = temp_dir.into();
        std::fs::create_dir_all(&temp_dir)?;
        Ok(Self { temp_dir })
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Parse one package document, extracting its attachments.
    ///
    /// A document that is not a JSON object or has no `name` is invalid input.
    /// This call blocks on `reader` and on temp-file writes.
    pub fn parse_package_root<R: Read>(
        &self,
        repository_id: &str,
        reader: R,
    ) -> AppResult<PackageRoot> {
        let sink = AttachmentSink {
            temp_dir: &self.temp_dir,
            failure: RefCell::new(None),
        };
        let parsed = {
            let mut de = serde_json::Deserializer::from_reader(reader);
            DocumentSeed { sink: &sink }
                .deserialize(&mut de)
                .and_then(|document| de.end().map(|_| document))
        };
        if let Some(failure) = sink.failure.into_inner() {
            return Err(failure);
        }
        let (raw, attachments) = parsed?;

        let root = PackageRoot::from_raw(repository_id, raw)?.with_attachments(attachments);
        tracing::debug!(
            repository = %repository_id,
            package = %root.name(),
            versions = root.versions().len(),
            attachments = root.attachments().len(),
            "Parsed package root"
        );
        Ok(root)
    }

    /// Parse a registry-root document lazily.
    ///
    /// Top-level keys starting with `_` (such as `_updated`) are skipped, as
    /// are entries that are not package documents. A malformed document
    /// surfaces as an error from the cursor after the entries preceding the
    /// fault.
    pub fn parse_registry_root<R>(&self, repository_id: &str, reader: R) -> PackageRootCursor
    where
        R: Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(REGISTRY_ROOT_CHANNEL_CAPACITY);
        let repository_id = repository_id.to_string();

        tokio::task::spawn_blocking(move || {
            let result = {
                let mut de = serde_json::Deserializer::from_reader(std::io::BufReader::new(reader));
                RegistryRootSeed {
                    repository_id: &repository_id,
                    tx: &tx,
                }
                .deserialize(&mut de)
                .and_then(|count| de.end().map(|_| count))
            };
            match result {
                Ok(count) => {
                    tracing::debug!(repository = %repository_id, packages = count, "Parsed registry root");
                }
                Err(_) if tx.is_closed() => {
                    tracing::trace!(repository = %repository_id, "Registry root parse abandoned");
                }
                Err(e) => {
                    tracing::warn!(repository = %repository_id, error = %e, "Malformed registry root");
                    let _ = tx.blocking_send(Err(AppError::from(e)));
                }
            }
        });

        PackageRootCursor::new(ChannelSource { rx })
    }

    /// Serialize a lazy sequence of roots into one streamed JSON object keyed
    /// by package name. The cursor is pulled one entry per emitted chunk.
    pub fn produce_registry_root(&self, cursor: PackageRootCursor) -> Content {
        let chunks = stream::unfold(
            (cursor, Phase::Open),
            |(mut cursor, phase)| async move {
                match phase {
                    Phase::Open => Some((Ok(Bytes::from_static(b"{")), (cursor, Phase::Entries(true)))),
                    Phase::Entries(first) => match cursor.next().await {
                        Ok(Some(root)) => {
                            let chunk = registry_entry(&root, first);
                            Some((chunk, (cursor, Phase::Entries(false))))
                        }
                        Ok(None) => Some((Ok(Bytes::from_static(b"}")), (cursor, Phase::Done))),
                        Err(e) => {
                            cursor.close();
                            Some((Err(e), (cursor, Phase::Done)))
                        }
                    },
                    Phase::Done => None,
                }
            },
        );
        Content::stream(JSON_MIME_TYPE, chunks.boxed())
    }

    /// Serialize a package document, `None` when there is no root.
    pub fn produce_package_root(&self, root: Option<&PackageRoot>) -> AppResult<Option<Content>> {
        let Some(root) = root else {
            return Ok(None);
        };
        let body = serde_json::to_vec(&Value::Object(root.to_document()))?;
        Ok(Some(Content::json(body)))
    }

    /// Serialize one version (by version string or dist-tag), `None` when the
    /// root or the version does not exist.
    pub fn produce_package_version(
        &self,
        root: Option<&PackageRoot>,
        version: &str,
    ) -> AppResult<Option<Content>> {
        let Some(version) = root.and_then(|root| root.version(version)) else {
            return Ok(None);
        };
        let body = serde_json::to_vec(version.raw())?;
        Ok(Some(Content::json(body)))
    }
}

enum Phase {
    Open,
    Entries(bool),
    Done,
}

fn registry_entry(root: &PackageRoot, first: bool) -> AppResult<Bytes> {
    let mut chunk = Vec::new();
    if !first {
        chunk.push(b',');
    }
    serde_json::to_writer(&mut chunk, root.name())?;
    chunk.push(b':');
    serde_json::to_writer(&mut chunk, &Value::Object(root.to_document()))?;
    Ok(Bytes::from(chunk))
}

struct ChannelSource {
    rx: mpsc::Receiver<AppResult<PackageRoot>>,
}

#[async_trait]
impl PackageRootSource for ChannelSource {
    async fn next_root(&mut self) -> AppResult<Option<PackageRoot>> {
        self.rx.recv().await.transpose()
    }
}

/// Decodes attachment payloads into temp files, remembering the first
/// non-input failure so it is not reported as a JSON error.
struct AttachmentSink<'a> {
    temp_dir: &'a Path,
    failure: RefCell<Option<AppError>>,
}

impl AttachmentSink<'_> {
    fn spool<E: de::Error>(&self, encoded: &str) -> Result<(tempfile::TempPath, u64), E> {
        let mut file = tempfile::Builder::new()
            .prefix("npm-attachment-")
            .tempfile_in(self.temp_dir)
            .map_err(|e| self.fail::<E>(e))?;
        let mut decoder = DecoderReader::new(encoded.as_bytes(), &STANDARD);
        let length = match std::io::copy(&mut decoder, &mut file) {
            Ok(length) => length,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                return Err(E::custom(format!("invalid base64 attachment data: {e}")))
            }
            Err(e) => return Err(self.fail::<E>(e)),
        };
        file.flush().map_err(|e| self.fail::<E>(e))?;
        Ok((file.into_temp_path(), length))
    }

    fn fail<E: de::Error>(&self, e: std::io::Error) -> E {
        let message = format!("failed to spool attachment: {e}");
        self.failure.borrow_mut().get_or_insert(AppError::Io(e));
        E::custom(message)
    }
}

type ParsedDocument = (Map<String, Value>, IndexMap<String, Arc<PackageAttachment>>);

struct DocumentSeed<'s, 'a> {
    sink: &'s AttachmentSink<'a>,
}

impl<'de> DeserializeSeed<'de> for DocumentSeed<'_, '_> {
    type Value = ParsedDocument;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for DocumentSeed<'_, '_> {
    type Value = ParsedDocument;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a package document object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut raw = Map::new();
        let mut attachments = IndexMap::new();
        while let Some(key) = map.next_key::<String>()? {
            if key == ATTACHMENTS_FIELD {
                attachments = map.next_value_seed(AttachmentsSeed { sink: self.sink })?;
            } else {
                let value: Value = map.next_value()?;
                raw.insert(key, value);
            }
        }
        Ok((raw, attachments))
    }
}

struct AttachmentsSeed<'s, 'a> {
    sink: &'s AttachmentSink<'a>,
}

impl<'de> DeserializeSeed<'de> for AttachmentsSeed<'_, '_> {
    type Value = IndexMap<String, Arc<PackageAttachment>>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_any(self)
    }
}

impl<'de> Visitor<'de> for AttachmentsSeed<'_, '_> {
    type Value = IndexMap<String, Arc<PackageAttachment>>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an attachments object")
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(IndexMap::new())
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut attachments = IndexMap::new();
        while let Some(name) = map.next_key::<String>()? {
            let Some((mime_type, length, file)) =
                map.next_value_seed(AttachmentSeed { sink: self.sink })?
            else {
                tracing::debug!(attachment = %name, "Skipping attachment without data");
                continue;
            };
            let attachment = PackageAttachment::new(name.clone(), mime_type, length, file);
            attachments.insert(name, Arc::new(attachment));
        }
        Ok(attachments)
    }
}

struct AttachmentSeed<'s, 'a> {
    sink: &'s AttachmentSink<'a>,
}

impl<'de> DeserializeSeed<'de> for AttachmentSeed<'_, '_> {
    type Value = Option<(String, u64, tempfile::TempPath)>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for AttachmentSeed<'_, '_> {
    type Value = Option<(String, u64, tempfile::TempPath)>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an attachment object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut mime_type = None;
        let mut data = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_str() {
                "content_type" => mime_type = map.next_value::<Option<String>>()?,
                "data" => data = Some(map.next_value_seed(DataSeed { sink: self.sink })?),
                _ => {
                    map.next_value::<IgnoredAny>()?;
                }
            }
        }
        Ok(data.map(|(file, length)| {
            let mime_type = mime_type.unwrap_or_else(|| DEFAULT_ATTACHMENT_MIME_TYPE.to_string());
            (mime_type, length, file)
        }))
    }
}

struct DataSeed<'s, 'a> {
    sink: &'s AttachmentSink<'a>,
}

impl<'de> DeserializeSeed<'de> for DataSeed<'_, '_> {
    type Value = (tempfile::TempPath, u64);

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_str(self)
    }
}

impl<'de> Visitor<'de> for DataSeed<'_, '_> {
    type Value = (tempfile::TempPath, u64);

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("base64 attachment data")
    }

    fn visit_str<E: de::Error>(self, encoded: &str) -> Result<Self::Value, E> {
        self.sink.spool(encoded)
    }
}

struct RegistryRootSeed<'a> {
    repository_id: &'a str,
    tx: &'a mpsc::Sender<AppResult<PackageRoot>>,
}

impl<'de> DeserializeSeed<'de> for RegistryRootSeed<'_> {
    type Value = usize;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for RegistryRootSeed<'_> {
    type Value = usize;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a registry root object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let mut count = 0;
        while let Some(key) = map.next_key::<String>()? {
            if key.starts_with('_') {
                map.next_value::<IgnoredAny>()?;
                continue;
            }
            let Value::Object(mut document) = map.next_value::<Value>()? else {
                tracing::debug!(repository = %self.repository_id, entry = %key, "Skipping non-object registry entry");
                continue;
            };
            document
                .entry("name")
                .or_insert_with(|| Value::String(key.clone()));
            let root = match PackageRoot::from_raw(self.repository_id, document) {
                Ok(root) => root,
                Err(e) => {
                    tracing::debug!(repository = %self.repository_id, entry = %key, error = %e, "Skipping registry entry");
                    continue;
                }
            };
            if self.tx.blocking_send(Ok(root)).is_err() {
                return Err(de::Error::custom(CURSOR_CLOSED));
            }
            count += 1;
        }
        Ok(count)
    }
}
