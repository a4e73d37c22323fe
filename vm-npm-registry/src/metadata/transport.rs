//! Remote registry access for proxy repositories.
//!
//! [`ProxyMetadataTransport`] is the boundary the proxy metadata service talks
//! to; [`HttpMetadataTransport`] implements it over `reqwest`. Cache
//! validators (ETag and Last-Modified) travel inside the fetched root's
//! [`CacheInfo`] and are sent back verbatim on the next conditional fetch.

use super::cursor::PackageRootCursor;
use super::model::{CacheInfo, PackageRoot};
use super::parser::MetadataParser;
use crate::content::JSON_MIME_TYPE;
use crate::{AppError, AppResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::io::{BufReader, Read};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

/// Result of a package-root fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(PackageRoot),
    /// The remote confirmed the expired copy is still current.
    Unchanged,
    NotFound,
}

/// A proxy repository's remote end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRegistry {
    pub repository_id: String,
    pub remote_url: String,
}

impl RemoteRegistry {
    pub fn new(repository_id: &str, remote_url: &str) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            remote_url: remote_url.trim_end_matches('/').to_string(),
        }
    }

    /// URL of a package document; scoped names keep their `/` encoded.
    pub fn package_url(&self, name: &str) -> String {
        format!("{}/{}", self.remote_url, name.replace('/', "%2f"))
    }

    pub fn registry_root_url(&self) -> String {
        format!("{}/-/all", self.remote_url)
    }
}

#[async_trait]
pub trait ProxyMetadataTransport: Send + Sync {
    /// Lazy sequence over the remote registry root.
    async fn fetch_registry_root(&self, remote: &RemoteRegistry) -> AppResult<PackageRootCursor>;

    /// Fetch one package root. With an `expired` copy the fetch is
    /// conditional and may report [`FetchOutcome::Unchanged`].
    async fn fetch_package_root(
        &self,
        remote: &RemoteRegistry,
        name: &str,
        expired: Option<&PackageRoot>,
    ) -> AppResult<FetchOutcome>;
}

pub struct HttpMetadataTransport {
    client: Client,
    parser: MetadataParser,
}

impl HttpMetadataTransport {
    pub fn new(client: Client, parser: MetadataParser) -> Self {
        Self { client, parser }
    }
}

fn header_string(headers: &header::HeaderMap, name: header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

#[async_trait]
impl ProxyMetadataTransport for HttpMetadataTransport {
    async fn fetch_registry_root(&self, remote: &RemoteRegistry) -> AppResult<PackageRootCursor> {
        let url = remote.registry_root_url();
        tracing::info!(target: "remote.storage.outbound", method = "GET", url = %url, "Fetching registry root");

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, JSON_MIME_TYPE)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Upstream(format!("{url} returned {status}")));
        }

        // Spool to disk so the parse worker reads at its own pace
        let spool = tempfile::Builder::new()
            .prefix(&format!("{}-registry-root-", remote.repository_id))
            .tempfile_in(self.parser.temp_dir())?;
        let (file, path) = spool.into_parts();
        let mut file = tokio::fs::File::from_std(file);
        let mut body = response.bytes_stream();
        let mut length = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            length += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        tracing::debug!(repository = %remote.repository_id, bytes = length, "Registry root spooled");

        let reader = SpooledReader::open(path)?;
        Ok(self.parser.parse_registry_root(&remote.repository_id, reader))
    }

    async fn fetch_package_root(
        &self,
        remote: &RemoteRegistry,
        name: &str,
        expired: Option<&PackageRoot>,
    ) -> AppResult<FetchOutcome> {
        let url = remote.package_url(name);
        let mut request = self.client.get(&url).header(header::ACCEPT, JSON_MIME_TYPE);
        let mut conditional = false;
        if let Some(cache) = expired.map(PackageRoot::cache_info) {
            if let Some(etag) = &cache.etag {
                request = request.header(header::IF_NONE_MATCH, etag);
                conditional = true;
            }
            if let Some(last_modified) = &cache.last_modified {
                request = request.header(header::IF_MODIFIED_SINCE, last_modified);
                conditional = true;
            }
        }
        tracing::info!(target: "remote.storage.outbound", method = "GET", url = %url, conditional, "Fetching package root");

        let response = request.send().await?;
        let status = response.status();
        match status {
            StatusCode::NOT_MODIFIED => return Ok(FetchOutcome::Unchanged),
            StatusCode::NOT_FOUND => return Ok(FetchOutcome::NotFound),
            status if !status.is_success() => {
                return Err(AppError::Upstream(format!("{url} returned {status}")))
            }
            _ => {}
        }

        let cache = CacheInfo {
            etag: header_string(response.headers(), header::ETAG),
            last_modified: header_string(response.headers(), header::LAST_MODIFIED),
        };
        let body = response.bytes().await?;

        let parser = self.parser.clone();
        let repository_id = remote.repository_id.clone();
        let root = tokio::task::spawn_blocking(move || {
            parser.parse_package_root(&repository_id, body.as_ref())
        })
        .await
        .map_err(|e| AppError::InternalError(format!("Package parse task failed: {e}")))?
        .map_err(|e| AppError::Upstream(format!("{url} returned an unusable document: {e}")))?;

        if root.name() != name {
            return Err(AppError::Upstream(format!(
                "{url} returned package '{}' instead of '{name}'",
                root.name()
            )));
        }
        Ok(FetchOutcome::Fetched(root.with_cache_info(cache)))
    }
}

/// Reader over a spooled temp file; the file goes away with the reader.
struct SpooledReader {
    reader: BufReader<std::fs::File>,
    _path: TempPath,
}

impl SpooledReader {
    fn open(path: TempPath) -> AppResult<Self> {
        let file = std::fs::File::open(&path)?;
        Ok(Self {
            reader: BufReader::new(file),
            _path: path,
        })
    }
}

impl Read for SpooledReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        http::{HeaderMap, StatusCode as AxumStatus},
        response::IntoResponse,
        routing::get,
        Router,
    };
    use serde_json::json;
    use tempfile::TempDir;

    const ETAG: &str = "\"v1\"";

    async fn package(Path(name): Path<String>, headers: HeaderMap) -> axum::response::Response {
        if name != "commonjs" {
            return AxumStatus::NOT_FOUND.into_response();
        }
        if headers.get("if-none-match").and_then(|v| v.to_str().ok()) == Some(ETAG) {
            return AxumStatus::NOT_MODIFIED.into_response();
        }
        let doc = json!({
            "name": "commonjs",
            "versions": {
                "0.0.1": {
                    "name": "commonjs",
                    "version": "0.0.1",
                    "dist": { "tarball": "http://registry.example/commonjs/-/commonjs-0.0.1.tgz" }
                }
            }
        });
        (
            [("etag", ETAG), ("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT")],
            axum::Json(doc),
        )
            .into_response()
    }

    async fn registry_root() -> axum::Json<serde_json::Value> {
        axum::Json(json!({
            "_updated": 1,
            "a": { "name": "a", "versions": {} },
            "b": { "name": "b", "versions": {} }
        }))
    }

    async fn serve() -> String {
        let app = Router::new()
            .route("/-/all", get(registry_root))
            .route("/{name}", get(package))
            .route("/broken/{name}", get(|| async { AxumStatus::INTERNAL_SERVER_ERROR }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn transport() -> (HttpMetadataTransport, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let parser = MetadataParser::new(temp_dir.path()).unwrap();
        (HttpMetadataTransport::new(Client::new(), parser), temp_dir)
    }

    #[test]
    fn test_remote_urls() {
        let remote = RemoteRegistry::new("proxy", "https://registry.npmjs.org/");
        assert_eq!(remote.package_url("left-pad"), "https://registry.npmjs.org/left-pad");
        assert_eq!(
            remote.package_url("@types/node"),
            "https://registry.npmjs.org/@types%2fnode"
        );
        assert_eq!(remote.registry_root_url(), "https://registry.npmjs.org/-/all");
    }

    #[tokio::test]
    async fn test_fetch_records_validators_and_honours_them() {
        let base = serve().await;
        let (transport, _temp) = transport();
        let remote = RemoteRegistry::new("proxy", &base);

        let FetchOutcome::Fetched(root) = transport
            .fetch_package_root(&remote, "commonjs", None)
            .await
            .unwrap()
        else {
            panic!("expected a fetched root");
        };
        assert_eq!(root.repository_id(), "proxy");
        assert_eq!(root.cache_info().etag.as_deref(), Some(ETAG));
        assert!(root.cache_info().last_modified.is_some());

        let outcome = transport
            .fetch_package_root(&remote, "commonjs", Some(&root))
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Unchanged));
    }

    #[tokio::test]
    async fn test_fetch_missing_and_failing() {
        let base = serve().await;
        let (transport, _temp) = transport();

        let remote = RemoteRegistry::new("proxy", &base);
        let outcome = transport.fetch_package_root(&remote, "nope", None).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::NotFound));

        let broken = RemoteRegistry::new("proxy", &format!("{base}/broken"));
        let err = transport.fetch_package_root(&broken, "x", None).await.unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_fetch_registry_root() {
        let base = serve().await;
        let (transport, _temp) = transport();
        let remote = RemoteRegistry::new("proxy", &base);

        let mut cursor = transport.fetch_registry_root(&remote).await.unwrap();
        let mut names = Vec::new();
        while let Some(root) = cursor.next().await.unwrap() {
            names.push(root.name().to_string());
        }
        assert_eq!(names, vec!["a", "b"]);
    }
}
