//! Common test utilities and helpers
//!
//! Builds a registry with the default repository layout (`npm-hosted`,
//! `npm-proxy`, group `npm`) whose remote collaborators are in-memory fakes.

#![allow(dead_code)]

use async_trait::async_trait;
use axum_test::TestServer;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use vm_npm_registry::hash_utils::sha1_hash;
use vm_npm_registry::metadata::{
    FetchOutcome, PackageRoot, PackageRootCursor, ProxyMetadataTransport, RemoteRegistry,
};
use vm_npm_registry::tarball::{
    default_validators, run_validators, Tarball, TarballRequest, TarballSource,
};
use vm_npm_registry::{build_router, AppResult, AppState, Config};

pub const PUBLIC_URL: &str = "http://registry.test";
pub const REMOTE_URL: &str = "https://registry.example.com";

/// Minimal gzip header, enough to sniff as a tarball.
pub const GZIP: &[u8] = &[
    0x1f, 0x8b, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, 0x4b, 0x4c, 0x4a, 0x06, 0x00,
];

/// Remote metadata keyed by package name.
#[derive(Default)]
pub struct FakeTransport {
    documents: Mutex<HashMap<String, Value>>,
    listing: Mutex<Vec<Value>>,
    calls: Mutex<Vec<(String, bool)>>,
}

impl FakeTransport {
    pub fn publish(&self, document: Value) {
        let name = document["name"].as_str().unwrap_or_default().to_string();
        self.documents.lock().unwrap().insert(name, document);
    }

    /// Serve `entry` in the registry root instead of the full documents.
    pub fn list_abbreviated(&self, entry: Value) {
        self.listing.lock().unwrap().push(entry);
    }

    /// `(package, was conditional)` per package fetch.
    pub fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProxyMetadataTransport for FakeTransport {
    async fn fetch_registry_root(&self, remote: &RemoteRegistry) -> AppResult<PackageRootCursor> {
        let listing = self.listing.lock().unwrap().clone();
        let documents: Vec<Value> = if listing.is_empty() {
            self.documents.lock().unwrap().values().cloned().collect()
        } else {
            listing
        };
        let roots = documents
            .into_iter()
            .filter_map(|doc| doc.as_object().cloned())
            .map(|doc| PackageRoot::from_raw(&remote.repository_id, doc))
            .collect::<AppResult<Vec<_>>>()?;
        Ok(PackageRootCursor::from_roots(roots))
    }

    async fn fetch_package_root(
        &self,
        remote: &RemoteRegistry,
        name: &str,
        expired: Option<&PackageRoot>,
    ) -> AppResult<FetchOutcome> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), expired.is_some()));
        let document = self.documents.lock().unwrap().get(name).cloned();
        match document {
            Some(Value::Object(doc)) => Ok(FetchOutcome::Fetched(PackageRoot::from_raw(
                &remote.repository_id,
                doc,
            )?)),
            _ => Ok(FetchOutcome::NotFound),
        }
    }
}

/// Remote tarballs keyed by URL, validated like real downloads.
pub struct FakeTarballs {
    files: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
    temp_dir: PathBuf,
}

impl FakeTarballs {
    pub fn new(temp_dir: PathBuf) -> Self {
        std::fs::create_dir_all(&temp_dir).unwrap();
        Self {
            files: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
            temp_dir,
        }
    }

    pub fn serve(&self, url: &str, data: &[u8]) {
        self.files.lock().unwrap().insert(url.to_string(), data.to_vec());
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TarballSource for FakeTarballs {
    async fn get(&self, request: &TarballRequest) -> AppResult<Option<Tarball>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let url = request
            .package_version
            .dist_tarball()
            .unwrap_or_default()
            .to_string();
        let Some(data) = self.files.lock().unwrap().get(&url).cloned() else {
            return Ok(None);
        };
        let mut file = tempfile::NamedTempFile::new_in(&self.temp_dir)?;
        file.write_all(&data)?;
        let tarball = Tarball::new(
            file.into_temp_path(),
            sha1_hash(&data),
            data.len() as u64,
            url,
            request.package_version.clone(),
        );
        Ok(run_validators(&default_validators(), request, &tarball).then_some(tarball))
    }
}

/// Test server setup result
pub struct TestSetup {
    pub temp_dir: TempDir,
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub transport: Arc<FakeTransport>,
    pub tarballs: Arc<FakeTarballs>,
}

pub fn create_test_setup() -> TestSetup {
    let temp_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = temp_dir.path().join("data");
    config.server.public_url = Some(PUBLIC_URL.to_string());
    for repo in &mut config.repositories {
        if repo.remote_url.is_some() {
            repo.remote_url = Some(REMOTE_URL.to_string());
        }
    }

    let transport = Arc::new(FakeTransport::default());
    let tarballs = Arc::new(FakeTarballs::new(temp_dir.path().join("data/tmp")));
    let state = Arc::new(
        AppState::with_remotes(config, transport.clone(), tarballs.clone()).unwrap(),
    );
    let server = TestServer::new(build_router(state.clone())).unwrap();

    TestSetup {
        temp_dir,
        server,
        state,
        transport,
        tarballs,
    }
}

/// A package document with one entry per `(version, tarball url, shasum)`.
pub fn package_document(name: &str, versions: &[(&str, String, Option<String>)]) -> Value {
    let mut entries = Map::new();
    for (version, tarball, shasum) in versions {
        let mut dist = json!({ "tarball": tarball });
        if let Some(shasum) = shasum {
            dist["shasum"] = json!(shasum);
        }
        entries.insert(
            version.to_string(),
            json!({ "name": name, "version": version, "dist": dist }),
        );
    }
    let latest = versions.last().map(|(v, _, _)| *v).unwrap_or("0.0.0");
    json!({
        "name": name,
        "dist-tags": { "latest": latest },
        "versions": entries,
    })
}

/// Remote tarball URL of `name@version`.
pub fn remote_tarball(name: &str, version: &str) -> String {
    format!("{REMOTE_URL}/{name}/-/{name}-{version}.tgz")
}
