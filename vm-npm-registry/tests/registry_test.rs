//! Integration tests for hosted, proxy and group repositories over HTTP.

use axum::http::StatusCode;
use base64::Engine;
use serde_json::{json, Value};

mod common;
use common::{create_test_setup, package_document, remote_tarball, GZIP, PUBLIC_URL};
use vm_npm_registry::hash_utils::sha1_hash;

fn publish_document(name: &str, version: &str, data: &[u8]) -> Value {
    let filename = format!("{name}-{version}.tgz");
    let tarball = format!("{PUBLIC_URL}/npm-hosted/{name}/-/{filename}");
    let mut document = package_document(name, &[(version, tarball, None)]);
    document["_attachments"] = json!({
        filename: {
            "content_type": "application/octet-stream",
            "data": base64::engine::general_purpose::STANDARD.encode(data),
            "length": data.len(),
        }
    });
    document
}

#[tokio::test]
async fn test_publish_then_serve_hosted_package() {
    let setup = create_test_setup();
    let server = &setup.server;

    server
        .put("/npm-hosted/left-pad")
        .json(&publish_document("left-pad", "1.3.0", GZIP))
        .await
        .assert_status(StatusCode::CREATED);

    let response = server.get("/npm-hosted/left-pad").await;
    response.assert_status_ok();
    let document: Value = response.json();
    assert!(document.get("_attachments").is_none());
    assert!(document.get("_cache").is_none());
    let dist = &document["versions"]["1.3.0"]["dist"];
    assert_eq!(
        dist["tarball"],
        format!("{PUBLIC_URL}/npm-hosted/left-pad/-/left-pad-1.3.0.tgz")
    );
    // computed from the stored attachment
    assert_eq!(dist["shasum"], sha1_hash(GZIP));

    let tarball = server.get("/npm-hosted/left-pad/-/left-pad-1.3.0.tgz").await;
    tarball.assert_status_ok();
    assert_eq!(tarball.as_bytes().to_vec(), GZIP.to_vec());

    let latest = server.get("/npm-hosted/left-pad/latest").await;
    latest.assert_status_ok();
    let version: Value = latest.json();
    assert_eq!(version["version"], "1.3.0");
}

#[tokio::test]
async fn test_publish_name_mismatch_is_rejected() {
    let setup = create_test_setup();
    setup
        .server
        .put("/npm-hosted/right-pad")
        .json(&publish_document("left-pad", "1.3.0", GZIP))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    setup
        .server
        .get("/npm-hosted/left-pad")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_publish_to_proxy_or_group_is_rejected() {
    let setup = create_test_setup();
    for repo in ["npm-proxy", "npm"] {
        setup
            .server
            .put(&format!("/{repo}/left-pad"))
            .json(&publish_document("left-pad", "1.3.0", GZIP))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}

#[tokio::test]
async fn test_republish_overlays_versions() {
    let setup = create_test_setup();
    for version in ["1.0.0", "1.1.0"] {
        setup
            .server
            .put("/npm-hosted/pkg")
            .json(&publish_document("pkg", version, GZIP))
            .await
            .assert_status(StatusCode::CREATED);
    }

    let document: Value = setup.server.get("/npm-hosted/pkg").await.json();
    let versions = document["versions"].as_object().unwrap();
    assert_eq!(versions.len(), 2);
    assert_eq!(document["dist-tags"]["latest"], "1.1.0");
    setup
        .server
        .get("/npm-hosted/pkg/-/pkg-1.0.0.tgz")
        .await
        .assert_status_ok();
}

#[tokio::test]
async fn test_proxy_package_rewrites_tarball_urls() {
    let setup = create_test_setup();
    setup.transport.publish(package_document(
        "commonjs",
        &[("0.0.1", remote_tarball("commonjs", "0.0.1"), Some(sha1_hash(GZIP)))],
    ));

    let response = setup.server.get("/npm-proxy/commonjs").await;
    response.assert_status_ok();
    let document: Value = response.json();
    assert_eq!(
        document["versions"]["0.0.1"]["dist"]["tarball"],
        format!("{PUBLIC_URL}/npm-proxy/commonjs/-/commonjs-0.0.1.tgz")
    );
    assert!(document.get("_cache").is_none());

    setup
        .server
        .get("/npm-proxy/missing")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_proxy_tarball_is_fetched_once_and_cached() {
    let setup = create_test_setup();
    let url = remote_tarball("commonjs", "0.0.1");
    setup.transport.publish(package_document(
        "commonjs",
        &[("0.0.1", url.clone(), Some(sha1_hash(GZIP)))],
    ));
    setup.tarballs.serve(&url, GZIP);

    for _ in 0..2 {
        let response = setup.server.get("/npm-proxy/commonjs/-/commonjs-0.0.1.tgz").await;
        response.assert_status_ok();
        assert_eq!(response.as_bytes().to_vec(), GZIP.to_vec());
    }
    assert_eq!(setup.tarballs.fetches(), 1);
    // metadata fetched once, then fresh
    assert_eq!(setup.transport.calls(), vec![("commonjs".to_string(), false)]);
}

#[tokio::test]
async fn test_proxy_tarball_resolves_by_filename_suffix() {
    let setup = create_test_setup();
    let first = remote_tarball("pkg", "0.0.1");
    let second = remote_tarball("pkg", "0.0.2");
    setup.transport.publish(package_document(
        "pkg",
        &[("0.0.1", first.clone(), None), ("0.0.2", second.clone(), None)],
    ));
    setup.tarballs.serve(&first, b"\x1f\x8bfirst");
    setup.tarballs.serve(&second, b"\x1f\x8bsecond");

    let response = setup.server.get("/npm-proxy/pkg/-/pkg-0.0.2.tgz").await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().to_vec(), b"\x1f\x8bsecond".to_vec());

    setup
        .server
        .get("/npm-proxy/pkg/-/pkg-9.9.9.tgz")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_proxy_tarball_hash_mismatch_is_not_found() {
    let setup = create_test_setup();
    let url = remote_tarball("pkg", "1.0.0");
    setup.transport.publish(package_document(
        "pkg",
        &[("1.0.0", url.clone(), Some("0123456789abcdef0123456789abcdef01234567".to_string()))],
    ));
    setup.tarballs.serve(&url, GZIP);

    setup
        .server
        .get("/npm-proxy/pkg/-/pkg-1.0.0.tgz")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    assert!(!setup
        .temp_dir
        .path()
        .join("data/artifacts/npm-proxy/tarballs/pkg/pkg-1.0.0.tgz")
        .exists());
}

#[tokio::test]
async fn test_expire_cache_forces_conditional_refetch() {
    let setup = create_test_setup();
    setup.transport.publish(package_document(
        "commonjs",
        &[("0.0.1", remote_tarball("commonjs", "0.0.1"), None)],
    ));
    setup.server.get("/npm-proxy/commonjs").await.assert_status_ok();

    let response = setup
        .server
        .delete("/-/api/repositories/npm-proxy/cache")
        .add_query_param("path", "/commonjs")
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["expired"], true);

    setup.transport.publish(package_document(
        "commonjs",
        &[("0.0.2", remote_tarball("commonjs", "0.0.2"), None)],
    ));
    let document: Value = setup.server.get("/npm-proxy/commonjs").await.json();
    let versions = document["versions"].as_object().unwrap();
    // overlay keeps the version the remote dropped
    assert!(versions.contains_key("0.0.1"));
    assert!(versions.contains_key("0.0.2"));
    assert_eq!(
        setup.transport.calls(),
        vec![("commonjs".to_string(), false), ("commonjs".to_string(), true)]
    );
}

#[tokio::test]
async fn test_group_delegates_in_member_order() {
    let setup = create_test_setup();
    let server = &setup.server;
    server
        .put("/npm-hosted/shared")
        .json(&publish_document("shared", "1.0.0", GZIP))
        .await
        .assert_status(StatusCode::CREATED);
    setup.transport.publish(package_document(
        "shared",
        &[("9.0.0", remote_tarball("shared", "9.0.0"), None)],
    ));
    let remote_only = remote_tarball("remote-only", "2.0.0");
    setup.transport.publish(package_document(
        "remote-only",
        &[("2.0.0", remote_only.clone(), Some(sha1_hash(GZIP)))],
    ));
    setup.tarballs.serve(&remote_only, GZIP);

    // hosted member wins for "shared"
    let shared: Value = server.get("/npm/shared").await.json();
    assert!(shared["versions"].get("1.0.0").is_some());
    assert!(shared["versions"].get("9.0.0").is_none());
    assert_eq!(
        shared["versions"]["1.0.0"]["dist"]["tarball"],
        format!("{PUBLIC_URL}/npm/shared/-/shared-1.0.0.tgz")
    );
    let tarball = server.get("/npm/shared/-/shared-1.0.0.tgz").await;
    tarball.assert_status_ok();
    assert_eq!(tarball.as_bytes().to_vec(), GZIP.to_vec());

    // falls through to the proxy member
    let remote: Value = server.get("/npm/remote-only").await.json();
    assert_eq!(
        remote["versions"]["2.0.0"]["dist"]["tarball"],
        format!("{PUBLIC_URL}/npm/remote-only/-/remote-only-2.0.0.tgz")
    );
    server
        .get("/npm/remote-only/-/remote-only-2.0.0.tgz")
        .await
        .assert_status_ok();

    server
        .get("/npm/nowhere")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_group_registry_root_lists_members_once() {
    let setup = create_test_setup();
    let server = &setup.server;
    server
        .put("/npm-hosted/shared")
        .json(&publish_document("shared", "1.0.0", GZIP))
        .await
        .assert_status(StatusCode::CREATED);
    setup.transport.publish(package_document(
        "shared",
        &[("9.0.0", remote_tarball("shared", "9.0.0"), None)],
    ));
    setup.transport.publish(package_document(
        "remote-only",
        &[("2.0.0", remote_tarball("remote-only", "2.0.0"), None)],
    ));
    server.get("/npm-proxy/shared").await.assert_status_ok();
    server.get("/npm-proxy/remote-only").await.assert_status_ok();

    for path in ["/npm", "/npm/-/all"] {
        let response = server.get(path).await;
        response.assert_status_ok();
        let root: Value = response.json();
        let names: Vec<&String> = root.as_object().unwrap().keys().collect();
        assert_eq!(names, vec!["shared", "remote-only"]);
        assert!(root["shared"]["versions"].get("1.0.0").is_some());
    }
}

#[tokio::test]
async fn test_ingest_registry_root() {
    let setup = create_test_setup();
    setup.transport.publish(package_document("a", &[("1.0.0", remote_tarball("a", "1.0.0"), None)]));
    setup.transport.publish(package_document("b", &[("1.0.0", remote_tarball("b", "1.0.0"), None)]));

    let repository = setup.state.repository("npm-proxy").unwrap();
    let vm_npm_registry::metadata::MetadataService::Proxy(service) = repository.metadata() else {
        panic!("npm-proxy is a proxy");
    };
    assert_eq!(service.ingest_registry_root().await.unwrap(), 2);

    // served from the store without a package fetch
    setup.server.get("/npm-proxy/a").await.assert_status_ok();
    assert!(setup.transport.calls().is_empty());
}

#[tokio::test]
async fn test_ingested_placeholder_is_completed_before_tarball_fetch() {
    let setup = create_test_setup();
    setup
        .transport
        .list_abbreviated(json!({ "name": "commonjs", "versions": { "0.0.1": "latest" } }));
    let url = remote_tarball("commonjs", "0.0.1");
    setup.transport.publish(package_document(
        "commonjs",
        &[("0.0.1", url.clone(), Some(sha1_hash(GZIP)))],
    ));
    setup.tarballs.serve(&url, GZIP);

    let repository = setup.state.repository("npm-proxy").unwrap();
    let vm_npm_registry::metadata::MetadataService::Proxy(service) = repository.metadata() else {
        panic!("npm-proxy is a proxy");
    };
    assert_eq!(service.ingest_registry_root().await.unwrap(), 1);

    let response = setup.server.get("/npm-proxy/commonjs/-/commonjs-0.0.1.tgz").await;
    response.assert_status_ok();
    assert_eq!(response.as_bytes().to_vec(), GZIP.to_vec());
    assert_eq!(setup.transport.calls(), vec![("commonjs".to_string(), true)]);
    assert_eq!(setup.tarballs.fetches(), 1);
}

#[tokio::test]
async fn test_incomplete_remote_version_has_no_tarball() {
    let setup = create_test_setup();
    let url = remote_tarball("pkg", "1.0.0");
    let mut document = package_document("pkg", &[("1.0.0", url.clone(), None)]);
    document["versions"]["1.0.0"]
        .as_object_mut()
        .unwrap()
        .remove("name");
    setup.transport.publish(document);
    setup.tarballs.serve(&url, GZIP);

    setup
        .server
        .get("/npm-proxy/pkg/-/pkg-1.0.0.tgz")
        .await
        .assert_status(StatusCode::NOT_FOUND);
    assert_eq!(setup.tarballs.fetches(), 0);

    // metadata is still served, and refreshed on every read
    setup.server.get("/npm-proxy/pkg").await.assert_status_ok();
    assert_eq!(setup.transport.calls().len(), 2);
}
