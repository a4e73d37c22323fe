//! HTTP serving boundary.
//!
//! | Route                                        | Purpose                                  |
//! |----------------------------------------------|------------------------------------------|
//! | `GET /health`                                | liveness                                 |
//! | `GET /-/api/status`                          | configured repositories                  |
//! | `DELETE /-/api/repositories/{repo}/cache`    | expire metadata caches (`?path=/name`)   |
//! | `GET /{repo}`, `GET /{repo}/{*path}`         | registry root, package metadata, tarball |
//! | `PUT /{repo}/{*package}`                     | publish into a hosted repository         |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::Config;
use crate::content::Content;
use crate::error::{AppError, AppResult};
use crate::repository::{NpmRepository, RepositoryKind};
use crate::state::{AppState, SuccessResponse};

/// Router over `state`.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_request_body_size_bytes();
    Router::new()
        .route("/health", get(health_handler))
        .route("/-/api/status", get(status_handler))
        .route(
            "/-/api/repositories/{repo}/cache",
            delete(expire_cache_handler),
        )
        .route("/{repo}", get(registry_root_handler))
        .route(
            "/{repo}/{*path}",
            get(retrieve_handler).put(publish_handler),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(config: Config) -> Result<()> {
    info!("Starting npm registry server");
    println!("🚀 Starting npm registry server...");

    let host = config.server.host.clone();
    let port = config.server.port;
    let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| {
        error!(host = %host, port = %port, error = %e, "Invalid socket address");
        anyhow::anyhow!("Invalid socket address {host}:{port}: {e}")
    })?;

    info!(data_dir = %config.storage.data_dir.display(), "Using data directory");
    println!("📂 Using data directory: {}", config.storage.data_dir.display());

    let state = Arc::new(AppState::from_config(config)?);
    let app = build_router(state.clone());

    let listener = TcpListener::bind(&addr).await.map_err(|e| {
        error!(addr = %addr, error = %e, "Failed to bind to address");
        anyhow::anyhow!("Failed to bind to {addr}: {e}")
    })?;

    println!("✅ Server is running on http://{addr}");
    println!();
    println!("📦 Repositories:");
    for repository in state.repositories.values() {
        println!(
            "   {:<8} {}/{}/",
            repository.kind().as_str(),
            state.server_addr,
            repository.id()
        );
    }
    println!();
    println!("🔧 Configure npm:");
    if let Some(suggested) = suggested_registry(&state) {
        println!("   npm config set registry {}/{}/", state.server_addr, suggested.id());
    }

    info!(addr = %addr, "Server listening");
    axum::serve(listener, app).await.map_err(|e| {
        error!(error = %e, "Server error");
        anyhow::anyhow!("Server error: {e}")
    })?;

    Ok(())
}

/// The first configured group, else the first repository.
fn suggested_registry(state: &AppState) -> Option<&NpmRepository> {
    state
        .repositories
        .values()
        .find(|r| r.kind() == RepositoryKind::Group)
        .or_else(|| state.repositories.values().next())
        .map(|r| r.as_ref())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let repositories: Vec<Value> = state
        .repositories
        .values()
        .map(|r| json!({ "id": r.id(), "kind": r.kind().as_str() }))
        .collect();
    Json(json!({
        "status": "ok",
        "service": "vm-npm-registry",
        "version": env!("CARGO_PKG_VERSION"),
        "server_addr": state.server_addr,
        "repositories": repositories,
    }))
}

async fn registry_root_handler(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
) -> AppResult<Content> {
    retrieve(&state, &repo, "/").await
}

async fn retrieve_handler(
    State(state): State<Arc<AppState>>,
    Path((repo, path)): Path<(String, String)>,
) -> AppResult<Content> {
    retrieve(&state, &repo, &format!("/{path}")).await
}

async fn retrieve(state: &AppState, repo: &str, path: &str) -> AppResult<Content> {
    let repository = state.repository(repo)?;
    repository
        .retrieve(path)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No content at /{repo}{path}")))
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Path((repo, package)): Path<(String, String)>,
    body: Bytes,
) -> AppResult<impl IntoResponse> {
    let repository = state.repository(&repo)?;
    let package = package.trim_end_matches('/').replace("%2f", "/").replace("%2F", "/");
    let root = repository.publish(&package, body).await?;
    Ok((
        StatusCode::CREATED,
        Json(SuccessResponse {
            message: format!(
                "Published {} ({} versions)",
                root.name(),
                root.versions().len()
            ),
        }),
    ))
}

#[derive(Deserialize)]
struct ExpireQuery {
    path: Option<String>,
}

async fn expire_cache_handler(
    State(state): State<Arc<AppState>>,
    Path(repo): Path<String>,
    Query(query): Query<ExpireQuery>,
) -> AppResult<Json<Value>> {
    let repository = state.repository(&repo)?;
    let path = query.path.unwrap_or_else(|| "/".to_string());
    let expired = repository.expire_caches(&path).await?;
    info!(repository = %repo, path = %path, expired = expired, "Expired metadata caches");
    Ok(Json(json!({ "repository": repo, "path": path, "expired": expired })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use axum_test::TestServer;
    use tempfile::TempDir;

    fn test_server() -> (TestServer, TempDir) {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp.path().join("data");
        let state = Arc::new(AppState::from_config(config).unwrap());
        (TestServer::new(build_router(state)).unwrap(), temp)
    }

    #[tokio::test]
    async fn test_health() {
        let (server, _temp) = test_server();
        let response = server.get("/health").await;
        response.assert_status_ok();
        response.assert_json(&json!({ "status": "healthy" }));
    }

    #[tokio::test]
    async fn test_status_lists_repositories() {
        let (server, _temp) = test_server();
        let response = server.get("/-/api/status").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["repositories"][0], json!({ "id": "npm-hosted", "kind": "hosted" }));
        assert_eq!(body["repositories"][2], json!({ "id": "npm", "kind": "group" }));
    }

    #[test]
    fn test_suggested_registry_is_the_group() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.data_dir = temp.path().join("data");
        config.repositories = vec![
            RepositoryConfig::hosted("zz-hosted"),
            RepositoryConfig::group("all", &["zz-hosted"]),
            RepositoryConfig::hosted("aa-hosted"),
        ];
        let state = AppState::from_config(config.clone()).unwrap();
        assert_eq!(suggested_registry(&state).map(|r| r.id()), Some("all"));

        config.repositories = vec![RepositoryConfig::hosted("zz-hosted"), RepositoryConfig::hosted("aa-hosted")];
        let state = AppState::from_config(config).unwrap();
        assert_eq!(suggested_registry(&state).map(|r| r.id()), Some("zz-hosted"));
    }

    #[tokio::test]
    async fn test_unknown_repository_is_not_found() {
        let (server, _temp) = test_server();
        let response = server.get("/pypi/simple").await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_hosted_empty_registry_root() {
        let (server, _temp) = test_server();
        let response = server.get("/npm-hosted").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body, json!({}));
    }

    #[tokio::test]
    async fn test_missing_hosted_package_is_not_found() {
        let (server, _temp) = test_server();
        server
            .get("/npm-hosted/left-pad")
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .get("/npm-hosted/left-pad/-/left-pad-1.0.0.tgz")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
