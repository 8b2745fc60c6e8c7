//! Shared fixtures for ws-api HTTP tests.

#![allow(dead_code)]

use axum::Router;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;
use ws_api::{create_app, AppState, Config};
use ws_orchestrator::{LocalBackend, Workspace};

/// Helper to create an in-memory test database with migrations
pub async fn create_test_db() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    // Run migrations from ws-orchestrator
    sqlx::migrate!("../ws-orchestrator/migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub fn test_config() -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        db_path: PathBuf::from(":memory:"),
        watchdog_interval_secs: 3600,
        start_deadline_secs: 5,
        stop_deadline_secs: 5,
        token_ttl_secs: 600,
        port_range: "1024-65535".to_string(),
        default_page_size: 25,
        max_page_size: 100,
    }
}

/// Create a test app with the given database pool
pub fn create_test_app(pool: SqlitePool) -> Router {
    let state = AppState::new(pool, Arc::new(LocalBackend::new()), &test_config())
        .expect("Failed to build test state");
    create_app(state)
}

/// Helper to extract JSON body from axum response
pub async fn extract_json_body<T>(response: axum::response::Response) -> T
where
    T: serde::de::DeserializeOwned,
{
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("Failed to read response body");

    serde_json::from_slice(&body).expect("Failed to deserialize JSON")
}

/// Post JSON to an endpoint as the given user.
pub fn post_json(uri: &str, user: &str, body: serde_json::Value) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-user", user)
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

pub fn get_as(uri: &str, user: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("GET")
        .uri(uri)
        .header("x-user", user)
        .body(axum::body::Body::empty())
        .unwrap()
}

pub fn request_as(
    method: &str,
    uri: &str,
    user: &str,
    body: Option<serde_json::Value>,
) -> axum::http::Request<axum::body::Body> {
    let mut builder = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .header("x-user", user);

    let body = match body {
        Some(json) => {
            builder = builder.header("content-type", "application/json");
            axum::body::Body::from(json.to_string())
        }
        None => axum::body::Body::empty(),
    };

    builder.body(body).unwrap()
}

/// Create a workspace through the API and return the parsed record.
pub async fn create_workspace(app: &Router, user: &str, name: &str, start: bool) -> Workspace {
    use tower::ServiceExt;

    let uri = if start {
        "/api/v1/workspaces?start=true"
    } else {
        "/api/v1/workspaces"
    };
    let request = post_json(uri, user, serde_json::json!({ "name": name }));

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), axum::http::StatusCode::OK);

    extract_json_body(response).await
}

/// Poll the API until the workspace reports `phase` or two seconds pass.
pub async fn wait_for_phase(app: &Router, user: &str, id: &str, phase: &str) -> Workspace {
    use tower::ServiceExt;

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);

    loop {
        let request = get_as(&format!("/api/v1/workspaces/{}", id), user);
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let workspace: Workspace = extract_json_body(response).await;
        let current = serde_json::to_value(workspace.phase).unwrap();
        if current == phase {
            return workspace;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("workspace {} never reached {}, stuck in {}", id, phase, current);
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
