#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use kiln_api::config::ServerConfig;
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;
use kiln_core::catalog::WorkerCatalog;
use kiln_supervisor::{Fleet, FleetConfig, ProbeConfig};
use kiln_workers::{JobConfig, JobOrchestrator};
use serde_json::Value;
use tower::ServiceExt;

/// Build a test `ServerConfig` rooted at `root`.
pub fn test_config(root: &std::path::Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        root: root.to_path_buf(),
        python: "python3".to_string(),
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 1,
    }
}

pub struct TestApp {
    pub dir: tempfile::TempDir,
    pub fleet: Arc<Fleet>,
    pub app: Router,
}

/// Full application over a temp root. Every worker port is re-pointed via
/// `port_for` so nothing on the host machine is contacted by accident.
pub fn build_test_app(port_for: impl Fn(&str) -> u16) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());

    let workers = WorkerCatalog::default_catalog()
        .iter()
        .cloned()
        .map(|mut w| {
            w.port = port_for(&w.name);
            w
        })
        .collect();
    let mut fleet_config = FleetConfig::new(dir.path());
    fleet_config.catalog = WorkerCatalog::new(workers);
    fleet_config.probe = ProbeConfig {
        interval: Duration::from_millis(10),
        max_attempts: 3,
        request_timeout: Duration::from_millis(500),
    };

    let fleet = Arc::new(Fleet::new(fleet_config));
    let orchestrator = Arc::new(JobOrchestrator::from_fleet(&fleet, JobConfig::default()));
    let state = AppState {
        config: Arc::new(config.clone()),
        fleet: Arc::clone(&fleet),
        orchestrator,
    };

    TestApp {
        app: build_app_router(state, &config),
        fleet,
        dir,
    }
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
