//! check → start → smoke-test orchestration.

mod common;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{client_config, shell_launch, spawn_server, READY_SCRIPT};
use ernie_deploy::config::ClientConfig;
use ernie_deploy::{Config, DeployManager, LaunchError, ServiceStatus};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reports unhealthy until the first chat completion, the way a server that
/// was just launched starts answering.
fn fake_server(healthy: Arc<AtomicBool>) -> Router {
    Router::new()
        .route(
            "/v1/models",
            get(|State(healthy): State<Arc<AtomicBool>>| async move {
                if healthy.load(Ordering::SeqCst) {
                    Json(json!({"object": "list", "data": []})).into_response()
                } else {
                    StatusCode::SERVICE_UNAVAILABLE.into_response()
                }
            }),
        )
        .route(
            "/v1/chat/completions",
            post(|State(healthy): State<Arc<AtomicBool>>| async move {
                healthy.store(true, Ordering::SeqCst);
                Json(json!({
                    "choices": [{"index": 0, "message": {"role": "assistant", "content": "北京是中国的首都。"}}]
                }))
            }),
        )
        .with_state(healthy)
}

#[tokio::test]
async fn setup_is_idempotent_while_service_is_healthy() {
    let base = spawn_server(fake_server(Arc::new(AtomicBool::new(true)))).await;
    let config = Config {
        // Would fail if it were ever launched
        server: shell_launch("exit 1", 5),
        client: client_config(&base),
    };
    let manager = DeployManager::new(config).unwrap();

    assert_eq!(manager.setup_service().await.unwrap(), ServiceStatus::AlreadyRunning);
    assert_eq!(manager.setup_service().await.unwrap(), ServiceStatus::AlreadyRunning);
    assert_eq!(manager.launches(), 0);
    assert!(!manager.is_running().await);
}

#[tokio::test]
async fn health_check_targets_the_configured_server_port() {
    let base = spawn_server(fake_server(Arc::new(AtomicBool::new(true)))).await;
    let port: u16 = base.rsplit(':').next().unwrap().parse().unwrap();

    let mut server = shell_launch("exit 1", 5);
    server.host = "127.0.0.1".to_string();
    server.port = port;
    let config = Config {
        server,
        // No base_url: the client follows server.host and server.port
        client: ClientConfig {
            health_timeout_secs: 1,
            ..ClientConfig::default()
        },
    };
    let manager = DeployManager::new(config).unwrap();

    assert_eq!(manager.client().config().base_url(), base);
    assert_eq!(manager.setup_service().await.unwrap(), ServiceStatus::AlreadyRunning);
    assert_eq!(manager.launches(), 0);
}

#[tokio::test]
async fn setup_launches_once_when_service_is_absent() {
    let base = spawn_server(fake_server(Arc::new(AtomicBool::new(false)))).await;
    let config = Config {
        server: shell_launch(READY_SCRIPT, 10),
        client: client_config(&base),
    };
    let manager = DeployManager::new(config).unwrap();

    match manager.setup_service().await.unwrap() {
        ServiceStatus::Started { pid, smoke_test_passed } => {
            assert!(pid.is_some());
            assert!(smoke_test_passed);
        }
        other => panic!("expected a launch, got {other:?}"),
    }
    assert_eq!(manager.launches(), 1);
    assert!(manager.is_running().await);

    // The service now answers, so a second setup is a no-op
    assert_eq!(manager.setup_service().await.unwrap(), ServiceStatus::AlreadyRunning);
    assert_eq!(manager.launches(), 1);

    manager.shutdown().await.unwrap();
    assert!(!manager.is_running().await);
}

#[tokio::test]
async fn failed_smoke_test_keeps_server_running() {
    let router = Router::new().route("/v1/models", get(|| async { StatusCode::NOT_FOUND }));
    let base = spawn_server(router).await;
    let config = Config {
        server: shell_launch(READY_SCRIPT, 10),
        client: client_config(&base),
    };
    let manager = DeployManager::new(config).unwrap();

    let status = manager.setup_service().await.unwrap();
    assert!(matches!(status, ServiceStatus::Started { smoke_test_passed: false, .. }));
    assert!(manager.is_running().await);
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn launch_failure_is_returned() {
    let base = spawn_server(fake_server(Arc::new(AtomicBool::new(false)))).await;
    let config = Config {
        server: shell_launch("echo 'Traceback: CUDA out of memory' >&2; exit 1", 5),
        client: client_config(&base),
    };
    let manager = DeployManager::new(config).unwrap();

    let err = manager.setup_service().await.unwrap_err();
    match err.downcast_ref::<LaunchError>() {
        Some(LaunchError::Exited { status }) => assert_eq!(status.code(), Some(1)),
        other => panic!("expected early exit, got {other:?}"),
    }
    assert_eq!(manager.launches(), 1);
    assert!(!manager.is_running().await);
}
