#![allow(dead_code)]

use axum::Router;
use ernie_deploy::config::{ClientConfig, LaunchConfig};

pub const READY_SCRIPT: &str = "echo 'Loading Weights: 100%'; \
     echo 'Loading Layers: 100%' >&2; \
     printf 'Worker processes are launched\\r'; \
     echo 'INFO:     Uvicorn running on http://0.0.0.0:8180'; \
     sleep 30";

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn spawn_server(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Base URL of a port nothing listens on.
pub async fn dead_base_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn client_config(base_url: &str) -> ClientConfig {
    ClientConfig {
        base_url: Some(base_url.to_string()),
        health_timeout_secs: 1,
        request_timeout_secs: 5,
        ..ClientConfig::default()
    }
}

/// Launch config running `script` under `sh -c` with the default markers.
pub fn shell_launch(script: &str, timeout_secs: u64) -> LaunchConfig {
    LaunchConfig {
        program: Some("sh".to_string()),
        args: vec!["-c".to_string(), script.to_string()],
        readiness_timeout_secs: timeout_secs,
        log_file: None,
        ..LaunchConfig::default()
    }
}
