//! Launch and client configuration.
//!
//! Every field has a default matching the stock ERNIE-4.5-21B-A3B deployment,
//! so an empty JSON object (or no file at all) is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "baidu/ERNIE-4.5-21B-A3B-Paddle";
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8180;

/// Log substrings FastDeploy prints while starting up, in the order they appear.
pub const DEFAULT_READINESS_MARKERS: [&str; 4] = [
    "Loading Weights: 100%",
    "Loading Layers: 100%",
    "Worker processes are launched",
    "Uvicorn running on",
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: LaunchConfig,
    pub client: ClientConfig,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Loads `path` if given, otherwise returns the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    /// Client settings pointed at the launched server unless the client has
    /// its own `base_url`.
    pub fn client_config(&self) -> ClientConfig {
        let mut client = self.client.clone();
        client
            .base_url
            .get_or_insert_with(|| ClientConfig::base_url_for(&self.server.host, self.server.port));
        client
    }
}

/// How to launch the inference server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Interpreter that runs the FastDeploy entrypoint.
    pub python: String,
    pub model: String,
    pub host: String,
    pub port: u16,
    pub metrics_port: u16,
    pub engine_worker_queue_port: u16,
    pub max_model_len: u32,
    pub max_num_seqs: u32,
    pub readiness_timeout_secs: u64,
    pub readiness_markers: Vec<String>,
    /// Child output is appended here as well as logged.
    pub log_file: Option<PathBuf>,
    /// Replaces the FastDeploy command line entirely when set.
    pub program: Option<String>,
    pub args: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            python: "python".to_string(),
            model: DEFAULT_MODEL.to_string(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            metrics_port: 8181,
            engine_worker_queue_port: 8182,
            max_model_len: 32768,
            max_num_seqs: 32,
            readiness_timeout_secs: 120,
            readiness_markers: DEFAULT_READINESS_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            log_file: default_log_file(),
            program: None,
            args: Vec::new(),
        }
    }
}

impl LaunchConfig {
    /// Program and argument vector for the server process.
    pub fn command(&self) -> (String, Vec<String>) {
        if let Some(program) = &self.program {
            return (program.clone(), self.args.clone());
        }

        let args = vec![
            "-m".to_string(),
            "fastdeploy.entrypoints.openai.api_server".to_string(),
            "--model".to_string(),
            self.model.clone(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--metrics-port".to_string(),
            self.metrics_port.to_string(),
            "--engine-worker-queue-port".to_string(),
            self.engine_worker_queue_port.to_string(),
            "--max-model-len".to_string(),
            self.max_model_len.to_string(),
            "--max-num-seqs".to_string(),
            self.max_num_seqs.to_string(),
        ];
        (self.python.clone(), args)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

fn default_log_file() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("ernie-deploy").join("fastdeploy.log"))
}

/// How to talk to the running server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// e.g. `http://0.0.0.0:8180`; `/v1/...` is appended per request.
    /// Unset means the launched server's host and port.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub api_key: String,
    /// Model name sent in chat requests. FastDeploy serves one model and ignores it.
    pub model: String,
    pub health_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub smoke_test_max_tokens: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: "null".to_string(),
            model: "null".to_string(),
            health_timeout_secs: 3,
            request_timeout_secs: 60,
            smoke_test_max_tokens: 128,
        }
    }
}

impl ClientConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn base_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| Self::base_url_for(DEFAULT_HOST, DEFAULT_PORT))
    }

    pub fn base_url_for(host: &str, port: u16) -> String {
        format!("http://{}:{}", host, port)
    }
}
