//! ernie-deploy: run a local FastDeploy server for ERNIE-4.5 and talk to it
//!
//! This library provides:
//! - Launching the inference server and waiting for its readiness log lines
//! - Health checks and a chat completion smoke test against `/v1`
//! - Idempotent check → start → smoke-test setup
//! - A weather assistant that routes queries to an MCP weather tool
//!
//! # Example
//!
//! ```no_run
//! use ernie_deploy::{Config, DeployManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeployManager::new(Config::default())?;
//!
//!     // Launches only if nothing answers on port 8180
//!     let status = manager.setup_service().await?;
//!     println!("{:?}", status);
//!
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod client;
pub mod config;
pub mod manager;
pub mod openai;
pub mod process;

pub use agent::{Assistant, DialogueMemory, McpWeatherTool, WeatherTool};
pub use client::ServiceClient;
pub use config::{ClientConfig, Config, LaunchConfig};
pub use manager::{DeployManager, ServiceStatus};
pub use process::{LaunchError, ReadinessTracker, ServerProcess};

pub type Result<T> = std::result::Result<T, anyhow::Error>;
