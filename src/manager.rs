use anyhow::Result;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::client::ServiceClient;
use crate::config::Config;
use crate::process::ServerProcess;

/// Outcome of [`DeployManager::setup_service`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceStatus {
    /// A healthy server was already answering; nothing was launched.
    AlreadyRunning,
    /// A new server was launched and became ready.
    Started {
        pid: Option<u32>,
        smoke_test_passed: bool,
    },
}

/// Owns at most one launched inference server and the client used to probe it.
#[derive(Debug, Clone)]
pub struct DeployManager {
    config: Config,
    client: ServiceClient,
    process: Arc<Mutex<Option<ServerProcess>>>,
    launches: Arc<AtomicUsize>,
}

impl DeployManager {
    pub fn new(config: Config) -> Result<Self> {
        let client = ServiceClient::new(config.client_config())?;

        Ok(Self {
            config,
            client,
            process: Arc::new(Mutex::new(None)),
            launches: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &ServiceClient {
        &self.client
    }

    /// Number of server processes this manager has spawned.
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    pub async fn check_service(&self) -> bool {
        self.client.check_service().await
    }

    pub async fn smoke_test(&self) -> Option<String> {
        self.client.smoke_test().await
    }

    /// Launches the server and waits for readiness, replacing any server this
    /// manager already owns.
    pub async fn start(&self) -> Result<Option<u32>> {
        let mut guard = self.process.lock().await;
        self.launch_locked(&mut guard).await
    }

    async fn launch_locked(&self, slot: &mut Option<ServerProcess>) -> Result<Option<u32>> {
        if let Some(old) = slot.take() {
            tracing::warn!(pid = ?old.pid(), "Replacing previously launched server");
            old.shutdown().await?;
        }

        self.launches.fetch_add(1, Ordering::Relaxed);
        let process = ServerProcess::spawn(&self.config.server).await?;
        let pid = process.pid();
        *slot = Some(process);
        Ok(pid)
    }

    /// check-service → (if absent) start → wait for readiness → smoke test.
    ///
    /// Idempotent: while a healthy service answers, repeated calls launch
    /// nothing. An unhealthy service gets exactly one launch attempt.
    pub async fn setup_service(&self) -> Result<ServiceStatus> {
        // Held across check and launch so concurrent callers cannot both launch
        let mut guard = self.process.lock().await;

        if self.client.check_service().await {
            tracing::info!(url = %self.client.config().base_url(), "Service already running, skipping launch");
            return Ok(ServiceStatus::AlreadyRunning);
        }

        tracing::info!("Service not available, starting inference server");
        let pid = self.launch_locked(&mut guard).await?;
        drop(guard);

        let smoke_test_passed = match self.client.smoke_test().await {
            Some(content) => {
                tracing::info!(pid = ?pid, "Model answered: {}", content);
                true
            }
            None => {
                tracing::warn!(pid = ?pid, "Server is up but the smoke test failed");
                false
            }
        };

        Ok(ServiceStatus::Started {
            pid,
            smoke_test_passed,
        })
    }

    /// Waits for the owned server to exit. Returns `None` when this manager
    /// does not own a server (for example, one was already running).
    pub async fn wait(&self) -> Result<Option<ExitStatus>> {
        let mut guard = self.process.lock().await;
        match guard.as_mut() {
            Some(process) => {
                let status = process.wait().await?;
                *guard = None;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        let mut guard = self.process.lock().await;
        guard.as_mut().map(|p| p.is_running()).unwrap_or(false)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let mut guard = self.process.lock().await;
        if let Some(process) = guard.take() {
            process.shutdown().await?;
        }
        Ok(())
    }
}
