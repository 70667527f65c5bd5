use futures::{FutureExt, StreamExt};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};

use crate::config::LaunchConfig;

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server process has no {0} pipe")]
    MissingPipe(&'static str),
    #[error("server not ready after {timeout:?}, still waiting for {missing:?}")]
    Timeout {
        timeout: Duration,
        missing: Vec<String>,
    },
    #[error("server exited before becoming ready ({status})")]
    Exited { status: ExitStatus },
    #[error("failed to wait on server process: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone)]
struct Marker {
    text: String,
    seen: bool,
}

/// Tracks which startup log markers have shown up in the server output.
///
/// Markers are only ever set. An empty tracker is ready immediately.
#[derive(Debug, Clone)]
pub struct ReadinessTracker {
    markers: Vec<Marker>,
}

impl ReadinessTracker {
    pub fn new<I, S>(markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(|m| Marker {
                    text: m.into(),
                    seen: false,
                })
                .collect(),
        }
    }

    /// Feeds one output line. Returns true if it contained a marker not seen before.
    pub fn observe(&mut self, line: &str) -> bool {
        let mut newly_seen = false;
        for marker in self.markers.iter_mut().filter(|m| !m.seen) {
            if line.contains(&marker.text) {
                marker.seen = true;
                newly_seen = true;
            }
        }
        newly_seen
    }

    pub fn is_ready(&self) -> bool {
        self.markers.iter().all(|m| m.seen)
    }

    pub fn seen_count(&self) -> usize {
        self.markers.iter().filter(|m| m.seen).count()
    }

    pub fn missing(&self) -> Vec<String> {
        self.markers
            .iter()
            .filter(|m| !m.seen)
            .map(|m| m.text.clone())
            .collect()
    }
}

/// A launched inference server that has printed every readiness marker.
pub struct ServerProcess {
    child: Child,
    pid: Option<u32>,
    readiness: watch::Receiver<ReadinessTracker>,
    // Output readers plus the monitor; aborted on shutdown
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for ServerProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProcess")
            .field("pid", &self.pid)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl ServerProcess {
    /// Spawns the configured server and waits until all readiness markers have
    /// been printed. On timeout or early exit the child is killed and an error
    /// is returned, so a handle always refers to a ready server.
    pub async fn spawn(config: &LaunchConfig) -> Result<Self, LaunchError> {
        let (program, args) = config.command();
        tracing::info!(program = %program, args = ?args, "Launching inference server");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

        let (line_tx, line_rx) = mpsc::channel::<String>(256);
        let tracker = ReadinessTracker::new(config.readiness_markers.iter().cloned());
        let (ready_tx, ready_rx) = watch::channel(tracker);

        let tasks = vec![
            tokio::spawn(forward_lines(stdout, "stdout", line_tx.clone())),
            tokio::spawn(forward_lines(stderr, "stderr", line_tx)),
            tokio::spawn(monitor_output(line_rx, ready_tx, config.log_file.clone())),
        ];

        let mut process = Self {
            child,
            pid,
            readiness: ready_rx,
            tasks,
        };

        let timeout = config.readiness_timeout();
        tracing::info!(pid = ?pid, timeout = ?timeout, "Waiting for server to become ready...");

        let wait_result = tokio::time::timeout(timeout, process.wait_until_ready()).await;
        match wait_result {
            Ok(Ok(())) => {
                tracing::info!(pid = ?pid, "Inference server is ready");
                Ok(process)
            }
            Ok(Err(e)) => {
                tracing::error!(pid = ?pid, error = %e, "Inference server failed to start");
                process.terminate().await;
                Err(e)
            }
            Err(_) => {
                let missing = process.readiness.borrow().missing();
                tracing::error!(pid = ?pid, missing = ?missing, "Startup timed out, terminating server");
                process.terminate().await;
                Err(LaunchError::Timeout { timeout, missing })
            }
        }
    }

    async fn wait_until_ready(&mut self) -> Result<(), LaunchError> {
        tokio::select! {
            biased;
            ready = self.readiness.wait_for(|t| t.is_ready()).map(|r| r.is_ok()) => {
                if ready {
                    return Ok(());
                }
                // Both pipes closed without the last marker; the child is going away
                let status = self.child.wait().await.map_err(LaunchError::Wait)?;
                Err(LaunchError::Exited { status })
            }
            status = self.child.wait() => {
                let status = status.map_err(LaunchError::Wait)?;
                Err(LaunchError::Exited { status })
            }
        }
    }

    async fn terminate(&mut self) {
        let _ = self.child.kill().await;
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Snapshot of the markers seen so far.
    pub fn readiness(&self) -> ReadinessTracker {
        self.readiness.borrow().clone()
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Blocks until the server exits on its own.
    pub async fn wait(&mut self) -> anyhow::Result<ExitStatus> {
        let status = self.child.wait().await?;
        tracing::warn!(pid = ?self.pid, status = %status, "Inference server exited");
        Ok(status)
    }

    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        tracing::info!(pid = ?self.pid, "Shutting down inference server");
        self.terminate().await;
        Ok(())
    }
}

/// Splits a pipe into lines on `\n` or `\r` (progress bars redraw with `\r`)
/// and hands them to the monitor. Keeps draining even after the monitor is
/// gone so the child never blocks on a full pipe.
async fn forward_lines<R>(reader: R, stream: &'static str, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let codec = AnyDelimiterCodec::new(b"\n\r".to_vec(), b"\n".to_vec());
    let mut lines = FramedRead::new(reader, codec);

    while let Some(chunk) = lines.next().await {
        match chunk {
            Ok(bytes) => {
                let line = String::from_utf8_lossy(&bytes).trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(stream, "server: {}", line);
                let _ = tx.send(line).await;
            }
            Err(e) => {
                tracing::warn!(stream, error = %e, "Stopped reading server output");
                break;
            }
        }
    }
}

async fn monitor_output(
    mut lines: mpsc::Receiver<String>,
    readiness: watch::Sender<ReadinessTracker>,
    log_file: Option<PathBuf>,
) {
    let mut log = match log_file {
        Some(path) => open_log(&path).await,
        None => None,
    };

    while let Some(line) = lines.recv().await {
        // Flushed per line so the file is complete once readiness is published
        let log_failed = match log.as_mut() {
            Some(file) => {
                let written = file.write_all(format!("{}\n", line).as_bytes()).await;
                written.is_err() || file.flush().await.is_err()
            }
            None => false,
        };
        if log_failed {
            tracing::warn!("Failed to write server log, further output is only traced");
            log = None;
        }

        readiness.send_if_modified(|tracker| {
            let newly_seen = tracker.observe(&line);
            if newly_seen {
                tracing::info!(
                    seen = tracker.seen_count(),
                    total = tracker.seen_count() + tracker.missing().len(),
                    "Readiness marker seen: {}",
                    line
                );
            }
            newly_seen
        });
    }

}

async fn open_log(path: &Path) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            tracing::warn!(path = %parent.display(), error = %e, "Failed to create log directory");
            return None;
        }
    }

    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => {
            tracing::info!(path = %path.display(), "Writing server output to log file");
            Some(file)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to open log file");
            None
        }
    }
}
