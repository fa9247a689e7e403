//! Nested daemon lifecycle.
//!
//! The suite runner starts a container engine inside the runner container
//! and waits for it to answer version queries before letting setup
//! proceed. The daemon's output streams into a named log capturer so test
//! logs and daemon logs stay separated.

use crate::constants::{
    DAEMON_KILL_GRACE, DAEMON_PID_FILE, DAEMON_POLL_BUDGET, DAEMON_POLL_INTERVAL,
    DAEMON_START_GRACE, DEFAULT_STORAGE_DRIVER,
};
use crate::engine::{Engine, EngineConnector};
use crate::error::{Error, Result};
use crate::logs::{copy_reader, LogCapturer};
use crate::version::{binary_version, EngineVersion};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Owns the nested daemon process. Dropping the handle leaves the daemon
/// running; call [`DaemonHandle::shutdown`] during teardown.
pub struct DaemonHandle {
    child: tokio::process::Child,
    pid_file: String,
}

impl DaemonHandle {
    /// Kills the daemon process and removes its pid file.
    pub async fn shutdown(mut self) -> Result<()> {
        self.child.start_kill().map_err(Error::Io)?;
        let _ = self.child.wait().await;
        tokio::time::sleep(DAEMON_KILL_GRACE).await;
        match tokio::fs::remove_file(&self.pid_file).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Storage driver for the nested daemon, from `DOCKER_GRAPHDRIVER`.
pub fn storage_driver() -> String {
    match std::env::var("DOCKER_GRAPHDRIVER") {
        Ok(driver) if !driver.is_empty() => driver,
        _ => DEFAULT_STORAGE_DRIVER.to_string(),
    }
}

/// Starts the nested daemon and waits for it to become reachable.
///
/// The daemon subcommand depends on the binary's release: versions below
/// 1.8 take a `--daemon` flag where newer ones have a `daemon`
/// subcommand. Startup is given a grace period plus a bounded poll
/// budget; exhausting the budget kills the child and fails.
pub async fn start_daemon(
    binary: &str,
    capturer: Arc<dyn LogCapturer>,
    connector: &dyn EngineConnector,
    token: &CancellationToken,
) -> Result<(Arc<dyn Engine>, DaemonHandle)> {
    let version = binary_version(binary).await?;
    debug!("starting daemon with {} ({})", binary, version);

    let mut args: Vec<String> = Vec::new();
    if version.less_than(&EngineVersion::of(1, 8, 0)) {
        args.push("--daemon".to_string());
    } else {
        args.push("daemon".to_string());
    }
    args.push("--log-level=debug".to_string());
    args.push(format!("--storage-driver={}", storage_driver()));

    let mut child = tokio::process::Command::new(binary)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::DaemonStartFailed(format!("could not start daemon: {}", e)))?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(copy_reader(stdout, capturer.stdout()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(copy_reader(stderr, capturer.stderr()));
    }

    let handle = DaemonHandle {
        child,
        pid_file: DAEMON_PID_FILE.to_string(),
    };

    debug!("waiting for daemon to start");
    tokio::time::sleep(DAEMON_START_GRACE).await;

    let start = Instant::now();
    let engine = connector.connect().await?;
    let mut attempts = 0u32;
    loop {
        match engine.version().await {
            Ok(version) => {
                debug!("established connection to daemon with version {}", version);
                break;
            }
            Err(e) => {
                if attempts >= DAEMON_POLL_BUDGET {
                    error!("failed to establish connection to daemon: {}", e);
                    let _ = handle.shutdown().await;
                    return Err(Error::DaemonStartFailed(format!(
                        "daemon unreachable after {} attempts: {}",
                        attempts, e
                    )));
                }
                attempts += 1;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(DAEMON_POLL_INTERVAL) => {}
            _ = token.cancelled() => {
                let _ = handle.shutdown().await;
                return Err(Error::Cancelled);
            }
        }
    }
    info!(elapsed = ?start.elapsed(), "daemon startup complete");

    Ok((engine, handle))
}
