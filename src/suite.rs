//! In-container suite execution.
//!
//! The suite runner reads the instance plan baked into the image and
//! drives it: setup scripts, an optional nested daemon with a reconciled
//! image set and compose topology, the test scripts, and teardown.
//! Teardown always runs, even when setup or a test failed, and teardown
//! errors never mask the primary error.

use crate::daemon::{start_daemon, DaemonHandle};
use crate::engine::{Engine, EngineConnector};
use crate::error::{Error, Result};
use crate::logs::{copy_reader, LogCapturer};
use crate::reconcile::sync_images;
use crate::resolver::{RunConfiguration, Script};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Everything the in-container runner needs for one instance.
pub struct SuiteRunnerConfig {
    /// Run a nested daemon for the tests.
    pub dind: bool,
    /// Erase the nested daemon's state directory before starting it.
    pub clean_state: bool,
    /// Remove images and tags the manifest does not expect, and build
    /// compose images without cache.
    pub clean_images: bool,
    /// Engine binary for the nested daemon.
    pub daemon_binary: String,
    /// Compose binary driving the compose topology.
    pub compose_binary: String,
    /// Compose file, when the test tree carries one.
    pub compose_file: Option<PathBuf>,
    /// Directory holding the preloaded image set and manifest.
    pub image_root: PathBuf,
    /// The nested daemon's state directory.
    pub state_dir: PathBuf,
    /// The deserialized instance plan.
    pub run: RunConfiguration,
    /// Command run when the plan has no test scripts.
    pub default_command: Option<String>,

    pub script_capturer: Arc<dyn LogCapturer>,
    pub load_capturer: Arc<dyn LogCapturer>,
    pub daemon_capturer: Arc<dyn LogCapturer>,
    pub test_capturer: Arc<dyn LogCapturer>,
    pub compose_capturer: Option<Arc<dyn LogCapturer>>,
}

/// Runtime manager for the test inside the suite instance container.
pub struct SuiteRunner {
    config: SuiteRunnerConfig,
    daemon: Option<(Arc<dyn Engine>, DaemonHandle)>,
}

impl SuiteRunner {
    pub fn new(config: SuiteRunnerConfig) -> SuiteRunner {
        SuiteRunner {
            config,
            daemon: None,
        }
    }

    /// Runs setup scripts and, under dind, brings up the nested daemon,
    /// reconciles the preloaded image set, and starts the compose
    /// topology. Any failure aborts setup; teardown still must be called.
    pub async fn setup(
        &mut self,
        connector: &dyn EngineConnector,
        token: &CancellationToken,
    ) -> Result<()> {
        let setup_start = Instant::now();

        for script in &self.config.run.setup {
            if let Err(e) = run_script(&self.config.script_capturer, script, false, token).await {
                error!(
                    "error running setup script {}: {}",
                    script.command.first().map(String::as_str).unwrap_or(""),
                    e
                );
                return Err(e);
            }
        }

        if self.config.dind {
            if self.config.clean_state {
                clean_directory(&self.config.state_dir).await?;
            }

            let daemon_start = Instant::now();
            debug!("starting daemon");
            let (engine, handle) = start_daemon(
                &self.config.daemon_binary,
                self.config.daemon_capturer.clone(),
                connector,
                token,
            )
            .await?;
            self.daemon = Some((engine.clone(), handle));
            info!(elapsed = ?daemon_start.elapsed(), "daemon startup complete");

            let cleanup_start = Instant::now();
            for container in engine.container_list(true).await? {
                debug!("removing container {}", container.id);
                engine.container_remove(&container.id, true, true).await?;
            }

            sync_images(
                engine.as_ref(),
                &self.config.image_root,
                self.config.clean_images,
                &self.config.load_capturer,
            )
            .await?;
            info!(elapsed = ?cleanup_start.elapsed(), "image sync complete");

            if let Some(compose_file) = self.config.compose_file.clone() {
                self.compose_up(&compose_file, token).await?;
            }
        }

        info!(elapsed = ?setup_start.elapsed(), "setup complete");
        Ok(())
    }

    /// Builds and starts the compose topology, then streams its logs in
    /// the background. Build and up failures abort setup; the log stream
    /// is best-effort.
    async fn compose_up(&self, compose_file: &Path, token: &CancellationToken) -> Result<()> {
        let capturer = self
            .config
            .compose_capturer
            .clone()
            .ok_or_else(|| Error::InvalidConfig("compose file without capturer".to_string()))?;
        let file = compose_file.to_string_lossy().into_owned();
        let env: Vec<String> = std::env::vars()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        debug!("build compose images");
        let build_start = Instant::now();
        let mut build_args = vec![
            self.config.compose_binary.clone(),
            "-f".to_string(),
            file.clone(),
            "build".to_string(),
        ];
        if self.config.clean_images {
            build_args.push("--no-cache".to_string());
        }
        let build_script = Script {
            command: build_args,
            env: env.clone(),
        };
        if let Err(e) = run_script(&capturer, &build_script, false, token).await {
            error!("error running compose build: {}", e);
            return Err(e);
        }
        info!(elapsed = ?build_start.elapsed(), "compose build complete");

        debug!("starting compose containers");
        let up_start = Instant::now();
        let up_script = Script {
            command: vec![
                self.config.compose_binary.clone(),
                "-f".to_string(),
                file.clone(),
                "up".to_string(),
                "-d".to_string(),
            ],
            env,
        };
        if let Err(e) = run_script(&capturer, &up_script, false, token).await {
            error!("error running compose up: {}", e);
            return Err(e);
        }
        info!(elapsed = ?up_start.elapsed(), "compose up complete");

        let log_script = Script {
            command: vec![
                self.config.compose_binary.clone(),
                "-f".to_string(),
                file,
                "logs".to_string(),
            ],
            env: Vec::new(),
        };
        let log_token = token.clone();
        tokio::spawn(async move {
            debug!("listening for compose logs");
            if let Err(e) = run_script(&capturer, &log_script, false, &log_token).await {
                error!("error running compose logs: {}", e);
            }
        });

        Ok(())
    }

    /// Runs the test scripts in order, stopping at the first failure.
    pub async fn run_tests(&self, token: &CancellationToken) -> Result<()> {
        let runner_start = Instant::now();

        let mut scripts: Vec<Script> = self
            .config
            .run
            .test_runner
            .iter()
            .map(|t| t.script.clone())
            .collect();
        if scripts.is_empty() {
            if let Some(command) = &self.config.default_command {
                scripts.push(Script {
                    command: vec![command.clone()],
                    env: Vec::new(),
                });
            }
        }

        for script in &scripts {
            run_script(&self.config.test_capturer, script, true, token).await?;
        }

        info!(elapsed = ?runner_start.elapsed(), "suite runner complete");
        Ok(())
    }

    /// Releases test resources: stops compose containers and shuts the
    /// nested daemon down. Errors are logged, never returned; teardown
    /// must not mask the primary failure.
    pub async fn teardown(&mut self, token: &CancellationToken) {
        let teardown_start = Instant::now();
        if self.config.dind {
            if let (Some(compose_file), Some(capturer)) = (
                self.config.compose_file.clone(),
                self.config.compose_capturer.clone(),
            ) {
                let stop_script = Script {
                    command: vec![
                        self.config.compose_binary.clone(),
                        "-f".to_string(),
                        compose_file.to_string_lossy().into_owned(),
                        "stop".to_string(),
                    ],
                    env: Vec::new(),
                };
                if let Err(e) = run_script(&capturer, &stop_script, false, token).await {
                    error!("error stopping compose: {}", e);
                }
            }

            if let Some((_, handle)) = self.daemon.take() {
                if let Err(e) = handle.shutdown().await {
                    error!("error stopping daemon: {}", e);
                }
            }
        }
        info!(elapsed = ?teardown_start.elapsed(), "teardown complete");
    }
}

/// Runs one script to completion, streaming its output into the
/// capturer. With `inherit_env` the child extends the process
/// environment; otherwise it sees exactly the script's entries.
pub async fn run_script(
    capturer: &Arc<dyn LogCapturer>,
    script: &Script,
    inherit_env: bool,
    token: &CancellationToken,
) -> Result<()> {
    let (program, args) = script
        .command
        .split_first()
        .ok_or_else(|| Error::InvalidConfig("script with empty command".to_string()))?;

    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args);
    if !inherit_env {
        cmd.env_clear();
    }
    for entry in &script.env {
        if let Some((key, value)) = entry.split_once('=') {
            cmd.env(key, value);
        }
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| Error::ScriptStartFailed {
        command: program.clone(),
        reason: e.to_string(),
    })?;

    let mut copies = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        copies.push(tokio::spawn(copy_reader(stdout, capturer.stdout())));
    }
    if let Some(stderr) = child.stderr.take() {
        copies.push(tokio::spawn(copy_reader(stderr, capturer.stderr())));
    }

    let status = tokio::select! {
        status = child.wait() => status.map_err(Error::Io)?,
        _ = token.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(Error::Cancelled);
        }
    };
    for copy in copies {
        let _ = copy.await;
    }

    if !status.success() {
        return Err(Error::ScriptFailed {
            command: program.clone(),
            code: status.code().unwrap_or(-1),
        });
    }
    Ok(())
}

/// Erases the contents of a directory without removing the directory
/// itself; the daemon state dir is usually a mount point.
async fn clean_directory(dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::InvalidConfig(format!("error reading {}: {}", dir.display(), e)))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(Error::Io)?
    {
        let path = entry.path();
        let result = if entry.file_type().await.map_err(Error::Io)?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        result.map_err(|e| {
            Error::InvalidConfig(format!("error cleaning {}: {}", path.display(), e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::testutil::BufferLogCapturer;

    fn script(argv: &[&str]) -> Script {
        Script {
            command: argv.iter().map(|s| s.to_string()).collect(),
            env: Vec::new(),
        }
    }

    #[tokio::test]
    async fn script_output_reaches_capturer() {
        let capturer = Arc::new(BufferLogCapturer::new());
        let out = capturer.stdout.clone();
        let token = CancellationToken::new();

        run_script(
            &(capturer as Arc<dyn LogCapturer>),
            &script(&["echo", "hello"]),
            true,
            &token,
        )
        .await
        .unwrap();

        assert_eq!(out.contents(), b"hello\n");
    }

    #[tokio::test]
    async fn failing_script_reports_exit_code() {
        let capturer: Arc<dyn LogCapturer> = Arc::new(BufferLogCapturer::new());
        let token = CancellationToken::new();

        let err = run_script(&capturer, &script(&["sh", "-c", "exit 3"]), true, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ScriptFailed { code: 3, .. }));
    }

    #[tokio::test]
    async fn empty_command_is_rejected() {
        let capturer: Arc<dyn LogCapturer> = Arc::new(BufferLogCapturer::new());
        let token = CancellationToken::new();

        let err = run_script(&capturer, &script(&[]), true, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn script_env_replaces_environment() {
        let capturer = Arc::new(BufferLogCapturer::new());
        let out = capturer.stdout.clone();
        let token = CancellationToken::new();

        let mut s = script(&["/bin/sh", "-c", "echo ${GOLEM_TEST_MARKER:-unset}"]);
        s.env.push("GOLEM_TEST_MARKER=set".to_string());
        run_script(&(capturer as Arc<dyn LogCapturer>), &s, false, &token)
            .await
            .unwrap();

        assert_eq!(out.contents(), b"set\n");
    }

    #[tokio::test]
    async fn clean_directory_keeps_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/nested"), b"y").unwrap();

        clean_directory(dir.path()).await.unwrap();

        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
