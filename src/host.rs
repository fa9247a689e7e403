//! Host-side instance execution.
//!
//! The host orchestrator builds every instance image, then runs each
//! instance in its own privileged runner container, serially and in
//! declaration order: stale containers are removed, the dind graph
//! volume is prepared, the container is created and started, its stdio
//! is mirrored to the console, and its exit code is tallied into the
//! overall result.

use crate::build::build_instance_image;
use crate::cache::ImageCache;
use crate::constants::{DAEMON_STATE_PATH, LOG_ROOT, RUNNER_EXECUTABLE, RUNNER_PATH};
use crate::daemon::storage_driver;
use crate::engine::{
    demux_frames, volume_exists, AttachStreams, ContainerConfig, Engine, ImageBuilder, StreamKind,
};
use crate::error::{Error, Result};
use crate::resolver::{instance_container_name, instance_image_name, SuiteConfig};
use std::io::Write as _;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Host orchestration settings.
pub struct HostConfig {
    /// Resolved suites to build and run, in order.
    pub suites: Vec<SuiteConfig>,
    /// Optional namespace prefix for instance image tags.
    pub image_namespace: Option<String>,
    /// Path of the executable copied into instance images as the runner.
    pub executable: PathBuf,
    /// Recreate dind graph volumes instead of reusing them.
    pub no_cache: bool,
    /// Pass `-clean` to the suite runner.
    pub clean: bool,
    /// Pass `-debug` to the suite runner.
    pub debug: bool,
}

/// Outcome of a full run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub ran: usize,
    pub failed: usize,
}

/// Builds and runs every suite instance against one engine.
pub struct HostRunner {
    config: HostConfig,
}

impl HostRunner {
    pub fn new(config: HostConfig) -> HostRunner {
        HostRunner { config }
    }

    /// Builds all instance images. The result is locally built and
    /// tagged images ready to run.
    pub async fn build(
        &self,
        engine: &dyn Engine,
        builder: &dyn ImageBuilder,
        cache: &ImageCache,
        token: &CancellationToken,
    ) -> Result<()> {
        let build_start = Instant::now();

        for suite in &self.config.suites {
            for instance in &suite.instances {
                build_instance_image(
                    engine,
                    builder,
                    cache,
                    &suite.path,
                    instance,
                    self.config.image_namespace.as_deref(),
                    &self.config.executable,
                    token,
                )
                .await
                .map_err(|e| Error::BuildFailed(format!("failure building image: {}", e)))?;
            }
        }

        info!(elapsed = ?build_start.elapsed(), "test image build complete");
        Ok(())
    }

    /// Runs every instance, mirroring its output to the console.
    ///
    /// Returns [`Error::TestsFailed`] when any instance exits non-zero;
    /// the summary with counts and total runtime is logged either way.
    pub async fn run(
        &self,
        engine: &dyn Engine,
        token: &CancellationToken,
    ) -> Result<RunSummary> {
        let runner_start = Instant::now();
        let mut summary = RunSummary::default();

        for suite in &self.config.suites {
            for instance in &suite.instances {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let exit_code = self.run_instance(engine, suite, &instance.name).await?;
                summary.ran += 1;
                if exit_code != 0 {
                    error!("test failed with exit code {}", exit_code);
                    summary.failed += 1;
                }
            }
        }

        info!(
            elapsed = ?runner_start.elapsed(),
            ran = summary.ran,
            failed = summary.failed,
            "test runner complete"
        );

        if summary.failed > 0 {
            return Err(Error::TestsFailed {
                failed: summary.failed,
                ran: summary.ran,
            });
        }
        Ok(summary)
    }

    /// Runs one instance container to completion and returns its exit
    /// code.
    async fn run_instance(
        &self,
        engine: &dyn Engine,
        suite: &SuiteConfig,
        instance_name: &str,
    ) -> Result<i64> {
        let container_name = instance_container_name(instance_name);
        let image_name = instance_image_name(self.config.image_namespace.as_deref(), instance_name);
        info!(
            instance = instance_name,
            image = %image_name,
            container = %container_name,
            "running instance"
        );

        // A previous run may have left a container under this name.
        if let Ok(existing) = engine.container_inspect(&container_name).await {
            engine
                .container_remove(&existing.id, true, true)
                .await
                .map_err(|e| Error::EngineOperationFailed {
                    operation: "remove existing container".to_string(),
                    reason: format!("{}: {}", container_name, e),
                })?;
        }

        let mut config = ContainerConfig {
            image: image_name,
            cmd: self.runner_command(suite),
            working_dir: RUNNER_PATH.to_string(),
            privileged: true,
            volumes: vec![LOG_ROOT.to_string()],
            ..Default::default()
        };

        if suite.dind {
            config
                .env
                .push(format!("DOCKER_GRAPHDRIVER={}", storage_driver()));

            let volume_name = format!("{}-graph", container_name);
            let mut create_volume = !volume_exists(engine, &volume_name).await?;
            if !create_volume && self.config.no_cache {
                engine.volume_remove(&volume_name).await?;
                create_volume = true;
            }
            if create_volume {
                engine.volume_create(&volume_name).await?;
            }

            debug!("mounting {} to {}", volume_name, DAEMON_STATE_PATH);
            config
                .binds
                .push(format!("{}:{}", volume_name, DAEMON_STATE_PATH));
        }

        let created = engine.container_create(&container_name, &config).await?;
        for warning in &created.warnings {
            warn!("container {:?} create warning: {}", container_name, warning);
        }

        engine.container_start(&created.id).await?;

        let streams = engine.container_attach(&created.id).await?;
        mirror_streams(streams).await?;

        let inspected = engine.container_inspect(&created.id).await?;
        Ok(inspected.exit_code)
    }

    /// Entrypoint for the runner container.
    fn runner_command(&self, suite: &SuiteConfig) -> Vec<String> {
        let mut cmd = vec![RUNNER_EXECUTABLE.to_string()];
        if suite.dind {
            cmd.push("-docker".to_string());
        }
        if self.config.clean {
            cmd.push("-clean".to_string());
        }
        if self.config.debug {
            cmd.push("-debug".to_string());
        }
        cmd
    }
}

/// Copies attached container output to the host console, demultiplexing
/// framed streams.
async fn mirror_streams(streams: AttachStreams) -> Result<()> {
    match streams {
        AttachStreams::Framed(reader) => {
            demux_frames(reader, |kind, bytes| match kind {
                StreamKind::Stdout => std::io::stdout().write_all(bytes),
                StreamKind::Stderr => std::io::stderr().write_all(bytes),
            })
            .await
            .map_err(|e| Error::EngineOperationFailed {
                operation: "attach copy".to_string(),
                reason: e.to_string(),
            })?;
        }
        AttachStreams::Split { stdout, stderr } => {
            let out_task = tokio::spawn(async move {
                let mut reader = stdout;
                let mut sink = tokio::io::stdout();
                let _ = tokio::io::copy(&mut reader, &mut sink).await;
            });
            if let Some(stderr) = stderr {
                let mut reader = stderr;
                let mut sink = tokio::io::stderr();
                let _ = tokio::io::copy(&mut reader, &mut sink).await;
            }
            let _ = out_task.await;
        }
    }
    Ok(())
}
