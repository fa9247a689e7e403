//! Engine implementation driving the engine's command-line binary.
//!
//! The orchestrator does not ship a wire-protocol client; it drives the
//! engine through its own CLI, the same way the suite runner drives
//! compose. Every operation is one short-lived subprocess with the
//! connection flags prepended.

use crate::engine::{
    AttachStreams, ContainerConfig, ContainerInfo, ContainerSummary, CreatedContainer, Engine,
    EngineConnector, ImageBuilder, ImageSummary, VolumeInfo,
};
use crate::error::{Error, Result};
use crate::options::EngineOptions;
use crate::reference::TaggedRef;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// Engine client backed by the engine CLI binary.
pub struct CliEngine {
    binary: String,
    options: EngineOptions,
}

impl CliEngine {
    /// A client for the given binary and connection options.
    pub fn new(binary: impl Into<String>, options: EngineOptions) -> CliEngine {
        CliEngine {
            binary: binary.into(),
            options,
        }
    }

    /// A client for the local default socket.
    pub fn local(binary: impl Into<String>) -> CliEngine {
        CliEngine::new(binary, EngineOptions::local())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-H").arg(&self.options.host);
        if let Some(tls) = &self.options.tls {
            cmd.arg(if tls.verify { "--tlsverify" } else { "--tls" });
            if let Some(ca) = &tls.ca_cert {
                cmd.arg("--tlscacert").arg(ca);
            }
            if let Some(cert) = &tls.client_cert {
                cmd.arg("--tlscert").arg(cert);
            }
            if let Some(key) = &tls.client_key {
                cmd.arg("--tlskey").arg(key);
            }
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Runs one engine subcommand to completion, returning trimmed stdout.
    async fn run(&self, operation: &str, args: &[&str]) -> Result<String> {
        debug!(operation, ?args, "engine call");
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .map_err(|e| Error::EngineUnreachable(format!("running {}: {}", self.binary, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_failure(operation, args, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Maps CLI stderr onto the orchestrator's error kinds.
fn classify_failure(operation: &str, args: &[&str], stderr: &str) -> Error {
    let lowered = stderr.to_ascii_lowercase();
    if lowered.contains("cannot connect") || lowered.contains("error during connect") {
        return Error::EngineUnreachable(stderr.to_string());
    }
    if lowered.contains("no such image")
        || lowered.contains("not found")
        || lowered.contains("no such object")
    {
        return Error::ImageMissing {
            reference: args.last().map(|s| s.to_string()).unwrap_or_default(),
            reason: stderr.to_string(),
        };
    }
    Error::EngineOperationFailed {
        operation: operation.to_string(),
        reason: stderr.to_string(),
    }
}

#[async_trait]
impl Engine for CliEngine {
    async fn image_inspect(&self, reference: &str) -> Result<ImageSummary> {
        let out = self
            .run(
                "image inspect",
                &[
                    "image",
                    "inspect",
                    "--format",
                    "{{.Id}}\t{{join .RepoTags \",\"}}",
                    reference,
                ],
            )
            .await?;
        let (id, tags) = out.split_once('\t').unwrap_or((out.as_str(), ""));
        Ok(ImageSummary {
            id: id.to_string(),
            repo_tags: tags
                .split(',')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    async fn image_list(&self) -> Result<Vec<ImageSummary>> {
        let out = self
            .run(
                "image list",
                &[
                    "image",
                    "ls",
                    "--no-trunc",
                    "--format",
                    "{{.ID}}\t{{.Repository}}:{{.Tag}}",
                ],
            )
            .await?;
        let mut by_id: Vec<ImageSummary> = Vec::new();
        for line in out.lines() {
            let Some((id, tag)) = line.split_once('\t') else {
                continue;
            };
            match by_id.iter_mut().find(|s| s.id == id) {
                Some(existing) => existing.repo_tags.push(tag.to_string()),
                None => by_id.push(ImageSummary {
                    id: id.to_string(),
                    repo_tags: vec![tag.to_string()],
                }),
            }
        }
        Ok(by_id)
    }

    async fn image_pull(&self, reference: &TaggedRef) -> Result<()> {
        self.run("image pull", &["pull", &reference.to_string()])
            .await?;
        Ok(())
    }

    async fn image_save(&self, id: &str, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy();
        self.run("image save", &["save", "-o", dest.as_ref(), id])
            .await?;
        Ok(())
    }

    async fn image_load(&self, tarball: &Path) -> Result<String> {
        let tarball = tarball.to_string_lossy();
        self.run("image load", &["load", "-i", tarball.as_ref()])
            .await
    }

    async fn image_tag(&self, id: &str, tag: &TaggedRef) -> Result<()> {
        self.run("image tag", &["tag", id, &tag.to_string()])
            .await?;
        Ok(())
    }

    async fn image_remove(&self, reference: &str, force: bool) -> Result<()> {
        let mut args = vec!["rmi"];
        if force {
            args.push("-f");
        }
        args.push(reference);
        self.run("image remove", &args).await?;
        Ok(())
    }

    async fn container_list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut args = vec!["ps", "--no-trunc"];
        if all {
            args.push("-a");
        }
        args.extend(["--format", "{{.ID}}\t{{.Names}}"]);
        let out = self.run("container list", &args).await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .map(|(id, names)| ContainerSummary {
                id: id.to_string(),
                names: names.split(',').map(str::to_string).collect(),
            })
            .collect())
    }

    async fn container_inspect(&self, name: &str) -> Result<ContainerInfo> {
        let out = self
            .run(
                "container inspect",
                &[
                    "container",
                    "inspect",
                    "--format",
                    "{{.Id}}\t{{.State.Running}}\t{{.State.ExitCode}}",
                    name,
                ],
            )
            .await?;
        let mut parts = out.split('\t');
        let id = parts.next().unwrap_or_default().to_string();
        let running = parts.next() == Some("true");
        let exit_code = parts
            .next()
            .and_then(|c| c.parse().ok())
            .unwrap_or_default();
        Ok(ContainerInfo {
            id,
            running,
            exit_code,
        })
    }

    async fn container_create(
        &self,
        name: &str,
        config: &ContainerConfig,
    ) -> Result<CreatedContainer> {
        let mut args: Vec<String> = vec!["create".into(), "--name".into(), name.into()];
        if config.privileged {
            args.push("--privileged".into());
        }
        if !config.working_dir.is_empty() {
            args.push("-w".into());
            args.push(config.working_dir.clone());
        }
        for env in &config.env {
            args.push("-e".into());
            args.push(env.clone());
        }
        for volume in &config.volumes {
            args.push("-v".into());
            args.push(volume.clone());
        }
        for bind in &config.binds {
            args.push("-v".into());
            args.push(bind.clone());
        }
        args.push(config.image.clone());
        args.extend(config.cmd.iter().cloned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.run("container create", &arg_refs).await?;
        Ok(CreatedContainer {
            id,
            warnings: Vec::new(),
        })
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        self.run("container start", &["start", id]).await?;
        Ok(())
    }

    async fn container_attach(&self, id: &str) -> Result<AttachStreams> {
        let mut child = self
            .command()
            .args(["attach", "--no-stdin", "--sig-proxy=false", id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::EngineUnreachable(format!("attach spawn: {}", e)))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            Error::EngineOperationFailed {
                operation: "container attach".to_string(),
                reason: "missing stdout pipe".to_string(),
            }
        })?;
        let stderr = child.stderr.take();

        // Reap the attach process once the container exits.
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                warn!("attach process wait failed: {}", e);
            }
        });

        Ok(AttachStreams::Split {
            stdout: Box::new(stdout),
            stderr: stderr.map(|e| Box::new(e) as _),
        })
    }

    async fn container_remove(&self, id: &str, force: bool, volumes: bool) -> Result<()> {
        let mut args = vec!["rm"];
        if force {
            args.push("-f");
        }
        if volumes {
            args.push("-v");
        }
        args.push(id);
        self.run("container remove", &args).await?;
        Ok(())
    }

    async fn volume_inspect(&self, name: &str) -> Result<VolumeInfo> {
        let out = self
            .run(
                "volume inspect",
                &["volume", "inspect", "--format", "{{.Name}}", name],
            )
            .await?;
        Ok(VolumeInfo { name: out })
    }

    async fn volume_create(&self, name: &str) -> Result<VolumeInfo> {
        let out = self.run("volume create", &["volume", "create", name]).await?;
        Ok(VolumeInfo { name: out })
    }

    async fn volume_remove(&self, name: &str) -> Result<()> {
        self.run("volume remove", &["volume", "rm", name]).await?;
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        self.run(
            "version",
            &["version", "--format", "{{.Server.Version}}"],
        )
        .await
    }
}

/// Image builder backed by the engine CLI's build command.
pub struct CliImageBuilder {
    engine: Arc<CliEngine>,
}

impl CliImageBuilder {
    pub fn new(engine: Arc<CliEngine>) -> CliImageBuilder {
        CliImageBuilder { engine }
    }
}

#[async_trait]
impl ImageBuilder for CliImageBuilder {
    async fn build(&self, context: &Path, tag: Option<&TaggedRef>) -> Result<String> {
        let context = context.to_string_lossy();
        let mut args: Vec<String> = vec!["build".into(), "-q".into()];
        let tag_string;
        if let Some(tag) = tag {
            tag_string = tag.to_string();
            args.push("-t".into());
            args.push(tag_string);
        }
        args.push(context.into_owned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = self.engine.run("image build", &arg_refs).await?;
        if id.is_empty() {
            return Err(Error::BuildFailed("builder returned no image id".into()));
        }
        Ok(id)
    }
}

/// Connects [`CliEngine`] clients for a fixed binary and options.
pub struct CliEngineConnector {
    binary: String,
    options: EngineOptions,
}

impl CliEngineConnector {
    pub fn new(binary: impl Into<String>, options: EngineOptions) -> CliEngineConnector {
        CliEngineConnector {
            binary: binary.into(),
            options,
        }
    }
}

#[async_trait]
impl EngineConnector for CliEngineConnector {
    async fn connect(&self) -> Result<Arc<dyn Engine>> {
        Ok(Arc::new(CliEngine::new(
            self.binary.clone(),
            self.options.clone(),
        )))
    }
}
