//! # Engine Abstraction
//!
//! The orchestrator consumes the container engine through the [`Engine`]
//! trait and the image builder through [`ImageBuilder`]. The core never
//! depends on a concrete engine protocol; [`cli::CliEngine`] drives the
//! engine's own command-line binary for real runs, and the test suite
//! substitutes in-memory fakes.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  planner / host runner / suite runner / reconciler       │
//! │        │                    │                            │
//! │        ▼                    ▼                            │
//! │  dyn Engine           dyn ImageBuilder                   │
//! │        │                    │                            │
//! │  CliEngine (prod)     CliImageBuilder (prod)             │
//! │  FakeEngine (tests)   FakeBuilder (tests)                │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod cli;

use crate::error::Result;
use crate::reference::TaggedRef;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Owned async byte stream, as returned by attach.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// =============================================================================
// Data Types
// =============================================================================

/// An image known to the engine.
#[derive(Debug, Clone, Default)]
pub struct ImageSummary {
    /// Content-addressed image id.
    pub id: String,
    /// Repository tags pointing at this image. May contain `<none>`-style
    /// placeholders for dangling images.
    pub repo_tags: Vec<String>,
}

/// A container known to the engine.
#[derive(Debug, Clone, Default)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
}

/// Inspected container state.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub id: String,
    pub running: bool,
    pub exit_code: i64,
}

/// Inspected volume state.
#[derive(Debug, Clone, Default)]
pub struct VolumeInfo {
    pub name: String,
}

/// Creation parameters for the runner container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Image to run.
    pub image: String,
    /// Entrypoint command and arguments.
    pub cmd: Vec<String>,
    /// Environment entries, `KEY=VALUE`.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Run with full privileges. Runner containers require this.
    pub privileged: bool,
    /// Anonymous volume mount points.
    pub volumes: Vec<String>,
    /// Bind mounts, `volume-or-path:container-path`.
    pub binds: Vec<String>,
}

/// Result of creating a container.
#[derive(Debug, Clone, Default)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Attached stdio of a running container.
///
/// Engines either hand back already-split stdout/stderr pipes or one
/// multiplexed stream carrying 8-byte frame headers; the host runner
/// demultiplexes the latter with [`demux_frames`].
pub enum AttachStreams {
    /// One stream multiplexed with stdcopy-style frame headers.
    Framed(BoxedReader),
    /// Separate plain streams.
    Split {
        stdout: BoxedReader,
        stderr: Option<BoxedReader>,
    },
}

// =============================================================================
// Traits
// =============================================================================

/// The container engine operations the orchestrator consumes.
///
/// Implementations must be safe to share behind an `Arc`; the host
/// orchestrator owns one client, and the suite runner owns one client per
/// nested daemon.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Resolves an image reference or id to its content-addressed id.
    /// Missing images surface as [`crate::Error::ImageMissing`].
    async fn image_inspect(&self, reference: &str) -> Result<ImageSummary>;

    /// Lists all images.
    async fn image_list(&self) -> Result<Vec<ImageSummary>>;

    /// Pulls a named-tagged reference from its registry.
    async fn image_pull(&self, reference: &TaggedRef) -> Result<()>;

    /// Saves an image to a tarball on disk.
    async fn image_save(&self, id: &str, dest: &Path) -> Result<()>;

    /// Loads an image tarball from disk, returning the engine's load
    /// output for the caller's log stream.
    async fn image_load(&self, tarball: &Path) -> Result<String>;

    /// Applies a tag to an image, stealing it from any current holder.
    async fn image_tag(&self, id: &str, tag: &TaggedRef) -> Result<()>;

    /// Removes an image or tag.
    async fn image_remove(&self, reference: &str, force: bool) -> Result<()>;

    /// Lists containers, including stopped ones when `all` is set.
    async fn container_list(&self, all: bool) -> Result<Vec<ContainerSummary>>;

    /// Inspects a container by name or id.
    async fn container_inspect(&self, name: &str) -> Result<ContainerInfo>;

    /// Creates a container.
    async fn container_create(
        &self,
        name: &str,
        config: &ContainerConfig,
    ) -> Result<CreatedContainer>;

    /// Starts a created container.
    async fn container_start(&self, id: &str) -> Result<()>;

    /// Attaches to a container's stdout/stderr. The stream ends when the
    /// container terminates.
    async fn container_attach(&self, id: &str) -> Result<AttachStreams>;

    /// Removes a container, optionally forcing and dropping its anonymous
    /// volumes.
    async fn container_remove(&self, id: &str, force: bool, volumes: bool) -> Result<()>;

    /// Inspects a named volume. Absent volumes surface as an error.
    async fn volume_inspect(&self, name: &str) -> Result<VolumeInfo>;

    /// Creates a named volume.
    async fn volume_create(&self, name: &str) -> Result<VolumeInfo>;

    /// Removes a named volume.
    async fn volume_remove(&self, name: &str) -> Result<()>;

    /// Queries the engine's version endpoint. Used both for feature
    /// detection and as the daemon-startup liveness probe.
    async fn version(&self) -> Result<String>;
}

/// True when a named volume inspects successfully. An inspect failure
/// counts as absent; a real engine fault resurfaces on the create that
/// follows.
pub async fn volume_exists(engine: &dyn Engine, name: &str) -> Result<bool> {
    match engine.volume_inspect(name).await {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

/// The external image builder: consumes a build-context directory whose
/// recipe was assembled by the planner, returns the built image id.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, context: &Path, tag: Option<&TaggedRef>) -> Result<String>;
}

/// Connects to an engine endpoint. Threaded into daemon startup so the
/// suite runner can obtain a client for the engine it just spawned.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self) -> Result<std::sync::Arc<dyn Engine>>;
}

// =============================================================================
// Frame Demultiplexing
// =============================================================================

/// Which stdio stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Demultiplexes a framed attach stream into stdout/stderr sinks.
///
/// The wire format is the engine's stdio multiplexing: an 8-byte header
/// `[kind, 0, 0, 0, len_be32]` followed by `len` payload bytes. Stdin
/// frames (kind 0) are folded into stdout. Returns the total payload
/// bytes copied.
pub async fn demux_frames<R, F>(mut reader: R, mut write: F) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    F: FnMut(StreamKind, &[u8]) -> std::io::Result<()>,
{
    let mut header = [0u8; 8];
    let mut payload = vec![0u8; 32 * 1024];
    let mut total = 0u64;
    loop {
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(total),
            Err(e) => return Err(e),
        }
        let kind = match header[0] {
            0 | 1 => StreamKind::Stdout,
            2 => StreamKind::Stderr,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unknown stream kind {}", other),
                ));
            }
        };
        let len = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if payload.len() < len {
            payload.resize(len, 0);
        }
        reader.read_exact(&mut payload[..len]).await?;
        write(kind, &payload[..len])?;
        total += len as u64;
    }
}

/// Splits `KEY=VALUE` entries into a map, last value winning.
pub fn env_to_map(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .filter_map(|e| e.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
