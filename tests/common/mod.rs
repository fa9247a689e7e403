//! In-memory engine and builder fakes shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use golem::engine::{
    AttachStreams, ContainerConfig, ContainerInfo, ContainerSummary, CreatedContainer, Engine,
    EngineConnector, ImageBuilder, ImageSummary, VolumeInfo,
};
use golem::error::{Error, Result};
use golem::logs::{LogCapturer, StreamWriter};
use golem::reference::TaggedRef;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

// =============================================================================
// Fake Engine
// =============================================================================

#[derive(Debug, Clone, Default)]
pub struct FakeImage {
    pub id: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub config: ContainerConfig,
    pub started: bool,
}

#[derive(Default)]
pub struct EngineState {
    pub images: Vec<FakeImage>,
    pub pulled: Vec<String>,
    pub saved: Vec<(String, PathBuf)>,
    pub loaded: Vec<PathBuf>,
    pub removed_images: Vec<String>,
    pub containers: Vec<FakeContainer>,
    pub removed_containers: Vec<String>,
    pub volumes: Vec<String>,
    pub removed_volumes: Vec<String>,
    /// Exit codes by container name; missing entries exit zero.
    pub exit_codes: HashMap<String, i64>,
    /// Remaining version() calls that fail before one succeeds.
    pub version_failures: u32,
    next_container: u64,
}

/// An [`Engine`] holding its whole world in memory.
#[derive(Default)]
pub struct FakeEngine {
    pub state: Mutex<EngineState>,
}

impl FakeEngine {
    pub fn new() -> Arc<FakeEngine> {
        Arc::new(FakeEngine::default())
    }

    /// Seeds an image with the given id and tags.
    pub fn add_image(&self, id: &str, tags: &[&str]) {
        self.state.lock().unwrap().images.push(FakeImage {
            id: id.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        });
    }

    /// Declares the exit code a named container will report.
    pub fn set_exit_code(&self, container_name: &str, code: i64) {
        self.state
            .lock()
            .unwrap()
            .exit_codes
            .insert(container_name.to_string(), code);
    }

    /// Snapshot of (id, sorted tags) for convergence assertions.
    pub fn image_tags(&self) -> BTreeMap<String, Vec<String>> {
        let state = self.state.lock().unwrap();
        state
            .images
            .iter()
            .map(|img| {
                let mut tags = img.tags.clone();
                tags.sort();
                (img.id.clone(), tags)
            })
            .collect()
    }
}

fn missing(reference: &str) -> Error {
    Error::ImageMissing {
        reference: reference.to_string(),
        reason: "no such image".to_string(),
    }
}

#[async_trait]
impl Engine for FakeEngine {
    async fn image_inspect(&self, reference: &str) -> Result<ImageSummary> {
        let state = self.state.lock().unwrap();
        state
            .images
            .iter()
            .find(|img| img.id == reference || img.tags.iter().any(|t| t == reference))
            .map(|img| ImageSummary {
                id: img.id.clone(),
                repo_tags: img.tags.clone(),
            })
            .ok_or_else(|| missing(reference))
    }

    async fn image_list(&self) -> Result<Vec<ImageSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .images
            .iter()
            .map(|img| ImageSummary {
                id: img.id.clone(),
                repo_tags: img.tags.clone(),
            })
            .collect())
    }

    async fn image_pull(&self, reference: &TaggedRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tag = reference.to_string();
        state.pulled.push(tag.clone());
        let id = format!("sha256:pulled-{}", reference.name().replace('/', "-"));
        if !state.images.iter().any(|img| img.id == id) {
            state.images.push(FakeImage {
                id,
                tags: vec![tag],
            });
        }
        Ok(())
    }

    async fn image_save(&self, id: &str, dest: &Path) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.images.iter().any(|img| img.id == id) {
            return Err(missing(id));
        }
        std::fs::write(dest, id.as_bytes()).map_err(Error::Io)?;
        state.saved.push((id.to_string(), dest.to_path_buf()));
        Ok(())
    }

    async fn image_load(&self, tarball: &Path) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if !tarball.exists() {
            return Err(missing(&tarball.to_string_lossy()));
        }
        // Tarballs are named `<image-id>.tar`.
        let id = tarball
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !state.images.iter().any(|img| img.id == id) {
            state.images.push(FakeImage {
                id: id.clone(),
                tags: Vec::new(),
            });
        }
        state.loaded.push(tarball.to_path_buf());
        Ok(format!("Loaded image ID: {}", id))
    }

    async fn image_tag(&self, id: &str, tag: &TaggedRef) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tag = tag.to_string();
        if !state.images.iter().any(|img| img.id == id) {
            return Err(missing(id));
        }
        // Force semantics: steal the tag from any current holder.
        for img in state.images.iter_mut() {
            img.tags.retain(|t| *t != tag);
        }
        if let Some(img) = state.images.iter_mut().find(|img| img.id == id) {
            img.tags.push(tag);
        }
        Ok(())
    }

    async fn image_remove(&self, reference: &str, _force: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removed_images.push(reference.to_string());
        if let Some(img) = state
            .images
            .iter_mut()
            .find(|img| img.tags.iter().any(|t| t == reference))
        {
            img.tags.retain(|t| t != reference);
            return Ok(());
        }
        let before = state.images.len();
        state.images.retain(|img| img.id != reference);
        if state.images.len() == before {
            return Err(missing(reference));
        }
        Ok(())
    }

    async fn container_list(&self, _all: bool) -> Result<Vec<ContainerSummary>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![c.name.clone()],
            })
            .collect())
    }

    async fn container_inspect(&self, name: &str) -> Result<ContainerInfo> {
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter()
            .find(|c| c.id == name || c.name == name)
            .ok_or_else(|| missing(name))?;
        let exit_code = state
            .exit_codes
            .get(&container.name)
            .copied()
            .unwrap_or(0);
        Ok(ContainerInfo {
            id: container.id.clone(),
            running: false,
            exit_code,
        })
    }

    async fn container_create(
        &self,
        name: &str,
        config: &ContainerConfig,
    ) -> Result<CreatedContainer> {
        let mut state = self.state.lock().unwrap();
        state.next_container += 1;
        let id = format!("container-{}", state.next_container);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            config: config.clone(),
            started: false,
        });
        Ok(CreatedContainer {
            id,
            warnings: Vec::new(),
        })
    }

    async fn container_start(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| missing(id))?;
        container.started = true;
        Ok(())
    }

    async fn container_attach(&self, _id: &str) -> Result<AttachStreams> {
        Ok(AttachStreams::Split {
            stdout: Box::new(tokio::io::empty()),
            stderr: None,
        })
    }

    async fn container_remove(&self, id: &str, _force: bool, _volumes: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removed_containers.push(id.to_string());
        state.containers.retain(|c| c.id != id && c.name != id);
        Ok(())
    }

    async fn volume_inspect(&self, name: &str) -> Result<VolumeInfo> {
        let state = self.state.lock().unwrap();
        if state.volumes.iter().any(|v| v == name) {
            Ok(VolumeInfo {
                name: name.to_string(),
            })
        } else {
            Err(missing(name))
        }
    }

    async fn volume_create(&self, name: &str) -> Result<VolumeInfo> {
        let mut state = self.state.lock().unwrap();
        if !state.volumes.iter().any(|v| v == name) {
            state.volumes.push(name.to_string());
        }
        Ok(VolumeInfo {
            name: name.to_string(),
        })
    }

    async fn volume_remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removed_volumes.push(name.to_string());
        state.volumes.retain(|v| v != name);
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        if state.version_failures > 0 {
            state.version_failures -= 1;
            return Err(Error::EngineUnreachable("not up yet".to_string()));
        }
        Ok("1.12.0".to_string())
    }
}

/// Connector handing out a shared fake engine.
pub struct FakeConnector(pub Arc<FakeEngine>);

#[async_trait]
impl EngineConnector for FakeConnector {
    async fn connect(&self) -> Result<Arc<dyn Engine>> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Fake Builder
// =============================================================================

/// One recorded builder invocation.
pub struct BuildRecord {
    pub recipe: String,
    pub manifest: Option<String>,
    pub tag: Option<String>,
    pub image_id: String,
}

/// Builder that snapshots each context and registers the built image
/// with the fake engine, so cache verification resolves locally.
pub struct FakeBuilder {
    engine: Arc<FakeEngine>,
    pub builds: Mutex<Vec<BuildRecord>>,
}

impl FakeBuilder {
    pub fn new(engine: Arc<FakeEngine>) -> FakeBuilder {
        FakeBuilder {
            engine,
            builds: Mutex::new(Vec::new()),
        }
    }

    pub fn build_count(&self) -> usize {
        self.builds.lock().unwrap().len()
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn build(&self, context: &Path, tag: Option<&TaggedRef>) -> Result<String> {
        let recipe = std::fs::read_to_string(context.join("Dockerfile")).map_err(Error::Io)?;
        let manifest = std::fs::read_to_string(context.join("images/images.json")).ok();

        let mut builds = self.builds.lock().unwrap();
        let image_id = format!("sha256:built-{}", builds.len() + 1);
        let tags = tag.map(|t| t.to_string());
        self.engine.add_image(&image_id, &[]);
        if let Some(tag) = &tags {
            let mut state = self.engine.state.lock().unwrap();
            if let Some(img) = state.images.iter_mut().find(|img| img.id == image_id) {
                img.tags.push(tag.clone());
            }
        }
        builds.push(BuildRecord {
            recipe,
            manifest,
            tag: tags,
            image_id: image_id.clone(),
        });
        Ok(image_id)
    }
}

// =============================================================================
// Buffer Capturer
// =============================================================================

/// Shared byte buffer usable as a stream writer.
#[derive(Clone, Default)]
pub struct Buffer(pub Arc<Mutex<Vec<u8>>>);

impl Buffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamWriter for Buffer {
    async fn write_all(&self, buf: &[u8]) -> std::io::Result<()> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(())
    }
}

/// Capturer collecting both streams into buffers.
#[derive(Default)]
pub struct BufferLogCapturer {
    pub stdout: Buffer,
    pub stderr: Buffer,
}

impl BufferLogCapturer {
    pub fn new() -> Arc<BufferLogCapturer> {
        Arc::new(BufferLogCapturer::default())
    }
}

#[async_trait]
impl LogCapturer for BufferLogCapturer {
    fn stdout(&self) -> Arc<dyn StreamWriter> {
        Arc::new(self.stdout.clone())
    }

    fn stderr(&self) -> Arc<dyn StreamWriter> {
        Arc::new(self.stderr.clone())
    }

    async fn close(&self) -> std::io::Result<()> {
        Ok(())
    }
}
