//! Configuration resolution.
//!
//! Suite settings come from three layers: command-line overrides, the
//! suite file, and built-in defaults. Each layer is a resolver variant;
//! [`Resolver::Multi`] composes them in priority order and resolves every
//! field with its own merge rule. Resolvers never fail; reference parsing
//! happens earlier, when each layer is constructed.

use crate::matrix::expand_custom_image_matrix;
use crate::reference::{ImageRef, TaggedRef};
use crate::suite_file::SuiteFileResolver;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

// =============================================================================
// Data Model
// =============================================================================

/// A command to run, with its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Script {
    /// Command argv. Never empty for a runnable script.
    pub command: Vec<String>,
    /// Environment entries, `KEY=VALUE`.
    #[serde(default)]
    pub env: Vec<String>,
}

/// A test command carrying an output format tag.
///
/// The format is recorded and re-serialized but never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TestScript {
    #[serde(flatten)]
    pub script: Script,
    #[serde(default)]
    pub format: String,
}

/// The full command plan for one test instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunConfiguration {
    #[serde(default)]
    pub setup: Vec<Script>,
    #[serde(default, rename = "runner")]
    pub test_runner: Vec<TestScript>,
}

/// An image that will exist inside the runner container under a chosen
/// target tag, exported from the host engine's `source` image.
#[derive(Debug, Clone, Eq)]
pub struct CustomImage {
    /// Reference pulled on the host. May carry a tag.
    pub source: ImageRef,
    /// Tag the image must appear under inside the runner container.
    pub target: TaggedRef,
    /// Opaque token exported as `<TARGET>_VERSION`.
    pub version: String,
    /// Marks an entry originating from suite-file defaults; displaced by
    /// any non-default entry for the same target.
    pub default_only: bool,
}

impl PartialEq for CustomImage {
    /// Origin (`default_only`) does not participate in identity.
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
            && self.target == other.target
            && self.version == other.version
    }
}

impl std::fmt::Display for CustomImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.version.is_empty() {
            write!(f, "{},{}", self.target, self.source)
        } else {
            write!(f, "{},{},{}", self.target, self.source, self.version)
        }
    }
}

/// Inputs to one base-image build.
#[derive(Debug, Clone)]
pub struct BaseImageConfig {
    pub base: TaggedRef,
    pub extra_images: Vec<TaggedRef>,
    pub custom_images: Vec<CustomImage>,
}

/// One row of the expanded matrix: exactly one runner-container execution.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub name: String,
    pub base_image: BaseImageConfig,
    pub run: RunConfiguration,
}

/// A resolved suite: base configuration plus its expanded instances.
#[derive(Debug, Clone)]
pub struct SuiteConfig {
    pub name: String,
    pub path: PathBuf,
    pub dind: bool,
    pub instances: Vec<InstanceConfig>,
}

// =============================================================================
// Resolver Stack
// =============================================================================

/// One layer of suite configuration, or a composition of layers.
pub enum Resolver {
    Flag(FlagResolver),
    SuiteFile(SuiteFileResolver),
    Default(DefaultResolver),
    Multi(Vec<Resolver>),
}

/// Command-line overrides. Holds only what flags can set.
#[derive(Default)]
pub struct FlagResolver {
    custom_images: Vec<CustomImage>,
}

impl FlagResolver {
    pub fn new(custom_images: Vec<CustomImage>) -> FlagResolver {
        FlagResolver { custom_images }
    }

    /// Parses a `-i target,source[,version]` override. The target must be
    /// a named-tagged reference; an omitted version falls back to the
    /// source tag, then the target tag.
    pub fn parse_custom_image(value: &str) -> crate::error::Result<CustomImage> {
        let parts: Vec<&str> = value.split(',').collect();
        if parts.len() < 2 || parts.len() > 3 {
            return Err(crate::error::Error::InvalidConfig(format!(
                "invalid custom image '{}', expected \"target,source[,version]\"",
                value
            )));
        }
        let target = TaggedRef::parse(parts[0])?;
        let source = crate::reference::parse_reference(parts[1])?;

        let version = match parts.get(2) {
            Some(version) => version.to_string(),
            None => match &source {
                ImageRef::Tagged(t) => t.tag().to_string(),
                ImageRef::Named(_) => target.tag().to_string(),
            },
        };

        Ok(CustomImage {
            source,
            target,
            version,
            default_only: false,
        })
    }
}

/// Built-in fallbacks, constructed once in `main` and passed down
/// explicitly.
pub struct DefaultResolver {
    base: TaggedRef,
    path: PathBuf,
}

impl DefaultResolver {
    pub fn new(base: TaggedRef, path: PathBuf) -> DefaultResolver {
        DefaultResolver { base, path }
    }
}

impl Resolver {
    /// First non-empty name in priority order.
    pub fn name(&self) -> String {
        match self {
            Resolver::Flag(_) => String::new(),
            Resolver::SuiteFile(s) => s.name().to_string(),
            Resolver::Default(_) => "default".to_string(),
            Resolver::Multi(stack) => stack
                .iter()
                .map(Resolver::name)
                .find(|n| !n.is_empty())
                .unwrap_or_default(),
        }
    }

    /// First non-empty path in priority order.
    pub fn path(&self) -> Option<PathBuf> {
        match self {
            Resolver::Flag(_) => None,
            Resolver::SuiteFile(s) => Some(s.path().to_path_buf()),
            Resolver::Default(d) => Some(d.path.clone()),
            Resolver::Multi(stack) => stack.iter().find_map(Resolver::path),
        }
    }

    /// First configured base image in priority order.
    pub fn base_image(&self) -> Option<TaggedRef> {
        match self {
            Resolver::Flag(_) => None,
            Resolver::SuiteFile(s) => s.base_image().cloned(),
            Resolver::Default(d) => Some(d.base.clone()),
            Resolver::Multi(stack) => stack.iter().find_map(Resolver::base_image),
        }
    }

    /// True if any layer enables docker-in-docker. A non-empty extra
    /// image set implies it: preloaded images need a daemon to land in.
    pub fn dind(&self) -> bool {
        match self {
            Resolver::Flag(_) | Resolver::Default(_) => false,
            Resolver::SuiteFile(s) => s.dind(),
            Resolver::Multi(stack) => {
                stack.iter().any(Resolver::dind) || !self.images().is_empty()
            }
        }
    }

    /// Set-union of extra images across layers, deduplicated by
    /// canonical reference, in order of first appearance.
    pub fn images(&self) -> Vec<TaggedRef> {
        match self {
            Resolver::Flag(_) | Resolver::Default(_) => Vec::new(),
            Resolver::SuiteFile(s) => s.images().to_vec(),
            Resolver::Multi(stack) => {
                let mut images: Vec<TaggedRef> = Vec::new();
                for resolver in stack {
                    for image in resolver.images() {
                        if !images.contains(&image) {
                            images.push(image);
                        }
                    }
                }
                images
            }
        }
    }

    /// Setup and test scripts concatenated in priority order.
    pub fn run_configuration(&self) -> RunConfiguration {
        match self {
            Resolver::Flag(_) | Resolver::Default(_) => RunConfiguration::default(),
            Resolver::SuiteFile(s) => s.run_configuration(),
            Resolver::Multi(stack) => {
                let mut run = RunConfiguration::default();
                for resolver in stack {
                    let layer = resolver.run_configuration();
                    run.setup.extend(layer.setup);
                    run.test_runner.extend(layer.test_runner);
                }
                run
            }
        }
    }

    /// Per-target custom-image override merge.
    ///
    /// A default-only entry is displaced by any non-default entry with
    /// the same target; two non-default entries with equal source and
    /// version deduplicate; divergent non-default entries both survive
    /// and become separate matrix rows. Only targets that some layer
    /// declares as default-only accept entries at all.
    pub fn custom_images(&self) -> Vec<CustomImage> {
        match self {
            Resolver::Flag(f) => f.custom_images.clone(),
            Resolver::Default(_) => Vec::new(),
            Resolver::SuiteFile(s) => s.custom_images().to_vec(),
            Resolver::Multi(stack) => {
                let mut merged: Vec<CustomImage> = Vec::new();
                let mut declared_targets: Vec<TaggedRef> = Vec::new();

                for resolver in stack {
                    for incoming in resolver.custom_images() {
                        if incoming.default_only
                            && !declared_targets.contains(&incoming.target)
                        {
                            declared_targets.push(incoming.target.clone());
                        }
                        let mut merged_in = false;
                        for existing in merged.iter_mut() {
                            if incoming.target != existing.target {
                                continue;
                            }
                            if existing.default_only {
                                *existing = incoming.clone();
                                merged_in = true;
                            }
                            if incoming.default_only
                                || (incoming.source == existing.source
                                    && incoming.version == existing.version)
                            {
                                merged_in = true;
                            }
                            if merged_in {
                                break;
                            }
                        }
                        if !merged_in {
                            merged.push(incoming);
                        }
                    }
                }

                merged
                    .into_iter()
                    .filter(|image| declared_targets.contains(&image.target))
                    .collect()
            }
        }
    }
}

// =============================================================================
// Planning
// =============================================================================

/// Resolves one suite-file layer against flag overrides and defaults into
/// a suite with its expanded instance matrix.
pub fn plan_suite(
    flags: &FlagResolver,
    suite: SuiteFileResolver,
    defaults: &DefaultResolver,
) -> SuiteConfig {
    let resolver = Resolver::Multi(vec![
        Resolver::Flag(FlagResolver {
            custom_images: flags.custom_images.clone(),
        }),
        Resolver::SuiteFile(suite),
        Resolver::Default(DefaultResolver {
            base: defaults.base.clone(),
            path: defaults.path.clone(),
        }),
    ]);

    let name = resolver.name();
    let path = resolver.path().unwrap_or_default();
    let dind = resolver.dind();
    let base = resolver
        .base_image()
        .unwrap_or_else(|| defaults.base.clone());
    let extra_images = resolver.images();
    let run = resolver.run_configuration();

    let matrix = expand_custom_image_matrix(&resolver.custom_images());
    let multi_instance = matrix.len() > 1;
    if multi_instance {
        debug!("running {} instances for suite {}", matrix.len(), name);
    }

    let base_config = |custom_images: Vec<CustomImage>| BaseImageConfig {
        base: base.clone(),
        extra_images: extra_images.clone(),
        custom_images,
    };

    let instances = if matrix.is_empty() {
        vec![InstanceConfig {
            name: name.clone(),
            base_image: base_config(Vec::new()),
            run: run.clone(),
        }]
    } else {
        matrix
            .into_iter()
            .enumerate()
            .map(|(idx, custom_images)| InstanceConfig {
                name: if multi_instance {
                    format!("{}-{}", name, idx + 1)
                } else {
                    name.clone()
                },
                base_image: base_config(custom_images),
                run: run.clone(),
            })
            .collect()
    };

    SuiteConfig {
        name,
        path,
        dind,
        instances,
    }
}

/// Name helper shared by image tags and container names.
pub fn instance_image_name(namespace: Option<&str>, instance: &str) -> String {
    let image = format!("{}{}:latest", crate::constants::INSTANCE_PREFIX, instance);
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{}/{}", ns.trim_end_matches('/'), image),
        _ => image,
    }
}

/// Container name for an instance.
pub fn instance_container_name(instance: &str) -> String {
    format!("{}{}", crate::constants::INSTANCE_PREFIX, instance)
}

