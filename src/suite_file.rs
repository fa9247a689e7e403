//! Suite configuration files.
//!
//! A suite file is TOML with one or more `[[suite]]` tables. References
//! are parsed here, at load time, so the resolver stack itself never
//! fails. A path argument naming a directory implies `golem.conf` inside
//! it.

use crate::error::{Error, Result};
use crate::reference::{parse_reference, ImageRef, TaggedRef};
use crate::resolver::{CustomImage, RunConfiguration, Script, TestScript};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name implied by a directory argument.
pub const SUITE_FILE_NAME: &str = "golem.conf";

// =============================================================================
// TOML Shape
// =============================================================================

#[derive(Debug, Deserialize, Default)]
struct SuitesFile {
    #[serde(default, rename = "suite")]
    suites: Vec<SuiteTable>,
}

#[derive(Debug, Deserialize, Default)]
struct SuiteTable {
    /// Suite name; defaults to the configuration directory's name.
    #[serde(default)]
    name: String,

    /// Whether a nested daemon runs inside the test container.
    #[serde(default)]
    dind: bool,

    /// Base image to build the test image from.
    #[serde(default, rename = "baseimage")]
    base_image: String,

    /// Commands run before the tests start.
    #[serde(default)]
    pretest: Vec<PretestTable>,

    /// Test commands. Each must exit zero for the suite to pass.
    #[serde(default, rename = "testrunner")]
    test_runner: Vec<TestRunnerTable>,

    /// Images that should exist in the test container. Implies dind.
    #[serde(default)]
    images: Vec<String>,

    /// Runtime-selectable images inside the container. Implies dind.
    #[serde(default, rename = "customimage")]
    custom_images: Vec<CustomImageTable>,
}

#[derive(Debug, Deserialize, Default)]
struct PretestTable {
    #[serde(default)]
    command: String,
    #[serde(default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TestRunnerTable {
    #[serde(default)]
    command: String,
    #[serde(default)]
    format: String,
    #[serde(default)]
    env: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CustomImageTable {
    /// Target tag inside the test container.
    #[serde(default)]
    tag: String,
    /// Default source image used when no override is given.
    #[serde(default)]
    default: String,
    /// Version token; defaults to the source tag, then the target tag.
    #[serde(default)]
    version: String,
}

// =============================================================================
// Resolver Layer
// =============================================================================

/// Parsed suite-file configuration for one suite.
pub struct SuiteFileResolver {
    name: String,
    path: PathBuf,
    dind: bool,
    base: Option<TaggedRef>,
    images: Vec<TaggedRef>,
    custom_images: Vec<CustomImage>,
    run: RunConfiguration,
}

impl SuiteFileResolver {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dind(&self) -> bool {
        self.dind
    }

    pub fn base_image(&self) -> Option<&TaggedRef> {
        self.base.as_ref()
    }

    pub fn images(&self) -> &[TaggedRef] {
        &self.images
    }

    pub fn custom_images(&self) -> &[CustomImage] {
        &self.custom_images
    }

    pub fn run_configuration(&self) -> RunConfiguration {
        self.run.clone()
    }

    fn from_table(path: &Path, table: SuiteTable) -> Result<SuiteFileResolver> {
        let mut custom_images = Vec::with_capacity(table.custom_images.len());
        for entry in &table.custom_images {
            let target = TaggedRef::parse(&entry.tag)?;
            let source = parse_reference(&entry.default)?;

            let mut version = entry.version.clone();
            if version.is_empty() {
                version = match &source {
                    ImageRef::Tagged(t) => t.tag().to_string(),
                    ImageRef::Named(_) => target.tag().to_string(),
                };
            }

            custom_images.push(CustomImage {
                source,
                target,
                version,
                default_only: true,
            });
        }

        let mut images = Vec::with_capacity(table.images.len());
        for image in &table.images {
            images.push(TaggedRef::parse(image)?);
        }

        let base = if table.base_image.is_empty() {
            None
        } else {
            Some(TaggedRef::parse(&table.base_image)?)
        };

        let mut run = RunConfiguration::default();
        for pretest in &table.pretest {
            run.setup.push(Script {
                command: split_command(&pretest.command),
                env: pretest.env.clone(),
            });
        }
        for test in &table.test_runner {
            run.test_runner.push(TestScript {
                script: Script {
                    command: split_command(&test.command),
                    env: test.env.clone(),
                },
                format: test.format.clone(),
            });
        }

        let name = if table.name.is_empty() {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            table.name
        };

        Ok(SuiteFileResolver {
            name,
            path: path.to_path_buf(),
            dind: table.dind,
            base,
            images,
            custom_images,
            run,
        })
    }
}

// TODO: respect quoted command arguments
fn split_command(command: &str) -> Vec<String> {
    command
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

// =============================================================================
// Loading
// =============================================================================

/// Resolves a suite argument to its configuration file path. A directory
/// must contain `golem.conf`.
pub fn resolve_config_path(argument: &Path) -> Result<PathBuf> {
    let load_error = |reason: String| Error::ConfigLoadFailed {
        path: argument.to_path_buf(),
        reason,
    };

    let metadata = std::fs::metadata(argument).map_err(|e| load_error(e.to_string()))?;
    if metadata.is_dir() {
        let candidate = argument.join(SUITE_FILE_NAME);
        if !candidate.exists() {
            return Err(load_error(format!("no {} in directory", SUITE_FILE_NAME)));
        }
        Ok(candidate)
    } else {
        Ok(argument.to_path_buf())
    }
}

/// Loads every suite declared in a configuration file, de-duplicating
/// names with `-1`, `-2`, … suffixes. The suite path is the file's
/// directory.
pub fn load_suites(config_path: &Path) -> Result<Vec<SuiteFileResolver>> {
    let load_error = |reason: String| Error::ConfigLoadFailed {
        path: config_path.to_path_buf(),
        reason,
    };

    let contents = std::fs::read_to_string(config_path).map_err(|e| load_error(e.to_string()))?;
    let parsed: SuitesFile = toml::from_str(&contents).map_err(|e| load_error(e.to_string()))?;
    debug!(
        "found {} test suites in {}",
        parsed.suites.len(),
        config_path.display()
    );

    let suite_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut suites: Vec<SuiteFileResolver> = Vec::with_capacity(parsed.suites.len());
    for table in parsed.suites {
        let mut suite = SuiteFileResolver::from_table(&suite_dir, table)?;

        let base_name = suite.name.clone();
        let mut candidate = base_name.clone();
        let mut counter = 1;
        while suites.iter().any(|s| s.name == candidate) {
            candidate = format!("{}-{}", base_name, counter);
            counter += 1;
        }
        suite.name = candidate;
        suites.push(suite);
    }

    Ok(suites)
}
