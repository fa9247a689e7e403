//! Base and instance image assembly.
//!
//! A *base image* bundles the preloaded image set and version environment
//! for every instance sharing a fingerprint; an *instance image* overlays
//! the suite's test tree, the serialized instance plan, and the runner
//! executable. Build contexts are assembled in fresh temporary
//! directories and handed to the external builder.

use crate::cache::{Fingerprint, ImageCache};
use crate::constants::{IMAGES_PATH, IMAGE_MANIFEST_NAME, INSTANCE_PLAN_PATH, RUNNER_EXECUTABLE, RUNNER_EXECUTABLE_PATH, RUNNER_PATH};
use crate::engine::{Engine, ImageBuilder};
use crate::error::{Error, Result};
use crate::reference::{name_to_env, ImageRef, TaggedRef};
use crate::resolver::{instance_image_name, BaseImageConfig, InstanceConfig};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Resolves a reference to a local image id, pulling when absent.
///
/// Pulling requires a named-tagged reference; a bare name that is not
/// already present locally is an error.
pub async fn ensure_image(engine: &dyn Engine, reference: &ImageRef) -> Result<String> {
    let reference_string = reference.to_string();
    match engine.image_inspect(&reference_string).await {
        Ok(summary) => {
            debug!("image found locally {}", reference_string);
            return Ok(summary.id);
        }
        Err(Error::ImageMissing { .. }) => {}
        Err(e) => {
            error!("error inspecting image {}: {}", reference_string, e);
            return Err(e);
        }
    }

    let tagged = match reference {
        ImageRef::Tagged(tagged) => tagged,
        ImageRef::Named(_) => {
            return Err(Error::InvalidReference {
                reference: reference_string,
                reason: "tagged reference required to pull".to_string(),
            });
        }
    };

    let pull_start = Instant::now();
    engine.image_pull(tagged).await?;
    info!(
        image = %tagged,
        elapsed = ?pull_start.elapsed(),
        "image pulled"
    );

    Ok(engine.image_inspect(&tagged.to_string()).await?.id)
}

/// (target tag, source image id) recorded for the manifest and the
/// fingerprint.
struct TagEntry {
    target: TaggedRef,
    image_id: String,
}

/// Builds (or reuses) the base image for a configuration.
///
/// Returns the image id. A cache hit is honoured only while the cached id
/// still resolves against the engine; the engine may have garbage
/// collected it since.
pub async fn build_base_image(
    engine: &dyn Engine,
    builder: &dyn ImageBuilder,
    config: &BaseImageConfig,
    cache: &ImageCache,
    token: &CancellationToken,
) -> Result<String> {
    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let base_image_id =
        ensure_image(engine, &ImageRef::Tagged(config.base.clone())).await?;

    let mut tags: Vec<TagEntry> = Vec::new();
    let mut envs: Vec<String> = Vec::new();

    for extra in &config.extra_images {
        let id = ensure_image(engine, &ImageRef::Tagged(extra.clone())).await?;
        tags.push(TagEntry {
            target: extra.clone(),
            image_id: id,
        });
    }
    for custom in &config.custom_images {
        let id = ensure_image(engine, &custom.source).await?;
        tags.push(TagEntry {
            target: custom.target.clone(),
            image_id: id,
        });
        envs.push(format!(
            "{}_VERSION {}",
            name_to_env(custom.target.name()),
            custom.version
        ));
    }

    let tag_pairs: Vec<(String, String)> = tags
        .iter()
        .map(|t| (t.target.to_string(), t.image_id.clone()))
        .collect();
    let fingerprint = Fingerprint::compute(&base_image_id, &tag_pairs, &envs);

    match cache.get(&fingerprint) {
        Ok(id) => {
            debug!("found image in cache for {}: {}", fingerprint, id);
            match engine.image_inspect(&id).await {
                Ok(info) => {
                    debug!("cached image found locally {}", info.id);
                    return Ok(id);
                }
                Err(e) => error!("unable to find cached image {}: {}", id, e),
            }
        }
        Err(e) if e.is_cache_miss() => {
            debug!("building image, could not find in cache: {}", e);
        }
        Err(e) => return Err(e),
    }

    if token.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let build_start = Instant::now();
    let context = tempfile::Builder::new()
        .prefix("golem-")
        .tempdir()
        .map_err(|e| Error::BuildFailed(format!("unable to create tempdir: {}", e)))?;

    let mut recipe = format!("FROM {}\n", base_image_id);

    let images_dir = context.path().join("images");
    std::fs::create_dir(&images_dir)
        .map_err(|e| Error::BuildFailed(format!("unable to make images directory: {}", e)))?;

    let save_start = Instant::now();
    let mut saved: Vec<&str> = Vec::new();
    for entry in &tags {
        // Shared source ids are saved once and tagged many times.
        if saved.contains(&entry.image_id.as_str()) {
            continue;
        }
        let tarball = images_dir.join(format!("{}.tar", entry.image_id));
        engine.image_save(&entry.image_id, &tarball).await?;
        saved.push(&entry.image_id);
    }
    info!(
        images = saved.len(),
        elapsed = ?save_start.elapsed(),
        "image save complete"
    );

    save_tag_map(&images_dir.join(IMAGE_MANIFEST_NAME), &tags)?;

    recipe.push_str(&format!("COPY ./images {}\n", IMAGES_PATH));
    for env in &envs {
        recipe.push_str(&format!("ENV {}\n", env));
    }
    std::fs::write(context.path().join("Dockerfile"), recipe)
        .map_err(|e| Error::BuildFailed(format!("unable to create dockerfile: {}", e)))?;

    let image_id = builder.build(context.path(), None).await?;
    info!(elapsed = ?build_start.elapsed(), "base image build complete");

    // The build already succeeded; a cache write failure only costs the
    // next run a rebuild.
    if let Err(e) = cache.put(&fingerprint, &image_id) {
        error!("unable to save image by hash {}: {}", fingerprint, e);
    }

    Ok(image_id)
}

/// Writes the manifest mapping each source image id to the target
/// references it must carry inside the runner container.
fn save_tag_map(path: &Path, tags: &[TagEntry]) -> Result<()> {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for entry in tags {
        map.entry(entry.image_id.clone())
            .or_default()
            .push(entry.target.to_string());
    }

    let encoded =
        serde_json::to_vec(&map).map_err(|e| Error::Serialization(e.to_string()))?;
    std::fs::write(path, encoded)
        .map_err(|e| Error::BuildFailed(format!("error saving tag map: {}", e)))?;
    Ok(())
}

/// Builds the instance image for one matrix row.
///
/// The image derives from the instance's base image and adds the suite's
/// test tree, the serialized run configuration, and the runner
/// executable. Tagged `golem-<instance>:latest`, optionally under a
/// namespace prefix.
pub async fn build_instance_image(
    engine: &dyn Engine,
    builder: &dyn ImageBuilder,
    cache: &ImageCache,
    suite_path: &Path,
    instance: &InstanceConfig,
    namespace: Option<&str>,
    executable: &Path,
    token: &CancellationToken,
) -> Result<String> {
    let image_name = instance_image_name(namespace, &instance.name);
    info!(image = %image_name, "building image");

    let base_image =
        build_base_image(engine, builder, &instance.base_image, cache, token).await?;

    let context = tempfile::Builder::new()
        .prefix("golem-")
        .tempdir()
        .map_err(|e| Error::BuildFailed(format!("unable to create tempdir: {}", e)))?;

    let mut recipe = format!("FROM {}\n", base_image);

    let executable_dest = context.path().join(RUNNER_EXECUTABLE);
    std::fs::copy(executable, &executable_dest)
        .map_err(|e| Error::BuildFailed(format!("error copying runner executable: {}", e)))?;
    recipe.push_str(&format!(
        "COPY ./{} {}\n",
        RUNNER_EXECUTABLE, RUNNER_EXECUTABLE_PATH
    ));

    debug!(
        "copying {} to {}",
        suite_path.display(),
        context.path().join("runner").display()
    );
    copy_tree(suite_path, &context.path().join("runner"))
        .map_err(|e| Error::BuildFailed(format!("error copying test directory: {}", e)))?;
    recipe.push_str(&format!("COPY ./runner/ {}\n", RUNNER_PATH));

    debug!("run configuration: {:?}", instance.run);
    let plan = serde_json::to_vec(&instance.run)
        .map_err(|e| Error::Serialization(e.to_string()))?;
    std::fs::write(context.path().join("instance.json"), plan)
        .map_err(|e| Error::BuildFailed(format!("error creating instance json: {}", e)))?;
    recipe.push_str(&format!("COPY ./instance.json {}\n", INSTANCE_PLAN_PATH));

    std::fs::write(context.path().join("Dockerfile"), recipe)
        .map_err(|e| Error::BuildFailed(format!("error creating dockerfile: {}", e)))?;

    let tag = TaggedRef::parse(&image_name)?;
    builder.build(context.path(), Some(&tag)).await
}

/// Recursively copies a directory tree.
fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(link, &target)?;
            #[cfg(not(unix))]
            let _ = link;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
