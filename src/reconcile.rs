//! Image-set reconciliation.
//!
//! The preloaded image directory carries a manifest mapping each source
//! image id to the target references it must hold inside the nested
//! daemon. Reconciliation diffs that expectation against the daemon's
//! actual state and applies the difference: force-tagging, clean-gated
//! untagging and removal, and tarball loads for images the daemon does
//! not have yet.

use crate::constants::IMAGE_MANIFEST_NAME;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::logs::LogCapturer;
use crate::reference::TaggedRef;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

type TagMap = BTreeMap<String, Vec<String>>;

/// Makes the daemon's image set match the manifest under `image_root`.
///
/// With `clean` set, images and tags outside the manifest are removed;
/// otherwise they are left in place. Conflicting tags are stolen via
/// force-tag either way. Engine load output streams into the load
/// capturer.
pub async fn sync_images(
    engine: &dyn Engine,
    image_root: &Path,
    clean: bool,
    load_capturer: &Arc<dyn LogCapturer>,
) -> Result<()> {
    debug!("syncing images from {}", image_root.display());

    let manifest_path = image_root.join(IMAGE_MANIFEST_NAME);
    let contents = std::fs::read(&manifest_path)
        .map_err(|e| Error::SyncFailed(format!("error opening image manifest: {}", e)))?;
    let manifest: TagMap = serde_json::from_slice(&contents)
        .map_err(|e| Error::SyncFailed(format!("error decoding image manifest: {}", e)))?;

    let mut all_tags: BTreeSet<&str> = BTreeSet::new();
    let mut needed: BTreeSet<&str> = BTreeSet::new();
    for (image_id, tags) in &manifest {
        needed.insert(image_id);
        for tag in tags {
            all_tags.insert(tag);
        }
    }

    let images = engine
        .image_list()
        .await
        .map_err(|e| Error::SyncFailed(format!("error listing images: {}", e)))?;

    for image in &images {
        match manifest.get(&image.id) {
            Some(expected_tags) => {
                needed.remove(image.id.as_str());

                let local_tags = filter_repo_tags(&image.repo_tags);
                debug!("tags for {}: {:?}", image.id, local_tags);

                let (removed, added) = list_diff(&local_tags, expected_tags);
                for tag in added {
                    tag_image(engine, &image.id, &tag).await?;
                }
                for tag in removed {
                    // A tag expected on some other manifest image will be
                    // stolen by its force-tag; only strays are removed.
                    if !all_tags.contains(tag.as_str()) {
                        if clean {
                            debug!("removing tag {}", tag);
                            engine.image_remove(&tag, false).await.map_err(|e| {
                                Error::SyncFailed(format!("error removing tag {}: {}", tag, e))
                            })?;
                        } else {
                            debug!("keeping tag: {}", tag);
                        }
                    }
                }
            }
            None if clean => {
                engine.image_remove(&image.id, true).await.map_err(|e| {
                    Error::SyncFailed(format!("error removing image {}: {}", image.id, e))
                })?;
            }
            None => {
                debug!("keeping image {} with tags {:?}", image.id, image.repo_tags);
            }
        }
    }

    for image_id in needed {
        let tags = manifest
            .get(image_id)
            .ok_or_else(|| Error::SyncFailed(format!("missing image {} in tag map", image_id)))?;
        if engine.image_inspect(image_id).await.is_err() {
            let tarball = image_root.join(format!("{}.tar", image_id));
            let output = engine.image_load(&tarball).await.map_err(|e| {
                Error::SyncFailed(format!("error loading image {}: {}", image_id, e))
            })?;
            if !output.is_empty() {
                let _ = load_capturer
                    .stdout()
                    .write_all(format!("{}\n", output).as_bytes())
                    .await;
            }
        }
        for tag in tags {
            tag_image(engine, image_id, tag).await?;
        }
    }

    Ok(())
}

/// Sorted symmetric difference: (present only in `current`, present only
/// in `expected`).
fn list_diff(current: &[String], expected: &[String]) -> (Vec<String>, Vec<String>) {
    let mut current: Vec<&String> = current.iter().collect();
    let mut expected: Vec<&String> = expected.iter().collect();
    current.sort();
    expected.sort();

    let mut removed = Vec::new();
    let mut added = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < current.len() && j < expected.len() {
        match current[i].cmp(expected[j]) {
            std::cmp::Ordering::Less => {
                removed.push(current[i].clone());
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(expected[j].clone());
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    removed.extend(current[i..].iter().map(|s| s.to_string()));
    added.extend(expected[j..].iter().map(|s| s.to_string()));

    (removed, added)
}

/// Drops the engine's placeholder tags on dangling images.
fn filter_repo_tags(tags: &[String]) -> Vec<String> {
    tags.iter()
        .filter(|t| *t != "<none>" && *t != "<none>:<none>")
        .cloned()
        .collect()
}

/// Applies a target tag to an image, stealing it from any current holder.
async fn tag_image(engine: &dyn Engine, image_id: &str, tag: &str) -> Result<()> {
    let target = TaggedRef::parse(tag)?;
    engine
        .image_tag(image_id, &target)
        .await
        .map_err(|e| Error::SyncFailed(format!("error tagging image {} as {}: {}", image_id, tag, e)))
}
