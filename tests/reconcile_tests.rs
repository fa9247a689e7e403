//! Image reconciliation tests against the in-memory engine.

mod common;

use common::{BufferLogCapturer, FakeEngine};
use golem::logs::LogCapturer;
use golem::reconcile::sync_images;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn write_manifest(dir: &Path, entries: &[(&str, &[&str])]) {
    let map: BTreeMap<String, Vec<String>> = entries
        .iter()
        .map(|(id, tags)| {
            (
                id.to_string(),
                tags.iter().map(|t| t.to_string()).collect(),
            )
        })
        .collect();
    std::fs::write(
        dir.join("images.json"),
        serde_json::to_vec(&map).unwrap(),
    )
    .unwrap();
}

fn write_tarball(dir: &Path, id: &str) {
    std::fs::write(dir.join(format!("{}.tar", id)), id.as_bytes()).unwrap();
}

fn load_capturer() -> Arc<dyn LogCapturer> {
    BufferLogCapturer::new()
}

#[tokio::test]
async fn retags_existing_image() {
    // Engine has I0 tagged X:1; the manifest expects X:2. With clean set,
    // X:1 must be gone and X:2 present.
    let engine = FakeEngine::new();
    engine.add_image("sha256:i0", &["x:1"]);

    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), &[("sha256:i0", &["x:2"])]);

    sync_images(engine.as_ref(), dir.path(), true, &load_capturer())
        .await
        .unwrap();

    let tags = engine.image_tags();
    assert_eq!(tags["sha256:i0"], vec!["x:2"]);
}

#[tokio::test]
async fn stray_tag_kept_without_clean() {
    let engine = FakeEngine::new();
    engine.add_image("sha256:i0", &["x:1"]);

    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), &[("sha256:i0", &["x:2"])]);

    sync_images(engine.as_ref(), dir.path(), false, &load_capturer())
        .await
        .unwrap();

    let mut tags = engine.image_tags()["sha256:i0"].clone();
    tags.sort();
    assert_eq!(tags, vec!["x:1", "x:2"]);
}

#[tokio::test]
async fn conflicting_tag_is_stolen() {
    // The expected tag currently points at a different image; force-tag
    // must steal it rather than merge.
    let engine = FakeEngine::new();
    engine.add_image("sha256:wanted", &[]);
    engine.add_image("sha256:squatter", &["target:latest"]);

    let dir = TempDir::new().unwrap();
    write_manifest(
        dir.path(),
        &[
            ("sha256:wanted", &["target:latest"]),
            ("sha256:squatter", &["other:latest"]),
        ],
    );

    sync_images(engine.as_ref(), dir.path(), false, &load_capturer())
        .await
        .unwrap();

    let tags = engine.image_tags();
    assert_eq!(tags["sha256:wanted"], vec!["target:latest"]);
    assert_eq!(tags["sha256:squatter"], vec!["other:latest"]);
}

#[tokio::test]
async fn unmanifested_image_removed_only_with_clean() {
    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), &[("sha256:keep", &["keep:1"])]);

    let engine = FakeEngine::new();
    engine.add_image("sha256:keep", &["keep:1"]);
    engine.add_image("sha256:extra", &["extra:1"]);
    sync_images(engine.as_ref(), dir.path(), false, &load_capturer())
        .await
        .unwrap();
    assert!(engine.image_tags().contains_key("sha256:extra"));

    let engine = FakeEngine::new();
    engine.add_image("sha256:keep", &["keep:1"]);
    engine.add_image("sha256:extra", &["extra:1"]);
    sync_images(engine.as_ref(), dir.path(), true, &load_capturer())
        .await
        .unwrap();
    assert!(!engine.image_tags().contains_key("sha256:extra"));
}

#[tokio::test]
async fn missing_image_loaded_from_tarball() {
    let engine = FakeEngine::new();

    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), &[("sha256:fresh", &["fresh:1", "alias:2"])]);
    write_tarball(dir.path(), "sha256:fresh");

    let capturer = BufferLogCapturer::new();
    let out = capturer.stdout.clone();
    sync_images(
        engine.as_ref(),
        dir.path(),
        false,
        &(capturer as Arc<dyn LogCapturer>),
    )
    .await
    .unwrap();

    let mut tags = engine.image_tags()["sha256:fresh"].clone();
    tags.sort();
    assert_eq!(tags, vec!["alias:2", "fresh:1"]);
    assert_eq!(engine.state.lock().unwrap().loaded.len(), 1);

    // Engine load output lands in the load stream.
    let output = String::from_utf8(out.contents()).unwrap();
    assert!(output.contains("Loaded image ID: sha256:fresh"));
}

#[tokio::test]
async fn missing_tarball_fails_reconcile() {
    let engine = FakeEngine::new();

    let dir = TempDir::new().unwrap();
    write_manifest(dir.path(), &[("sha256:ghost", &["ghost:1"])]);

    let result = sync_images(engine.as_ref(), dir.path(), false, &load_capturer()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn missing_manifest_fails_reconcile() {
    let engine = FakeEngine::new();
    let dir = TempDir::new().unwrap();

    let result = sync_images(engine.as_ref(), dir.path(), true, &load_capturer()).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn reconcile_converges_to_manifest() {
    // Full convergence: after a clean reconcile, every manifest entry
    // holds and nothing else remains.
    let engine = FakeEngine::new();
    engine.add_image("sha256:a", &["a:old", "shared:1"]);
    engine.add_image("sha256:doomed", &["doomed:1"]);

    let dir = TempDir::new().unwrap();
    write_manifest(
        dir.path(),
        &[
            ("sha256:a", &["a:new"]),
            ("sha256:b", &["b:1", "shared:1"]),
        ],
    );
    write_tarball(dir.path(), "sha256:b");

    sync_images(engine.as_ref(), dir.path(), true, &load_capturer())
        .await
        .unwrap();

    let tags = engine.image_tags();
    assert_eq!(tags.len(), 2);
    assert_eq!(tags["sha256:a"], vec!["a:new"]);
    let mut b_tags = tags["sha256:b"].clone();
    b_tags.sort();
    assert_eq!(b_tags, vec!["b:1", "shared:1"]);
}
