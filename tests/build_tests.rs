//! Tests for base and instance image builds against in-memory fakes.

mod common;

use common::{FakeBuilder, FakeEngine};
use golem::build::{build_base_image, build_instance_image, ensure_image};
use golem::cache::ImageCache;
use golem::reference::{parse_reference, ImageRef, TaggedRef};
use golem::resolver::{
    BaseImageConfig, CustomImage, InstanceConfig, RunConfiguration, Script, TestScript,
};
use std::collections::BTreeMap;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn tagged(s: &str) -> TaggedRef {
    TaggedRef::parse(s).unwrap()
}

fn custom(source: &str, target: &str, version: &str) -> CustomImage {
    CustomImage {
        source: parse_reference(source).unwrap(),
        target: tagged(target),
        version: version.to_string(),
        default_only: false,
    }
}

fn base_config(engine: &FakeEngine) -> BaseImageConfig {
    engine.add_image("sha256:base", &["runner-base:0.1"]);
    engine.add_image("sha256:nginx", &["nginx:1.9"]);
    engine.add_image("sha256:distribution", &["registry:2.2.1"]);
    BaseImageConfig {
        base: tagged("runner-base:0.1"),
        extra_images: vec![tagged("nginx:1.9")],
        custom_images: vec![custom("registry:2.2.1", "golem-distribution:latest", "2.2.1")],
    }
}

// =============================================================================
// ensure_image
// =============================================================================

#[tokio::test]
async fn ensure_image_prefers_local() {
    let engine = FakeEngine::new();
    engine.add_image("sha256:local", &["present:1"]);

    let id = ensure_image(
        engine.as_ref(),
        &ImageRef::Tagged(tagged("present:1")),
    )
    .await
    .unwrap();

    assert_eq!(id, "sha256:local");
    assert!(engine.state.lock().unwrap().pulled.is_empty());
}

#[tokio::test]
async fn ensure_image_pulls_tagged_when_absent() {
    let engine = FakeEngine::new();

    let id = ensure_image(engine.as_ref(), &ImageRef::Tagged(tagged("absent:2")))
        .await
        .unwrap();

    assert!(id.starts_with("sha256:pulled-"));
    assert_eq!(engine.state.lock().unwrap().pulled, vec!["absent:2"]);
}

#[tokio::test]
async fn ensure_image_rejects_bare_name_pull() {
    let engine = FakeEngine::new();

    let result = ensure_image(
        engine.as_ref(),
        &parse_reference("absent-bare-name").unwrap(),
    )
    .await;

    assert!(result.is_err());
    assert!(engine.state.lock().unwrap().pulled.is_empty());
}

// =============================================================================
// Base Image Build
// =============================================================================

#[tokio::test]
async fn base_build_assembles_context() {
    let engine = FakeEngine::new();
    let builder = FakeBuilder::new(engine.clone());
    let cache_dir = TempDir::new().unwrap();
    let cache = ImageCache::new(cache_dir.path());
    let config = base_config(&engine);

    build_base_image(
        engine.as_ref(),
        &builder,
        &config,
        &cache,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let builds = builder.builds.lock().unwrap();
    assert_eq!(builds.len(), 1);
    let record = &builds[0];

    assert!(record.recipe.starts_with("FROM sha256:base\n"));
    assert!(record.recipe.contains("COPY ./images /images\n"));
    assert!(record
        .recipe
        .contains("ENV GOLEM_DISTRIBUTION_VERSION 2.2.1\n"));

    let manifest: BTreeMap<String, Vec<String>> =
        serde_json::from_str(record.manifest.as_ref().unwrap()).unwrap();
    assert_eq!(manifest["sha256:nginx"], vec!["nginx:1.9"]);
    assert_eq!(
        manifest["sha256:distribution"],
        vec!["golem-distribution:latest"]
    );

    // Both referenced images were saved as per-id tarballs.
    let saved = &engine.state.lock().unwrap().saved;
    assert_eq!(saved.len(), 2);
    assert!(saved
        .iter()
        .all(|(id, path)| path.file_name().unwrap().to_string_lossy() == format!("{}.tar", id)));
}

#[tokio::test]
async fn repeated_build_hits_cache() {
    let engine = FakeEngine::new();
    let builder = FakeBuilder::new(engine.clone());
    let cache_dir = TempDir::new().unwrap();
    let cache = ImageCache::new(cache_dir.path());
    let config = base_config(&engine);
    let token = CancellationToken::new();

    let first = build_base_image(engine.as_ref(), &builder, &config, &cache, &token)
        .await
        .unwrap();
    let second = build_base_image(engine.as_ref(), &builder, &config, &cache, &token)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(builder.build_count(), 1, "second build must come from cache");

    // Exactly one cache entry exists under <root>/<alg>/<hex>.
    let alg_dir = cache_dir.path().join("sha256");
    assert_eq!(std::fs::read_dir(&alg_dir).unwrap().count(), 1);
}

#[tokio::test]
async fn stale_cache_entry_triggers_rebuild() {
    let engine = FakeEngine::new();
    let builder = FakeBuilder::new(engine.clone());
    let cache_dir = TempDir::new().unwrap();
    let cache = ImageCache::new(cache_dir.path());
    let config = base_config(&engine);
    let token = CancellationToken::new();

    let first = build_base_image(engine.as_ref(), &builder, &config, &cache, &token)
        .await
        .unwrap();

    // The engine garbage-collected the built image; the cache entry is
    // no longer authoritative.
    engine
        .state
        .lock()
        .unwrap()
        .images
        .retain(|img| img.id != first);

    let second = build_base_image(engine.as_ref(), &builder, &config, &cache, &token)
        .await
        .unwrap();

    assert_ne!(first, second);
    assert_eq!(builder.build_count(), 2);
}

#[tokio::test]
async fn insertion_order_shares_cache_slot() {
    let engine = FakeEngine::new();
    let builder = FakeBuilder::new(engine.clone());
    let cache_dir = TempDir::new().unwrap();
    let cache = ImageCache::new(cache_dir.path());
    let token = CancellationToken::new();

    engine.add_image("sha256:base", &["runner-base:0.1"]);
    engine.add_image("sha256:a", &["a:1"]);
    engine.add_image("sha256:b", &["b:1"]);

    let forward = BaseImageConfig {
        base: tagged("runner-base:0.1"),
        extra_images: vec![tagged("a:1"), tagged("b:1")],
        custom_images: Vec::new(),
    };
    let reversed = BaseImageConfig {
        base: tagged("runner-base:0.1"),
        extra_images: vec![tagged("b:1"), tagged("a:1")],
        custom_images: Vec::new(),
    };

    let first = build_base_image(engine.as_ref(), &builder, &forward, &cache, &token)
        .await
        .unwrap();
    let second = build_base_image(engine.as_ref(), &builder, &reversed, &cache, &token)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(builder.build_count(), 1);
}

#[tokio::test]
async fn version_change_selects_new_slot() {
    let engine = FakeEngine::new();
    let builder = FakeBuilder::new(engine.clone());
    let cache_dir = TempDir::new().unwrap();
    let cache = ImageCache::new(cache_dir.path());
    let token = CancellationToken::new();

    let mut config = base_config(&engine);
    build_base_image(engine.as_ref(), &builder, &config, &cache, &token)
        .await
        .unwrap();

    config.custom_images[0].version = "2.3.0".to_string();
    build_base_image(engine.as_ref(), &builder, &config, &cache, &token)
        .await
        .unwrap();

    assert_eq!(builder.build_count(), 2);
}

// =============================================================================
// Instance Image Build
// =============================================================================

#[tokio::test]
async fn instance_build_overlays_plan_and_tree() {
    let engine = FakeEngine::new();
    let builder = FakeBuilder::new(engine.clone());
    let cache_dir = TempDir::new().unwrap();
    let cache = ImageCache::new(cache_dir.path());

    let suite_dir = TempDir::new().unwrap();
    std::fs::write(suite_dir.path().join("test.bats"), b"#!/usr/bin/env bats\n").unwrap();

    let executable = TempDir::new().unwrap();
    let executable_path = executable.path().join("golem");
    std::fs::write(&executable_path, b"binary").unwrap();

    let instance = InstanceConfig {
        name: "registry".to_string(),
        base_image: base_config(&engine),
        run: RunConfiguration {
            setup: vec![Script {
                command: vec!["sh".to_string(), "install.sh".to_string()],
                env: vec![],
            }],
            test_runner: vec![TestScript {
                script: Script {
                    command: vec!["bats".to_string(), "-t".to_string(), ".".to_string()],
                    env: vec!["TEST_REPO=hello-world".to_string()],
                },
                format: "tap".to_string(),
            }],
        },
    };

    let id = build_instance_image(
        engine.as_ref(),
        &builder,
        &cache,
        suite_dir.path(),
        &instance,
        None,
        &executable_path,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let builds = builder.builds.lock().unwrap();
    assert_eq!(builds.len(), 2, "base build plus instance build");
    let record = &builds[1];
    assert_eq!(record.image_id, id);
    assert_eq!(record.tag.as_deref(), Some("golem-registry:latest"));

    assert!(record.recipe.contains("COPY ./runner/ /runner\n"));
    assert!(record
        .recipe
        .contains("COPY ./instance.json /instance.json\n"));
    assert!(record
        .recipe
        .contains("COPY ./golem_runner /usr/local/bin/golem_runner\n"));
}

#[tokio::test]
async fn instance_plan_round_trips_through_json() {
    let run = RunConfiguration {
        setup: vec![Script {
            command: vec!["sh".to_string(), "setup.sh".to_string()],
            env: vec!["A=1".to_string()],
        }],
        test_runner: vec![TestScript {
            script: Script {
                command: vec!["bats".to_string(), ".".to_string()],
                env: vec![],
            },
            format: "tap".to_string(),
        }],
    };

    let encoded = serde_json::to_string(&run).unwrap();
    // Wire field names are part of the host/runner contract.
    assert!(encoded.contains("\"setup\""));
    assert!(encoded.contains("\"runner\""));
    assert!(encoded.contains("\"command\""));
    assert!(encoded.contains("\"format\":\"tap\""));

    let decoded: RunConfiguration = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, run);
}
