//! # golem
//!
//! **Integration-Test Orchestrator**
//!
//! Golem turns a declarative suite description into hermetic container
//! images and runs each test instance inside its own privileged runner
//! container, capturing logs and reporting pass/fail. One binary serves
//! both sides of the contract: the host orchestrator, and the suite
//! runner executed inside each runner container (selected by argv[0]).
//!
//! # Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          host orchestrator                        │
//! │                                                                   │
//! │  suite file ─► ResolverStack ─► MatrixExpander ─► instances       │
//! │                                      │                            │
//! │                  Fingerprint ◄───────┤                            │
//! │                      │               ▼                            │
//! │   ImageCache ◄── BaseImageBuilder ─► InstanceImageBuilder         │
//! │                                      │                            │
//! │                                      ▼                            │
//! │                HostRunner: privileged runner container            │
//! └──────────────────────────────┬────────────────────────────────────┘
//!                                │ /instance.json, /images, /runner
//! ┌──────────────────────────────▼────────────────────────────────────┐
//! │                    suite runner (in container)                    │
//! │                                                                   │
//! │  LogRouter ─► named streams (scripts/load/daemon/test/compose)    │
//! │      │                                                            │
//! │  StartDaemon ─► nested daemon ─► ImageReconciler ─► compose       │
//! │      │                                                            │
//! │  setup scripts ─► test scripts ─► teardown ─► exit status         │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Engine Abstraction
//!
//! The container engine and the image builder are consumed through the
//! [`engine::Engine`] and [`engine::ImageBuilder`] traits. Production
//! runs drive the engine's own CLI binary ([`engine::cli::CliEngine`]);
//! tests substitute in-memory fakes.
//!
//! # Reproducible Base Images
//!
//! Base images are keyed by a [`cache::Fingerprint`] over their
//! canonicalised inputs: the resolved base image id, the sorted
//! (target, source-id) pairs of every preloaded image, and the sorted
//! version environment declarations. Identical inputs reuse the cached
//! image; any meaningful change selects a new cache slot.
//!
//! # Log Fan-out
//!
//! Every child process writes into a named log stream owned by the
//! [`logs::LogRouter`]. Streams can be tapped while live; taps and
//! forwarders observe only data written after they attach, and a
//! misbehaving tap can never compromise the primary sink.

pub mod build;
pub mod cache;
pub mod constants;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod host;
pub mod logs;
pub mod matrix;
pub mod options;
pub mod reconcile;
pub mod reference;
pub mod resolver;
pub mod suite;
pub mod suite_file;
pub mod version;

pub use error::{Error, Result};
