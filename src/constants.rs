//! Constants for the orchestrator.
//!
//! Well-known paths, retry budgets, and buffer sizes are defined here to
//! keep the host/runner contract in one place.

use std::time::Duration;

// =============================================================================
// Runner Container Contract
// =============================================================================

/// Where the suite's test tree is placed inside the runner container.
pub const RUNNER_PATH: &str = "/runner";

/// Where the serialized instance plan is placed inside the runner container.
pub const INSTANCE_PLAN_PATH: &str = "/instance.json";

/// State directory of the nested daemon inside the runner container.
pub const DAEMON_STATE_PATH: &str = "/var/lib/docker";

/// Directory holding the preloaded image set and its manifest.
pub const IMAGES_PATH: &str = "/images";

/// Manifest file name mapping source image ids to target references.
pub const IMAGE_MANIFEST_NAME: &str = "images.json";

/// Root directory for named log streams inside the runner container.
pub const LOG_ROOT: &str = "/var/log/docker";

/// Compose file looked up inside the test tree.
pub const COMPOSE_FILE: &str = "/runner/docker-compose.yml";

/// Pid file removed when the nested daemon is shut down.
pub const DAEMON_PID_FILE: &str = "/var/run/docker.pid";

/// Name of the runner executable inside instance images.
pub const RUNNER_EXECUTABLE: &str = "golem_runner";

/// Installed path of the runner executable inside instance images.
pub const RUNNER_EXECUTABLE_PATH: &str = "/usr/local/bin/golem_runner";

// =============================================================================
// Build & Cache
// =============================================================================

/// Forces cache busting when the fingerprint computation changes.
pub const HASH_VERSION: &str = "1";

/// Prefix for instance images and runner containers.
pub const INSTANCE_PREFIX: &str = "golem-";

/// Default base image when neither flags nor the suite file name one.
pub const DEFAULT_BASE_IMAGE: &str = "golem/runner-base:0.1";

/// Subdirectory of the cache root holding the image id cache.
pub const IMAGE_CACHE_DIR: &str = "images";

// =============================================================================
// Nested Daemon
// =============================================================================

/// Grace period before the first version poll after starting the daemon.
pub const DAEMON_START_GRACE: Duration = Duration::from_secs(2);

/// Number of version polls before giving up on the nested daemon.
pub const DAEMON_POLL_BUDGET: u32 = 10;

/// Interval between version polls.
pub const DAEMON_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Delay between killing the daemon and removing its pid file.
pub const DAEMON_KILL_GRACE: Duration = Duration::from_millis(500);

/// Storage driver used when `DOCKER_GRAPHDRIVER` is not set.
pub const DEFAULT_STORAGE_DRIVER: &str = "overlay";

// =============================================================================
// Log Fan-out
// =============================================================================

/// In-memory pipe capacity for each tap.
pub const TAP_PIPE_CAPACITY: usize = 64 * 1024;

/// Chunk size for tap copy tasks.
pub const TAP_COPY_CHUNK: usize = 8 * 1024;

/// Capacity of the router's coordinator channels.
pub const ROUTER_CHANNEL_CAPACITY: usize = 16;
