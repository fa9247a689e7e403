//! Error types for the orchestrator.

use std::path::PathBuf;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while planning, building, or running test suites.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to parse an image reference.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Suite configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Suite configuration file could not be read or parsed.
    #[error("failed to load suite configuration {path}: {reason}")]
    ConfigLoadFailed { path: PathBuf, reason: String },

    /// Version string did not parse.
    #[error("invalid version '{0}'")]
    InvalidVersion(String),

    // =========================================================================
    // Engine Errors
    // =========================================================================
    /// The container engine could not be reached or rejected the call.
    #[error("engine unreachable: {0}")]
    EngineUnreachable(String),

    /// An engine operation failed.
    #[error("engine {operation} failed: {reason}")]
    EngineOperationFailed { operation: String, reason: String },

    /// A required image does not exist locally and cannot be pulled.
    #[error("image missing: {reference}: {reason}")]
    ImageMissing { reference: String, reason: String },

    /// Image build failed.
    #[error("image build failed: {0}")]
    BuildFailed(String),

    // =========================================================================
    // Cache Errors
    // =========================================================================
    /// No cache entry for the fingerprint. Drives a rebuild, never fatal.
    #[error("no cached image for {fingerprint}")]
    CacheEntryNotFound { fingerprint: String },

    /// Cache write failed.
    #[error("failed to write cache entry: {0}")]
    CacheWriteFailed(String),

    // =========================================================================
    // Runner Errors
    // =========================================================================
    /// A setup or test script exited non-zero.
    #[error("script '{command}' failed with exit code {code}")]
    ScriptFailed { command: String, code: i32 },

    /// A script could not be started at all.
    #[error("could not start script '{command}': {reason}")]
    ScriptStartFailed { command: String, reason: String },

    /// The nested daemon never became reachable.
    #[error("daemon startup failed: {0}")]
    DaemonStartFailed(String),

    /// Image reconciliation against the nested daemon failed.
    #[error("image sync failed: {0}")]
    SyncFailed(String),

    /// Aggregate test failure across instances.
    #[error("test failure: {failed} of {ran} tests failed")]
    TestsFailed { failed: usize, ran: usize },

    // =========================================================================
    // Log Routing Errors
    // =========================================================================
    /// Operation on a router that has been shut down.
    #[error("log router is shut down")]
    RouterClosed,

    /// Named log stream does not exist.
    #[error("log stream does not exist: {0}")]
    StreamNotFound(String),

    /// Forwarding a log stream failed.
    #[error("log forward '{name}' failed: {reason}")]
    ForwardFailed { name: String, reason: String },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Operation cancelled via the cancellation token.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// True for the typed cache miss, which drives a rebuild.
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, Error::CacheEntryNotFound { .. })
    }
}
