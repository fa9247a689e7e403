//! Engine connection options.
//!
//! Command-line flags take preference, then environment variables
//! (`DOCKER_HOST`, `DOCKER_CERT_PATH`, `DOCKER_TLS_VERIFY`), then
//! defaults. Resolution happens once, in `main`; the resolved options are
//! passed explicitly to whatever constructs the engine client.

use std::path::PathBuf;

const DEFAULT_SOCKET: &str = "unix:///var/run/docker.sock";
const DEFAULT_CA_CERT: &str = "ca.pem";
const DEFAULT_CLIENT_CERT: &str = "cert.pem";
const DEFAULT_CLIENT_KEY: &str = "key.pem";

/// Unresolved flag values, filled by the flag parser.
#[derive(Debug, Clone, Default)]
pub struct EngineFlags {
    pub host: Option<String>,
    pub use_tls: bool,
    pub verify_tls: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

/// TLS material for the engine connection.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub verify: bool,
    pub ca_cert: Option<PathBuf>,
    pub client_cert: Option<PathBuf>,
    pub client_key: Option<PathBuf>,
}

/// Resolved engine connection options.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Daemon socket or host URL.
    pub host: String,
    /// TLS settings; `None` for plaintext sockets.
    pub tls: Option<TlsOptions>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            host: DEFAULT_SOCKET.to_string(),
            tls: None,
        }
    }
}

impl EngineOptions {
    /// Resolves flags against the process environment.
    pub fn resolve(flags: &EngineFlags) -> EngineOptions {
        let host = flags
            .host
            .clone()
            .or_else(|| std::env::var("DOCKER_HOST").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| DEFAULT_SOCKET.to_string());

        let env_verify = std::env::var("DOCKER_TLS_VERIFY")
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        let tls = if flags.use_tls || flags.verify_tls || env_verify {
            let cert_dir = std::env::var("DOCKER_CERT_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| dirs::home_dir().map(|h| h.join(".docker")));

            let locate = |explicit: &Option<String>, default_name: &str| -> Option<PathBuf> {
                if let Some(path) = explicit {
                    return Some(PathBuf::from(path));
                }
                let candidate = cert_dir.as_ref()?.join(default_name);
                candidate.exists().then_some(candidate)
            };

            Some(TlsOptions {
                verify: flags.verify_tls || env_verify,
                ca_cert: locate(&flags.ca_cert, DEFAULT_CA_CERT),
                client_cert: locate(&flags.client_cert, DEFAULT_CLIENT_CERT),
                client_key: locate(&flags.client_key, DEFAULT_CLIENT_KEY),
            })
        } else {
            None
        };

        EngineOptions { host, tls }
    }

    /// Options for the nested daemon's default local socket.
    pub fn local() -> EngineOptions {
        EngineOptions::default()
    }
}
