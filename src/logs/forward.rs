//! Remote log forwarding.
//!
//! A forwarder receives every named stream the router creates. The remote
//! forwarder speaks a minimal TCP framing: one connection per forward,
//! opened with a newline-terminated stream name, followed by raw stream
//! bytes until the forward stops. `serve_forwards` is the host-side
//! listener counterpart.

use crate::error::{Error, Result};
use crate::logs::LogTap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A sink for named log streams registered with the router.
#[async_trait]
pub trait LogForwarder: Send + Sync {
    /// Begins forwarding a named stream, consuming the tap. Data written
    /// before the tap was created is never forwarded.
    async fn start_forward(&self, name: &str, tap: LogTap) -> Result<()>;

    /// Stops a named forward. Stopping an unknown name is a no-op.
    async fn stop_forward(&self, name: &str) -> Result<()>;
}

/// Forwards streams to a remote listener over TCP.
pub struct RemoteLogForwarder {
    addr: String,
    active: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RemoteLogForwarder {
    /// A forwarder for the given `host:port` endpoint. Connections are
    /// opened lazily, one per forwarded stream.
    pub fn new(addr: impl Into<String>) -> Arc<RemoteLogForwarder> {
        Arc::new(RemoteLogForwarder {
            addr: addr.into(),
            active: tokio::sync::Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl LogForwarder for RemoteLogForwarder {
    async fn start_forward(&self, name: &str, mut tap: LogTap) -> Result<()> {
        let mut conn = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| Error::ForwardFailed {
                name: name.to_string(),
                reason: format!("connecting {}: {}", self.addr, e),
            })?;
        conn.write_all(format!("{}\n", name).as_bytes())
            .await
            .map_err(|e| Error::ForwardFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let forward_name = name.to_string();
        let task = tokio::spawn(async move {
            if let Err(e) = tokio::io::copy(&mut tap, &mut conn).await {
                debug!("forward {} ended: {}", forward_name, e);
            }
            let _ = conn.shutdown().await;
            tap.close().await;
        });

        let mut active = self.active.lock().await;
        if let Some(previous) = active.insert(name.to_string(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_forward(&self, name: &str) -> Result<()> {
        if let Some(task) = self.active.lock().await.remove(name) {
            // Aborting drops the tap; the stream-side write half is then
            // evicted on its next write.
            task.abort();
        }
        Ok(())
    }
}

/// Listens for forwarded streams and mirrors them to the console.
///
/// Runs until the token is cancelled. Each accepted connection is read as
/// a stream-name header line followed by raw bytes.
pub async fn serve_forwards(addr: &str, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ForwardFailed {
            name: addr.to_string(),
            reason: format!("bind: {}", e),
        })?;
    info!("listening for forwarded logs on {}", addr);

    loop {
        let conn = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, _)) => conn,
                Err(e) => {
                    error!("listen error: {}", e);
                    return Ok(());
                }
            },
            _ = token.cancelled() => return Ok(()),
        };

        tokio::spawn(async move {
            let mut reader = BufReader::new(conn);
            let mut name = String::new();
            if reader.read_line(&mut name).await.is_err() {
                return;
            }
            let name = name.trim().to_string();
            info!("receiving forwarded stream {}", name);

            let mut stdout = tokio::io::stdout();
            if let Err(e) = tokio::io::copy(&mut reader, &mut stdout).await {
                debug!("forwarded stream {} ended: {}", name, e);
            }
        });
    }
}
