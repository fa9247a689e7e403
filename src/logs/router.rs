//! Stream creation and routing.
//!
//! The router owns every named stream it creates and a list of forwarders
//! receiving all streams. One coordinator task services three channels:
//! forwarder-added, stream-created, and close. Copy tasks move tap data
//! into forwarders and extra capturers; because every attachment starts
//! from a fresh tap, late joiners see no replayed data.

use crate::constants::{ROUTER_CHANNEL_CAPACITY, TAP_COPY_CHUNK};
use crate::error::{Error, Result};
use crate::logs::{
    FileLogCapturer, LogCapturer, LogForwarder, LogTap, LogTapper, NullLogCapturer, StreamWriter,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

struct RouterState {
    streams: HashMap<String, LogTapper>,
    forwarders: Vec<Arc<dyn LogForwarder>>,
    forward_tx: Option<mpsc::Sender<Arc<dyn LogForwarder>>>,
    stream_tx: Option<mpsc::Sender<String>>,
    close_tx: Option<oneshot::Sender<()>>,
}

/// Routes named log streams to sinks, taps, and forwarders.
pub struct LogRouter {
    log_dir: Option<PathBuf>,
    state: Arc<tokio::sync::Mutex<RouterState>>,
    coordinator: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LogRouter {
    /// A router writing stream files under `log_dir`. With no directory,
    /// streams are created against a null sink and only taps observe data.
    pub fn new(log_dir: Option<PathBuf>) -> LogRouter {
        let (forward_tx, forward_rx) = mpsc::channel(ROUTER_CHANNEL_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::channel(ROUTER_CHANNEL_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();

        let state = Arc::new(tokio::sync::Mutex::new(RouterState {
            streams: HashMap::new(),
            forwarders: Vec::new(),
            forward_tx: Some(forward_tx),
            stream_tx: Some(stream_tx),
            close_tx: Some(close_tx),
        }));

        let coordinator = tokio::spawn(route(state.clone(), forward_rx, stream_rx, close_rx));

        LogRouter {
            log_dir,
            state,
            coordinator: tokio::sync::Mutex::new(Some(coordinator)),
        }
    }

    /// Returns the named stream, creating it on first request. Creation is
    /// idempotent: the same name always maps to the same tapper.
    pub async fn capturer(&self, name: &str) -> Result<LogTapper> {
        let (tapper, stream_tx) = {
            let mut state = self.state.lock().await;
            if let Some(existing) = state.streams.get(name) {
                return Ok(existing.clone());
            }
            let stream_tx = state.stream_tx.clone().ok_or(Error::RouterClosed)?;

            let sink: Arc<dyn LogCapturer> = match &self.log_dir {
                Some(dir) => Arc::new(FileLogCapturer::create(&dir.join(name)).await?),
                None => Arc::new(NullLogCapturer::new()),
            };
            let tapper = LogTapper::new(sink);
            state.streams.insert(name.to_string(), tapper.clone());
            (tapper, stream_tx)
        };

        // Announce outside the lock; the coordinator takes the same lock.
        let _ = stream_tx.send(name.to_string()).await;
        Ok(tapper)
    }

    /// Attaches an extra capturer to an existing stream. Only data written
    /// after the attachment reaches the capturer.
    pub async fn add_capturer(&self, name: &str, capturer: Arc<dyn LogCapturer>) -> Result<()> {
        let tapper = {
            let state = self.state.lock().await;
            state
                .streams
                .get(name)
                .cloned()
                .ok_or_else(|| Error::StreamNotFound(name.to_string()))?
        };

        let stdout_tap = tapper.tap_stdout().await;
        let stderr_tap = tapper.tap_stderr().await;
        tokio::spawn(copy_tap(name.to_string(), capturer.stdout(), stdout_tap));
        tokio::spawn(copy_tap(name.to_string(), capturer.stderr(), stderr_tap));
        Ok(())
    }

    /// Registers a forwarder for all streams, current and future. Only
    /// data written after registration is forwarded.
    pub async fn add_forwarder(&self, forwarder: Arc<dyn LogForwarder>) -> Result<()> {
        let forward_tx = {
            let state = self.state.lock().await;
            state.forward_tx.clone().ok_or(Error::RouterClosed)?
        };
        let _ = forward_tx.send(forwarder).await;
        Ok(())
    }

    /// Shuts the router down: stops all forwards, closes every stream and
    /// its taps, and retires the coordinator. Pending writes race the
    /// shutdown and may be lost; stop writers first for strict ordering.
    pub async fn shutdown(&self) {
        let close_tx = {
            let mut state = self.state.lock().await;
            state.forward_tx = None;
            state.stream_tx = None;
            state.close_tx.take()
        };
        let Some(close_tx) = close_tx else {
            return;
        };
        let _ = close_tx.send(());

        if let Some(coordinator) = self.coordinator.lock().await.take() {
            let _ = coordinator.await;
        }

        let streams: Vec<LogTapper> = {
            let mut state = self.state.lock().await;
            state.streams.drain().map(|(_, t)| t).collect()
        };
        for tapper in streams {
            if let Err(e) = tapper.close().await {
                debug!("error closing stream: {}", e);
            }
        }
        debug!("log router completed");
    }
}

/// Coordinator loop: services forwarder-added, stream-created, and close.
async fn route(
    state: Arc<tokio::sync::Mutex<RouterState>>,
    mut forward_rx: mpsc::Receiver<Arc<dyn LogForwarder>>,
    mut stream_rx: mpsc::Receiver<String>,
    mut close_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            Some(forwarder) = forward_rx.recv() => {
                let streams: Vec<(String, LogTapper)> = {
                    let mut state = state.lock().await;
                    state.forwarders.push(forwarder.clone());
                    state.streams.iter().map(|(n, t)| (n.clone(), t.clone())).collect()
                };
                for (name, tapper) in streams {
                    forward_stream(forwarder.as_ref(), &name, &tapper).await;
                }
            }
            Some(name) = stream_rx.recv() => {
                let attach = {
                    let state = state.lock().await;
                    state.streams.get(&name).map(|tapper| {
                        (tapper.clone(), state.forwarders.clone())
                    })
                };
                if let Some((tapper, forwarders)) = attach {
                    for forwarder in forwarders {
                        forward_stream(forwarder.as_ref(), &name, &tapper).await;
                    }
                }
            }
            _ = &mut close_rx => {
                let (names, forwarders) = {
                    let state = state.lock().await;
                    (
                        state.streams.keys().cloned().collect::<Vec<_>>(),
                        state.forwarders.clone(),
                    )
                };
                for name in names {
                    for forwarder in &forwarders {
                        for suffix in ["stdout", "stderr"] {
                            let forward_name = format!("{}-{}", name, suffix);
                            if let Err(e) = forwarder.stop_forward(&forward_name).await {
                                error!("error stopping forward {}: {}", forward_name, e);
                            }
                        }
                    }
                }
                return;
            }
        }
    }
}

/// Starts stdout and stderr forwards for one stream on one forwarder.
async fn forward_stream(forwarder: &dyn LogForwarder, name: &str, tapper: &LogTapper) {
    let forward_name = format!("{}-stdout", name);
    let tap = tapper.tap_stdout().await;
    if let Err(e) = forwarder.start_forward(&forward_name, tap).await {
        error!("unable to start forwarder {}: {}", forward_name, e);
    }
    let forward_name = format!("{}-stderr", name);
    let tap = tapper.tap_stderr().await;
    if let Err(e) = forwarder.start_forward(&forward_name, tap).await {
        error!("unable to start forwarder {}: {}", forward_name, e);
    }
}

/// Copies tap data into a writer until the tap or the writer gives out.
async fn copy_tap(name: String, writer: Arc<dyn StreamWriter>, mut tap: LogTap) {
    let mut buf = vec![0u8; TAP_COPY_CHUNK];
    loop {
        match tap.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    error!("capture copy failed for {}: {}", name, e);
                    break;
                }
            }
            Err(e) => {
                error!("capture read failed for {}: {}", name, e);
                break;
            }
        }
    }
    tap.close().await;
    debug!("done copying tap {}", name);
}
