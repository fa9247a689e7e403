//! # Named Log Streams with Dynamic Fan-out
//!
//! Every child process the suite runner manages writes into a named log
//! stream. A stream is a (stdout, stderr) pair of writers, each fronted by
//! a [`MultiWriter`] so readers can be attached and detached while the
//! stream is live.
//!
//! ```text
//!   child process ──► MultiWriter ──► primary sink (file / console / null)
//!                        │
//!                        ├──► tap pipe ──► forwarder copy task
//!                        └──► tap pipe ──► extra capturer copy task
//! ```
//!
//! The graph is acyclic: primary → multiwriter → secondaries → pipes →
//! taps. The primary sink's durability is never compromised by a
//! misbehaving tap; faulty secondaries are evicted silently.

mod forward;
mod multiwriter;
mod router;
mod tapper;

pub use forward::{serve_forwards, LogForwarder, RemoteLogForwarder};
pub use multiwriter::{MultiWriter, WriterId};
pub use router::LogRouter;
pub use tapper::{LogTap, LogTapper};

use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Owned async byte sink, the write half of a tap pipe or a file handle.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Object-safe shared byte sink. Unlike [`AsyncWrite`] this is callable
/// through a shared reference, so one writer can serve many tasks.
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// Writes the whole buffer or fails.
    async fn write_all(&self, buf: &[u8]) -> io::Result<()>;
}

/// Copies a child-process pipe (or any reader) into a stream writer
/// until EOF. Read and write failures end the copy.
pub async fn copy_reader<R>(mut reader: R, writer: Arc<dyn StreamWriter>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf = vec![0u8; crate::constants::TAP_COPY_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// A [`StreamWriter`] over any owned [`AsyncWrite`].
pub struct SharedWriter {
    inner: tokio::sync::Mutex<BoxedWriter>,
}

impl SharedWriter {
    pub fn new<W>(writer: W) -> Arc<SharedWriter>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Arc::new(SharedWriter {
            inner: tokio::sync::Mutex::new(Box::new(writer)),
        })
    }
}

#[async_trait]
impl StreamWriter for SharedWriter {
    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.write_all(buf).await?;
        inner.flush().await
    }
}

/// A logging backend providing writers for a stdout/stderr pair.
#[async_trait]
pub trait LogCapturer: Send + Sync {
    fn stdout(&self) -> Arc<dyn StreamWriter>;
    fn stderr(&self) -> Arc<dyn StreamWriter>;

    /// Flushes and releases the backend.
    async fn close(&self) -> io::Result<()>;
}

// =============================================================================
// File Backend
// =============================================================================

/// Log capturer writing stdout and stderr to separate files with
/// `-stdout` and `-stderr` suffixes.
pub struct FileLogCapturer {
    stdout: Arc<SharedWriter>,
    stderr: Arc<SharedWriter>,
}

impl FileLogCapturer {
    /// Creates `<basename>-stdout` and `<basename>-stderr`, creating
    /// parent directories as needed.
    pub async fn create(basename: &Path) -> io::Result<FileLogCapturer> {
        if let Some(parent) = basename.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let suffixed = |suffix: &str| {
            let mut name = basename.as_os_str().to_owned();
            name.push(suffix);
            std::path::PathBuf::from(name)
        };
        let out = tokio::fs::File::create(suffixed("-stdout")).await?;
        let err = tokio::fs::File::create(suffixed("-stderr")).await?;
        Ok(FileLogCapturer {
            stdout: SharedWriter::new(out),
            stderr: SharedWriter::new(err),
        })
    }
}

#[async_trait]
impl LogCapturer for FileLogCapturer {
    fn stdout(&self) -> Arc<dyn StreamWriter> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn StreamWriter> {
        self.stderr.clone()
    }

    async fn close(&self) -> io::Result<()> {
        self.stdout.inner.lock().await.shutdown().await?;
        self.stderr.inner.lock().await.shutdown().await
    }
}

// =============================================================================
// Console Backend
// =============================================================================

/// Log capturer using the process console as a backend.
pub struct ConsoleLogCapturer {
    stdout: Arc<SharedWriter>,
    stderr: Arc<SharedWriter>,
}

impl ConsoleLogCapturer {
    pub fn new() -> ConsoleLogCapturer {
        ConsoleLogCapturer {
            stdout: SharedWriter::new(tokio::io::stdout()),
            stderr: SharedWriter::new(tokio::io::stderr()),
        }
    }
}

impl Default for ConsoleLogCapturer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogCapturer for ConsoleLogCapturer {
    fn stdout(&self) -> Arc<dyn StreamWriter> {
        self.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn StreamWriter> {
        self.stderr.clone()
    }

    async fn close(&self) -> io::Result<()> {
        // The console outlives the capturer.
        Ok(())
    }
}

// =============================================================================
// Null Backend
// =============================================================================

/// Log capturer discarding everything. Used when no log root is set.
pub struct NullLogCapturer {
    sink: Arc<SharedWriter>,
}

impl NullLogCapturer {
    pub fn new() -> NullLogCapturer {
        NullLogCapturer {
            sink: SharedWriter::new(tokio::io::sink()),
        }
    }
}

impl Default for NullLogCapturer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogCapturer for NullLogCapturer {
    fn stdout(&self) -> Arc<dyn StreamWriter> {
        self.sink.clone()
    }

    fn stderr(&self) -> Arc<dyn StreamWriter> {
        self.sink.clone()
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}
