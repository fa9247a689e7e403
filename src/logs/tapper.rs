//! Tappable log streams.
//!
//! A [`LogTapper`] wraps a sink capturer and exposes its stdout/stderr as
//! [`MultiWriter`]s. A tap is an in-memory pipe whose write half lives in
//! the multiwriter's secondary set; the read half is handed to the caller
//! as a [`LogTap`]. Bytes written before the tap was created are never
//! observed by it.

use crate::constants::TAP_PIPE_CAPACITY;
use crate::logs::{LogCapturer, MultiWriter, StreamWriter, WriterId};
use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TapKind {
    Stdout,
    Stderr,
}

struct TapperInner {
    stdout: Arc<MultiWriter>,
    stderr: Arc<MultiWriter>,
    sink: Arc<dyn LogCapturer>,
    taps: tokio::sync::Mutex<HashSet<(TapKind, WriterId)>>,
}

impl TapperInner {
    fn multiwriter(&self, kind: TapKind) -> &Arc<MultiWriter> {
        match kind {
            TapKind::Stdout => &self.stdout,
            TapKind::Stderr => &self.stderr,
        }
    }

    /// Detaches a tap's write half; a reader still blocked on the pipe
    /// observes EOF. Removing an already-removed tap is a no-op.
    async fn remove_tap(&self, kind: TapKind, id: WriterId) {
        let was_tracked = self.taps.lock().await.remove(&(kind, id));
        if was_tracked {
            self.multiwriter(kind).remove_writer(id).await;
        }
    }

    async fn remove_all_taps(&self) {
        let taps: Vec<_> = self.taps.lock().await.drain().collect();
        for (kind, id) in taps {
            self.multiwriter(kind).remove_writer(id).await;
        }
    }
}

/// A named log stream whose stdout/stderr can be tapped while live.
///
/// Cloning shares the underlying stream.
#[derive(Clone)]
pub struct LogTapper {
    inner: Arc<TapperInner>,
}

impl LogTapper {
    /// Wraps a sink capturer in tappable multiwriters.
    pub fn new(sink: Arc<dyn LogCapturer>) -> LogTapper {
        LogTapper {
            inner: Arc::new(TapperInner {
                stdout: Arc::new(MultiWriter::new(sink.stdout())),
                stderr: Arc::new(MultiWriter::new(sink.stderr())),
                sink,
                taps: tokio::sync::Mutex::new(HashSet::new()),
            }),
        }
    }

    /// A fresh read handle over stdout. Observes only subsequent writes.
    pub async fn tap_stdout(&self) -> LogTap {
        self.add_tap(TapKind::Stdout).await
    }

    /// A fresh read handle over stderr. Observes only subsequent writes.
    pub async fn tap_stderr(&self) -> LogTap {
        self.add_tap(TapKind::Stderr).await
    }

    async fn add_tap(&self, kind: TapKind) -> LogTap {
        let (write_half, read_half) = tokio::io::duplex(TAP_PIPE_CAPACITY);
        let id = self
            .inner
            .multiwriter(kind)
            .add_writer(Box::new(write_half))
            .await;
        self.inner.taps.lock().await.insert((kind, id));
        LogTap {
            reader: read_half,
            tapper: self.inner.clone(),
            kind,
            id,
        }
    }

    /// Closes every outstanding tap, then the underlying sink.
    pub async fn close(&self) -> io::Result<()> {
        self.inner.remove_all_taps().await;
        self.inner.sink.close().await
    }
}

#[async_trait]
impl LogCapturer for LogTapper {
    fn stdout(&self) -> Arc<dyn StreamWriter> {
        self.inner.stdout.clone()
    }

    fn stderr(&self) -> Arc<dyn StreamWriter> {
        self.inner.stderr.clone()
    }

    async fn close(&self) -> io::Result<()> {
        LogTapper::close(self).await
    }
}

/// A transient read handle over one side of a log stream.
///
/// Reads block until data arrives and return EOF once the tap (or its
/// tapper) is closed. Dropping a tap without closing it leaves the write
/// half in place until the next write fails against the dead pipe, at
/// which point the multiwriter evicts it.
pub struct LogTap {
    reader: DuplexStream,
    tapper: Arc<TapperInner>,
    kind: TapKind,
    id: WriterId,
}

impl LogTap {
    /// Detaches the tap from its stream.
    pub async fn close(self) {
        let LogTap {
            reader,
            tapper,
            kind,
            id,
        } = self;
        // Release the read half first: a writer blocked on a full pipe
        // fails with a broken pipe and gets evicted instead of holding
        // the secondary set locked against this removal.
        drop(reader);
        debug!("closing tap {:?}", id);
        tapper.remove_tap(kind, id).await;
    }
}

impl AsyncRead for LogTap {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match Pin::new(&mut self.reader).poll_read(cx, buf) {
            // A torn-down pipe reads as end-of-stream.
            Poll::Ready(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => Poll::Ready(Ok(())),
            other => other,
        }
    }
}
