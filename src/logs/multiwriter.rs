//! Fan-out writer with a durable primary sink.

use crate::logs::{BoxedWriter, StreamWriter};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Handle to a secondary writer registered with a [`MultiWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriterId(u64);

/// Writes to one constant primary sink plus a mutable set of secondaries.
///
/// Every write goes to the primary first; a primary failure propagates to
/// the caller. Secondaries are then written under the set lock, and any
/// secondary that fails is evicted so it can never stall or poison the
/// stream. Eviction closes the writer, which signals EOF to a tap reader
/// on the other end of its pipe.
pub struct MultiWriter {
    sink: Arc<dyn StreamWriter>,
    writers: tokio::sync::Mutex<HashMap<WriterId, BoxedWriter>>,
    next_id: AtomicU64,
}

impl MultiWriter {
    /// A fan-out over a constant primary sink.
    pub fn new(sink: Arc<dyn StreamWriter>) -> MultiWriter {
        MultiWriter {
            sink,
            writers: tokio::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Writes `buf` to the primary, then to every secondary.
    pub async fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.sink.write_all(buf).await?;

        let mut writers = self.writers.lock().await;
        let mut failed = Vec::new();
        for (id, w) in writers.iter_mut() {
            if let Err(e) = w.write_all(buf).await {
                debug!("error writing to output stream, removing: {}", e);
                failed.push(*id);
            }
        }
        for id in failed {
            writers.remove(&id);
        }
        Ok(())
    }

    /// Registers a secondary writer.
    pub async fn add_writer(&self, writer: BoxedWriter) -> WriterId {
        let id = WriterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.writers.lock().await.insert(id, writer);
        id
    }

    /// Removes and closes a secondary. Removing twice is a no-op.
    pub async fn remove_writer(&self, id: WriterId) {
        let removed = self.writers.lock().await.remove(&id);
        if let Some(mut writer) = removed {
            let _ = writer.shutdown().await;
        }
    }

    /// Number of registered secondaries.
    pub async fn writer_count(&self) -> usize {
        self.writers.lock().await.len()
    }
}

#[async_trait]
impl StreamWriter for MultiWriter {
    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        self.write(buf).await
    }
}
