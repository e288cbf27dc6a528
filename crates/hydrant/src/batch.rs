//! Batch accumulation
//!
//! Bytes are appended into a fixed-capacity buffer and shipped to the
//! database in one bulk-copy transaction per flush. Appends are
//! all-or-nothing: a chunk that does not fit is rejected and the caller
//! flushes before retrying. A failed flush discards the unshipped tail;
//! nothing in this layer retries flushed work.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;

use crate::copy;
use crate::pool::Pool;
use crate::stats::StatsRecorder;

/// Result of one flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Bytes accepted by the copy stream
    pub processed: usize,
    /// Bytes left unshipped; zero on success
    pub failed: usize,
    /// Whether the transaction committed
    pub ok: bool,
}

impl FlushOutcome {
    pub(crate) const EMPTY: Self = Self {
        processed: 0,
        failed: 0,
        ok: true,
    };
}

/// Fixed-capacity byte accumulator
pub struct BatchBuffer {
    buf: Mutex<BytesMut>,
    capacity: usize,
}

impl BatchBuffer {
    /// Create a buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Mutex::new(BytesMut::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append `data` if it fits in the remaining capacity. Never
    /// partial-appends.
    pub async fn append(&self, data: &[u8]) -> bool {
        let mut buf = self.buf.lock().await;
        if buf.len() + data.len() > self.capacity {
            return false;
        }
        buf.extend_from_slice(data);
        true
    }

    /// Take the accumulated bytes, resetting the position to zero
    pub(crate) async fn take(&self) -> Bytes {
        self.buf.lock().await.split().freeze()
    }

    /// Bytes currently accumulated
    pub async fn len(&self) -> usize {
        self.buf.lock().await.len()
    }

    /// Whether the buffer is empty
    pub async fn is_empty(&self) -> bool {
        self.buf.lock().await.is_empty()
    }

    /// Configured capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Batch accumulator wired to the pool and the stats recorder
pub struct BatchWriter {
    buffer: BatchBuffer,
    pool: Arc<Pool>,
    stats: Arc<StatsRecorder>,
}

impl BatchWriter {
    /// Create a writer with a `capacity`-byte buffer
    pub fn new(capacity: usize, pool: Arc<Pool>, stats: Arc<StatsRecorder>) -> Self {
        Self {
            buffer: BatchBuffer::new(capacity),
            pool,
            stats,
        }
    }

    /// Append `data`, returning false when it does not fit
    pub async fn append(&self, data: &[u8]) -> bool {
        self.buffer.append(data).await
    }

    /// Drain the buffer into the database in one transaction.
    ///
    /// The buffer position is reset to zero on every path. An empty
    /// buffer is a successful no-op that records nothing.
    pub async fn flush(&self) -> FlushOutcome {
        let data = self.buffer.take().await;
        if data.is_empty() {
            return FlushOutcome::EMPTY;
        }

        let outcome = copy::ship(&self.pool, &data).await;
        self.stats
            .record_flush(outcome.processed, outcome.failed)
            .await;
        outcome
    }

    /// Bytes currently accumulated
    pub async fn len(&self) -> usize {
        self.buffer.len().await
    }

    /// Whether the buffer is empty
    pub async fn is_empty(&self) -> bool {
        self.buffer.is_empty().await
    }
}
