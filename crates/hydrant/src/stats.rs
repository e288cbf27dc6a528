//! Running statistics and the per-batch ring
//!
//! One lock covers the running totals and the ring. When a caller also
//! needs the pool lock (worker reports, status snapshots) the stats lock
//! is taken first; the pool never takes the stats lock.

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;

/// Number of per-batch records retained
pub const STATS_RING_SIZE: usize = 1000;

/// One flushed batch
#[derive(Debug, Clone, Copy)]
pub struct BatchRecord {
    /// Bytes accepted by the copy stream
    pub processed: usize,
    /// Bytes left unshipped
    pub failed: usize,
    /// When the flush completed
    pub at: Instant,
}

/// Running totals plus the batch ring. Fields are read directly by the
/// worker loop and the status snapshot while the lock is held.
#[derive(Debug)]
pub struct RunningStats {
    pub(crate) total_bytes: u64,
    pub(crate) batches_processed: u64,
    pub(crate) errors: u64,
    pub(crate) avg_batch_time_ms: f64,
    pub(crate) started: Instant,
    /// Stamp refreshed by every flush and by worker reports; drives the
    /// once-a-minute summary
    pub(crate) last_batch: Instant,
    /// Completion time of the previous flush, the basis of the rolling
    /// mean. Kept separate from the ring so the first sample of a cycle
    /// never reads a stale slot.
    last_flush: Option<Instant>,
    ring: Vec<BatchRecord>,
    ring_capacity: usize,
    cursor: usize,
}

/// Thread-safe recorder around [`RunningStats`]
pub struct StatsRecorder {
    inner: Mutex<RunningStats>,
}

/// Point-in-time copy of the running totals
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    /// Seconds since the recorder was created
    pub uptime_seconds: u64,
    /// Total bytes accepted across all flushes
    pub total_bytes: u64,
    /// Number of flushes recorded
    pub batches_processed: u64,
    /// Number of flushes that left bytes unshipped
    pub errors: u64,
    /// Rolling mean interval between flush completions, in milliseconds
    pub avg_batch_time_ms: f64,
}

impl StatsRecorder {
    /// Create a recorder retaining `ring_capacity` per-batch records
    pub fn new(ring_capacity: usize) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(RunningStats {
                total_bytes: 0,
                batches_processed: 0,
                errors: 0,
                avg_batch_time_ms: 0.0,
                started: now,
                last_batch: now,
                last_flush: None,
                ring: Vec::with_capacity(ring_capacity),
                ring_capacity,
                cursor: 0,
            }),
        }
    }

    /// Record one flush outcome
    pub async fn record_flush(&self, processed: usize, failed: usize) {
        let mut stats = self.inner.lock().await;
        let now = Instant::now();

        let record = BatchRecord {
            processed,
            failed,
            at: now,
        };
        if stats.ring.len() < stats.ring_capacity {
            stats.ring.push(record);
        } else {
            let cursor = stats.cursor;
            stats.ring[cursor] = record;
        }
        stats.cursor = (stats.cursor + 1) % stats.ring_capacity;

        stats.batches_processed += 1;
        stats.total_bytes += processed as u64;
        if failed > 0 {
            stats.errors += 1;
        }

        if let Some(previous) = stats.last_flush {
            let interval_ms = now.duration_since(previous).as_secs_f64() * 1000.0;
            let n = stats.batches_processed as f64;
            stats.avg_batch_time_ms = (stats.avg_batch_time_ms * (n - 1.0) + interval_ms) / n;
        }
        stats.last_flush = Some(now);
        stats.last_batch = now;
    }

    /// Lock the running stats; used where the stats lock must be held
    /// across a pool-lock acquisition
    pub(crate) async fn lock(&self) -> MutexGuard<'_, RunningStats> {
        self.inner.lock().await
    }

    /// Copy of the running totals
    pub async fn snapshot(&self) -> StatsSnapshot {
        let stats = self.inner.lock().await;
        StatsSnapshot {
            uptime_seconds: stats.started.elapsed().as_secs(),
            total_bytes: stats.total_bytes,
            batches_processed: stats.batches_processed,
            errors: stats.errors,
            avg_batch_time_ms: stats.avg_batch_time_ms,
        }
    }

    /// The most recent batch records, newest last; mainly for
    /// diagnostics
    pub async fn recent(&self, n: usize) -> Vec<BatchRecord> {
        let stats = self.inner.lock().await;
        let len = stats.ring.len();
        let take = n.min(len);
        let mut out = Vec::with_capacity(take);
        for i in 0..take {
            // Walk backwards from the cursor, wrapping.
            let idx = (stats.cursor + len - take + i) % len.max(1);
            out.push(stats.ring[idx]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_record_flush_totals() {
        let stats = StatsRecorder::new(8);
        stats.record_flush(1024, 0).await;
        stats.record_flush(2048, 512).await;

        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot.total_bytes, 3072);
        assert_eq!(snapshot.batches_processed, 2);
        assert_eq!(snapshot.errors, 1);
    }

    #[tokio::test]
    async fn test_errors_count_batches_not_bytes() {
        let stats = StatsRecorder::new(8);
        stats.record_flush(0, 4096).await;
        stats.record_flush(0, 8192).await;

        let snapshot = stats.snapshot().await;
        assert_eq!(snapshot.errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_mean_uses_flush_intervals() {
        let stats = StatsRecorder::new(8);

        // First flush has no previous stamp and contributes no interval.
        stats.record_flush(100, 0).await;
        assert_eq!(stats.snapshot().await.avg_batch_time_ms, 0.0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        stats.record_flush(100, 0).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        stats.record_flush(100, 0).await;

        // Mean over n=2 and n=3 weighted as a running average:
        // after 2nd: 100/2 = 50; after 3rd: (50*2 + 200)/3 = 100.
        let snapshot = stats.snapshot().await;
        assert!((snapshot.avg_batch_time_ms - 100.0).abs() < 1.0);
    }

    #[tokio::test]
    async fn test_ring_wraps_without_growing() {
        let stats = StatsRecorder::new(4);
        for i in 0..10 {
            stats.record_flush(i, 0).await;
        }

        let inner = stats.inner.lock().await;
        assert_eq!(inner.ring.len(), 4);
        // 10 records through a 4-slot ring leave the cursor at 10 % 4.
        assert_eq!(inner.cursor, 2);
    }

    #[tokio::test]
    async fn test_recent_returns_newest() {
        let stats = StatsRecorder::new(4);
        for i in 0..6 {
            stats.record_flush(i, 0).await;
        }

        let recent = stats.recent(2).await;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].processed, 4);
        assert_eq!(recent[1].processed, 5);
    }
}
