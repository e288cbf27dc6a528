//! Pipeline orchestration
//!
//! [`Hydrant`] owns the configuration, the connection pool, the batch
//! accumulator, the stats recorder, and the background workers. It
//! drives the producer loop over an input stream and sequences graceful
//! shutdown: flag, workers, residual flush, teardown.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tracing::{error, info};

use crate::batch::{BatchWriter, FlushOutcome};
use crate::config::Config;
use crate::connection::ConnectionFactory;
use crate::pool::Pool;
use crate::postgres::PgConnectionFactory;
use crate::stats::{StatsRecorder, STATS_RING_SIZE};
use crate::worker::{WorkerSupervisor, WORKER_COUNT};
use crate::Result;

/// The ingestion pipeline
pub struct Hydrant {
    config: Arc<Config>,
    pool: Arc<Pool>,
    stats: Arc<StatsRecorder>,
    batch: BatchWriter,
    workers: WorkerSupervisor,
    shutdown: Arc<AtomicBool>,
}

impl Hydrant {
    /// Initialize against PostgreSQL, loading configuration from the
    /// given file or from the environment
    pub async fn init(config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load(config_path)?;
        Self::with_factory(config, Arc::new(PgConnectionFactory)).await
    }

    /// Initialize with an explicit connection factory. This is the seam
    /// for alternate backends and for tests.
    pub async fn with_factory(config: Config, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        let config = Arc::new(config.clamped());
        let shutdown = Arc::new(AtomicBool::new(false));

        let pool = Pool::connect(Arc::clone(&config), factory, Arc::clone(&shutdown)).await?;
        let stats = Arc::new(StatsRecorder::new(STATS_RING_SIZE));
        let batch = BatchWriter::new(config.batch_size, Arc::clone(&pool), Arc::clone(&stats));

        let workers = WorkerSupervisor::new(Arc::clone(&shutdown));
        workers
            .start(WORKER_COUNT, Arc::clone(&pool), Arc::clone(&stats))
            .await;

        let healthy = pool.healthy_count().await;
        info!(
            healthy,
            batch_capacity = config.batch_size,
            "hydrant initialized"
        );

        Ok(Self {
            config,
            pool,
            stats,
            batch,
            workers,
            shutdown,
        })
    }

    /// The effective configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Append bytes to the current batch, returning false when they do
    /// not fit. Callers flush and retry on false; a second rejection is
    /// fatal for the producer.
    pub async fn append(&self, data: &[u8]) -> bool {
        self.batch.append(data).await
    }

    /// Flush the current batch to the database
    pub async fn flush(&self) -> FlushOutcome {
        self.batch.flush().await
    }

    /// Read the input stream to EOF in batch-capacity chunks, flushing
    /// whenever the buffer fills and once more for the residue.
    ///
    /// A mid-stream read error is logged and ends the loop; the bytes
    /// accumulated so far are still flushed. The shutdown flag is
    /// honored between iterations.
    pub async fn process_input<R>(&self, mut input: R)
    where
        R: AsyncRead + Unpin,
    {
        let started = Instant::now();
        let mut chunk = vec![0u8; self.config.batch_size];

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }

            match input.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let data = &chunk[..n];
                    if !self.batch.append(data).await {
                        self.batch.flush().await;
                        if !self.batch.append(data).await {
                            error!(bytes = n, "failed to buffer input after flush");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to read input");
                    break;
                }
            }
        }

        if !self.batch.is_empty().await {
            self.batch.flush().await;
        }

        let status = self.status().await;
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = %status,
            "input processing complete"
        );
    }

    /// Graceful shutdown: set the flag, join the workers, flush any
    /// residual batch, tear the pool down. Idempotent; a second call
    /// observes the flag already set and returns.
    pub async fn request_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutdown requested");

        self.pool.notify_waiters();
        self.workers.stop().await;

        if !self.batch.is_empty().await {
            let outcome = self.batch.flush().await;
            if !outcome.ok {
                error!(lost_bytes = outcome.failed, "failed to flush final batch");
            }
        }

        let status = self.status().await;
        info!(status = %status, "final hydrant status");

        self.pool.close().await;
    }

    /// Point-in-time status snapshot. Takes the stats lock, then the
    /// pool lock, then reads the batch length.
    pub async fn status(&self) -> StatusSnapshot {
        let stats = self.stats.lock().await;
        let counts = self.pool.counts().await;
        let snapshot = StatusSnapshot {
            uptime_seconds: stats.started.elapsed().as_secs(),
            total_bytes: stats.total_bytes,
            batches_processed: stats.batches_processed,
            errors: stats.errors,
            avg_batch_time_ms: stats.avg_batch_time_ms,
            connections: ConnectionStatus {
                available: counts.available,
                in_use: counts.in_use,
                dead: counts.dead,
                resets: self.pool.resets(),
                failures: self.pool.failures(),
            },
            current_batch_size: 0,
        };
        drop(stats);

        StatusSnapshot {
            current_batch_size: self.batch.len().await,
            ..snapshot
        }
    }
}

/// Connection counts by category, plus lifetime reset/failure counters
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionStatus {
    /// Idle healthy slots
    pub available: usize,
    /// Slots currently lent out
    pub in_use: usize,
    /// Dead slots, including permanently quarantined ones
    pub dead: usize,
    /// Successful recoveries
    pub resets: u64,
    /// Failed recovery attempts
    pub failures: u64,
}

/// JSON-serializable status snapshot
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatusSnapshot {
    /// Seconds since init
    pub uptime_seconds: u64,
    /// Total bytes accepted across all flushes
    pub total_bytes: u64,
    /// Number of flushes
    pub batches_processed: u64,
    /// Flushes that left bytes unshipped
    pub errors: u64,
    /// Rolling mean interval between flushes, in milliseconds
    pub avg_batch_time_ms: f64,
    /// Pool state
    pub connections: ConnectionStatus,
    /// Bytes currently accumulated in the batch buffer
    pub current_batch_size: usize,
}

impl StatusSnapshot {
    /// Render the snapshot as a JSON object string
    pub fn to_json(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(rendered) => f.write_str(&rendered),
            Err(_) => Err(fmt::Error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_snapshot_json_keys() {
        let snapshot = StatusSnapshot {
            uptime_seconds: 12,
            total_bytes: 1024,
            batches_processed: 3,
            errors: 1,
            avg_batch_time_ms: 4.5,
            connections: ConnectionStatus {
                available: 8,
                in_use: 1,
                dead: 1,
                resets: 2,
                failures: 5,
            },
            current_batch_size: 256,
        };

        let json = snapshot.to_json();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["uptime_seconds"], 12);
        assert_eq!(parsed["total_bytes"], 1024);
        assert_eq!(parsed["batches_processed"], 3);
        assert_eq!(parsed["errors"], 1);
        assert_eq!(parsed["connections"]["available"], 8);
        assert_eq!(parsed["connections"]["in_use"], 1);
        assert_eq!(parsed["connections"]["dead"], 1);
        assert_eq!(parsed["connections"]["resets"], 2);
        assert_eq!(parsed["connections"]["failures"], 5);
        assert_eq!(parsed["current_batch_size"], 256);
    }
}
