//! Background health and stats workers
//!
//! Workers are pure observers: once a second each one checks whether a
//! status summary is due and whether the pool has degraded. They hold the
//! stats lock while counting pool slots (lock order: stats before pool).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::pool::{Pool, POOL_SIZE};
use crate::stats::StatsRecorder;

/// Workers started by the default deployment
pub const WORKER_COUNT: usize = 2;

const REPORT_INTERVAL: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Starts, tracks, and joins the background workers
pub struct WorkerSupervisor {
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    /// Create a supervisor observing the shared shutdown flag
    pub fn new(shutdown: Arc<AtomicBool>) -> Self {
        Self {
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `num_workers` observer tasks
    pub async fn start(&self, num_workers: usize, pool: Arc<Pool>, stats: Arc<StatsRecorder>) {
        let mut handles = self.handles.lock().await;
        for worker in 0..num_workers {
            let pool = Arc::clone(&pool);
            let stats = Arc::clone(&stats);
            let shutdown = Arc::clone(&self.shutdown);
            handles.push(tokio::spawn(worker_loop(worker, pool, stats, shutdown)));
        }
    }

    /// Set the shutdown flag and join every worker. Safe to call more
    /// than once.
    pub async fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    worker: usize,
    pool: Arc<Pool>,
    stats: Arc<StatsRecorder>,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::Acquire) {
        {
            let mut stats = stats.lock().await;
            if stats.last_batch.elapsed() >= REPORT_INTERVAL {
                info!(
                    worker,
                    batches = stats.batches_processed,
                    errors = stats.errors,
                    "worker status"
                );
                stats.last_batch = Instant::now();
            }

            let counts = pool.counts().await;
            if counts.dead > 0 && counts.available < POOL_SIZE / 2 {
                warn!(
                    worker,
                    dead = counts.dead,
                    available = counts.available,
                    "pool health degraded"
                );
            }
        }

        tokio::time::sleep(POLL_INTERVAL).await;
    }

    debug!(worker, "worker shutting down");
}
