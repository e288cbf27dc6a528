//! Bulk-copy driver
//!
//! Ships one batch through an acquired connection inside a single
//! transaction: begin, enter copy mode with the pre-prepared statement,
//! stream fixed-size chunks with backpressure-aware retries, end the
//! copy, commit. Any abort rolls back and reports the unshipped tail as
//! failed; the tail is never retried here (at-most-once per batch).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error};

use crate::batch::FlushOutcome;
use crate::connection::ChunkStatus;
use crate::pool::{Pool, MAX_BACKOFF_ATTEMPTS};

/// Bytes per put-chunk call
pub const COPY_CHUNK_SIZE: usize = 8 * 1024;

/// Consecutive backpressure events tolerated on one chunk
pub const MAX_CHUNK_RETRIES: u32 = 5;

/// Progress is logged every time the written offset crosses a boundary
const PROGRESS_INTERVAL: usize = 1024 * 1024;

pub(crate) async fn ship(pool: &Arc<Pool>, data: &Bytes) -> FlushOutcome {
    let total = data.len();

    let mut guard = match pool.acquire().await {
        Ok(guard) => guard,
        Err(e) => {
            error!(error = %e, "no connection available for batch flush");
            return FlushOutcome {
                processed: 0,
                failed: total,
                ok: false,
            };
        }
    };

    if let Err(e) = guard.connection().begin().await {
        error!(error = %e, "failed to begin transaction");
        guard.mark_dead(&e.to_string()).await;
        return FlushOutcome {
            processed: 0,
            failed: total,
            ok: false,
        };
    }

    if let Err(e) = guard.connection().copy_start().await {
        error!(error = %e, "failed to start copy");
        guard.connection().rollback().await;
        guard.mark_dead(&e.to_string()).await;
        return FlushOutcome {
            processed: 0,
            failed: total,
            ok: false,
        };
    }

    let mut written = 0usize;
    let mut retries = 0u32;
    let mut ok = true;
    // Set on failures that kill the slot; release-with-error otherwise.
    let mut fatal: Option<String> = None;

    while written < total {
        let end = (written + COPY_CHUNK_SIZE).min(total);
        let chunk = data.slice(written..end);

        match guard.connection().put_chunk(chunk).await {
            ChunkStatus::Written => {
                let before = written;
                written = end;
                retries = 0;
                if written / PROGRESS_INTERVAL > before / PROGRESS_INTERVAL {
                    debug!(written, total, "copy progress");
                }
            }
            ChunkStatus::Backpressure => {
                guard.connection().drain().await;
                retries += 1;
                if retries > MAX_CHUNK_RETRIES {
                    error!(written, total, "backpressure persisted past retry budget");
                    fatal = Some("backpressure persisted past retry budget".to_string());
                    ok = false;
                    break;
                }
                let shift = retries.min(MAX_BACKOFF_ATTEMPTS);
                tokio::time::sleep(Duration::from_millis(1u64 << shift)).await;
            }
            ChunkStatus::Error(message) => {
                error!(error = %message, written, total, "failed to write copy chunk");
                fatal = Some(message);
                ok = false;
                break;
            }
        }
    }

    if ok {
        if let Err(e) = guard.connection().copy_end().await {
            error!(error = %e, "failed to end copy");
            guard.note_error(e.to_string());
            ok = false;
        } else if let Err(e) = guard.connection().commit().await {
            // The transaction is lost; committed work is never retried.
            error!(error = %e, "failed to commit batch transaction");
            guard.note_error(e.to_string());
            ok = false;
        }
    }

    if !ok {
        guard.connection().rollback().await;
    }

    let failed = if ok { 0 } else { total - written };

    match fatal {
        Some(reason) => guard.mark_dead(&reason).await,
        None => guard.release(!ok).await,
    }

    FlushOutcome {
        processed: written,
        failed,
        ok,
    }
}
