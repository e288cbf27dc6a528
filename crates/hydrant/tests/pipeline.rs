//! End-to-end pipeline scenarios: the producer loop, init validation,
//! and graceful shutdown with a residual batch.

mod common;

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use common::{test_config, MockBehavior, MockFactory};
use hydrant::pool::POOL_SIZE;
use hydrant::Hydrant;
use tokio::io::{AsyncRead, ReadBuf};

const KIB: usize = 1024;
const MIB: usize = 1024 * 1024;

#[tokio::test(start_paused = true)]
async fn happy_path_splits_input_into_capacity_batches() {
    let factory = MockFactory::healthy();
    let pipeline = Hydrant::with_factory(
        test_config().with_batch_size(MIB),
        Arc::clone(&factory) as _,
    )
    .await
    .expect("init");

    let data = vec![0xA5u8; 2 * MIB + 512 * KIB];
    pipeline.process_input(&data[..]).await;

    // 2.5 MiB through a 1 MiB buffer: two full batches plus the residue.
    assert_eq!(factory.commits(), vec![MIB, MIB, 512 * KIB]);
    assert_eq!(factory.committed_total(), data.len());

    let status = pipeline.status().await;
    assert_eq!(status.total_bytes, data.len() as u64);
    assert_eq!(status.batches_processed, 3);
    assert_eq!(status.errors, 0);
    assert_eq!(status.current_batch_size, 0);

    pipeline.request_shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_residual_batch() {
    let factory = MockFactory::healthy();
    let pipeline = Hydrant::with_factory(
        test_config().with_batch_size(MIB),
        Arc::clone(&factory) as _,
    )
    .await
    .expect("init");

    assert!(pipeline.append(&vec![0x5Au8; 100 * KIB]).await);
    pipeline.request_shutdown().await;

    assert_eq!(factory.commits(), vec![100 * KIB]);
    let status = pipeline.status().await;
    assert_eq!(status.batches_processed, 1);
    assert_eq!(status.total_bytes, (100 * KIB) as u64);
    assert_eq!(status.current_batch_size, 0);

    // Idempotent: the second call observes the flag and returns without
    // flushing anything further.
    pipeline.request_shutdown().await;
    assert_eq!(factory.commits(), vec![100 * KIB]);
}

#[tokio::test(start_paused = true)]
async fn append_boundary_matches_capacity() {
    let factory = MockFactory::healthy();
    let pipeline = Hydrant::with_factory(
        test_config().with_batch_size(64 * KIB),
        Arc::clone(&factory) as _,
    )
    .await
    .expect("init");

    assert!(pipeline.append(&vec![0u8; 64 * KIB]).await);
    assert!(!pipeline.append(&[0u8]).await);

    let outcome = pipeline.flush().await;
    assert!(outcome.ok);
    assert_eq!(outcome.processed, 64 * KIB);

    pipeline.request_shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn batch_capacity_is_clamped_at_init() {
    let factory = MockFactory::healthy();
    let pipeline = Hydrant::with_factory(
        test_config().with_batch_size(32 * KIB),
        Arc::clone(&factory) as _,
    )
    .await
    .expect("init");

    // 32 KiB is below the floor; the effective capacity is 64 KiB.
    assert_eq!(pipeline.config().batch_size, 64 * KIB);
    assert!(pipeline.append(&vec![0u8; 64 * KIB]).await);

    pipeline.request_shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn init_fails_with_zero_healthy_connections() {
    let factory = MockFactory::scripted(
        std::iter::repeat(MockBehavior::connect_refused()).take(POOL_SIZE),
        None,
    );
    assert!(Hydrant::with_factory(test_config(), factory as _)
        .await
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn insecure_slots_start_dead_when_tls_required() {
    // One connection cannot negotiate TLS; it starts dead and the
    // pipeline runs on the remaining nine.
    let factory = MockFactory::scripted(
        std::iter::once(MockBehavior::insecure())
            .chain(std::iter::repeat(MockBehavior::ok()).take(POOL_SIZE - 1)),
        None,
    );
    let config = common::test_config().with_require_tls(true);
    let pipeline = Hydrant::with_factory(config, factory as _)
        .await
        .expect("init");

    let status = pipeline.status().await;
    assert_eq!(status.connections.dead, 1);
    assert_eq!(status.connections.available, POOL_SIZE - 1);

    pipeline.request_shutdown().await;
}

/// Serves a fixed prefix, then fails with an I/O error.
struct FailingReader {
    data: Vec<u8>,
    pos: usize,
}

impl AsyncRead for FailingReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.data.len() {
            let n = (self.data.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.data[pos..pos + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        } else {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "simulated input failure",
            )))
        }
    }
}

#[tokio::test(start_paused = true)]
async fn input_error_breaks_loop_and_flushes_residue() {
    let factory = MockFactory::healthy();
    let pipeline = Hydrant::with_factory(
        test_config().with_batch_size(MIB),
        Arc::clone(&factory) as _,
    )
    .await
    .expect("init");

    let reader = FailingReader {
        data: vec![0xC3u8; 10 * KIB],
        pos: 0,
    };
    pipeline.process_input(reader).await;

    // The bytes read before the failure are shipped.
    assert_eq!(factory.commits(), vec![10 * KIB]);
    let status = pipeline.status().await;
    assert_eq!(status.errors, 0);
    assert_eq!(status.batches_processed, 1);

    pipeline.request_shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn status_snapshot_shape_is_stable() {
    let factory = MockFactory::healthy();
    let pipeline = Hydrant::with_factory(test_config(), factory as _)
        .await
        .expect("init");

    let json = pipeline.status().await.to_json();
    let parsed: serde_json::Value = serde_json::from_str(&json).expect("valid json");
    for key in [
        "uptime_seconds",
        "total_bytes",
        "batches_processed",
        "errors",
        "avg_batch_time_ms",
        "connections",
        "current_batch_size",
    ] {
        assert!(parsed.get(key).is_some(), "missing key {key}");
    }
    for key in ["available", "in_use", "dead", "resets", "failures"] {
        assert!(parsed["connections"].get(key).is_some(), "missing key {key}");
    }

    pipeline.request_shutdown().await;
}
