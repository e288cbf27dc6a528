//! # hydrant
//!
//! High-throughput streaming ingestion into PostgreSQL.
//!
//! Hydrant reads an opaque byte stream, accumulates it in a bounded
//! in-memory batch, and ships each batch to the database through the
//! binary COPY protocol inside a single transaction. A fixed-size pool
//! of long-lived connections carries per-slot health state with
//! exponential-backoff recovery and permanent-failure quarantine, so the
//! pipeline keeps serving batches under partial database failure.
//!
//! ## Architecture
//!
//! - [`config`] - YAML/environment configuration with bounds checking
//! - [`connection`] - backend seam: the [`Connection`] and
//!   [`ConnectionFactory`] traits and the chunk tri-state
//! - [`postgres`] - tokio-postgres backend with rustls TLS
//! - [`pool`] - slot state machine, acquire/release, backoff recovery
//! - [`batch`] - bounded accumulator and flush driver
//! - [`stats`] - running totals and the per-batch ring
//! - [`worker`] - background health/status observers
//! - [`pipeline`] - orchestration: init, producer loop, graceful
//!   shutdown, status snapshots
//!
//! ## Semantics
//!
//! Delivery is at-most-once per flushed batch: a committed batch is
//! never duplicated and a failed flush discards its unshipped tail,
//! reporting the loss through the flush outcome and the stats.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use hydrant::Hydrant;
//!
//! let pipeline = Hydrant::init(None).await?;
//! pipeline.process_input(tokio::io::stdin()).await;
//! pipeline.request_shutdown().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod batch;
pub mod cli;
pub mod config;
pub mod connection;
mod copy;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod pool;
pub mod postgres;
pub mod stats;
pub mod worker;

pub use batch::{BatchBuffer, BatchWriter, FlushOutcome};
pub use cli::Cli;
pub use config::Config;
pub use connection::{ChunkStatus, Connection, ConnectionFactory, COPY_STATEMENT};
pub use copy::{COPY_CHUNK_SIZE, MAX_CHUNK_RETRIES};
pub use error::{Error, ErrorCategory, Result};
pub use pipeline::{ConnectionStatus, Hydrant, StatusSnapshot};
pub use pool::{Pool, PoolCounts, PooledConnection, SlotState};
pub use stats::{StatsRecorder, StatsSnapshot};
