//! Connection traits for the ingestion pipeline
//!
//! Core abstractions for the bulk-copy path:
//! - [`Connection`]: one database session carrying a prepared COPY statement
//! - [`ConnectionFactory`]: opens connections against the configured
//!   descriptor (the pool uses this for initial fill and recovery)
//! - [`ChunkStatus`]: the tri-state outcome of pushing one chunk into the
//!   copy stream
//!
//! The pool, the bulk-copy driver, and the tests all work against these
//! traits; the PostgreSQL backend lives in [`crate::postgres`].

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Config;
use crate::error::Result;

/// The statement prepared on every connection at open time. The text is
/// identical on every pool slot.
pub const COPY_STATEMENT: &str =
    "COPY original_copy(source_id, content, seq_num, checksum) FROM STDIN WITH (FORMAT binary)";

/// Outcome of pushing one chunk into the copy stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    /// The chunk was accepted; advance to the next one
    Written,
    /// The server-side buffer is full; drain, back off, and retry the
    /// same chunk
    Backpressure,
    /// The stream is broken; the flush must abort
    Error(String),
}

/// A database session used for bulk-copy ingestion.
///
/// Callers own a connection exclusively between pool acquire and release,
/// so every method takes `&mut self`. A flush drives the session through
/// `begin` → `copy_start` → `put_chunk`* → `copy_end` → `commit`, with
/// `rollback` as the best-effort escape hatch on any abort path.
#[async_trait]
pub trait Connection: Send {
    /// Whether the underlying session is still usable
    fn is_healthy(&self) -> bool;

    /// Whether the session negotiated a secure transport
    fn is_secure(&self) -> bool;

    /// Prepare the named bulk-copy statement ([`COPY_STATEMENT`])
    async fn prepare_copy(&mut self) -> Result<()>;

    /// Begin a transaction
    async fn begin(&mut self) -> Result<()>;

    /// Enter copy mode using the pre-prepared statement
    async fn copy_start(&mut self) -> Result<()>;

    /// Push one chunk into the copy stream
    async fn put_chunk(&mut self, chunk: Bytes) -> ChunkStatus;

    /// Give the session a chance to make progress on pending inbound
    /// data; called between backpressure retries
    async fn drain(&mut self);

    /// Signal end-of-copy and wait for the server to accept the data
    async fn copy_end(&mut self) -> Result<()>;

    /// Commit the transaction
    async fn commit(&mut self) -> Result<()>;

    /// Roll back the transaction, aborting any copy in progress.
    /// Best-effort; errors are not reported.
    async fn rollback(&mut self);
}

/// Factory for opening connections against the configured descriptor
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Open a new connection
    async fn connect(&self, config: &Config) -> Result<Box<dyn Connection>>;
}
