//! PostgreSQL backend for the ingestion pipeline
//!
//! Implements the [`Connection`] seam on top of tokio-postgres. Bulk
//! writes go through the binary COPY protocol: the prepared statement is
//! executed with `copy_in` and chunks are pushed into the returned sink.
//! Backpressure surfaces as the sink's readiness poll staying pending.
//!
//! TLS uses rustls with the webpki root store. When the configuration
//! requires a secure transport the connection is forced to
//! `sslmode=require`, so a session that cannot negotiate TLS fails at
//! connect time rather than silently downgrading.

use std::pin::Pin;
use std::task::Poll;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Sink;
use tokio_postgres::{CopyInSink, Statement};
use tracing::debug;

use crate::config::Config;
use crate::connection::{ChunkStatus, Connection, ConnectionFactory, COPY_STATEMENT};
use crate::error::{Error, Result};

/// Opens PostgreSQL connections, with or without TLS depending on the
/// configuration
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &Config) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .db_url
            .parse()
            .map_err(|e: tokio_postgres::Error| {
                Error::connection_with_source("invalid connection string", e)
            })?;
        pg_config.application_name("hydrant");

        if config.require_tls {
            pg_config.ssl_mode(tokio_postgres::config::SslMode::Require);
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(client_tls_config());
            let (client, connection) = pg_config
                .connect(tls)
                .await
                .map_err(|e| Error::connection_with_source("failed to connect", e))?;

            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(error = %e, "postgres connection task ended");
                }
            });

            Ok(Box::new(PgConnection::new(client, true)))
        } else {
            let (client, connection) = pg_config
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| Error::connection_with_source("failed to connect", e))?;

            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    debug!(error = %e, "postgres connection task ended");
                }
            });

            Ok(Box::new(PgConnection::new(client, false)))
        }
    }
}

fn client_tls_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// One PostgreSQL session with its prepared COPY statement and, during a
/// flush, the live copy sink
pub struct PgConnection {
    client: tokio_postgres::Client,
    secure: bool,
    statement: Option<Statement>,
    copy: Option<Pin<Box<CopyInSink<Bytes>>>>,
}

impl PgConnection {
    /// Wrap a connected client. `secure` records whether the session
    /// negotiated TLS.
    pub fn new(client: tokio_postgres::Client, secure: bool) -> Self {
        Self {
            client,
            secure,
            statement: None,
            copy: None,
        }
    }
}

#[async_trait]
impl Connection for PgConnection {
    fn is_healthy(&self) -> bool {
        !self.client.is_closed()
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    async fn prepare_copy(&mut self) -> Result<()> {
        let statement = self
            .client
            .prepare(COPY_STATEMENT)
            .await
            .map_err(|e| Error::connection_with_source("failed to prepare copy statement", e))?;
        self.statement = Some(statement);
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| Error::transaction_with_source("failed to begin transaction", e))
    }

    async fn copy_start(&mut self) -> Result<()> {
        let statement = self
            .statement
            .as_ref()
            .ok_or_else(|| Error::copy("copy statement not prepared"))?;
        let sink = self
            .client
            .copy_in::<_, Bytes>(statement)
            .await
            .map_err(|e| Error::copy_with_source("failed to start copy", e))?;
        self.copy = Some(Box::pin(sink));
        Ok(())
    }

    async fn put_chunk(&mut self, chunk: Bytes) -> ChunkStatus {
        let Some(sink) = self.copy.as_mut() else {
            return ChunkStatus::Error("no copy in progress".into());
        };

        // A pending readiness poll is the protocol's buffer-full signal;
        // the caller drains, backs off, and retries the same chunk.
        let ready = std::future::poll_fn(|cx| Poll::Ready(sink.as_mut().poll_ready(cx))).await;
        match ready {
            Poll::Pending => ChunkStatus::Backpressure,
            Poll::Ready(Err(e)) => ChunkStatus::Error(e.to_string()),
            Poll::Ready(Ok(())) => match sink.as_mut().start_send(chunk) {
                Ok(()) => ChunkStatus::Written,
                Err(e) => ChunkStatus::Error(e.to_string()),
            },
        }
    }

    async fn drain(&mut self) {
        // Inbound traffic is handled by the spawned connection task;
        // yielding lets it run before the next readiness poll.
        tokio::task::yield_now().await;
    }

    async fn copy_end(&mut self) -> Result<()> {
        let Some(mut sink) = self.copy.take() else {
            return Err(Error::copy("no copy in progress"));
        };
        sink.as_mut()
            .finish()
            .await
            .map(|_| ())
            .map_err(|e| Error::copy_with_source("failed to finish copy", e))
    }

    async fn commit(&mut self) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| Error::transaction_with_source("failed to commit transaction", e))
    }

    async fn rollback(&mut self) {
        // Dropping an unfinished sink aborts the COPY on the wire.
        self.copy = None;
        if let Err(e) = self.client.batch_execute("ROLLBACK").await {
            debug!(error = %e, "rollback failed");
        }
    }
}
