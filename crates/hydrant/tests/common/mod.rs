//! Scripted in-memory backend for exercising the pool, the flush
//! driver, and the pipeline without a database.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use hydrant::{ChunkStatus, Config, Connection, ConnectionFactory, Error, Result};

/// How one scripted connection behaves
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub secure: bool,
    pub connect_fails: bool,
    pub prepare_fails: bool,
    pub begin_fails: bool,
    pub copy_start_fails: bool,
    /// Fail the chunk that would push the copy past this many bytes
    pub error_after_bytes: Option<usize>,
    /// Report this many backpressure events before accepting anything
    pub backpressure_events: usize,
    pub commit_fails: bool,
}

impl MockBehavior {
    pub fn ok() -> Self {
        Self {
            secure: true,
            connect_fails: false,
            prepare_fails: false,
            begin_fails: false,
            copy_start_fails: false,
            error_after_bytes: None,
            backpressure_events: 0,
            commit_fails: false,
        }
    }

    pub fn connect_refused() -> Self {
        Self {
            connect_fails: true,
            ..Self::ok()
        }
    }

    pub fn insecure() -> Self {
        Self {
            secure: false,
            ..Self::ok()
        }
    }

    pub fn begin_fails() -> Self {
        Self {
            begin_fails: true,
            ..Self::ok()
        }
    }

    pub fn error_after(bytes: usize) -> Self {
        Self {
            error_after_bytes: Some(bytes),
            ..Self::ok()
        }
    }

    pub fn backpressure(events: usize) -> Self {
        Self {
            backpressure_events: events,
            ..Self::ok()
        }
    }

    pub fn commit_fails() -> Self {
        Self {
            commit_fails: true,
            ..Self::ok()
        }
    }
}

/// Factory handing out scripted connections in order. When the script
/// runs dry it falls back to `default`, or refuses to connect when no
/// default is set.
pub struct MockFactory {
    scripts: Mutex<VecDeque<MockBehavior>>,
    default: Option<MockBehavior>,
    /// Byte counts of every committed transaction, across connections
    pub committed: Arc<Mutex<Vec<usize>>>,
}

impl MockFactory {
    /// Every connection succeeds and commits
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            default: Some(MockBehavior::ok()),
            committed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Scripted connections, then `default` (None refuses reconnects)
    pub fn scripted(
        scripts: impl IntoIterator<Item = MockBehavior>,
        default: Option<MockBehavior>,
    ) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            default,
            committed: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Sum of all committed bytes
    pub fn committed_total(&self) -> usize {
        self.committed.lock().unwrap().iter().sum()
    }

    /// Committed byte counts in commit order
    pub fn commits(&self) -> Vec<usize> {
        self.committed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, _config: &Config) -> Result<Box<dyn Connection>> {
        let behavior = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.pop_front() {
                Some(behavior) => behavior,
                None => match &self.default {
                    Some(behavior) => behavior.clone(),
                    None => return Err(Error::connection("connect refused")),
                },
            }
        };

        if behavior.connect_fails {
            return Err(Error::connection("connect refused"));
        }

        Ok(Box::new(MockConnection {
            behavior,
            committed: Arc::clone(&self.committed),
            copied: 0,
            pending: 0,
            backpressure_left: 0,
            copying: false,
        }))
    }
}

pub struct MockConnection {
    behavior: MockBehavior,
    committed: Arc<Mutex<Vec<usize>>>,
    /// Bytes accepted in the current copy
    copied: usize,
    /// Bytes awaiting commit
    pending: usize,
    backpressure_left: usize,
    copying: bool,
}

#[async_trait]
impl Connection for MockConnection {
    fn is_healthy(&self) -> bool {
        true
    }

    fn is_secure(&self) -> bool {
        self.behavior.secure
    }

    async fn prepare_copy(&mut self) -> Result<()> {
        if self.behavior.prepare_fails {
            return Err(Error::copy("simulated prepare failure"));
        }
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        if self.behavior.begin_fails {
            return Err(Error::transaction("simulated begin failure"));
        }
        Ok(())
    }

    async fn copy_start(&mut self) -> Result<()> {
        if self.behavior.copy_start_fails {
            return Err(Error::copy("simulated copy-start failure"));
        }
        self.copying = true;
        self.copied = 0;
        self.pending = 0;
        self.backpressure_left = self.behavior.backpressure_events;
        Ok(())
    }

    async fn put_chunk(&mut self, chunk: Bytes) -> ChunkStatus {
        if !self.copying {
            return ChunkStatus::Error("no copy in progress".into());
        }
        if self.backpressure_left > 0 {
            self.backpressure_left -= 1;
            return ChunkStatus::Backpressure;
        }
        if let Some(limit) = self.behavior.error_after_bytes {
            if self.copied + chunk.len() > limit {
                return ChunkStatus::Error("simulated write failure".into());
            }
        }
        self.copied += chunk.len();
        self.pending += chunk.len();
        ChunkStatus::Written
    }

    async fn drain(&mut self) {}

    async fn copy_end(&mut self) -> Result<()> {
        self.copying = false;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.behavior.commit_fails {
            return Err(Error::transaction("simulated commit failure"));
        }
        self.committed.lock().unwrap().push(self.pending);
        self.pending = 0;
        Ok(())
    }

    async fn rollback(&mut self) {
        self.copying = false;
        self.pending = 0;
    }
}

/// Configuration pointing at nothing; TLS checks are exercised
/// explicitly where needed.
pub fn test_config() -> Config {
    Config::new("postgres://localhost/hydrant_test").with_require_tls(false)
}
