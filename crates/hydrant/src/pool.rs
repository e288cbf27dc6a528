//! Connection pool with per-slot health state and backoff recovery
//!
//! The pool is a fixed array of [`POOL_SIZE`] slots. Each slot owns at
//! most one connection and moves through a small state machine:
//!
//! ```text
//!  Available ──acquire──► InUse ──release(ok)──► Available
//!     ▲                     │
//!     │                     └─release(err), attempts < threshold──► Available
//!     │
//!   recover ok            release(err) at threshold / mark_dead
//!     │                     │
//!   Dead ◄──────────────────┘
//!     │
//!     └─recovery budget exhausted──► PermanentFailure (never re-armed)
//! ```
//!
//! All slot state, including the healthy counter, is guarded by one lock;
//! acquirers and releasers synchronize through a [`Notify`]. The reset and
//! failure counters are plain atomics so recovery never has to reach for
//! the stats lock. When the stats lock and the pool lock are both needed
//! (worker reports, status snapshots) the stats lock is taken first.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::connection::{Connection, ConnectionFactory};
use crate::error::{Error, Result};

/// Number of slots in the pool
pub const POOL_SIZE: usize = 10;

/// Errored releases a slot tolerates before it is marked dead
pub const DEAD_THRESHOLD: u32 = 5;

/// Failed recoveries a slot tolerates before permanent quarantine
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Cap on the exponent used for backoff schedules
pub const MAX_BACKOFF_ATTEMPTS: u32 = 10;

/// Base of the recovery backoff schedule, in milliseconds
pub const RECOVERY_BACKOFF_BASE_MS: u64 = 100;

/// How long one acquire attempt waits for a slot to free up
pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(1);

/// Upper bound on a slot's recorded error text
const MAX_ERROR_LEN: usize = 1024;

/// Per-slot connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Idle and believed healthy
    Available,
    /// Lent out to a caller
    InUse,
    /// Broken; eligible for recovery
    Dead,
    /// Recovery budget exhausted; quarantined for the process lifetime
    PermanentFailure,
}

struct Slot {
    /// Owned connection; absent while lent out or quarantined
    conn: Option<Box<dyn Connection>>,
    state: SlotState,
    last_used: Option<Instant>,
    failed_attempts: u32,
    recovery_attempts: u32,
    next_recovery: Option<Instant>,
    last_error: String,
}

impl Slot {
    fn available(conn: Box<dyn Connection>) -> Self {
        Self {
            conn: Some(conn),
            state: SlotState::Available,
            last_used: None,
            failed_attempts: 0,
            recovery_attempts: 0,
            next_recovery: None,
            last_error: String::new(),
        }
    }

    fn dead(error: &str) -> Self {
        let mut slot = Self {
            conn: None,
            state: SlotState::Dead,
            last_used: None,
            failed_attempts: 0,
            recovery_attempts: 0,
            next_recovery: None,
            last_error: String::new(),
        };
        slot.record_error(error);
        slot
    }

    fn record_error(&mut self, error: &str) {
        self.last_error.clear();
        let mut truncated = error;
        if truncated.len() > MAX_ERROR_LEN {
            let mut end = MAX_ERROR_LEN;
            while !truncated.is_char_boundary(end) {
                end -= 1;
            }
            truncated = &truncated[..end];
        }
        self.last_error.push_str(truncated);
    }
}

struct PoolInner {
    slots: Vec<Slot>,
    /// Count of slots not in {Dead, PermanentFailure}
    healthy: usize,
}

/// Slot counts by category, taken under the pool lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    /// Idle healthy slots
    pub available: usize,
    /// Slots currently lent out
    pub in_use: usize,
    /// Dead slots, including permanently quarantined ones
    pub dead: usize,
}

/// Fixed-size connection pool
pub struct Pool {
    inner: Mutex<PoolInner>,
    notify: Notify,
    factory: Arc<dyn ConnectionFactory>,
    config: Arc<Config>,
    shutdown: Arc<AtomicBool>,
    resets: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").finish_non_exhaustive()
    }
}

impl Pool {
    /// Open [`POOL_SIZE`] connections against the configured descriptor.
    /// Slots whose connection cannot be opened, validated, or prepared
    /// start out dead; the pool refuses to start with zero healthy slots.
    pub async fn connect(
        config: Arc<Config>,
        factory: Arc<dyn ConnectionFactory>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Arc<Self>> {
        let mut slots = Vec::with_capacity(POOL_SIZE);
        let mut healthy = 0usize;

        for idx in 0..POOL_SIZE {
            match open_connection(factory.as_ref(), &config).await {
                Ok(conn) => {
                    slots.push(Slot::available(conn));
                    healthy += 1;
                }
                Err(e) => {
                    error!(slot = idx, error = %e, "failed to open pool connection");
                    slots.push(Slot::dead(&e.to_string()));
                }
            }
        }

        if healthy == 0 {
            return Err(Error::connection("no healthy connections available"));
        }

        Ok(Arc::new(Self {
            inner: Mutex::new(PoolInner { slots, healthy }),
            notify: Notify::new(),
            factory,
            config,
            shutdown,
            resets: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }))
    }

    /// Acquire a connection.
    ///
    /// Scans for a healthy available slot, then attempts recovery of dead
    /// slots, then waits for a release with a one-second deadline. The
    /// wait is abandoned early when the shutdown flag is set; the scans
    /// still run first so the final residual flush can be served.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection> {
        let deadline = Instant::now() + ACQUIRE_TIMEOUT;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(guard) = self.try_acquire_locked(&mut inner).await {
                    return Ok(guard);
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                return Err(Error::pool_exhausted(
                    "no connection available (shutdown in progress)",
                ));
            }

            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Err(Error::pool_exhausted("no connection available"));
            }
        }
    }

    async fn try_acquire_locked(
        self: &Arc<Self>,
        inner: &mut PoolInner,
    ) -> Option<PooledConnection> {
        // First pass: available slots whose handle still reports healthy.
        for idx in 0..inner.slots.len() {
            let slot = &mut inner.slots[idx];
            if slot.state == SlotState::Available
                && matches!(&slot.conn, Some(conn) if conn.is_healthy())
            {
                if let Some(conn) = slot.conn.take() {
                    slot.state = SlotState::InUse;
                    slot.last_used = Some(Instant::now());
                    return Some(PooledConnection::new(Arc::clone(self), idx, conn));
                }
            }
        }

        // Second pass: try to recover dead slots.
        for idx in 0..inner.slots.len() {
            if inner.slots[idx].state == SlotState::Dead && self.recover_locked(inner, idx).await {
                let slot = &mut inner.slots[idx];
                if let Some(conn) = slot.conn.take() {
                    slot.state = SlotState::InUse;
                    slot.last_used = Some(Instant::now());
                    return Some(PooledConnection::new(Arc::clone(self), idx, conn));
                }
            }
        }

        None
    }

    /// Attempt to re-establish a dead slot's connection. Caller holds the
    /// pool lock. Returns true when the slot is available again.
    async fn recover_locked(&self, inner: &mut PoolInner, idx: usize) -> bool {
        let now = Instant::now();
        {
            let slot = &mut inner.slots[idx];

            if let Some(next) = slot.next_recovery {
                if now < next {
                    return false;
                }
            }

            if slot.recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
                if slot.state != SlotState::PermanentFailure {
                    error!(
                        slot = idx,
                        attempts = slot.recovery_attempts,
                        last_error = %slot.last_error,
                        "connection permanently failed, quarantining slot"
                    );
                    slot.state = SlotState::PermanentFailure;
                    slot.conn = None;
                }
                return false;
            }

            info!(
                slot = idx,
                attempt = slot.recovery_attempts + 1,
                max = MAX_RECOVERY_ATTEMPTS,
                "attempting connection recovery"
            );
            // Dispose of the broken handle before dialing a fresh one.
            slot.conn = None;
        }

        match open_connection(self.factory.as_ref(), &self.config).await {
            Ok(conn) => {
                let slot = &mut inner.slots[idx];
                slot.conn = Some(conn);
                slot.state = SlotState::Available;
                slot.failed_attempts = 0;
                slot.recovery_attempts = 0;
                slot.next_recovery = None;
                inner.healthy += 1;
                self.resets.fetch_add(1, Ordering::Relaxed);
                info!(slot = idx, "connection recovered");
                true
            }
            Err(e) => {
                let slot = &mut inner.slots[idx];
                slot.recovery_attempts += 1;
                slot.record_error(&format!("recovery failed: {e}"));
                let shift = slot.recovery_attempts.min(MAX_BACKOFF_ATTEMPTS);
                slot.next_recovery =
                    Some(now + Duration::from_millis(RECOVERY_BACKOFF_BASE_MS << shift));
                self.failures.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Return a connection to its slot. With `had_error` the slot's
    /// failure counter advances and the slot dies at [`DEAD_THRESHOLD`];
    /// a clean release resets the counter.
    async fn release_slot(
        &self,
        idx: usize,
        conn: Box<dyn Connection>,
        had_error: bool,
        error: Option<String>,
    ) {
        {
            let mut inner = self.inner.lock().await;
            {
                let slot = &mut inner.slots[idx];
                slot.conn = Some(conn);
                if had_error {
                    slot.failed_attempts += 1;
                    if let Some(message) = &error {
                        slot.record_error(message);
                    }
                } else {
                    slot.failed_attempts = 0;
                }
            }

            if had_error && inner.slots[idx].failed_attempts >= DEAD_THRESHOLD {
                let reason = inner.slots[idx].last_error.clone();
                Self::mark_dead_locked(&mut inner, idx, &reason);
            } else {
                inner.slots[idx].state = SlotState::Available;
            }
        }
        self.notify.notify_one();
    }

    /// Transition a slot to dead, returning the (possibly broken) handle
    /// to the slot for disposal at recovery time.
    async fn mark_slot_dead(&self, idx: usize, conn: Option<Box<dyn Connection>>, reason: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.slots[idx].conn = conn;
            Self::mark_dead_locked(&mut inner, idx, reason);
        }
        self.notify.notify_one();
    }

    /// Idempotent: only the first transition into dead decrements the
    /// healthy counter and logs.
    fn mark_dead_locked(inner: &mut PoolInner, idx: usize, reason: &str) {
        if matches!(
            inner.slots[idx].state,
            SlotState::Dead | SlotState::PermanentFailure
        ) {
            return;
        }
        inner.healthy -= 1;
        let slot = &mut inner.slots[idx];
        slot.state = SlotState::Dead;
        slot.record_error(reason);
        warn!(slot = idx, error = %slot.last_error, "connection marked dead");
    }

    /// Slot counts by category
    pub async fn counts(&self) -> PoolCounts {
        let inner = self.inner.lock().await;
        let mut counts = PoolCounts {
            available: 0,
            in_use: 0,
            dead: 0,
        };
        for slot in &inner.slots {
            match slot.state {
                SlotState::Available => counts.available += 1,
                SlotState::InUse => counts.in_use += 1,
                SlotState::Dead | SlotState::PermanentFailure => counts.dead += 1,
            }
        }
        counts
    }

    /// Count of slots not in {Dead, PermanentFailure}
    pub async fn healthy_count(&self) -> usize {
        self.inner.lock().await.healthy
    }

    /// Successful recoveries over the pool's lifetime
    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Failed recovery attempts over the pool's lifetime
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wake every waiter blocked in [`Pool::acquire`]; used when the
    /// shutdown flag flips
    pub fn notify_waiters(&self) {
        self.notify.notify_waiters();
    }

    /// Drop every slot's connection handle. Slot states are left as-is;
    /// the pool is only closed during teardown.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        for slot in &mut inner.slots {
            slot.conn = None;
        }
    }
}

async fn open_connection(
    factory: &dyn ConnectionFactory,
    config: &Config,
) -> Result<Box<dyn Connection>> {
    let mut conn = factory.connect(config).await?;
    if !conn.is_healthy() {
        return Err(Error::connection("connection unhealthy after open"));
    }
    if config.require_tls && !conn.is_secure() {
        return Err(Error::connection(
            "secure transport required but not negotiated",
        ));
    }
    conn.prepare_copy().await?;
    Ok(conn)
}

/// A connection borrowed from the pool.
///
/// The guard owns the connection until it is consumed by
/// [`release`](PooledConnection::release) or
/// [`mark_dead`](PooledConnection::mark_dead), which makes the
/// exactly-once release contract structural. Dropping the guard without
/// either is treated as an errored release.
pub struct PooledConnection {
    pool: Arc<Pool>,
    idx: usize,
    conn: Option<Box<dyn Connection>>,
    error: Option<String>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("idx", &self.idx)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(pool: Arc<Pool>, idx: usize, conn: Box<dyn Connection>) -> Self {
        Self {
            pool,
            idx,
            conn: Some(conn),
            error: None,
        }
    }

    /// Access the borrowed connection
    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn
            .as_mut()
            .expect("connection already released")
            .as_mut()
    }

    /// Record an error message to attach to the slot on an errored
    /// release
    pub fn note_error(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
    }

    /// Return the connection to its slot
    pub async fn release(mut self, had_error: bool) {
        if let Some(conn) = self.conn.take() {
            let error = self.error.take();
            self.pool
                .release_slot(self.idx, conn, had_error, error)
                .await;
        }
    }

    /// Return the connection and transition the slot straight to dead
    pub async fn mark_dead(mut self, reason: &str) {
        if let Some(conn) = self.conn.take() {
            self.pool.mark_slot_dead(self.idx, Some(conn), reason).await;
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            let idx = self.idx;
            let error = self.error.take();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    pool.release_slot(idx, conn, true, error).await;
                });
            }
        }
    }
}
