//! Bounded, thread-safe pooling of repository connections
//!
//! [`RepositoryConnectionPool`] brokers between callers that need a
//! connection and a [`ConnectionFactory`] that can open one. It keeps a core
//! set of connections alive, caps the total at a maximum, optionally pings
//! connections before handing them out, and supports both orderly and
//! immediate shutdown with termination-await semantics.
//!
//! All size and lifecycle bookkeeping is guarded by a single mutex that is
//! never held across an await; waiting for a released connection happens on
//! a semaphore outside that lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use async_trait::async_trait;

use crate::connection::{CommandResult, ExecutionContext, RepositoryCommand, RepositoryConnection};
use crate::error::{Error, Result};

/// A factory used by the pool to open new connections.
///
/// Every [`crate::RepositorySource`] is usable as a factory; the pool stays
/// decoupled from backend specifics through this trait.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Name of the source that owns the pool; never empty.
    fn source_name(&self) -> &str;

    /// Open a new connection to the underlying source.
    async fn create_connection(&self) -> Result<Arc<dyn RepositoryConnection>>;
}

/// Core pool size for default-configured pools.
pub const DEFAULT_CORE_POOL_SIZE: usize = 1;

/// Maximum pool size for default-configured pools.
pub const DEFAULT_MAXIMUM_POOL_SIZE: usize = 10;

/// Keep-alive time for excess idle connections in default-configured pools.
pub const DEFAULT_KEEP_ALIVE_TIME: Duration = Duration::from_secs(30);

/// Time a ping may take before the connection is considered invalid.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(100);

/// Consecutive invalid connections tolerated before giving up.
pub const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 10;

/// Pool sizing and validation configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections kept alive even when idle.
    pub core_pool_size: usize,
    /// Hard cap on total connections, in use plus idle.
    pub maximum_pool_size: usize,
    /// How long excess idle connections may linger before a drain closes
    /// them. Informational; the pool runs no reaper task.
    pub keep_alive_time: Duration,
    /// Ping each connection before handing it to a caller.
    pub validate_connection_before_use: bool,
    /// Deadline for the validation ping.
    pub ping_timeout: Duration,
    /// Consecutive failed validation attempts before `get_connection` errors.
    pub max_failed_attempts_before_error: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            core_pool_size: DEFAULT_CORE_POOL_SIZE,
            maximum_pool_size: DEFAULT_MAXIMUM_POOL_SIZE,
            keep_alive_time: DEFAULT_KEEP_ALIVE_TIME,
            validate_connection_before_use: false,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            max_failed_attempts_before_error: DEFAULT_MAX_FAILED_ATTEMPTS,
        }
    }
}

/// Lifecycle state of a pool.
///
/// The state only ever moves forward: `Running` to `ShutDown` or `Stop`,
/// and from either of those to `Terminated` once the last connection is
/// gone. `Stop` never reverts to `ShutDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Accepting and handing out connections.
    Running,
    /// Orderly shutdown: in-use connections finish normally, idle ones are
    /// closed, nothing new is created.
    ShutDown,
    /// Immediate shutdown: in-use connections were force-closed.
    Stop,
    /// No connections remain and none will be created.
    Terminated,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total connections, in use plus idle.
    pub pool_size: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Idle connections ready for reuse.
    pub available: usize,
    /// Connections opened over the pool's lifetime.
    pub total_connections_created: u64,
    /// Successful checkouts over the pool's lifetime.
    pub total_connections_used: u64,
}

/// An idle connection waiting in the pool.
struct IdleConnection {
    conn: Arc<dyn RepositoryConnection>,
    created: Instant,
    last_used: Instant,
}

/// Bookkeeping for a connection currently checked out.
///
/// The pool keeps the real connection here; the caller's
/// [`PooledConnection`] holds the checkout id and a shared revocation flag,
/// so a force-close by the pool invalidates the caller's handle.
struct CheckedOutConnection {
    conn: Arc<dyn RepositoryConnection>,
    created: Instant,
    revoked: Arc<AtomicBool>,
}

/// Everything guarded by the main lock.
struct PoolState {
    run_state: RunState,
    pool_size: usize,
    core_pool_size: usize,
    maximum_pool_size: usize,
    available: VecDeque<IdleConnection>,
    in_use: HashMap<u64, CheckedOutConnection>,
    next_checkout_id: u64,
}

impl PoolState {
    /// Move a connection into the in-use table under a fresh checkout id.
    fn register_checkout(
        &mut self,
        conn: Arc<dyn RepositoryConnection>,
        created: Instant,
    ) -> (u64, Arc<AtomicBool>) {
        let id = self.next_checkout_id;
        self.next_checkout_id += 1;
        let revoked = Arc::new(AtomicBool::new(false));
        self.in_use.insert(
            id,
            CheckedOutConnection {
                conn,
                created,
                revoked: Arc::clone(&revoked),
            },
        );
        (id, revoked)
    }
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
    /// Wakes callers waiting for a released connection or a freed slot.
    /// Closed on shutdown so blocked callers observe the state change.
    available_signal: Semaphore,
    /// Wakes callers blocked in `await_termination`.
    termination: Notify,
    validate_connection_before_use: AtomicBool,
    ping_timeout_nanos: AtomicU64,
    keep_alive_nanos: AtomicU64,
    max_failed_attempts: AtomicU32,
    total_connections_created: AtomicU64,
    total_connections_used: AtomicU64,
}

impl PoolInner {
    fn source_name(&self) -> &str {
        self.factory.source_name()
    }

    /// Remove a checkout from the in-use table and decide its fate.
    /// Returns the connection when it must be physically closed; `None`
    /// when it re-entered the available set (or was already gone).
    fn release_to_pool(&self, id: u64) -> Option<Arc<dyn RepositoryConnection>> {
        let mut state = self.state.lock();
        let entry = state.in_use.remove(&id)?;
        if state.run_state != RunState::Running
            || state.pool_size > state.maximum_pool_size
            || state.available.len() >= state.maximum_pool_size
        {
            return Some(entry.conn);
        }
        state.available.push_back(IdleConnection {
            conn: entry.conn,
            created: entry.created,
            last_used: Instant::now(),
        });
        drop(state);
        if !self.available_signal.is_closed() {
            self.available_signal.add_permits(1);
        }
        None
    }

    /// Physically close a connection that has left the pool, then fix the
    /// pool size. Close errors are logged and swallowed.
    async fn close_connection(&self, conn: Arc<dyn RepositoryConnection>) {
        log::debug!("Closing repository connection to {}", self.source_name());
        if let Err(err) = conn.close().await {
            log::trace!(
                "Error closing repository connection to {}: {}",
                self.source_name(),
                err
            );
        }
        self.finish_close();
    }

    /// Bookkeeping after a connection leaves the pool for good.
    fn finish_close(&self) {
        let mut state = self.state.lock();
        state.pool_size = state.pool_size.saturating_sub(1);
        self.maybe_terminate(&mut state);
        drop(state);
        // A freed slot may let a blocked caller create a new connection.
        if !self.available_signal.is_closed() {
            self.available_signal.add_permits(1);
        }
    }

    /// Transition to `Terminated` once a shutting-down pool is empty.
    fn maybe_terminate(&self, state: &mut PoolState) {
        if state.pool_size == 0
            && matches!(state.run_state, RunState::ShutDown | RunState::Stop)
        {
            log::trace!(
                "Signalling termination of repository connection pool for {}",
                self.source_name()
            );
            state.run_state = RunState::Terminated;
            self.termination.notify_waiters();
            log::debug!(
                "Terminated repository connection pool for {}",
                self.source_name()
            );
        }
    }

    /// Drop-path return: bookkeeping runs synchronously; a physical close,
    /// if required, is spawned onto the current runtime.
    fn return_on_drop(inner: &Arc<Self>, id: u64) {
        let Some(conn) = inner.release_to_pool(id) else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = Arc::clone(inner);
                runtime.spawn(async move {
                    inner.close_connection(conn).await;
                });
            }
            Err(_) => {
                log::warn!(
                    "Pooled connection to {} dropped outside an async runtime; \
                     the underlying connection cannot be closed cleanly",
                    inner.source_name()
                );
                drop(conn);
                inner.finish_close();
            }
        }
    }
}

enum Checkout {
    Reuse(PooledConnection),
    Create,
    Wait,
}

/// A managed pool of connections to a single repository source.
///
/// Cloning the pool is cheap and yields another handle to the same pool.
#[derive(Clone)]
pub struct RepositoryConnectionPool {
    inner: Arc<PoolInner>,
}

impl RepositoryConnectionPool {
    /// Create a pool with the default configuration.
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        Self::with_config(factory, PoolConfig::default())
    }

    /// Create a pool with explicit sizing and otherwise default settings.
    pub fn with_sizing(
        factory: Arc<dyn ConnectionFactory>,
        core_pool_size: usize,
        maximum_pool_size: usize,
        keep_alive_time: Duration,
    ) -> Result<Self> {
        Self::with_config(
            factory,
            PoolConfig {
                core_pool_size,
                maximum_pool_size,
                keep_alive_time,
                ..PoolConfig::default()
            },
        )
    }

    /// Create a pool with the supplied configuration.
    ///
    /// Fails with [`Error::Config`] if `maximum_pool_size` is zero or
    /// smaller than `core_pool_size`.
    pub fn with_config(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Result<Self> {
        if config.maximum_pool_size == 0 {
            return Err(Error::Config(
                "maximum pool size must be positive".to_string(),
            ));
        }
        if config.maximum_pool_size < config.core_pool_size {
            return Err(Error::Config(
                "maximum pool size may not be smaller than the core pool size".to_string(),
            ));
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory,
                state: Mutex::new(PoolState {
                    run_state: RunState::Running,
                    pool_size: 0,
                    core_pool_size: config.core_pool_size,
                    maximum_pool_size: config.maximum_pool_size,
                    available: VecDeque::new(),
                    in_use: HashMap::new(),
                    next_checkout_id: 0,
                }),
                available_signal: Semaphore::new(0),
                termination: Notify::new(),
                validate_connection_before_use: AtomicBool::new(
                    config.validate_connection_before_use,
                ),
                ping_timeout_nanos: AtomicU64::new(config.ping_timeout.as_nanos() as u64),
                keep_alive_nanos: AtomicU64::new(config.keep_alive_time.as_nanos() as u64),
                max_failed_attempts: AtomicU32::new(config.max_failed_attempts_before_error),
                total_connections_created: AtomicU64::new(0),
                total_connections_used: AtomicU64::new(0),
            }),
        })
    }

    /// Name of the source this pool serves, for diagnostics.
    pub fn source_name(&self) -> &str {
        self.inner.source_name()
    }

    // -------------------------------------------------
    // Tunables
    // -------------------------------------------------

    /// Whether connections are pinged before being handed out.
    pub fn validate_connection_before_use(&self) -> bool {
        self.inner.validate_connection_before_use.load(Ordering::Relaxed)
    }

    /// Enable or disable the pre-checkout ping.
    pub fn set_validate_connection_before_use(&self, validate: bool) {
        self.inner
            .validate_connection_before_use
            .store(validate, Ordering::Relaxed);
    }

    /// Deadline applied to the validation ping.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_nanos(self.inner.ping_timeout_nanos.load(Ordering::Relaxed))
    }

    /// Set the deadline applied to the validation ping.
    pub fn set_ping_timeout(&self, timeout: Duration) {
        self.inner
            .ping_timeout_nanos
            .store(timeout.as_nanos() as u64, Ordering::Relaxed);
    }

    /// How long excess idle connections may linger. Informational.
    pub fn keep_alive_time(&self) -> Duration {
        Duration::from_nanos(self.inner.keep_alive_nanos.load(Ordering::Relaxed))
    }

    /// Set the keep-alive time for excess idle connections.
    pub fn set_keep_alive_time(&self, keep_alive: Duration) {
        self.inner
            .keep_alive_nanos
            .store(keep_alive.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Consecutive invalid connections tolerated before `get_connection`
    /// gives up.
    pub fn max_failed_attempts_before_error(&self) -> u32 {
        self.inner.max_failed_attempts.load(Ordering::Relaxed)
    }

    /// Set the invalid-connection tolerance. Values below one are treated
    /// as one attempt.
    pub fn set_max_failed_attempts_before_error(&self, attempts: u32) {
        self.inner.max_failed_attempts.store(attempts, Ordering::Relaxed);
    }

    /// The configured core pool size.
    pub fn core_pool_size(&self) -> usize {
        self.inner.state.lock().core_pool_size
    }

    /// The configured maximum pool size.
    pub fn maximum_pool_size(&self) -> usize {
        self.inner.state.lock().maximum_pool_size
    }

    /// Change the core pool size.
    ///
    /// Growing provisions new idle connections immediately; shrinking
    /// closes excess idle connections. In-use connections are never touched.
    pub async fn set_core_pool_size(&self, core_pool_size: usize) -> Result<()> {
        let excess = {
            let mut state = self.inner.state.lock();
            if core_pool_size > state.maximum_pool_size {
                return Err(Error::Config(
                    "core pool size may not be larger than the maximum pool size".to_string(),
                ));
            }
            let previous = state.core_pool_size;
            state.core_pool_size = core_pool_size;
            if core_pool_size > previous {
                None
            } else {
                let over_core = state.pool_size.saturating_sub(core_pool_size);
                Some((previous - core_pool_size).min(over_core))
            }
        };
        match excess {
            None => {
                self.add_idle_connections(usize::MAX).await?;
            }
            Some(extra) if extra > 0 => {
                self.drain_unused_connections(extra).await;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Change the maximum pool size.
    ///
    /// Shrinking closes idle connections until the total fits under the new
    /// cap; connections in use are closed as they are returned instead.
    pub async fn set_maximum_pool_size(&self, maximum_pool_size: usize) -> Result<()> {
        if maximum_pool_size == 0 {
            return Err(Error::Config(
                "maximum pool size must be positive".to_string(),
            ));
        }
        let excess = {
            let mut state = self.inner.state.lock();
            if maximum_pool_size < state.core_pool_size {
                return Err(Error::Config(
                    "maximum pool size may not be smaller than the core pool size".to_string(),
                ));
            }
            state.maximum_pool_size = maximum_pool_size;
            state.pool_size.saturating_sub(maximum_pool_size)
        };
        if excess > 0 {
            self.drain_unused_connections(excess).await;
        }
        Ok(())
    }

    // -------------------------------------------------
    // Statistics
    // -------------------------------------------------

    /// Total connections currently held by the pool, in use plus idle.
    pub fn pool_size(&self) -> usize {
        self.inner.state.lock().pool_size
    }

    /// Connections currently checked out.
    pub fn in_use_count(&self) -> usize {
        self.inner.state.lock().in_use.len()
    }

    /// Connections opened by this pool over its lifetime.
    pub fn total_connections_created(&self) -> u64 {
        self.inner.total_connections_created.load(Ordering::Relaxed)
    }

    /// Successful checkouts over this pool's lifetime.
    pub fn total_connections_used(&self) -> u64 {
        self.inner.total_connections_used.load(Ordering::Relaxed)
    }

    /// A consistent snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            pool_size: state.pool_size,
            in_use: state.in_use.len(),
            available: state.available.len(),
            total_connections_created: self.inner.total_connections_created.load(Ordering::Relaxed),
            total_connections_used: self.inner.total_connections_used.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------
    // Lifecycle
    // -------------------------------------------------

    /// Whether the pool is running and able to provide connections.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().run_state == RunState::Running
    }

    /// Whether shutdown has been initiated (orderly or immediate).
    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().run_state != RunState::Running
    }

    /// Whether an immediate shutdown is still completing.
    pub fn is_terminating(&self) -> bool {
        self.inner.state.lock().run_state == RunState::Stop
    }

    /// Whether the pool holds no connections and will create no more.
    pub fn is_terminated(&self) -> bool {
        self.inner.state.lock().run_state == RunState::Terminated
    }

    /// The current lifecycle state.
    pub fn run_state(&self) -> RunState {
        self.inner.state.lock().run_state
    }

    /// Initiate an orderly shutdown.
    ///
    /// Idle connections are closed immediately; connections in use finish
    /// normally and are closed as they are returned. Has no additional
    /// effect if shutdown has already begun, and never reverts an immediate
    /// shutdown.
    pub async fn shutdown(&self) {
        log::debug!(
            "Shutting down repository connection pool for {}",
            self.source_name()
        );
        {
            let mut state = self.inner.state.lock();
            if state.run_state == RunState::Running {
                state.run_state = RunState::ShutDown;
            }
        }
        // Wake callers blocked waiting for a connection; they observe the
        // state change and fail instead of waiting forever.
        self.inner.available_signal.close();
        let idle = self.inner.state.lock().available.len();
        self.drain_unused_connections(idle).await;
        let mut state = self.inner.state.lock();
        self.inner.maybe_terminate(&mut state);
    }

    /// Shut down immediately, force-closing connections that are in use.
    ///
    /// Every in-use connection is closed synchronously before this returns;
    /// close errors are swallowed so that all of them are attempted.
    /// Callers still holding handles to force-closed connections get
    /// [`Error::ConnectionClosed`] from any further operation.
    pub async fn shutdown_now(&self) {
        log::debug!(
            "Shutting down (immediately) repository connection pool for {}",
            self.source_name()
        );
        {
            let mut state = self.inner.state.lock();
            if state.run_state != RunState::Terminated {
                state.run_state = RunState::Stop;
            }
        }
        self.inner.available_signal.close();
        let idle = self.inner.state.lock().available.len();
        self.drain_unused_connections(idle).await;
        let forced: Vec<CheckedOutConnection> = {
            let mut state = self.inner.state.lock();
            let forced: Vec<_> = state.in_use.drain().map(|(_, entry)| entry).collect();
            for entry in &forced {
                entry.revoked.store(true, Ordering::Release);
            }
            state.pool_size -= forced.len();
            forced
        };
        for entry in forced {
            log::trace!("Closing repository connection to {}", self.source_name());
            if let Err(err) = entry.conn.close().await {
                log::trace!(
                    "Error closing repository connection to {}: {}",
                    self.source_name(),
                    err
                );
            }
        }
        let mut state = self.inner.state.lock();
        self.inner.maybe_terminate(&mut state);
    }

    /// Wait until the pool terminates or the timeout elapses.
    ///
    /// Returns `true` if termination was observed within the timeout.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register with the notifier before checking the state, so a
            // termination landing in between still wakes this waiter.
            let mut notified = std::pin::pin!(self.inner.termination.notified());
            notified.as_mut().enable();
            if self.inner.state.lock().run_state == RunState::Terminated {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inner.state.lock().run_state == RunState::Terminated;
            }
        }
    }

    // -------------------------------------------------
    // Connection management
    // -------------------------------------------------

    /// Check out a connection.
    ///
    /// Reuses an idle connection when one exists, opens a new one while the
    /// pool is under its limits, or waits until a connection is released.
    /// With validation enabled, invalid connections are discarded and the
    /// checkout retried up to the configured attempt limit.
    pub async fn get_connection(&self) -> Result<PooledConnection> {
        let attempts_allowed = self.max_failed_attempts_before_error().max(1);
        for _ in 0..attempts_allowed {
            let candidate = self.checkout().await?;
            if self.validate_connection_before_use() {
                match self.validate(candidate).await {
                    Some(connection) => {
                        self.inner
                            .total_connections_used
                            .fetch_add(1, Ordering::Relaxed);
                        return Ok(connection);
                    }
                    None => continue,
                }
            }
            self.inner
                .total_connections_used
                .fetch_add(1, Ordering::Relaxed);
            return Ok(candidate);
        }
        Err(Error::PoolExhausted {
            source: self.source_name().to_string(),
            attempts: attempts_allowed,
        })
    }

    /// One pass of the checkout algorithm, without validation.
    async fn checkout(&self) -> Result<PooledConnection> {
        loop {
            let action = {
                let mut state = self.inner.state.lock();
                if state.run_state != RunState::Running {
                    return Err(Error::PoolNotRunning(self.source_name().to_string()));
                }
                if state.pool_size < state.core_pool_size {
                    // Core connections are provisioned eagerly, never
                    // satisfied from the idle set.
                    state.pool_size += 1;
                    Checkout::Create
                } else if let Some(idle) = state.available.pop_front() {
                    let created = idle.created;
                    let conn = idle.conn;
                    let (id, revoked) = state.register_checkout(Arc::clone(&conn), created);
                    Checkout::Reuse(PooledConnection {
                        pool: Arc::clone(&self.inner),
                        conn,
                        id,
                        revoked,
                        closed: false,
                        created,
                    })
                } else if state.pool_size < state.maximum_pool_size {
                    state.pool_size += 1;
                    Checkout::Create
                } else {
                    Checkout::Wait
                }
            };
            match action {
                Checkout::Reuse(connection) => {
                    // Keep the permit count tracking the idle set. If a
                    // waiter consumed this permit first, it re-checks under
                    // the lock and waits again, so skipping it is safe.
                    if let Ok(permit) = self.inner.available_signal.try_acquire() {
                        permit.forget();
                    }
                    return Ok(connection);
                }
                Checkout::Create => return self.create_checked_out().await,
                Checkout::Wait => {
                    log::trace!(
                        "Waiting for a repository connection from pool {}",
                        self.source_name()
                    );
                    match self.inner.available_signal.acquire().await {
                        Ok(permit) => permit.forget(),
                        Err(_) => {
                            return Err(Error::PoolNotRunning(self.source_name().to_string()))
                        }
                    }
                }
            }
        }
    }

    /// Open a new connection for a checkout whose slot is already reserved.
    async fn create_checked_out(&self) -> Result<PooledConnection> {
        match self.inner.factory.create_connection().await {
            Ok(conn) => {
                self.inner
                    .total_connections_created
                    .fetch_add(1, Ordering::Relaxed);
                let handle = {
                    let mut state = self.inner.state.lock();
                    if state.run_state != RunState::Running {
                        None
                    } else {
                        let created = Instant::now();
                        let (id, revoked) = state.register_checkout(Arc::clone(&conn), created);
                        Some(PooledConnection {
                            pool: Arc::clone(&self.inner),
                            conn: Arc::clone(&conn),
                            id,
                            revoked,
                            closed: false,
                            created,
                        })
                    }
                };
                match handle {
                    Some(connection) => {
                        log::trace!("Opened new repository connection to {}", self.source_name());
                        Ok(connection)
                    }
                    None => {
                        // The pool began shutting down while the connection
                        // was being opened.
                        self.inner.close_connection(conn).await;
                        Err(Error::PoolNotRunning(self.source_name().to_string()))
                    }
                }
            }
            Err(err) => {
                // Roll back the reserved slot.
                self.inner.finish_close();
                Err(err)
            }
        }
    }

    /// Ping a candidate, returning it if healthy and discarding it
    /// otherwise. Runs entirely outside the main lock.
    async fn validate(&self, candidate: PooledConnection) -> Option<PooledConnection> {
        let timeout = self.ping_timeout();
        match tokio::time::timeout(timeout, candidate.conn.ping(timeout)).await {
            Ok(Ok(true)) => return Some(candidate),
            Ok(Ok(false)) => log::trace!(
                "Repository connection to {} failed its ping and will be discarded",
                self.source_name()
            ),
            Ok(Err(err)) => log::trace!(
                "Error pinging repository connection to {}: {}",
                self.source_name(),
                err
            ),
            Err(_) => log::trace!(
                "Ping of repository connection to {} timed out",
                self.source_name()
            ),
        }
        self.discard(candidate).await;
        None
    }

    /// Permanently remove an invalid checked-out connection.
    async fn discard(&self, mut candidate: PooledConnection) {
        candidate.closed = true;
        if candidate.revoked.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = {
            let mut state = self.inner.state.lock();
            state.in_use.remove(&candidate.id).map(|entry| entry.conn)
        };
        if let Some(conn) = conn {
            self.inner.close_connection(conn).await;
        }
    }

    /// Eagerly open one idle connection if the pool is under its core size.
    ///
    /// Returns `false` once all core connections have been started.
    pub async fn prestart_core_connection(&self) -> Result<bool> {
        Ok(self.add_idle_connections(1).await? == 1)
    }

    /// Eagerly open idle connections until the pool reaches its core size.
    ///
    /// Returns the number of connections opened.
    pub async fn prestart_all_core_connections(&self) -> Result<usize> {
        self.add_idle_connections(usize::MAX).await
    }

    /// Open up to `limit` idle connections while under the core size.
    async fn add_idle_connections(&self, limit: usize) -> Result<usize> {
        let mut added = 0;
        while added < limit {
            {
                let mut state = self.inner.state.lock();
                if state.run_state != RunState::Running
                    || state.pool_size >= state.core_pool_size
                {
                    break;
                }
                state.pool_size += 1;
            }
            match self.inner.factory.create_connection().await {
                Ok(conn) => {
                    self.inner
                        .total_connections_created
                        .fetch_add(1, Ordering::Relaxed);
                    let parked = {
                        let mut state = self.inner.state.lock();
                        if state.run_state == RunState::Running {
                            let now = Instant::now();
                            state.available.push_back(IdleConnection {
                                conn: Arc::clone(&conn),
                                created: now,
                                last_used: now,
                            });
                            true
                        } else {
                            false
                        }
                    };
                    if parked {
                        if !self.inner.available_signal.is_closed() {
                            self.inner.available_signal.add_permits(1);
                        }
                        added += 1;
                    } else {
                        self.inner.close_connection(conn).await;
                        break;
                    }
                }
                Err(err) => {
                    self.inner.finish_close();
                    return Err(err);
                }
            }
        }
        if added > 0 {
            log::trace!(
                "Added {} connection(s) to {} in undersized pool",
                added,
                self.source_name()
            );
        }
        Ok(added)
    }

    /// Close up to `count` idle connections, oldest first.
    async fn drain_unused_connections(&self, count: usize) -> usize {
        if count == 0 {
            return 0;
        }
        log::trace!(
            "Draining up to {} unused repository connections to {}",
            count,
            self.source_name()
        );
        let drained: Vec<IdleConnection> = {
            let mut state = self.inner.state.lock();
            let take = count.min(state.available.len());
            let drained: Vec<_> = state.available.drain(..take).collect();
            state.pool_size -= drained.len();
            self.inner.maybe_terminate(&mut state);
            drained
        };
        for _ in 0..drained.len() {
            if let Ok(permit) = self.inner.available_signal.try_acquire() {
                permit.forget();
            }
        }
        let mut closed = 0;
        for idle in drained {
            log::trace!(
                "Closing repository connection to {} after {:?} idle",
                self.source_name(),
                idle.last_used.elapsed()
            );
            if let Err(err) = idle.conn.close().await {
                log::trace!(
                    "Error closing repository connection to {}: {}",
                    self.source_name(),
                    err
                );
            }
            closed += 1;
        }
        log::trace!("Drained {} unused connections", closed);
        closed
    }
}

impl fmt::Debug for RepositoryConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("RepositoryConnectionPool")
            .field("source", &self.source_name())
            .field("run_state", &self.run_state())
            .field("stats", &stats)
            .finish()
    }
}

/// A connection checked out from a [`RepositoryConnectionPool`].
///
/// Dropping the handle returns the connection to the pool; calling
/// [`PooledConnection::close`] does the same but lets the caller await the
/// physical close when the pool decides to discard the connection. After
/// either, every operation except `close` fails with
/// [`Error::ConnectionClosed`]. A second `close` is a no-op.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Arc<dyn RepositoryConnection>,
    id: u64,
    revoked: Arc<AtomicBool>,
    closed: bool,
    created: Instant,
}

impl PooledConnection {
    /// Name of the source this connection belongs to.
    pub fn source_name(&self) -> &str {
        self.conn.source_name()
    }

    /// When the underlying connection was opened.
    pub fn created_at(&self) -> Instant {
        self.created
    }

    /// Whether this handle has been closed or revoked by the pool.
    pub fn is_closed(&self) -> bool {
        self.closed || self.revoked.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        Ok(())
    }

    /// Liveness check against the underlying connection.
    pub async fn ping(&self, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        self.conn.ping(timeout).await
    }

    /// Execute a command against the underlying connection.
    pub async fn execute(
        &self,
        context: &ExecutionContext,
        command: &RepositoryCommand,
    ) -> Result<CommandResult> {
        self.ensure_open()?;
        self.conn.execute(context, command).await
    }

    /// Return the connection to the pool.
    ///
    /// The pool recycles it for the next caller or, if the pool is shutting
    /// down or over its limits, physically closes it. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.revoked.swap(true, Ordering::AcqRel) {
            // Already force-closed by the pool.
            return Ok(());
        }
        if let Some(conn) = self.pool.release_to_pool(self.id) {
            self.pool.close_connection(conn).await;
        }
        Ok(())
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("source", &self.conn.source_name())
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.revoked.swap(true, Ordering::AcqRel) {
            return;
        }
        PoolInner::return_on_drop(&self.pool, self.id);
    }
}
