//! Lifecycle and sizing scenarios for the repository connection pool
//!
//! These tests drive the pool through its shutdown state machine and the
//! runtime resizing paths using stub connections, without a real backend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use repopool::{
    CommandResult, ConnectionFactory, Error, ExecutionContext, PoolConfig, RepositoryCommand,
    RepositoryConnection, RepositoryConnectionPool, Result, RunState,
};

#[derive(Clone, Copy)]
enum PingBehavior {
    Healthy,
    Failing,
    Slow,
}

struct StubConnection {
    source: String,
    behavior: PingBehavior,
    open: AtomicBool,
}

#[async_trait]
impl RepositoryConnection for StubConnection {
    fn source_name(&self) -> &str {
        &self.source
    }

    async fn ping(&self, timeout: Duration) -> Result<bool> {
        match self.behavior {
            PingBehavior::Healthy => Ok(self.open.load(Ordering::Acquire)),
            PingBehavior::Failing => Ok(false),
            PingBehavior::Slow => {
                tokio::time::sleep(timeout + Duration::from_millis(50)).await;
                Ok(true)
            }
        }
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        _command: &RepositoryCommand,
    ) -> Result<CommandResult> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::Repository("connection has been closed".to_string()));
        }
        Ok(CommandResult::Done)
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

/// Factory that hands out stub connections and remembers every one of them
/// so tests can assert which were physically closed.
struct StubFactory {
    name: String,
    created: AtomicUsize,
    /// Ping behavior for upcoming connections; `Healthy` once exhausted.
    behaviors: Mutex<VecDeque<PingBehavior>>,
    connections: Mutex<Vec<Arc<StubConnection>>>,
}

impl StubFactory {
    fn new(name: &str) -> Arc<Self> {
        Self::with_behaviors(name, Vec::new())
    }

    fn with_behaviors(name: &str, behaviors: Vec<PingBehavior>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            created: AtomicUsize::new(0),
            behaviors: Mutex::new(behaviors.into()),
            connections: Mutex::new(Vec::new()),
        })
    }

    fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    fn closed_count(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|conn| !conn.open.load(Ordering::Acquire))
            .count()
    }
}

#[async_trait]
impl ConnectionFactory for StubFactory {
    fn source_name(&self) -> &str {
        &self.name
    }

    async fn create_connection(&self) -> Result<Arc<dyn RepositoryConnection>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let behavior = self
            .behaviors
            .lock()
            .pop_front()
            .unwrap_or(PingBehavior::Healthy);
        let conn = Arc::new(StubConnection {
            source: self.name.clone(),
            behavior,
            open: AtomicBool::new(true),
        });
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}

fn pool_sized(factory: Arc<StubFactory>, core: usize, max: usize) -> RepositoryConnectionPool {
    let _ = env_logger::builder().is_test(true).try_init();
    RepositoryConnectionPool::with_config(
        factory,
        PoolConfig {
            core_pool_size: core,
            maximum_pool_size: max,
            ..PoolConfig::default()
        },
    )
    .expect("valid config")
}

#[tokio::test]
async fn graceful_shutdown_waits_for_in_use_connections() {
    let factory = StubFactory::new("graceful");
    let pool = pool_sized(Arc::clone(&factory), 1, 3);

    let mut first = pool.get_connection().await.expect("checkout");
    let mut second = pool.get_connection().await.expect("checkout");

    pool.shutdown().await;
    assert_eq!(pool.run_state(), RunState::ShutDown);
    assert!(pool.is_shutdown());
    assert!(!pool.is_terminated());
    assert!(!pool.await_termination(Duration::from_millis(100)).await);

    first.close().await.expect("close");
    assert!(!pool.await_termination(Duration::from_millis(100)).await);

    second.close().await.expect("close");
    assert!(pool.await_termination(Duration::from_secs(1)).await);
    assert_eq!(pool.run_state(), RunState::Terminated);
    assert_eq!(pool.pool_size(), 0);
    assert_eq!(factory.closed_count(), 2);
}

#[tokio::test]
async fn immediate_shutdown_force_closes_in_use_connections() {
    let factory = StubFactory::new("immediate");
    let pool = pool_sized(Arc::clone(&factory), 1, 3);

    let first = pool.get_connection().await.expect("checkout");
    let second = pool.get_connection().await.expect("checkout");
    let mut third = pool.get_connection().await.expect("checkout");

    pool.shutdown_now().await;

    // All three were closed synchronously; no waiting required.
    assert!(pool.is_terminated());
    assert_eq!(pool.pool_size(), 0);
    assert_eq!(factory.closed_count(), 3);
    assert!(pool.await_termination(Duration::from_millis(10)).await);

    // Caller-held handles are dead but closing them stays a no-op.
    assert!(matches!(
        first.ping(Duration::from_millis(10)).await,
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        second
            .execute(
                &ExecutionContext::new(),
                &RepositoryCommand::Read {
                    path: "/x".to_string()
                }
            )
            .await,
        Err(Error::ConnectionClosed)
    ));
    third.close().await.expect("close after force-close is a no-op");
    assert_eq!(pool.pool_size(), 0);
}

#[tokio::test]
async fn get_connection_fails_once_shutdown_begins() {
    let factory = StubFactory::new("refused");
    let pool = pool_sized(factory, 1, 3);

    pool.shutdown().await;
    assert!(pool.is_terminated());
    assert!(matches!(
        pool.get_connection().await,
        Err(Error::PoolNotRunning(_))
    ));
}

#[tokio::test]
async fn blocked_caller_wakes_when_a_connection_is_released() {
    let factory = StubFactory::new("waiting");
    let pool = pool_sized(Arc::clone(&factory), 1, 1);

    let mut held = pool.get_connection().await.expect("checkout");
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    held.close().await.expect("release");
    let reused = waiter
        .await
        .expect("task join")
        .expect("waiter obtains the released connection");
    assert_eq!(reused.source_name(), "waiting");
    assert_eq!(factory.created_count(), 1);
}

#[tokio::test]
async fn reuse_churn_does_not_wake_waiters_early() {
    let factory = StubFactory::new("churned");
    let pool = pool_sized(Arc::clone(&factory), 0, 2);

    // Repeated checkout/return cycles against an otherwise idle pool.
    for _ in 0..10 {
        let mut conn = pool.get_connection().await.expect("checkout");
        conn.close().await.expect("close");
    }
    assert_eq!(factory.created_count(), 1);

    // Saturate the pool, then park a waiter behind it. The churn above must
    // not have left wakeups behind that would let the waiter slip through.
    let mut first = pool.get_connection().await.expect("checkout");
    let _second = pool.get_connection().await.expect("checkout");
    let done = Arc::new(AtomicBool::new(false));
    let waiter = {
        let pool = pool.clone();
        let done = Arc::clone(&done);
        tokio::spawn(async move {
            let conn = pool.get_connection().await;
            done.store(true, Ordering::Release);
            conn
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!done.load(Ordering::Acquire));

    first.close().await.expect("release");
    let reused = waiter
        .await
        .expect("task join")
        .expect("waiter obtains the released connection");
    assert_eq!(reused.source_name(), "churned");
    assert_eq!(factory.created_count(), 2);
}

#[tokio::test]
async fn blocked_caller_fails_when_the_pool_shuts_down() {
    let factory = StubFactory::new("abandoned");
    let pool = pool_sized(factory, 1, 1);

    let mut held = pool.get_connection().await.expect("checkout");
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.get_connection().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown().await;
    assert!(matches!(
        waiter.await.expect("task join"),
        Err(Error::PoolNotRunning(_))
    ));

    held.close().await.expect("close");
    assert!(pool.await_termination(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn shutdown_never_reverts_an_immediate_shutdown() {
    let factory = StubFactory::new("ratchet");
    let pool = pool_sized(factory, 1, 3);

    let held = pool.get_connection().await.expect("checkout");
    pool.shutdown().await;
    assert_eq!(pool.run_state(), RunState::ShutDown);

    pool.shutdown_now().await;
    assert!(pool.is_terminated());
    drop(held);

    // A later orderly shutdown is a no-op on a terminated pool.
    pool.shutdown().await;
    assert_eq!(pool.run_state(), RunState::Terminated);
}

#[tokio::test]
async fn await_termination_times_out_on_a_running_pool() {
    let factory = StubFactory::new("running");
    let pool =
        RepositoryConnectionPool::with_sizing(factory, 1, 3, Duration::from_secs(30))
            .expect("valid config");
    assert!(!pool.await_termination(Duration::from_millis(50)).await);
    assert!(pool.is_running());
    assert_eq!(pool.keep_alive_time(), Duration::from_secs(30));
}

#[tokio::test]
async fn await_termination_wakes_promptly_on_concurrent_shutdown() {
    let factory = StubFactory::new("signalled");
    let pool = pool_sized(factory, 1, 3);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.await_termination(Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown().await;
    let observed = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter wakes well before its own deadline")
        .expect("task join");
    assert!(observed);
    assert!(pool.is_terminated());
}

#[tokio::test]
async fn shrinking_the_maximum_drains_excess_idle_connections() {
    let factory = StubFactory::new("shrink");
    let pool = pool_sized(Arc::clone(&factory), 0, 5);

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.get_connection().await.expect("checkout"));
    }
    for conn in &mut held {
        conn.close().await.expect("close");
    }
    assert_eq!(pool.stats().available, 5);

    pool.set_maximum_pool_size(2).await.expect("resize");
    let stats = pool.stats();
    assert_eq!(stats.pool_size, 2);
    assert_eq!(stats.available, 2);
    assert_eq!(factory.closed_count(), 3);
}

#[tokio::test]
async fn in_use_connections_survive_a_shrink_and_close_on_return() {
    let factory = StubFactory::new("overfull");
    let pool = pool_sized(Arc::clone(&factory), 0, 5);

    let mut held = Vec::new();
    for _ in 0..5 {
        held.push(pool.get_connection().await.expect("checkout"));
    }

    pool.set_maximum_pool_size(2).await.expect("resize");
    assert_eq!(pool.pool_size(), 5);
    assert_eq!(factory.closed_count(), 0);

    // Returns close connections until the pool fits under the new cap.
    for conn in &mut held {
        conn.close().await.expect("close");
    }
    let stats = pool.stats();
    assert_eq!(stats.pool_size, 2);
    assert_eq!(stats.available, 2);
    assert_eq!(factory.closed_count(), 3);
}

#[tokio::test]
async fn growing_the_core_provisions_idle_connections() {
    let factory = StubFactory::new("grow");
    let pool = pool_sized(Arc::clone(&factory), 1, 6);

    pool.set_core_pool_size(4).await.expect("resize");
    let stats = pool.stats();
    assert_eq!(stats.pool_size, 4);
    assert_eq!(stats.available, 4);
    assert_eq!(stats.in_use, 0);
    assert_eq!(factory.created_count(), 4);
}

#[tokio::test]
async fn shrinking_the_core_drains_only_connections_over_the_new_core() {
    let factory = StubFactory::new("core-shrink");
    let pool = pool_sized(Arc::clone(&factory), 4, 6);

    // A single connection, returned to the idle set.
    let mut held = pool.get_connection().await.expect("checkout");
    held.close().await.expect("close");
    assert_eq!(pool.stats().available, 1);

    // The pool holds fewer connections than the new core; nothing to drain.
    pool.set_core_pool_size(2).await.expect("resize");
    assert_eq!(pool.stats().available, 1);
    assert_eq!(factory.closed_count(), 0);

    // Fill to the core, then shrink below it.
    pool.prestart_all_core_connections().await.expect("prestart");
    assert_eq!(pool.pool_size(), 2);
    pool.set_core_pool_size(1).await.expect("resize");
    let stats = pool.stats();
    assert_eq!(stats.pool_size, 1);
    assert_eq!(stats.available, 1);
    assert_eq!(factory.closed_count(), 1);
}

#[tokio::test]
async fn prestart_provisions_core_connections_once() {
    let factory = StubFactory::new("prestart");
    let pool = pool_sized(Arc::clone(&factory), 2, 4);

    assert!(pool.prestart_core_connection().await.expect("prestart"));
    assert_eq!(pool.pool_size(), 1);

    assert_eq!(
        pool.prestart_all_core_connections().await.expect("prestart"),
        1
    );
    let stats = pool.stats();
    assert_eq!(stats.pool_size, 2);
    assert_eq!(stats.available, 2);

    // Core is already provisioned; nothing more to start.
    assert!(!pool.prestart_core_connection().await.expect("prestart"));
    assert_eq!(factory.created_count(), 2);
}

#[tokio::test]
async fn slow_pings_are_discarded_as_invalid() {
    let factory = StubFactory::with_behaviors("sluggish", vec![PingBehavior::Slow]);
    let pool = RepositoryConnectionPool::with_config(
        Arc::clone(&factory),
        PoolConfig {
            core_pool_size: 1,
            maximum_pool_size: 4,
            validate_connection_before_use: true,
            ping_timeout: Duration::from_millis(5),
            ..PoolConfig::default()
        },
    )
    .expect("valid config");

    let conn = pool.get_connection().await.expect("checkout");
    assert_eq!(factory.created_count(), 2);
    assert_eq!(factory.closed_count(), 1);
    assert_eq!(pool.pool_size(), 1);
    drop(conn);
}

#[tokio::test]
async fn failing_pings_exhaust_the_attempt_limit() {
    let factory = StubFactory::with_behaviors(
        "unreachable",
        vec![PingBehavior::Failing, PingBehavior::Failing, PingBehavior::Failing],
    );
    let pool = RepositoryConnectionPool::with_config(
        Arc::clone(&factory),
        PoolConfig {
            core_pool_size: 1,
            maximum_pool_size: 4,
            validate_connection_before_use: true,
            max_failed_attempts_before_error: 3,
            ..PoolConfig::default()
        },
    )
    .expect("valid config");

    match pool.get_connection().await {
        Err(Error::PoolExhausted { source, attempts }) => {
            assert_eq!(source, "unreachable");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(factory.created_count(), 3);
    assert_eq!(pool.pool_size(), 0);
}
