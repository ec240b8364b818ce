//! Bounded connection pool. Leases are counted with a semaphore; a returned
//! connection goes back to the idle set unless it has failed.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connection::Connection;
use crate::error::LdapError;
use crate::factory::{BoxFuture, ConnectionFactory, LdapConnectionFactory};

struct PoolState {
    idle: Vec<Connection>,
    leased: usize,
    closed: bool,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory<Connection = Connection>>,
    max_size: usize,
    leases: Arc<Semaphore>,
    state: Mutex<PoolState>,
    runtime: Handle,
}

/// Pool of at most `max_size` leased connections over an underlying factory.
/// Clones share the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock_state();
        f.debug_struct("ConnectionPool")
            .field("max_size", &self.inner.max_size)
            .field("idle", &state.idle.len())
            .field("leased", &state.leased)
            .field("closed", &state.closed)
            .finish()
    }
}

impl ConnectionPool {
    /// Must be called inside a tokio runtime; the pool keeps a handle to it for
    /// background work.
    pub fn new(
        factory: impl ConnectionFactory<Connection = Connection> + 'static,
        max_size: usize,
    ) -> Result<Self, LdapError> {
        if max_size == 0 {
            return Err(LdapError::IllegalState("pool size must be at least 1"));
        }
        let runtime = Handle::try_current().map_err(|_| LdapError::IllegalState("no tokio runtime"))?;
        Ok(Self {
            inner: Arc::new(PoolInner {
                factory: Arc::new(factory),
                max_size,
                leases: Arc::new(Semaphore::new(max_size)),
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    leased: 0,
                    closed: false,
                }),
                runtime,
            }),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let factory = LdapConnectionFactory::from_config(config)?;
        Ok(Self::new(factory, config.pool_max_size())?)
    }

    /// Reuses an idle connection, opens a new one while below `max_size`, or
    /// waits until a leased connection is returned.
    pub async fn get_connection(&self) -> Result<PooledConnection, LdapError> {
        self.inner.acquire().await
    }

    /// Like `get_connection`, completing `handler` from a runtime task.
    pub fn get_connection_async<F>(&self, handler: F) -> Result<(), LdapError>
    where
        F: FnOnce(Result<PooledConnection, LdapError>) + Send + 'static,
    {
        if self.is_closed() {
            return Err(LdapError::PoolClosed);
        }
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            handler(inner.acquire().await);
        });
        Ok(())
    }

    /// Blocks the calling thread until a connection is available. Must not be
    /// called from a task running on the pool's runtime.
    pub fn get_connection_blocking(&self) -> Result<PooledConnection, LdapError> {
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.get_connection_async(move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv()
            .map_err(|_| LdapError::IllegalState("pool runtime stopped"))?
    }

    /// Closes every idle connection and fails current and future waiters with
    /// `PoolClosed`. Leased connections are closed when they are returned.
    pub fn close(&self) {
        let idle = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        self.inner.leases.close();
        for connection in idle {
            connection.close();
        }
        info!("Connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    pub fn idle_count(&self) -> usize {
        self.inner.lock_state().idle.len()
    }

    pub fn leased_count(&self) -> usize {
        self.inner.lock_state().leased
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }
}

impl ConnectionFactory for ConnectionPool {
    type Connection = PooledConnection;

    fn get_connection(&self) -> BoxFuture<'_, Result<PooledConnection, LdapError>> {
        Box::pin(self.inner.acquire())
    }
}

impl PoolInner {
    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, LdapError> {
        let closed = self.lock_state().closed;
        if closed {
            return Err(LdapError::PoolClosed);
        }
        let permit = Arc::clone(&self.leases)
            .acquire_owned()
            .await
            .map_err(|_| LdapError::PoolClosed)?;

        loop {
            let candidate = {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(LdapError::PoolClosed);
                }
                state.idle.pop()
            };
            let Some(connection) = candidate else {
                break;
            };
            if connection.is_valid() {
                debug!("Reusing pooled connection {}", connection.id());
                return self.lease(connection, permit);
            }
            debug!("Discarding invalid idle connection {}", connection.id());
            connection.close();
        }

        let connection = self.factory.get_connection().await?;
        debug!("Opened pooled connection {}", connection.id());
        self.lease(connection, permit)
    }

    fn lease(self: &Arc<Self>, connection: Connection, permit: OwnedSemaphorePermit) -> Result<PooledConnection, LdapError> {
        let mut state = self.lock_state();
        if state.closed {
            drop(state);
            connection.close();
            return Err(LdapError::PoolClosed);
        }
        state.leased += 1;
        Ok(PooledConnection {
            connection,
            permit: Some(permit),
            pool: Arc::clone(self),
            discard: false,
        })
    }

    fn release(self: &Arc<Self>, connection: Connection, discard: bool) {
        let replace = {
            let mut state = self.lock_state();
            state.leased = state.leased.saturating_sub(1);
            let usable = !discard && connection.is_valid();
            if !state.closed && usable && state.idle.len() + state.leased < self.max_size {
                state.idle.push(connection);
                return;
            }
            !state.closed && !usable
        };
        debug!("Closing pooled connection {}", connection.id());
        connection.close();
        if replace {
            self.spawn_replacement();
        }
    }

    // Opens a connection into the idle set in place of an evicted one.
    fn spawn_replacement(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        self.runtime.spawn(async move {
            let Ok(permit) = Arc::clone(&pool.leases).acquire_owned().await else {
                return;
            };
            {
                let state = pool.lock_state();
                if state.closed || !state.idle.is_empty() {
                    return;
                }
            }
            match pool.factory.get_connection().await {
                Ok(connection) => {
                    let mut state = pool.lock_state();
                    if state.closed || state.idle.len() + state.leased >= pool.max_size {
                        drop(state);
                        connection.close();
                    } else {
                        debug!("Opened replacement connection {}", connection.id());
                        state.idle.push(connection);
                    }
                }
                Err(e) => warn!("Failed to open replacement connection: {}", e),
            }
            drop(permit);
        });
    }
}

/// A connection leased from a `ConnectionPool`. Dropping it (or calling
/// `close`) returns the connection to the pool.
pub struct PooledConnection {
    connection: Connection,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
    discard: bool,
}

impl PooledConnection {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Returns the connection to the pool.
    pub fn close(self) {}

    /// Closes the underlying connection instead of returning it.
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.connection)
            .field("discard", &self.discard)
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.connection.clone(), self.discard);
        // The idle set is updated before a waiter can take the permit.
        drop(self.permit.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::extended::DecoderRegistry;
    use crate::ldap_protocol::{DelRequest, ExtendedRequest};
    use crate::test_support::{init_tracing, MockServer};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Clone, Default)]
    struct TestFactory {
        created: Arc<AtomicUsize>,
        fail: Arc<AtomicBool>,
    }

    impl TestFactory {
        fn created(&self) -> usize {
            self.created.load(Ordering::SeqCst)
        }
    }

    impl ConnectionFactory for TestFactory {
        type Connection = Connection;

        fn get_connection(&self) -> BoxFuture<'_, Result<Connection, LdapError>> {
            Box::pin(async move {
                if self.fail.load(Ordering::SeqCst) {
                    return Err(LdapError::Connect("connection refused".to_string()));
                }
                self.created.fetch_add(1, Ordering::SeqCst);
                let (client, server) = tokio::io::duplex(64 * 1024);
                tokio::spawn(MockServer::new(server).serve());
                Ok(Connection::from_stream(
                    client,
                    ConnectionOptions::default(),
                    Arc::new(DecoderRegistry::with_defaults()),
                ))
            })
        }
    }

    fn pool(max_size: usize) -> (ConnectionPool, TestFactory) {
        let factory = TestFactory::default();
        (ConnectionPool::new(factory.clone(), max_size).unwrap(), factory)
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        timeout(WAIT, async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_returned_connection_is_reused() {
        init_tracing();
        let (pool, factory) = pool(2);
        let lease = pool.get_connection().await.unwrap();
        let id = lease.id();
        assert_eq!(pool.leased_count(), 1);
        lease.close();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.leased_count(), 0);

        let lease = pool.get_connection().await.unwrap();
        assert_eq!(lease.id(), id);
        assert_eq!(factory.created(), 1);

        // The leased connection is fully usable.
        let delete = lease
            .delete(DelRequest {
                entry: "cn=x,dc=example,dc=com".to_string(),
            })
            .unwrap();
        assert!(timeout(WAIT, delete.result()).await.unwrap().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_max_size_or_double_leases() {
        let (pool, factory) = pool(3);
        let in_use = Arc::new(Mutex::new(HashSet::new()));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let lease = pool.get_connection().await.unwrap();
                {
                    let mut in_use = in_use.lock().unwrap();
                    assert!(in_use.insert(lease.id()), "connection leased twice");
                    peak.fetch_max(in_use.len(), Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_use.lock().unwrap().remove(&lease.id());
                drop(lease);
            }));
        }
        for task in tasks {
            timeout(WAIT, task).await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(factory.created() <= 3);
        assert_eq!(pool.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_waiter_resumes_when_connection_returned() {
        let (pool, factory) = pool(1);
        let first = pool.get_connection().await.unwrap();
        let first_id = first.id();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_connection().await.map(|lease| lease.id()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let id = timeout(WAIT, waiter).await.unwrap().unwrap().unwrap();
        assert_eq!(id, first_id);
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_close_pool() {
        let (pool, _factory) = pool(1);
        let lease = pool.get_connection().await.unwrap();
        let connection = lease.connection().clone();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get_connection().await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(
            timeout(WAIT, waiter).await.unwrap().unwrap(),
            Err(LdapError::PoolClosed)
        ));
        assert!(matches!(pool.get_connection().await, Err(LdapError::PoolClosed)));
        assert!(matches!(pool.get_connection_async(|_| {}), Err(LdapError::PoolClosed)));

        // Still usable until returned, then closed rather than kept.
        assert!(connection.is_valid());
        drop(lease);
        assert!(!connection.is_valid());
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_close_closes_idle_connections() {
        let (pool, _factory) = pool(2);
        let lease = pool.get_connection().await.unwrap();
        let connection = lease.connection().clone();
        drop(lease);
        assert!(connection.is_valid());

        pool.close();
        assert!(!connection.is_valid());
    }

    #[tokio::test]
    async fn test_failed_connection_is_replaced() {
        let (pool, factory) = pool(2);
        let lease = pool.get_connection().await.unwrap();
        let failed = lease.connection().clone();
        failed.close();
        drop(lease);

        wait_for(|| pool.idle_count() == 1).await;
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.leased_count(), 0);

        let lease = pool.get_connection().await.unwrap();
        assert_ne!(lease.id(), failed.id());
        assert!(lease.is_valid());
    }

    #[tokio::test]
    async fn test_discard_evicts_connection() {
        let (pool, factory) = pool(2);
        let lease = pool.get_connection().await.unwrap();
        let discarded = lease.connection().clone();
        lease.discard();
        assert!(!discarded.is_valid());

        wait_for(|| pool.idle_count() == 1).await;
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_invalid_idle_connection_is_skipped() {
        let (pool, factory) = pool(2);
        let lease = pool.get_connection().await.unwrap();
        let stale = lease.connection().clone();
        drop(lease);
        stale.close();

        let lease = pool.get_connection().await.unwrap();
        assert_ne!(lease.id(), stale.id());
        assert_eq!(factory.created(), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn test_factory_error_releases_slot() {
        let (pool, factory) = pool(1);
        factory.fail.store(true, Ordering::SeqCst);
        let err = pool.get_connection().await.unwrap_err();
        assert!(matches!(err, LdapError::Connect(_)));
        assert_eq!(pool.leased_count(), 0);

        factory.fail.store(false, Ordering::SeqCst);
        let lease = timeout(WAIT, pool.get_connection()).await.unwrap().unwrap();
        assert!(lease.is_valid());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_get() {
        let (pool, _factory) = pool(1);
        let blocking = {
            let pool = pool.clone();
            tokio::task::spawn_blocking(move || pool.get_connection_blocking().map(|lease| lease.id()))
        };
        let id = timeout(WAIT, blocking).await.unwrap().unwrap().unwrap();
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.get_connection().await.unwrap().id(), id);
    }

    #[tokio::test]
    async fn test_async_handler() {
        let (pool, _factory) = pool(1);
        let (tx, rx) = oneshot::channel();
        pool.get_connection_async(move |result| {
            let _ = tx.send(result);
        })
        .unwrap();
        let lease = timeout(WAIT, rx).await.unwrap().unwrap().unwrap();
        let who = lease.extended(ExtendedRequest::who_am_i()).unwrap();
        assert!(timeout(WAIT, who.result()).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_pool_as_connection_factory() {
        let (pool, _factory) = pool(1);
        let lease = ConnectionFactory::get_connection(&pool).await.unwrap();
        assert_eq!(pool.leased_count(), 1);
        drop(lease);
        assert_eq!(pool.leased_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_pool_size() {
        assert!(matches!(
            ConnectionPool::new(TestFactory::default(), 0),
            Err(LdapError::IllegalState(_))
        ));
    }

    #[test]
    fn test_new_requires_runtime() {
        assert!(matches!(
            ConnectionPool::new(TestFactory::default(), 1),
            Err(LdapError::IllegalState(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config() {
        let mut config = Config::default();
        config.pool.max_size = Some(4);
        let pool = ConnectionPool::from_config(&config).unwrap();
        assert_eq!(pool.max_size(), 4);
        assert_eq!(pool.idle_count(), 0);
    }
}
