//! PostgreSQL connection pool.
//!
//! A fixed set of `max_size` holders, each owning at most one
//! [`Connection`], is handed out through a LIFO availability queue. Leased
//! connections come back through [`Pool::release`] (or by dropping the
//! [`PooledConnection`]), which resets the session before the holder is
//! queued again.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::{ConnectOptions, Env};
use crate::connection::{Connection, QueryOptions, QueryResult, TypeCache};
use crate::error::{PgError, PgResult};
use crate::executor::Executor;
use crate::negotiate;
use crate::statement::{PreparedStatement, StatementCache};
use crate::types::{PgValue, Row};

/// How long `close()` waits for leased connections before logging a warning.
const SLOW_CLOSE_WARNING: Duration = Duration::from_secs(60);

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened by `initialize`.
    pub min_size: usize,
    pub max_size: usize,
    /// Queries after which a connection is closed instead of reused.
    pub max_queries: u64,
    /// Idle connections are closed after this long; zero disables.
    #[serde(with = "seconds")]
    pub max_inactive_connection_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 10,
            max_size: 10,
            max_queries: 50_000,
            max_inactive_connection_lifetime: Duration::from_secs(300),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> PgResult<()> {
        if self.max_size == 0 {
            return Err(PgError::Config("max_size is expected to be greater than zero".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(PgError::Config(format!(
                "min_size ({}) is greater than max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.max_queries == 0 {
            return Err(PgError::Config("max_queries is expected to be greater than zero".to_string()));
        }
        Ok(())
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

pub type HookFuture<'c> = Pin<Box<dyn Future<Output = PgResult<()>> + Send + 'c>>;

/// Async callback run against a pool connection.
pub type ConnectionHook = Arc<dyn for<'c> Fn(&'c mut Connection) -> HookFuture<'c> + Send + Sync>;

// ============================================================================
// Pool link
// ============================================================================

/// A connection's way back to the pool slot that owns it.
#[derive(Debug, Clone)]
pub(crate) struct PoolLink {
    pool: Weak<PoolShared>,
    slot: usize,
    connection_id: u64,
    /// Flipped by `Pool::terminate` to abort the connection, leased or not.
    abort: watch::Receiver<bool>,
}

impl PoolLink {
    pub(crate) fn upgrade(&self) -> Option<Pool> {
        self.pool.upgrade().map(|shared| Pool { shared })
    }

    pub(crate) fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    /// Resolves once the pool aborts the connection. Never resolves if the
    /// pool is gone.
    pub(crate) async fn aborted(&mut self) {
        let gone = self.abort.wait_for(|aborted| *aborted).await.is_err();
        if gone {
            std::future::pending::<()>().await;
        }
    }

    /// Mark the slot as no longer holding a live connection.
    pub(crate) fn connection_closed(&self) {
        if let Some(shared) = self.pool.upgrade() {
            if let Some(holder) = shared.holders.get(self.slot) {
                let _ = holder.live.compare_exchange(
                    self.connection_id,
                    0,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
    }
}

// ============================================================================
// Connection holder
// ============================================================================

#[derive(Default)]
struct HolderState {
    /// Present while idle; taken out for the duration of a lease.
    conn: Option<Connection>,
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
    /// Abort switch of the slot's current connection.
    abort: Option<watch::Sender<bool>>,
    statement_cache: Option<StatementCache>,
    type_cache: Option<TypeCache>,
}

impl HolderState {
    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }
}

struct Holder {
    slot: usize,
    state: Mutex<HolderState>,
    in_use: watch::Sender<bool>,
    /// Id of the live connection owned by this slot, 0 when none.
    live: AtomicU64,
}

impl Holder {
    fn new(slot: usize) -> Self {
        Self {
            slot,
            state: Mutex::new(HolderState::default()),
            in_use: watch::channel(false).0,
            live: AtomicU64::new(0),
        }
    }

    fn is_in_use(&self) -> bool {
        *self.in_use.borrow()
    }

    /// Open a connection and park it in the holder.
    async fn connect(self: &Arc<Self>, pool: &Arc<PoolShared>) -> PgResult<()> {
        let conn = self.open(pool).await?;
        let mut state = self.state.lock();
        state.conn = Some(conn);
        self.arm_idle_timer(&mut state, pool.config.max_inactive_connection_lifetime);
        Ok(())
    }

    async fn open(&self, pool: &Arc<PoolShared>) -> PgResult<Connection> {
        let (conn, abort) = pool.new_connection(self.slot).await?;
        let mut state = self.state.lock();
        state.abort = Some(abort);
        state.generation = pool.generation.load(Ordering::Acquire);
        state.statement_cache = Some(conn.statement_cache().clone());
        state.type_cache = Some(conn.type_cache().clone());
        Ok(conn)
    }

    async fn acquire(self: &Arc<Self>, pool: &Arc<PoolShared>) -> PgResult<Connection> {
        let (existing, generation) = {
            let mut state = self.state.lock();
            state.cancel_idle_timer();
            (state.conn.take(), state.generation)
        };

        let mut conn = match existing {
            Some(conn) if !conn.is_closed() && generation == pool.generation.load(Ordering::Acquire) => {
                conn
            }
            Some(mut expired) => {
                if !expired.is_closed() {
                    debug!(slot = self.slot, "replacing connection from an expired generation");
                    expired.terminate();
                }
                self.open(pool).await?
            }
            None => self.open(pool).await?,
        };

        if let Some(setup) = &pool.setup {
            if let Err(err) = setup(&mut conn).await {
                // The session state is unknown after a failed setup.
                if let Err(close_err) = conn.close(None).await {
                    debug!(slot = self.slot, error = %close_err, "failed to close connection after setup error");
                }
                return Err(err);
            }
        }

        self.in_use.send_replace(true);
        Ok(conn)
    }

    async fn release(
        self: &Arc<Self>,
        pool: &Arc<PoolShared>,
        mut conn: Connection,
        timeout: Option<Duration>,
    ) -> PgResult<()> {
        conn.end_lease();
        let generation = self.state.lock().generation;

        let outcome = if conn.is_closed() {
            Ok(None)
        } else if pool.lifecycle() == Lifecycle::Closed {
            conn.terminate();
            Ok(None)
        } else if conn.queries_count() >= pool.config.max_queries {
            debug!(
                slot = self.slot,
                queries = conn.queries_count(),
                "connection reached max_queries, closing it"
            );
            conn.close(timeout).await.map(|_| None)
        } else if generation != pool.generation.load(Ordering::Acquire) {
            debug!(slot = self.slot, "closing connection from an expired generation");
            conn.close(timeout).await.map(|_| None)
        } else {
            if conn.has_listeners() {
                warn!(
                    slot = self.slot,
                    "connection released with listeners still registered; they are removed by the reset"
                );
            }
            match conn.reset(timeout).await {
                Ok(()) => Ok(Some(conn)),
                Err(err) => {
                    conn.terminate();
                    Err(err)
                }
            }
        };

        let (keep, result) = match outcome {
            Ok(keep) => (keep, Ok(())),
            Err(err) => (None, Err(err)),
        };
        {
            let mut state = self.state.lock();
            let idle = keep.is_some();
            state.conn = keep;
            if idle {
                self.arm_idle_timer(&mut state, pool.config.max_inactive_connection_lifetime);
            }
        }
        self.in_use.send_replace(false);
        pool.push_holder(self.slot);
        result
    }

    /// Release path without a runtime: drop the connection outright.
    fn abandon(&self, pool: &PoolShared, mut conn: Connection) {
        conn.terminate();
        self.state.lock().conn = None;
        self.in_use.send_replace(false);
        pool.push_holder(self.slot);
    }

    async fn wait_until_released(&self) {
        let mut rx = self.in_use.subscribe();
        let _ = rx.wait_for(|in_use| !*in_use).await;
    }

    async fn close(&self) -> PgResult<()> {
        let conn = {
            let mut state = self.state.lock();
            state.cancel_idle_timer();
            state.conn.take()
        };
        match conn {
            Some(mut conn) => conn.close(None).await,
            None => Ok(()),
        }
    }

    /// Force-close the slot's connection. A leased connection is aborted
    /// through its link and fails every further operation.
    fn terminate(&self) {
        let conn = {
            let mut state = self.state.lock();
            state.cancel_idle_timer();
            if let Some(abort) = &state.abort {
                abort.send_replace(true);
            }
            state.conn.take()
        };
        self.live.store(0, Ordering::Release);
        if let Some(mut conn) = conn {
            conn.terminate();
        }
    }

    fn arm_idle_timer(self: &Arc<Self>, state: &mut HolderState, lifetime: Duration) {
        state.cancel_idle_timer();
        if lifetime.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let holder = Arc::downgrade(self);
        state.idle_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Some(holder) = holder.upgrade() {
                holder.deactivate();
            }
        }));
    }

    /// Idle timer expiry: drop the connection unless it is leased.
    fn deactivate(&self) {
        let conn = {
            let mut state = self.state.lock();
            state.idle_timer = None;
            if self.is_in_use() {
                return;
            }
            state.conn.take()
        };
        if let Some(mut conn) = conn {
            debug!(slot = self.slot, "closing inactive connection");
            conn.terminate();
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Initializing,
    Ready,
    Closing,
    Closed,
}

struct PoolShared {
    config: PoolConfig,
    connect_options: Mutex<ConnectOptions>,
    env: Env,
    holders: Vec<Arc<Holder>>,
    /// Indexes of free holders; the last pushed is handed out first.
    queue: Mutex<Vec<usize>>,
    /// One permit per entry in `queue`.
    available: Semaphore,
    generation: AtomicU64,
    next_connection_id: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    init: Option<ConnectionHook>,
    setup: Option<ConnectionHook>,
}

impl PoolShared {
    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    fn push_holder(&self, slot: usize) {
        self.queue.lock().push(slot);
        self.available.add_permits(1);
    }

    async fn new_connection(
        self: &Arc<Self>,
        slot: usize,
    ) -> PgResult<(Connection, watch::Sender<bool>)> {
        let options = self.connect_options.lock().clone();
        let mut conn = negotiate::connect_with_env(&options, &self.env).await?;
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (abort, abort_rx) = watch::channel(false);
        conn.set_pool_link(PoolLink {
            pool: Arc::downgrade(self),
            slot,
            connection_id,
            abort: abort_rx,
        });
        if let Some(init) = &self.init {
            if let Err(err) = init(&mut conn).await {
                conn.terminate();
                return Err(err);
            }
        }
        if let Some(holder) = self.holders.get(slot) {
            holder.live.store(connection_id, Ordering::Release);
        }
        debug!(slot, pid = conn.backend_pid(), "pool connection opened");
        Ok((conn, abort))
    }

    fn check_usable(&self) -> PgResult<()> {
        match self.lifecycle() {
            Lifecycle::Ready => Ok(()),
            Lifecycle::New | Lifecycle::Initializing => {
                Err(PgError::interface("pool is not initialized"))
            }
            Lifecycle::Closing => Err(PgError::interface("pool is closing")),
            Lifecycle::Closed => Err(PgError::interface("pool is closed")),
        }
    }
}

/// Hands a popped holder back to the queue unless the lease went through.
struct QueueSlot<'a> {
    pool: &'a PoolShared,
    slot: Option<usize>,
}

impl QueueSlot<'_> {
    fn disarm(&mut self) {
        self.slot = None;
    }
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.push_holder(slot);
        }
    }
}

// ============================================================================
// Pool builder
// ============================================================================

pub struct PoolBuilder {
    options: ConnectOptions,
    config: PoolConfig,
    env: Option<Env>,
    init: Option<ConnectionHook>,
    setup: Option<ConnectionHook>,
}

impl PoolBuilder {
    pub fn new(options: ConnectOptions) -> Self {
        Self {
            options,
            config: PoolConfig::default(),
            env: None,
            init: None,
            setup: None,
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn min_size(mut self, size: usize) -> Self {
        self.config.min_size = size;
        self
    }

    pub fn max_size(mut self, size: usize) -> Self {
        self.config.max_size = size;
        self
    }

    pub fn max_queries(mut self, queries: u64) -> Self {
        self.config.max_queries = queries;
        self
    }

    pub fn max_inactive_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.config.max_inactive_connection_lifetime = lifetime;
        self
    }

    /// Environment used to resolve connection defaults; the process
    /// environment when not set.
    pub fn env(mut self, env: Env) -> Self {
        self.env = Some(env);
        self
    }

    /// Run once on every new connection.
    pub fn init<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut Connection) -> HookFuture<'c> + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(hook));
        self
    }

    /// Run on every acquire, before the connection is handed out.
    pub fn setup<F>(mut self, hook: F) -> Self
    where
        F: for<'c> Fn(&'c mut Connection) -> HookFuture<'c> + Send + Sync + 'static,
    {
        self.setup = Some(Arc::new(hook));
        self
    }

    /// Validate the configuration without connecting.
    pub fn build(self) -> PgResult<Pool> {
        self.config.validate()?;
        let holders = (0..self.config.max_size)
            .map(|slot| Arc::new(Holder::new(slot)))
            .collect();
        Ok(Pool {
            shared: Arc::new(PoolShared {
                config: self.config,
                connect_options: Mutex::new(self.options),
                env: self.env.unwrap_or_else(Env::from_process),
                holders,
                queue: Mutex::new(Vec::new()),
                available: Semaphore::new(0),
                generation: AtomicU64::new(0),
                next_connection_id: AtomicU64::new(1),
                lifecycle: Mutex::new(Lifecycle::New),
                init: self.init,
                setup: self.setup,
            }),
        })
    }

    /// Build and initialize.
    pub async fn connect(self) -> PgResult<Pool> {
        let pool = self.build()?;
        pool.initialize().await?;
        Ok(pool)
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool. Cloning yields another handle onto the
/// same pool.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    pub fn builder(options: ConnectOptions) -> PoolBuilder {
        PoolBuilder::new(options)
    }

    /// Queue every holder and open `min_size` connections, starting with the
    /// holders that will be handed out first.
    pub async fn initialize(&self) -> PgResult<()> {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            match *lifecycle {
                Lifecycle::New => *lifecycle = Lifecycle::Initializing,
                Lifecycle::Ready => return Ok(()),
                Lifecycle::Initializing => {
                    return Err(PgError::interface("pool is being initialized in another task"))
                }
                Lifecycle::Closing | Lifecycle::Closed => {
                    return Err(PgError::interface("pool is closed"))
                }
            }
        }

        match self.connect_min_size().await {
            Ok(()) => {
                for slot in 0..self.shared.holders.len() {
                    self.shared.push_holder(slot);
                }
                *self.shared.lifecycle.lock() = Lifecycle::Ready;
                info!(
                    min_size = self.shared.config.min_size,
                    max_size = self.shared.config.max_size,
                    "connection pool initialized"
                );
                Ok(())
            }
            Err(err) => {
                for holder in &self.shared.holders {
                    holder.terminate();
                }
                *self.shared.lifecycle.lock() = Lifecycle::New;
                Err(err)
            }
        }
    }

    async fn connect_min_size(&self) -> PgResult<()> {
        let min_size = self.shared.config.min_size;
        let Some(top) = self.shared.holders.len().checked_sub(1) else {
            return Ok(());
        };
        if min_size == 0 {
            return Ok(());
        }

        // The first connection is made alone so configuration problems
        // surface before the rest are attempted.
        self.shared.holders[top].connect(&self.shared).await?;

        let mut tasks = JoinSet::new();
        for slot in (0..top).rev().take(min_size - 1) {
            let holder = Arc::clone(&self.shared.holders[slot]);
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move { holder.connect(&shared).await });
        }
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| {
                Err(PgError::InternalClient(format!("connect task failed: {}", err)))
            });
            if let Err(err) = result {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn acquire(&self) -> PgResult<PooledConnection> {
        self.acquire_timeout(None).await
    }

    /// Lease a connection, waiting at most `timeout` for a free holder and
    /// for the connection to be ready. The timeout also becomes the default
    /// for the matching release.
    pub async fn acquire_timeout(&self, timeout: Option<Duration>) -> PgResult<PooledConnection> {
        self.shared.check_usable()?;
        match timeout {
            None => self.acquire_impl(None).await,
            Some(limit) => tokio::time::timeout(limit, self.acquire_impl(timeout))
                .await
                .map_err(|_| PgError::Timeout)?,
        }
    }

    async fn acquire_impl(&self, timeout: Option<Duration>) -> PgResult<PooledConnection> {
        let permit = self
            .shared
            .available
            .acquire()
            .await
            .map_err(|_| PgError::interface("pool is closed"))?;
        permit.forget();
        let slot = self.shared.queue.lock().pop().ok_or_else(|| {
            PgError::InternalClient("availability queue is out of sync with its permits".to_string())
        })?;
        let mut queued = QueueSlot {
            pool: &self.shared,
            slot: Some(slot),
        };

        let holder = Arc::clone(&self.shared.holders[slot]);
        let conn = holder.acquire(&self.shared).await?;
        queued.disarm();
        Ok(PooledConnection {
            conn: Some(conn),
            holder,
            pool: self.clone(),
            timeout,
        })
    }

    /// Return a leased connection. A no-op when it was already released.
    ///
    /// The work runs in a spawned task, so cancelling the caller does not
    /// interrupt the reset.
    pub async fn release(
        &self,
        conn: &mut PooledConnection,
        timeout: Option<Duration>,
    ) -> PgResult<()> {
        if !Arc::ptr_eq(&conn.pool.shared, &self.shared) {
            return Err(PgError::interface(format!(
                "Pool.release() received invalid connection: {:?} is not a member of this pool",
                conn
            )));
        }
        let Some(inner) = conn.conn.take() else {
            return Ok(());
        };
        let timeout = timeout.or(conn.timeout);
        let holder = Arc::clone(&conn.holder);
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { holder.release(&shared, inner, timeout).await })
            .await
            .map_err(|err| PgError::InternalClient(format!("release task failed: {}", err)))?
    }

    pub async fn fetch_with(
        &self,
        query: &str,
        args: &[PgValue],
        options: &QueryOptions,
    ) -> PgResult<QueryResult> {
        let mut conn = self.acquire().await?;
        let result = conn.fetch_with(query, args, options).await;
        self.release(&mut conn, None).await?;
        result
    }

    pub async fn execute(
        &self,
        query: &str,
        args: &[PgValue],
        timeout: Option<Duration>,
    ) -> PgResult<String> {
        let mut conn = self.acquire().await?;
        let result = match conn.connection() {
            Ok(inner) => inner.execute_with(query, args, timeout).await,
            Err(err) => Err(err),
        };
        self.release(&mut conn, None).await?;
        result
    }

    pub async fn fetch(
        &self,
        query: &str,
        args: &[PgValue],
        timeout: Option<Duration>,
    ) -> PgResult<Vec<Row>> {
        let options = QueryOptions {
            timeout,
            ..QueryOptions::default()
        };
        Ok(self.fetch_with(query, args, &options).await?.rows)
    }

    pub async fn fetchrow(
        &self,
        query: &str,
        args: &[PgValue],
        timeout: Option<Duration>,
    ) -> PgResult<Option<Row>> {
        Ok(self.fetch(query, args, timeout).await?.into_iter().next())
    }

    pub async fn fetchval(
        &self,
        query: &str,
        args: &[PgValue],
        timeout: Option<Duration>,
    ) -> PgResult<Option<PgValue>> {
        Ok(self
            .fetchrow(query, args, timeout)
            .await?
            .and_then(|row| row.into_iter().next()))
    }

    /// Retire every current connection: idle ones are replaced on their next
    /// acquire, leased ones are closed when released.
    pub fn expire_connections(&self) {
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(generation, "expired pool connections");
    }

    /// Replace the connect options used for new connections.
    pub fn set_connect_args(&self, options: ConnectOptions) {
        *self.shared.connect_options.lock() = options;
    }

    /// Wait for every lease to end, then close all connections gracefully.
    /// On failure every connection is terminated and the error returned.
    pub async fn close(&self) -> PgResult<()> {
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            if matches!(*lifecycle, Lifecycle::Closing | Lifecycle::Closed) {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closing;
        }
        info!("closing connection pool");

        let result = async {
            let released = async {
                for holder in &self.shared.holders {
                    holder.wait_until_released().await;
                }
            };
            tokio::pin!(released);
            tokio::select! {
                _ = &mut released => {}
                _ = tokio::time::sleep(SLOW_CLOSE_WARNING) => {
                    warn!(
                        "Pool.close() is taking over {} seconds to complete; check that \
                         every acquired connection is released",
                        SLOW_CLOSE_WARNING.as_secs()
                    );
                    released.await;
                }
            }
            for holder in &self.shared.holders {
                holder.close().await?;
            }
            Ok::<_, PgError>(())
        }
        .await;

        if result.is_err() {
            self.terminate_holders();
        }
        *self.shared.lifecycle.lock() = Lifecycle::Closed;
        self.shared.available.close();
        result
    }

    /// Close every connection immediately, including leased ones. Leases
    /// stay valid handles but fail with `ConnectionClosed`.
    pub fn terminate(&self) {
        *self.shared.lifecycle.lock() = Lifecycle::Closed;
        self.terminate_holders();
        self.shared.available.close();
    }

    fn terminate_holders(&self) {
        for holder in &self.shared.holders {
            holder.terminate();
        }
    }

    /// Connections currently open, leased or idle.
    pub fn get_size(&self) -> usize {
        self.shared
            .holders
            .iter()
            .filter(|h| h.live.load(Ordering::Acquire) != 0)
            .count()
    }

    /// Open connections not leased to anyone.
    pub fn get_idle_size(&self) -> usize {
        self.shared
            .holders
            .iter()
            .filter(|h| {
                !h.is_in_use()
                    && h.state
                        .lock()
                        .conn
                        .as_ref()
                        .is_some_and(|c| !c.is_closed())
            })
            .count()
    }

    pub fn get_min_size(&self) -> usize {
        self.shared.config.min_size
    }

    pub fn get_max_size(&self) -> usize {
        self.shared.config.max_size
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.shared.lifecycle(), Lifecycle::Closing | Lifecycle::Closed)
    }

    /// Clear the statement cache of every connection, leased or idle.
    pub fn drop_statement_cache(&self) {
        for holder in &self.shared.holders {
            let cache = holder.state.lock().statement_cache.clone();
            if let Some(cache) = cache {
                cache.clear();
            }
        }
    }

    /// Clear the type cache of every connection, leased or idle.
    pub fn drop_type_cache(&self) {
        for holder in &self.shared.holders {
            let cache = holder.state.lock().type_cache.clone();
            if let Some(cache) = cache {
                cache.clear();
            }
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("size", &self.get_size())
            .field("max_size", &self.shared.config.max_size)
            .field("lifecycle", &self.shared.lifecycle())
            .finish()
    }
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection leased from the pool.
///
/// Dropping it releases the connection in a background task; use
/// [`Pool::release`] to wait for the reset and see its errors.
pub struct PooledConnection {
    /// `None` once released.
    conn: Option<Connection>,
    holder: Arc<Holder>,
    pool: Pool,
    timeout: Option<Duration>,
}

impl PooledConnection {
    /// The leased connection, for operations beyond [`Executor`].
    pub fn connection(&mut self) -> PgResult<&mut Connection> {
        self.conn.as_mut().ok_or_else(released)
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Release back to the owning pool.
    pub async fn release(mut self, timeout: Option<Duration>) -> PgResult<()> {
        let pool = self.pool.clone();
        pool.release(&mut self, timeout).await
    }
}

fn released() -> PgError {
    PgError::interface("cannot call a method on a connection that has been released back to the pool")
}

#[async_trait]
impl Executor for PooledConnection {
    async fn fetch_with(
        &mut self,
        query: &str,
        args: &[PgValue],
        options: &QueryOptions,
    ) -> PgResult<QueryResult> {
        self.connection()?.fetch_with(query, args, options).await
    }

    async fn execute(&mut self, query: &str, args: &[PgValue]) -> PgResult<String> {
        self.connection()?.execute(query, args).await
    }

    async fn simple_query(&mut self, query: &str) -> PgResult<Vec<QueryResult>> {
        self.connection()?.simple_query(query).await
    }

    async fn prepare(&mut self, query: &str) -> PgResult<PreparedStatement> {
        self.connection()?.prepare(query).await
    }

    async fn fetch_prepared(
        &mut self,
        statement: &PreparedStatement,
        args: &[PgValue],
    ) -> PgResult<QueryResult> {
        self.connection()?.fetch_prepared(statement, args).await
    }

    fn is_in_transaction(&self) -> bool {
        self.conn.as_ref().is_some_and(Connection::is_in_transaction)
    }

    fn is_closed(&self) -> bool {
        self.conn.as_ref().map_or(true, Connection::is_closed)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let holder = Arc::clone(&self.holder);
        let shared = Arc::clone(&self.pool.shared);
        let timeout = self.timeout;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = holder.release(&shared, conn, timeout).await {
                        debug!(slot = holder.slot, error = %err, "release of dropped connection failed");
                    }
                });
            }
            Err(_) => holder.abandon(&shared, conn),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.holder.slot)
            .field("released", &self.is_released())
            .finish()
    }
}
