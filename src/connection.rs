//! A single PostgreSQL session.
//!
//! This module provides the connection type that handles:
//! - Startup and authentication (cleartext, MD5, SCRAM-SHA-256)
//! - Simple and extended queries with a per-connection statement cache
//! - Session reset, graceful close and abort
//! - Notification, notice and termination listeners

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf};
use tracing::{debug, warn};

use crate::config::{Address, ClientConfig, ConnectionParameters};
use crate::error::{PgError, PgResult, ServerError};
use crate::negotiate::CancelHandle;
use crate::pool::PoolLink;
use crate::protocol::{self, BackendMessage, Frontend, Target, TransactionStatus};
use crate::scram::{self, ScramSha256};
use crate::statement::{
    PreparedStatement, RowOptions, SharedColumns, StatementCache, StatementState,
};
use crate::stream::PgStream;
use crate::types::{Oid, PgValue, Row};

/// How long a connection may take to resynchronise after a timed out command
/// before it is aborted.
const RECOVERY_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Query options and results
// ============================================================================

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryOptions {
    /// Overrides the connection's `command_timeout`.
    pub timeout: Option<Duration>,
    pub rows: RowOptions,
}

impl QueryOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Result of a query execution.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: SharedColumns,
    pub rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    /// Rows affected according to the command tag.
    pub fn rows_affected(&self) -> u64 {
        // "INSERT 0 5", "UPDATE 3", "DELETE 2", "SELECT 10", ...
        let parts: Vec<&str> = self.command_tag.split_whitespace().collect();
        match parts.as_slice() {
            ["INSERT", _, n]
            | ["UPDATE" | "DELETE" | "SELECT" | "MERGE" | "MOVE" | "FETCH" | "COPY", n] => {
                n.parse().unwrap_or(0)
            }
            _ => 0,
        }
    }
}

// ============================================================================
// Server capabilities
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ServerVersion {
    pub major: u32,
    pub minor: u32,
    pub micro: u32,
}

impl ServerVersion {
    /// Parse a `server_version` status such as `16.2 (Debian 16.2-1)` or `10beta1`.
    pub fn parse(raw: &str) -> Self {
        let token = raw.split_whitespace().next().unwrap_or_default();
        let mut parts = token.split('.').map(|part| {
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        });
        Self {
            major: parts.next().unwrap_or(0),
            minor: parts.next().unwrap_or(0),
            micro: parts.next().unwrap_or(0),
        }
    }
}

/// Features that vary between PostgreSQL and wire-compatible servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub advisory_locks: bool,
    pub notifications: bool,
    pub plpgsql: bool,
    pub sql_reset: bool,
    pub sql_close_all: bool,
}

impl ServerCapabilities {
    pub fn detect(settings: &HashMap<String, String>) -> Self {
        if settings.contains_key("padb_revision") {
            // Amazon Redshift
            Self {
                advisory_locks: false,
                notifications: false,
                plpgsql: false,
                sql_reset: true,
                sql_close_all: false,
            }
        } else if settings.contains_key("crdb_version") || settings.contains_key("crate_version") {
            // CockroachDB, CrateDB
            Self {
                advisory_locks: false,
                notifications: false,
                plpgsql: false,
                sql_reset: false,
                sql_close_all: false,
            }
        } else {
            Self {
                advisory_locks: true,
                notifications: true,
                plpgsql: true,
                sql_reset: true,
                sql_close_all: true,
            }
        }
    }

    /// Statements that return a session to a clean state.
    pub fn reset_query(&self) -> String {
        let mut query = String::new();
        if self.advisory_locks {
            query.push_str("SELECT pg_advisory_unlock_all();\n");
        }
        if self.sql_close_all {
            query.push_str("CLOSE ALL;\n");
        }
        if self.notifications && self.plpgsql {
            query.push_str("UNLISTEN *;\n");
        }
        if self.sql_reset {
            query.push_str("RESET ALL;\n");
        }
        query
    }
}

// ============================================================================
// Listeners
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(&ServerError) + Send + Sync>;
pub type TerminationCallback = Arc<dyn Fn() + Send + Sync>;

/// Returned by the `add_*_listener` methods; pass back to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    notifications: HashMap<String, Vec<(ListenerId, NotificationCallback)>>,
    log: Vec<(ListenerId, LogCallback)>,
    termination: Vec<(ListenerId, TerminationCallback)>,
}

impl Listeners {
    fn next(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

// ============================================================================
// Exclusive section
// ============================================================================

/// Single-slot guard around every wire operation.
///
/// The flag is left set if an operation's future is dropped mid-flight, so
/// the next caller fails fast instead of reading a half-consumed response.
#[derive(Debug, Default)]
struct ExclusiveSection {
    held: bool,
}

impl ExclusiveSection {
    fn enter(&mut self) -> PgResult<()> {
        if self.held {
            return Err(PgError::interface(
                "cannot perform operation: another operation is in progress",
            ));
        }
        self.held = true;
        Ok(())
    }

    fn leave(&mut self) {
        self.held = false;
    }
}

/// Server type names looked up by OID.
#[derive(Debug, Clone, Default)]
pub struct TypeCache(Arc<Mutex<HashMap<Oid, String>>>);

impl TypeCache {
    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Connection
// ============================================================================

struct Transport {
    reader: BufReader<ReadHalf<PgStream>>,
    writer: BufWriter<WriteHalf<PgStream>>,
}

/// A PostgreSQL connection.
pub struct Connection {
    /// `None` once closed or aborted.
    transport: Option<Transport>,
    read_buffer: BytesMut,
    write_buffer: BytesMut,
    addr: Address,
    params: Arc<ConnectionParameters>,
    config: ClientConfig,
    cancel: CancelHandle,
    is_tls: bool,
    statement_cache: StatementCache,
    /// Evicted statements awaiting a server-side Close.
    pending_close: Arc<Mutex<Vec<Arc<StatementState>>>>,
    next_statement_id: u64,
    type_cache: TypeCache,
    transaction_status: TransactionStatus,
    settings: HashMap<String, String>,
    capabilities: ServerCapabilities,
    exclusive: ExclusiveSection,
    /// Sync messages sent whose ReadyForQuery has not arrived yet.
    pending_syncs: usize,
    /// Set while a write is in flight; a dropped write leaves the stream unusable.
    write_in_flight: bool,
    queries_count: u64,
    lease: u64,
    listeners: Listeners,
    pool_link: Option<PoolLink>,
}

impl Connection {
    /// Authenticate over an established transport.
    pub(crate) async fn startup(
        stream: PgStream,
        addr: Address,
        params: Arc<ConnectionParameters>,
        config: ClientConfig,
        cancel: CancelHandle,
    ) -> PgResult<Self> {
        let is_tls = stream.is_tls();
        let (read_half, write_half) = tokio::io::split(stream);

        let pending_close: Arc<Mutex<Vec<Arc<StatementState>>>> = Arc::default();
        let sink = Arc::clone(&pending_close);
        let statement_cache = StatementCache::new(
            config.statement_cache_size,
            config.max_cached_statement_lifetime,
            Arc::new(move |stmt: Arc<StatementState>| {
                if !stmt.is_unnamed() {
                    stmt.mark_closed();
                    sink.lock().push(stmt);
                }
            }),
        );

        let mut conn = Self {
            transport: Some(Transport {
                reader: BufReader::new(read_half),
                writer: BufWriter::new(write_half),
            }),
            read_buffer: BytesMut::with_capacity(8192),
            write_buffer: BytesMut::with_capacity(1024),
            addr,
            params,
            config,
            cancel,
            is_tls,
            statement_cache,
            pending_close,
            next_statement_id: 0,
            type_cache: TypeCache::default(),
            transaction_status: TransactionStatus::Idle,
            settings: HashMap::new(),
            capabilities: ServerCapabilities::detect(&HashMap::new()),
            exclusive: ExclusiveSection::default(),
            pending_syncs: 0,
            write_in_flight: false,
            queries_count: 0,
            lease: 0,
            listeners: Listeners::default(),
            pool_link: None,
        };

        if let Err(err) = conn.authenticate().await {
            conn.terminate();
            return Err(err);
        }
        conn.capabilities = ServerCapabilities::detect(&conn.settings);
        debug!(
            addr = %conn.addr,
            pid = conn.cancel.process_id,
            tls = conn.is_tls,
            "connection established"
        );
        Ok(conn)
    }

    async fn authenticate(&mut self) -> PgResult<()> {
        let mut startup_params = vec![
            ("user".to_string(), self.params.user.clone()),
            ("database".to_string(), self.params.database.clone()),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];
        startup_params.extend(self.params.server_settings.iter().cloned());
        self.send(&[Frontend::Startup {
            params: &startup_params,
        }])
        .await?;

        loop {
            match self.read_message().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    let password = self.password().await?;
                    self.send(&[Frontend::Password(&password)]).await?;
                }
                BackendMessage::AuthenticationMd5Password { salt } => {
                    let password = self.password().await?;
                    let hashed = md5_password(&self.params.user, &password, &salt);
                    self.send(&[Frontend::Password(&hashed)]).await?;
                }
                BackendMessage::AuthenticationSasl { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == scram::MECHANISM) {
                        return Err(PgError::Auth(format!(
                            "server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let password = self.password().await?;
                    self.scram_exchange(&password).await?;
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.cancel.process_id = process_id;
                    self.cancel.secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery { .. } => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(&fields));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during startup: {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn scram_exchange(&mut self, password: &str) -> PgResult<()> {
        let mut scram = ScramSha256::new(password);
        let first = scram.client_first();
        self.send(&[Frontend::SaslInitialResponse {
            mechanism: scram::MECHANISM,
            data: &first,
        }])
        .await?;

        loop {
            match self.read_message().await? {
                BackendMessage::AuthenticationSaslContinue { data } => {
                    let reply = scram
                        .client_final(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    self.send(&[Frontend::SaslResponse(&reply)]).await?;
                }
                BackendMessage::AuthenticationSaslFinal { data } => {
                    return scram.verify(&data).map_err(|e| PgError::Auth(e.to_string()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(PgError::from_fields(&fields));
                }
                other => {
                    return Err(PgError::Protocol(format!(
                        "unexpected message during SASL exchange: {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn password(&self) -> PgResult<String> {
        match &self.params.password {
            Some(password) => password.resolve().await,
            None => Err(PgError::Auth(format!(
                "password authentication failed for user {:?}: no password supplied",
                self.params.user
            ))),
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Run `query` with the extended protocol, preparing it through the
    /// statement cache.
    pub async fn fetch_with(
        &mut self,
        query: &str,
        args: &[PgValue],
        options: &QueryOptions,
    ) -> PgResult<QueryResult> {
        self.check_open()?;
        self.queries_count += 1;
        let timeout = options.timeout.or(self.config.command_timeout);
        let rows = options.rows;
        self.exclusive.enter()?;
        let result = match timeout {
            None => self.query_with_retry(query, args, rows).await,
            Some(limit) => {
                match tokio::time::timeout(limit, self.query_with_retry(query, args, rows)).await {
                    Ok(result) => result,
                    Err(_) => Err(self.recover_from_timeout().await),
                }
            }
        };
        self.exclusive.leave();
        result
    }

    /// Execute `query`, returning the last command tag.
    ///
    /// Without arguments the simple protocol is used, so several
    /// semicolon-separated statements may be sent at once.
    pub async fn execute(&mut self, query: &str, args: &[PgValue]) -> PgResult<String> {
        self.execute_with(query, args, None).await
    }

    /// [`execute`](Self::execute) with a timeout overriding `command_timeout`.
    pub async fn execute_with(
        &mut self,
        query: &str,
        args: &[PgValue],
        timeout: Option<Duration>,
    ) -> PgResult<String> {
        if args.is_empty() {
            let results = self.simple_query_with(query, timeout).await?;
            Ok(results
                .into_iter()
                .last()
                .map(|r| r.command_tag)
                .unwrap_or_default())
        } else {
            let options = QueryOptions {
                timeout,
                ..QueryOptions::default()
            };
            let result = self.fetch_with(query, args, &options).await?;
            Ok(result.command_tag)
        }
    }

    /// Run `query` with the simple protocol; results are decoded from text.
    pub async fn simple_query(&mut self, query: &str) -> PgResult<Vec<QueryResult>> {
        self.simple_query_with(query, None).await
    }

    pub async fn simple_query_with(
        &mut self,
        query: &str,
        timeout: Option<Duration>,
    ) -> PgResult<Vec<QueryResult>> {
        self.check_open()?;
        self.queries_count += 1;
        let timeout = timeout.or(self.config.command_timeout);
        self.run_simple(query, timeout).await
    }

    /// Simple query that does not count towards `queries_count`.
    pub(crate) async fn query_internal(&mut self, query: &str) -> PgResult<Vec<QueryResult>> {
        self.check_open()?;
        let timeout = self.config.command_timeout;
        self.run_simple(query, timeout).await
    }

    async fn run_simple(
        &mut self,
        query: &str,
        timeout: Option<Duration>,
    ) -> PgResult<Vec<QueryResult>> {
        self.exclusive.enter()?;
        let result = match timeout {
            None => self.simple_query_inner(query).await,
            Some(limit) => match tokio::time::timeout(limit, self.simple_query_inner(query)).await {
                Ok(result) => result,
                Err(_) => Err(self.recover_from_timeout().await),
            },
        };
        self.exclusive.leave();
        result
    }

    async fn simple_query_inner(&mut self, query: &str) -> PgResult<Vec<QueryResult>> {
        self.send(&[Frontend::Query(query)]).await?;

        let mut results = Vec::new();
        let mut current = QueryResult::default();
        let mut error = None;
        loop {
            match self.read_message().await? {
                BackendMessage::RowDescription { fields } => {
                    current.columns = Arc::new(fields);
                }
                BackendMessage::DataRow { values } => {
                    let row = decode_row(&values, &current.columns, RowOptions::text())?;
                    current.rows.push(row);
                }
                BackendMessage::CommandComplete { tag } => {
                    current.command_tag = tag;
                    results.push(std::mem::take(&mut current));
                }
                BackendMessage::EmptyQueryResponse => results.push(QueryResult::default()),
                BackendMessage::ErrorResponse { fields } => {
                    error = Some(PgError::from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { .. } => break,
                _ => {}
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(results),
        }
    }

    async fn query_with_retry(
        &mut self,
        query: &str,
        args: &[PgValue],
        rows: RowOptions,
    ) -> PgResult<QueryResult> {
        let mut retried = false;
        loop {
            let statement = self.get_statement(query, args, rows).await?;
            match self.bind_execute(&statement, args).await {
                Err(PgError::InvalidCachedStatement(err)) => {
                    self.drop_global_statement_cache();
                    if retried || self.is_in_transaction() {
                        return Err(PgError::InvalidCachedStatement(err));
                    }
                    debug!(query, "cached plan invalidated by the server, re-preparing");
                    retried = true;
                }
                other => return other,
            }
        }
    }

    /// Cached statement for `query`, preparing it on a miss.
    async fn get_statement(
        &mut self,
        query: &str,
        args: &[PgValue],
        rows: RowOptions,
    ) -> PgResult<Arc<StatementState>> {
        let cacheable = self.statement_cache.is_enabled()
            && query.len() <= self.config.max_cacheable_statement_size;
        if cacheable {
            if let Some(statement) = self.statement_cache.get(query, rows) {
                return Ok(statement);
            }
        }

        self.close_pending_statements().await?;
        let name = if cacheable {
            self.next_statement_name()
        } else {
            String::new()
        };
        let param_types: Vec<Oid> = args.iter().map(PgValue::type_oid).collect();
        let statement = Arc::new(self.parse_describe(name, query, &param_types, rows).await?);
        if cacheable {
            self.statement_cache
                .put(query, rows, Arc::clone(&statement));
        }
        Ok(statement)
    }

    async fn parse_describe(
        &mut self,
        name: String,
        query: &str,
        param_types: &[Oid],
        rows: RowOptions,
    ) -> PgResult<StatementState> {
        protocol::check_parameter_count(param_types.len())?;
        self.send(&[
            Frontend::Parse {
                name: &name,
                query,
                param_types,
            },
            Frontend::Describe {
                target: Target::Statement,
                name: &name,
            },
            Frontend::Sync,
        ])
        .await?;

        let mut described_params = param_types.to_vec();
        let mut columns = Vec::new();
        let mut error = None;
        loop {
            match self.read_message().await? {
                BackendMessage::ParameterDescription { type_oids } => described_params = type_oids,
                BackendMessage::RowDescription { fields } => columns = fields,
                BackendMessage::ErrorResponse { fields } => {
                    error = Some(PgError::from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { .. } => break,
                _ => {}
            }
        }
        if let Some(err) = error {
            return Err(err);
        }
        if !name.is_empty() {
            debug!(statement = %name, "prepared statement");
        }
        Ok(StatementState::new(
            name,
            query,
            rows,
            described_params,
            columns,
        ))
    }

    async fn bind_execute(
        &mut self,
        statement: &StatementState,
        args: &[PgValue],
    ) -> PgResult<QueryResult> {
        protocol::check_parameter_count(args.len())?;
        if args.len() != statement.param_types.len() {
            return Err(PgError::interface(format!(
                "the server expects {} argument(s) for this query, {} were passed",
                statement.param_types.len(),
                args.len()
            )));
        }
        let params: Vec<PgValue> = args
            .iter()
            .zip(&statement.param_types)
            .map(|(arg, oid)| arg.cast_for(*oid))
            .collect();
        self.send(&[
            Frontend::Bind {
                statement: &statement.name,
                params: &params,
                result_format: statement.options.format,
            },
            Frontend::Execute,
            Frontend::Sync,
        ])
        .await?;

        let mut result = QueryResult {
            columns: Arc::clone(&statement.columns),
            ..QueryResult::default()
        };
        let mut error = None;
        loop {
            match self.read_message().await? {
                BackendMessage::DataRow { values } => {
                    if error.is_none() {
                        match decode_row(&values, &statement.columns, statement.options) {
                            Ok(row) => result.rows.push(row),
                            Err(err) => error = Some(err),
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => result.command_tag = tag,
                BackendMessage::ErrorResponse { fields } => {
                    error = Some(PgError::from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { .. } => break,
                _ => {}
            }
        }
        match error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    /// Prepare a named statement outside the cache.
    pub async fn prepare(&mut self, query: &str) -> PgResult<PreparedStatement> {
        self.prepare_with(query, &[], RowOptions::default()).await
    }

    /// Prepare with explicit parameter types (`Oid::UNSPECIFIED` lets the
    /// server infer one).
    pub async fn prepare_with(
        &mut self,
        query: &str,
        param_types: &[Oid],
        rows: RowOptions,
    ) -> PgResult<PreparedStatement> {
        self.check_open()?;
        self.exclusive.enter()?;
        let result = self.prepare_uncached(query, param_types, rows).await;
        self.exclusive.leave();
        Ok(PreparedStatement {
            state: Arc::new(result?),
            lease: self.lease,
        })
    }

    async fn prepare_uncached(
        &mut self,
        query: &str,
        param_types: &[Oid],
        rows: RowOptions,
    ) -> PgResult<StatementState> {
        self.close_pending_statements().await?;
        let name = self.next_statement_name();
        self.parse_describe(name, query, param_types, rows).await
    }

    /// Execute a statement returned by [`prepare`](Self::prepare).
    pub async fn fetch_prepared(
        &mut self,
        statement: &PreparedStatement,
        args: &[PgValue],
    ) -> PgResult<QueryResult> {
        self.check_open()?;
        self.check_statement(statement)?;
        self.queries_count += 1;
        self.exclusive.enter()?;
        let result = match self.config.command_timeout {
            None => self.bind_execute(&statement.state, args).await,
            Some(limit) => {
                match tokio::time::timeout(limit, self.bind_execute(&statement.state, args)).await {
                    Ok(result) => result,
                    Err(_) => Err(self.recover_from_timeout().await),
                }
            }
        };
        self.exclusive.leave();
        result
    }

    /// Close a prepared statement on the server.
    pub async fn close_statement(&mut self, statement: &PreparedStatement) -> PgResult<()> {
        self.check_open()?;
        self.check_statement(statement)?;
        statement.state.mark_closed();
        self.pending_close.lock().push(Arc::clone(&statement.state));
        self.exclusive.enter()?;
        let result = self.close_pending_statements().await;
        self.exclusive.leave();
        result
    }

    fn check_statement(&self, statement: &PreparedStatement) -> PgResult<()> {
        if statement.lease != self.lease {
            return Err(PgError::interface(
                "cannot use a prepared statement created before the connection was released to the pool",
            ));
        }
        if statement.is_closed() {
            return Err(PgError::interface("prepared statement is closed"));
        }
        Ok(())
    }

    /// Close evicted statements on the server in one round trip.
    async fn close_pending_statements(&mut self) -> PgResult<()> {
        let pending: Vec<Arc<StatementState>> = std::mem::take(&mut *self.pending_close.lock());
        if pending.is_empty() {
            return Ok(());
        }
        let mut messages: Vec<Frontend<'_>> = pending
            .iter()
            .map(|stmt| Frontend::Close {
                target: Target::Statement,
                name: &stmt.name,
            })
            .collect();
        messages.push(Frontend::Sync);
        self.send(&messages).await?;

        let mut error = None;
        loop {
            match self.read_message().await? {
                BackendMessage::ErrorResponse { fields } => {
                    error = Some(PgError::from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { .. } => break,
                _ => {}
            }
        }
        debug!(count = pending.len(), "closed evicted statements");
        error.map_or(Ok(()), Err)
    }

    fn next_statement_name(&mut self) -> String {
        self.next_statement_id += 1;
        format!("__pgkit_stmt_{:x}__", self.next_statement_id)
    }

    /// Clear the statement cache of this connection and, when pooled, of
    /// every connection in the pool.
    fn drop_global_statement_cache(&self) {
        match self.pool_link.as_ref().and_then(PoolLink::upgrade) {
            Some(pool) => pool.drop_statement_cache(),
            None => self.statement_cache.clear(),
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub async fn begin(&mut self) -> PgResult<()> {
        self.simple_query("BEGIN").await.map(|_| ())
    }

    pub async fn commit(&mut self) -> PgResult<()> {
        self.simple_query("COMMIT").await.map(|_| ())
    }

    pub async fn rollback(&mut self) -> PgResult<()> {
        self.simple_query("ROLLBACK").await.map(|_| ())
    }

    /// True inside a transaction block, including a failed one.
    pub fn is_in_transaction(&self) -> bool {
        self.transaction_status != TransactionStatus::Idle
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    // ========================================================================
    // Session state
    // ========================================================================

    /// Return the session to a clean state for its next user.
    pub async fn reset(&mut self, timeout: Option<Duration>) -> PgResult<()> {
        self.check_open()?;
        self.listeners.notifications.clear();
        self.listeners.log.clear();

        let mut query = self.capabilities.reset_query();
        if self.is_in_transaction() {
            query.insert_str(0, "ROLLBACK;\n");
        }
        if query.is_empty() {
            return Ok(());
        }
        self.run_simple(&query, timeout).await.map(|_| ())
    }

    /// Look up a type name, caching the answer.
    pub async fn type_name(&mut self, oid: Oid) -> PgResult<String> {
        if let Some(name) = self.type_cache.0.lock().get(&oid) {
            return Ok(name.clone());
        }
        let result = self
            .fetch_with(
                "SELECT typname::text FROM pg_catalog.pg_type WHERE oid = $1::oid",
                &[PgValue::Int8(i64::from(oid.0))],
                &QueryOptions::default(),
            )
            .await?;
        let name = result
            .rows
            .into_iter()
            .next()
            .and_then(|row| row.into_iter().next())
            .and_then(|value| match value {
                PgValue::Text(name) => Some(name),
                _ => None,
            })
            .ok_or_else(|| PgError::Type(format!("unknown type OID {}", oid.0)))?;
        self.type_cache.0.lock().insert(oid, name.clone());
        Ok(name)
    }

    // ========================================================================
    // Listeners
    // ========================================================================

    /// Subscribe to `channel`, issuing `LISTEN` for the first subscriber.
    ///
    /// Notifications are delivered while the connection reads responses.
    pub async fn add_listener<F>(&mut self, channel: &str, callback: F) -> PgResult<ListenerId>
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        if !self.listeners.notifications.contains_key(channel) {
            self.execute(&format!("LISTEN {}", quote_ident(channel)), &[])
                .await?;
        }
        let id = self.listeners.next();
        self.listeners
            .notifications
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        Ok(id)
    }

    /// Remove a subscription, issuing `UNLISTEN` once the channel has none.
    pub async fn remove_listener(&mut self, channel: &str, id: ListenerId) -> PgResult<()> {
        let Some(callbacks) = self.listeners.notifications.get_mut(channel) else {
            return Ok(());
        };
        callbacks.retain(|(existing, _)| *existing != id);
        if callbacks.is_empty() {
            self.listeners.notifications.remove(channel);
            self.execute(&format!("UNLISTEN {}", quote_ident(channel)), &[])
                .await?;
        }
        Ok(())
    }

    /// Receive server notices (`NoticeResponse`).
    pub fn add_log_listener<F>(&mut self, callback: F) -> ListenerId
    where
        F: Fn(&ServerError) + Send + Sync + 'static,
    {
        let id = self.listeners.next();
        self.listeners.log.push((id, Arc::new(callback)));
        id
    }

    pub fn remove_log_listener(&mut self, id: ListenerId) {
        self.listeners.log.retain(|(existing, _)| *existing != id);
    }

    /// Called once when the connection is closed or aborted.
    pub fn add_termination_listener<F>(&mut self, callback: F) -> ListenerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.listeners.next();
        self.listeners.termination.push((id, Arc::new(callback)));
        id
    }

    pub fn remove_termination_listener(&mut self, id: ListenerId) {
        self.listeners
            .termination
            .retain(|(existing, _)| *existing != id);
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.listeners.notifications.is_empty() || !self.listeners.log.is_empty()
    }

    // ========================================================================
    // Close and terminate
    // ========================================================================

    /// Close gracefully with a Terminate message.
    ///
    /// If the handshake fails the transport is aborted anyway and the error
    /// is returned.
    pub async fn close(&mut self, timeout: Option<Duration>) -> PgResult<()> {
        if self.is_aborted() {
            self.terminate();
            return Ok(());
        }
        let Some(mut transport) = self.transport.take() else {
            return Ok(());
        };
        let graceful = async {
            let mut buf = BytesMut::new();
            Frontend::Terminate.encode(&mut buf);
            transport.writer.write_all(&buf).await?;
            transport.writer.flush().await?;
            transport.writer.shutdown().await?;
            Ok::<_, PgError>(())
        };
        let result = match timeout {
            None => graceful.await,
            Some(limit) => tokio::time::timeout(limit, graceful)
                .await
                .unwrap_or(Err(PgError::Timeout)),
        };
        drop(transport);
        self.cleanup();
        if let Err(err) = &result {
            debug!(addr = %self.addr, error = %err, "graceful close failed, connection aborted");
        }
        result
    }

    /// Drop the transport immediately.
    pub fn terminate(&mut self) {
        if self.transport.take().is_some() {
            self.cleanup();
        }
    }

    fn cleanup(&mut self) {
        for statement in self.statement_cache.statements() {
            statement.mark_closed();
        }
        self.statement_cache.clear();
        for statement in std::mem::take(&mut *self.pending_close.lock()) {
            statement.mark_closed();
        }
        self.exclusive.leave();
        self.pending_syncs = 0;

        let termination = std::mem::take(&mut self.listeners.termination);
        self.listeners = Listeners::default();
        for (_, callback) in termination {
            callback();
        }
        if let Some(link) = &self.pool_link {
            link.connection_closed();
        }
        debug!(addr = %self.addr, "connection closed");
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_none() || self.is_aborted()
    }

    /// Whether the owning pool was terminated while this connection was open.
    fn is_aborted(&self) -> bool {
        self.pool_link.as_ref().is_some_and(PoolLink::is_aborted)
    }

    fn check_open(&self) -> PgResult<()> {
        if self.is_closed() {
            return Err(PgError::ConnectionClosed);
        }
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn backend_pid(&self) -> i32 {
        self.cancel.process_id
    }

    pub fn address(&self) -> &Address {
        &self.addr
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.params
    }

    /// A server parameter reported via `ParameterStatus`.
    pub fn setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }

    pub fn server_version(&self) -> ServerVersion {
        ServerVersion::parse(self.setting("server_version").unwrap_or_default())
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.capabilities
    }

    pub fn is_tls(&self) -> bool {
        self.is_tls
    }

    pub fn statement_cache(&self) -> &StatementCache {
        &self.statement_cache
    }

    pub fn type_cache(&self) -> &TypeCache {
        &self.type_cache
    }

    /// Queries issued through the public query methods.
    pub fn queries_count(&self) -> u64 {
        self.queries_count
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub(crate) fn set_pool_link(&mut self, link: PoolLink) {
        self.pool_link = Some(link);
    }

    /// Invalidate prepared statement handles from the previous lease.
    pub(crate) fn end_lease(&mut self) {
        self.lease += 1;
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// Cancel the in-flight command and resynchronise, aborting the
    /// connection if that is not possible. Always yields `Timeout`.
    async fn recover_from_timeout(&mut self) -> PgError {
        if self.write_in_flight || self.is_closed() {
            self.terminate();
            return PgError::Timeout;
        }
        if let Err(err) = self.cancel.cancel().await {
            debug!(error = %err, "cancel request failed");
        }
        let drained = tokio::time::timeout(RECOVERY_TIMEOUT, async {
            while self.pending_syncs > 0 {
                self.read_message().await?;
            }
            Ok::<_, PgError>(())
        })
        .await;
        if !matches!(drained, Ok(Ok(()))) {
            warn!(addr = %self.addr, "connection did not recover after a timeout, aborting it");
            self.terminate();
        }
        PgError::Timeout
    }

    /// Encode and write `messages` in one flush.
    async fn send(&mut self, messages: &[Frontend<'_>]) -> PgResult<()> {
        if self.is_aborted() {
            self.terminate();
            return Err(PgError::ConnectionClosed);
        }
        let Some(transport) = self.transport.as_mut() else {
            return Err(PgError::ConnectionClosed);
        };
        self.write_buffer.clear();
        let mut syncs = 0;
        for message in messages {
            if matches!(message, Frontend::Sync | Frontend::Query(_)) {
                syncs += 1;
            }
            message.encode(&mut self.write_buffer);
        }
        self.write_in_flight = true;
        let buffer = &self.write_buffer;
        let written = tokio::select! {
            written = async {
                transport.writer.write_all(buffer).await?;
                transport.writer.flush().await
            } => Some(written),
            _ = pool_abort(self.pool_link.as_mut()) => None,
        };
        self.write_in_flight = false;
        match written {
            Some(Ok(())) => {}
            Some(Err(err)) => {
                self.terminate();
                return Err(PgError::Io(err));
            }
            None => {
                self.terminate();
                return Err(PgError::ConnectionClosed);
            }
        }
        self.pending_syncs += syncs;
        Ok(())
    }

    /// Next message that is not asynchronous. Notices, notifications and
    /// parameter changes are dispatched on the way.
    async fn read_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            let msg = self.receive_frame().await?;
            match msg {
                BackendMessage::ParameterStatus { name, value } => {
                    self.settings.insert(name, value);
                }
                BackendMessage::NoticeResponse { fields } => {
                    let notice = ServerError::from_fields(&fields);
                    for (_, callback) in &self.listeners.log {
                        callback(&notice);
                    }
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    let notification = Notification {
                        process_id,
                        channel,
                        payload,
                    };
                    if let Some(callbacks) = self.listeners.notifications.get(&notification.channel)
                    {
                        for (_, callback) in callbacks {
                            callback(&notification);
                        }
                    }
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    self.pending_syncs = self.pending_syncs.saturating_sub(1);
                    return Ok(msg);
                }
                other => return Ok(other),
            }
        }
    }

    async fn receive_frame(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(msg) = BackendMessage::parse_frame(&mut self.read_buffer)? {
                return Ok(msg);
            }
            let Some(transport) = self.transport.as_mut() else {
                return Err(PgError::ConnectionClosed);
            };
            let read = tokio::select! {
                read = transport.reader.read_buf(&mut self.read_buffer) => read,
                _ = pool_abort(self.pool_link.as_mut()) => {
                    debug!(addr = %self.addr, "connection aborted by its pool");
                    self.terminate();
                    return Err(PgError::ConnectionClosed);
                }
            };
            match read {
                Ok(0) => {
                    self.terminate();
                    return Err(PgError::Connection(
                        "server closed the connection unexpectedly".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(err) => {
                    self.terminate();
                    return Err(PgError::Io(err));
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.transport.is_some() {
            self.terminate();
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("backend_pid", &self.cancel.process_id)
            .field("closed", &self.is_closed())
            .field("transaction_status", &self.transaction_status)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Resolves when the owning pool aborts the connection.
async fn pool_abort(link: Option<&mut PoolLink>) {
    match link {
        Some(link) => link.aborted().await,
        None => std::future::pending().await,
    }
}

fn decode_row(
    values: &[Option<bytes::Bytes>],
    columns: &[crate::protocol::FieldDescription],
    options: RowOptions,
) -> PgResult<Row> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let Some(data) = value else {
                return Ok(PgValue::Null);
            };
            let oid = columns.get(i).map_or(Oid::TEXT, |c| c.type_oid);
            match options.format {
                crate::protocol::Format::Binary => PgValue::decode_binary(oid, data),
                crate::protocol::Format::Text => PgValue::decode_text(oid, data),
            }
        })
        .collect()
}

/// MD5(MD5(password + user) + salt), hex encoded with an `md5` prefix.
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password() {
        // md5(md5("secret" + "alice") + salt)
        let hashed = md5_password("alice", "secret", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 35);
        assert_ne!(hashed, md5_password("alice", "secret", &[4, 3, 2, 1]));
    }

    #[test]
    fn test_reset_query_for_postgres() {
        let caps = ServerCapabilities::detect(&HashMap::new());
        assert_eq!(
            caps.reset_query(),
            "SELECT pg_advisory_unlock_all();\nCLOSE ALL;\nUNLISTEN *;\nRESET ALL;\n"
        );
    }

    #[test]
    fn test_reset_query_for_compatible_servers() {
        let mut settings = HashMap::new();
        settings.insert("crdb_version".to_string(), "v23.1".to_string());
        assert_eq!(ServerCapabilities::detect(&settings).reset_query(), "");

        let mut settings = HashMap::new();
        settings.insert("padb_revision".to_string(), "1".to_string());
        assert_eq!(ServerCapabilities::detect(&settings).reset_query(), "RESET ALL;\n");
    }

    #[test]
    fn test_server_version_parse() {
        assert_eq!(
            ServerVersion::parse("16.2 (Debian 16.2-1.pgdg120+2)"),
            ServerVersion {
                major: 16,
                minor: 2,
                micro: 0
            }
        );
        assert_eq!(ServerVersion::parse("10beta1").major, 10);
        assert_eq!(ServerVersion::parse("9.6.24").micro, 24);
        assert_eq!(ServerVersion::parse(""), ServerVersion::default());
    }

    #[test]
    fn test_rows_affected() {
        let result = QueryResult {
            command_tag: "INSERT 0 5".to_string(),
            ..QueryResult::default()
        };
        assert_eq!(result.rows_affected(), 5);
        let result = QueryResult {
            command_tag: "CREATE TABLE".to_string(),
            ..QueryResult::default()
        };
        assert_eq!(result.rows_affected(), 0);
    }

    #[test]
    fn test_exclusive_section_rejects_reentry() {
        let mut section = ExclusiveSection::default();
        section.enter().unwrap();
        let err = section.enter().unwrap_err();
        assert!(err.to_string().contains("another operation is in progress"));
        section.leave();
        section.enter().unwrap();
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("jobs"), "\"jobs\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }
}
