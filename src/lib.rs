//! pgkit: an async PostgreSQL client.
//!
//! - `config`: connect options, DSN parsing, environment snapshot
//! - `negotiate`: address resolution, SSL negotiation and retry, host selection
//! - `connection`: authenticated session, queries, listeners, reset
//! - `statement`: per-connection LRU statement cache with lifetimes
//! - `pool`: lease-based connection pool
//! - `protocol`, `scram`, `types`: wire format, SCRAM-SHA-256, values
//!
//! ```no_run
//! use pgkit::{ConnectOptions, Executor, PgValue};
//!
//! # async fn run() -> pgkit::PgResult<()> {
//! let options = ConnectOptions::from_dsn("postgres://app@db.internal/app?sslmode=prefer");
//! let pool = pgkit::create_pool(options, pgkit::PoolConfig::default()).await?;
//! let mut conn = pool.acquire().await?;
//! let total = conn.fetchval("SELECT count(*) FROM jobs WHERE state = $1", &[PgValue::from("queued")]).await?;
//! pool.release(&mut conn, None).await?;
//! # let _ = total;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod negotiate;
mod passfile;
pub mod pool;
pub mod protocol;
mod scram;
pub mod statement;
mod stream;
mod tls;
pub mod types;


pub use config::{ConnectOptions, Env, Password, SslMode, TargetSessionAttrs, TlsVersion};
pub use connection::{Connection, Notification, QueryOptions, QueryResult};
pub use error::{PgError, PgResult, ServerError};
pub use executor::Executor;
pub use negotiate::CancelHandle;
pub use pool::{Pool, PoolBuilder, PoolConfig, PooledConnection};
pub use statement::{PreparedStatement, RowOptions};
pub use types::{Oid, PgValue, Row};

/// Open a single connection.
pub async fn connect(options: &ConnectOptions) -> PgResult<Connection> {
    negotiate::connect(options).await
}

/// Build a pool and open its first `min_size` connections.
pub async fn create_pool(options: ConnectOptions, config: PoolConfig) -> PgResult<Pool> {
    Pool::builder(options).config(config).connect().await
}
