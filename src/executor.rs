//! The query surface shared by plain and pooled connections.

use async_trait::async_trait;

use crate::connection::{Connection, QueryOptions, QueryResult};
use crate::error::PgResult;
use crate::statement::PreparedStatement;
use crate::types::{PgValue, Row};

/// Query operations available on anything that wraps a [`Connection`].
///
/// [`PooledConnection`](crate::pool::PooledConnection) forwards every call to
/// the leased connection and fails with an interface error once released.
#[async_trait]
pub trait Executor: Send {
    /// Run `query` through the statement cache.
    async fn fetch_with(
        &mut self,
        query: &str,
        args: &[PgValue],
        options: &QueryOptions,
    ) -> PgResult<QueryResult>;

    /// Execute `query`, returning the command tag of the last statement.
    async fn execute(&mut self, query: &str, args: &[PgValue]) -> PgResult<String>;

    async fn simple_query(&mut self, query: &str) -> PgResult<Vec<QueryResult>>;

    async fn prepare(&mut self, query: &str) -> PgResult<PreparedStatement>;

    async fn fetch_prepared(
        &mut self,
        statement: &PreparedStatement,
        args: &[PgValue],
    ) -> PgResult<QueryResult>;

    fn is_in_transaction(&self) -> bool;

    fn is_closed(&self) -> bool;

    async fn fetch(&mut self, query: &str, args: &[PgValue]) -> PgResult<Vec<Row>> {
        let result = self.fetch_with(query, args, &QueryOptions::default()).await?;
        Ok(result.rows)
    }

    /// First row, if any.
    async fn fetchrow(&mut self, query: &str, args: &[PgValue]) -> PgResult<Option<Row>> {
        Ok(self.fetch(query, args).await?.into_iter().next())
    }

    /// First column of the first row, if any.
    async fn fetchval(&mut self, query: &str, args: &[PgValue]) -> PgResult<Option<PgValue>> {
        Ok(self
            .fetchrow(query, args)
            .await?
            .and_then(|row| row.into_iter().next()))
    }
}

#[async_trait]
impl Executor for Connection {
    async fn fetch_with(
        &mut self,
        query: &str,
        args: &[PgValue],
        options: &QueryOptions,
    ) -> PgResult<QueryResult> {
        Connection::fetch_with(self, query, args, options).await
    }

    async fn execute(&mut self, query: &str, args: &[PgValue]) -> PgResult<String> {
        Connection::execute(self, query, args).await
    }

    async fn simple_query(&mut self, query: &str) -> PgResult<Vec<QueryResult>> {
        Connection::simple_query(self, query).await
    }

    async fn prepare(&mut self, query: &str) -> PgResult<PreparedStatement> {
        Connection::prepare(self, query).await
    }

    async fn fetch_prepared(
        &mut self,
        statement: &PreparedStatement,
        args: &[PgValue],
    ) -> PgResult<QueryResult> {
        Connection::fetch_prepared(self, statement, args).await
    }

    fn is_in_transaction(&self) -> bool {
        Connection::is_in_transaction(self)
    }

    fn is_closed(&self) -> bool {
        Connection::is_closed(self)
    }
}
