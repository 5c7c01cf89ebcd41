//! Row-mapping view over a handle's pool.
//!
//! For callers that would rather map rows into structs than walk raw
//! `MySqlRow`s. Everything here runs against the same pool that
//! [`ConnectionHandle::pool`](crate::ConnectionHandle::pool) returns.

use sqlx::mysql::{MySql, MySqlPool, MySqlRow};
use sqlx::{FromRow, QueryBuilder, Transaction};

/// Borrowed, read-only view onto a pool.
#[derive(Debug, Clone, Copy)]
pub struct Orm<'a> {
    pool: &'a MySqlPool,
}

impl<'a> Orm<'a> {
    pub(crate) fn new(pool: &'a MySqlPool) -> Self {
        Self { pool }
    }

    /// Run `sql` and map every row into `T`.
    pub async fn find_all<T>(&self, sql: &str) -> Result<Vec<T>, sqlx::Error>
    where
        T: for<'r> FromRow<'r, MySqlRow> + Send + Unpin,
    {
        sqlx::query_as::<_, T>(sql).fetch_all(self.pool).await
    }

    /// Run `sql` and map the first row, if any, into `T`.
    pub async fn find_optional<T>(&self, sql: &str) -> Result<Option<T>, sqlx::Error>
    where
        T: for<'r> FromRow<'r, MySqlRow> + Send + Unpin,
    {
        sqlx::query_as::<_, T>(sql).fetch_optional(self.pool).await
    }

    /// Execute a statement, returning the number of affected rows.
    pub async fn exec(&self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(sql).execute(self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Start a transaction on a connection taken from the pool.
    ///
    /// Pair with [`clear_transaction`](crate::clear_transaction) for cleanup
    /// on early-return paths.
    pub async fn begin(&self) -> Result<Transaction<'static, MySql>, sqlx::Error> {
        self.pool.begin().await
    }

    /// New MySQL `QueryBuilder` seeded with `init`. The builder does not hold
    /// the pool; run its query against [`Orm::pool`].
    pub fn builder<'q>(&self, init: impl Into<String>) -> QueryBuilder<'q, MySql> {
        QueryBuilder::new(init)
    }

    pub fn pool(&self) -> &'a MySqlPool {
        self.pool
    }
}
