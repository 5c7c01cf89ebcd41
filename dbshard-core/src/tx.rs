//! Best-effort transaction cleanup.

use async_trait::async_trait;
use sqlx::mysql::MySql;
use sqlx::Transaction;
use tracing::error;

use crate::error::{Result, ShardError};

/// A transaction that can be rolled back.
///
/// `Option<T>` models a transaction slot that is emptied on commit: rolling
/// back an empty slot reports [`ShardError::TransactionDone`].
#[async_trait]
pub trait Rollback: Send {
    async fn rollback(self) -> Result<()>;
}

#[async_trait]
impl<'c> Rollback for Transaction<'c, MySql> {
    async fn rollback(self) -> Result<()> {
        Transaction::rollback(self).await.map_err(ShardError::from)
    }
}

#[async_trait]
impl<T> Rollback for Option<T>
where
    T: Rollback,
{
    async fn rollback(self) -> Result<()> {
        match self {
            Some(tx) => tx.rollback().await,
            None => Err(ShardError::TransactionDone),
        }
    }
}

/// Roll `tx` back, logging any failure other than "already finished".
///
/// The rollback's result is returned as-is so callers can inspect it.
pub async fn clear_transaction<T>(tx: T) -> Result<()>
where
    T: Rollback,
{
    let result = tx.rollback().await;
    if let Err(e) = &result {
        if !e.is_transaction_done() {
            error!(error = %e, "clear transaction failed");
        }
    }
    result
}
