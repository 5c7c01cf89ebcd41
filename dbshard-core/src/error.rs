//! Structured error types for dbshard-core.
//!
//! Uses `thiserror` so library consumers can branch on the failure kind.
//! The `dbshard` binary wraps these in `anyhow` at the edges and decides
//! which of them are fatal for the process.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for dbshard-core operations
#[derive(Error, Debug)]
pub enum ShardError {
    /// A connection config without a target cannot be opened
    #[error("invalid ConnString for connection '{id}': connection string is empty")]
    EmptyConnectionString { id: String },

    /// Opening the pool to a target failed
    #[error("failed to connect '{id}': {source}")]
    Connect {
        id: String,
        #[source]
        source: sqlx::Error,
    },

    /// The initial health ping after opening failed
    #[error("initial ping failed for '{id}': {source}")]
    Ping {
        id: String,
        #[source]
        source: sqlx::Error,
    },

    /// A connection set was built from a configuration with zero targets
    #[error("invalid shard configuration: 0 connection configs")]
    NoConnections,

    /// Configuration content is semantically invalid
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Configuration file could not be read
    #[error("failed to read config {path:?}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration file could not be parsed
    #[error("failed to parse config {path:?}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    /// Rollback on a transaction that was already committed or rolled back
    #[error("transaction has already been committed or rolled back")]
    TransactionDone,

    /// Error reported by the database driver
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The liveness probe task ended abnormally
    #[error("liveness probe task failed: {0}")]
    ProbeTask(String),

    /// Installing OS signal listeners failed
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] io::Error),
}

/// Result type alias for dbshard-core operations
pub type Result<T> = std::result::Result<T, ShardError>;

impl ShardError {
    /// Create a config error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a config parse error
    pub fn config_parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ConfigParse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an empty connection string error
    pub fn empty_connection_string(id: impl Into<String>) -> Self {
        Self::EmptyConnectionString { id: id.into() }
    }

    /// True for the benign "already finished" rollback outcome
    pub fn is_transaction_done(&self) -> bool {
        matches!(self, Self::TransactionDone)
    }
}
