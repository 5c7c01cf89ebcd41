//! dbshard-core: tagged, sharded MySQL connection handles.
//!
//! ```text
//! ShardsConfig ──build──▶ ConnectionSet
//!                           ├── "orders" → [handle(id=b), handle(id=a)]
//!                           └── "users"  → [handle(id=u1)]
//!                                              └── liveness probe (supervised task)
//! ```
//!
//! Callers route with [`ConnectionSet::get`] / [`ConnectionSet::route`] and
//! run queries straight on the returned handle's pool.

pub mod config;
pub mod error;
pub mod handle;
pub mod hash;
pub mod lifecycle;
pub mod orm;
pub mod set;
pub mod supervisor;
pub mod tx;

#[cfg(test)]
mod test_support;

pub use config::{ConnectionConfig, ShardsConfig, DEFAULT_KEEPALIVE};
pub use error::{Result, ShardError};
pub use handle::ConnectionHandle;
pub use hash::{hash, ShardKey};
pub use lifecycle::{ProcessLifecycle, Signal};
pub use orm::Orm;
pub use set::{ConnectionSet, Connector, MySqlConnector};
pub use supervisor::{catch_panics, run_supervised, spawn_supervised, PanicReport};
pub use tx::{clear_transaction, Rollback};
