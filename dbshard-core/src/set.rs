//! Tagged, ordered sets of connection handles and the routing over them.
//!
//! A set is built once from a [`ShardsConfig`] and never changes afterwards,
//! so it can be shared behind an `Arc` and read concurrently without locks.
//! Within a tag, handles are ordered by config `ID` descending. Index-based
//! routing depends on that position, so the same configuration always yields
//! the same assignment, across restarts and regardless of map order.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, ShardsConfig};
use crate::error::{Result, ShardError};
use crate::handle::ConnectionHandle;
use crate::hash::ShardKey;

/// Opens (and closes) the handles a set is built from.
#[async_trait]
pub trait Connector: Send + Sync {
    type Handle: Send + Sync + 'static;

    async fn open(&self, config: ConnectionConfig) -> Result<Self::Handle>;

    async fn close(&self, handle: Self::Handle) -> Result<()>;
}

/// Opens real MySQL pools via [`ConnectionHandle::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlConnector;

#[async_trait]
impl Connector for MySqlConnector {
    type Handle = ConnectionHandle;

    async fn open(&self, config: ConnectionConfig) -> Result<ConnectionHandle> {
        ConnectionHandle::open(config).await
    }

    async fn close(&self, handle: ConnectionHandle) -> Result<()> {
        handle.close().await
    }
}

/// Tag -> ordered handles.
#[derive(Debug)]
pub struct ConnectionSet<H = ConnectionHandle> {
    instances: HashMap<String, Vec<H>>,
}

impl ConnectionSet<ConnectionHandle> {
    /// Open every configured MySQL target. Any failure aborts the build.
    pub async fn build(configs: ShardsConfig) -> Result<Self> {
        Self::build_with(&MySqlConnector, configs).await
    }

    /// Close every handle, returning the first error encountered.
    pub async fn close_all(self) -> Result<()> {
        let closes = self
            .instances
            .into_iter()
            .flat_map(|(tag, pool)| pool.into_iter().map(move |handle| (tag.clone(), handle)))
            .map(|(tag, handle)| async move {
                let id = handle.id().to_string();
                handle.close().await.map_err(|e| {
                    warn!(%tag, %id, error = %e, "failed to close connection");
                    e
                })
            });

        join_all(closes).await.into_iter().collect::<Result<Vec<_>>>()?;
        info!("all connections closed");
        Ok(())
    }
}

impl ConnectionSet<ConnectionConfig> {
    /// The routing layout of `configs` without opening any connection.
    pub fn plan(configs: ShardsConfig) -> Result<Self> {
        let instances: HashMap<_, _> = layout(configs).into_iter().collect();
        Self::from_instances(instances)
    }
}

impl<H> ConnectionSet<H> {
    /// Build with a custom [`Connector`].
    ///
    /// Handles opened before a failure are closed again before the error is
    /// returned, so a failed build leaks nothing.
    pub async fn build_with<C>(connector: &C, configs: ShardsConfig) -> Result<Self>
    where
        C: Connector<Handle = H>,
        H: Send + Sync + 'static,
    {
        let mut instances: HashMap<String, Vec<H>> = HashMap::new();

        for (tag, configs) in layout(configs) {
            for config in configs {
                let id = config.id.clone();
                match connector.open(config).await {
                    Ok(handle) => {
                        debug!(%tag, %id, "opened shard handle");
                        instances.entry(tag.clone()).or_default().push(handle);
                    }
                    Err(e) => {
                        warn!(%tag, %id, error = %e, "shard open failed, closing opened handles");
                        let opened = instances.into_values().flatten().map(|h| connector.close(h));
                        for result in join_all(opened).await {
                            if let Err(close_err) = result {
                                debug!(error = %close_err, "close after failed build");
                            }
                        }
                        return Err(e);
                    }
                }
            }
        }

        let set = Self::from_instances(instances)?;
        info!(tags = set.instances.len(), handles = set.len(), "connection set ready");
        Ok(set)
    }

    /// Wrap pre-ordered pools; empty pools are dropped.
    pub fn from_instances(mut instances: HashMap<String, Vec<H>>) -> Result<Self> {
        instances.retain(|_, pool| !pool.is_empty());
        if instances.is_empty() {
            return Err(ShardError::NoConnections);
        }
        Ok(Self { instances })
    }

    /// Select a handle for `tag`: index 0 without a key, otherwise
    /// [`ShardKey::bucket`]. `None` when the tag is unknown.
    pub fn get(&self, tag: &str, key: Option<ShardKey>) -> Option<&H> {
        let pool = self.instances.get(tag)?;
        let idx = key.map_or(0, |key| key.bucket(pool.len()));
        pool.get(idx)
    }

    /// `get` with a key given as anything convertible to [`ShardKey`].
    pub fn route(&self, tag: &str, key: impl Into<ShardKey>) -> Option<&H> {
        self.get(tag, Some(key.into()))
    }

    /// Visit every `(tag, index, handle)` once. Tag order is unspecified;
    /// indices within a tag are visited in order.
    pub fn for_each<F>(&self, mut cb: F)
    where
        F: FnMut(&str, usize, &H),
    {
        for (tag, pool) in &self.instances {
            for (idx, handle) in pool.iter().enumerate() {
                cb(tag, idx, handle);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, usize, &H)> + '_ {
        self.instances.iter().flat_map(|(tag, pool)| {
            pool.iter()
                .enumerate()
                .map(move |(idx, handle)| (tag.as_str(), idx, handle))
        })
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> + '_ {
        self.instances.keys().map(String::as_str)
    }

    /// Number of handles serving `tag`, 0 when unknown.
    pub fn pool_len(&self, tag: &str) -> usize {
        self.instances.get(tag).map_or(0, Vec::len)
    }

    /// Total handles across all tags.
    pub fn len(&self) -> usize {
        self.instances.values().map(Vec::len).sum()
    }

    /// True when the set holds no handles; never the case for a built set.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tags in name order, each with its configs sorted by `ID` descending.
fn layout(configs: ShardsConfig) -> Vec<(String, Vec<ConnectionConfig>)> {
    let mut tags: Vec<_> = configs.0.into_iter().collect();
    tags.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, configs) in &mut tags {
        sort_configs(configs);
    }
    tags
}

/// Stable sort by `ID`, descending.
pub fn sort_configs(configs: &mut [ConnectionConfig]) {
    configs.sort_by(|a, b| b.id.cmp(&a.id));
}
