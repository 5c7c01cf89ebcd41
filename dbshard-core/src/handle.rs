//! A single pooled connection to one MySQL target.
//!
//! Opening is fail-fast: the pool is created and pinged once, and any error
//! is returned to the caller without retrying. While the handle lives, a
//! supervised background task pings the pool every keepalive period so idle
//! connections are exercised; reconnecting is left to the pool itself.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::Connection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::error::{Result, ShardError};
use crate::orm::Orm;
use crate::supervisor::spawn_supervised;

/// sqlx's own default for `max_connections`.
const DRIVER_MAX_CONNECTIONS: u32 = 10;

/// Connections idle longer than this are closed down to the idle cap.
const IDLE_REAP_AFTER: Duration = Duration::from_secs(60);

/// One open, health-monitored pool.
///
/// `close` consumes the handle, so it can only be called once. Dropping a
/// handle without closing it still stops its liveness probe.
#[derive(Debug)]
pub struct ConnectionHandle {
    pool: MySqlPool,
    config: ConnectionConfig,
    keepalive: Duration,
    shutdown: watch::Sender<bool>,
    probe: JoinHandle<()>,
}

impl ConnectionHandle {
    /// Open and ping `config`'s target, then start its liveness probe.
    pub async fn open(config: ConnectionConfig) -> Result<Self> {
        if config.connection_string.is_empty() {
            return Err(ShardError::empty_connection_string(&config.id));
        }

        info!(id = %config.id, target = %config.redacted_target(), "connecting to mysql");

        let pool = pool_options(&config)
            .connect(&config.connection_string)
            .await
            .map_err(|source| ShardError::Connect {
                id: config.id.clone(),
                source,
            })?;

        if let Err(source) = pool.ping().await {
            pool.close().await;
            return Err(ShardError::Ping {
                id: config.id.clone(),
                source,
            });
        }

        let handle = Self::start(pool, config);
        info!(id = %handle.config.id, keepalive = ?handle.keepalive, "connected to mysql");
        Ok(handle)
    }

    /// Wrap an already opened pool and start probing it.
    pub(crate) fn start(pool: MySqlPool, config: ConnectionConfig) -> Self {
        let keepalive = config.keepalive();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let probe = spawn_supervised(run_probe(
            config.id.clone(),
            pool.clone(),
            keepalive,
            shutdown_rx,
        ));

        Self {
            pool,
            config,
            keepalive,
            shutdown,
            probe,
        }
    }

    /// Raw pool for direct query execution.
    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    /// Typed row-mapping view onto the same pool.
    pub fn orm(&self) -> Orm<'_> {
        Orm::new(&self.pool)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Normalized probe period.
    pub fn keepalive(&self) -> Duration {
        self.keepalive
    }

    pub fn is_probe_running(&self) -> bool {
        !self.probe.is_finished()
    }

    /// Stop the liveness probe, wait for it to exit, then close the pool.
    pub async fn close(self) -> Result<()> {
        let Self {
            pool,
            config,
            shutdown,
            probe,
            ..
        } = self;

        let _ = shutdown.send(true);
        drop(shutdown);
        let joined = probe.await;

        pool.close().await;
        info!(id = %config.id, "mysql connection closed");

        joined.map_err(|e| ShardError::ProbeTask(e.to_string()))
    }
}

fn pool_options(config: &ConnectionConfig) -> MySqlPoolOptions {
    let mut options = MySqlPoolOptions::new();
    if let Some(max_open) = config.max_open() {
        options = options.max_connections(max_open);
    }
    if let Some(max_idle) = config.max_idle() {
        let max_open = config.max_open().unwrap_or(DRIVER_MAX_CONNECTIONS);
        options = options
            .min_connections(max_idle.min(max_open))
            .idle_timeout(IDLE_REAP_AFTER);
    }
    options
}

/// Something the liveness probe can ping.
#[async_trait]
pub(crate) trait Ping: Send + Sync + 'static {
    async fn ping(&self) -> std::result::Result<(), sqlx::Error>;
}

#[async_trait]
impl Ping for MySqlPool {
    async fn ping(&self) -> std::result::Result<(), sqlx::Error> {
        let mut conn = self.acquire().await?;
        conn.ping().await
    }
}

/// Ping every `every` until `shutdown` fires or its sender is dropped.
async fn run_probe<P: Ping>(
    id: String,
    target: P,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick completes immediately; the open path already pinged
    ticker.tick().await;

    // shutdown wins ties with a ready tick and abandons an in-flight ping
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    result = target.ping() => {
                        if let Err(e) = result {
                            debug!(%id, error = %e, "mysql ping failed");
                        }
                    }
                }
            }
        }
    }

    debug!(%id, "liveness probe stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct CountingPing {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Ping for CountingPing {
        async fn ping(&self) -> std::result::Result<(), sqlx::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(sqlx::Error::PoolTimedOut)
            } else {
                Ok(())
            }
        }
    }

    /// Every ping outlives the keepalive period.
    struct StuckPing {
        started: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Ping for StuckPing {
        async fn ping(&self) -> std::result::Result<(), sqlx::Error> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_open_rejects_empty_connection_string() {
        let err = ConnectionHandle::open(ConnectionConfig::new("empty", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::EmptyConnectionString { ref id } if id == "empty"));
    }

    #[tokio::test]
    async fn test_open_fails_fast_on_bad_target() {
        let err = ConnectionHandle::open(ConnectionConfig::new("bad", "not a connection url"))
            .await
            .unwrap_err();
        assert!(matches!(err, ShardError::Connect { ref id, .. } if id == "bad"));
    }

    #[test]
    fn test_pool_options_caps() {
        let mut config = ConnectionConfig::new("a", "mysql://localhost/db");
        let options = pool_options(&config);
        assert_eq!(options.get_max_connections(), DRIVER_MAX_CONNECTIONS);
        assert_eq!(options.get_min_connections(), 0);

        config.pool_size = 4;
        config.idle_size = 8;
        let options = pool_options(&config);
        assert_eq!(options.get_max_connections(), 4);
        // idle cap never exceeds the open cap
        assert_eq!(options.get_min_connections(), 4);
        assert_eq!(options.get_idle_timeout(), Some(IDLE_REAP_AFTER));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_pings_every_interval() {
        let target = CountingPing::default();
        let calls = target.calls.clone();
        let (tx, rx) = watch::channel(false);

        let probe = tokio::spawn(run_probe("p".into(), target, Duration::from_secs(2), rx));

        tokio::time::sleep(Duration::from_millis(6_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tx.send(true).unwrap();
        probe.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_ignores_ping_failures() {
        let target = CountingPing {
            fail: true,
            ..Default::default()
        };
        let calls = target.calls.clone();
        let (tx, rx) = watch::channel(false);

        let probe = tokio::spawn(run_probe("p".into(), target, Duration::from_secs(1), rx));
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(!probe.is_finished());

        drop(tx);
        probe.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_slow_ping() {
        let started = Arc::new(AtomicUsize::new(0));
        let target = StuckPing {
            started: started.clone(),
        };
        let (tx, rx) = watch::channel(false);
        let probe = tokio::spawn(run_probe("slow".into(), target, Duration::from_secs(1), rx));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        let signalled = tokio::time::Instant::now();
        probe.await.unwrap();

        assert!(signalled.elapsed() < Duration::from_millis(100));
        // no further ping started once shutdown was requested
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wins_over_ready_tick() {
        let started = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = watch::channel(false);
        // request shutdown before the task first runs, so a tick is ready too
        tx.send(true).unwrap();
        let probe = tokio::spawn(run_probe(
            "tie".into(),
            StuckPing {
                started: started.clone(),
            },
            Duration::from_millis(1),
            rx,
        ));
        tokio::time::sleep(Duration::from_millis(5)).await;

        probe.await.unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_exits_when_sender_dropped() {
        let (tx, rx) = watch::channel(false);
        let probe = tokio::spawn(run_probe(
            "p".into(),
            CountingPing::default(),
            Duration::from_secs(300),
            rx,
        ));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), probe)
            .await
            .expect("probe should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_waits_for_probe() {
        let pool = MySqlPoolOptions::new()
            .connect_lazy("mysql://root@127.0.0.1:3306/tmpdb")
            .unwrap();
        let handle = ConnectionHandle::start(pool, ConnectionConfig::new("lazy", "mysql://root@127.0.0.1:3306/tmpdb"));

        assert_eq!(handle.id(), "lazy");
        assert_eq!(handle.keepalive(), Duration::from_secs(300));
        assert!(handle.is_probe_running());

        handle.close().await.unwrap();
    }
}
