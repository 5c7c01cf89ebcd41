//! OS signal forwarding, installed at most once per lifecycle object.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::error::{Result, ShardError};
use crate::supervisor::run_supervised;

/// Signals forwarded to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Hangup,
    Interrupt,
    Terminate,
    Quit,
}

impl Signal {
    /// Signals that conventionally ask the process to stop.
    pub fn is_shutdown(self) -> bool {
        !matches!(self, Signal::Hangup)
    }
}

/// Owned by the top-level application; holds whether signal listeners have
/// been installed.
#[derive(Debug, Default)]
pub struct ProcessLifecycle {
    installed: AtomicBool,
}

impl ProcessLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Listen for signals and forward each one to `handler` until it returns
    /// `ControlFlow::Break`.
    ///
    /// Returns `Ok(false)` straight away if listeners were already installed
    /// by an earlier call. A panicking handler is logged and listening goes on.
    pub async fn handle_signals<F>(&self, mut handler: F) -> Result<bool>
    where
        F: FnMut(Signal) -> ControlFlow<()>,
    {
        if self.installed.swap(true, Ordering::SeqCst) {
            debug!("signal handler already installed");
            return Ok(false);
        }

        let mut listener = Listener::install().map_err(ShardError::Signal)?;
        while let Some(sig) = listener.recv().await {
            debug!(signal = ?sig, "recv signal");
            match run_supervised(|| handler(sig)) {
                Ok(ControlFlow::Break(())) => break,
                Ok(ControlFlow::Continue(())) | Err(_) => {}
            }
        }
        Ok(true)
    }
}

#[cfg(unix)]
struct Listener {
    hangup: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Listener {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> Option<Signal> {
        tokio::select! {
            s = self.hangup.recv() => s.map(|_| Signal::Hangup),
            s = self.interrupt.recv() => s.map(|_| Signal::Interrupt),
            s = self.terminate.recv() => s.map(|_| Signal::Terminate),
            s = self.quit.recv() => s.map(|_| Signal::Quit),
        }
    }
}

#[cfg(not(unix))]
struct Listener;

#[cfg(not(unix))]
impl Listener {
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Option<Signal> {
        tokio::signal::ctrl_c().await.ok().map(|_| Signal::Interrupt)
    }
}
