//! Connectivity monitoring.
//!
//! The [`ConnectivityMonitor`] holds the current reachability of the remote
//! in a `watch` channel. Platform adapters call
//! [`ConnectivityMonitor::set_online`]; [`spawn_probe`] can feed it from a
//! [`ReachabilityProbe`] instead.

use crate::error::SyncResult;
use crate::subscription::Subscription;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;

/// Whether the remote can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reachability {
    /// The remote is reachable.
    Online,
    /// The remote is not reachable.
    Offline,
}

impl Reachability {
    /// Returns true for `Online`.
    #[must_use]
    pub fn is_online(self) -> bool {
        self == Reachability::Online
    }
}

impl From<bool> for Reachability {
    fn from(online: bool) -> Self {
        if online {
            Reachability::Online
        } else {
            Reachability::Offline
        }
    }
}

impl std::fmt::Display for Reachability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reachability::Online => write!(f, "online"),
            Reachability::Offline => write!(f, "offline"),
        }
    }
}

/// Shared view of remote reachability.
///
/// Cloning yields another handle on the same state.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<Reachability>>,
}

impl ConnectivityMonitor {
    /// Creates a monitor in the given state.
    #[must_use]
    pub fn new(initial: Reachability) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            state: Arc::new(tx),
        }
    }

    /// Creates a monitor that starts online.
    #[must_use]
    pub fn online() -> Self {
        Self::new(Reachability::Online)
    }

    /// Creates a monitor that starts offline.
    #[must_use]
    pub fn offline() -> Self {
        Self::new(Reachability::Offline)
    }

    /// Records the platform's view. Returns true if the state changed.
    ///
    /// Repeating the current state notifies nobody.
    pub fn set_online(&self, online: bool) -> bool {
        let next = Reachability::from(online);
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::info!(state = %next, "connectivity changed");
        }
        changed
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> Reachability {
        *self.state.borrow()
    }

    /// Returns true if the remote is currently reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// A receiver that observes every transition (coalesced, latest wins).
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.state.subscribe()
    }

    /// Runs `callback` on every transition until the subscription is dropped.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` outside a Tokio runtime.
    pub fn on_transition<F>(&self, callback: F) -> SyncResult<Subscription>
    where
        F: Fn(Reachability) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        rx.borrow_and_update();
        Subscription::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                callback(state);
            }
        })
    }
}

/// An active check of remote reachability.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Returns true if the remote answered.
    async fn probe(&self) -> bool;
}

/// Probes by opening a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    addr: String,
    timeout: Duration,
}

impl TcpProbe {
    /// Probes `addr` (`host:port`) with a 3 second connect timeout.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(3),
        }
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl ReachabilityProbe for TcpProbe {
    async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                tracing::debug!(addr = %self.addr, error = %e, "probe failed");
                false
            }
            Err(_) => {
                tracing::debug!(addr = %self.addr, "probe timed out");
                false
            }
        }
    }
}

/// Polls `probe` every `every` and feeds the result into `monitor`.
///
/// Polling stops when the returned subscription is dropped.
pub fn spawn_probe(
    monitor: ConnectivityMonitor,
    probe: Arc<dyn ReachabilityProbe>,
    every: Duration,
) -> SyncResult<Subscription> {
    Subscription::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reachable = probe.probe().await;
            monitor.set_online(reachable);
        }
    })
}
