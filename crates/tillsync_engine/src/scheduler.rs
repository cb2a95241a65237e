//! Deciding when to drain.
//!
//! A single background task waits on, in priority order:
//! - the stop signal
//! - a connectivity transition to online
//! - the periodic interval
//! - a write notification
//! - the earliest backoff deadline in the queue
//!
//! and asks the [`SyncProcessor`] to drain whenever the remote is reachable.

use crate::connectivity::{ConnectivityMonitor, Reachability};
use crate::error::{SyncError, SyncResult};
use crate::processor::SyncProcessor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Why the scheduler woke up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Reconnected,
    Interval,
    Write,
    Backoff,
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Runs drains in the background.
pub struct Scheduler {
    processor: Arc<SyncProcessor>,
    connectivity: ConnectivityMonitor,
    trigger: Arc<Notify>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("interval", &self.interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates a stopped scheduler.
    pub fn new(
        processor: Arc<SyncProcessor>,
        connectivity: ConnectivityMonitor,
        interval: Duration,
    ) -> Self {
        Self {
            processor,
            connectivity,
            trigger: Arc::new(Notify::new()),
            interval,
            running: Mutex::new(None),
        }
    }

    /// Spawns the background task on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns `NoRuntime` outside a Tokio runtime and `AlreadyStarted` if
    /// the task is already running.
    pub fn start(&self) -> SyncResult<()> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(SyncError::AlreadyStarted);
        }
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;

        let (stop, stop_rx) = watch::channel(false);
        let task = Loop {
            processor: Arc::clone(&self.processor),
            connectivity: self.connectivity.clone(),
            trigger: Arc::clone(&self.trigger),
            interval: self.interval,
        };
        let handle = runtime.spawn(task.run(stop_rx));
        *running = Some(Running { stop, handle });

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "scheduler started");
        Ok(())
    }

    /// Asks for a drain soon. A request made while a drain is running
    /// leads to one more drain after it.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Returns true while the background task is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Signals the task to stop. A drain in progress runs to completion;
    /// no new drain starts. Returns false if the task was not running.
    pub fn stop(&self) -> bool {
        match self.running.lock().as_ref() {
            Some(running) => {
                running.stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Stops the task and waits for it to exit.
    ///
    /// # Errors
    ///
    /// Returns `TaskFailed` if the task panicked.
    pub async fn stop_and_wait(&self) -> SyncResult<()> {
        let Some(running) = self.running.lock().take() else {
            return Ok(());
        };
        running.stop.send_replace(true);
        running
            .handle
            .await
            .map_err(|e| SyncError::TaskFailed(e.to_string()))?;
        tracing::info!("scheduler stopped");
        Ok(())
    }
}

struct Loop {
    processor: Arc<SyncProcessor>,
    connectivity: ConnectivityMonitor,
    trigger: Arc<Notify>,
    interval: Duration,
}

impl Loop {
    async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut reachability = self.connectivity.subscribe();
        reachability.borrow_and_update();
        let mut watching_reachability = true;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let backoff = self.until_next_retry();
            let wake = tokio::select! {
                biased;

                _ = stop.changed() => break,

                changed = reachability.changed(), if watching_reachability => {
                    if changed.is_err() {
                        watching_reachability = false;
                        continue;
                    }
                    if *reachability.borrow_and_update() != Reachability::Online {
                        continue;
                    }
                    Wake::Reconnected
                }

                _ = ticker.tick() => Wake::Interval,

                _ = self.trigger.notified() => Wake::Write,

                _ = sleep_for(backoff), if backoff.is_some() => Wake::Backoff,
            };

            if *stop.borrow() {
                break;
            }
            if !self.connectivity.is_online() {
                tracing::trace!(?wake, "offline; drain skipped");
                continue;
            }

            tracing::trace!(?wake, "drain requested");
            if let Err(e) = self.processor.drain().await {
                tracing::error!(error = %e, ?wake, "scheduled drain failed");
            }
        }
    }

    fn until_next_retry(&self) -> Option<Duration> {
        let db = self.processor.db();
        let deadline = db.next_retry_at()?;
        Some(Duration::from_millis(deadline.saturating_sub(db.now())))
    }
}

async fn sleep_for(duration: Option<Duration>) {
    if let Some(duration) = duration {
        tokio::time::sleep(duration).await;
    }
}
