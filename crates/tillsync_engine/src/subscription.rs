//! Handles for callback subscriptions.

use crate::error::{SyncError, SyncResult};
use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// A running callback subscription.
///
/// Delivery stops when the handle is dropped or
/// [`unsubscribe`](Self::unsubscribe) is called.
#[derive(Debug)]
#[must_use = "dropping a Subscription stops its callback"]
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn<F>(task: F) -> SyncResult<Self>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let runtime = Handle::try_current().map_err(|_| SyncError::NoRuntime)?;
        Ok(Self {
            handle: runtime.spawn(task),
        })
    }

    /// Stops delivery.
    pub fn unsubscribe(self) {}

    /// Returns true while the callback task is alive.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
