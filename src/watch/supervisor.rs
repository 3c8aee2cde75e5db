//! Task ownership for one manager.
//!
//! Cancellation flows root -> subscription -> session through child
//! `CancellationToken`s. Every spawned session is counted by a `TaskTracker`
//! and listed in a live table until its task finishes, so a timed-out `stop`
//! can name the sessions that did not drain.

use crate::error::{Error, Result};
use crate::watch::session::{SessionDriver, WatchSession};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

type LiveTable = Arc<Mutex<BTreeMap<String, String>>>;

#[derive(Debug)]
pub struct Supervisor {
    name: &'static str,
    root: CancellationToken,
    tracker: TaskTracker,
    live: LiveTable,
}

/// Removes a session from the live table when its task ends, including on panic
struct LiveGuard {
    live: LiveTable,
    session: String,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session);
    }
}

impl Supervisor {
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
            live: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Token for a new subscription
    ///
    /// # Errors
    ///
    /// Returns `Error::ShuttingDown` once `stop` has been called
    pub fn subscription_token(&self) -> Result<CancellationToken> {
        if self.root.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(self.root.child_token())
    }

    /// Start a session on its own task
    pub fn spawn<D: SessionDriver>(&self, session: WatchSession<D>) {
        let guard = LiveGuard {
            live: self.live.clone(),
            session: session.id().to_string(),
        };
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().to_string(), session.target().to_string());

        self.tracker.spawn(async move {
            let _guard = guard;
            session.run().await;
        });
    }

    /// Start a housekeeping task that `stop` also waits for; it must end on cancellation
    pub fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Sessions whose tasks have not finished yet, as `id (target)`
    #[must_use]
    pub fn live_sessions(&self) -> Vec<String> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, target)| format!("{id} ({target})"))
            .collect()
    }

    /// Cancel everything and wait up to `timeout` for all sessions to finish
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutdownTimeout` naming the stragglers if the wait times out
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        info!(manager = self.name, sessions = self.live_sessions().len(), "🛑 stopping");
        self.root.cancel();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            info!(manager = self.name, "all sessions drained");
            return Ok(());
        }

        let stragglers = self.live_sessions();
        warn!(
            manager = self.name,
            count = stragglers.len(),
            "shutdown timed out: {}",
            stragglers.join(", ")
        );
        Err(Error::ShutdownTimeout { stragglers })
    }
}
