/**
 * Plumbing shared by the graph, event and log managers
 *
 * `Registry` is the single mutex-guarded table of a manager's subscriptions,
 * each with its own sink, cancellation token and manager-specific state.
 * `ManagerCore` ties it to the supervisor and breaker registry so a manager only
 * decides which sessions to start and what to publish.
 */
use crate::config::Config;
use crate::error::{Error, Result};
use crate::watch::circuit::BreakerRegistry;
use crate::watch::session::{SessionDriver, SessionCounters, SessionStats, WatchSession};
use crate::watch::subscription::{new_subscription_id, Delivery, DeltaSink, DeltaStream};
use crate::watch::supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Subscription<T, S> {
    token: CancellationToken,
    sink: DeltaSink<T>,
    counters: Vec<Arc<SessionCounters>>,
    pub state: S,
}

pub struct Registry<T, S> {
    inner: Arc<Mutex<HashMap<String, Subscription<T, S>>>>,
}

impl<T, S> Clone for Registry<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static, S> Registry<T, S> {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Subscription<T, S>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on a subscription's state and publish what it returns.
    ///
    /// If the consumer has dropped its stream the subscription is cancelled and
    /// removed. Unknown ids are ignored; the subscription may have just ended.
    pub fn publish_with(&self, subscription: &str, f: impl FnOnce(&mut S) -> Option<T>) {
        let mut subs = self.lock();
        let Some(sub) = subs.get_mut(subscription) else {
            return;
        };
        let Some(payload) = f(&mut sub.state) else {
            return;
        };
        if sub.sink.publish(payload) == Delivery::Closed {
            if let Some(sub) = subs.remove(subscription) {
                sub.token.cancel();
            }
            info!(subscription, "consumer went away, subscription closed");
        }
    }

    /// Drop a subscription and cancel its sessions; `false` if it was already gone
    fn remove(&self, subscription: &str) -> bool {
        let Some(sub) = self.lock().remove(subscription) else {
            return false;
        };
        sub.token.cancel();
        true
    }

    /// Run `f` on a subscription's state without publishing
    pub fn with_state<R>(&self, subscription: &str, f: impl FnOnce(&mut S) -> R) -> Option<R> {
        self.lock().get_mut(subscription).map(|sub| f(&mut sub.state))
    }

    #[must_use]
    pub fn contains(&self, subscription: &str) -> bool {
        self.lock().contains_key(subscription)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub struct ManagerCore<T, S> {
    name: &'static str,
    config: Arc<Config>,
    breakers: BreakerRegistry,
    supervisor: Supervisor,
    registry: Registry<T, S>,
}

impl<T: Clone + Send + 'static, S: Send + 'static> ManagerCore<T, S> {
    #[must_use]
    pub fn new(name: &'static str, config: Arc<Config>) -> Self {
        Self {
            name,
            breakers: BreakerRegistry::new(&config.breaker),
            supervisor: Supervisor::new(name),
            registry: Registry::new(),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> Registry<T, S> {
        self.registry.clone()
    }

    #[must_use]
    pub const fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Register a new subscription; sessions are attached with `start_session`
    ///
    /// # Errors
    ///
    /// Returns `Error::ShuttingDown` after `stop`
    pub fn open(&self, state: S) -> Result<(String, DeltaStream<T>)> {
        let token = self.supervisor.subscription_token()?;
        let id = new_subscription_id();
        let (sink, stream) = DeltaSink::channel(&id, self.config.sink_capacity);
        let stream = stream.cancel_on_drop(token.clone());
        self.registry.lock().insert(
            id.clone(),
            Subscription {
                token: token.clone(),
                sink,
                counters: Vec::new(),
                state,
            },
        );

        // the stream may be dropped while nothing is being published
        let registry = self.registry.clone();
        let name = self.name;
        let released = id.clone();
        self.supervisor.spawn_task(async move {
            token.cancelled().await;
            if registry.remove(&released) {
                debug!(manager = name, subscription = %released, "subscription released");
            }
        });
        info!(manager = self.name, subscription = %id, "📡 subscribed");
        Ok((id, stream))
    }

    /// Start one session feeding `subscription`, under the breaker for `resource` in `namespace`
    pub fn start_session<D: SessionDriver>(
        &self,
        subscription: &str,
        resource: &str,
        namespace: Option<&str>,
        driver: D,
    ) {
        let target = format!("{resource}@{}", namespace.unwrap_or("*"));
        let breaker = self.breakers.breaker_for(resource, namespace);

        let session = {
            let mut subs = self.registry.lock();
            let Some(sub) = subs.get_mut(subscription) else {
                return;
            };
            let session = WatchSession::new(
                target,
                driver,
                sub.token.child_token(),
                breaker,
                &self.config,
            );
            sub.counters.push(session.counters());
            session
        };
        self.supervisor.spawn(session);
    }

    /// Cancel one subscription's sessions and close its stream; siblings are untouched
    ///
    /// # Errors
    ///
    /// Returns `Error::UnknownSubscription` if the id is not live
    pub fn close(&self, subscription: &str) -> Result<()> {
        if !self.registry.remove(subscription) {
            return Err(Error::UnknownSubscription(subscription.to_string()));
        }
        info!(manager = self.name, subscription, "unsubscribed");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `Error::UnknownSubscription` if the id is not live
    pub fn session_stats(&self, subscription: &str) -> Result<Vec<SessionStats>> {
        self.registry
            .lock()
            .get(subscription)
            .map(|sub| sub.counters.iter().map(|p| p.snapshot()).collect())
            .ok_or_else(|| Error::UnknownSubscription(subscription.to_string()))
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Sessions still running, as `id (target)`
    #[must_use]
    pub fn live_sessions(&self) -> Vec<String> {
        self.supervisor.live_sessions()
    }

    /// Cancel every session, wait up to `timeout`, then drop all subscriptions
    ///
    /// # Errors
    ///
    /// Returns `Error::ShutdownTimeout` naming the sessions that did not finish in time
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        let result = self.supervisor.stop(timeout).await;
        self.registry.lock().clear();
        result
    }
}
