/**
 * Event manager
 *
 * Streams namespace events to subscribers. The first session to either open a
 * primary watch or hit a fallback-triggering list/watch error decides between
 * `events.k8s.io/v1` and core `v1` events for the lifetime of the manager.
 */
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::record::{EventApi, EventChange, EventRecord};
use crate::k8s::remote::{RawEvent, RemoteApi, ResourceKind};
use crate::watch::circuit::CircuitState;
use crate::watch::manager::{ManagerCore, Registry};
use crate::watch::session::{SessionDriver, SessionStats};
use crate::watch::subscription::DeltaStream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Breaker and session target, independent of which event API ends up in use
const EVENTS_RESOURCE: &str = "events";

/// Which events a subscriber wants; all filters but `namespace` are applied locally
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventSpec {
    /// `None` watches all namespaces
    pub namespace: Option<String>,
    pub involved_kind: Option<String>,
    pub involved_name: Option<String>,
    /// Event types such as `Warning`; empty means all
    pub types: Vec<String>,
}

impl EventSpec {
    fn validate(&self) -> Result<()> {
        if self.namespace.as_deref() == Some("") {
            return Err(Error::InvalidSpec(
                "namespace must not be empty; omit it to watch all namespaces".into(),
            ));
        }
        if self.involved_name.is_some() && self.involved_kind.is_none() {
            return Err(Error::InvalidSpec("involvedName requires involvedKind".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn matches(&self, record: &EventRecord) -> bool {
        let involved = &record.involved_object;
        self.involved_kind.as_ref().is_none_or(|k| &involved.kind == k)
            && self.involved_name.as_ref().is_none_or(|n| &involved.name == n)
            && (self.types.is_empty() || self.types.contains(&record.type_))
    }
}

/// Per-subscription state: the filter and the resource version last delivered per event uid
struct EventState {
    spec: EventSpec,
    seen: HashMap<String, String>,
}

impl EventState {
    /// Added or modified, unless this exact version was already delivered
    fn observe(&mut self, record: EventRecord) -> Option<EventChange> {
        if !self.spec.matches(&record) {
            return None;
        }
        match self.seen.get(&record.uid) {
            Some(rv) if !rv.is_empty() && *rv == record.resource_version => None,
            Some(_) => {
                self.seen.insert(record.uid.clone(), record.resource_version.clone());
                Some(EventChange::Modified(record))
            }
            None => {
                self.seen.insert(record.uid.clone(), record.resource_version.clone());
                Some(EventChange::Added(record))
            }
        }
    }

    fn forget(&mut self, record: EventRecord) -> Option<EventChange> {
        if !self.spec.matches(&record) {
            return None;
        }
        self.seen.remove(&record.uid);
        Some(EventChange::Deleted(record))
    }
}

/// Shared between all sessions of one manager
struct ApiChoice {
    primary: ResourceKind,
    fallback: ResourceKind,
    chosen: OnceLock<EventApi>,
}

impl ApiChoice {
    fn kind(&self, api: EventApi) -> &ResourceKind {
        match api {
            EventApi::Primary => &self.primary,
            EventApi::Fallback => &self.fallback,
        }
    }

    fn decide(&self, api: EventApi) -> EventApi {
        let chosen = *self.chosen.get_or_init(|| {
            info!(api = ?api, "event API selected");
            api
        });
        chosen
    }
}

struct EventDriver {
    remote: Arc<dyn RemoteApi>,
    choice: Arc<ApiChoice>,
    /// API the current stream reads from
    active: EventApi,
    namespace: Option<String>,
    subscription: String,
    registry: Registry<EventChange, EventState>,
}

impl EventDriver {
    /// List then open the watch through `api`. The listed records are returned
    /// unpublished so nothing is delivered from an API that cannot be watched.
    async fn open(
        &mut self,
        api: EventApi,
    ) -> Result<(Vec<EventRecord>, BoxStream<'static, Result<RawEvent>>)> {
        self.active = api;
        let kind = self.choice.kind(api);
        let ns = self.namespace.as_deref();
        let list = self.remote.list(kind, ns).await?;
        let stream = self.remote.watch(kind, ns, &list.resource_version).await?;
        let records = list.items.iter().filter_map(|o| self.normalize(o)).collect();
        Ok((records, stream))
    }

    /// Open through the decided API, deciding it first if nobody has yet
    async fn open_decided(
        &mut self,
    ) -> Result<(Vec<EventRecord>, BoxStream<'static, Result<RawEvent>>)> {
        if let Some(api) = self.choice.chosen.get().copied() {
            return self.open(api).await;
        }

        match self.open(EventApi::Primary).await {
            Ok(opened) => {
                if self.choice.decide(EventApi::Primary) == EventApi::Primary {
                    return Ok(opened);
                }
            }
            Err(e) if e.class().triggers_fallback() => {
                warn!(
                    subscription = %self.subscription,
                    primary = %self.choice.primary,
                    fallback = %self.choice.fallback,
                    "primary event API unavailable ({e}), falling back"
                );
            }
            Err(e) => return Err(e),
        }
        let api = self.choice.decide(EventApi::Fallback);
        self.open(api).await
    }

    fn normalize(&self, obj: &DynamicObject) -> Option<EventRecord> {
        match EventRecord::from_object(self.active, obj) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(subscription = %self.subscription, "skipping malformed event: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl SessionDriver for EventDriver {
    type Item = RawEvent;

    async fn connect(&mut self) -> Result<BoxStream<'static, Result<RawEvent>>> {
        let (records, stream) = self.open_decided().await?;

        let listed: HashSet<String> = records.iter().map(|r| r.uid.clone()).collect();
        self.registry.with_state(&self.subscription, |state| {
            state.seen.retain(|uid, _| listed.contains(uid));
        });
        for record in records {
            self.registry
                .publish_with(&self.subscription, |state| state.observe(record));
        }
        Ok(stream)
    }

    fn handle(&mut self, event: RawEvent) {
        let (obj, deleted) = match &event {
            RawEvent::Added(obj) | RawEvent::Modified(obj) => (obj, false),
            RawEvent::Deleted(obj) => (obj, true),
            RawEvent::Bookmark(_) => return,
        };
        let Some(record) = self.normalize(obj) else {
            return;
        };
        self.registry.publish_with(&self.subscription, |state| {
            if deleted {
                state.forget(record)
            } else {
                state.observe(record)
            }
        });
    }
}

pub struct EventManager {
    remote: Arc<dyn RemoteApi>,
    choice: Arc<ApiChoice>,
    core: ManagerCore<EventChange, EventState>,
}

impl EventManager {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteApi>, config: Arc<Config>) -> Self {
        let choice = Arc::new(ApiChoice {
            primary: config.events.primary.clone(),
            fallback: config.events.fallback.clone(),
            chosen: OnceLock::new(),
        });
        Self {
            remote,
            choice,
            core: ManagerCore::new("events", config),
        }
    }

    /// Start watching; must be called from within a tokio runtime
    ///
    /// # Errors
    ///
    /// `Error::InvalidSpec` for an inconsistent filter, `Error::ShuttingDown` after `stop`
    pub fn subscribe(&self, spec: EventSpec) -> Result<(String, DeltaStream<EventChange>)> {
        spec.validate()?;
        let namespace = spec.namespace.clone();
        let (id, stream) = self.core.open(EventState {
            spec,
            seen: HashMap::new(),
        })?;

        let driver = EventDriver {
            remote: self.remote.clone(),
            choice: self.choice.clone(),
            active: EventApi::Primary,
            namespace: namespace.clone(),
            subscription: id.clone(),
            registry: self.core.registry(),
        };
        self.core
            .start_session(&id, EVENTS_RESOURCE, namespace.as_deref(), driver);
        Ok((id, stream))
    }

    /// # Errors
    ///
    /// Returns `Error::UnknownSubscription` if the id is not live
    pub fn unsubscribe(&self, subscription: &str) -> Result<()> {
        self.core.close(subscription)
    }

    /// # Errors
    ///
    /// Returns `Error::ShutdownTimeout` naming the sessions that did not finish in time
    pub async fn stop(&self, timeout: Duration) -> Result<()> {
        self.core.stop(timeout).await
    }

    /// # Errors
    ///
    /// Returns `Error::UnknownSubscription` if the id is not live
    pub fn session_stats(&self, subscription: &str) -> Result<Vec<SessionStats>> {
        self.core.session_stats(subscription)
    }

    /// The API chosen for this manager, once decided
    #[must_use]
    pub fn active_api(&self) -> Option<EventApi> {
        self.choice.chosen.get().copied()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.core.subscription_count()
    }

    #[must_use]
    pub fn breaker_states(&self) -> HashMap<String, CircuitState> {
        self.core.breakers().snapshot()
    }
}
