/**
 * Graph manager
 *
 * One watch session per requested kind, all feeding a graph owned by the
 * subscription. Each list snapshot or watch event is diffed against that graph
 * and the resulting changes are published as a single `GraphDelta`.
 */
use crate::config::Config;
use crate::error::{Error, Result};
use crate::graph::model::GraphDelta;
use crate::graph::store::{GraphStore, LabelFilter};
use crate::k8s::remote::{RawEvent, RemoteApi, ResourceKind};
use crate::watch::circuit::CircuitState;
use crate::watch::manager::{ManagerCore, Registry};
use crate::watch::session::{SessionDriver, SessionStats};
use crate::watch::subscription::DeltaStream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What a graph subscriber wants to see
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GraphSpec {
    /// Kind names, each one of the configured graph kinds
    pub kinds: Vec<String>,
    /// `None` watches all namespaces
    pub namespace: Option<String>,
    /// Equality selector; edges are only published when both endpoints match
    pub labels: BTreeMap<String, String>,
}

fn non_empty(delta: GraphDelta) -> Option<GraphDelta> {
    (!delta.is_empty()).then_some(delta)
}

struct GraphDriver {
    remote: Arc<dyn RemoteApi>,
    kind: ResourceKind,
    namespace: Option<String>,
    subscription: String,
    registry: Registry<GraphDelta, GraphStore>,
}

#[async_trait]
impl SessionDriver for GraphDriver {
    type Item = RawEvent;

    async fn connect(&mut self) -> Result<BoxStream<'static, Result<RawEvent>>> {
        let list = self.remote.list(&self.kind, self.namespace.as_deref()).await?;
        debug!(
            subscription = %self.subscription,
            kind = %self.kind,
            items = list.items.len(),
            resource_version = %list.resource_version,
            "listed"
        );
        let kind = &self.kind.kind;
        self.registry.publish_with(&self.subscription, |store| {
            non_empty(store.reconcile(kind, &list.items))
        });
        self.remote
            .watch(&self.kind, self.namespace.as_deref(), &list.resource_version)
            .await
    }

    fn handle(&mut self, event: RawEvent) {
        let kind = &self.kind.kind;
        self.registry.publish_with(&self.subscription, |store| match &event {
            RawEvent::Added(obj) | RawEvent::Modified(obj) => non_empty(store.upsert(kind, obj)),
            RawEvent::Deleted(obj) => non_empty(store.remove(kind, obj)),
            RawEvent::Bookmark(_) => None,
        });
    }
}

pub struct GraphManager {
    remote: Arc<dyn RemoteApi>,
    core: ManagerCore<GraphDelta, GraphStore>,
}

impl GraphManager {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteApi>, config: Arc<Config>) -> Self {
        Self {
            remote,
            core: ManagerCore::new("graph", config),
        }
    }

    fn resolve_kinds(&self, spec: &GraphSpec) -> Result<Vec<ResourceKind>> {
        if spec.kinds.is_empty() {
            return Err(Error::InvalidSpec("at least one kind is required".into()));
        }
        if spec.namespace.as_deref() == Some("") {
            return Err(Error::InvalidSpec(
                "namespace must not be empty; omit it to watch all namespaces".into(),
            ));
        }
        let configured = &self.core.config().graph.kinds;
        let mut kinds: Vec<ResourceKind> = Vec::with_capacity(spec.kinds.len());
        for name in &spec.kinds {
            let kind = configured
                .iter()
                .find(|k| &k.kind == name)
                .ok_or_else(|| Error::InvalidSpec(format!("kind {name} is not watched by this manager")))?;
            if !kinds.contains(kind) {
                kinds.push(kind.clone());
            }
        }
        Ok(kinds)
    }

    /// Start watching; must be called from within a tokio runtime
    ///
    /// # Errors
    ///
    /// `Error::InvalidSpec` for an empty or unknown kind list, `Error::ShuttingDown` after `stop`
    pub fn subscribe(&self, spec: GraphSpec) -> Result<(String, DeltaStream<GraphDelta>)> {
        let kinds = self.resolve_kinds(&spec)?;
        let store = GraphStore::new(
            self.core.config().graph.references.clone(),
            LabelFilter {
                labels: spec.labels.clone(),
            },
        );
        let (id, stream) = self.core.open(store)?;

        for kind in kinds {
            let driver = GraphDriver {
                remote: self.remote.clone(),
                namespace: spec.namespace.clone(),
                subscription: id.clone(),
                registry: self.core.registry(),
                kind: kind.clone(),
            };
            self.core
                .start_session(&id, &kind.to_string(), spec.namespace.as_deref(), driver);
        }
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

    /// Nodes currently held in a subscription's graph
    #[must_use]
    pub fn node_count(&self, subscription: &str) -> Option<usize> {
        self.core
            .registry()
            .with_state(subscription, |store| store.node_count())
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.core.subscription_count()
    }

    #[must_use]
    pub fn live_sessions(&self) -> Vec<String> {
        self.core.live_sessions()
    }

    #[must_use]
    pub fn breaker_states(&self) -> HashMap<String, CircuitState> {
        self.core.breakers().snapshot()
    }
}
