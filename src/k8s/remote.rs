/**
 * Remote API seam
 *
 * The watch machinery only needs List, Watch and a log stream from the cluster.
 * `RemoteApi` captures exactly that so sessions can run against the real API
 * server (`KubeRemote`) or an in-memory stub in tests.
 */
use crate::config::WATCH_TIMEOUT_SECONDS;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams, WatchEvent, WatchParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::Client;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a resource collection on the API server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKind {
    /// API group, empty for the core group
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl ResourceKind {
    #[must_use]
    pub fn new(group: &str, version: &str, kind: &str, plural: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        let gvk = GroupVersionKind::gvk(&self.group, &self.version, &self.kind);
        ApiResource::from_gvk_with_plural(&gvk, &self.plural)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.plural, self.api_version())
    }
}

/// Initial snapshot of a collection plus the cursor to watch from
#[derive(Debug, Clone, Default)]
pub struct ObjectList {
    pub items: Vec<DynamicObject>,
    pub resource_version: String,
}

/// A single change delivered by a watch stream
#[derive(Debug, Clone)]
pub enum RawEvent {
    Added(DynamicObject),
    Modified(DynamicObject),
    Deleted(DynamicObject),
    /// Progress marker carrying only a newer resource version
    Bookmark(String),
}

/// Parameters for tailing one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    /// Resume point; lines older than this are not requested
    pub since: Option<DateTime<Utc>>,
    pub tail_lines: Option<i64>,
}

#[async_trait]
pub trait RemoteApi: Send + Sync + 'static {
    /// List a collection, optionally scoped to one namespace
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<ObjectList>;

    /// Open a watch on a collection starting after `from_resource_version`
    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        from_resource_version: &str,
    ) -> Result<BoxStream<'static, Result<RawEvent>>>;

    /// Follow one container's log output, one item per line
    async fn log_stream(&self, request: &LogRequest) -> Result<BoxStream<'static, Result<String>>>;
}

/// `RemoteApi` backed by a kube client
#[derive(Clone)]
pub struct KubeRemote {
    client: Client,
    watch_timeout_secs: u32,
}

impl KubeRemote {
    #[must_use]
    pub const fn new(client: Client) -> Self {
        Self {
            client,
            watch_timeout_secs: WATCH_TIMEOUT_SECONDS,
        }
    }

    #[must_use]
    pub const fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs;
        self
    }

    fn api(&self, kind: &ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn convert_event(event: WatchEvent<DynamicObject>) -> Result<RawEvent> {
    match event {
        WatchEvent::Added(obj) => Ok(RawEvent::Added(obj)),
        WatchEvent::Modified(obj) => Ok(RawEvent::Modified(obj)),
        WatchEvent::Deleted(obj) => Ok(RawEvent::Deleted(obj)),
        WatchEvent::Bookmark(bookmark) => {
            Ok(RawEvent::Bookmark(bookmark.metadata.resource_version))
        }
        WatchEvent::Error(resp) => Err(Error::Kube(kube::Error::Api(resp))),
    }
}

/// Server-side watch timeout; bookmarks stay on, as kube defaults them
fn watch_params(timeout_secs: u32) -> WatchParams {
    WatchParams::default().timeout(timeout_secs)
}

/// Seconds to ask for so the server replays from `since`, rounded up so the boundary line is included
fn since_seconds(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let elapsed = now.signed_duration_since(since);
    let secs = elapsed.num_seconds();
    let rounded = if elapsed.subsec_nanos() > 0 { secs + 1 } else { secs };
    rounded.max(1)
}

#[async_trait]
impl RemoteApi for KubeRemote {
    async fn list(&self, kind: &ResourceKind, namespace: Option<&str>) -> Result<ObjectList> {
        let list = self.api(kind, namespace).list(&ListParams::default()).await?;
        Ok(ObjectList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        from_resource_version: &str,
    ) -> Result<BoxStream<'static, Result<RawEvent>>> {
        let wp = watch_params(self.watch_timeout_secs);
        let stream = self
            .api(kind, namespace)
            .watch(&wp, from_resource_version)
            .await?;
        Ok(stream
            .map_err(Error::from)
            .and_then(|event| futures::future::ready(convert_event(event)))
            .boxed())
    }

    async fn log_stream(&self, request: &LogRequest) -> Result<BoxStream<'static, Result<String>>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);
        let lp = LogParams {
            container: Some(request.container.clone()),
            follow: true,
            timestamps: true,
            since_seconds: request.since.map(|since| since_seconds(since, Utc::now())),
            tail_lines: if request.since.is_some() {
                None
            } else {
                request.tail_lines
            },
            ..LogParams::default()
        };
        let reader = pods.log_stream(&request.pod, &lp).await?;
        Ok(reader.lines().map_err(Error::from).boxed())
    }
}
