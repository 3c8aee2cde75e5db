#![allow(dead_code)]

use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::core::DynamicObject;
use kubedelta::error::{api_error, Error, Result};
use kubedelta::k8s::{LogRequest, ObjectList, RawEvent, RemoteApi, ResourceKind};
use kubedelta::watch::StreamItem;
use kubedelta::{Config, DeltaStream, Envelope};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    NotFound,
    Forbidden,
    Timeout,
    Closed,
}

impl Failure {
    fn error(self) -> Error {
        match self {
            Self::NotFound => api_error(404, "NotFound", "the server could not find the requested resource"),
            Self::Forbidden => api_error(403, "Forbidden", "access denied"),
            Self::Timeout => Error::Timeout("stub".into()),
            Self::Closed => Error::ConnectionClosed("stub".into()),
        }
    }
}

/// What the next `log_stream` call returns
pub enum LogScript {
    Fail(Failure),
    /// These lines, then the stream ends
    Lines(Vec<String>),
    /// These lines, then the stream stays open
    Hold(Vec<String>),
}

#[derive(Default)]
struct State {
    objects: HashMap<ResourceKind, Vec<DynamicObject>>,
    resource_version: u64,
    list_failures: HashMap<ResourceKind, VecDeque<Failure>>,
    denied: HashMap<ResourceKind, Failure>,
    watch_denied: HashMap<ResourceKind, Failure>,
    watch_calls: HashMap<ResourceKind, usize>,
    log_denied: HashMap<String, Failure>,
    list_calls: HashMap<ResourceKind, usize>,
    watchers: HashMap<ResourceKind, Vec<UnboundedSender<Result<RawEvent>>>>,
    logs: VecDeque<LogScript>,
    log_requests: Vec<LogRequest>,
}

/// In-memory API server: scripted lists, manually driven watches and log streams
#[derive(Default)]
pub struct StubRemote {
    state: Mutex<State>,
}

impl StubRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_objects(&self, kind: &ResourceKind, objects: Vec<DynamicObject>) {
        let mut state = self.state();
        state.resource_version += 1;
        state.objects.insert(kind.clone(), objects);
    }

    pub fn fail_next_lists(&self, kind: &ResourceKind, times: usize, failure: Failure) {
        self.state()
            .list_failures
            .entry(kind.clone())
            .or_default()
            .extend(std::iter::repeat_n(failure, times));
    }

    /// Every list and watch of `kind` fails from now on
    pub fn deny(&self, kind: &ResourceKind, failure: Failure) {
        self.state().denied.insert(kind.clone(), failure);
    }

    /// Lists of `kind` succeed but every watch fails
    pub fn deny_watch(&self, kind: &ResourceKind, failure: Failure) {
        self.state().watch_denied.insert(kind.clone(), failure);
    }

    /// Every log stream for `pod` fails
    pub fn deny_logs(&self, pod: &str, failure: Failure) {
        self.state().log_denied.insert(pod.to_string(), failure);
    }

    pub fn watch_calls(&self, kind: &ResourceKind) -> usize {
        self.state().watch_calls.get(kind).copied().unwrap_or(0)
    }

    pub fn list_calls(&self, kind: &ResourceKind) -> usize {
        self.state().list_calls.get(kind).copied().unwrap_or(0)
    }

    /// Open watches on `kind` whose consumer is still attached
    pub fn watcher_count(&self, kind: &ResourceKind) -> usize {
        let mut state = self.state();
        let watchers = state.watchers.entry(kind.clone()).or_default();
        watchers.retain(|tx| !tx.is_closed());
        watchers.len()
    }

    /// Deliver an event to every open watch of `kind`
    pub fn emit(&self, kind: &ResourceKind, event: RawEvent) {
        let mut state = self.state();
        if let Some(watchers) = state.watchers.get_mut(kind) {
            watchers.retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
        }
    }

    /// End every open watch of `kind` cleanly
    pub fn close_watches(&self, kind: &ResourceKind) {
        self.state().watchers.remove(kind);
    }

    /// Fail every open watch of `kind` mid-stream
    pub fn break_watches(&self, kind: &ResourceKind, failure: Failure) {
        if let Some(watchers) = self.state().watchers.remove(kind) {
            for tx in watchers {
                let _ = tx.unbounded_send(Err(failure.error()));
            }
        }
    }

    pub fn script_log(&self, script: LogScript) {
        self.state().logs.push_back(script);
    }

    pub fn log_requests(&self) -> Vec<LogRequest> {
        self.state().log_requests.clone()
    }
}

#[async_trait]
impl RemoteApi for StubRemote {
    async fn list(&self, kind: &ResourceKind, _namespace: Option<&str>) -> Result<ObjectList> {
        let mut state = self.state();
        *state.list_calls.entry(kind.clone()).or_default() += 1;
        if let Some(failure) = state.denied.get(kind) {
            return Err(failure.error());
        }
        if let Some(failure) = state.list_failures.get_mut(kind).and_then(VecDeque::pop_front) {
            return Err(failure.error());
        }
        Ok(ObjectList {
            items: state.objects.get(kind).cloned().unwrap_or_default(),
            resource_version: state.resource_version.to_string(),
        })
    }

    async fn watch(
        &self,
        kind: &ResourceKind,
        _namespace: Option<&str>,
        _from_resource_version: &str,
    ) -> Result<BoxStream<'static, Result<RawEvent>>> {
        let mut state = self.state();
        *state.watch_calls.entry(kind.clone()).or_default() += 1;
        if let Some(failure) = state.denied.get(kind).or_else(|| state.watch_denied.get(kind)) {
            return Err(failure.error());
        }
        let (tx, rx) = mpsc::unbounded();
        state.watchers.entry(kind.clone()).or_default().push(tx);
        Ok(rx.boxed())
    }

    async fn log_stream(&self, request: &LogRequest) -> Result<BoxStream<'static, Result<String>>> {
        let mut state = self.state();
        state.log_requests.push(request.clone());
        if let Some(failure) = state.log_denied.get(&request.pod) {
            return Err(failure.error());
        }
        match state.logs.pop_front() {
            Some(LogScript::Fail(failure)) => Err(failure.error()),
            Some(LogScript::Lines(lines)) => Ok(futures::stream::iter(lines.into_iter().map(Ok)).boxed()),
            Some(LogScript::Hold(lines)) => Ok(futures::stream::iter(lines.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }
}

pub fn pods() -> ResourceKind {
    ResourceKind::new("", "v1", "Pod", "pods")
}

pub fn replica_sets() -> ResourceKind {
    ResourceKind::new("apps", "v1", "ReplicaSet", "replicasets")
}

pub fn object(kind: &ResourceKind, name: &str, uid: &str, rv: &str) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind,
        "metadata": {"name": name, "namespace": "default", "uid": uid, "resourceVersion": rv},
    }))
    .unwrap()
}

pub fn owned_by(mut obj: DynamicObject, owner: &DynamicObject) -> DynamicObject {
    let owner_ref = serde_json::from_value(json!({
        "apiVersion": owner.types.as_ref().map(|t| t.api_version.clone()).unwrap_or_default(),
        "kind": owner.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default(),
        "name": owner.metadata.name.clone().unwrap_or_default(),
        "uid": owner.metadata.uid.clone().unwrap_or_default(),
    }))
    .unwrap();
    obj.metadata.owner_references = Some(vec![owner_ref]);
    obj
}

pub fn config() -> Arc<Config> {
    Arc::new(Config::default())
}

/// Next delta, failing the test on timeout, lag or stream end
pub async fn next_delta<T: Clone + Send + 'static>(stream: &mut DeltaStream<T>) -> Envelope<T> {
    match tokio::time::timeout(Duration::from_secs(30), stream.recv()).await {
        Ok(Some(StreamItem::Delta(envelope))) => envelope,
        Ok(Some(StreamItem::Lagged(n))) => panic!("unexpected lag of {n}"),
        Ok(None) => panic!("stream ended"),
        Err(_) => panic!("no delta within 30s"),
    }
}

/// True if nothing arrives within `window`
pub async fn quiet_for<T: Clone + Send + 'static>(stream: &mut DeltaStream<T>, window: Duration) -> bool {
    tokio::time::timeout(window, stream.recv()).await.is_err()
}

/// Poll `check` every 10ms until it holds, up to 30s
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..3_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 30s");
}

pub fn unique<T: std::hash::Hash + Eq>(items: impl IntoIterator<Item = T>) -> usize {
    items.into_iter().collect::<HashSet<_>>().len()
}
