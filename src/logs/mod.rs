/**
 * Pod log manager
 *
 * Best-effort continuous tail of one container per subscription. Reconnects go
 * through the same backoff and breaker as the watch sessions and resume from
 * the last timestamp seen, so a few boundary lines may repeat but none older
 * than what was already delivered are replayed. Breakers are keyed per
 * pod and container.
 */
use crate::config::Config;
use crate::error::{Error, Result};
use crate::k8s::remote::{LogRequest, RemoteApi};
use crate::watch::circuit::CircuitState;
use crate::watch::manager::{ManagerCore, Registry};
use crate::watch::session::{SessionDriver, SessionStats};
use crate::watch::subscription::DeltaStream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const LOG_RESOURCE: &str = "pods/log";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogSpec {
    pub namespace: String,
    pub pod: String,
    /// Must already be resolved; multi-container pods are not guessed
    pub container: String,
    /// Lines of history on the first connect; the configured default when `None`
    pub tail_lines: Option<i64>,
}

impl LogSpec {
    fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("pod", &self.pod),
            ("container", &self.container),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidSpec(format!("{field} is required")));
            }
        }
        if self.tail_lines.is_some_and(|n| n < 0) {
            return Err(Error::InvalidSpec("tailLines must not be negative".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// Server-side timestamp, when the line carried one
    pub timestamp: Option<DateTime<Utc>>,
    pub line: String,
}

impl LogLine {
    /// Split the RFC 3339 prefix the API server adds when timestamps are requested
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if let Some((prefix, rest)) = raw.split_once(' ') {
            if let Ok(ts) = DateTime::parse_from_rfc3339(prefix) {
                return Self {
                    timestamp: Some(ts.with_timezone(&Utc)),
                    line: rest.to_string(),
                };
            }
        }
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw.trim_end()) {
            return Self {
                timestamp: Some(ts.with_timezone(&Utc)),
                line: String::new(),
            };
        }
        Self {
            timestamp: None,
            line: raw.to_string(),
        }
    }
}

struct LogDriver {
    remote: Arc<dyn RemoteApi>,
    spec: LogSpec,
    tail_lines: i64,
    subscription: String,
    registry: Registry<LogLine, ()>,
    /// Wall-clock time of the first connect, the resume point until a timestamped line arrives
    first_connect: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    /// Lines older than this are replays from the resumed stream
    floor: Option<DateTime<Utc>>,
}

impl LogDriver {
    fn request(&self) -> LogRequest {
        let since = self.last_seen.or(self.first_connect);
        LogRequest {
            namespace: self.spec.namespace.clone(),
            pod: self.spec.pod.clone(),
            container: self.spec.container.clone(),
            since,
            tail_lines: since.is_none().then_some(self.tail_lines),
        }
    }
}

#[async_trait]
impl SessionDriver for LogDriver {
    type Item = String;

    async fn connect(&mut self) -> Result<BoxStream<'static, Result<String>>> {
        let request = self.request();
        debug!(
            subscription = %self.subscription,
            pod = %request.pod,
            container = %request.container,
            since = ?request.since,
            "opening log stream"
        );
        let stream = self.remote.log_stream(&request).await?;
        self.first_connect.get_or_insert_with(Utc::now);
        self.floor = self.last_seen;
        Ok(stream)
    }

    fn handle(&mut self, raw: String) {
        let line = LogLine::parse(&raw);
        if let Some(ts) = line.timestamp {
            if self.floor.is_some_and(|floor| ts < floor) {
                return;
            }
            if self.last_seen.is_none_or(|seen| ts > seen) {
                self.last_seen = Some(ts);
            }
        }
        self.registry.publish_with(&self.subscription, |_| Some(line));
    }
}

pub struct PodLogManager {
    remote: Arc<dyn RemoteApi>,
    core: ManagerCore<LogLine, ()>,
}

impl PodLogManager {
    #[must_use]
    pub fn new(remote: Arc<dyn RemoteApi>, config: Arc<Config>) -> Self {
        Self {
            remote,
            core: ManagerCore::new("logs", config),
        }
    }

    /// Start tailing; must be called from within a tokio runtime
    ///
    /// # Errors
    ///
    /// `Error::InvalidSpec` if namespace, pod or container is missing, `Error::ShuttingDown` after `stop`
    pub fn subscribe(&self, spec: LogSpec) -> Result<(String, DeltaStream<LogLine>)> {
        spec.validate()?;
        let (id, stream) = self.core.open(())?;
        let namespace = spec.namespace.clone();
        // one breaker per container, so a crashlooping pod cannot gate its neighbours
        let target = format!("{LOG_RESOURCE}/{}/{}", spec.pod, spec.container);
        let driver = LogDriver {
            remote: self.remote.clone(),
            tail_lines: spec.tail_lines.unwrap_or(self.core.config().logs.tail_lines),
            spec,
            subscription: id.clone(),
            registry: self.core.registry(),
            first_connect: None,
            last_seen: None,
            floor: None,
        };
        self.core
            .start_session(&id, &target, Some(&namespace), driver);
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

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.core.subscription_count()
    }

    #[must_use]
    pub fn breaker_states(&self) -> HashMap<String, CircuitState> {
        self.core.breakers().snapshot()
    }
}
