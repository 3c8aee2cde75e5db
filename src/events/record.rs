use crate::error::Result;
use chrono::{DateTime, Utc};
use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};

/// Which event API a record was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventApi {
    /// `events.k8s.io/v1`
    Primary,
    /// core `v1` events
    Fallback,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectRef {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// An event normalized across both event APIs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub uid: String,
    pub namespace: String,
    pub name: String,
    pub resource_version: String,
    /// Always `Event`
    pub kind: String,
    pub reason: String,
    pub message: String,
    pub involved_object: ObjectRef,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub count: i32,
    #[serde(rename = "type")]
    pub type_: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", content = "event", rename_all = "camelCase")]
pub enum EventChange {
    Added(EventRecord),
    Modified(EventRecord),
    Deleted(EventRecord),
}

impl EventChange {
    #[must_use]
    pub const fn record(&self) -> &EventRecord {
        match self {
            Self::Added(r) | Self::Modified(r) | Self::Deleted(r) => r,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Metadata {
    name: String,
    namespace: String,
    uid: String,
    resource_version: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Series {
    count: Option<i32>,
    last_observed_time: Option<DateTime<Utc>>,
}

/// Fields of an `events.k8s.io/v1` Event
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct EventV1 {
    metadata: Metadata,
    regarding: ObjectRef,
    reason: Option<String>,
    note: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    event_time: Option<DateTime<Utc>>,
    series: Option<Series>,
    deprecated_count: Option<i32>,
    deprecated_first_timestamp: Option<DateTime<Utc>>,
    deprecated_last_timestamp: Option<DateTime<Utc>>,
}

/// Fields of a core `v1` Event
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CoreEvent {
    metadata: Metadata,
    involved_object: ObjectRef,
    reason: Option<String>,
    message: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    event_time: Option<DateTime<Utc>>,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
    count: Option<i32>,
}

impl EventRecord {
    /// Normalize an object read from `api`
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if the object does not have the shape of an event
    pub fn from_object(api: EventApi, obj: &DynamicObject) -> Result<Self> {
        let value = serde_json::to_value(obj)?;
        Ok(match api {
            EventApi::Primary => serde_json::from_value::<EventV1>(value)?.into(),
            EventApi::Fallback => serde_json::from_value::<CoreEvent>(value)?.into(),
        })
    }
}

impl From<EventV1> for EventRecord {
    fn from(e: EventV1) -> Self {
        let series = e.series.unwrap_or_default();
        let first_seen = e.deprecated_first_timestamp.or(e.event_time);
        Self {
            uid: e.metadata.uid,
            namespace: e.metadata.namespace,
            name: e.metadata.name,
            resource_version: e.metadata.resource_version,
            kind: "Event".to_string(),
            reason: e.reason.unwrap_or_default(),
            message: e.note.unwrap_or_default(),
            involved_object: e.regarding,
            first_seen,
            last_seen: series
                .last_observed_time
                .or(e.deprecated_last_timestamp)
                .or(e.event_time)
                .or(first_seen),
            count: series.count.or(e.deprecated_count).unwrap_or(1),
            type_: e.type_.unwrap_or_default(),
        }
    }
}

impl From<CoreEvent> for EventRecord {
    fn from(e: CoreEvent) -> Self {
        let first_seen = e.first_timestamp.or(e.event_time);
        Self {
            uid: e.metadata.uid,
            namespace: e.metadata.namespace,
            name: e.metadata.name,
            resource_version: e.metadata.resource_version,
            kind: "Event".to_string(),
            reason: e.reason.unwrap_or_default(),
            message: e.message.unwrap_or_default(),
            involved_object: e.involved_object,
            first_seen,
            last_seen: e.last_timestamp.or(e.event_time).or(first_seen),
            count: e.count.unwrap_or(1),
            type_: e.type_.unwrap_or_default(),
        }
    }
}
