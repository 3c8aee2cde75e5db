//! Node, edge and delta types published by the graph manager

use kube::core::DynamicObject;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a node: `(kind, namespace, name)`. Cluster-scoped objects have an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl NodeKey {
    #[must_use]
    pub fn new(kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Labels and a status summary lifted from the object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAttributes {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspended: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl NodeAttributes {
    /// Status fields common to most resources: a `Ready` condition, `spec.suspend`, `status.phase`
    #[must_use]
    pub fn from_object(obj: &DynamicObject) -> Self {
        let data = &obj.data;
        let mut attrs = Self {
            labels: obj.metadata.labels.clone().unwrap_or_default(),
            suspended: data
                .get("spec")
                .and_then(|spec| spec.get("suspend"))
                .and_then(serde_json::Value::as_bool),
            ..Self::default()
        };

        let Some(status) = data.get("status") else {
            return attrs;
        };
        attrs.phase = status
            .get("phase")
            .and_then(|p| p.as_str())
            .map(str::to_string);

        let ready = status
            .get("conditions")
            .and_then(|c| c.as_array())
            .into_iter()
            .flatten()
            .find(|c| {
                matches!(
                    c.get("type").and_then(|t| t.as_str()),
                    Some("Ready" | "Available")
                )
            });
        if let Some(condition) = ready {
            attrs.ready = condition
                .get("status")
                .and_then(|s| s.as_str())
                .map(|s| s == "True");
            attrs.message = condition
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string);
        }
        attrs
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub resource_version: String,
    pub attributes: NodeAttributes,
}

impl GraphNode {
    /// `None` for objects without a name or uid
    #[must_use]
    pub fn from_object(kind: &str, obj: &DynamicObject) -> Option<Self> {
        let meta = &obj.metadata;
        Some(Self {
            kind: kind.to_string(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone()?,
            uid: meta.uid.clone()?,
            resource_version: meta.resource_version.clone().unwrap_or_default(),
            attributes: NodeAttributes::from_object(obj),
        })
    }

    #[must_use]
    pub fn key(&self) -> NodeKey {
        NodeKey::new(&self.kind, &self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    pub from_uid: String,
    pub to_uid: String,
    pub relation: String,
}

impl GraphEdge {
    #[must_use]
    pub fn new(from_uid: &str, to_uid: &str, relation: &str) -> Self {
        Self {
            from_uid: from_uid.to_string(),
            to_uid: to_uid.to_string(),
            relation: relation.to_string(),
        }
    }

    #[must_use]
    pub fn touches(&self, uid: &str) -> bool {
        self.from_uid == uid || self.to_uid == uid
    }
}

impl fmt::Display for GraphEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -{}-> {}", self.from_uid, self.relation, self.to_uid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "value", rename_all = "camelCase")]
pub enum GraphChange {
    NodeAdded(GraphNode),
    NodeUpdated(GraphNode),
    NodeDeleted(GraphNode),
    EdgeAdded(GraphEdge),
    EdgeDeleted(GraphEdge),
}

/// All changes caused by one input event, delivered as one message.
///
/// Ordered edge deletes, node deletes, node adds and updates, edge adds, so a
/// consumer applying them in order never sees an edge without both endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphDelta {
    pub changes: Vec<GraphChange>,
}

impl GraphDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn edges_added(&self) -> impl Iterator<Item = &GraphEdge> {
        self.changes.iter().filter_map(|c| match c {
            GraphChange::EdgeAdded(e) => Some(e),
            _ => None,
        })
    }

    pub fn edges_deleted(&self) -> impl Iterator<Item = &GraphEdge> {
        self.changes.iter().filter_map(|c| match c {
            GraphChange::EdgeDeleted(e) => Some(e),
            _ => None,
        })
    }

    pub fn nodes_deleted(&self) -> impl Iterator<Item = &GraphNode> {
        self.changes.iter().filter_map(|c| match c {
            GraphChange::NodeDeleted(n) => Some(n),
            _ => None,
        })
    }
}
