//! In-memory node/edge graph and the diff engine that turns object events into deltas.
//!
//! Nodes are keyed by `(kind, namespace, name)` with the uid as a secondary key,
//! so an object that reappears with a known uid under a new name is a rename.
//! Edges are stored by uid and only exist while both endpoints are present.
//! Every mutation recomputes just the edges touching the changed node and
//! diffs them against what has already been published.

use crate::config::ReferenceRule;
use crate::graph::model::{GraphChange, GraphDelta, GraphEdge, GraphNode, NodeKey};
use crate::graph::relations::{self, RefTarget, Reference};
use kube::core::DynamicObject;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::trace;

/// Equality label selector evaluated locally
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelFilter {
    pub labels: BTreeMap<String, String>,
}

impl LabelFilter {
    #[must_use]
    pub fn matches(&self, node: &GraphNode) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| node.attributes.labels.get(k) == Some(v))
    }
}

/// Collects the net effect of several mutations so one input produces one message
#[derive(Debug, Default)]
struct DeltaBuilder {
    edge_deletes: BTreeSet<GraphEdge>,
    node_deletes: BTreeMap<NodeKey, GraphNode>,
    /// `true` when the node is new to subscribers
    node_upserts: BTreeMap<NodeKey, (GraphNode, bool)>,
    edge_adds: BTreeSet<GraphEdge>,
}

impl DeltaBuilder {
    fn edge_added(&mut self, edge: GraphEdge) {
        if !self.edge_deletes.remove(&edge) {
            self.edge_adds.insert(edge);
        }
    }

    fn edge_deleted(&mut self, edge: GraphEdge) {
        if !self.edge_adds.remove(&edge) {
            self.edge_deletes.insert(edge);
        }
    }

    fn node_upserted(&mut self, node: GraphNode, added: bool) {
        let key = node.key();
        if let Some(deleted) = self.node_deletes.remove(&key) {
            if deleted.uid == node.uid {
                self.node_upserts.insert(key, (node, false));
            } else {
                self.node_deletes.insert(key.clone(), deleted);
                self.node_upserts.insert(key, (node, true));
            }
            return;
        }
        let added = self.node_upserts.get(&key).map_or(added, |(_, was_added)| *was_added);
        self.node_upserts.insert(key, (node, added));
    }

    fn node_deleted(&mut self, node: GraphNode) {
        let key = node.key();
        if let Some((_, true)) = self.node_upserts.remove(&key) {
            return;
        }
        self.node_deletes.insert(key, node);
    }

    fn finish(self) -> GraphDelta {
        let mut changes = Vec::with_capacity(
            self.edge_deletes.len()
                + self.node_deletes.len()
                + self.node_upserts.len()
                + self.edge_adds.len(),
        );
        changes.extend(self.edge_deletes.into_iter().map(GraphChange::EdgeDeleted));
        changes.extend(self.node_deletes.into_values().map(GraphChange::NodeDeleted));
        changes.extend(self.node_upserts.into_values().map(|(node, added)| {
            if added {
                GraphChange::NodeAdded(node)
            } else {
                GraphChange::NodeUpdated(node)
            }
        }));
        changes.extend(self.edge_adds.into_iter().map(GraphChange::EdgeAdded));
        GraphDelta { changes }
    }
}

#[derive(Debug, Default)]
pub struct GraphStore {
    rules: Vec<ReferenceRule>,
    filter: LabelFilter,
    nodes: HashMap<NodeKey, GraphNode>,
    by_uid: HashMap<String, NodeKey>,
    /// Outgoing references per node uid, resolved or not
    refs: HashMap<String, Vec<Reference>>,
    /// Reverse index: uids of nodes referring to a target
    referrers: HashMap<RefTarget, HashSet<String>>,
    /// Edges published so far
    edges: BTreeSet<GraphEdge>,
}

impl GraphStore {
    #[must_use]
    pub fn new(rules: Vec<ReferenceRule>, filter: LabelFilter) -> Self {
        Self {
            rules,
            filter,
            ..Self::default()
        }
    }

    /// Apply an added or modified object
    pub fn upsert(&mut self, kind: &str, obj: &DynamicObject) -> GraphDelta {
        let mut delta = DeltaBuilder::default();
        self.upsert_into(&mut delta, kind, obj);
        delta.finish()
    }

    /// Apply a deleted object
    pub fn remove(&mut self, kind: &str, obj: &DynamicObject) -> GraphDelta {
        let mut delta = DeltaBuilder::default();
        let key = NodeKey::new(
            kind,
            obj.metadata.namespace.as_deref().unwrap_or_default(),
            obj.metadata.name.as_deref().unwrap_or_default(),
        );
        // a delete carrying a uid only applies to that incarnation of the object
        let key = match obj.metadata.uid.as_deref().filter(|uid| !uid.is_empty()) {
            Some(uid) => self.by_uid.get(uid).cloned(),
            None => self.nodes.contains_key(&key).then_some(key),
        };
        if let Some(key) = key {
            self.remove_into(&mut delta, &key);
        }
        delta.finish()
    }

    /// Apply a fresh list of `kind`: upsert every item and drop nodes of that kind that are missing
    pub fn reconcile(&mut self, kind: &str, items: &[DynamicObject]) -> GraphDelta {
        let mut delta = DeltaBuilder::default();
        let mut listed = HashSet::new();
        for obj in items {
            if let Some(key) = self.upsert_into(&mut delta, kind, obj) {
                listed.insert(key);
            }
        }
        let stale: Vec<NodeKey> = self
            .nodes
            .keys()
            .filter(|key| key.kind == kind && !listed.contains(*key))
            .cloned()
            .collect();
        for key in stale {
            trace!(node = %key, "missing from re-list");
            self.remove_into(&mut delta, &key);
        }
        delta.finish()
    }

    #[must_use]
    pub fn node(&self, key: &NodeKey) -> Option<&GraphNode> {
        self.nodes.get(key)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edges(&self) -> impl Iterator<Item = &GraphEdge> {
        self.edges.iter()
    }

    /// Returns the key of the node now present, if any
    fn upsert_into(
        &mut self,
        delta: &mut DeltaBuilder,
        kind: &str,
        obj: &DynamicObject,
    ) -> Option<NodeKey> {
        let node = GraphNode::from_object(kind, obj)?;
        let key = node.key();

        if !self.filter.matches(&node) {
            if let Some(old_key) = self.by_uid.get(&node.uid).cloned() {
                self.remove_into(delta, &old_key);
            }
            if self.nodes.contains_key(&key) {
                self.remove_into(delta, &key);
            }
            return None;
        }

        if let Some(existing) = self.nodes.get(&key) {
            if existing.uid == node.uid
                && !node.resource_version.is_empty()
                && existing.resource_version == node.resource_version
            {
                return Some(key);
            }
            if existing.uid != node.uid {
                trace!(node = %key, "recreated with a new uid");
                self.remove_into(delta, &key);
            }
        }
        if let Some(old_key) = self.by_uid.get(&node.uid).cloned() {
            if old_key != key {
                trace!(from = %old_key, to = %key, "renamed");
                self.remove_into(delta, &old_key);
            }
        }

        let added = !self.nodes.contains_key(&key);
        let uid = node.uid.clone();
        let refs = relations::references(kind, obj, &self.rules);
        self.set_refs(&uid, refs);
        self.by_uid.insert(uid.clone(), key.clone());
        self.nodes.insert(key.clone(), node.clone());
        delta.node_upserted(node, added);
        self.recompute_edges(delta, &uid);
        Some(key)
    }

    fn remove_into(&mut self, delta: &mut DeltaBuilder, key: &NodeKey) {
        let Some(node) = self.nodes.remove(key) else {
            return;
        };
        self.by_uid.remove(&node.uid);
        self.set_refs(&node.uid, Vec::new());
        let uid = node.uid.clone();
        delta.node_deleted(node);
        self.recompute_edges(delta, &uid);
    }

    fn set_refs(&mut self, uid: &str, refs: Vec<Reference>) {
        if let Some(old) = self.refs.remove(uid) {
            for r in old {
                if let Some(set) = self.referrers.get_mut(&r.target) {
                    set.remove(uid);
                    if set.is_empty() {
                        self.referrers.remove(&r.target);
                    }
                }
            }
        }
        if refs.is_empty() {
            return;
        }
        for r in &refs {
            self.referrers
                .entry(r.target.clone())
                .or_default()
                .insert(uid.to_string());
        }
        self.refs.insert(uid.to_string(), refs);
    }

    fn resolve(&self, target: &RefTarget) -> Option<&str> {
        match target {
            RefTarget::Uid(uid) => self.by_uid.get_key_value(uid).map(|(uid, _)| uid.as_str()),
            RefTarget::Key(key) => self.nodes.get(key).map(|n| n.uid.as_str()),
        }
    }

    /// Edges touching `uid` that should exist given the current nodes
    fn desired_edges(&self, uid: &str) -> BTreeSet<GraphEdge> {
        let mut desired = BTreeSet::new();
        let Some(key) = self.by_uid.get(uid) else {
            return desired;
        };

        for r in self.refs.get(uid).into_iter().flatten() {
            if let Some(to) = self.resolve(&r.target) {
                if to != uid {
                    desired.insert(GraphEdge::new(uid, to, &r.relation));
                }
            }
        }

        let incoming = [RefTarget::Uid(uid.to_string()), RefTarget::Key(key.clone())];
        for from in incoming
            .iter()
            .filter_map(|t| self.referrers.get(t))
            .flatten()
        {
            if from == uid || !self.by_uid.contains_key(from) {
                continue;
            }
            for r in self.refs.get(from).into_iter().flatten() {
                if self.resolve(&r.target) == Some(uid) {
                    desired.insert(GraphEdge::new(from, uid, &r.relation));
                }
            }
        }
        desired
    }

    fn recompute_edges(&mut self, delta: &mut DeltaBuilder, uid: &str) {
        let desired = self.desired_edges(uid);
        let published: BTreeSet<GraphEdge> =
            self.edges.iter().filter(|e| e.touches(uid)).cloned().collect();

        for edge in published.difference(&desired) {
            self.edges.remove(edge);
            delta.edge_deleted(edge.clone());
        }
        for edge in desired.difference(&published) {
            self.edges.insert(edge.clone());
            delta.edge_added(edge.clone());
        }
    }
}
