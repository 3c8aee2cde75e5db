//! Outgoing references declared by an object.
//!
//! Two sources: `metadata.ownerReferences` (resolved by uid) and configured
//! `ReferenceRule`s that read a name out of a field and resolve it against a
//! node of another kind in the same namespace.

use crate::config::ReferenceRule;
use crate::graph::model::NodeKey;
use kube::core::DynamicObject;

pub const OWNER_RELATION: &str = "owner";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RefTarget {
    Uid(String),
    Key(NodeKey),
}

/// An edge the object wants, which exists once the target node does
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub target: RefTarget,
    pub relation: String,
}

/// All references `obj` (of `kind`) declares under `rules`
#[must_use]
pub fn references(kind: &str, obj: &DynamicObject, rules: &[ReferenceRule]) -> Vec<Reference> {
    let mut refs: Vec<Reference> = obj
        .metadata
        .owner_references
        .iter()
        .flatten()
        .map(|owner| Reference {
            target: RefTarget::Uid(owner.uid.clone()),
            relation: OWNER_RELATION.to_string(),
        })
        .collect();

    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    for rule in rules.iter().filter(|r| r.from_kind == kind) {
        for name in names_at(&obj.data, &rule.path) {
            refs.push(Reference {
                target: RefTarget::Key(NodeKey::new(&rule.to_kind, &namespace, &name)),
                relation: rule.relation.clone(),
            });
        }
    }

    refs.dedup();
    refs
}

/// Names found at a dot-separated path; arrays along the way fan out
fn names_at(value: &serde_json::Value, path: &str) -> Vec<String> {
    let mut current = vec![value];
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = current
            .into_iter()
            .flat_map(|v| match v {
                serde_json::Value::Array(items) => items.iter().filter_map(|i| i.get(segment)).collect(),
                other => other.get(segment).into_iter().collect::<Vec<_>>(),
            })
            .collect();
    }
    current
        .into_iter()
        .flat_map(|v| match v {
            serde_json::Value::String(s) => vec![s.clone()],
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        })
        .filter(|name| !name.is_empty())
        .collect()
}
