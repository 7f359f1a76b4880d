//! Ownership and reverse-edge walks.

use std::collections::VecDeque;

use indexmap::IndexSet;

use super::node::{Value, props};
use super::{GraphStore, NodeKind};
use crate::base::NodeId;

/// `root` followed by every node it transitively owns, breadth first.
///
/// A `Value::Node` edge is followed only when its target names the current
/// node as parent, so shared edges into other elements are never crossed.
pub fn owned_subtree(store: &GraphStore, root: NodeId, include_back_references: bool) -> Vec<NodeId> {
    if !store.contains(root) {
        return Vec::new();
    }
    let mut seen = IndexSet::new();
    let mut queue = VecDeque::from([root]);
    seen.insert(root);
    while let Some(current) = queue.pop_front() {
        let children: Vec<NodeId> = store
            .with_node(current, |node| {
                node.properties()
                    .filter(|(name, _)| include_back_references || !props::is_back_reference(name))
                    .flat_map(|(_, values)| values.iter())
                    .filter_map(|v| match v {
                        Value::Node(id) => Some(*id),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        for child in children {
            if store.parent(child) == Some(current) && seen.insert(child) {
                queue.push_back(child);
            }
        }
    }
    seen.into_iter().collect()
}

/// Nodes that point at `node` according to its back-reference properties.
///
/// Reference usages yield their owner, applications their expression,
/// specializations the specific type, association-derived properties their
/// association and model elements the annotated element.
pub fn referrers(store: &GraphStore, node: NodeId) -> Vec<NodeId> {
    let Some(entries) = store.with_node(node, |n| {
        props::BACK_REFERENCE_PROPERTIES
            .iter()
            .flat_map(|p| n.targets(p).map(move |t| (*p, t)))
            .collect::<Vec<_>>()
    }) else {
        return Vec::new();
    };

    let mut result = IndexSet::new();
    for (property, target) in entries {
        let referrer = match property {
            props::REFERENCE_USAGES => store
                .with_node(target, |ru| ru.targets(props::OWNER).next())
                .flatten(),
            props::SPECIALIZATIONS => store.parent(target),
            props::PROPERTIES_FROM_ASSOCIATIONS | props::QUALIFIED_PROPERTIES_FROM_ASSOCIATIONS => {
                store.parent(target)
            }
            _ => Some(target),
        };
        if let Some(referrer) = referrer {
            result.insert(referrer);
        }
    }
    result.into_iter().collect()
}

/// Structural problems of the whole graph: unresolved or dangling
/// references and owned edges whose target disagrees about its parent.
pub fn check_integrity(store: &GraphStore) -> Vec<String> {
    check_nodes(store, store.node_ids())
}

/// [`check_integrity`] restricted to `nodes`.
pub fn check_nodes(store: &GraphStore, nodes: impl IntoIterator<Item = NodeId>) -> Vec<String> {
    let mut problems = Vec::new();
    for id in nodes {
        let Some(node) = store.node(id) else { continue };
        for (property, values) in node.properties() {
            for (offset, value) in values.iter().enumerate() {
                match value {
                    Value::Ref(r) => match r.resolved() {
                        None => problems.push(format!("{id}.{property}[{offset}]: unresolved reference '{}'", r.path)),
                        Some(target) if !store.contains(target) => {
                            problems.push(format!("{id}.{property}[{offset}]: dangling reference to {target}"))
                        }
                        Some(_) => {}
                    },
                    Value::Node(target) if !store.contains(*target) => {
                        problems.push(format!("{id}.{property}[{offset}]: dangling edge to {target}"))
                    }
                    Value::Node(target)
                        if node.kind() == NodeKind::Package
                            && property == props::CHILDREN
                            && store.parent(*target) != Some(id) =>
                    {
                        problems.push(format!("{id}.{property}[{offset}]: child {target} has another parent"))
                    }
                    _ => {}
                }
            }
        }
    }
    problems
}
