//! Finding and unbinding the dependents of stale nodes.

use indexmap::IndexSet;

use crate::base::NodeId;
use crate::error::Result;
use crate::graph::{BackReferencePopulator, GraphStore, walk};
use crate::passes::UnloadWalker;

/// The top-level element a node belongs to.
///
/// Unlike [`GraphStore::containing_element`] this also answers for nodes of
/// elements already detached from their package: the topmost ancestor is
/// returned then.
pub fn element_of(store: &GraphStore, node: NodeId) -> Option<NodeId> {
    if !store.contains(node) {
        return None;
    }
    let mut current = node;
    while let Some(parent) = store.parent(current) {
        if store.is_package(parent) {
            break;
        }
        current = parent;
    }
    Some(current)
}

/// Elements depending on `instances`, transitively.
///
/// Every node owned by an instance is asked for its referrers (reference
/// usage owners, applying expressions, specializations, annotated elements
/// and associations) and for the dependents reported by `walkers`. Those
/// are mapped to their elements and walked in turn. The input instances are
/// not part of the result.
pub fn walk_for_unload(
    store: &GraphStore,
    walkers: &[std::sync::Arc<dyn UnloadWalker>],
    instances: impl IntoIterator<Item = NodeId>,
) -> IndexSet<NodeId> {
    let start: IndexSet<NodeId> = instances.into_iter().collect();
    let mut found = IndexSet::new();
    let mut queue: Vec<NodeId> = start.iter().copied().collect();
    let mut visited: IndexSet<NodeId> = start.clone();

    while let Some(element) = queue.pop() {
        for node in walk::owned_subtree(store, element, false) {
            let dependents = walk::referrers(store, node)
                .into_iter()
                .chain(walkers.iter().flat_map(|w| w.dependents(node, store)));
            for dependent in dependents {
                let Some(dependent) = element_of(store, dependent) else { continue };
                if store.is_package(dependent) || !visited.insert(dependent) {
                    continue;
                }
                found.insert(dependent);
                queue.push(dependent);
            }
        }
    }
    found
}

/// Revert the binding of every node owned by `instances`: mirror entries
/// on referenced nodes are removed, then every reference forgets its
/// target. Nodes no longer in the store are skipped.
pub(crate) fn unbind(
    store: &GraphStore,
    populator: &BackReferencePopulator,
    instances: impl IntoIterator<Item = NodeId>,
) -> Result<usize> {
    let nodes: Vec<NodeId> = instances
        .into_iter()
        .flat_map(|instance| walk::owned_subtree(store, instance, false))
        .collect();
    for &node in &nodes {
        populator.depopulate(node)?;
    }
    let mut unbound = 0;
    for &node in &nodes {
        let bound = store
            .with_node(node, |n| n.references().any(|(_, _, r)| r.is_resolved()))
            .unwrap_or(false);
        if bound {
            store.update(node, |n| n.references_mut().for_each(|r| r.unresolve()))?;
            unbound += 1;
        }
    }
    Ok(unbound)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::base::SourceSpan;
    use crate::graph::{Node, NodeKind, Reference, Value, props};

    fn span(source: &str, line: i32) -> Option<SourceSpan> {
        Some(SourceSpan::new(source, line, 1, line + 1, 1))
    }

    fn reference_to(store: &GraphStore, path: &str) -> Value {
        let mut r = Reference::new(path);
        r.resolve_to(store.find_by_path(path).unwrap());
        Value::Ref(r)
    }

    struct Fixture {
        store: GraphStore,
        x: NodeId,
        y: NodeId,
        z: NodeId,
        y_type: NodeId,
    }

    /// `Z` uses `Y`, `Y` has a property typed `X`.
    fn fixture() -> Fixture {
        let store = GraphStore::new();
        let x = store.create_packaged_element("a", "X", NodeKind::Class, span("/m/a.pure", 1)).unwrap();
        let y = store.create_packaged_element("a", "Y", NodeKind::Class, span("/m/b.pure", 1)).unwrap();
        let z = store.create_packaged_element("a", "Z", NodeKind::Class, span("/m/c.pure", 1)).unwrap();
        let p = store.create_owned(y, props::PROPERTIES, NodeKind::Property, "x", span("/m/b.pure", 2)).unwrap();
        let y_type = store.create_owned(p, "genericType", NodeKind::GenericType, "", span("/m/b.pure", 2)).unwrap();
        store.add_value(y_type, "rawType", reference_to(&store, "a::X")).unwrap();
        let q = store.create_owned(z, props::PROPERTIES, NodeKind::Property, "y", span("/m/c.pure", 2)).unwrap();
        store.add_value(q, "rawType", reference_to(&store, "a::Y")).unwrap();

        let populator = BackReferencePopulator::new(store.clone());
        for node in [y_type, q] {
            populator.populate(node).unwrap();
        }
        Fixture { store, x, y, z, y_type }
    }

    struct Fixed(NodeId, NodeId);

    impl UnloadWalker for Fixed {
        fn dependents(&self, node: NodeId, _store: &GraphStore) -> Vec<NodeId> {
            if node == self.0 { vec![self.1] } else { Vec::new() }
        }
    }

    #[test]
    fn test_walk_is_transitive() {
        let f = fixture();
        let found = walk_for_unload(&f.store, &[], [f.x]);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![f.y, f.z]);
    }

    #[test]
    fn test_walk_uses_walkers() {
        let f = fixture();
        let extra = f
            .store
            .create_packaged_element("b", "W", NodeKind::Class, span("/m/d.pure", 1))
            .unwrap();
        let walkers: Vec<Arc<dyn UnloadWalker>> = vec![Arc::new(Fixed(f.z, extra))];
        let found = walk_for_unload(&f.store, &walkers, [f.z]);
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![extra]);
    }

    #[test]
    fn test_element_of_detached() {
        let f = fixture();
        f.store.detach_from_package(f.y).unwrap();
        assert_eq!(f.store.containing_element(f.y_type), None);
        assert_eq!(element_of(&f.store, f.y_type), Some(f.y));
        // Still found through the reference usage on X.
        assert!(walk_for_unload(&f.store, &[], [f.x]).contains(&f.y));
    }

    #[test]
    fn test_unbind_reverts_binding() {
        let f = fixture();
        let populator = BackReferencePopulator::new(f.store.clone());
        assert_eq!(f.store.with_node(f.x, |n| n.values(props::REFERENCE_USAGES).len()), Some(1));

        assert_eq!(unbind(&f.store, &populator, [f.y]).unwrap(), 1);
        assert_eq!(f.store.with_node(f.x, |n| n.values(props::REFERENCE_USAGES).len()), Some(0));
        assert_eq!(f.store.with_node(f.y_type, Node::has_unresolved_references), Some(true));
        // Unbinding again is a no-op.
        assert_eq!(unbind(&f.store, &populator, [f.y]).unwrap(), 0);
    }
}
