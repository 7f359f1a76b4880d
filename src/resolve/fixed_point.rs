//! Fixed-point reference resolution.
//!
//! Nodes created out of order may reference nodes that do not exist yet.
//! Passes are repeated until every reference resolves, or until a pass
//! makes no progress, which is a deadlock: the remaining references can
//! never resolve.

use std::time::Instant;

use rayon::ThreadPool;
use smol_str::SmolStr;

use super::Resolver;
use crate::base::NodeId;
use crate::error::{CoreError, Result};
use crate::graph::{GraphStore, Reference, Value};
use crate::parallel;

/// Maximum number of failure messages listed in a deadlock error.
pub const MAX_REPORTED_FAILURES: usize = 10;

/// Counts of one resolution pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassCounts {
    pub newly_resolved: usize,
    pub unresolved: usize,
}

impl PassCounts {
    pub fn merge(self, other: Self) -> Self {
        Self {
            newly_resolved: self.newly_resolved + other.newly_resolved,
            unresolved: self.unresolved + other.unresolved,
        }
    }
}

/// Drives [`Resolver`] over a set of nodes until nothing is left.
pub struct FixedPoint<'a> {
    store: &'a GraphStore,
    resolver: Resolver,
    pool: Option<&'a ThreadPool>,
    threshold: usize,
}

impl<'a> FixedPoint<'a> {
    pub fn new(store: &'a GraphStore, pool: Option<&'a ThreadPool>, threshold: usize) -> Self {
        Self {
            store,
            resolver: Resolver::new(store.clone()),
            pool,
            threshold,
        }
    }

    /// Resolve every reference of `nodes`. Returns the number of passes used.
    pub fn run(&self, nodes: &[NodeId]) -> Result<usize> {
        let mut pending: Vec<NodeId> = nodes.to_vec();
        let mut passes = 0;
        while !pending.is_empty() {
            passes += 1;
            let start = Instant::now();
            let (counts, still_pending) = self.pass(&pending)?;
            tracing::debug!(
                pass = passes,
                nodes = pending.len(),
                newly_resolved = counts.newly_resolved,
                unresolved = counts.unresolved,
                elapsed_s = start.elapsed().as_secs_f64(),
                "reference resolution pass"
            );
            if counts.unresolved == 0 {
                break;
            }
            if counts.newly_resolved == 0 {
                return Err(CoreError::resolution(self.deadlock_message(passes, counts.unresolved, &still_pending)));
            }
            pending = still_pending;
        }
        Ok(passes)
    }

    /// One pass over `nodes`; returns the counts and the nodes still unresolved.
    pub fn pass(&self, nodes: &[NodeId]) -> Result<(PassCounts, Vec<NodeId>)> {
        let tx = self.store.current_transaction();
        parallel::map_reduce(
            self.pool,
            tx.as_ref(),
            nodes,
            self.threshold,
            |chunk| {
                let mut counts = PassCounts::default();
                let mut pending = Vec::new();
                for &node in chunk {
                    let node_counts = self.resolve_node(node)?;
                    if node_counts.unresolved > 0 {
                        pending.push(node);
                    }
                    counts = counts.merge(node_counts);
                }
                Ok((counts, pending))
            },
            |(a, mut pa), (b, pb)| {
                pa.extend(pb);
                (a.merge(b), pa)
            },
        )
    }

    fn unresolved_of(&self, node: NodeId) -> Vec<(SmolStr, usize, Reference)> {
        self.store
            .with_node(node, |n| {
                n.references()
                    .filter(|(_, _, r)| !r.is_resolved())
                    .map(|(p, i, r)| (p.clone(), i, r.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve the node's own references. Only this node is written.
    fn resolve_node(&self, node: NodeId) -> Result<PassCounts> {
        let pending = self.unresolved_of(node);
        if pending.is_empty() {
            return Ok(PassCounts::default());
        }
        let found: Vec<(SmolStr, usize, NodeId)> = pending
            .iter()
            .filter_map(|(p, i, r)| self.resolver.resolve(r).node().map(|t| (p.clone(), *i, t)))
            .collect();
        if !found.is_empty() {
            self.store.update(node, |n| {
                for (property, offset, target) in &found {
                    if let Some(Value::Ref(r)) = n.values_mut(property).get_mut(*offset) {
                        r.resolve_to(*target);
                    }
                }
            })?;
        }
        Ok(PassCounts {
            newly_resolved: found.len(),
            unresolved: pending.len() - found.len(),
        })
    }

    fn failure_messages(&self, nodes: &[NodeId]) -> Vec<String> {
        nodes
            .iter()
            .flat_map(|&node| {
                let span = self.store.span(node);
                self.unresolved_of(node)
                    .into_iter()
                    .map(move |(_, _, r)| (r, span.clone()))
            })
            .map(|(r, span)| Resolver::failure_message(&r, self.resolver.resolve(&r), span.as_ref()))
            .collect()
    }

    fn deadlock_message(&self, passes: usize, unresolved: usize, nodes: &[NodeId]) -> String {
        deadlock_message(passes, unresolved, &self.failure_messages(nodes))
    }
}

/// "Failed to resolve nodes after N passes; ..." with at most
/// [`MAX_REPORTED_FAILURES`] listed failures.
pub fn deadlock_message(passes: usize, unresolved: usize, failures: &[String]) -> String {
    let mut message = format!("Failed to resolve nodes after {passes} passes; ");
    if unresolved == 1 {
        message.push_str("1 node remains unresolved");
        if let Some(failure) = failures.first() {
            message.push_str(": ");
            message.push_str(failure);
        }
        return message;
    }
    message.push_str(&format!("{unresolved} nodes remain unresolved"));
    let displayed = failures.len().min(MAX_REPORTED_FAILURES);
    for (i, failure) in failures.iter().take(displayed).enumerate() {
        message.push_str(&format!("\n\t{}: {failure}", i + 1));
    }
    if displayed == 0 {
        message.push_str(" (no failure messages to display)");
    } else if displayed < unresolved {
        message.push_str(&format!(
            "\n\t{} more failure messages not displayed ...",
            unresolved - displayed
        ));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolves_forward_references() {
        let store = GraphStore::new();
        let y = store.create_packaged_element("a", "Y", NodeKind::Class, None).unwrap();
        store.add_value(y, "general", Value::reference("a::X")).unwrap();
        let x = store.create_packaged_element("a", "X", NodeKind::Class, None).unwrap();

        let passes = FixedPoint::new(&store, None, 1000).run(&[y, x]).unwrap();
        assert_eq!(passes, 1);
        assert_eq!(store.with_node(y, |n| n.targets("general").next()).flatten(), Some(x));
    }

    #[test]
    fn test_deadlock_is_reported() {
        let store = GraphStore::new();
        let y = store.create_packaged_element("a", "Y", NodeKind::Class, None).unwrap();
        store
            .add_value(y, "general", Value::Ref(Reference::expecting("a::X", NodeKind::Class)))
            .unwrap();
        let err = FixedPoint::new(&store, None, 1000).run(&[y]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to resolve nodes after 1 passes; 1 node remains unresolved: Could not resolve 'a::X' (expected Class)"
        );
    }

    #[test]
    fn test_parallel_passes() {
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let store = GraphStore::new();
        let nodes: Vec<NodeId> = (0..200)
            .map(|i| {
                let n = store
                    .create_packaged_element("p", &format!("C{i}"), NodeKind::Class, None)
                    .unwrap();
                store.add_value(n, "general", Value::reference(format!("p::C{}", (i + 1) % 200))).unwrap();
                n
            })
            .collect();
        FixedPoint::new(&store, Some(&pool), 8).run(&nodes).unwrap();
        assert!(nodes.iter().all(|n| !store.with_node(*n, |n| n.has_unresolved_references()).unwrap()));
    }

    #[test]
    fn test_deadlock_message_truncates() {
        let failures: Vec<String> = (0..12).map(|i| format!("failure {i}")).collect();
        let message = deadlock_message(3, 12, &failures);
        assert!(message.starts_with("Failed to resolve nodes after 3 passes; 12 nodes remain unresolved\n\t1: failure 0"));
        assert!(message.contains("\n\t10: failure 9"));
        assert!(!message.contains("failure 10"));
        assert!(message.ends_with("\n\t2 more failure messages not displayed ..."));

        assert_eq!(
            deadlock_message(1, 2, &[]),
            "Failed to resolve nodes after 1 passes; 2 nodes remain unresolved (no failure messages to display)"
        );
    }
}
