//! Name and classifier indices and the exclusion set, owned by the graph
//! store.
//!
//! All three are updated only through the store, which records every
//! change in the open transaction so rollback can undo registrations as
//! well as node creation.

use indexmap::IndexSet;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use crate::base::NodeId;

/// Path and classifier lookups for the graph.
#[derive(Debug, Default)]
pub struct Context {
    /// Packaged element / package path -> node.
    by_path: FxHashMap<SmolStr, NodeId>,
    /// Classifier node -> registered instances, in registration order.
    by_classifier: FxHashMap<NodeId, IndexSet<NodeId>>,
    /// Reverse of `by_classifier` for removal.
    classifier_of: FxHashMap<NodeId, NodeId>,
    /// Nodes printed by name only: top-level nodes, import groups and
    /// imported packages.
    excluded: FxHashSet<NodeId>,
}

/// A single index mutation, kept so it can be reverted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ContextChange {
    PathAdded(SmolStr),
    PathRemoved(SmolStr, NodeId),
    InstanceAdded(NodeId, NodeId),
    InstanceRemoved(NodeId, NodeId),
    /// Holds the set that was replaced.
    ExclusionSetReplaced(FxHashSet<NodeId>),
}

impl Context {
    pub fn find(&self, path: &str) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn instances(&self, classifier: NodeId) -> Vec<NodeId> {
        self.by_classifier
            .get(&classifier)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, node: NodeId) -> bool {
        self.classifier_of.contains_key(&node)
    }

    pub fn path_count(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_excluded(&self, node: NodeId) -> bool {
        self.excluded.contains(&node)
    }

    /// The exclusion set, sorted.
    pub fn excluded(&self) -> Vec<NodeId> {
        let mut excluded: Vec<NodeId> = self.excluded.iter().copied().collect();
        excluded.sort_unstable();
        excluded
    }

    /// Map `path` to `node`. Returns the existing owner if the path is taken
    /// by another node.
    pub(crate) fn insert_path(&mut self, path: SmolStr, node: NodeId) -> Result<Option<ContextChange>, NodeId> {
        match self.by_path.get(&path) {
            Some(&existing) if existing == node => Ok(None),
            Some(&existing) => Err(existing),
            None => {
                self.by_path.insert(path.clone(), node);
                Ok(Some(ContextChange::PathAdded(path)))
            }
        }
    }

    pub(crate) fn remove_path(&mut self, path: &str) -> Option<ContextChange> {
        self.by_path
            .remove(path)
            .map(|node| ContextChange::PathRemoved(SmolStr::new(path), node))
    }

    pub(crate) fn register(&mut self, classifier: NodeId, node: NodeId) -> Option<ContextChange> {
        if self.classifier_of.contains_key(&node) {
            return None;
        }
        self.classifier_of.insert(node, classifier);
        self.by_classifier.entry(classifier).or_default().insert(node);
        Some(ContextChange::InstanceAdded(classifier, node))
    }

    pub(crate) fn unregister(&mut self, node: NodeId) -> Option<ContextChange> {
        let classifier = self.classifier_of.remove(&node)?;
        if let Some(set) = self.by_classifier.get_mut(&classifier) {
            set.shift_remove(&node);
        }
        Some(ContextChange::InstanceRemoved(classifier, node))
    }

    pub(crate) fn replace_excluded(&mut self, excluded: FxHashSet<NodeId>) -> Option<ContextChange> {
        if self.excluded == excluded {
            return None;
        }
        let previous = std::mem::replace(&mut self.excluded, excluded);
        Some(ContextChange::ExclusionSetReplaced(previous))
    }

    pub(crate) fn undo(&mut self, change: ContextChange) {
        match change {
            ContextChange::PathAdded(path) => {
                self.by_path.remove(&path);
            }
            ContextChange::PathRemoved(path, node) => {
                self.by_path.insert(path, node);
            }
            ContextChange::InstanceAdded(_, node) => {
                self.unregister(node);
            }
            ContextChange::InstanceRemoved(classifier, node) => {
                self.register(classifier, node);
            }
            ContextChange::ExclusionSetReplaced(previous) => {
                self.excluded = previous;
            }
        }
    }
}
