//! Resolution of a single reference against the current graph.

use crate::base::{NodeId, SourceSpan};
use crate::graph::{GraphStore, NodeKind, Reference};

use super::ReferenceIdResolver;

/// Outcome of resolving one reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResolveResult {
    Found(NodeId),
    /// A node exists at the path but is not of the expected kind.
    WrongKind { found: NodeKind, expected: NodeKind },
    NotFound,
}

impl ResolveResult {
    pub fn node(self) -> Option<NodeId> {
        match self {
            Self::Found(id) => Some(id),
            _ => None,
        }
    }
}

/// Looks references up by path, falling back to reference-id navigation
/// for component ids.
#[derive(Clone, Debug)]
pub struct Resolver {
    store: GraphStore,
    ids: ReferenceIdResolver,
}

impl Resolver {
    pub fn new(store: GraphStore) -> Self {
        let ids = ReferenceIdResolver::new(store.clone());
        Self { store, ids }
    }

    pub fn resolve(&self, reference: &Reference) -> ResolveResult {
        let found = self.store.find_by_path(&reference.path).or_else(|| {
            ReferenceIdResolver::is_component_id(&reference.path)
                .then(|| self.ids.resolve(&reference.path).ok())
                .flatten()
        });
        let Some(found) = found else {
            return ResolveResult::NotFound;
        };
        match (reference.expected, self.store.node_kind(found)) {
            (Some(expected), Some(kind)) if !kind.is_a(expected) => ResolveResult::WrongKind { found: kind, expected },
            (_, Some(_)) => ResolveResult::Found(found),
            (_, None) => ResolveResult::NotFound,
        }
    }

    /// Diagnostic for a reference that did not resolve.
    pub fn failure_message(reference: &Reference, result: ResolveResult, span: Option<&SourceSpan>) -> String {
        let mut message = format!("Could not resolve '{}'", reference.path);
        match result {
            ResolveResult::WrongKind { found, expected } => {
                message.push_str(&format!(" (expected {expected}, found {found})"));
            }
            _ => {
                if let Some(expected) = reference.expected {
                    message.push_str(&format!(" (expected {expected})"));
                }
            }
        }
        if let Some(span) = span {
            message.push_str(&format!(" at {span}"));
        }
        message
    }
}
