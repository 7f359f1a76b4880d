//! Contracts of the passes the core drives but does not implement.
//!
//! Grammars, per-kind post-processing, validation, unload walking and
//! pattern registration are supplied by the embedding language. The core
//! only fixes when they run and what they may touch.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::base::{NodeId, SourceId, SourceSpan};
use crate::compiler::ValidationMode;
use crate::compiler::diagnostics::Diagnostic;
use crate::error::Result;
use crate::graph::{BackReferencePopulator, GraphStore, NodeKind, Value};
use crate::source::{ElementsByParser, Source, SourceMutation};

// ============================================================================
// PARSING
// ============================================================================

/// Node factory handed to a parser for one source.
///
/// Every node created through it is recorded so a failed parse can be
/// discarded without leaving partial nodes in the graph.
pub struct ParseContext<'a> {
    store: &'a GraphStore,
    source: SourceId,
    previous_content: Option<Arc<str>>,
    created: Mutex<Vec<NodeId>>,
}

impl<'a> ParseContext<'a> {
    pub fn new(store: &'a GraphStore, source: SourceId) -> Self {
        Self {
            store,
            source,
            previous_content: None,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Content the source had when it was last compiled.
    pub fn with_previous_content(mut self, content: Arc<str>) -> Self {
        self.previous_content = Some(content);
        self
    }

    pub fn store(&self) -> &GraphStore {
        self.store
    }

    pub fn source(&self) -> &SourceId {
        &self.source
    }

    pub fn previous_content(&self) -> Option<&str> {
        self.previous_content.as_deref()
    }

    pub fn create_packaged_element(
        &self,
        package: &str,
        name: &str,
        kind: NodeKind,
        span: SourceSpan,
    ) -> Result<NodeId> {
        let id = self.store.create_packaged_element(package, name, kind, Some(span))?;
        self.created.lock().push(id);
        Ok(id)
    }

    pub fn create_owned(
        &self,
        parent: NodeId,
        property: &str,
        kind: NodeKind,
        name: &str,
        span: SourceSpan,
    ) -> Result<NodeId> {
        let id = self.store.create_owned(parent, property, kind, name, Some(span))?;
        self.created.lock().push(id);
        Ok(id)
    }

    pub fn add_value(&self, node: NodeId, property: &str, value: Value) -> Result<()> {
        self.store.add_value(node, property, value)
    }

    pub fn created(&self) -> Vec<NodeId> {
        self.created.lock().clone()
    }

    /// Delete everything created through this context, newest first.
    pub fn discard(&self) -> Result<usize> {
        let created = std::mem::take(&mut *self.created.lock());
        let mut removed = 0;
        for id in created.into_iter().rev() {
            if !self.store.contains(id) {
                continue;
            }
            if let Some(package) = self.store.detach_from_package(id)? {
                self.store.remove_empty_packages(package)?;
            }
            removed += self.store.remove_subtree(id);
        }
        Ok(removed)
    }
}

/// Turns source text into nodes.
///
/// Implementations must be reentrant: sources are parsed in parallel, each
/// with its own [`ParseContext`]. Every created node must carry a span.
pub trait SourceParser: Send + Sync {
    /// Name recorded for the whole-source section when the parser does
    /// not split the source into sections.
    fn name(&self) -> &str;

    /// Parse `source`, returning the top-level nodes grouped by section parser.
    fn parse(&self, source: &Source, ctx: &ParseContext<'_>) -> Result<ElementsByParser>;
}

// ============================================================================
// POST-PROCESSING AND VALIDATION
// ============================================================================

/// What a post-processor or validator may use.
pub struct PassContext<'a> {
    pub store: &'a GraphStore,
    pub populator: &'a BackReferencePopulator,
    /// Repository being compiled, if any.
    pub repository: Option<&'a str>,
}

/// Semantic processing of nodes of one kind after binding.
pub trait PostProcessor: Send + Sync {
    /// Nodes whose kind `is_a` this kind are handed to the processor.
    fn kind(&self) -> NodeKind;

    /// Process one node. Nodes that must not exist are marked for deletion
    /// in the returned mutation rather than reported as errors.
    fn process(&self, node: NodeId, ctx: &PassContext<'_>) -> Result<SourceMutation>;

    /// Record reference usages the generic population cannot see. Runs
    /// after all primary processing of a batch completed.
    fn populate_reference_usages(&self, _node: NodeId, _ctx: &PassContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Checks a batch of processed nodes. Violations are returned, not thrown.
pub trait Validator: Send + Sync {
    fn validate(&self, nodes: &[NodeId], mode: ValidationMode, ctx: &PassContext<'_>) -> Vec<Diagnostic>;
}

// ============================================================================
// UNLOAD AND PATTERNS
// ============================================================================

/// Finds additional nodes that depend on a node being unloaded.
pub trait UnloadWalker: Send + Sync {
    fn dependents(&self, node: NodeId, store: &GraphStore) -> Vec<NodeId>;
}

/// Registry of URL-like patterns declared by loaded elements.
pub trait PatternLibrary: Send + Sync {
    fn possibly_register(&self, node: NodeId, store: &GraphStore);
    fn unregister(&self, node: NodeId);
}

/// Notified after a successful compile and whenever nodes are unbound.
pub trait CompilerEventHandler: Send + Sync {
    fn compiled(&self, processed: &[NodeId], sources_by_repository: &IndexMap<String, Vec<SourceId>>);

    fn invalidate(&self, _nodes: &[NodeId]) {}
}

// ============================================================================
// PASS SET
// ============================================================================

/// The externally supplied passes, in registration order.
#[derive(Clone, Default)]
pub struct Passes {
    post_processors: Vec<Arc<dyn PostProcessor>>,
    validators: Vec<Arc<dyn Validator>>,
    unload_walkers: Vec<Arc<dyn UnloadWalker>>,
    pattern_library: Option<Arc<dyn PatternLibrary>>,
}

impl std::fmt::Debug for Passes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Passes")
            .field("post_processors", &self.post_processors.len())
            .field("validators", &self.validators.len())
            .field("unload_walkers", &self.unload_walkers.len())
            .field("pattern_library", &self.pattern_library.is_some())
            .finish()
    }
}

impl Passes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_post_processor(mut self, processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processors.push(processor);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn with_unload_walker(mut self, walker: Arc<dyn UnloadWalker>) -> Self {
        self.unload_walkers.push(walker);
        self
    }

    pub fn with_pattern_library(mut self, library: Arc<dyn PatternLibrary>) -> Self {
        self.pattern_library = Some(library);
        self
    }

    pub fn validators(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }

    pub fn unload_walkers(&self) -> &[Arc<dyn UnloadWalker>] {
        &self.unload_walkers
    }

    pub fn pattern_library(&self) -> Option<&Arc<dyn PatternLibrary>> {
        self.pattern_library.as_ref()
    }

    /// Processors applying to `kind`, most general kind first.
    pub fn post_processors_for(&self, kind: NodeKind) -> Vec<&Arc<dyn PostProcessor>> {
        let mut matching: Vec<_> = self
            .post_processors
            .iter()
            .filter(|p| kind.is_a(p.kind()))
            .collect();
        matching.sort_by_key(|p| p.kind().generalizations().len());
        matching
    }

    /// Run every applicable processor on each node and merge what they
    /// ask to delete.
    pub fn process(&self, nodes: &[NodeId], ctx: &PassContext<'_>) -> Result<SourceMutation> {
        let mut mutation = SourceMutation::new();
        for &node in nodes {
            let Some(kind) = ctx.store.node_kind(node) else { continue };
            for processor in self.post_processors_for(kind) {
                mutation.merge(processor.process(node, ctx)?);
            }
        }
        Ok(mutation)
    }

    /// Run every applicable processor's reference-usage hook on each node.
    pub fn populate_reference_usages(&self, nodes: &[NodeId], ctx: &PassContext<'_>) -> Result<()> {
        for &node in nodes {
            let Some(kind) = ctx.store.node_kind(node) else { continue };
            for processor in self.post_processors_for(kind) {
                processor.populate_reference_usages(node, ctx)?;
            }
        }
        Ok(())
    }

    /// Diagnostics of all validators, in registration order.
    pub fn validate(&self, nodes: &[NodeId], mode: ValidationMode, ctx: &PassContext<'_>) -> Vec<Diagnostic> {
        self.validators
            .iter()
            .flat_map(|v| v.validate(nodes, mode, ctx))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(NodeKind);

    impl PostProcessor for Named {
        fn kind(&self) -> NodeKind {
            self.0
        }
        fn process(&self, node: NodeId, ctx: &PassContext<'_>) -> Result<SourceMutation> {
            let mut mutation = SourceMutation::new();
            if self.0 == NodeKind::Class {
                mutation.delete(node, ctx.store.span(node).as_ref());
            }
            Ok(mutation)
        }
    }

    #[test]
    fn test_post_processors_most_general_first() {
        let passes = Passes::new()
            .with_post_processor(Arc::new(Named(NodeKind::Class)))
            .with_post_processor(Arc::new(Named(NodeKind::Association)))
            .with_post_processor(Arc::new(Named(NodeKind::Type)));
        let kinds: Vec<_> = passes
            .post_processors_for(NodeKind::Enumeration)
            .iter()
            .map(|p| p.kind())
            .collect();
        assert_eq!(kinds, vec![NodeKind::Type, NodeKind::Class]);
    }

    #[test]
    fn test_process_merges_mutations() {
        let store = GraphStore::new();
        let populator = BackReferencePopulator::new(store.clone());
        let ctx = PassContext {
            store: &store,
            populator: &populator,
            repository: None,
        };
        let span = SourceSpan::new("/m/a.pure", 1, 1, 2, 1);
        let x = store.create_packaged_element("a", "X", NodeKind::Class, Some(span)).unwrap();
        let e = store.create_packaged_element("a", "E", NodeKind::Enumeration, None).unwrap();

        let passes = Passes::new()
            .with_post_processor(Arc::new(Named(NodeKind::Class)))
            .with_post_processor(Arc::new(Named(NodeKind::Type)));
        let mutation = passes.process(&[x, e], &ctx).unwrap();
        assert_eq!(mutation.marked_for_deletion().collect::<Vec<_>>(), vec![x, e]);
        assert_eq!(mutation.line_ranges_to_remove(&"/m/a.pure".into()), &[(1, 2)]);
    }

    #[test]
    fn test_parse_context_discard() {
        let store = GraphStore::new();
        let before = store.node_count();
        let ctx = ParseContext::new(&store, SourceId::new("/m/a.pure"));
        let span = SourceSpan::new("/m/a.pure", 1, 1, 2, 1);
        let x = ctx.create_packaged_element("a::b", "X", NodeKind::Class, span.clone()).unwrap();
        ctx.create_owned(x, "properties", NodeKind::Property, "p", span).unwrap();

        assert_eq!(ctx.discard().unwrap(), 2);
        assert_eq!(store.node_count(), before);
        assert_eq!(store.find_by_path("a"), None);
    }
}
