//! Shared fixtures for integration tests.
//!
//! The test language has one class per line:
//!
//! ```text
//! pkg::Name field:pkg::Type other:pkg::Other
//! ```
//!
//! Each field becomes a property whose `genericType` references the given
//! path. A line starting with `!` is a parse error.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metagraph::base::{NodeId, SourceSpan};
use metagraph::compiler::{Diagnostic, RepositorySet, ValidationMode};
use metagraph::error::{CoreError, Result};
use metagraph::graph::{GraphStore, NodeKind, Value, props};
use metagraph::passes::{ParseContext, PassContext, Passes, SourceParser, Validator};
use metagraph::source::{ElementsByParser, Source, SourceRegistry};
use metagraph::{CompilerOptions, IncrementalCompiler};
use smol_str::SmolStr;

pub const PARSER: &str = "Pure";
pub const GENERIC_TYPE: &str = "genericType";

pub struct LineParser;

impl SourceParser for LineParser {
    fn name(&self) -> &str {
        PARSER
    }

    fn parse(&self, source: &Source, ctx: &ParseContext<'_>) -> Result<ElementsByParser> {
        let mut elements = Vec::new();
        for (i, line) in source.content().lines().enumerate() {
            let line_no = i as i32 + 1;
            let span = SourceSpan::new(source.id().clone(), line_no, 1, line_no, line.len().max(1) as i32);
            let mut words = line.split_whitespace();
            let Some(path) = words.next() else { continue };
            if path.starts_with('!') {
                return Err(CoreError::parse(span, format!("unexpected '{path}'")));
            }
            let (package, name) = path
                .rsplit_once("::")
                .ok_or_else(|| CoreError::parse(span.clone(), format!("expected a qualified name, found '{path}'")))?;
            let class = ctx.create_packaged_element(package, name, NodeKind::Class, span.clone())?;
            for field in words {
                let (property, ty) = field
                    .split_once(':')
                    .ok_or_else(|| CoreError::parse(span.clone(), format!("expected name:type, found '{field}'")))?;
                let p = ctx.create_owned(class, props::PROPERTIES, NodeKind::Property, property, span.clone())?;
                ctx.add_value(p, GENERIC_TYPE, Value::reference(ty))?;
            }
            elements.push(class);
        }
        Ok(ElementsByParser::from([(SmolStr::new(PARSER), elements)]))
    }
}

/// Rejects every node of one repository while armed.
pub struct FailingValidator {
    pub repository: &'static str,
    pub armed: AtomicBool,
}

impl FailingValidator {
    pub fn new(repository: &'static str) -> Arc<Self> {
        Arc::new(Self {
            repository,
            armed: AtomicBool::new(false),
        })
    }

    pub fn arm(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }
}

impl Validator for FailingValidator {
    fn validate(&self, nodes: &[NodeId], _mode: ValidationMode, ctx: &PassContext<'_>) -> Vec<Diagnostic> {
        if !self.armed.load(Ordering::SeqCst) {
            return Vec::new();
        }
        nodes
            .iter()
            .filter(|n| {
                ctx.store
                    .span(**n)
                    .is_some_and(|s| s.source.repository() == Some(self.repository))
            })
            .map(|n| Diagnostic::error(format!("rejected {}", ctx.store.path_of(*n).unwrap_or_default())).with_node(*n))
            .collect()
    }
}

pub struct Workspace {
    pub store: GraphStore,
    pub registry: Arc<SourceRegistry>,
    pub compiler: Arc<IncrementalCompiler>,
}

impl Workspace {
    pub fn new(sources: &[(&str, &str)]) -> Self {
        Self::with(sources, Passes::new(), RepositorySet::new(), CompilerOptions::default())
    }

    pub fn with(
        sources: &[(&str, &str)],
        passes: Passes,
        repositories: RepositorySet,
        options: CompilerOptions,
    ) -> Self {
        metagraph::logging::init_tracing();
        let store = GraphStore::new();
        let registry = Arc::new(SourceRegistry::new());
        for (id, content) in sources {
            registry
                .register_source(Source::new(*id, *content, false, true))
                .expect("register source");
        }
        let compiler = IncrementalCompiler::builder(store.clone(), registry.clone(), Arc::new(LineParser))
            .with_passes(passes)
            .with_repositories(repositories)
            .with_options(options)
            .build();
        Self {
            store,
            registry,
            compiler,
        }
    }

    pub fn node(&self, path: &str) -> NodeId {
        self.store
            .find_by_path(path)
            .unwrap_or_else(|| panic!("no element at {path}"))
    }

    pub fn edit(&self, id: &str, content: &str) {
        let changed = self
            .registry
            .update_content(&id.into(), content)
            .expect("update content");
        assert!(changed, "content of {id} did not change");
    }

    /// The class a class's first property is typed with.
    pub fn first_property_type(&self, class: NodeId) -> Option<NodeId> {
        let property = self.store.with_node(class, |n| n.targets(props::PROPERTIES).next())??;
        self.store.with_node(property, |n| n.targets(GENERIC_TYPE).next())?
    }
}
