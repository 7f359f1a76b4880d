//! Rehydrates a graph from source-graph artifacts.
//!
//! Loading runs as a sequence of timed steps over all artifacts at once:
//!
//! ```text
//! deserialize ─► initialize nodes ─► resolve (fixed point) ─► back references
//!                                                                   │
//!              pattern library ◄── source registry ◄── context ◄────┘
//! ```
//!
//! Each step over a large input is chunked onto the caller's worker pool.
//! Every task writes only the nodes of its own chunk.

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use rayon::ThreadPool;
use smol_str::SmolStr;

use crate::base::NodeId;
use crate::config::LoaderOptions;
use crate::error::{CoreError, Result};
use crate::graph::{BackReferencePopulator, GraphStore, NodeKind, Reference, Value};
use crate::parallel;
use crate::passes::PatternLibrary;
use crate::resolve::FixedPoint;
use crate::serialization::{SerializedNode, SerializedSource, SerializedValue};
use crate::source::{ElementsByParser, Source, SourceRegistry};

/// Summary of one [`GraphLoader::load`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub sources: usize,
    pub nodes: usize,
    pub top_level_nodes: usize,
    pub resolution_passes: usize,
}

/// One deserialized artifact with the node ids reserved for it.
struct Loaded {
    source: SerializedSource,
    ids: Vec<NodeId>,
}

impl Loaded {
    fn top_level(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.source
            .sections
            .iter()
            .flat_map(|s| s.elements.iter().map(|i| self.ids[*i as usize]))
    }
}

/// Loads source-graph artifacts into a store and a source registry.
pub struct GraphLoader {
    store: GraphStore,
    registry: Arc<SourceRegistry>,
    pool: Option<Arc<ThreadPool>>,
    options: LoaderOptions,
    pattern_library: Option<Arc<dyn PatternLibrary>>,
}

impl std::fmt::Debug for GraphLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphLoader")
            .field("store", &self.store.id())
            .field("parallel", &self.pool.is_some())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl GraphLoader {
    pub fn new(store: GraphStore, registry: Arc<SourceRegistry>) -> Self {
        Self {
            store,
            registry,
            pool: None,
            options: LoaderOptions::default(),
            pattern_library: None,
        }
    }

    pub fn with_pool(mut self, pool: Arc<ThreadPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_options(mut self, options: LoaderOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_pattern_library(mut self, library: Arc<dyn PatternLibrary>) -> Self {
        self.pattern_library = Some(library);
        self
    }

    fn pool(&self) -> Option<&ThreadPool> {
        self.pool.as_deref()
    }

    /// Load every artifact in `binaries`.
    ///
    /// References between artifacts, and into nodes already in the store,
    /// are resolved together; the order of `binaries` does not matter.
    #[tracing::instrument(level = "debug", skip_all, fields(files = binaries.len()))]
    pub fn load(&self, binaries: &[Vec<u8>]) -> Result<LoadReport> {
        let thresholds = &self.options.thresholds;
        let tx = self.store.current_transaction();
        let total = Instant::now();

        let start = Instant::now();
        let sources = parallel::map_reduce(
            self.pool(),
            tx.as_ref(),
            binaries,
            thresholds.deserialize_files,
            |chunk| {
                chunk
                    .iter()
                    .map(|bytes| SerializedSource::from_bytes(bytes))
                    .collect::<Result<Vec<_>>>()
            },
            concat,
        )?;
        let loaded: Vec<Loaded> = sources
            .into_iter()
            .map(|source| Loaded {
                ids: self.store.allocate_ids(source.nodes.len()),
                source,
            })
            .collect();
        let node_count: usize = loaded.iter().map(|l| l.ids.len()).sum();
        tracing::debug!(
            sources = loaded.len(),
            nodes = node_count,
            elapsed_s = start.elapsed().as_secs_f64(),
            "deserialized files"
        );

        let start = Instant::now();
        let all: Vec<(&Loaded, usize)> = loaded
            .iter()
            .flat_map(|l| (0..l.ids.len()).map(move |i| (l, i)))
            .collect();
        let (packaged, components): (Vec<_>, Vec<_>) = all
            .iter()
            .copied()
            .partition(|(l, i)| l.source.nodes[*i].package.is_some());
        parallel::for_each(self.pool(), tx.as_ref(), &packaged, thresholds.initialize_nodes, |(l, i)| {
            self.create(l, *i)
        })?;
        parallel::for_each(self.pool(), tx.as_ref(), &packaged, thresholds.initialize_nodes, |(l, i)| {
            self.attach(l, *i)
        })?;
        parallel::for_each(self.pool(), tx.as_ref(), &components, thresholds.initialize_nodes, |(l, i)| {
            self.create(l, *i)
        })?;
        parallel::for_each(self.pool(), tx.as_ref(), &all, thresholds.initialize_nodes, |(l, i)| {
            self.initialize(l, *i)
        })?;
        tracing::debug!(
            nodes = node_count,
            top_level = packaged.len(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "initialized nodes"
        );

        let start = Instant::now();
        let ids: Vec<NodeId> = loaded.iter().flat_map(|l| l.ids.iter().copied()).collect();
        let passes = FixedPoint::new(&self.store, self.pool(), thresholds.resolve_references).run(&ids)?;
        tracing::debug!(passes, elapsed_s = start.elapsed().as_secs_f64(), "resolved references");

        let start = Instant::now();
        let populator = BackReferencePopulator::new(self.store.clone());
        parallel::for_each(self.pool(), tx.as_ref(), &ids, thresholds.populate_back_references, |id| {
            populator.populate(*id)
        })?;
        tracing::debug!(elapsed_s = start.elapsed().as_secs_f64(), "populated back references");

        let start = Instant::now();
        let top_level: Vec<NodeId> = loaded.iter().flat_map(Loaded::top_level).collect();
        parallel::map_reduce(
            self.pool(),
            tx.as_ref(),
            &top_level,
            thresholds.update_context,
            |chunk| self.store.update_context(chunk),
            |(), ()| (),
        )?;
        tracing::debug!(
            instances = top_level.len(),
            elapsed_s = start.elapsed().as_secs_f64(),
            "updated context"
        );

        let start = Instant::now();
        for l in &loaded {
            self.register_source(l)?;
        }
        tracing::debug!(elapsed_s = start.elapsed().as_secs_f64(), "updated source registry");

        if let Some(library) = &self.pattern_library {
            let start = Instant::now();
            for &node in &top_level {
                library.possibly_register(node, &self.store);
            }
            tracing::debug!(elapsed_s = start.elapsed().as_secs_f64(), "updated pattern library");
        }

        let report = LoadReport {
            sources: loaded.len(),
            nodes: node_count,
            top_level_nodes: top_level.len(),
            resolution_passes: passes,
        };
        tracing::info!(
            sources = report.sources,
            nodes = report.nodes,
            elapsed_s = total.elapsed().as_secs_f64(),
            "loaded graph"
        );
        Ok(report)
    }

    fn create(&self, loaded: &Loaded, index: usize) -> Result<()> {
        let node = &loaded.source.nodes[index];
        self.store
            .create_node_with_id(loaded.ids[index], node.kind()?, &node.name, node.span.clone())
    }

    fn attach(&self, loaded: &Loaded, index: usize) -> Result<()> {
        match &loaded.source.nodes[index].package {
            Some(package) => self.store.attach_to_package(package, loaded.ids[index]),
            None => Ok(()),
        }
    }

    /// Set the parent and properties of one node. Only that node is written.
    fn initialize(&self, loaded: &Loaded, index: usize) -> Result<()> {
        let node: &SerializedNode = &loaded.source.nodes[index];
        let parent = node.parent.map(|p| loaded.ids[p as usize]);
        let mut properties: IndexMap<SmolStr, Vec<Value>> = IndexMap::with_capacity(node.properties.len());
        for property in &node.properties {
            let values = property
                .values
                .iter()
                .map(|v| to_value(v, &loaded.ids))
                .collect::<Result<Vec<_>>>()?;
            properties.insert(property.name.clone(), values);
        }
        self.store.update(loaded.ids[index], |n| {
            if parent.is_some() {
                n.parent = parent;
            }
            n.properties.extend(properties);
        })
    }

    fn register_source(&self, loaded: &Loaded) -> Result<()> {
        let serialized = &loaded.source;
        let source = match self.registry.get_source(&serialized.id) {
            Some(existing) => existing,
            None => self.registry.register_source(Source::new(
                serialized.id.clone(),
                serialized.content.as_str(),
                serialized.immutable,
                false,
            ))?,
        };
        let linkage: ElementsByParser = serialized
            .sections
            .iter()
            .map(|s| {
                let nodes = s.elements.iter().map(|i| loaded.ids[*i as usize]).collect();
                (s.parser.clone(), nodes)
            })
            .collect();
        source.link_instances(linkage);
        source.set_compiled(true);
        Ok(())
    }
}

fn to_value(value: &SerializedValue, ids: &[NodeId]) -> Result<Value> {
    Ok(match value {
        SerializedValue::Node(index) => Value::Node(ids[*index as usize]),
        SerializedValue::Reference { path, expected } => match expected {
            Some(classifier) => {
                let kind = NodeKind::from_classifier_path(classifier)
                    .ok_or_else(|| CoreError::invalid_format(format!("unknown classifier: {classifier}")))?;
                Value::Ref(Reference::expecting(path.clone(), kind))
            }
            None => Value::Ref(Reference::new(path.clone())),
        },
        SerializedValue::String(s) => Value::String(s.clone()),
        SerializedValue::Integer(i) => Value::Integer(*i),
        SerializedValue::Boolean(b) => Value::Boolean(*b),
    })
}

fn concat<T>(mut a: Vec<T>, b: Vec<T>) -> Vec<T> {
    a.extend(b);
    a
}
