//! Sources and the registry that owns them.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use smol_str::SmolStr;

use super::CodeStorage;
use crate::base::{LineCol, LineIndex, NodeId, SourceId, TextSize};
use crate::error::{CoreError, Result};
use crate::graph::GraphStore;

/// Nodes produced by a source, grouped by the parser (grammar section)
/// that produced them, in parse order.
pub type ElementsByParser = IndexMap<SmolStr, Vec<NodeId>>;

// ============================================================================
// SOURCE
// ============================================================================

#[derive(Debug)]
struct SourceData {
    content: Arc<str>,
    compiled: bool,
    elements_by_parser: Option<ElementsByParser>,
    new_instances: Vec<NodeId>,
}

/// A compilation unit.
///
/// Content and compilation state sit behind one per-source lock; they are
/// mutated from editor-driven call sites, never from parallel passes.
#[derive(Debug)]
pub struct Source {
    id: SourceId,
    immutable: bool,
    in_memory: bool,
    data: Mutex<SourceData>,
}

impl Source {
    pub fn new(id: impl Into<SourceId>, content: impl Into<Arc<str>>, immutable: bool, in_memory: bool) -> Self {
        let content = content.into();
        let empty = content.is_empty();
        Self {
            id: id.into(),
            immutable,
            in_memory,
            data: Mutex::new(SourceData {
                content,
                compiled: immutable || empty,
                elements_by_parser: empty.then(IndexMap::new),
                new_instances: Vec::new(),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn repository(&self) -> Option<&str> {
        self.id.repository()
    }

    pub fn content(&self) -> Arc<str> {
        self.data.lock().content.clone()
    }

    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    pub fn is_compiled(&self) -> bool {
        self.data.lock().compiled
    }

    /// `false` un-compiles; `true` only flips the flag.
    pub fn set_compiled(&self, compiled: bool) {
        if compiled {
            self.data.lock().compiled = true;
        } else {
            self.un_compile();
        }
    }

    /// Forget the nodes produced by the last compilation.
    pub fn un_compile(&self) {
        let mut data = self.data.lock();
        data.compiled = self.immutable;
        data.elements_by_parser = None;
        data.new_instances.clear();
    }

    pub fn elements_by_parser(&self) -> Option<ElementsByParser> {
        self.data.lock().elements_by_parser.clone()
    }

    /// Top-level nodes of the last compilation, in parser order.
    pub fn new_instances(&self) -> Vec<NodeId> {
        self.data.lock().new_instances.clone()
    }

    /// Store the produced nodes and derive the new-instance list from them.
    pub fn link_instances(&self, elements_by_parser: ElementsByParser) {
        let mut data = self.data.lock();
        data.new_instances = elements_by_parser.values().flatten().copied().collect();
        data.elements_by_parser = Some(elements_by_parser);
    }

    pub(crate) fn set_content(&self, content: Arc<str>) {
        self.data.lock().content = content;
    }
}

// ============================================================================
// EVENTS
// ============================================================================

/// Receives source mutations before the source's linkage is cleared.
pub trait SourceEventHandler: Send + Sync {
    fn update_source(&self, source: &Source, old_content: &str);
    fn delete_source(&self, source: &Source);
    fn move_source(&self, source: &Source, destination: &Source);
}

// ============================================================================
// REGISTRY
// ============================================================================

/// All sources known to a compiler, keyed by id in registration order.
#[derive(Default)]
pub struct SourceRegistry {
    sources: RwLock<IndexMap<SourceId, Arc<Source>>>,
    handlers: RwLock<Vec<Weak<dyn SourceEventHandler>>>,
    storage: Option<Arc<dyn CodeStorage>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.sources.read().len())
            .field("storage", &self.storage.is_some())
            .finish()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry persisting mutable, non-in-memory content to `storage`.
    pub fn with_storage(storage: Arc<dyn CodeStorage>) -> Self {
        Self {
            storage: Some(storage),
            ..Self::default()
        }
    }

    pub fn storage(&self) -> Option<&Arc<dyn CodeStorage>> {
        self.storage.as_ref()
    }

    pub fn register_source(&self, source: Source) -> Result<Arc<Source>> {
        let mut sources = self.sources.write();
        if sources.contains_key(source.id()) {
            return Err(CoreError::DuplicateSource(source.id().clone()));
        }
        let source = Arc::new(source);
        sources.insert(source.id().clone(), source.clone());
        Ok(source)
    }

    pub fn unregister_source(&self, id: &SourceId) -> Option<Arc<Source>> {
        self.sources.write().shift_remove(id)
    }

    pub fn get_source(&self, id: &SourceId) -> Option<Arc<Source>> {
        self.sources.read().get(id).cloned()
    }

    pub fn sources(&self) -> Vec<Arc<Source>> {
        self.sources.read().values().cloned().collect()
    }

    pub fn compiled_sources(&self) -> Vec<Arc<Source>> {
        self.sources
            .read()
            .values()
            .filter(|s| s.is_compiled())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handlers are held weakly; dropping the handler unsubscribes it.
    pub fn add_event_handler(&self, handler: Weak<dyn SourceEventHandler>) {
        self.handlers.write().push(handler);
    }

    fn handlers(&self) -> Vec<Arc<dyn SourceEventHandler>> {
        let mut handlers = self.handlers.write();
        handlers.retain(|h| h.strong_count() > 0);
        handlers.iter().filter_map(Weak::upgrade).collect()
    }

    fn require(&self, id: &SourceId) -> Result<Arc<Source>> {
        self.get_source(id)
            .ok_or_else(|| CoreError::invalid_argument(format!("Unknown source: {id}")))
    }

    fn persist(&self, source: &Source, write: impl FnOnce(&dyn CodeStorage) -> Result<()>) -> Result<()> {
        match &self.storage {
            Some(storage) if !source.is_in_memory() => write(storage.as_ref()),
            _ => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // mutation entry points
    // ------------------------------------------------------------------------

    /// Replace a source's content. Returns `false` when nothing changed.
    pub fn update_content(&self, id: &SourceId, content: &str) -> Result<bool> {
        let source = self.require(id)?;
        if source.is_immutable() {
            return Ok(false);
        }
        let old = source.content();
        if *old == *content {
            return Ok(false);
        }
        self.persist(&source, |storage| storage.write(id, content))?;
        source.set_content(Arc::from(content));
        for handler in self.handlers() {
            handler.update_source(&source, &old);
        }
        source.un_compile();
        tracing::debug!(source = %id, "updated source content");
        Ok(true)
    }

    /// Delete a source. A logical delete leaves storage untouched.
    pub fn delete_source(&self, id: &SourceId, logical: bool) -> Result<bool> {
        let source = self.require(id)?;
        if source.is_immutable() {
            return Ok(false);
        }
        if !logical {
            self.persist(&source, |storage| storage.delete(id))?;
        }
        for handler in self.handlers() {
            handler.delete_source(&source);
        }
        source.un_compile();
        self.unregister_source(id);
        tracing::debug!(source = %id, logical, "deleted source");
        Ok(true)
    }

    /// Move a source to a new id. The destination starts uncompiled.
    pub fn move_source(&self, id: &SourceId, destination: SourceId) -> Result<Option<Arc<Source>>> {
        let source = self.require(id)?;
        if source.is_immutable() {
            return Ok(None);
        }
        self.persist(&source, |storage| storage.move_source(id, &destination))?;
        let moved = Source::new(destination, source.content(), false, source.is_in_memory());
        moved.un_compile();
        let moved = self.register_source(moved)?;
        for handler in self.handlers() {
            handler.move_source(&source, &moved);
        }
        source.un_compile();
        self.unregister_source(id);
        tracing::debug!(source = %id, destination = %moved.id(), "moved source");
        Ok(Some(moved))
    }

    /// Re-read content from storage. A vanished file counts as a delete.
    pub fn refresh_content(&self, id: &SourceId) -> Result<bool> {
        let storage = self
            .storage
            .clone()
            .ok_or_else(|| CoreError::invalid_argument("No code storage to refresh from"))?;
        match storage.read(id)? {
            Some(content) => {
                let source = self.require(id)?;
                let old = source.content();
                if source.is_immutable() || *old == *content {
                    return Ok(false);
                }
                source.set_content(Arc::from(content.as_str()));
                for handler in self.handlers() {
                    handler.update_source(&source, &old);
                }
                source.un_compile();
                Ok(true)
            }
            None => self.delete_source(id, true),
        }
    }

    // ------------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------------

    /// Every occurrence of `pattern`, as positions per source.
    pub fn find_text(&self, pattern: &str) -> Vec<(SourceId, Vec<LineCol>)> {
        if pattern.is_empty() {
            return Vec::new();
        }
        self.sources()
            .into_iter()
            .filter_map(|source| {
                let content = source.content();
                let offsets: Vec<usize> = content.match_indices(pattern).map(|(i, _)| i).collect();
                if offsets.is_empty() {
                    return None;
                }
                let index = LineIndex::new(&content);
                let positions = offsets
                    .into_iter()
                    .map(|offset| index.line_col(TextSize::from(offset as u32)))
                    .collect();
                Some((source.id().clone(), positions))
            })
            .collect()
    }

    /// The narrowest node of a compiled source whose span contains the
    /// 1-indexed position.
    pub fn find_element_at(&self, store: &GraphStore, id: &SourceId, line: i32, col: i32) -> Option<NodeId> {
        let source = self.get_source(id)?;
        source
            .new_instances()
            .into_iter()
            .flat_map(|instance| store.owned_subtree(instance))
            .filter_map(|node| {
                let span = store.span(node)?;
                (span.source == *id && span.contains(line, col)).then_some((span.extent(), node))
            })
            .min()
            .map(|(_, node)| node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::SourceSpan;
    use crate::graph::{NodeKind, props};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        updates: AtomicUsize,
        deletes: AtomicUsize,
        moves: AtomicUsize,
        compiled_when_notified: Mutex<Vec<bool>>,
    }

    impl SourceEventHandler for Recorder {
        fn update_source(&self, source: &Source, _old: &str) {
            self.updates.fetch_add(1, Ordering::Relaxed);
            self.compiled_when_notified.lock().push(source.is_compiled());
        }
        fn delete_source(&self, _source: &Source) {
            self.deletes.fetch_add(1, Ordering::Relaxed);
        }
        fn move_source(&self, _source: &Source, _destination: &Source) {
            self.moves.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn registry_with_recorder() -> (SourceRegistry, Arc<Recorder>) {
        let registry = SourceRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn SourceEventHandler> = Arc::downgrade(&recorder) as Weak<dyn SourceEventHandler>;
        registry.add_event_handler(weak);
        (registry, recorder)
    }

    #[test]
    fn test_duplicate_source() {
        let registry = SourceRegistry::new();
        registry.register_source(Source::new("/m/a.pure", "x", false, true)).unwrap();
        let err = registry
            .register_source(Source::new("/m/a.pure", "y", false, true))
            .unwrap_err();
        assert_eq!(err.to_string(), "duplicate id: /m/a.pure");
    }

    #[test]
    fn test_new_source_flags() {
        assert!(!Source::new("/m/a.pure", "x", false, true).is_compiled());
        assert!(Source::new("/m/a.pure", "", false, true).is_compiled());
        assert!(Source::new("/m/a.pure", "x", true, true).is_compiled());
    }

    #[test]
    fn test_update_notifies_before_uncompile() {
        let (registry, recorder) = registry_with_recorder();
        let source = registry.register_source(Source::new("/m/a.pure", "x", false, true)).unwrap();
        source.link_instances(IndexMap::from([(SmolStr::new("Pure"), vec![NodeId::new(7)])]));
        source.set_compiled(true);

        assert!(!registry.update_content(source.id(), "x").unwrap());
        assert!(registry.update_content(source.id(), "y").unwrap());
        assert_eq!(recorder.updates.load(Ordering::Relaxed), 1);
        assert_eq!(*recorder.compiled_when_notified.lock(), vec![true]);
        assert!(!source.is_compiled());
        assert!(source.new_instances().is_empty());
        assert_eq!(&*source.content(), "y");
    }

    #[test]
    fn test_immutable_sources_ignore_mutations() {
        let (registry, recorder) = registry_with_recorder();
        let id = SourceId::new("/platform/m.pure");
        registry.register_source(Source::new(id.clone(), "x", true, true)).unwrap();
        assert!(!registry.update_content(&id, "y").unwrap());
        assert!(!registry.delete_source(&id, false).unwrap());
        assert!(registry.move_source(&id, SourceId::new("/platform/n.pure")).unwrap().is_none());
        assert_eq!(recorder.updates.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_delete_and_move() {
        let (registry, recorder) = registry_with_recorder();
        let a = SourceId::new("/m/a.pure");
        let b = SourceId::new("/m/b.pure");
        registry.register_source(Source::new(a.clone(), "x", false, true)).unwrap();
        registry.register_source(Source::new(b.clone(), "y", false, true)).unwrap();

        registry.move_source(&a, SourceId::new("/m/c.pure")).unwrap();
        assert!(registry.get_source(&a).is_none());
        assert_eq!(&*registry.get_source(&SourceId::new("/m/c.pure")).unwrap().content(), "x");

        registry.delete_source(&b, true).unwrap();
        assert!(registry.get_source(&b).is_none());
        assert_eq!(recorder.moves.load(Ordering::Relaxed), 1);
        assert_eq!(recorder.deletes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_find_text() {
        let registry = SourceRegistry::new();
        registry
            .register_source(Source::new("/m/a.pure", "Class X\nClass Y", false, true))
            .unwrap();
        let found = registry.find_text("Class");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1, vec![LineCol::new(0, 0), LineCol::new(1, 0)]);
    }

    #[test]
    fn test_find_element_at() {
        let store = GraphStore::new();
        let registry = SourceRegistry::new();
        let id = SourceId::new("/m/a.pure");
        let source = registry.register_source(Source::new(id.clone(), "...", false, true)).unwrap();

        let x = store
            .create_packaged_element("a", "X", NodeKind::Class, Some(SourceSpan::new(id.clone(), 1, 1, 5, 1)))
            .unwrap();
        let p = store
            .create_owned(x, props::PROPERTIES, NodeKind::Property, "p", Some(SourceSpan::new(id.clone(), 2, 3, 2, 12)))
            .unwrap();
        source.link_instances(IndexMap::from([(SmolStr::new("Pure"), vec![x])]));

        assert_eq!(registry.find_element_at(&store, &id, 2, 5), Some(p));
        assert_eq!(registry.find_element_at(&store, &id, 4, 1), Some(x));
        assert_eq!(registry.find_element_at(&store, &id, 9, 1), None);
    }
}
