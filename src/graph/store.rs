//! The node graph store.
//!
//! Nodes live behind individual `RwLock`s inside a shared map so that
//! parallel tasks can mutate disjoint nodes without contending on a global
//! lock. The name and classifier indices live next to the nodes and are
//! only changed through the store, which logs every change in the thread's
//! open transaction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use super::context::{Context, ContextChange};
use super::node::{Node, Value, props};
use super::transaction::Transaction;
use super::{NodeKind, walk};
use crate::base::{NodeId, SourceSpan};
use crate::error::{CoreError, Result};

/// Path of the root package.
pub const ROOT_PACKAGE: &str = "Root";
/// Immutable source holding the bootstrapped metamodel.
pub const M3_SOURCE: &str = "/platform/m3.pure";
/// Primitive types created at bootstrap, as top-level elements.
pub const PRIMITIVE_TYPES: &[&str] = &["String", "Integer", "Float", "Boolean", "Date", "Number"];
/// Package holding the import groups of every source.
pub const SYSTEM_IMPORTS: &str = "system::imports";

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

type NodeCell = Arc<RwLock<Node>>;

struct StoreInner {
    id: u64,
    nodes: RwLock<FxHashMap<NodeId, NodeCell>>,
    next_id: AtomicU32,
    context: RwLock<Context>,
    /// Serializes package creation and element attachment.
    packages: Mutex<()>,
    root: NodeId,
    classifiers: FxHashMap<NodeKind, NodeId>,
}

/// Shared handle to a node graph. Clones refer to the same graph.
#[derive(Clone)]
pub struct GraphStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore")
            .field("id", &self.inner.id)
            .field("nodes", &self.node_count())
            .finish()
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown_node(id: NodeId) -> CoreError {
    CoreError::invalid_argument(format!("Unknown node: {id}"))
}

fn join_path(package: &str, name: &str) -> String {
    if package.is_empty() || package == ROOT_PACKAGE {
        name.to_string()
    } else {
        format!("{package}::{name}")
    }
}

// ============================================================================
// BOOTSTRAP
// ============================================================================

struct Bootstrap {
    nodes: FxHashMap<NodeId, Node>,
    context: Context,
    next: u32,
    line: i32,
}

impl Bootstrap {
    fn alloc(&mut self) -> NodeId {
        let id = NodeId::new(self.next);
        self.next += 1;
        id
    }

    fn span(&mut self, name: &str) -> SourceSpan {
        self.line += 1;
        let end = name.len() as i32;
        SourceSpan::new(M3_SOURCE, self.line, 1, self.line, end.max(1))
    }

    fn insert(&mut self, id: NodeId, name: &str, kind: NodeKind, classifier: NodeId, span: Option<SourceSpan>) {
        self.nodes.insert(
            id,
            Node {
                id,
                name: SmolStr::new(name),
                classifier,
                kind,
                parent: None,
                span,
                properties: IndexMap::new(),
            },
        );
    }

    fn attach(&mut self, parent: NodeId, child: NodeId, path: String) {
        if let Some(node) = self.nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
        if let Some(node) = self.nodes.get_mut(&parent) {
            node.values_mut(props::CHILDREN).push(Value::Node(child));
        }
        let _ = self.context.insert_path(SmolStr::new(path), child);
    }

    fn package(&mut self, parent: NodeId, parent_path: &str, name: &str, classifier: NodeId) -> (NodeId, String) {
        let path = join_path(parent_path, name);
        if let Some(existing) = self.context.find(&path) {
            return (existing, path);
        }
        let id = self.alloc();
        self.insert(id, name, NodeKind::Package, classifier, None);
        self.attach(parent, id, path.clone());
        (id, path)
    }

    fn packages(&mut self, root: NodeId, path: &str, classifier: NodeId) -> NodeId {
        let mut current = root;
        let mut current_path = String::new();
        for segment in path.split("::") {
            let (id, p) = self.package(current, &current_path, segment, classifier);
            current = id;
            current_path = p;
        }
        current
    }
}

fn bootstrap() -> StoreInner {
    let mut b = Bootstrap {
        nodes: FxHashMap::default(),
        context: Context::default(),
        next: 0,
        line: 0,
    };

    let root = b.alloc();
    let classifiers: FxHashMap<NodeKind, NodeId> = NodeKind::CONCRETE.iter().map(|&kind| (kind, b.alloc())).collect();
    let package_cls = classifiers[&NodeKind::Package];
    let class_cls = classifiers[&NodeKind::Class];
    let primitive_cls = classifiers[&NodeKind::PrimitiveType];

    b.insert(root, ROOT_PACKAGE, NodeKind::Package, package_cls, None);
    let _ = b.context.insert_path(SmolStr::new(ROOT_PACKAGE), root);

    for &kind in NodeKind::CONCRETE {
        let package = b.packages(root, kind.classifier_package(), package_cls);
        let id = classifiers[&kind];
        let span = b.span(kind.name());
        b.insert(id, kind.name(), NodeKind::Class, class_cls, Some(span));
        b.attach(package, id, kind.classifier_path());
        b.context.register(class_cls, id);
    }

    for name in PRIMITIVE_TYPES {
        let id = b.alloc();
        let span = b.span(name);
        b.insert(id, name, NodeKind::PrimitiveType, primitive_cls, Some(span));
        b.attach(root, id, name.to_string());
        b.context.register(primitive_cls, id);
    }

    StoreInner {
        id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
        nodes: RwLock::new(
            b.nodes
                .into_iter()
                .map(|(id, node)| (id, Arc::new(RwLock::new(node))))
                .collect(),
        ),
        next_id: AtomicU32::new(b.next),
        context: RwLock::new(b.context),
        packages: Mutex::new(()),
        root,
        classifiers,
    }
}

// ============================================================================
// STORE
// ============================================================================

impl GraphStore {
    /// A store holding only the bootstrapped metamodel.
    pub fn new() -> Self {
        let inner = bootstrap();
        tracing::debug!(store = inner.id, nodes = inner.nodes.read().len(), "bootstrapped graph store");
        Self { inner: Arc::new(inner) }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        self.inner.root
    }

    /// Classifier node of a concrete kind.
    pub fn classifier(&self, kind: NodeKind) -> Option<NodeId> {
        self.inner.classifiers.get(&kind).copied()
    }

    pub fn new_transaction(&self, committable: bool) -> Transaction {
        Transaction::new(self.clone(), committable)
    }

    /// The transaction open for this store in the current thread.
    pub fn current_transaction(&self) -> Option<Transaction> {
        Transaction::current_for(self.inner.id)
    }

    fn cell(&self, id: NodeId) -> Option<NodeCell> {
        self.inner.nodes.read().get(&id).cloned()
    }

    fn record_context(&self, change: Option<ContextChange>) {
        if let (Some(change), Some(tx)) = (change, self.current_transaction()) {
            tx.record_context(change);
        }
    }

    // ------------------------------------------------------------------------
    // reads
    // ------------------------------------------------------------------------

    pub fn contains(&self, id: NodeId) -> bool {
        self.inner.nodes.read().contains_key(&id)
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.read().len()
    }

    /// All node ids in ascending order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.inner.nodes.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> Option<R> {
        let cell = self.cell(id)?;
        let node = cell.read();
        Some(f(&node))
    }

    /// A copy of the node.
    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.with_node(id, Node::clone)
    }

    pub fn node_kind(&self, id: NodeId) -> Option<NodeKind> {
        self.with_node(id, Node::kind)
    }

    pub fn name(&self, id: NodeId) -> Option<SmolStr> {
        self.with_node(id, |n| n.name.clone())
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.with_node(id, Node::parent).flatten()
    }

    pub fn span(&self, id: NodeId) -> Option<SourceSpan> {
        self.with_node(id, |n| n.span.clone()).flatten()
    }

    pub fn classifier_path(&self, id: NodeId) -> Option<String> {
        self.node_kind(id).map(NodeKind::classifier_path)
    }

    pub fn is_package(&self, id: NodeId) -> bool {
        self.node_kind(id) == Some(NodeKind::Package)
    }

    /// True when the node's parent is a package.
    pub fn is_packaged(&self, id: NodeId) -> bool {
        self.parent(id).is_some_and(|p| self.is_package(p))
    }

    /// `a::b::X` for packaged elements and packages, `Root` for the root package.
    pub fn path_of(&self, id: NodeId) -> Option<String> {
        if id == self.inner.root {
            return Some(ROOT_PACKAGE.to_string());
        }
        let mut segments = Vec::new();
        let mut current = id;
        while current != self.inner.root {
            let (name, parent) = self.with_node(current, |n| (n.name.clone(), n.parent))?;
            let parent = parent?;
            if !self.is_package(parent) {
                return None;
            }
            segments.push(name);
            current = parent;
        }
        segments.reverse();
        Some(segments.join("::"))
    }

    /// First ancestor (or the node itself) whose parent is a package.
    pub fn containing_element(&self, id: NodeId) -> Option<NodeId> {
        let mut current = id;
        loop {
            let parent = self.parent(current)?;
            if self.is_package(parent) {
                return Some(current);
            }
            current = parent;
        }
    }

    /// The node and everything it owns, breadth first. Back-reference
    /// properties are not followed.
    pub fn owned_subtree(&self, id: NodeId) -> Vec<NodeId> {
        walk::owned_subtree(self, id, false)
    }

    pub fn find_by_path(&self, path: &str) -> Option<NodeId> {
        let path = path.strip_prefix("Root::").unwrap_or(path);
        self.inner.context.read().find(path)
    }

    /// Registered instances of a concrete kind, in registration order.
    pub fn instances_of(&self, kind: NodeKind) -> Vec<NodeId> {
        match self.classifier(kind) {
            Some(cls) => self.inner.context.read().instances(cls),
            None => Vec::new(),
        }
    }

    pub fn is_registered(&self, id: NodeId) -> bool {
        self.inner.context.read().is_registered(id)
    }

    // ------------------------------------------------------------------------
    // creation
    // ------------------------------------------------------------------------

    /// Create a detached node.
    pub fn create_node(&self, kind: NodeKind, name: &str, span: Option<SourceSpan>) -> Result<NodeId> {
        let id = NodeId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.create_node_with_id(id, kind, name, span)?;
        Ok(id)
    }

    /// Reserve `count` consecutive ids for nodes created later with
    /// [`create_node_with_id`](Self::create_node_with_id).
    pub(crate) fn allocate_ids(&self, count: usize) -> Vec<NodeId> {
        let first = self.inner.next_id.fetch_add(count as u32, Ordering::Relaxed);
        (first..first + count as u32).map(NodeId::new).collect()
    }

    pub(crate) fn create_node_with_id(
        &self,
        id: NodeId,
        kind: NodeKind,
        name: &str,
        span: Option<SourceSpan>,
    ) -> Result<()> {
        let classifier = self
            .classifier(kind)
            .ok_or_else(|| CoreError::invalid_argument(format!("Cannot instantiate abstract kind {kind}")))?;
        let node = Node {
            id,
            name: SmolStr::new(name),
            classifier,
            kind,
            parent: None,
            span,
            properties: IndexMap::new(),
        };
        self.inner.nodes.write().insert(id, Arc::new(RwLock::new(node)));
        if let Some(tx) = self.current_transaction() {
            tx.record_created(id);
        }
        Ok(())
    }

    /// Make `child` owned by `parent` through `property`.
    pub fn add_owned(&self, parent: NodeId, property: &str, child: NodeId) -> Result<()> {
        if !self.contains(parent) {
            return Err(unknown_node(parent));
        }
        self.update(child, |n| n.parent = Some(parent))?;
        self.add_value(parent, property, Value::Node(child))
    }

    /// Create a node owned by `parent` through `property`.
    pub fn create_owned(
        &self,
        parent: NodeId,
        property: &str,
        kind: NodeKind,
        name: &str,
        span: Option<SourceSpan>,
    ) -> Result<NodeId> {
        let id = self.create_node(kind, name, span)?;
        self.add_owned(parent, property, id)?;
        Ok(id)
    }

    /// The package at `path`, creating missing packages.
    pub fn ensure_package(&self, path: &str) -> Result<NodeId> {
        let _lock = self.inner.packages.lock();
        self.ensure_package_locked(path)
    }

    fn ensure_package_locked(&self, path: &str) -> Result<NodeId> {
        let path = path.strip_prefix("Root::").unwrap_or(path);
        if path.is_empty() || path == ROOT_PACKAGE {
            return Ok(self.inner.root);
        }
        let mut current = self.inner.root;
        let mut current_path = String::new();
        for segment in path.split("::") {
            if segment.is_empty() {
                return Err(CoreError::invalid_argument(format!("Invalid package path: '{path}'")));
            }
            let segment_path = join_path(&current_path, segment);
            current = match self.find_by_path(&segment_path) {
                Some(existing) if self.is_package(existing) => existing,
                Some(_) => {
                    return Err(CoreError::invalid_argument(format!("'{segment_path}' is not a package")));
                }
                None => {
                    let id = self.create_node(NodeKind::Package, segment, None)?;
                    self.attach_locked(current, id, &segment_path)?;
                    id
                }
            };
            current_path = segment_path;
        }
        Ok(current)
    }

    fn attach_locked(&self, package: NodeId, id: NodeId, path: &str) -> Result<()> {
        let change = self
            .inner
            .context
            .write()
            .insert_path(SmolStr::new(path), id)
            .map_err(|_| CoreError::DuplicateElement(SmolStr::new(path)))?;
        self.record_context(change);
        self.update(id, |n| n.parent = Some(package))?;
        self.add_value(package, props::CHILDREN, Value::Node(id))
    }

    /// Create a packaged element, creating its packages as needed.
    pub fn create_packaged_element(
        &self,
        package: &str,
        name: &str,
        kind: NodeKind,
        span: Option<SourceSpan>,
    ) -> Result<NodeId> {
        let _lock = self.inner.packages.lock();
        let package_id = self.ensure_package_locked(package)?;
        let path = join_path(package.strip_prefix("Root::").unwrap_or(package), name);
        if self.find_by_path(&path).is_some() {
            return Err(CoreError::DuplicateElement(SmolStr::new(path)));
        }
        let id = self.create_node(kind, name, span)?;
        self.attach_locked(package_id, id, &path)?;
        Ok(id)
    }

    /// Attach an existing detached node to the package at `package`.
    pub fn attach_to_package(&self, package: &str, id: NodeId) -> Result<()> {
        let _lock = self.inner.packages.lock();
        let package_id = self.ensure_package_locked(package)?;
        let name = self.name(id).ok_or_else(|| unknown_node(id))?;
        let path = join_path(package.strip_prefix("Root::").unwrap_or(package), &name);
        self.attach_locked(package_id, id, &path)
    }

    // ------------------------------------------------------------------------
    // mutation
    // ------------------------------------------------------------------------

    /// Mutate one node. The node is snapshotted in the open transaction first.
    pub fn update<R>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> R) -> Result<R> {
        let cell = self.cell(id).ok_or_else(|| unknown_node(id))?;
        let mut node = cell.write();
        if let Some(tx) = self.current_transaction() {
            tx.record_touched(&node);
        }
        Ok(f(&mut node))
    }

    pub fn set_span(&self, id: NodeId, span: Option<SourceSpan>) -> Result<()> {
        self.update(id, |n| n.span = span)
    }

    pub fn set_values(&self, id: NodeId, property: &str, values: Vec<Value>) -> Result<()> {
        self.update(id, |n| {
            if values.is_empty() {
                n.properties.shift_remove(property);
            } else {
                *n.values_mut(property) = values;
            }
        })
    }

    pub fn add_value(&self, id: NodeId, property: &str, value: Value) -> Result<()> {
        self.update(id, |n| n.values_mut(property).push(value))
    }

    /// Remove matching values; returns how many were removed.
    pub fn remove_values_where(&self, id: NodeId, property: &str, pred: impl Fn(&Value) -> bool) -> Result<usize> {
        let cell = self.cell(id).ok_or_else(|| unknown_node(id))?;
        let mut node = cell.write();
        let count = node.values(property).iter().filter(|v| pred(v)).count();
        if count == 0 {
            return Ok(0);
        }
        if let Some(tx) = self.current_transaction() {
            tx.record_touched(&node);
        }
        let values = node.values_mut(property);
        values.retain(|v| !pred(v));
        if values.is_empty() {
            node.properties.shift_remove(property);
        }
        Ok(count)
    }

    // ------------------------------------------------------------------------
    // removal
    // ------------------------------------------------------------------------

    /// Unlink a packaged element from its package and the name index.
    /// Returns the former package.
    pub fn detach_from_package(&self, id: NodeId) -> Result<Option<NodeId>> {
        let _lock = self.inner.packages.lock();
        let Some(package) = self.parent(id).filter(|p| self.is_package(*p)) else {
            return Ok(None);
        };
        if let Some(path) = self.path_of(id) {
            let change = self.inner.context.write().remove_path(&path);
            self.record_context(change);
        }
        self.remove_values_where(package, props::CHILDREN, |v| *v == Value::Node(id))?;
        self.update(id, |n| n.parent = None)?;
        Ok(Some(package))
    }

    /// Remove `package` and then its ancestors while they are empty
    /// span-less packages. The root package is never removed.
    pub fn remove_empty_packages(&self, package: NodeId) -> Result<usize> {
        let mut removed = 0;
        let mut current = package;
        while current != self.inner.root && self.contains(current) {
            let removable = self
                .with_node(current, |n| {
                    n.kind == NodeKind::Package && n.span.is_none() && n.values(props::CHILDREN).is_empty()
                })
                .unwrap_or(false);
            if !removable {
                break;
            }
            let parent = self.detach_from_package(current)?;
            self.remove_node(current);
            removed += 1;
            match parent {
                Some(p) => current = p,
                None => break,
            }
        }
        Ok(removed)
    }

    /// Delete one node. Edges pointing at it are left alone.
    pub fn remove_node(&self, id: NodeId) -> Option<Node> {
        let cell = self.inner.nodes.write().remove(&id)?;
        let node = cell.read().clone();
        if let Some(tx) = self.current_transaction() {
            tx.record_touched(&node);
        }
        let change = self.inner.context.write().unregister(id);
        self.record_context(change);
        Some(node)
    }

    /// Delete a node and everything it owns, back-reference nodes included.
    pub fn remove_subtree(&self, id: NodeId) -> usize {
        walk::owned_subtree(self, id, true)
            .into_iter()
            .filter(|n| self.remove_node(*n).is_some())
            .count()
    }

    // ------------------------------------------------------------------------
    // context indices
    // ------------------------------------------------------------------------

    /// Register a node under its classifier; packaged nodes also get their path.
    pub fn register_in_context(&self, id: NodeId) -> Result<()> {
        let classifier = self.with_node(id, Node::classifier).ok_or_else(|| unknown_node(id))?;
        if let Some(path) = self.path_of(id).filter(|_| self.is_packaged(id)) {
            let change = self
                .inner
                .context
                .write()
                .insert_path(SmolStr::new(&path), id)
                .map_err(|_| CoreError::DuplicateElement(SmolStr::new(&path)))?;
            self.record_context(change);
        }
        let change = self.inner.context.write().register(classifier, id);
        self.record_context(change);
        Ok(())
    }

    pub fn remove_from_context(&self, id: NodeId) {
        let change = self.inner.context.write().unregister(id);
        self.record_context(change);
    }

    pub fn update_context(&self, ids: &[NodeId]) -> Result<()> {
        ids.iter().try_for_each(|id| self.register_in_context(*id))
    }

    /// Recompute the exclusion set: the root package and its children, the
    /// members of [`SYSTEM_IMPORTS`] and the packages their imports name.
    /// Returns the size of the new set.
    pub fn rebuild_exclusion_set(&self) -> usize {
        let root = self.inner.root;
        let mut excluded: FxHashSet<NodeId> = std::iter::once(root).chain(self.children(root)).collect();
        if let Some(imports) = self.find_by_path(SYSTEM_IMPORTS) {
            for group in self.children(imports) {
                excluded.insert(group);
                if self.node_kind(group) != Some(NodeKind::ImportGroup) {
                    continue;
                }
                let imported: Vec<NodeId> = self
                    .with_node(group, |n| n.targets(props::IMPORTS).collect::<Vec<_>>())
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|import| {
                        let path = self.with_node(import, |n| {
                            n.first(props::PATH).and_then(Value::as_str).map(SmolStr::new)
                        })??;
                        self.find_by_path(&path)
                    })
                    .collect();
                excluded.extend(imported);
            }
        }
        let count = excluded.len();
        let change = self.inner.context.write().replace_excluded(excluded);
        self.record_context(change);
        count
    }

    pub fn is_excluded(&self, id: NodeId) -> bool {
        self.inner.context.read().is_excluded(id)
    }

    /// The current exclusion set, sorted.
    pub fn excluded(&self) -> Vec<NodeId> {
        self.inner.context.read().excluded()
    }

    fn children(&self, package: NodeId) -> Vec<NodeId> {
        self.with_node(package, |n| n.targets(props::CHILDREN).collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // undo
    // ------------------------------------------------------------------------

    pub(crate) fn undo(
        &self,
        created: impl IntoIterator<Item = NodeId>,
        snapshots: FxHashMap<NodeId, Node>,
        context: Vec<ContextChange>,
    ) -> std::result::Result<(), String> {
        let restored: FxHashSet<NodeId> = snapshots.keys().copied().collect();
        {
            let mut nodes = self.inner.nodes.write();
            for id in created {
                nodes.remove(&id);
            }
            for (id, node) in snapshots {
                match nodes.get(&id) {
                    Some(cell) => *cell.write() = node,
                    None => {
                        nodes.insert(id, Arc::new(RwLock::new(node)));
                    }
                }
            }
        }
        {
            let mut ctx = self.inner.context.write();
            for change in context.into_iter().rev() {
                ctx.undo(change);
            }
        }

        let mut dangling: Vec<_> = restored
            .into_iter()
            .filter_map(|id| {
                let parent = self.parent(id)?;
                (!self.contains(parent)).then_some((id, parent))
            })
            .collect();
        dangling.sort_unstable();
        match dangling.first() {
            None => Ok(()),
            Some((id, parent)) => Err(format!(
                "{} restored node(s) reference missing parents, e.g. {id} -> {parent}",
                dangling.len()
            )),
        }
    }
}
