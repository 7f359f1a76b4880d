//! Metadata generation from a compiled graph.
//!
//! For each packaged element the generator walks everything reachable from
//! it. A reached node is *internal* when the element's span subsumes the
//! node's span and *external* otherwise; the walk stops at external nodes.
//! External nodes become the element's external references, and the
//! back-reference lists of each external node, filtered to internal
//! referrers, become back references recorded against the external node's
//! containing element.

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::IndexSet;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use super::{BackReference, ConcreteElementMetadata, ElementExternalReferenceMetadata, ModuleMetadata, ModuleMetadataBuilder};
use super::{SourceMetadata, SourceSectionMetadata};
use crate::base::{NodeId, SourceSpan};
use crate::config::Thresholds;
use crate::error::{CoreError, Result};
use crate::graph::{GraphStore, NodeKind, Value, props};
use crate::resolve::ReferenceIds;
use crate::source::SourceRegistry;

/// Back references of one external node, keyed by the referring node.
///
/// Built only for nodes with long back-reference lists so that each element
/// looks up its own internal nodes instead of scanning the lists.
#[derive(Debug, Default)]
struct IndexedBackReferences {
    by_referrer: FxHashMap<NodeId, Vec<BackReference>>,
}

impl IndexedBackReferences {
    fn collect(&self, internal: &IndexSet<NodeId>) -> Vec<BackReference> {
        internal
            .iter()
            .filter_map(|n| self.by_referrer.get(n))
            .flatten()
            .cloned()
            .collect()
    }
}

/// Computes manifest entries, external references and back references for
/// single elements.
///
/// Reference ids and indexed back references are cached, so an instance must
/// not outlive the graph state it was created for.
#[derive(Debug)]
pub struct ConcreteElementMetadataGenerator {
    store: GraphStore,
    ids: ReferenceIds,
    cache_threshold: usize,
    indexed: Mutex<FxHashMap<NodeId, Arc<IndexedBackReferences>>>,
}

impl ConcreteElementMetadataGenerator {
    pub fn new(store: GraphStore) -> Self {
        Self {
            ids: ReferenceIds::new(store.clone()),
            store,
            cache_threshold: Thresholds::default().back_reference_cache,
            indexed: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_cache_threshold(mut self, threshold: usize) -> Self {
        self.cache_threshold = threshold;
        self
    }

    pub fn reference_id_version(&self) -> i32 {
        self.ids.version()
    }

    /// Add the metadata of `element` to `builder`.
    pub fn compute_metadata(&self, builder: &mut ModuleMetadataBuilder, element: NodeId) -> Result<()> {
        let path = self.store.path_of(element).filter(|_| self.store.is_packaged(element)).ok_or_else(|| {
            CoreError::invalid_argument(format!(
                "Not a PackageableElement: {}",
                self.store.name(element).unwrap_or_default()
            ))
        })?;
        let span = self
            .store
            .span(element)
            .ok_or_else(|| CoreError::invalid_argument(format!("Missing source information for {path}")))?;
        let classifier_path = self
            .store
            .classifier_path(element)
            .ok_or_else(|| CoreError::invalid_argument(format!("Cannot find classifier for {path}")))?;

        builder
            .manifest_mut()
            .add_element(ConcreteElementMetadata::new(path.as_str(), classifier_path, span.clone()));

        let (internal, external) = self.walk(element, &span);

        let element_is_association = self.store.node_kind(element) == Some(NodeKind::Association);
        let mut external_ids = Vec::with_capacity(external.len());
        for &node in &external {
            let id = self.ids.reference_id(node)?;
            let back_references = self.back_references(node, &internal, element_is_association)?;
            if !back_references.is_empty() {
                let owner = self
                    .store
                    .containing_element(node)
                    .and_then(|e| self.store.path_of(e))
                    .ok_or_else(|| {
                        CoreError::invalid_argument(format!("Cannot find containing element for external reference {id}"))
                    })?;
                builder.add_back_references(owner, id.as_str(), back_references);
            }
            external_ids.push(id);
        }
        builder.add_external_references(ElementExternalReferenceMetadata::new(path, external_ids));
        Ok(())
    }

    fn is_external(&self, element: NodeId, element_span: &SourceSpan, node: NodeId) -> bool {
        if node == element {
            return false;
        }
        match self.store.span(node) {
            None => self.store.is_package(node),
            Some(span) => !element_span.subsumes(&span),
        }
    }

    /// Internal nodes (the element first) and accepted external nodes, both
    /// in discovery order.
    fn walk(&self, element: NodeId, span: &SourceSpan) -> (IndexSet<NodeId>, IndexSet<NodeId>) {
        let mut internal = IndexSet::from([element]);
        let mut external = IndexSet::new();
        let mut queue = VecDeque::from([element]);
        while let Some(current) = queue.pop_front() {
            let targets: Vec<NodeId> = self
                .store
                .with_node(current, |n| {
                    n.properties()
                        .filter(|(name, _)| !props::is_back_reference(name))
                        .flat_map(|(_, values)| values.iter().filter_map(Value::target))
                        .collect()
                })
                .unwrap_or_default();
            for target in targets {
                if internal.contains(&target) || external.contains(&target) || !self.store.contains(target) {
                    continue;
                }
                if self.is_external(element, span, target) {
                    if self.store.node_kind(target) != Some(NodeKind::ImportGroup) {
                        external.insert(target);
                    }
                } else {
                    internal.insert(target);
                    queue.push_back(target);
                }
            }
        }
        (internal, external)
    }

    /// Back references from `internal` nodes to the external `node`, sorted.
    fn back_references(
        &self,
        node: NodeId,
        internal: &IndexSet<NodeId>,
        element_is_association: bool,
    ) -> Result<Vec<BackReference>> {
        let Some(kind) = self.store.node_kind(node) else {
            return Ok(Vec::new());
        };
        let lists = self.back_reference_lists(node, kind, element_is_association);
        let longest = lists.iter().map(|(_, entries)| entries.len()).max().unwrap_or(0);

        let mut result = if longest >= self.cache_threshold {
            self.indexed(node, kind)?.collect(internal)
        } else {
            let mut result = Vec::new();
            for (property, entries) in &lists {
                for &entry in entries {
                    if let Some((referrer, back_reference)) = self.to_back_reference(property, entry)? {
                        if internal.contains(&referrer) {
                            result.push(back_reference);
                        }
                    }
                }
            }
            result
        };
        if !element_is_association {
            result.retain(|b| {
                !matches!(
                    b,
                    BackReference::PropertyFromAssociation { .. } | BackReference::QualifiedPropertyFromAssociation { .. }
                )
            });
        }
        result.sort();
        result.dedup();
        Ok(result)
    }

    /// The back-reference properties relevant for a node of `kind`.
    fn back_reference_lists(
        &self,
        node: NodeId,
        kind: NodeKind,
        include_associations: bool,
    ) -> Vec<(&'static str, Vec<NodeId>)> {
        let mut wanted: Vec<&'static str> = Vec::with_capacity(4);
        if kind.is_a(NodeKind::Function) {
            wanted.push(props::APPLICATIONS);
        }
        if kind.is_a(NodeKind::Annotation) {
            wanted.push(props::MODEL_ELEMENTS);
        }
        if kind.is_a(NodeKind::Class) && include_associations {
            wanted.push(props::PROPERTIES_FROM_ASSOCIATIONS);
            wanted.push(props::QUALIFIED_PROPERTIES_FROM_ASSOCIATIONS);
        }
        if kind.is_a(NodeKind::Referenceable) {
            wanted.push(props::REFERENCE_USAGES);
        }
        if kind.is_a(NodeKind::Type) {
            wanted.push(props::SPECIALIZATIONS);
        }
        self.store
            .with_node(node, |n| {
                wanted
                    .into_iter()
                    .map(|p| (p, n.targets(p).collect::<Vec<_>>()))
                    .filter(|(_, entries)| !entries.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The referring node and back reference for one list entry.
    fn to_back_reference(&self, property: &str, entry: NodeId) -> Result<Option<(NodeId, BackReference)>> {
        let back_reference = match property {
            props::APPLICATIONS => BackReference::application(self.ids.reference_id(entry)?),
            props::MODEL_ELEMENTS => BackReference::model_element(self.ids.reference_id(entry)?),
            props::PROPERTIES_FROM_ASSOCIATIONS => BackReference::property_from_association(self.ids.reference_id(entry)?),
            props::QUALIFIED_PROPERTIES_FROM_ASSOCIATIONS => {
                BackReference::qualified_property_from_association(self.ids.reference_id(entry)?)
            }
            props::SPECIALIZATIONS => BackReference::specialization(self.ids.reference_id(entry)?),
            props::REFERENCE_USAGES => {
                let Some(usage) = self.store.node(entry) else {
                    return Ok(None);
                };
                let Some(owner) = usage.targets(props::OWNER).next() else {
                    return Ok(None);
                };
                let property = usage.first(props::PROPERTY_NAME).and_then(Value::as_str).unwrap_or_default();
                let offset = usage.first(props::OFFSET).and_then(Value::as_integer).unwrap_or(0);
                let offset = i32::try_from(offset)
                    .map_err(|_| CoreError::invalid_argument(format!("Reference usage offset out of range: {offset}")))?;
                let back_reference = BackReference::reference_usage(
                    self.ids.reference_id(owner)?,
                    property,
                    offset,
                    usage.span().cloned(),
                );
                return Ok(Some((owner, back_reference)));
            }
            _ => return Ok(None),
        };
        Ok(Some((entry, back_reference)))
    }

    fn indexed(&self, node: NodeId, kind: NodeKind) -> Result<Arc<IndexedBackReferences>> {
        if let Some(cached) = self.indexed.lock().get(&node) {
            return Ok(cached.clone());
        }
        let mut indexed = IndexedBackReferences::default();
        for (property, entries) in self.back_reference_lists(node, kind, true) {
            for entry in entries {
                if let Some((referrer, back_reference)) = self.to_back_reference(property, entry)? {
                    indexed.by_referrer.entry(referrer).or_default().push(back_reference);
                }
            }
        }
        tracing::trace!(%node, referrers = indexed.by_referrer.len(), "indexed back references");
        let indexed = Arc::new(indexed);
        self.indexed.lock().insert(node, indexed.clone());
        Ok(indexed)
    }
}

/// Generates [`ModuleMetadata`] for the compiled sources of one module.
#[derive(Debug)]
pub struct ModuleMetadataGenerator {
    store: GraphStore,
    elements: ConcreteElementMetadataGenerator,
    dependencies: FxHashMap<SmolStr, Vec<SmolStr>>,
}

impl ModuleMetadataGenerator {
    pub fn new(store: GraphStore) -> Self {
        Self {
            elements: ConcreteElementMetadataGenerator::new(store.clone()),
            store,
            dependencies: FxHashMap::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: &Thresholds) -> Self {
        self.elements = self.elements.with_cache_threshold(thresholds.back_reference_cache);
        self
    }

    /// Declare the modules `module` depends on.
    pub fn with_dependencies<S: Into<SmolStr>>(
        mut self,
        module: impl Into<SmolStr>,
        dependencies: impl IntoIterator<Item = S>,
    ) -> Self {
        self.dependencies
            .insert(module.into(), dependencies.into_iter().map(Into::into).collect());
        self
    }

    #[tracing::instrument(level = "debug", skip(self, registry))]
    pub fn generate(&self, module: &str, registry: &SourceRegistry) -> Result<ModuleMetadata> {
        let mut builder = ModuleMetadata::builder(module, self.elements.reference_id_version());
        for dependency in self.dependencies.get(module).into_iter().flatten() {
            builder.add_dependency(dependency.clone());
        }

        let mut sources: Vec<_> = registry
            .compiled_sources()
            .into_iter()
            .filter(|s| s.repository() == Some(module))
            .collect();
        sources.sort_by(|a, b| a.id().cmp(b.id()));

        let mut seen = FxHashSet::default();
        for source in &sources {
            let mut sections = Vec::new();
            for (parser, nodes) in source.elements_by_parser().unwrap_or_default() {
                let mut paths = Vec::with_capacity(nodes.len());
                for node in nodes {
                    if !seen.insert(node) {
                        continue;
                    }
                    let path = self.store.path_of(node).ok_or_else(|| {
                        CoreError::invalid_argument(format!(
                            "Not a PackageableElement: {} in {}",
                            self.store.name(node).unwrap_or_default(),
                            source.id()
                        ))
                    })?;
                    self.elements
                        .compute_metadata(&mut builder, node)
                        .map_err(|e| e.context(format!("Error computing metadata for {path}")))?;
                    paths.push(path);
                }
                sections.push(SourceSectionMetadata::new(parser, paths));
            }
            builder.add_source(SourceMetadata::new(source.id().clone(), sections));
        }

        let metadata = builder.build()?;
        tracing::debug!(
            module,
            sources = sources.len(),
            elements = metadata.manifest().element_count(),
            back_references = metadata.back_references().len(),
            "generated module metadata"
        );
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BackReferencePopulator, Reference};
    use crate::resolve::ReferenceIdResolver;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    const SUB: &str = "/m/sub.pure";

    fn element(store: &GraphStore, package: &str, name: &str, kind: NodeKind, source: &str) -> NodeId {
        store
            .create_packaged_element(package, name, kind, Some(SourceSpan::new(source, 1, 1, 9, 1)))
            .unwrap()
    }

    fn owned(store: &GraphStore, parent: NodeId, property: &str, kind: NodeKind, name: &str, line: i32) -> NodeId {
        let source = store.span(parent).unwrap().source;
        store
            .create_owned(parent, property, kind, name, Some(SourceSpan::new(source, line, 1, line, 40)))
            .unwrap()
    }

    fn link(store: &GraphStore, from: NodeId, property: &str, to: NodeId) {
        store.add_value(from, property, Value::Node(to)).unwrap();
    }

    fn refer(store: &GraphStore, from: NodeId, property: &str, to: NodeId) {
        let mut reference = Reference::new(store.path_of(to).unwrap());
        reference.resolve_to(to);
        store.add_value(from, property, Value::Ref(reference)).unwrap();
    }

    /// A `lib` of referenced elements and an `m` module using each of them
    /// through one kind of back reference.
    struct Fixture {
        store: GraphStore,
        module: Vec<NodeId>,
        group: NodeId,
    }

    fn fixture() -> Fixture {
        let store = GraphStore::new();
        let base = element(&store, "lib", "Base", NodeKind::Class, "/lib/base.pure");
        let target = element(&store, "lib", "Owner", NodeKind::Class, "/lib/owner.pure");
        let f = element(&store, "lib", "f", NodeKind::ConcreteFunctionDefinition, "/lib/f.pure");
        let doc = element(&store, "lib", "doc", NodeKind::Profile, "/lib/doc.pure");
        let stereotype = owned(&store, doc, "p_stereotypes", NodeKind::Stereotype, "deprecated", 2);
        let tag = owned(&store, doc, "p_tags", NodeKind::Tag, "note", 3);
        let group = element(&store, "system::imports", "g", NodeKind::ImportGroup, "/m/imports.pure");

        let sub = element(&store, "m", "Sub", NodeKind::Class, SUB);
        let generalization = owned(&store, sub, props::GENERALIZATIONS, NodeKind::Generalization, "", 2);
        link(&store, generalization, props::GENERAL, base);
        link(&store, sub, props::STEREOTYPES, stereotype);
        let tagged = owned(&store, sub, props::TAGGED_VALUES, NodeKind::TaggedValue, "", 3);
        link(&store, tagged, props::TAG, tag);
        let p = owned(&store, sub, props::PROPERTIES, NodeKind::Property, "p", 4);
        refer(&store, p, "genericType", base);
        link(&store, sub, "importGroup", group);

        let g = element(&store, "m", "g", NodeKind::ConcreteFunctionDefinition, "/m/g.pure");
        let call = owned(&store, g, "expressionSequence", NodeKind::FunctionExpression, "", 2);
        link(&store, call, props::FUNC, f);

        let association = element(&store, "m", "Link", NodeKind::Association, "/m/link.pure");
        let end = owned(&store, association, props::PROPERTIES, NodeKind::Property, "owner", 2);
        link(&store, end, props::SOURCE_TYPE, target);
        let qualified = owned(&store, association, props::QUALIFIED_PROPERTIES, NodeKind::QualifiedProperty, "q", 3);
        link(&store, qualified, props::SOURCE_TYPE, target);

        // A plain class whose property is listed among `Owner`'s association
        // properties; only associations may report those.
        let peek = element(&store, "m", "Peek", NodeKind::Class, "/m/peek.pure");
        let x = owned(&store, peek, props::PROPERTIES, NodeKind::Property, "x", 2);
        refer(&store, x, "genericType", target);
        store
            .add_value(target, props::PROPERTIES_FROM_ASSOCIATIONS, Value::Node(x))
            .unwrap();

        let module = vec![sub, g, association, peek];
        let populator = BackReferencePopulator::new(store.clone());
        for &e in &module {
            for node in store.owned_subtree(e) {
                populator.populate(node).unwrap();
            }
        }
        Fixture { store, module, group }
    }

    fn generate(fixture: &Fixture, threshold: Option<usize>) -> ModuleMetadata {
        let mut generator = ConcreteElementMetadataGenerator::new(fixture.store.clone());
        if let Some(threshold) = threshold {
            generator = generator.with_cache_threshold(threshold);
        }
        let mut builder = ModuleMetadata::builder("m", generator.reference_id_version());
        for &e in &fixture.module {
            generator.compute_metadata(&mut builder, e).unwrap();
        }
        builder.build().unwrap()
    }

    fn bucket<'a>(metadata: &'a ModuleMetadata, element: &str, instance: &str) -> &'a [BackReference] {
        metadata
            .back_references_for(element)
            .unwrap_or_else(|| panic!("no back references for {element}"))
            .back_references_for(instance)
    }

    #[rstest]
    #[case::indexed(Some(1))]
    #[case::scanned(None)]
    fn test_back_reference_kinds_by_containing_element(#[case] threshold: Option<usize>) {
        let fixture = fixture();
        let metadata = generate(&fixture, threshold);

        assert_eq!(
            bucket(&metadata, "lib::Base", "lib::Base"),
            &[
                BackReference::reference_usage(
                    "m::Sub.properties['p']",
                    "genericType",
                    0,
                    Some(SourceSpan::new(SUB, 4, 1, 4, 40)),
                ),
                BackReference::specialization("m::Sub.generalizations"),
            ]
        );
        assert_eq!(
            bucket(&metadata, "lib::doc", "lib::doc.p_stereotypes['deprecated']"),
            &[BackReference::model_element("m::Sub")]
        );
        assert_eq!(
            bucket(&metadata, "lib::doc", "lib::doc.p_tags['note']"),
            &[BackReference::model_element("m::Sub")]
        );
        assert_eq!(
            bucket(&metadata, "lib::f", "lib::f"),
            &[BackReference::application("m::g.expressionSequence")]
        );
        assert_eq!(
            bucket(&metadata, "lib::Owner", "lib::Owner"),
            &[
                BackReference::property_from_association("m::Link.properties['owner']"),
                BackReference::qualified_property_from_association("m::Link.qualifiedProperties['q']"),
                BackReference::reference_usage(
                    "m::Peek.properties['x']",
                    "genericType",
                    0,
                    Some(SourceSpan::new("/m/peek.pure", 2, 1, 2, 40)),
                ),
            ]
        );
        let paths: Vec<&str> = metadata.back_references().iter().map(|b| b.path()).collect();
        assert_eq!(paths, vec!["lib::Base", "lib::Owner", "lib::doc", "lib::f"]);
    }

    #[rstest]
    #[case::indexed(Some(1))]
    #[case::scanned(None)]
    fn test_association_properties_only_reported_for_associations(#[case] threshold: Option<usize>) {
        let fixture = fixture();
        let peek = fixture.module[3];
        let generator = ConcreteElementMetadataGenerator::new(fixture.store.clone());
        let generator = match threshold {
            Some(threshold) => generator.with_cache_threshold(threshold),
            None => generator,
        };
        let mut builder = ModuleMetadata::builder("m", generator.reference_id_version());
        generator.compute_metadata(&mut builder, peek).unwrap();
        let metadata = builder.build().unwrap();

        let back_references = bucket(&metadata, "lib::Owner", "lib::Owner");
        assert_eq!(back_references.len(), 1);
        assert!(matches!(back_references[0], BackReference::ReferenceUsage(_)));
    }

    #[test]
    fn test_import_groups_are_not_external_references() {
        let fixture = fixture();
        let metadata = generate(&fixture, None);
        let group_path = fixture.store.path_of(fixture.group).unwrap();

        let external = metadata
            .external_references()
            .element("m::Sub")
            .unwrap()
            .external_references();
        assert!(external.iter().any(|r| r == "lib::Base"), "{external:?}");
        assert!(external.iter().all(|r| *r != group_path), "{external:?}");
        assert!(metadata.back_references_for(&group_path).is_none());
    }

    #[test]
    fn test_back_references_mirror_forward_edges() {
        let fixture = fixture();
        let store = &fixture.store;
        let metadata = generate(&fixture, None);
        let resolver = ReferenceIdResolver::new(store.clone());
        let points_at = |from: NodeId, target: NodeId| {
            store.owned_subtree(from).into_iter().any(|n| {
                store
                    .with_node(n, |node| {
                        node.properties()
                            .filter(|(name, _)| !props::is_back_reference(name))
                            .any(|(_, values)| values.iter().any(|v| v.target() == Some(target)))
                    })
                    .unwrap_or(false)
            })
        };

        let mut checked = 0;
        for element in metadata.back_references() {
            for instance in element.instances() {
                let target = resolver.resolve(&instance.instance_id).unwrap();
                assert_eq!(
                    store.containing_element(target).and_then(|e| store.path_of(e)).as_deref(),
                    Some(element.path())
                );
                for back_reference in &instance.back_references {
                    let referrer = resolver.resolve(back_reference.strings()[0]).unwrap();
                    assert!(points_at(referrer, target), "{back_reference} does not point at {}", instance.instance_id);
                    let owner = store.containing_element(referrer).and_then(|e| store.path_of(e)).unwrap();
                    assert!(owner.starts_with("m::"), "{owner}");
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 8);
    }
}
