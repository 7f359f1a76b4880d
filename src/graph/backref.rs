//! Maintenance of back-reference properties.
//!
//! Forward edges recorded by parsers are mirrored onto their targets so that
//! "who points at this node" is answered without a graph walk. `populate`
//! adds the mirror entries of one node's edges and `depopulate` removes
//! them again before the node is unbound.

use rustc_hash::FxHashSet;
use smol_str::SmolStr;

use super::node::{Node, Value, props};
use super::{GraphStore, NodeKind};
use crate::base::NodeId;
use crate::error::Result;

/// Properties whose references are mirrored by a dedicated back reference
/// and therefore never produce a reference usage.
const NON_USAGE_PROPERTIES: &[&str] = &[props::FUNC, props::STEREOTYPES, props::TAG, props::SOURCE_TYPE];

/// Adds and removes back references for nodes of one store.
#[derive(Clone, Debug)]
pub struct BackReferencePopulator {
    store: GraphStore,
}

impl BackReferencePopulator {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    fn describe(&self, node: NodeId) -> String {
        self.store
            .path_of(node)
            .or_else(|| {
                let element = self.store.containing_element(node)?;
                self.store.path_of(element).map(|p| format!("{node} in {p}"))
            })
            .unwrap_or_else(|| node.to_string())
    }

    /// Mirror every resolved edge of `node`. Idempotent.
    pub fn populate(&self, node: NodeId) -> Result<()> {
        self.populate_inner(node)
            .map_err(|e| e.context(format!("Error populating back reference properties for {}", self.describe(node))))
    }

    fn populate_inner(&self, id: NodeId) -> Result<()> {
        let Some(node) = self.store.node(id) else {
            return Ok(());
        };
        for kind in node.kind().generalizations().iter().rev() {
            match kind {
                NodeKind::FunctionExpression => {
                    for func in node.targets(props::FUNC) {
                        self.add_unique(func, props::APPLICATIONS, id)?;
                    }
                }
                NodeKind::AnnotatedElement => {
                    for stereotype in node.targets(props::STEREOTYPES) {
                        self.add_unique(stereotype, props::MODEL_ELEMENTS, id)?;
                    }
                    for tag in self.tags(&node) {
                        self.add_unique(tag, props::MODEL_ELEMENTS, id)?;
                    }
                }
                NodeKind::Association => {
                    for (members, back) in association_members() {
                        for property in node.targets(members) {
                            for source_type in self.targets_of(property, props::SOURCE_TYPE) {
                                self.add_unique(source_type, back, property)?;
                            }
                        }
                    }
                }
                NodeKind::Type => {
                    for generalization in node.targets(props::GENERALIZATIONS) {
                        for general in self.targets_of(generalization, props::GENERAL) {
                            self.add_unique(general, props::SPECIALIZATIONS, generalization)?;
                        }
                    }
                }
                _ => {}
            }
        }
        self.populate_reference_usages(&node)
    }

    fn populate_reference_usages(&self, node: &Node) -> Result<()> {
        for (property, offset, target) in usages(node) {
            let referenceable = self
                .store
                .node_kind(target)
                .is_some_and(|k| k.is_a(NodeKind::Referenceable));
            if !referenceable || self.find_usage(target, node.id(), property, offset).is_some() {
                continue;
            }
            self.add_reference_usage(target, node.id(), property, offset, node.span().cloned())?;
        }
        Ok(())
    }

    /// Record that `owner.property[offset]` points at `target`.
    pub fn add_reference_usage(
        &self,
        target: NodeId,
        owner: NodeId,
        property: &str,
        offset: usize,
        span: Option<crate::base::SourceSpan>,
    ) -> Result<NodeId> {
        let usage = self.store.create_node(NodeKind::ReferenceUsage, "", span)?;
        self.store.add_value(usage, props::OWNER, Value::Node(owner))?;
        self.store
            .add_value(usage, props::PROPERTY_NAME, Value::String(SmolStr::new(property)))?;
        self.store.add_value(usage, props::OFFSET, Value::Integer(offset as i64))?;
        self.store.add_owned(target, props::REFERENCE_USAGES, usage)?;
        Ok(usage)
    }

    fn find_usage(&self, target: NodeId, owner: NodeId, property: &str, offset: usize) -> Option<NodeId> {
        self.targets_of(target, props::REFERENCE_USAGES).into_iter().find(|ru| {
            self.store
                .with_node(*ru, |n| {
                    n.targets(props::OWNER).next() == Some(owner)
                        && n.first(props::PROPERTY_NAME).and_then(Value::as_str) == Some(property)
                        && n.first(props::OFFSET).and_then(Value::as_integer) == Some(offset as i64)
                })
                .unwrap_or(false)
        })
    }

    /// Remove every mirror entry `populate` added for `node`.
    pub fn depopulate(&self, id: NodeId) -> Result<()> {
        let Some(node) = self.store.node(id) else {
            return Ok(());
        };
        for kind in node.kind().generalizations().iter().rev() {
            match kind {
                NodeKind::FunctionExpression => {
                    for func in node.targets(props::FUNC) {
                        self.remove_entry(func, props::APPLICATIONS, id)?;
                    }
                }
                NodeKind::AnnotatedElement => {
                    for stereotype in node.targets(props::STEREOTYPES) {
                        self.remove_entry(stereotype, props::MODEL_ELEMENTS, id)?;
                    }
                    for tag in self.tags(&node) {
                        self.remove_entry(tag, props::MODEL_ELEMENTS, id)?;
                    }
                }
                NodeKind::Association => {
                    for (members, back) in association_members() {
                        for property in node.targets(members) {
                            for source_type in self.targets_of(property, props::SOURCE_TYPE) {
                                self.remove_entry(source_type, back, property)?;
                            }
                        }
                    }
                }
                NodeKind::Type => {
                    for generalization in node.targets(props::GENERALIZATIONS) {
                        for general in self.targets_of(generalization, props::GENERAL) {
                            self.remove_entry(general, props::SPECIALIZATIONS, generalization)?;
                        }
                    }
                }
                _ => {}
            }
        }

        let targets: FxHashSet<NodeId> = usages(&node).map(|(_, _, t)| t).collect();
        for target in targets {
            let owned: Vec<NodeId> = self
                .targets_of(target, props::REFERENCE_USAGES)
                .into_iter()
                .filter(|ru| {
                    self.store
                        .with_node(*ru, |n| n.targets(props::OWNER).next() == Some(id))
                        .unwrap_or(false)
                })
                .collect();
            if owned.is_empty() {
                continue;
            }
            self.store
                .remove_values_where(target, props::REFERENCE_USAGES, |v| matches!(v, Value::Node(ru) if owned.contains(ru)))?;
            for ru in owned {
                self.store.remove_node(ru);
            }
        }
        Ok(())
    }

    fn tags(&self, node: &Node) -> Vec<NodeId> {
        node.targets(props::TAGGED_VALUES)
            .flat_map(|tv| self.targets_of(tv, props::TAG))
            .collect()
    }

    fn targets_of(&self, id: NodeId, property: &str) -> Vec<NodeId> {
        self.store
            .with_node(id, |n| n.targets(property).collect())
            .unwrap_or_default()
    }

    fn add_unique(&self, target: NodeId, property: &str, value: NodeId) -> Result<()> {
        if !self.store.contains(target) {
            return Ok(());
        }
        let present = self
            .store
            .with_node(target, |n| n.values(property).contains(&Value::Node(value)))
            .unwrap_or(false);
        if present {
            return Ok(());
        }
        self.store.add_value(target, property, Value::Node(value))
    }

    fn remove_entry(&self, target: NodeId, property: &str, value: NodeId) -> Result<()> {
        if !self.store.contains(target) {
            return Ok(());
        }
        self.store
            .remove_values_where(target, property, |v| *v == Value::Node(value))
            .map(|_| ())
    }
}

fn association_members() -> [(&'static str, &'static str); 2] {
    [
        (props::PROPERTIES, props::PROPERTIES_FROM_ASSOCIATIONS),
        (props::QUALIFIED_PROPERTIES, props::QUALIFIED_PROPERTIES_FROM_ASSOCIATIONS),
    ]
}

/// `(property, offset, target)` of resolved references that count as usages.
fn usages(node: &Node) -> impl Iterator<Item = (&str, usize, NodeId)> {
    node.references().filter_map(|(property, offset, reference)| {
        let property = property.as_str();
        if NON_USAGE_PROPERTIES.contains(&property) || props::is_back_reference(property) {
            return None;
        }
        reference.resolved().map(|target| (property, offset, target))
    })
}
