//! Graph vertices and their property edges.

use indexmap::IndexMap;
use smol_str::SmolStr;

use super::NodeKind;
use crate::base::{NodeId, SourceSpan};

/// Property names the core reads or maintains.
pub mod props {
    pub const CHILDREN: &str = "children";
    pub const PROPERTIES: &str = "properties";
    pub const QUALIFIED_PROPERTIES: &str = "qualifiedProperties";
    pub const GENERALIZATIONS: &str = "generalizations";
    pub const GENERAL: &str = "general";
    pub const FUNC: &str = "func";
    pub const STEREOTYPES: &str = "stereotypes";
    pub const TAGGED_VALUES: &str = "taggedValues";
    pub const TAG: &str = "tag";
    pub const SOURCE_TYPE: &str = "sourceType";
    pub const OWNER: &str = "owner";
    pub const PROPERTY_NAME: &str = "propertyName";
    pub const OFFSET: &str = "offset";
    pub const IMPORTS: &str = "imports";
    pub const PATH: &str = "path";

    pub const APPLICATIONS: &str = "applications";
    pub const MODEL_ELEMENTS: &str = "modelElements";
    pub const PROPERTIES_FROM_ASSOCIATIONS: &str = "propertiesFromAssociations";
    pub const QUALIFIED_PROPERTIES_FROM_ASSOCIATIONS: &str = "qualifiedPropertiesFromAssociations";
    pub const REFERENCE_USAGES: &str = "referenceUsages";
    pub const SPECIALIZATIONS: &str = "specializations";

    /// Reverse-edge properties. They are rebuilt from forward edges, never
    /// serialized, and never followed by ownership or metadata walks.
    pub const BACK_REFERENCE_PROPERTIES: &[&str] = &[
        APPLICATIONS,
        MODEL_ELEMENTS,
        PROPERTIES_FROM_ASSOCIATIONS,
        QUALIFIED_PROPERTIES_FROM_ASSOCIATIONS,
        REFERENCE_USAGES,
        SPECIALIZATIONS,
    ];

    /// True for reverse-edge properties.
    pub fn is_back_reference(name: &str) -> bool {
        BACK_REFERENCE_PROPERTIES.contains(&name)
    }
}

/// A symbolic pointer recorded by a parser or deserializer.
///
/// The path is either a packaged element path (`a::b::X`) or a reference id
/// of a component (`a::b::X.properties['name']`). Resolution fills the
/// `resolved` slot in place; unbinding clears it again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    pub path: SmolStr,
    pub expected: Option<NodeKind>,
    resolved: Option<NodeId>,
}

impl Reference {
    pub fn new(path: impl Into<SmolStr>) -> Self {
        Self {
            path: path.into(),
            expected: None,
            resolved: None,
        }
    }

    pub fn expecting(path: impl Into<SmolStr>, kind: NodeKind) -> Self {
        Self {
            path: path.into(),
            expected: Some(kind),
            resolved: None,
        }
    }

    #[inline]
    pub fn resolved(&self) -> Option<NodeId> {
        self.resolved
    }

    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.resolved.is_some()
    }

    pub(crate) fn resolve_to(&mut self, target: NodeId) {
        self.resolved = Some(target);
    }

    pub(crate) fn unresolve(&mut self) {
        self.resolved = None;
    }
}

/// One entry of a property.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Direct edge. The target is owned by this node iff its parent is this node.
    Node(NodeId),
    /// Symbolic edge awaiting (or carrying) resolution.
    Ref(Reference),
    String(SmolStr),
    Integer(i64),
    Boolean(bool),
}

impl Value {
    /// The node this value points at, if any (direct or resolved).
    #[inline]
    pub fn target(&self) -> Option<NodeId> {
        match self {
            Value::Node(id) => Some(*id),
            Value::Ref(reference) => reference.resolved(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&Reference> {
        match self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn reference(path: impl Into<SmolStr>) -> Self {
        Value::Ref(Reference::new(path))
    }
}

/// A graph vertex.
///
/// `kind` is cached from the classifier at creation so that dispatch never
/// needs to lock the classifier node.
#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: SmolStr,
    pub(crate) classifier: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) parent: Option<NodeId>,
    pub(crate) span: Option<SourceSpan>,
    pub(crate) properties: IndexMap<SmolStr, Vec<Value>>,
}

impl Node {
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Simple name; empty for anonymous nodes.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn classifier(&self) -> NodeId {
        self.classifier
    }

    #[inline]
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Owning node: the package for packaged elements, the owner for components.
    #[inline]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[inline]
    pub fn span(&self) -> Option<&SourceSpan> {
        self.span.as_ref()
    }

    pub fn values(&self, property: &str) -> &[Value] {
        self.properties.get(property).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first(&self, property: &str) -> Option<&Value> {
        self.values(property).first()
    }

    /// Targets of a property (direct edges and resolved references).
    pub fn targets<'a>(&'a self, property: &str) -> impl Iterator<Item = NodeId> + 'a {
        self.values(property).iter().filter_map(Value::target)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&SmolStr, &[Value])> {
        self.properties.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Every `(property, offset, reference)` of this node.
    pub fn references(&self) -> impl Iterator<Item = (&SmolStr, usize, &Reference)> {
        self.properties.iter().flat_map(|(name, values)| {
            values
                .iter()
                .enumerate()
                .filter_map(move |(i, v)| v.as_reference().map(|r| (name, i, r)))
        })
    }

    pub fn has_unresolved_references(&self) -> bool {
        self.references().any(|(_, _, r)| !r.is_resolved())
    }

    pub(crate) fn values_mut(&mut self, property: &str) -> &mut Vec<Value> {
        self.properties.entry(SmolStr::new(property)).or_default()
    }

    pub(crate) fn references_mut(&mut self) -> impl Iterator<Item = &mut Reference> {
        self.properties.values_mut().flat_map(|values| {
            values.iter_mut().filter_map(|v| match v {
                Value::Ref(r) => Some(r),
                _ => None,
            })
        })
    }
}
