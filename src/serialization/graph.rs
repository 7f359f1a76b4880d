//! Per-source graph artifacts.
//!
//! One artifact holds the nodes a source produced: its top-level elements
//! and everything they own. Edges inside the artifact use local node
//! indices; edges leaving it become symbolic references by reference id and
//! are resolved again when the artifact is loaded. Back-reference
//! properties are not written.

use indexmap::{IndexMap, IndexSet};
use rustc_hash::FxHashMap;
use smol_str::SmolStr;

use super::v1::{read_source_info, write_source_info};
use super::{IndexedReader, IndexedWriter, Reader, SOURCE_GRAPH_SIGNATURE, Writer};
use crate::base::{NodeId, SourceId, SourceSpan};
use crate::error::{CoreError, Result};
use crate::graph::{GraphStore, NodeKind, Value, props};
use crate::resolve::ReferenceIds;
use crate::source::{Source, SourceRegistry};

/// Format version written by [`SourceGraphWriter`].
pub const SOURCE_GRAPH_VERSION: i32 = 1;

const NO_INDEX: i32 = -1;

const TAG_NODE: i8 = 0;
const TAG_REFERENCE: i8 = 1;
const TAG_STRING: i8 = 2;
const TAG_INTEGER: i8 = 3;
const TAG_BOOLEAN: i8 = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SerializedValue {
    /// Index of a node in the same artifact.
    Node(u32),
    Reference { path: SmolStr, expected: Option<SmolStr> },
    String(SmolStr),
    Integer(i64),
    Boolean(bool),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedProperty {
    pub name: SmolStr,
    pub values: Vec<SerializedValue>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedNode {
    pub name: SmolStr,
    pub classifier_path: SmolStr,
    /// Path of the package holding the node, for packaged elements.
    pub package: Option<SmolStr>,
    /// Index of the owning node in the same artifact.
    pub parent: Option<u32>,
    pub span: Option<SourceSpan>,
    pub properties: Vec<SerializedProperty>,
}

impl SerializedNode {
    pub fn kind(&self) -> Result<NodeKind> {
        NodeKind::from_classifier_path(&self.classifier_path)
            .ok_or_else(|| CoreError::invalid_format(format!("unknown classifier: {}", self.classifier_path)))
    }
}

/// Top-level nodes one parser produced, as local indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedSection {
    pub parser: SmolStr,
    pub elements: Vec<u32>,
}

/// Decoded form of one source-graph artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedSource {
    pub id: SourceId,
    pub immutable: bool,
    pub content: String,
    pub sections: Vec<SerializedSection>,
    pub nodes: Vec<SerializedNode>,
}

impl SerializedSource {
    fn strings(&self) -> IndexSet<SmolStr> {
        let mut strings = IndexSet::new();
        strings.insert(SmolStr::new(self.id.as_str()));
        for section in &self.sections {
            strings.insert(section.parser.clone());
        }
        for node in &self.nodes {
            strings.insert(node.name.clone());
            strings.insert(node.classifier_path.clone());
            strings.extend(node.package.iter().cloned());
            if let Some(span) = &node.span {
                strings.insert(SmolStr::new(span.source.as_str()));
            }
            for property in &node.properties {
                strings.insert(property.name.clone());
                for value in &property.values {
                    match value {
                        SerializedValue::Reference { path, expected } => {
                            strings.insert(path.clone());
                            strings.extend(expected.iter().cloned());
                        }
                        SerializedValue::String(s) => {
                            strings.insert(s.clone());
                        }
                        _ => {}
                    }
                }
            }
        }
        strings
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Writer::new();
        out.write_i64(SOURCE_GRAPH_SIGNATURE);
        out.write_i32(SOURCE_GRAPH_VERSION);
        let mut out = IndexedWriter::new(out, self.strings())?;

        out.write_string(self.id.as_str())?;
        out.write_bool(self.immutable);
        out.write_utf8(&self.content)?;
        out.write_len(self.sections.len())?;
        for section in &self.sections {
            out.write_string(&section.parser)?;
            out.write_len(section.elements.len())?;
            for &element in &section.elements {
                write_index(&mut out, Some(element))?;
            }
        }
        out.write_len(self.nodes.len())?;
        for node in &self.nodes {
            out.write_string(&node.name)?;
            out.write_string(&node.classifier_path)?;
            out.write_optional_string(node.package.as_deref())?;
            write_index(&mut out, node.parent)?;
            out.write_bool(node.span.is_some());
            if let Some(span) = &node.span {
                write_source_info(&mut out, span)?;
            }
            out.write_len(node.properties.len())?;
            for property in &node.properties {
                out.write_string(&property.name)?;
                out.write_len(property.values.len())?;
                for value in &property.values {
                    write_value(&mut out, value)?;
                }
            }
        }
        Ok(out.into_inner().into_bytes())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut input = Reader::new(bytes);
        if input.read_i64()? != SOURCE_GRAPH_SIGNATURE {
            return Err(CoreError::invalid_format("not a Legend source graph file"));
        }
        let version = input.read_i32()?;
        if version != SOURCE_GRAPH_VERSION {
            return Err(CoreError::UnsupportedVersion(version));
        }
        let mut input = IndexedReader::new(input)?;

        let id = SourceId::new(input.read_string()?);
        let immutable = input.read_bool()?;
        let content = input.read_utf8()?;
        let section_count = input.read_len()?;
        let mut sections = Vec::with_capacity(section_count.min(64));
        for _ in 0..section_count {
            let parser = input.read_string()?;
            let count = input.read_len()?;
            let mut elements = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let index = read_index(&mut input)?
                    .ok_or_else(|| CoreError::invalid_format(format!("missing element index in section {parser}")))?;
                elements.push(index);
            }
            sections.push(SerializedSection { parser, elements });
        }

        let node_count = input.read_len()?;
        let mut nodes = Vec::with_capacity(node_count.min(1 << 16));
        for _ in 0..node_count {
            let name = input.read_string()?;
            let classifier_path = input.read_string()?;
            let package = input.read_optional_string()?;
            let parent = read_index(&mut input)?;
            let span = if input.read_bool()? {
                Some(read_source_info(&mut input)?)
            } else {
                None
            };
            let property_count = input.read_len()?;
            let mut properties = Vec::with_capacity(property_count.min(64));
            for _ in 0..property_count {
                let name = input.read_string()?;
                let value_count = input.read_len()?;
                let mut values = Vec::with_capacity(value_count.min(1024));
                for _ in 0..value_count {
                    values.push(read_value(&mut input)?);
                }
                properties.push(SerializedProperty { name, values });
            }
            nodes.push(SerializedNode {
                name,
                classifier_path,
                package,
                parent,
                span,
                properties,
            });
        }

        let source = Self {
            id,
            immutable,
            content,
            sections,
            nodes,
        };
        source.check_indices()?;
        Ok(source)
    }

    fn check_indices(&self) -> Result<()> {
        let count = self.nodes.len();
        let bad = |i: u32| (i as usize) >= count;
        let section_indices = self.sections.iter().flat_map(|s| s.elements.iter().copied());
        let parent_indices = self.nodes.iter().filter_map(|n| n.parent);
        let value_indices = self
            .nodes
            .iter()
            .flat_map(|n| n.properties.iter())
            .flat_map(|p| p.values.iter())
            .filter_map(|v| match v {
                SerializedValue::Node(i) => Some(*i),
                _ => None,
            });
        match section_indices.chain(parent_indices).chain(value_indices).find(|i| bad(*i)) {
            Some(index) => Err(CoreError::invalid_format(format!(
                "node index {index} out of range in {} ({count} nodes)",
                self.id
            ))),
            None => Ok(()),
        }
    }
}

fn write_index(out: &mut IndexedWriter, index: Option<u32>) -> Result<()> {
    match index {
        Some(index) => out.write_len(index as usize),
        None => {
            out.write_i32(NO_INDEX);
            Ok(())
        }
    }
}

fn read_index(input: &mut IndexedReader<'_>) -> Result<Option<u32>> {
    match input.read_i32()? {
        NO_INDEX => Ok(None),
        index => u32::try_from(index)
            .map(Some)
            .map_err(|_| CoreError::invalid_format(format!("invalid node index {index}"))),
    }
}

fn write_value(out: &mut IndexedWriter, value: &SerializedValue) -> Result<()> {
    match value {
        SerializedValue::Node(index) => {
            out.write_i8(TAG_NODE);
            write_index(out, Some(*index))
        }
        SerializedValue::Reference { path, expected } => {
            out.write_i8(TAG_REFERENCE);
            out.write_string(path)?;
            out.write_optional_string(expected.as_deref())
        }
        SerializedValue::String(s) => {
            out.write_i8(TAG_STRING);
            out.write_string(s)
        }
        SerializedValue::Integer(i) => {
            out.write_i8(TAG_INTEGER);
            out.write_i64(*i);
            Ok(())
        }
        SerializedValue::Boolean(b) => {
            out.write_i8(TAG_BOOLEAN);
            out.write_bool(*b);
            Ok(())
        }
    }
}

fn read_value(input: &mut IndexedReader<'_>) -> Result<SerializedValue> {
    match input.read_i8()? {
        TAG_NODE => read_index(input)?
            .map(SerializedValue::Node)
            .ok_or_else(|| CoreError::invalid_format("missing node index")),
        TAG_REFERENCE => Ok(SerializedValue::Reference {
            path: input.read_string()?,
            expected: input.read_optional_string()?,
        }),
        TAG_STRING => Ok(SerializedValue::String(input.read_string()?)),
        TAG_INTEGER => Ok(SerializedValue::Integer(input.read_i64()?)),
        TAG_BOOLEAN => Ok(SerializedValue::Boolean(input.read_bool()?)),
        tag => Err(CoreError::invalid_format(format!("unknown value tag {tag}"))),
    }
}

/// Reads source-graph artifacts.
#[derive(Clone, Copy, Debug, Default)]
pub struct SourceGraphReader;

impl SourceGraphReader {
    pub fn read(&self, bytes: &[u8]) -> Result<SerializedSource> {
        SerializedSource::from_bytes(bytes)
    }
}

/// Writes the artifact of a compiled source from the live graph.
#[derive(Debug)]
pub struct SourceGraphWriter {
    store: GraphStore,
    ids: ReferenceIds,
}

impl SourceGraphWriter {
    pub fn new(store: GraphStore) -> Self {
        Self {
            ids: ReferenceIds::new(store.clone()),
            store,
        }
    }

    pub fn write_source(&self, registry: &SourceRegistry, id: &SourceId) -> Result<Vec<u8>> {
        let source = registry
            .get_source(id)
            .ok_or_else(|| CoreError::invalid_argument(format!("Unknown source: {id}")))?;
        self.serialize(&source)?.to_bytes()
    }

    /// The decoded artifact of `source`, which must be compiled.
    pub fn serialize(&self, source: &Source) -> Result<SerializedSource> {
        if !source.is_compiled() {
            return Err(CoreError::invalid_argument(format!("Source is not compiled: {}", source.id())));
        }
        let linkage = source.elements_by_parser().unwrap_or_default();

        let mut local: IndexMap<NodeId, u32> = IndexMap::new();
        for top_level in linkage.values().flatten() {
            for node in self.store.owned_subtree(*top_level) {
                if !local.contains_key(&node) {
                    let index = u32::try_from(local.len())
                        .map_err(|_| CoreError::invalid_argument("too many nodes in one source"))?;
                    local.insert(node, index);
                }
            }
        }

        let sections = linkage
            .iter()
            .map(|(parser, elements)| SerializedSection {
                parser: parser.clone(),
                elements: elements.iter().filter_map(|e| local.get(e).copied()).collect(),
            })
            .collect();

        let mut nodes = Vec::with_capacity(local.len());
        for &id in local.keys() {
            nodes.push(self.serialize_node(id, &local)?);
        }

        Ok(SerializedSource {
            id: source.id().clone(),
            immutable: source.is_immutable(),
            content: source.content().to_string(),
            sections,
            nodes,
        })
    }

    fn serialize_node(&self, id: NodeId, local: &IndexMap<NodeId, u32>) -> Result<SerializedNode> {
        let node = self
            .store
            .node(id)
            .ok_or_else(|| CoreError::invalid_argument(format!("Unknown node: {id}")))?;
        let parent = node.parent();
        let package = parent
            .filter(|p| self.store.is_package(*p))
            .and_then(|p| self.store.path_of(p))
            .map(SmolStr::from);

        let mut external_ids: FxHashMap<NodeId, SmolStr> = FxHashMap::default();
        let mut properties = Vec::new();
        for (name, values) in node.properties() {
            if props::is_back_reference(name) {
                continue;
            }
            let mut serialized = Vec::with_capacity(values.len());
            for value in values {
                serialized.push(self.serialize_value(value, local, &mut external_ids)?);
            }
            properties.push(SerializedProperty {
                name: name.clone(),
                values: serialized,
            });
        }

        Ok(SerializedNode {
            name: SmolStr::new(node.name()),
            classifier_path: SmolStr::from(node.kind().classifier_path()),
            package,
            parent: parent.and_then(|p| local.get(&p).copied()),
            span: node.span().cloned(),
            properties,
        })
    }

    fn serialize_value(
        &self,
        value: &Value,
        local: &IndexMap<NodeId, u32>,
        external_ids: &mut FxHashMap<NodeId, SmolStr>,
    ) -> Result<SerializedValue> {
        let mut reference_to = |target: NodeId, expected: Option<NodeKind>| -> Result<SerializedValue> {
            let path = match external_ids.get(&target) {
                Some(path) => path.clone(),
                None => {
                    let path = SmolStr::from(self.ids.reference_id(target)?);
                    external_ids.insert(target, path.clone());
                    path
                }
            };
            Ok(SerializedValue::Reference {
                path,
                expected: expected.map(|k| SmolStr::from(k.classifier_path())),
            })
        };
        match value {
            Value::Node(target) => match local.get(target) {
                Some(index) => Ok(SerializedValue::Node(*index)),
                None => reference_to(*target, self.store.node_kind(*target)),
            },
            Value::Ref(reference) => match reference.resolved() {
                Some(target) => reference_to(target, reference.expected),
                None => Ok(SerializedValue::Reference {
                    path: reference.path.clone(),
                    expected: reference.expected.map(|k| SmolStr::from(k.classifier_path())),
                }),
            },
            Value::String(s) => Ok(SerializedValue::String(s.clone())),
            Value::Integer(i) => Ok(SerializedValue::Integer(*i)),
            Value::Boolean(b) => Ok(SerializedValue::Boolean(*b)),
        }
    }
}
