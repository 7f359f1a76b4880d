//! Stable textual ids for nodes.
//!
//! A packaged element is identified by its path. Any other node is
//! identified by its containing element's path followed by one segment per
//! owned edge on the shortest ownership path from that element:
//!
//! ```text
//! a::Y.properties['name']        named child, unique name in the list
//! a::Y.properties['name'].type   the only value of a property
//! a::Y.constraints[2]            positional
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::base::NodeId;
use crate::error::{CoreError, Result};
use crate::graph::{GraphStore, Value, props};

/// Version of the id scheme, recorded in external-reference metadata.
pub const REFERENCE_ID_VERSION: i32 = 1;

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|c| unicode_ident::is_xid_start(c) || c == '_')
        && chars.all(unicode_ident::is_xid_continue)
}

fn escape(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

/// The segment addressing `child` at `offset` of `property` in `values`.
fn segment(store: &GraphStore, property: &str, values: &[Value], offset: usize, child: NodeId) -> Result<String> {
    if !is_identifier(property) {
        return Err(CoreError::invalid_argument(format!(
            "Cannot generate reference id segment for invalid property name '{property}'"
        )));
    }
    let name = store.name(child).unwrap_or_default();
    if !name.is_empty() {
        let same_name = values
            .iter()
            .filter_map(Value::target)
            .filter(|t| store.name(*t).as_deref() == Some(name.as_str()))
            .count();
        if same_name == 1 {
            return Ok(format!(".{property}['{}']", escape(&name)));
        }
    }
    if values.len() == 1 {
        Ok(format!(".{property}"))
    } else {
        Ok(format!(".{property}[{offset}]"))
    }
}

/// Computes and caches reference ids, one breadth-first walk per element.
///
/// The cache is not invalidated by graph mutations; use one instance per
/// read-only phase.
#[derive(Debug)]
pub struct ReferenceIds {
    store: GraphStore,
    by_element: Mutex<FxHashMap<NodeId, Arc<FxHashMap<NodeId, String>>>>,
}

impl ReferenceIds {
    pub fn new(store: GraphStore) -> Self {
        Self {
            store,
            by_element: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn version(&self) -> i32 {
        REFERENCE_ID_VERSION
    }

    pub fn reference_id(&self, node: NodeId) -> Result<String> {
        if self.store.is_package(node) || self.store.is_packaged(node) {
            return self
                .store
                .path_of(node)
                .ok_or_else(|| CoreError::invalid_argument(format!("Cannot generate reference id for {node}")));
        }
        let element = self
            .store
            .containing_element(node)
            .ok_or_else(|| CoreError::invalid_argument(format!("Cannot generate reference id for {node}: no containing element")))?;
        let ids = self.element_ids(element)?;
        ids.get(&node).cloned().ok_or_else(|| {
            CoreError::invalid_argument(format!(
                "Cannot generate reference id for {node}: not reachable from its containing element"
            ))
        })
    }

    fn element_ids(&self, element: NodeId) -> Result<Arc<FxHashMap<NodeId, String>>> {
        if let Some(ids) = self.by_element.lock().get(&element) {
            return Ok(ids.clone());
        }
        let ids = Arc::new(self.compute(element)?);
        self.by_element.lock().insert(element, ids.clone());
        Ok(ids)
    }

    fn compute(&self, element: NodeId) -> Result<FxHashMap<NodeId, String>> {
        let root = self
            .store
            .path_of(element)
            .ok_or_else(|| CoreError::invalid_argument(format!("Cannot generate reference id for {element}")))?;
        let mut ids = FxHashMap::default();
        ids.insert(element, root);
        let mut queue = VecDeque::from([element]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.store.node(current) else { continue };
            let prefix = ids.get(&current).cloned().unwrap_or_default();
            for (property, values) in node.properties() {
                if props::is_back_reference(property) {
                    continue;
                }
                for (offset, value) in values.iter().enumerate() {
                    let Value::Node(child) = value else { continue };
                    if ids.contains_key(child) || self.store.parent(*child) != Some(current) {
                        continue;
                    }
                    let mut id = prefix.clone();
                    id.push_str(&segment(&self.store, property, values, offset, *child)?);
                    ids.insert(*child, id);
                    queue.push_back(*child);
                }
            }
        }
        Ok(ids)
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
enum Selector {
    Name(String),
    Index(usize),
    Only,
}

/// Navigates reference ids back to nodes.
#[derive(Clone, Debug)]
pub struct ReferenceIdResolver {
    store: GraphStore,
}

fn invalid(id: &str, reason: impl std::fmt::Display) -> CoreError {
    CoreError::invalid_argument(format!("Invalid reference id '{id}': {reason}"))
}

/// Split an id into its element path and `(property, selector)` segments.
fn parse(id: &str) -> Result<(&str, Vec<(String, Selector)>)> {
    let (path, mut rest) = match id.find(['.', '[']) {
        Some(i) => (&id[..i], &id[i..]),
        None => (id, ""),
    };
    if path.is_empty() {
        return Err(invalid(id, "missing element path"));
    }
    let mut segments = Vec::new();
    while !rest.is_empty() {
        let Some(after_dot) = rest.strip_prefix('.') else {
            return Err(invalid(id, format!("unexpected '{rest}'")));
        };
        let end = after_dot.find(['.', '[']).unwrap_or(after_dot.len());
        let property = &after_dot[..end];
        if !is_identifier(property) {
            return Err(invalid(id, format!("invalid property name '{property}'")));
        }
        rest = &after_dot[end..];
        let selector = if let Some(bracket) = rest.strip_prefix('[') {
            if let Some(quoted) = bracket.strip_prefix('\'') {
                let mut name = String::new();
                let mut chars = quoted.char_indices();
                let mut close = None;
                while let Some((i, c)) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some((_, escaped)) = chars.next() {
                                name.push(escaped);
                            }
                        }
                        '\'' => {
                            close = Some(i);
                            break;
                        }
                        c => name.push(c),
                    }
                }
                let close = close.ok_or_else(|| invalid(id, "unterminated name"))?;
                rest = quoted[close + 1..]
                    .strip_prefix(']')
                    .ok_or_else(|| invalid(id, "expected ']'"))?;
                Selector::Name(name)
            } else {
                let end = bracket.find(']').ok_or_else(|| invalid(id, "expected ']'"))?;
                let index = bracket[..end]
                    .parse::<usize>()
                    .map_err(|_| invalid(id, format!("invalid index '{}'", &bracket[..end])))?;
                rest = &bracket[end + 1..];
                Selector::Index(index)
            }
        } else {
            Selector::Only
        };
        segments.push((property.to_string(), selector));
    }
    Ok((path, segments))
}

impl ReferenceIdResolver {
    pub fn new(store: GraphStore) -> Self {
        Self { store }
    }

    /// True when `id` addresses a component rather than a packaged element.
    pub fn is_component_id(id: &str) -> bool {
        id.contains(['.', '['])
    }

    pub fn resolve(&self, id: &str) -> Result<NodeId> {
        let (path, segments) = parse(id)?;
        let mut current = self
            .store
            .find_by_path(path)
            .ok_or_else(|| invalid(id, format!("unknown element '{path}'")))?;
        for (property, selector) in segments {
            let values = self
                .store
                .with_node(current, |n| n.values(&property).to_vec())
                .unwrap_or_default();
            let found = match &selector {
                Selector::Name(name) => values
                    .iter()
                    .filter_map(Value::target)
                    .find(|t| self.store.name(*t).as_deref() == Some(name.as_str())),
                Selector::Index(i) => values.get(*i).and_then(Value::target),
                Selector::Only if values.len() == 1 => values[0].target(),
                Selector::Only => None,
            };
            current = found.ok_or_else(|| invalid(id, format!("no value for {property} {selector:?}")))?;
        }
        Ok(current)
    }
}
