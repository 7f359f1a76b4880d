//! Source edits requested by post-processing.
//!
//! A post-processor may decide that an element it was handed must not
//! exist, for example a view of a type that was deleted. It marks the
//! element for deletion instead of failing; the compiler then skips the
//! element during validation and the caller can [`SourceMutation::perform`]
//! the edit, which removes the element's lines from its source.

use indexmap::{IndexMap, IndexSet};

use super::SourceRegistry;
use crate::base::{NodeId, SourceId, SourceSpan};
use crate::error::Result;

/// Elements marked for deletion and the source lines to remove with them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceMutation {
    marked_for_deletion: IndexSet<NodeId>,
    /// Inclusive, one-based line ranges per source.
    line_ranges_to_remove: IndexMap<SourceId, Vec<(i32, i32)>>,
}

impl SourceMutation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `node` for deletion. When it has a span, the lines it covers
    /// are removed from its source on [`perform`](Self::perform).
    pub fn delete(&mut self, node: NodeId, span: Option<&SourceSpan>) {
        self.marked_for_deletion.insert(node);
        if let Some(span) = span {
            let ranges = self.line_ranges_to_remove.entry(span.source.clone()).or_default();
            let range = (span.start_line, span.end_line);
            if !ranges.contains(&range) {
                ranges.push(range);
            }
        }
    }

    pub fn is_marked_for_deletion(&self, node: NodeId) -> bool {
        self.marked_for_deletion.contains(&node)
    }

    pub fn marked_for_deletion(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.marked_for_deletion.iter().copied()
    }

    pub fn line_ranges_to_remove(&self, source: &SourceId) -> &[(i32, i32)] {
        self.line_ranges_to_remove
            .get(source)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Sources this mutation edits.
    pub fn modified_files(&self) -> impl Iterator<Item = &SourceId> {
        self.line_ranges_to_remove.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.marked_for_deletion.is_empty() && self.line_ranges_to_remove.is_empty()
    }

    pub fn merge(&mut self, other: SourceMutation) {
        self.marked_for_deletion.extend(other.marked_for_deletion);
        for (source, ranges) in other.line_ranges_to_remove {
            let existing = self.line_ranges_to_remove.entry(source).or_default();
            for range in ranges {
                if !existing.contains(&range) {
                    existing.push(range);
                }
            }
        }
    }

    /// Remove the recorded lines from their sources. Returns the sources
    /// whose content changed; the registry notifies its handlers as for any
    /// other edit.
    pub fn perform(&self, registry: &SourceRegistry) -> Result<Vec<SourceId>> {
        let mut changed = Vec::new();
        for (id, ranges) in &self.line_ranges_to_remove {
            let Some(source) = registry.get_source(id) else {
                tracing::warn!(source = %id, "source of a mutation is no longer registered");
                continue;
            };
            let content = source.content();
            let kept: String = content
                .split_inclusive('\n')
                .enumerate()
                .filter(|(i, _)| {
                    let line = *i as i32 + 1;
                    !ranges.iter().any(|(start, end)| (*start..=*end).contains(&line))
                })
                .map(|(_, text)| text)
                .collect();
            if registry.update_content(id, &kept)? {
                changed.push(id.clone());
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use pretty_assertions::assert_eq;

    fn span(line: i32, end_line: i32) -> SourceSpan {
        SourceSpan::new("/m/a.pure", line, 1, end_line, 1)
    }

    #[test]
    fn test_merge_unions_marks_and_ranges() {
        let a = NodeId::new(1);
        let b = NodeId::new(2);
        let mut first = SourceMutation::new();
        first.delete(a, Some(&span(2, 3)));
        let mut second = SourceMutation::new();
        second.delete(a, Some(&span(2, 3)));
        second.delete(b, None);

        first.merge(second);
        assert!(first.is_marked_for_deletion(a));
        assert!(first.is_marked_for_deletion(b));
        assert_eq!(first.line_ranges_to_remove(&"/m/a.pure".into()), &[(2, 3)]);
        assert_eq!(first.modified_files().count(), 1);
    }

    #[test]
    fn test_perform_removes_lines() {
        let registry = SourceRegistry::new();
        registry
            .register_source(Source::new("/m/a.pure", "one\ntwo\nthree\nfour\n", false, true))
            .unwrap();
        let mut mutation = SourceMutation::new();
        mutation.delete(NodeId::new(7), Some(&span(2, 3)));

        assert_eq!(mutation.perform(&registry).unwrap(), vec![SourceId::new("/m/a.pure")]);
        let source = registry.get_source(&"/m/a.pure".into()).unwrap();
        assert_eq!(&*source.content(), "one\nfour\n");
        assert!(SourceMutation::new().is_empty());
    }
}
