//! Diagnostics reported by validators and deep validation.

use std::fmt;
use std::sync::Arc;

use crate::base::{NodeId, SourceId, SourceSpan};

// ============================================================================
// DIAGNOSTIC TYPES
// ============================================================================

/// Severity level of a diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

/// A violation found in the graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Error/warning code (e.g. "E0001").
    pub code: Option<Arc<str>>,
    pub message: Arc<str>,
    /// Where the offending node came from, if known.
    pub span: Option<SourceSpan>,
    /// The offending node, if the diagnostic is about one.
    pub node: Option<NodeId>,
}

impl Diagnostic {
    pub fn error(message: impl Into<Arc<str>>) -> Self {
        Self {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            span: None,
            node: None,
        }
    }

    pub fn warning(message: impl Into<Arc<str>>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(message)
        }
    }

    pub fn with_code(mut self, code: impl Into<Arc<str>>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_span(mut self, span: Option<SourceSpan>) -> Self {
        self.span = span;
        self
    }

    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn source(&self) -> Option<&SourceId> {
        self.span.as_ref().map(|s| &s.source)
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{code}] ")?;
        }
        f.write_str(&self.message)?;
        if let Some(span) = &self.span {
            write!(f, " at {span}")?;
        }
        Ok(())
    }
}

// ============================================================================
// DIAGNOSTIC CODES
// ============================================================================

/// Standard diagnostic codes.
pub mod codes {
    /// Reference left unresolved after binding.
    pub const UNRESOLVED_REFERENCE: &str = "E0001";
    /// Edge to a node that no longer exists.
    pub const DANGLING_EDGE: &str = "E0002";
    /// Owned edge whose target names another parent.
    pub const OWNERSHIP_MISMATCH: &str = "E0003";
    /// Validator-specific violation.
    pub const VALIDATION: &str = "E0010";
}

// ============================================================================
// DIAGNOSTIC COLLECTOR
// ============================================================================

/// Collects diagnostics from validator passes.
#[derive(Clone, Debug, Default)]
pub struct DiagnosticCollector {
    diagnostics: Vec<Diagnostic>,
}

impl DiagnosticCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn extend(&mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) {
        self.diagnostics.extend(diagnostics);
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn diagnostics_for_source(&self, source: &SourceId) -> Vec<&Diagnostic> {
        self.diagnostics.iter().filter(|d| d.source() == Some(source)).collect()
    }

    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.severity == Severity::Error).count()
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity == Severity::Error)
    }

    /// Take all diagnostics, leaving the collector empty.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let diag = Diagnostic::error("bad thing")
            .with_code(codes::VALIDATION)
            .with_span(Some(SourceSpan::new("/m/a.pure", 1, 1, 1, 4)));
        assert_eq!(diag.to_string(), "[E0010] bad thing at /m/a.pure [1:1-1:4]");
        assert_eq!(Diagnostic::warning("w").to_string(), "w");
    }

    #[test]
    fn test_collector_counts() {
        let mut collector = DiagnosticCollector::new();
        collector.add(Diagnostic::error("e1").with_span(Some(SourceSpan::new("/m/a.pure", 1, 1, 1, 1))));
        collector.add(Diagnostic::error("e2"));
        collector.add(Diagnostic::warning("w1"));

        assert_eq!(collector.error_count(), 2);
        assert!(collector.has_errors());
        assert_eq!(collector.diagnostics_for_source(&SourceId::new("/m/a.pure")).len(), 1);
        assert_eq!(collector.take().len(), 3);
        assert!(!collector.has_errors());
    }
}
