//! Error types shared by every subsystem.

use smol_str::SmolStr;
use thiserror::Error;

use crate::base::{SourceId, SourceSpan};
use crate::compiler::diagnostics::Diagnostic;
use crate::graph::TransactionError;

/// Core errors.
///
/// Variants follow the failure taxonomy of the compiler: parse errors,
/// resolution deadlocks, compilation/validation errors, structural errors
/// and rollback failures. Only the first three are expected during normal
/// editing; the rest indicate a broken model or a corrupted graph.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Malformed source text.
    #[error("Parse error at {span}: {message}")]
    Parse { span: SourceSpan, message: String },

    /// Fixed point reached with references still unresolved.
    #[error("{message}")]
    Resolution { message: String },

    /// A post-processing pass rejected a node.
    #[error("{}", compilation_message(.span.as_ref(), .message))]
    Compilation {
        span: Option<SourceSpan>,
        message: String,
    },

    /// Validator passes reported violations.
    #[error("{}", validation_message(.0))]
    Validation(Vec<Diagnostic>),

    /// A source id was registered twice.
    #[error("duplicate id: {0}")]
    DuplicateSource(SourceId),

    /// Two packaged elements claim the same path.
    #[error("duplicate element path: {0}")]
    DuplicateElement(SmolStr),

    /// Metadata for one element path could not be merged.
    #[error("{message}")]
    MetadataConflict { message: String },

    /// An argument violated a structural precondition.
    #[error("{0}")]
    InvalidArgument(String),

    /// Transaction state machine violation.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Rollback itself failed after a compilation error; the graph is corrupt.
    #[error(
        "Compilation failed because of the embedded exception, and the attempt to roll back to the previous state also failed. Full recompilation is advisable."
    )]
    RollbackFailed {
        #[source]
        cause: Box<CoreError>,
        rollback: TransactionError,
    },

    /// Binary input did not carry the expected signature or structure.
    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    /// Binary input carried a version no serializer extension handles.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(i32),

    /// IO error while reading or persisting sources.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error annotated with the operation that failed.
    #[error("{message}")]
    Context {
        message: String,
        #[source]
        source: Box<CoreError>,
    },
}

impl CoreError {
    pub fn parse(span: SourceSpan, message: impl Into<String>) -> Self {
        Self::Parse {
            span,
            message: message.into(),
        }
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }

    pub fn compilation(span: Option<SourceSpan>, message: impl Into<String>) -> Self {
        Self::Compilation {
            span,
            message: message.into(),
        }
    }

    pub fn metadata_conflict(message: impl Into<String>) -> Self {
        Self::MetadataConflict {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat(message.into())
    }

    /// Wrap this error with a message describing the failed operation.
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::Context {
            message: message.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, looking through [`CoreError::Context`] wrappers.
    pub fn root(&self) -> &CoreError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for errors a caller may fix by editing sources and recompiling.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.root(),
            Self::Parse { .. } | Self::Resolution { .. } | Self::Compilation { .. } | Self::Validation(_)
        )
    }
}

fn compilation_message(span: Option<&SourceSpan>, message: &str) -> String {
    match span {
        Some(span) => format!("Compilation error at {span}: {message}"),
        None => format!("Compilation error: {message}"),
    }
}

fn validation_message(diagnostics: &[Diagnostic]) -> String {
    match diagnostics {
        [] => "Validation failed".to_string(),
        [single] => format!("Validation failed: {single}"),
        [first, rest @ ..] => format!("Validation failed: {first} (and {} more)", rest.len()),
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_root() {
        let err = CoreError::resolution("stuck").context("Error loading graph");
        assert_eq!(err.to_string(), "Error loading graph");
        assert!(matches!(err.root(), CoreError::Resolution { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_structural_errors_are_fatal() {
        assert!(!CoreError::DuplicateSource(SourceId::new("/a.pure")).is_recoverable());
        assert!(!CoreError::DuplicateElement("a::X".into()).is_recoverable());
    }

    #[test]
    fn test_compilation_message() {
        let err = CoreError::compilation(Some(SourceSpan::new("/a.pure", 1, 1, 1, 5)), "bad");
        assert_eq!(err.to_string(), "Compilation error at /a.pure [1:1-1:5]: bad");
        assert_eq!(CoreError::compilation(None, "bad").to_string(), "Compilation error: bad");
    }
}
