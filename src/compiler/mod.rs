//! Incremental compilation.
//!
//! The [`IncrementalCompiler`] listens to source events, remembers which
//! top-level nodes became stale and, on `compile`, recompiles the affected
//! region repository by repository in dependency order:
//!
//! ```text
//! unload ─► scope ─► parse ─► unbind ─► bind & post-process ─► validate ─► commit | rollback
//! ```

pub mod diagnostics;
mod incremental;
mod repository;
mod unload;

pub use diagnostics::{Diagnostic, DiagnosticCollector, Severity};
pub use incremental::{CompileReport, IncrementalCompiler, IncrementalCompilerBuilder};
pub use repository::{Repository, RepositorySet, Scope};
pub use unload::{element_of, walk_for_unload};

/// How much of the graph a compile invalidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InvalidationPolicy {
    /// Diff old and new instances per repository and recompile each
    /// repository in its own transaction.
    #[default]
    PerRepository,
    /// Recompile everything requested in a single scope. Legacy behaviour.
    WholeScope,
}

/// Depth of validation after post-processing.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValidationMode {
    /// Only the nodes compiled in this pass.
    #[default]
    Shallow,
    /// The compiled nodes plus a structural check of the whole graph,
    /// leaving out elements still waiting for a later scope.
    Deep,
}
