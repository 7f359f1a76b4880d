//! Tuning constants and compiler options.
//!
//! Every parallel step of the loader and the compiler splits its input only
//! when it is larger than its own threshold. The values below are the
//! historical defaults; they are tuning constants and carry no semantics.

use crate::compiler::{InvalidationPolicy, ValidationMode};

/// Size thresholds above which a step is split into parallel tasks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Thresholds {
    /// Binary files to deserialize.
    pub deserialize_files: usize,
    /// Nodes to create and attach after deserialization.
    pub initialize_nodes: usize,
    /// Nodes to visit in one reference resolution pass.
    pub resolve_references: usize,
    /// Nodes whose back references are populated.
    pub populate_back_references: usize,
    /// Nodes registered in the context indices by the loader.
    pub update_context: usize,
    /// Sources parsed by the incremental compiler.
    pub parse_sources: usize,
    /// Instances registered in the context indices by the compiler.
    pub context_registration: usize,
    /// Reverse-list size from which back-reference collectors are cached.
    pub back_reference_cache: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            deserialize_files: 1000,
            initialize_nodes: 10_000,
            resolve_references: 1000,
            populate_back_references: 1000,
            update_context: 10_000,
            parse_sources: 100,
            context_registration: 100,
            back_reference_cache: 100,
        }
    }
}

impl Thresholds {
    /// Thresholds of zero, so that any non-empty input is split when a pool is present.
    pub fn always_parallel() -> Self {
        Self {
            deserialize_files: 0,
            initialize_nodes: 0,
            resolve_references: 0,
            populate_back_references: 0,
            update_context: 0,
            parse_sources: 0,
            context_registration: 0,
            back_reference_cache: Self::default().back_reference_cache,
        }
    }

    pub fn with_parse_sources(mut self, threshold: usize) -> Self {
        self.parse_sources = threshold;
        self
    }

    pub fn with_resolve_references(mut self, threshold: usize) -> Self {
        self.resolve_references = threshold;
        self
    }

    pub fn with_back_reference_cache(mut self, threshold: usize) -> Self {
        self.back_reference_cache = threshold;
        self
    }
}

/// Options for the [`IncrementalCompiler`](crate::compiler::IncrementalCompiler).
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CompilerOptions {
    pub thresholds: Thresholds,
    /// Open one transaction per repository when the caller has none open.
    pub transactional_by_default: bool,
    pub invalidation: InvalidationPolicy,
    /// Validation used by [`compile_all`](crate::compiler::IncrementalCompiler::compile_all).
    pub cold_start_validation: ValidationMode,
    /// Validation used by incremental compiles.
    pub incremental_validation: ValidationMode,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            thresholds: Thresholds::default(),
            transactional_by_default: true,
            invalidation: InvalidationPolicy::PerRepository,
            cold_start_validation: ValidationMode::Deep,
            incremental_validation: ValidationMode::Shallow,
        }
    }
}

impl CompilerOptions {
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_transactional_by_default(mut self, transactional: bool) -> Self {
        self.transactional_by_default = transactional;
        self
    }

    pub fn with_invalidation(mut self, policy: InvalidationPolicy) -> Self {
        self.invalidation = policy;
        self
    }
}

/// Options for the [`GraphLoader`](crate::loader::GraphLoader).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct LoaderOptions {
    pub thresholds: Thresholds,
}
