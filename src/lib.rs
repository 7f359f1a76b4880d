//! # metagraph-core
//!
//! Incremental compilation core for a metamodel-driven language.
//!
//! ## Module Structure (dependency order)
//!
//! ```text
//! compiler      → incremental compile, unload, per-repository scopes
//!   ↓
//! loader        → rehydrate a graph from source-graph artifacts
//! metadata      → module manifests and back-reference metadata
//! serialization → binary artifact formats
//!   ↓
//! passes        → parser and post-processing extension points
//! resolve       → reference resolution and fixed-point passes
//! source        → sources, their registry and storage
//!   ↓
//! graph         → node store, transactions, back references
//!   ↓
//! base          → primitives (NodeId, SourceId, SourceSpan, interning)
//! ```

/// Foundation types: NodeId, SourceId, SourceSpan, name interning
pub mod base;

/// Error type shared by every module
pub mod error;

/// Thresholds, compiler and loader options
pub mod config;

/// Tracing subscriber setup
pub mod logging;

/// Chunked parallel execution on a caller-supplied pool
pub mod parallel;

/// The node graph store and its transactions
pub mod graph;

/// Sources, the source registry and code storage
pub mod source;

/// Reference resolution
pub mod resolve;

/// Extension points: parsers, post-processors, validators, walkers
pub mod passes;

/// Binary artifacts: module metadata and source graphs
pub mod serialization;

/// Loading a graph from source-graph artifacts
pub mod loader;

/// Module metadata and its generator
pub mod metadata;

/// The incremental compiler
pub mod compiler;

pub use base::{NodeId, SourceId, SourceSpan};
pub use compiler::{CompileReport, Diagnostic, IncrementalCompiler, Severity};
pub use config::{CompilerOptions, LoaderOptions, Thresholds};
pub use error::{CoreError, Result};
pub use graph::{GraphStore, Node, NodeKind, Transaction};
pub use loader::{GraphLoader, LoadReport};
pub use metadata::{ModuleMetadata, ModuleMetadataGenerator};
pub use source::{Source, SourceRegistry};
