//! Foundation types for the graph core.
//!
//! This module provides fundamental types used throughout the crate:
//! - [`NodeId`] - Synthetic node identifiers
//! - [`SourceId`] - Compilation unit identifiers
//! - [`SourceSpan`] - Where a node came from
//! - [`LineCol`], [`LineIndex`] - Line/column conversion for source text
//! - [`Name`], [`Interner`] - String interning
//!
//! This module has NO dependencies on other crate modules.

mod intern;
mod node_id;
mod source_id;
mod span;

pub use intern::{Interner, Name};
pub use node_id::NodeId;
pub use source_id::SourceId;
pub use span::{LineCol, LineIndex, SourceSpan, TextRange, TextSize};

// Re-export text-size types for convenience
pub use text_size;
