//! Compilation units and their storage.

mod mutation;
mod registry;
mod storage;

pub use mutation::SourceMutation;
pub use registry::{ElementsByParser, Source, SourceEventHandler, SourceRegistry};
pub use storage::{CodeStorage, DirectoryStorage, SOURCE_EXTENSION};
