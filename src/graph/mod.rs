//! The node graph: kinds, nodes, the store and its transactions.
//!
//! ```text
//! kind ──► node ──► store ◄──► transaction
//!                    │
//!          context ◄─┘──► walk, backref
//! ```

mod backref;
mod context;
mod kind;
mod node;
mod store;
mod transaction;
pub mod walk;

pub use backref::BackReferencePopulator;
pub use context::Context;
pub use kind::NodeKind;
pub use node::{Node, Reference, Value, props};
pub use store::{GraphStore, M3_SOURCE, PRIMITIVE_TYPES, ROOT_PACKAGE, SYSTEM_IMPORTS};
pub use transaction::{RollbackReport, Transaction, TransactionError, TransactionGuard, TransactionState};
