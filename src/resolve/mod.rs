//! Reference resolution: single lookups, reference ids and fixed-point passes.

mod fixed_point;
mod reference_id;
mod resolver;

pub use fixed_point::{FixedPoint, MAX_REPORTED_FAILURES, PassCounts, deadlock_message};
pub use reference_id::{REFERENCE_ID_VERSION, ReferenceIdResolver, ReferenceIds};
pub use resolver::{ResolveResult, Resolver};
