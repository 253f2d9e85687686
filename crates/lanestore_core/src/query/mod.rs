//! Fetch requests, predicates and their SQL compilation.
//!
//! # Responsibility
//! - Describe what a fetch asks for (`FetchRequest`, `SortDescriptor`).
//! - Keep SQL filtering and in-memory filtering semantically identical.
//!
//! # See also
//! - `context::scope` for how pending changes are overlaid on store rows.

pub mod predicate;
pub mod request;
pub(crate) mod sql;

pub use predicate::{ComparisonOp, Predicate, PredicateError};
pub use request::{FetchRequest, SortDescriptor};
