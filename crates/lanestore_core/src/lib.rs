//! Dual-context persistence over an embedded SQLite store.
//!
//! One store, one write context on a background lane, one read context on a
//! foreground lane that merges every write commit. `PersistenceStack` is the
//! entry point.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod logging;
pub mod model;
pub mod query;
pub mod stack;

pub use config::{MigrationPolicy, StackConfig, StackOptions};
pub use context::{ChangeSet, Context, ContextKind, ContextScope};
pub use db::migrations::{MappingModel, MigrationError};
pub use db::{DbError, StoreCoordinator, StoreHandle, StoreKind};
pub use error::{ErrorCode, StackError, StackResult, ERROR_DOMAIN};
pub use logging::{default_log_level, init_logging, init_with, logging_status, LogSettings};
pub use model::instance::{Attributes, ContextId, EntityInstance, ObjectId};
pub use model::registry::{Entity, EntityFactory, EntityRegistry};
pub use model::schema::{
    AttributeDescription, EntityDescription, SchemaDescriptor, SchemaError, SchemaSource,
};
pub use model::value::{AttributeKind, AttributeValue};
pub use query::{ComparisonOp, FetchRequest, Predicate, PredicateError, SortDescriptor};
pub use stack::{FetchOptions, PersistenceStack};

/// Crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
