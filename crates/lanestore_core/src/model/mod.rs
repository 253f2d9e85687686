//! Schema, values and entity instances.

pub mod instance;
pub mod registry;
pub mod schema;
pub mod value;
