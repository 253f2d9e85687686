//! Stack-level error domain.
//!
//! # Responsibility
//! - Collect configuration, migration and operation failures in one type.
//! - Expose stable numeric codes for the namespaced error domain.
//!
//! # Invariants
//! - Store-engine errors are carried unmodified inside `DbError::Sqlite`.
//! - Errors never cross a lane boundary as panics; they travel as values.

use crate::context::ContextKind;
use crate::db::migrations::MigrationError;
use crate::db::DbError;
use crate::model::instance::{ContextId, ObjectId};
use crate::model::schema::SchemaError;
use crate::model::value::AttributeKind;
use crate::query::predicate::PredicateError;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Namespace shared by every error this crate reports.
pub const ERROR_DOMAIN: &str = "lanestore.stack";

/// Stable codes inside [`ERROR_DOMAIN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    MappingModelNotFound = 1,
    ManagedObjectModelNotFound = 2,
}

pub type StackResult<T> = Result<T, StackError>;

#[derive(Debug)]
pub enum StackError {
    /// Schema model could not be located.
    SchemaNotFound(SchemaError),
    /// Schema model was found but is malformed.
    Schema(SchemaError),
    /// Stack configuration is inconsistent.
    InvalidConfig(String),
    Migration(MigrationError),
    /// Store schema differs from the loaded schema; call `migrate()` first.
    MigrationRequired,
    UnknownEntityType(String),
    UnknownAttribute {
        entity: String,
        attribute: String,
    },
    TypeMismatch {
        entity: String,
        attribute: String,
        expected: AttributeKind,
        found: &'static str,
    },
    /// Instance was passed to a context it does not belong to.
    ForeignContextInstance {
        object: ObjectId,
        owner: ContextId,
        context: ContextId,
    },
    ObjectNotFound(ObjectId),
    Validation {
        entity: String,
        attribute: String,
        message: String,
    },
    InvalidPredicate(PredicateError),
    Store(DbError),
    StoreClosed,
    /// Context lane is no longer running.
    LaneClosed(ContextKind),
    /// Blocking call issued from inside the target lane.
    ReentrantCall(ContextKind),
    LaneSpawn(std::io::Error),
}

impl StackError {
    /// Numeric code inside [`ERROR_DOMAIN`], when one is assigned.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::SchemaNotFound(_) => Some(ErrorCode::ManagedObjectModelNotFound),
            Self::Migration(MigrationError::MappingModelNotFound { .. }) => {
                Some(ErrorCode::MappingModelNotFound)
            }
            _ => None,
        }
    }

    pub fn domain(&self) -> &'static str {
        ERROR_DOMAIN
    }

    /// Whether the store rejected a write because of a constraint
    /// (unique index, NOT NULL, ...).
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Self::Store(DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _))) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

impl Display for StackError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SchemaNotFound(err) => write!(f, "{err}"),
            Self::Schema(err) => write!(f, "{err}"),
            Self::InvalidConfig(message) => write!(f, "invalid stack configuration: {message}"),
            Self::Migration(err) => write!(f, "{err}"),
            Self::MigrationRequired => {
                write!(f, "store schema is out of date; migration is required")
            }
            Self::UnknownEntityType(name) => write!(f, "unknown entity type `{name}`"),
            Self::UnknownAttribute { entity, attribute } => {
                write!(f, "entity `{entity}` has no attribute `{attribute}`")
            }
            Self::TypeMismatch {
                entity,
                attribute,
                expected,
                found,
            } => write!(
                f,
                "attribute `{entity}.{attribute}` expects {expected}, got {found}"
            ),
            Self::ForeignContextInstance {
                object,
                owner,
                context,
            } => write!(
                f,
                "object {object} belongs to {owner} and cannot be used in {context}"
            ),
            Self::ObjectNotFound(id) => write!(f, "object not found: {id}"),
            Self::Validation {
                entity,
                attribute,
                message,
            } => write!(f, "validation failed for `{entity}.{attribute}`: {message}"),
            Self::InvalidPredicate(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::StoreClosed => write!(f, "store is closed"),
            Self::LaneClosed(kind) => write!(f, "{kind} context lane is closed"),
            Self::ReentrantCall(kind) => write!(
                f,
                "blocking call issued from inside the {kind} context lane"
            ),
            Self::LaneSpawn(err) => write!(f, "failed to start context lane: {err}"),
        }
    }
}

impl Error for StackError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SchemaNotFound(err) | Self::Schema(err) => Some(err),
            Self::Migration(err) => Some(err),
            Self::InvalidPredicate(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::LaneSpawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SchemaError> for StackError {
    fn from(value: SchemaError) -> Self {
        match value {
            SchemaError::NotFound(_) => Self::SchemaNotFound(value),
            other => Self::Schema(other),
        }
    }
}

impl From<DbError> for StackError {
    fn from(value: DbError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for StackError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(DbError::Sqlite(value))
    }
}

impl From<MigrationError> for StackError {
    fn from(value: MigrationError) -> Self {
        Self::Migration(value)
    }
}

impl From<PredicateError> for StackError {
    fn from(value: PredicateError) -> Self {
        Self::InvalidPredicate(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorCode, StackError, ERROR_DOMAIN};
    use crate::db::migrations::MigrationError;
    use crate::model::schema::SchemaError;
    use std::path::PathBuf;

    #[test]
    fn missing_schema_maps_to_model_not_found_code() {
        let err = StackError::from(SchemaError::NotFound(PathBuf::from("/nowhere/Model.json")));
        assert!(matches!(err, StackError::SchemaNotFound(_)));
        assert_eq!(err.code(), Some(ErrorCode::ManagedObjectModelNotFound));
        assert_eq!(err.domain(), ERROR_DOMAIN);
    }

    #[test]
    fn mapping_not_found_has_code_one() {
        let err = StackError::from(MigrationError::MappingModelNotFound {
            source_version: 1,
            destination_version: 2,
            reason: "attribute kind changed".to_string(),
        });
        assert_eq!(err.code(), Some(ErrorCode::MappingModelNotFound));
        assert_eq!(ErrorCode::MappingModelNotFound as u32, 1);
        assert_eq!(ErrorCode::ManagedObjectModelNotFound as u32, 2);
    }

    #[test]
    fn operation_errors_have_no_domain_code() {
        assert_eq!(StackError::MigrationRequired.code(), None);
        assert_eq!(StackError::UnknownEntityType("X".into()).code(), None);
    }
}
