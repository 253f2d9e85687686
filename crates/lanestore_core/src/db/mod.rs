//! SQLite storage bootstrap, physical mapping and schema migration.
//!
//! # Responsibility
//! - Open and configure the single SQLite connection backing a stack.
//! - Map schema entities onto tables, one column per attribute.
//! - Stamp, compare and migrate the on-disk schema.
//!
//! # Invariants
//! - Stamped schema version is mirrored to `PRAGMA user_version`.
//! - No data operation runs while the stamped schema differs from the
//!   loaded one.
//! - The connection is only touched while holding the store mutex.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod migrations;
mod open;
pub(crate) mod sql;
mod store;

pub use open::open_connection;
pub use store::{StoreCoordinator, StoreHandle};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// Persisted rows or metadata do not match the expected shape.
    InvalidData(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::InvalidData(_) => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

/// Physical flavour of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// On-disk SQLite file with a write-ahead log.
    Sqlite,
    /// Process-private in-memory database; `url` is ignored.
    InMemory,
    /// On-disk single-file store: rollback journal, exclusive lock.
    Binary,
}

impl StoreKind {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::InMemory => "memory",
            Self::Binary => "binary",
        }
    }

    pub fn is_on_disk(self) -> bool {
        !matches!(self, Self::InMemory)
    }

    /// File extension of a store placed at its default location.
    pub(crate) fn default_extension(self) -> Option<&'static str> {
        match self {
            Self::Sqlite => Some("sqlite"),
            Self::Binary => Some("store"),
            Self::InMemory => None,
        }
    }
}

impl Display for StoreKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
