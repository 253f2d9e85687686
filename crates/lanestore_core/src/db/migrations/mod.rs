//! Schema migration planner and executor.
//!
//! # Responsibility
//! - Diff the stamped schema against the loaded schema.
//! - Produce an ordered list of steps, optionally guided by a mapping model.
//! - Apply the steps atomically inside the caller's transaction.
//!
//! # Invariants
//! - Planning never touches the store; every "cannot map" decision is made
//!   before the first statement runs.
//! - Step order: drop unique indexes, drop entities, rename entities, create
//!   entities, per-entity attribute changes, recreate unique indexes.
//! - Attribute kind changes and downgrades require a mapping model.

use crate::db::sql::{self, quote_ident};
use crate::db::DbError;
use crate::model::schema::{AttributeDescription, EntityDescription, SchemaDescriptor};
use crate::model::value::AttributeValue;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};

mod mapping;

pub use mapping::MappingModel;

#[derive(Debug)]
pub enum MigrationError {
    /// No mapping model was supplied or discoverable, and the change cannot
    /// be inferred.
    MappingModelNotFound {
        source_version: u32,
        destination_version: u32,
        reason: String,
    },
    /// A planned step failed while executing.
    MigrationFailed(String),
    Store(DbError),
}

impl Display for MigrationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MappingModelNotFound {
                source_version,
                destination_version,
                reason,
            } => write!(
                f,
                "no mapping model from schema v{source_version} to v{destination_version}: {reason}"
            ),
            Self::MigrationFailed(reason) => write!(f, "migration failed: {reason}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for MigrationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for MigrationError {
    fn from(value: DbError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for MigrationError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(DbError::Sqlite(value))
    }
}

/// One schema change, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStep {
    DropUniqueIndexes(EntityDescription),
    DropEntity(String),
    RenameEntity {
        from: String,
        to: String,
    },
    CreateEntity(EntityDescription),
    RenameAttribute {
        entity: String,
        from: String,
        to: String,
    },
    DropAttribute {
        entity: String,
        attribute: String,
    },
    AddAttribute {
        entity: String,
        attribute: AttributeDescription,
    },
    FillNulls {
        entity: String,
        attribute: String,
        value: AttributeValue,
    },
    /// Fails the migration when any row still holds nil.
    RequireValues {
        entity: String,
        attribute: String,
    },
    CreateUniqueIndexes(EntityDescription),
}

impl Display for MigrationStep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DropUniqueIndexes(entity) => write!(f, "drop unique indexes of `{}`", entity.name),
            Self::DropEntity(name) => write!(f, "drop entity `{name}`"),
            Self::RenameEntity { from, to } => write!(f, "rename entity `{from}` to `{to}`"),
            Self::CreateEntity(entity) => write!(f, "create entity `{}`", entity.name),
            Self::RenameAttribute { entity, from, to } => {
                write!(f, "rename attribute `{entity}.{from}` to `{to}`")
            }
            Self::DropAttribute { entity, attribute } => {
                write!(f, "drop attribute `{entity}.{attribute}`")
            }
            Self::AddAttribute { entity, attribute } => {
                write!(f, "add attribute `{entity}.{}`", attribute.name)
            }
            Self::FillNulls {
                entity, attribute, ..
            } => write!(f, "fill nil values of `{entity}.{attribute}`"),
            Self::RequireValues { entity, attribute } => {
                write!(f, "require values for `{entity}.{attribute}`")
            }
            Self::CreateUniqueIndexes(entity) => {
                write!(f, "create unique indexes of `{}`", entity.name)
            }
        }
    }
}

/// Ordered steps turning one schema into another.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MigrationPlan {
    pub source_version: u32,
    pub destination_version: u32,
    pub steps: Vec<MigrationStep>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Executes every step on `conn` (expected to be inside a transaction).
    pub fn apply(&self, conn: &Connection) -> Result<(), MigrationError> {
        for step in &self.steps {
            apply_step(conn, step)
                .map_err(|err| MigrationError::MigrationFailed(format!("{step}: {err}")))?;
        }
        Ok(())
    }
}

/// Plans the migration from `from` (stamped) to `to` (loaded).
///
/// # Errors
/// - `MappingModelNotFound` when the change needs information neither the
///   schemas nor `mapping` provide.
pub fn plan_migration(
    from: &SchemaDescriptor,
    to: &SchemaDescriptor,
    mapping: Option<&MappingModel>,
) -> Result<MigrationPlan, MigrationError> {
    let mut plan = MigrationPlan {
        source_version: from.version,
        destination_version: to.version,
        steps: Vec::new(),
    };
    if from == to {
        return Ok(plan);
    }

    let not_found = |reason: String| MigrationError::MappingModelNotFound {
        source_version: from.version,
        destination_version: to.version,
        reason,
    };

    if mapping.is_none() && to.version < from.version {
        return Err(not_found(format!(
            "store schema v{} is newer than model v{}",
            from.version, to.version
        )));
    }

    let source_name = |entity: &str| -> String {
        mapping.map_or(entity, |m| m.source_entity(entity)).to_string()
    };

    let mut consumed = BTreeSet::new();
    let mut renames = Vec::new();
    let mut creates = Vec::new();
    let mut attribute_steps = Vec::new();

    for destination in &to.entities {
        let source = source_name(&destination.name);
        match from.entity(&source) {
            None => creates.push(MigrationStep::CreateEntity(destination.clone())),
            Some(existing) => {
                consumed.insert(existing.name.clone());
                if existing.name != destination.name {
                    renames.push(MigrationStep::RenameEntity {
                        from: existing.name.clone(),
                        to: destination.name.clone(),
                    });
                }
                plan_attributes(existing, destination, mapping, &mut attribute_steps)
                    .map_err(not_found)?;
            }
        }
    }

    plan.steps.extend(
        from.entities
            .iter()
            .filter(|entity| entity.attributes.iter().any(|a| a.unique))
            .map(|entity| MigrationStep::DropUniqueIndexes(entity.clone())),
    );
    plan.steps.extend(
        from.entities
            .iter()
            .filter(|entity| !consumed.contains(&entity.name))
            .map(|entity| MigrationStep::DropEntity(entity.name.clone())),
    );
    plan.steps.extend(renames);
    plan.steps.extend(creates);
    plan.steps.extend(attribute_steps);
    plan.steps.extend(
        to.entities
            .iter()
            .filter(|entity| entity.attributes.iter().any(|a| a.unique))
            .map(|entity| MigrationStep::CreateUniqueIndexes(entity.clone())),
    );

    Ok(plan)
}

fn plan_attributes(
    source: &EntityDescription,
    destination: &EntityDescription,
    mapping: Option<&MappingModel>,
    steps: &mut Vec<MigrationStep>,
) -> Result<(), String> {
    let entity = destination.name.as_str();
    let mut consumed = BTreeSet::new();
    let mut renames = Vec::new();
    let mut adds = Vec::new();
    let mut fills = Vec::new();

    for attribute in &destination.attributes {
        let source_name = mapping.map_or(attribute.name.as_str(), |m| {
            m.source_attribute(entity, &attribute.name)
        });
        let fill = mapping
            .and_then(|m| m.fill_value(entity, &attribute.name))
            .or(attribute.default.as_ref())
            .cloned();

        if let Some(value) = &fill {
            if !attribute.kind.accepts(value) {
                return Err(format!(
                    "fill value for `{entity}.{}` is {} but the attribute is {}",
                    attribute.name,
                    value.type_name(),
                    attribute.kind
                ));
            }
        }

        match source.attribute(source_name) {
            None => {
                if !attribute.optional && fill.is_none() {
                    return Err(format!(
                        "new required attribute `{entity}.{}` has no default or fill value",
                        attribute.name
                    ));
                }
                adds.push(MigrationStep::AddAttribute {
                    entity: entity.to_string(),
                    attribute: attribute.clone(),
                });
                if let Some(value) = fill {
                    fills.push(MigrationStep::FillNulls {
                        entity: entity.to_string(),
                        attribute: attribute.name.clone(),
                        value: attribute.kind.coerce(value),
                    });
                }
            }
            Some(existing) => {
                consumed.insert(existing.name.clone());
                if existing.kind != attribute.kind {
                    return Err(format!(
                        "attribute `{entity}.{}` changes kind from {} to {}",
                        attribute.name, existing.kind, attribute.kind
                    ));
                }
                if existing.name != attribute.name {
                    renames.push(MigrationStep::RenameAttribute {
                        entity: entity.to_string(),
                        from: existing.name.clone(),
                        to: attribute.name.clone(),
                    });
                }
                if existing.optional && !attribute.optional {
                    if let Some(value) = fill {
                        fills.push(MigrationStep::FillNulls {
                            entity: entity.to_string(),
                            attribute: attribute.name.clone(),
                            value: attribute.kind.coerce(value),
                        });
                    }
                    fills.push(MigrationStep::RequireValues {
                        entity: entity.to_string(),
                        attribute: attribute.name.clone(),
                    });
                }
            }
        }
    }

    steps.extend(renames);
    steps.extend(
        source
            .attributes
            .iter()
            .filter(|attribute| !consumed.contains(&attribute.name))
            .map(|attribute| MigrationStep::DropAttribute {
                entity: entity.to_string(),
                attribute: attribute.name.clone(),
            }),
    );
    steps.extend(adds);
    steps.extend(fills);
    Ok(())
}

fn apply_step(conn: &Connection, step: &MigrationStep) -> Result<(), DbError> {
    match step {
        MigrationStep::DropUniqueIndexes(entity) => sql::drop_unique_indexes(conn, entity)?,
        MigrationStep::DropEntity(name) => {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(name)))?;
        }
        MigrationStep::RenameEntity { from, to } => {
            conn.execute_batch(&format!(
                "ALTER TABLE {} RENAME TO {};",
                quote_ident(from),
                quote_ident(to)
            ))?;
        }
        MigrationStep::CreateEntity(entity) => sql::create_entity_table(conn, entity)?,
        MigrationStep::RenameAttribute { entity, from, to } => {
            conn.execute_batch(&format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {};",
                quote_ident(entity),
                quote_ident(from),
                quote_ident(to)
            ))?;
        }
        MigrationStep::DropAttribute { entity, attribute } => {
            conn.execute_batch(&format!(
                "ALTER TABLE {} DROP COLUMN {};",
                quote_ident(entity),
                quote_ident(attribute)
            ))?;
        }
        MigrationStep::AddAttribute { entity, attribute } => {
            conn.execute_batch(&format!(
                "ALTER TABLE {} ADD COLUMN {} {};",
                quote_ident(entity),
                quote_ident(&attribute.name),
                attribute.kind.sql_type()
            ))?;
        }
        MigrationStep::FillNulls {
            entity,
            attribute,
            value,
        } => {
            conn.execute(
                &format!(
                    "UPDATE {table} SET {column} = ?1 WHERE {column} IS NULL;",
                    table = quote_ident(entity),
                    column = quote_ident(attribute)
                ),
                [value],
            )?;
        }
        MigrationStep::RequireValues { entity, attribute } => {
            let missing: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE {} IS NULL;",
                    quote_ident(entity),
                    quote_ident(attribute)
                ),
                [],
                |row| row.get(0),
            )?;
            if missing > 0 {
                return Err(DbError::InvalidData(format!(
                    "{missing} row(s) have no value for required attribute"
                )));
            }
        }
        MigrationStep::CreateUniqueIndexes(entity) => sql::create_unique_indexes(conn, entity)?,
    }
    Ok(())
}
