//! Physical table mapping for schema entities.
//!
//! # Invariants
//! - Every entity table has a text primary key column `_id`.
//! - Attribute columns are nullable; required-ness is enforced before SQL.
//! - Unique attributes are backed by `ux_<entity>_<attribute>` indexes.

use super::{DbError, DbResult};
use crate::model::instance::{Attributes, ObjectId};
use crate::model::schema::{EntityDescription, SchemaDescriptor};
use crate::model::value::AttributeValue;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(crate) const ID_COLUMN: &str = "_id";
const META_TABLE: &str = "_lanestore_meta";
const META_SCHEMA_KEY: &str = "schema";

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub(crate) fn unique_index_name(entity: &str, attribute: &str) -> String {
    format!("ux_{entity}_{attribute}")
}

pub(crate) fn create_entity_table(conn: &Connection, entity: &EntityDescription) -> DbResult<()> {
    let mut columns = vec![format!("{} TEXT PRIMARY KEY NOT NULL", quote_ident(ID_COLUMN))];
    columns.extend(
        entity
            .attributes
            .iter()
            .map(|attribute| format!("{} {}", quote_ident(&attribute.name), attribute.kind.sql_type())),
    );

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {} ({});",
        quote_ident(&entity.name),
        columns.join(", ")
    ))?;
    Ok(())
}

pub(crate) fn create_unique_indexes(conn: &Connection, entity: &EntityDescription) -> DbResult<()> {
    for attribute in entity.attributes.iter().filter(|a| a.unique) {
        conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({});",
            quote_ident(&unique_index_name(&entity.name, &attribute.name)),
            quote_ident(&entity.name),
            quote_ident(&attribute.name)
        ))?;
    }
    Ok(())
}

pub(crate) fn drop_unique_indexes(conn: &Connection, entity: &EntityDescription) -> DbResult<()> {
    for attribute in entity.attributes.iter().filter(|a| a.unique) {
        conn.execute_batch(&format!(
            "DROP INDEX IF EXISTS {};",
            quote_ident(&unique_index_name(&entity.name, &attribute.name))
        ))?;
    }
    Ok(())
}

/// Creates tables and indexes for every entity and stamps `schema`.
pub(crate) fn create_schema(conn: &Connection, schema: &SchemaDescriptor) -> DbResult<()> {
    for entity in &schema.entities {
        create_entity_table(conn, entity)?;
        create_unique_indexes(conn, entity)?;
    }
    stamp_schema(conn, schema)
}

/// Reads the schema recorded inside the store, if it was ever stamped.
pub(crate) fn read_stamped_schema(conn: &Connection) -> DbResult<Option<SchemaDescriptor>> {
    let has_meta: bool = conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1
        );",
        [META_TABLE],
        |row| row.get(0),
    )?;
    if !has_meta {
        return Ok(None);
    }

    let json: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {META_TABLE} WHERE key = ?1;"),
            [META_SCHEMA_KEY],
            |row| row.get(0),
        )
        .optional()?;

    let Some(json) = json else {
        return Ok(None);
    };
    let schema: SchemaDescriptor = serde_json::from_str(&json)
        .map_err(|err| DbError::InvalidData(format!("stamped schema is not valid JSON: {err}")))?;

    let user_version = stamped_user_version(conn)?;
    if user_version != schema.version {
        return Err(DbError::InvalidData(format!(
            "stamped schema v{} disagrees with user_version {user_version}",
            schema.version
        )));
    }
    Ok(Some(schema))
}

/// Records `schema` as the store's current schema.
pub(crate) fn stamp_schema(conn: &Connection, schema: &SchemaDescriptor) -> DbResult<()> {
    let json = serde_json::to_string(schema)
        .map_err(|err| DbError::InvalidData(format!("schema cannot be serialized: {err}")))?;

    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {META_TABLE} (
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
        );"
    ))?;
    conn.execute(
        &format!(
            "INSERT INTO {META_TABLE} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value;"
        ),
        params![META_SCHEMA_KEY, json],
    )?;
    conn.execute_batch(&format!("PRAGMA user_version = {};", schema.version))?;
    Ok(())
}

pub(crate) fn stamped_user_version(conn: &Connection) -> DbResult<u32> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?)
}

/// `SELECT "_id", <attributes> FROM <entity>` without a trailing clause.
pub(crate) fn select_sql(entity: &EntityDescription) -> String {
    let mut columns = vec![quote_ident(ID_COLUMN)];
    columns.extend(entity.attributes.iter().map(|a| quote_ident(&a.name)));
    format!("SELECT {} FROM {}", columns.join(", "), quote_ident(&entity.name))
}

/// Decodes one row produced by [`select_sql`].
pub(crate) fn parse_row(entity: &EntityDescription, row: &Row<'_>) -> DbResult<(ObjectId, Attributes)> {
    let id_text: String = row.get(0)?;
    let id = ObjectId::parse(&id_text).ok_or_else(|| {
        DbError::InvalidData(format!(
            "invalid object id `{id_text}` in {}.{ID_COLUMN}",
            entity.name
        ))
    })?;

    let mut attributes = Attributes::new();
    for (index, attribute) in entity.attributes.iter().enumerate() {
        let value = AttributeValue::from_sql(attribute.kind, row.get_ref(index + 1)?)
            .map_err(|message| {
                DbError::InvalidData(format!("{}.{}: {message}", entity.name, attribute.name))
            })?;
        attributes.insert(attribute.name.clone(), value);
    }

    Ok((id, attributes))
}

pub(crate) fn insert_row(
    conn: &Connection,
    entity: &EntityDescription,
    id: ObjectId,
    attributes: &Attributes,
) -> DbResult<()> {
    let mut columns = vec![quote_ident(ID_COLUMN)];
    let mut placeholders = vec!["?1".to_string()];
    let id_text = id.to_string();
    let null = AttributeValue::Null;
    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(entity.attributes.len() + 1);
    values.push(&id_text);

    for (index, attribute) in entity.attributes.iter().enumerate() {
        columns.push(quote_ident(&attribute.name));
        placeholders.push(format!("?{}", index + 2));
        values.push(attributes.get(&attribute.name).unwrap_or(&null));
    }

    conn.execute(
        &format!(
            "INSERT INTO {} ({}) VALUES ({});",
            quote_ident(&entity.name),
            columns.join(", "),
            placeholders.join(", ")
        ),
        values.as_slice(),
    )?;
    Ok(())
}

/// Rewrites every attribute column of one row; returns the changed row count.
pub(crate) fn update_row(
    conn: &Connection,
    entity: &EntityDescription,
    id: ObjectId,
    attributes: &Attributes,
) -> DbResult<usize> {
    if entity.attributes.is_empty() {
        let exists: bool = conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?1);",
                quote_ident(&entity.name),
                quote_ident(ID_COLUMN)
            ),
            [id.to_string()],
            |row| row.get(0),
        )?;
        return Ok(usize::from(exists));
    }

    let null = AttributeValue::Null;
    let id_text = id.to_string();
    let mut assignments = Vec::with_capacity(entity.attributes.len());
    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(entity.attributes.len() + 1);
    for (index, attribute) in entity.attributes.iter().enumerate() {
        assignments.push(format!("{} = ?{}", quote_ident(&attribute.name), index + 1));
        values.push(attributes.get(&attribute.name).unwrap_or(&null));
    }
    values.push(&id_text);

    let changed = conn.execute(
        &format!(
            "UPDATE {} SET {} WHERE {} = ?{};",
            quote_ident(&entity.name),
            assignments.join(", "),
            quote_ident(ID_COLUMN),
            entity.attributes.len() + 1
        ),
        values.as_slice(),
    )?;
    Ok(changed)
}

pub(crate) fn delete_row(conn: &Connection, entity: &str, id: ObjectId) -> DbResult<usize> {
    let changed = conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ?1;",
            quote_ident(entity),
            quote_ident(ID_COLUMN)
        ),
        [id.to_string()],
    )?;
    Ok(changed)
}

/// Removes every row of `entity` and returns the removed ids.
pub(crate) fn delete_all_rows(conn: &Connection, entity: &str) -> DbResult<Vec<ObjectId>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {};",
        quote_ident(ID_COLUMN),
        quote_ident(entity)
    ))?;
    let mut rows = stmt.query([])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let id_text: String = row.get(0)?;
        let id = ObjectId::parse(&id_text).ok_or_else(|| {
            DbError::InvalidData(format!("invalid object id `{id_text}` in {entity}.{ID_COLUMN}"))
        })?;
        ids.push(id);
    }

    conn.execute_batch(&format!("DELETE FROM {};", quote_ident(entity)))?;
    Ok(ids)
}
