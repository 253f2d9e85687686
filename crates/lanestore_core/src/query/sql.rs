//! Fetch request compilation into SQL.

use crate::db::sql::{parse_row, quote_ident, select_sql};
use crate::db::DbResult;
use crate::model::instance::{Attributes, ObjectId};
use crate::model::schema::EntityDescription;
use crate::model::value::AttributeValue;
use crate::query::predicate::{key_column, Predicate};
use crate::query::request::FetchRequest;
use rusqlite::{params_from_iter, Connection};

/// SQL text plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CompiledQuery {
    pub sql: String,
    pub params: Vec<AttributeValue>,
}

/// Compiles `request`; paging is left out unless `paged` is set.
pub(crate) fn compile_fetch(
    entity: &EntityDescription,
    request: &FetchRequest,
    paged: bool,
) -> CompiledQuery {
    let mut params = Vec::new();
    let mut sql = select_sql(entity);
    push_where(&mut sql, request.predicate.as_ref(), &mut params);

    let mut order: Vec<String> = request
        .sort
        .iter()
        .map(|sort| {
            format!(
                "{} {}",
                key_column(&sort.key),
                if sort.ascending { "ASC" } else { "DESC" }
            )
        })
        .collect();
    order.push("rowid ASC".to_string());
    sql.push_str(" ORDER BY ");
    sql.push_str(&order.join(", "));

    if paged && request.is_paged() {
        sql.push_str(" LIMIT ? OFFSET ?");
        let limit = request
            .limit
            .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        params.push(AttributeValue::Integer(limit));
        params.push(AttributeValue::Integer(
            i64::try_from(request.offset).unwrap_or(i64::MAX),
        ));
    }

    CompiledQuery { sql, params }
}

pub(crate) fn compile_count(entity: &EntityDescription, predicate: Option<&Predicate>) -> CompiledQuery {
    let mut params = Vec::new();
    let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&entity.name));
    push_where(&mut sql, predicate, &mut params);
    CompiledQuery { sql, params }
}

fn push_where(sql: &mut String, predicate: Option<&Predicate>, params: &mut Vec<AttributeValue>) {
    if let Some(predicate) = predicate {
        sql.push_str(" WHERE ");
        sql.push_str(&predicate.to_sql(params));
    }
}

/// Runs a compiled fetch and decodes every row.
pub(crate) fn run_fetch(
    conn: &Connection,
    entity: &EntityDescription,
    query: &CompiledQuery,
) -> DbResult<Vec<(ObjectId, Attributes)>> {
    let mut stmt = conn.prepare(&query.sql)?;
    let mut rows = stmt.query(params_from_iter(query.params.iter()))?;
    let mut decoded = Vec::new();
    while let Some(row) = rows.next()? {
        decoded.push(parse_row(entity, row)?);
    }
    Ok(decoded)
}

pub(crate) fn run_count(conn: &Connection, query: &CompiledQuery) -> DbResult<usize> {
    let count: i64 = conn.query_row(&query.sql, params_from_iter(query.params.iter()), |row| {
        row.get(0)
    })?;
    Ok(usize::try_from(count).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::{compile_count, compile_fetch};
    use crate::model::schema::{AttributeDescription, EntityDescription};
    use crate::model::value::AttributeValue;
    use crate::query::predicate::Predicate;
    use crate::query::request::{FetchRequest, SortDescriptor};

    fn note_entity() -> EntityDescription {
        EntityDescription::new("Note")
            .with_attribute(AttributeDescription::text("title"))
            .with_attribute(AttributeDescription::integer("priority"))
    }

    #[test]
    fn fetch_compiles_filter_order_and_page() {
        let request = FetchRequest::new("Note")
            .with_predicate(Predicate::eq("title", "A"))
            .sorted_by(SortDescriptor::descending("priority"))
            .offset(2)
            .limit(10);

        let query = compile_fetch(&note_entity(), &request, true);
        assert_eq!(
            query.sql,
            "SELECT \"_id\", \"title\", \"priority\" FROM \"Note\" WHERE \"title\" IS ? \
             ORDER BY \"priority\" DESC, rowid ASC LIMIT ? OFFSET ?"
        );
        assert_eq!(
            query.params,
            vec![
                AttributeValue::from("A"),
                AttributeValue::Integer(10),
                AttributeValue::Integer(2),
            ]
        );

        let unpaged = compile_fetch(&note_entity(), &request, false);
        assert!(!unpaged.sql.contains("LIMIT"));
        assert_eq!(unpaged.params.len(), 1);
    }

    #[test]
    fn offset_without_limit_uses_unbounded_limit() {
        let request = FetchRequest::new("Note").offset(3);
        let query = compile_fetch(&note_entity(), &request, true);
        assert_eq!(
            query.params,
            vec![AttributeValue::Integer(-1), AttributeValue::Integer(3)]
        );
    }

    #[test]
    fn count_maps_id_key_to_id_column() {
        let predicate = Predicate::ne("id", "x");
        let query = compile_count(&note_entity(), Some(&predicate));
        assert_eq!(
            query.sql,
            "SELECT COUNT(*) FROM \"Note\" WHERE (\"_id\" IS NOT NULL AND \"_id\" <> ?)"
        );
    }
}
