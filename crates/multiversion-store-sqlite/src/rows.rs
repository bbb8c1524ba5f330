//! Generic row access driven by [`TableLayout`]s.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use multiversion_core::{
    ColumnProperty, EntityKindDescriptor, EntityRecord, FieldValue, TableLayout, TableRole,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection};

use crate::{bool_to_sql, quote_ident};

pub(crate) type Row = BTreeMap<String, FieldValue>;

pub(crate) fn to_sql(value: &FieldValue) -> SqlValue {
    match value {
        FieldValue::Null => SqlValue::Null,
        FieldValue::Integer(integer) => SqlValue::Integer(*integer),
        FieldValue::Float(float) => SqlValue::Real(*float),
        FieldValue::Text(text) => SqlValue::Text(text.clone()),
    }
}

pub(crate) fn from_sql(value: SqlValue) -> FieldValue {
    match value {
        SqlValue::Null => FieldValue::Null,
        SqlValue::Integer(integer) => FieldValue::Integer(integer),
        SqlValue::Real(float) => FieldValue::Float(float),
        SqlValue::Text(text) => FieldValue::Text(text),
        SqlValue::Blob(bytes) => FieldValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

pub(crate) fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let count: i64 = conn
        .query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
            [],
            |row| row.get(0),
        )
        .with_context(|| format!("failed to count rows of {table}"))?;
    Ok(u64::try_from(count).unwrap_or_default())
}

pub(crate) fn max_value(conn: &Connection, table: &str, column: &str) -> Result<Option<i64>> {
    conn.query_row(
        &format!(
            "SELECT MAX({}) FROM {}",
            quote_ident(column),
            quote_ident(table)
        ),
        [],
        |row| row.get(0),
    )
    .with_context(|| format!("failed to read MAX({column}) of {table}"))
}

pub(crate) fn next_id(conn: &Connection, table: &str, column: &str) -> Result<i64> {
    Ok(max_value(conn, table, column)?.unwrap_or(0) + 1)
}

pub(crate) fn ids_after(
    conn: &Connection,
    table: &str,
    column: &str,
    cursor: i64,
    limit: usize,
) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {column} FROM {table} WHERE {column} > ?1 ORDER BY {column} ASC LIMIT ?2",
            column = quote_ident(column),
            table = quote_ident(table),
        ))
        .with_context(|| format!("failed to prepare batch selection on {table}"))?;
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let rows = stmt.query_map(params![cursor, limit], |row| row.get::<_, i64>(0))?;
    crate::collect_rows(rows)
}

pub(crate) fn exists_after(conn: &Connection, table: &str, column: &str, cursor: i64) -> Result<bool> {
    Ok(!ids_after(conn, table, column, cursor, 1)?.is_empty())
}

/// Values of `column` in `table` that have no match in `source`.
pub(crate) fn ids_missing_from(
    conn: &Connection,
    table: &str,
    source: &str,
    column: &str,
) -> Result<Vec<i64>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT t.{column} FROM {table} t
             WHERE NOT EXISTS (SELECT 1 FROM {source} s WHERE s.{column} = t.{column})
             ORDER BY t.{column} ASC",
            column = quote_ident(column),
            table = quote_ident(table),
            source = quote_ident(source),
        ))
        .with_context(|| format!("failed to prepare orphan selection on {table}"))?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    crate::collect_rows(rows)
}

pub(crate) fn insert_row(conn: &Connection, table: &str, row: &[(String, SqlValue)]) -> Result<()> {
    let columns = row
        .iter()
        .map(|(column, _)| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=row.len())
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!(
            "INSERT INTO {} ({columns}) VALUES ({placeholders})",
            quote_ident(table)
        ),
        params_from_iter(row.iter().map(|(_, value)| value)),
    )
    .with_context(|| format!("failed to insert row into {table}"))?;
    Ok(())
}

pub(crate) fn delete_where(conn: &Connection, table: &str, column: &str, value: i64) -> Result<usize> {
    conn.execute(
        &format!(
            "DELETE FROM {} WHERE {} = ?1",
            quote_ident(table),
            quote_ident(column)
        ),
        params![value],
    )
    .with_context(|| format!("failed to delete rows from {table}"))
}

pub(crate) fn select_where(
    conn: &Connection,
    table: &str,
    column: &str,
    value: &SqlValue,
    order_by: Option<&str>,
) -> Result<Vec<Row>> {
    let order = order_by
        .map(|order| format!(" ORDER BY {} ASC", quote_ident(order)))
        .unwrap_or_default();
    let mut stmt = conn
        .prepare(&format!(
            "SELECT * FROM {} WHERE {} = ?1{order}",
            quote_ident(table),
            quote_ident(column)
        ))
        .with_context(|| format!("failed to prepare row selection on {table}"))?;
    let names: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect();

    let mut rows = stmt.query(params![value])?;
    let mut selected = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Row::new();
        for (index, name) in names.iter().enumerate() {
            values.insert(name.clone(), from_sql(row.get::<_, SqlValue>(index)?));
        }
        selected.push(values);
    }
    Ok(selected)
}

/// Column holding the entity id (or the revision id for revision roles).
pub(crate) fn key_column(kind: &EntityKindDescriptor, role: TableRole) -> &str {
    match role {
        TableRole::Base | TableRole::Data => kind.id_key.as_str(),
        TableRole::Revision | TableRole::RevisionData => kind.revision_key_or_default(),
        TableRole::Dedicated => "entity_id",
        TableRole::DedicatedRevision => "revision_id",
    }
}

fn layout_rows(
    kind: &EntityKindDescriptor,
    layout: &TableLayout,
    record: &EntityRecord,
) -> Vec<Vec<(String, SqlValue)>> {
    let column_value = |langcode: Option<&str>, item: Option<(usize, &FieldValue)>| {
        layout
            .schema
            .columns
            .iter()
            .map(|column| {
                let value = match column.property {
                    ColumnProperty::IsStub => FieldValue::Integer(bool_to_sql(record.revision.is_stub)),
                    ColumnProperty::Delta => item
                        .map(|(delta, _)| FieldValue::Integer(i64::try_from(delta).unwrap_or(i64::MAX)))
                        .unwrap_or_default(),
                    ColumnProperty::Value => match item {
                        Some((_, value)) if layout.field.as_deref() == Some(column.field.as_str()) => {
                            value.clone()
                        }
                        _ => record.value(kind, &column.field, langcode),
                    },
                };
                let value = if value.is_null() {
                    column.default.clone().unwrap_or(value)
                } else {
                    value
                };
                (column.name.clone(), to_sql(&value))
            })
            .collect::<Vec<_>>()
    };

    match layout.role {
        TableRole::Base | TableRole::Revision => vec![column_value(None, None)],
        TableRole::Data | TableRole::RevisionData => record
            .languages()
            .iter()
            .map(|langcode| column_value(Some(langcode.as_str()), None))
            .collect(),
        TableRole::Dedicated | TableRole::DedicatedRevision => layout
            .field
            .as_ref()
            .and_then(|field| record.multi_values.get(field))
            .map(|values| {
                values
                    .iter()
                    .enumerate()
                    .map(|item| column_value(None, Some(item)))
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Writes `record` into every table of `layouts`. With `replace`, rows of
/// the entity in non-revision tables are deleted first.
pub(crate) fn write_entity_rows(
    conn: &Connection,
    kind: &EntityKindDescriptor,
    layouts: &[TableLayout],
    record: &EntityRecord,
    replace: bool,
) -> Result<()> {
    let entity_id = record
        .id
        .ok_or_else(|| anyhow::anyhow!("entity of kind {} has no id", record.kind))?;

    for layout in layouts {
        if replace && !layout.role.is_revision() {
            delete_where(conn, &layout.table, key_column(kind, layout.role), entity_id)?;
        }
        for row in layout_rows(kind, layout, record) {
            insert_row(conn, &layout.table, &row)?;
        }
    }
    Ok(())
}

/// Hydrates `record` from the rows keyed by `id` (non-revision tables) and
/// `revision_id` (revision tables). Returns false when the leading table has
/// no row.
pub(crate) fn read_entity_rows(
    conn: &Connection,
    kind: &EntityKindDescriptor,
    layouts: &[TableLayout],
    record: &mut EntityRecord,
    id: i64,
    revision_id: Option<i64>,
) -> Result<bool> {
    let langcode_key = kind.langcode_key.as_deref();

    for (position, layout) in layouts.iter().enumerate() {
        let key = if layout.role.is_revision() {
            match revision_id {
                Some(revision_id) => revision_id,
                None => continue,
            }
        } else {
            id
        };
        let order = match layout.role {
            TableRole::Dedicated | TableRole::DedicatedRevision => Some("delta"),
            _ => None,
        };
        let rows = select_where(
            conn,
            &layout.table,
            key_column(kind, layout.role),
            &SqlValue::Integer(key),
            order,
        )?;
        if position == 0 && rows.is_empty() {
            return Ok(false);
        }

        match layout.role {
            TableRole::Base | TableRole::Revision => {
                for row in rows {
                    apply_row(kind, layout, record, &row, None);
                }
            }
            TableRole::Data | TableRole::RevisionData => {
                for row in rows {
                    let langcode = langcode_key
                        .and_then(|key| row.get(key))
                        .and_then(FieldValue::as_str)
                        .map(str::to_string);
                    apply_row(kind, layout, record, &row, langcode.as_deref());
                }
            }
            TableRole::Dedicated | TableRole::DedicatedRevision => {
                let Some(field) = layout.field.as_ref() else {
                    continue;
                };
                let values = rows
                    .into_iter()
                    .filter_map(|mut row| row.remove(field))
                    .collect::<Vec<_>>();
                record.multi_values.insert(field.clone(), values);
            }
        }
    }
    Ok(true)
}

fn apply_row(
    kind: &EntityKindDescriptor,
    layout: &TableLayout,
    record: &mut EntityRecord,
    row: &Row,
    langcode: Option<&str>,
) {
    for column in &layout.schema.columns {
        let Some(value) = row.get(&column.name) else {
            continue;
        };
        match column.property {
            ColumnProperty::IsStub => record.revision.is_stub = value.as_bool().unwrap_or(false),
            ColumnProperty::Delta => {}
            ColumnProperty::Value => {
                record.set_value(kind, &column.field, langcode, value.clone());
            }
        }
    }
}
