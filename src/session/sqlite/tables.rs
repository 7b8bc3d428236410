use std::ops::Range;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use super::map_sql_error;
use super::packages::INTERNAL_PREFIX;
use crate::dataset::{ColumnType, Field, Schema, Table, Value};
use crate::session::SessionError;
use crate::session::identifier::quote_identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Table,
    View,
}

fn object_kind(connection: &Connection, name: &str) -> Result<Option<ObjectKind>, SessionError> {
    if name.starts_with(INTERNAL_PREFIX) {
        return Ok(None);
    }
    let kind: Option<String> = connection
        .query_row(
            "SELECT type FROM sqlite_master WHERE name = ?1 AND type IN ('table', 'view')",
            params![name],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sql_error)?;
    Ok(kind.map(|kind| {
        if kind == "view" {
            ObjectKind::View
        } else {
            ObjectKind::Table
        }
    }))
}

fn require(connection: &Connection, name: &str) -> Result<ObjectKind, SessionError> {
    object_kind(connection, name)?.ok_or_else(|| SessionError::TableNotFound(name.to_string()))
}

fn require_absent(connection: &Connection, name: &str) -> Result<(), SessionError> {
    if name.starts_with(INTERNAL_PREFIX) {
        return Err(SessionError::InvalidName(name.to_string()));
    }
    match object_kind(connection, name)? {
        Some(_) => Err(SessionError::TableExists(name.to_string())),
        None => Ok(()),
    }
}

pub(super) fn describe(connection: &Connection, table: &str) -> Result<Schema, SessionError> {
    require(connection, table)?;
    let mut stmt = connection
        .prepare("SELECT name, type FROM pragma_table_info(?1) ORDER BY cid")
        .map_err(map_sql_error)?;
    let rows = stmt
        .query_map(params![table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(map_sql_error)?;
    let mut fields = Vec::new();
    for row in rows {
        let (name, declared) = row.map_err(map_sql_error)?;
        fields.push(Field::new(name, ColumnType::from_sql_name(&declared)));
    }
    Ok(Schema::new(fields)?)
}

pub(super) fn row_count(connection: &Connection, table: &str) -> Result<u64, SessionError> {
    require(connection, table)?;
    let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
    let count: i64 = connection
        .query_row(&sql, [], |row| row.get(0))
        .map_err(map_sql_error)?;
    Ok(count.max(0) as u64)
}

/// `SELECT` over a column list and row window, in rowid order for tables.
fn select_sql(kind: ObjectKind, table: &str, columns: &[String], rows: Option<&Range<u64>>) -> String {
    let projection = columns
        .iter()
        .map(|column| quote_identifier(column))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {projection} FROM {}", quote_identifier(table));
    if kind == ObjectKind::Table {
        sql.push_str(" ORDER BY rowid");
    }
    if let Some(rows) = rows {
        let limit = rows.end.saturating_sub(rows.start);
        sql.push_str(&format!(" LIMIT {limit} OFFSET {}", rows.start));
    }
    sql
}

pub(super) fn read(
    connection: &Connection,
    table: &str,
    columns: &[String],
    rows: Option<Range<u64>>,
) -> Result<Table, SessionError> {
    let kind = require(connection, table)?;
    let full = describe(connection, table)?;
    let schema = if columns.is_empty() {
        full
    } else {
        full.project(columns)?
    };
    let names = schema.names();
    let sql = select_sql(kind, table, &names, rows.as_ref());
    let mut stmt = connection.prepare(&sql).map_err(map_sql_error)?;
    let mut query = stmt.query([]).map_err(map_sql_error)?;
    let mut out = Vec::new();
    while let Some(row) = query.next().map_err(map_sql_error)? {
        let mut values = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let value = match row.get_ref(idx).map_err(map_sql_error)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Integer(v),
                ValueRef::Real(v) => Value::Float(v),
                ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
                ValueRef::Blob(_) => {
                    return Err(SessionError::UnsupportedValue {
                        table: table.to_string(),
                        column: name.clone(),
                    });
                }
            };
            values.push(value);
        }
        out.push(values);
    }
    Ok(Table::new(schema, out)?)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Float(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
    }
}

pub(super) fn write(connection: &mut Connection, name: &str, table: &Table) -> Result<(), SessionError> {
    require_absent(connection, name)?;
    let columns = table
        .schema()
        .fields()
        .iter()
        .map(|field| format!("{} {}", quote_identifier(&field.name), field.column_type.sql_name()))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = (1..=table.num_columns())
        .map(|idx| format!("?{idx}"))
        .collect::<Vec<_>>()
        .join(", ");
    let quoted = quote_identifier(name);
    let tx = connection.transaction().map_err(map_sql_error)?;
    tx.execute(&format!("CREATE TABLE {quoted} ({columns})"), [])
        .map_err(map_sql_error)?;
    {
        let mut stmt = tx
            .prepare(&format!("INSERT INTO {quoted} VALUES ({placeholders})"))
            .map_err(map_sql_error)?;
        for row in table.rows() {
            stmt.execute(params_from_iter(row.iter().map(to_sql)))
                .map_err(map_sql_error)?;
        }
    }
    tx.commit().map_err(map_sql_error)?;
    Ok(())
}

pub(super) fn copy(
    connection: &Connection,
    source: &str,
    target: &str,
    columns: &[String],
    rows: Option<Range<u64>>,
) -> Result<u64, SessionError> {
    let kind = require(connection, source)?;
    require_absent(connection, target)?;
    let schema = describe(connection, source)?;
    let schema = if columns.is_empty() {
        schema
    } else {
        schema.project(columns)?
    };
    let select = select_sql(kind, source, &schema.names(), rows.as_ref());
    connection
        .execute(
            &format!("CREATE TABLE {} AS {select}", quote_identifier(target)),
            [],
        )
        .map_err(map_sql_error)?;
    row_count(connection, target)
}

pub(super) fn drop(connection: &Connection, name: &str) -> Result<bool, SessionError> {
    let statement = match object_kind(connection, name)? {
        None => return Ok(false),
        Some(ObjectKind::Table) => "DROP TABLE",
        Some(ObjectKind::View) => "DROP VIEW",
    };
    connection
        .execute(&format!("{statement} {}", quote_identifier(name)), [])
        .map_err(map_sql_error)?;
    Ok(true)
}

pub(super) fn list(connection: &Connection) -> Result<Vec<String>, SessionError> {
    let mut stmt = connection
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
             ORDER BY name",
        )
        .map_err(map_sql_error)?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(map_sql_error)?;
    let mut names = Vec::new();
    for name in rows {
        let name = name.map_err(map_sql_error)?;
        if !name.starts_with(INTERNAL_PREFIX) {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::sqlite::packages::apply_schema;

    fn connection_with_table() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let table = Table::from_f64_columns(&[
            ("X", (0..10).map(f64::from).collect()),
            ("Y", (0..10).map(|v| f64::from(v) * 2.0).collect()),
        ])
        .unwrap();
        write(&mut conn, "TRAIN", &table).unwrap();
        conn
    }

    #[test]
    fn describe_and_read_window_in_rowid_order() {
        let conn = connection_with_table();
        let schema = describe(&conn, "TRAIN").unwrap();
        assert_eq!(schema.names(), vec!["X".to_string(), "Y".to_string()]);
        assert_eq!(schema.fields()[0].column_type, ColumnType::Float);

        let window = read(&conn, "TRAIN", &["Y".to_string()], Some(3..6)).unwrap();
        let values: Vec<f64> = window.rows().iter().map(|row| row[0].as_f64().unwrap()).collect();
        assert_eq!(values, vec![6.0, 8.0, 10.0]);
    }

    #[test]
    fn copy_preserves_types_and_order() {
        let conn = connection_with_table();
        let copied = copy(&conn, "TRAIN", "CHUNK_1", &["X".to_string()], Some(8..20)).unwrap();
        assert_eq!(copied, 2);
        let schema = describe(&conn, "CHUNK_1").unwrap();
        assert_eq!(schema.fields()[0].column_type, ColumnType::Float);
        let chunk = read(&conn, "CHUNK_1", &[], None).unwrap();
        assert_eq!(chunk.rows()[0][0], Value::Float(8.0));
        assert!(matches!(
            copy(&conn, "TRAIN", "CHUNK_1", &[], None),
            Err(SessionError::TableExists(_))
        ));
    }

    #[test]
    fn internal_tables_are_hidden_and_protected() {
        let mut conn = connection_with_table();
        assert_eq!(list(&conn).unwrap(), vec!["TRAIN".to_string()]);
        assert!(matches!(
            describe(&conn, "_remotefit_packages"),
            Err(SessionError::TableNotFound(_))
        ));
        let table = Table::from_f64_columns(&[("A", vec![1.0])]).unwrap();
        assert!(matches!(
            write(&mut conn, "_remotefit_x", &table),
            Err(SessionError::InvalidName(_))
        ));
    }

    #[test]
    fn drop_reports_whether_table_existed() {
        let conn = connection_with_table();
        assert!(drop(&conn, "TRAIN").unwrap());
        assert!(!drop(&conn, "TRAIN").unwrap());
        assert!(matches!(
            row_count(&conn, "TRAIN"),
            Err(SessionError::TableNotFound(_))
        ));
    }

    #[test]
    fn views_are_readable_without_rowid() {
        let conn = connection_with_table();
        conn.execute("CREATE VIEW EVEN AS SELECT X FROM TRAIN WHERE X % 2 = 0", [])
            .unwrap();
        assert_eq!(row_count(&conn, "EVEN").unwrap(), 5);
        let view = read(&conn, "EVEN", &[], Some(0..2)).unwrap();
        assert_eq!(view.num_rows(), 2);
    }
}
