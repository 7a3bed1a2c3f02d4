// ABOUTME: SQL text builders for the PostgreSQL target
// ABOUTME: Values are bound as text and cast to the column type server-side

use crate::record::KEY_FIELD;
use crate::source::{FieldDef, FieldKind, TableSchema};
use crate::utils::quote_ident;

/// PostgreSQL column type for a source field.
pub fn column_type(field: &FieldDef) -> String {
    match field.kind {
        FieldKind::Key => "VARCHAR(32)".to_string(),
        FieldKind::Integer => "BIGINT".to_string(),
        FieldKind::Decimal => "NUMERIC".to_string(),
        FieldKind::Boolean => "BOOLEAN".to_string(),
        FieldKind::Date => "DATE".to_string(),
        FieldKind::DateTime => "TIMESTAMP".to_string(),
        FieldKind::String => match field.max_length {
            Some(len) if len > 0 && len <= 4000 => format!("VARCHAR({})", len),
            _ => "TEXT".to_string(),
        },
    }
}

/// Placeholder for parameter `n` cast to the field's column type.
fn placeholder(field: &FieldDef, n: usize) -> String {
    format!("${}::text::{}", n, column_type(field))
}

fn qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

/// Build a CREATE TABLE statement with the key field as primary key.
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS "public"."incident" (
///   "sys_id" VARCHAR(32) NOT NULL PRIMARY KEY, "number" VARCHAR(40), ...)
/// ```
pub fn build_create_table(db_schema: &str, table: &str, schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .fields()
        .iter()
        .map(|field| {
            if field.name == KEY_FIELD {
                format!("{} {} NOT NULL PRIMARY KEY", quote_ident(&field.name), column_type(field))
            } else {
                format!("{} {}", quote_ident(&field.name), column_type(field))
            }
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified(db_schema, table),
        columns.join(", ")
    )
}

pub fn build_drop_table(db_schema: &str, table: &str, ignore_if_absent: bool) -> String {
    if ignore_if_absent {
        format!("DROP TABLE IF EXISTS {}", qualified(db_schema, table))
    } else {
        format!("DROP TABLE {}", qualified(db_schema, table))
    }
}

pub fn build_truncate(db_schema: &str, table: &str) -> String {
    format!("TRUNCATE TABLE {}", qualified(db_schema, table))
}

/// Build an INSERT binding every schema field in order.
///
/// ```sql
/// INSERT INTO "public"."incident" ("sys_id", "number")
/// VALUES ($1::text::VARCHAR(32), $2::text::VARCHAR(40))
/// ```
pub fn build_insert(db_schema: &str, table: &str, schema: &TableSchema) -> String {
    let columns: Vec<String> = schema.fields().iter().map(|f| quote_ident(&f.name)).collect();
    let values: Vec<String> = schema
        .fields()
        .iter()
        .enumerate()
        .map(|(idx, f)| placeholder(f, idx + 1))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        qualified(db_schema, table),
        columns.join(", "),
        values.join(", ")
    )
}

/// Build an UPDATE of all non-key fields; the key is the last parameter.
///
/// Returns `None` when the schema has only the key field (nothing to set).
pub fn build_update(db_schema: &str, table: &str, schema: &TableSchema) -> Option<String> {
    let assignments: Vec<String> = schema
        .fields()
        .iter()
        .filter(|f| f.name != KEY_FIELD)
        .enumerate()
        .map(|(idx, f)| format!("{} = {}", quote_ident(&f.name), placeholder(f, idx + 1)))
        .collect();
    if assignments.is_empty() {
        return None;
    }
    Some(format!(
        "UPDATE {} SET {} WHERE {} = ${}",
        qualified(db_schema, table),
        assignments.join(", "),
        quote_ident(KEY_FIELD),
        assignments.len() + 1
    ))
}

/// Existence probe used when an UPDATE has nothing to set.
pub fn build_exists(db_schema: &str, table: &str) -> String {
    format!(
        "SELECT 1 FROM {} WHERE {} = $1",
        qualified(db_schema, table),
        quote_ident(KEY_FIELD)
    )
}

pub fn build_delete(db_schema: &str, table: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = $1",
        qualified(db_schema, table),
        quote_ident(KEY_FIELD)
    )
}
