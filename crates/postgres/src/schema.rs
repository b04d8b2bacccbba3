//! SQL generated from the table schema.
//!
//! Identifiers are validated by `TableSchema::check` before any of these
//! builders run and are quoted on top of that.

use engine_core::{DecodedRecord, FieldKind, TableSchema};

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// `CREATE TABLE IF NOT EXISTS` for the schema, key column as primary key.
pub fn create_table_sql(schema: &TableSchema) -> String {
    let columns: Vec<String> = schema
        .columns
        .iter()
        .map(|column| {
            let mut def = format!("{} {}", quote(&column.name), column.kind.sql_type());
            if column.name == schema.key_column {
                def.push_str(" PRIMARY KEY");
            } else if column.required {
                def.push_str(" NOT NULL");
            }
            def
        })
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        quote(&schema.table),
        columns.join(",\n    ")
    )
}

/// Idempotent insert of the columns present on `record`.
///
/// Parameters carry explicit casts so the server never has to infer them.
/// Returns the statement and the column names in parameter order.
pub fn insert_sql<'a>(schema: &TableSchema, record: &'a DecodedRecord) -> (String, Vec<&'a str>) {
    let mut names = Vec::with_capacity(record.len());
    let mut placeholders = Vec::with_capacity(record.len());

    for (index, (column, _)) in record.columns().enumerate() {
        let kind = schema
            .column(column)
            .map(|c| c.kind)
            .unwrap_or(FieldKind::Text);
        names.push(column);
        placeholders.push(format!("${}::{}", index + 1, kind.sql_type()));
    }

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) DO NOTHING",
        quote(&schema.table),
        names.iter().map(|n| quote(n)).collect::<Vec<_>>().join(", "),
        placeholders.join(", "),
        quote(&schema.key_column),
    );

    (sql, names)
}

/// Query returning one row when the table exists.
pub const TABLE_EXISTS_SQL: &str =
    "SELECT 1 FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1";
