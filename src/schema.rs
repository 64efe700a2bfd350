//! Database schema management for `airquality-ingest`.
//!
//! Ensures the measures table exists before the first merge. The DDL is
//! generated from [`CANONICAL_COLUMNS`] so the table, the upsert statement and
//! the normalizer all agree on one column list. An existing table is never
//! altered.

use sqlx::PgPool;

use crate::error::IngestError;
use crate::models::{CANONICAL_COLUMNS, IDENTITY_COLUMNS};

// ---

/// Double-quote an identifier so camelCase column names survive Postgres
/// case folding.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Build the `CREATE TABLE IF NOT EXISTS` statement for `table`.
pub fn create_table_sql(table: &str) -> String {
    // ---
    let columns: Vec<String> = CANONICAL_COLUMNS
        .iter()
        .map(|(name, ty)| {
            let not_null = if IDENTITY_COLUMNS.contains(name) {
                " NOT NULL"
            } else {
                ""
            };
            format!("    {} {}{}", quote_ident(name), ty.sql(), not_null)
        })
        .collect();

    let key: Vec<String> = IDENTITY_COLUMNS.iter().map(|c| quote_ident(c)).collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{},\n    PRIMARY KEY ({})\n)",
        quote_ident(table),
        columns.join(",\n"),
        key.join(", ")
    )
}

/// Create the measures table if absent (idempotent).
///
/// Safe to call before every merge; a no-op once the table exists.
pub async fn create_measures_table(pool: &PgPool, table: &str) -> Result<(), IngestError> {
    // ---
    let mut tx = pool.begin().await?;

    sqlx::query(&create_table_sql(table))
        .execute(&mut *tx)
        .await?;

    // Supports the per-sensor time-range scans of the dashboard.
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS {} ON {} ({}, {})",
        quote_ident(&format!("idx_{table}_serialno_timestamp")),
        quote_ident(table),
        quote_ident("serialno"),
        quote_ident("timestamp"),
    ))
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
