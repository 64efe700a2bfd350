//! PostgreSQL-backed measures table.
//!
//! One merge is one transaction. Rows are sent as multi-row
//! `INSERT ... ON CONFLICT DO UPDATE` statements, chunked to stay under the
//! protocol's bind-parameter limit, and committed together so concurrent
//! readers never see part of a batch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use super::{MeasurementStore, MergeResult};
use crate::error::IngestError;
use crate::models::{non_key_columns, Measurement, CANONICAL_COLUMNS, IDENTITY_COLUMNS};
use crate::schema::{self, quote_ident};

// ---

/// Rows per statement: 25 binds each keeps us well below 65535.
const ROWS_PER_STATEMENT: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgMeasurementStore {
    pool: PgPool,
    table: String,
}

impl PgMeasurementStore {
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }
}

/// `INSERT INTO "table" ("locationId", ...) ` prefix.
fn insert_prefix(table: &str) -> String {
    // ---
    let columns: Vec<String> = CANONICAL_COLUMNS
        .iter()
        .map(|(name, _)| quote_ident(name))
        .collect();
    format!(
        "INSERT INTO {} ({}) ",
        quote_ident(table),
        columns.join(", ")
    )
}

/// `ON CONFLICT ... DO UPDATE SET` suffix overwriting every non-key column.
fn conflict_clause() -> String {
    // ---
    let key: Vec<String> = IDENTITY_COLUMNS.iter().map(|c| quote_ident(c)).collect();
    let updates: Vec<String> = non_key_columns()
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();
    format!(
        " ON CONFLICT ({}) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted",
        key.join(", "),
        updates.join(", ")
    )
}

#[async_trait]
impl MeasurementStore for PgMeasurementStore {
    // ---
    fn describe(&self) -> String {
        format!("postgres table {}", self.table)
    }

    async fn ensure_table(&self) -> Result<(), IngestError> {
        schema::create_measures_table(&self.pool, &self.table).await
    }

    async fn upsert(
        &self,
        batch: &[Measurement],
        ingested_at: DateTime<Utc>,
    ) -> Result<MergeResult, IngestError> {
        // ---
        let prefix = insert_prefix(&self.table);
        let suffix = conflict_clause();
        let mut result = MergeResult::default();

        let mut tx = self.pool.begin().await?;

        for chunk in batch.chunks(ROWS_PER_STATEMENT) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);

            // Bind order must follow CANONICAL_COLUMNS.
            qb.push_values(chunk, |mut b, m| {
                let v = &m.values;
                b.push_bind(m.key.location_id)
                    .push_bind(v.location_name.clone())
                    .push_bind(v.pm01)
                    .push_bind(v.pm02)
                    .push_bind(v.pm10)
                    .push_bind(v.pm01_corrected)
                    .push_bind(v.pm02_corrected)
                    .push_bind(v.pm10_corrected)
                    .push_bind(v.pm003_count)
                    .push_bind(v.atmp)
                    .push_bind(v.rhum)
                    .push_bind(v.rco2)
                    .push_bind(v.atmp_corrected)
                    .push_bind(v.rhum_corrected)
                    .push_bind(v.rco2_corrected)
                    .push_bind(v.tvoc)
                    .push_bind(v.wifi)
                    .push_bind(m.key.timestamp)
                    .push_bind(m.key.serialno.clone())
                    .push_bind(v.model.clone())
                    .push_bind(v.firmware_version.clone())
                    .push_bind(v.tvoc_index)
                    .push_bind(v.nox_index)
                    .push_bind(v.datapoints)
                    .push_bind(ingested_at);
            });
            qb.push(&suffix);

            let rows = qb.build().fetch_all(&mut *tx).await?;
            for row in rows {
                if row.try_get::<bool, _>("inserted")? {
                    result.inserted += 1;
                } else {
                    result.updated += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(result)
    }
}
