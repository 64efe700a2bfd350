//! Upsert engine gateway.
//!
//! Exposes the [`MeasurementStore`] seam and the [`merge`] entry point. Stores
//! implement whole-row last-write-wins: a key that already exists has every
//! non-key column, `updated_at` included, replaced by the incoming row. Each
//! call to `upsert` is atomic; a failure leaves the store untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::IngestError;
use crate::models::Measurement;

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgMeasurementStore;

// ---

/// Row counts from one merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeResult {
    pub inserted: u64,
    pub updated: u64,
}

impl MergeResult {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated
    }
}

#[async_trait]
pub trait MeasurementStore: Send + Sync {
    /// Human-readable target description for logs and reports.
    fn describe(&self) -> String;

    /// Create the target table with the canonical schema if it is absent.
    async fn ensure_table(&self) -> Result<(), IngestError>;

    /// Insert-or-overwrite `batch` atomically, stamping every row with
    /// `ingested_at`. Keys in `batch` must be unique.
    async fn upsert(
        &self,
        batch: &[Measurement],
        ingested_at: DateTime<Utc>,
    ) -> Result<MergeResult, IngestError>;
}

/// Merge a resolved batch into `store`.
///
/// An empty batch is a no-op that never touches the store.
pub async fn merge(
    store: &dyn MeasurementStore,
    batch: &[Measurement],
    ingested_at: DateTime<Utc>,
) -> Result<MergeResult, IngestError> {
    // ---
    if batch.is_empty() {
        tracing::debug!("Nothing to merge into {}", store.describe());
        return Ok(MergeResult::default());
    }

    store.ensure_table().await?;
    let result = store.upsert(batch, ingested_at).await?;

    tracing::info!(
        "Merged {} records into {}: {} inserted, {} updated",
        batch.len(),
        store.describe(),
        result.inserted,
        result.updated
    );
    Ok(result)
}
