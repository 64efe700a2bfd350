//! In-process store with the same merge semantics as the Postgres store.
//!
//! Backs `--dry-run` and the pipeline tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{MeasurementStore, MergeResult};
use crate::error::IngestError;
use crate::models::{IdentityKey, Measurement, StoredMeasurement};

// ---

#[derive(Debug, Default)]
pub struct InMemoryStore {
    rows: Mutex<Option<BTreeMap<IdentityKey, StoredMeasurement>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `ensure_table` has run.
    pub async fn table_exists(&self) -> bool {
        self.rows.lock().await.is_some()
    }

    /// Snapshot of all rows in key order.
    pub async fn rows(&self) -> Vec<StoredMeasurement> {
        // ---
        self.rows
            .lock()
            .await
            .as_ref()
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, key: &IdentityKey) -> Option<StoredMeasurement> {
        self.rows
            .lock()
            .await
            .as_ref()
            .and_then(|rows| rows.get(key).cloned())
    }
}

#[async_trait]
impl MeasurementStore for InMemoryStore {
    // ---
    fn describe(&self) -> String {
        "in-memory store".to_string()
    }

    async fn ensure_table(&self) -> Result<(), IngestError> {
        self.rows.lock().await.get_or_insert_with(BTreeMap::new);
        Ok(())
    }

    async fn upsert(
        &self,
        batch: &[Measurement],
        ingested_at: DateTime<Utc>,
    ) -> Result<MergeResult, IngestError> {
        // ---
        let mut guard = self.rows.lock().await;
        let rows = guard
            .as_mut()
            .ok_or_else(|| IngestError::MergeFailure("table does not exist".to_string()))?;

        let mut result = MergeResult::default();
        for measurement in batch {
            let row = StoredMeasurement {
                measurement: measurement.clone(),
                updated_at: ingested_at,
            };
            match rows.insert(measurement.key.clone(), row) {
                Some(_) => result.updated += 1,
                None => result.inserted += 1,
            }
        }
        Ok(result)
    }
}
