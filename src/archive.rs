//! Flat-file archive of fetched batches.
//!
//! Each fetch can be written to `<dir>/<YYYY-MM-DD>.csv`, named by ingestion
//! date; a same-day re-run overwrites that day's file. The read-back side
//! lists a directory for `*.csv` files (our own archives or legacy dashboard
//! exports) and loads each as a [`RawBatch`] for re-ingestion.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use serde_json::{Map, Value};

use crate::error::IngestError;
use crate::models::RawBatch;

// ---

#[derive(Debug, Clone)]
pub struct Archive {
    dir: PathBuf,
}

impl Archive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.csv", date.format("%Y-%m-%d")))
    }

    /// Write `batch` as the archive file for `date`, creating the directory.
    pub fn write(&self, batch: &RawBatch, date: NaiveDate) -> Result<PathBuf, IngestError> {
        // ---
        fs::create_dir_all(&self.dir).map_err(|e| {
            IngestError::Archive(format!("creating {}: {}", self.dir.display(), e))
        })?;

        let path = self.path_for(date);
        let mut writer = WriterBuilder::new().from_path(&path)?;

        writer.write_record(&batch.columns)?;
        for row in &batch.rows {
            writer.write_record(batch.columns.iter().map(|c| cell_text(row.get(c))))?;
        }
        writer
            .flush()
            .map_err(|e| IngestError::Archive(format!("flushing {}: {}", path.display(), e)))?;

        tracing::info!("Archived {} records to {}", batch.len(), path.display());
        Ok(path)
    }

    /// All `*.csv` files in the archive directory, sorted by name.
    ///
    /// A missing directory yields an empty list.
    pub fn list(&self) -> Result<Vec<PathBuf>, IngestError> {
        // ---
        if !self.dir.is_dir() {
            tracing::warn!("Data directory not found: {}", self.dir.display());
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| {
            IngestError::Archive(format!("listing {}: {}", self.dir.display(), e))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| IngestError::Archive(format!("listing {}: {}", self.dir.display(), e)))?
                .path();
            let is_csv = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
            if is_csv && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// Load a CSV file into a raw batch. Empty cells become nulls.
pub fn read_csv(path: &Path) -> Result<RawBatch, IngestError> {
    // ---
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;

    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, h)| {
            // Spreadsheet exports often start with a byte-order mark.
            let h = if i == 0 { h.trim_start_matches('\u{feff}') } else { h };
            h.trim().to_string()
        })
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Map<String, Value> = columns
            .iter()
            .zip(record.iter())
            .map(|(name, cell)| {
                let value = if cell.is_empty() {
                    Value::Null
                } else {
                    Value::String(cell.to_string())
                };
                (name.clone(), value)
            })
            .collect();
        rows.push(row);
    }

    tracing::debug!("Read {} rows from {}", rows.len(), path.display());
    Ok(RawBatch { columns, rows })
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}
