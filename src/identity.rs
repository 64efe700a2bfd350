//! Identity resolution: turns a normalized batch into mergeable
//! measurements keyed by (`locationId`, `timestamp`, `serialno`).
//!
//! Records missing any key attribute are excluded with a
//! [`Diagnostic::MissingIdentity`]. Records sharing a key collapse to one:
//! the last record in batch order wins, keeping the position of the first
//! occurrence. This mirrors the last-write-wins rule applied at merge time
//! and guarantees a batch never touches the same key twice in one upsert.

use std::collections::HashMap;
use std::fmt;

use crate::models::{IdentityKey, Measurement};
use crate::normalize::RecordBatch;

// ---

/// A per-record problem that excluded the record but not the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    MissingIdentity { row: usize, fields: Vec<&'static str> },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::MissingIdentity { row, fields } => {
                write!(f, "MissingIdentity: row {} lacks {}", row, fields.join(", "))
            }
        }
    }
}

/// Result of resolving one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Resolution {
    // ---
    pub measurements: Vec<Measurement>,
    pub diagnostics: Vec<Diagnostic>,
    /// Number of records replaced by a later record with the same key.
    pub duplicates_collapsed: usize,
}

pub fn resolve(batch: RecordBatch) -> Resolution {
    // ---
    let mut resolution = Resolution::default();
    let mut positions: HashMap<IdentityKey, usize> = HashMap::new();

    for (row, record) in batch.records.into_iter().enumerate() {
        let (location_id, timestamp, serialno) =
            match (record.location_id, record.timestamp, record.serialno) {
                (Some(l), Some(t), Some(s)) => (l, t, s),
                (l, t, s) => {
                    let mut fields = Vec::new();
                    if l.is_none() {
                        fields.push("locationId");
                    }
                    if t.is_none() {
                        fields.push("timestamp");
                    }
                    if s.is_none() {
                        fields.push("serialno");
                    }
                    tracing::warn!("Excluding row {}: missing {}", row, fields.join(", "));
                    resolution
                        .diagnostics
                        .push(Diagnostic::MissingIdentity { row, fields });
                    continue;
                }
            };

        let key = IdentityKey {
            location_id,
            timestamp,
            serialno,
        };
        let measurement = Measurement {
            key: key.clone(),
            values: record.values,
        };

        match positions.get(&key) {
            Some(&idx) => {
                tracing::debug!("Row {} supersedes earlier record for {:?}", row, key);
                resolution.measurements[idx] = measurement;
                resolution.duplicates_collapsed += 1;
            }
            None => {
                positions.insert(key, resolution.measurements.len());
                resolution.measurements.push(measurement);
            }
        }
    }

    resolution
}
