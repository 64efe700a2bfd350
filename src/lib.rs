//! Idempotent ingestion of AirGradient air-quality telemetry.
//!
//! Raw batches from the public API or from CSV files are normalized onto one
//! canonical schema, keyed by (`locationId`, `timestamp`, `serialno`), and
//! merged into a measures table with whole-row last-write-wins semantics.
//! Re-fetching an overlapping window or re-uploading a file never creates a
//! duplicate row.
//!
//! Module layout follows the Explicit Module Boundary Pattern (EMBP): each
//! module owns one stage and `pipeline` is the only place that wires them.

pub mod archive;
pub mod config;
pub mod error;
pub mod identity;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod schema;
pub mod source;
pub mod store;

pub use config::Config;
pub use error::{IngestError, Stage};
pub use models::{IdentityKey, Measurement, MeasurementValues, RawBatch};
pub use pipeline::{Orchestrator, RunOutcome, RunReport};
