//! Ingestion orchestrator.
//!
//! Sequences one run: obtain a raw batch (API fetch or CSV file) → normalize
//! → resolve identities → merge → report. The steps run strictly in order on
//! the caller's task. The fetch and the merge are each bounded by the
//! configured timeout, and the cancellation token is checked before every
//! I/O call; an in-flight call is never interrupted.
//!
//! Every run yields a [`RunReport`], including failed ones: nothing is dropped
//! without a reported reason. Archival is a side output: its success or
//! failure is recorded on the report and never affects the merge.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::{read_csv, Archive};
use crate::config::{Config, SourceSettings, StoreSettings};
use crate::error::{IngestError, Stage};
use crate::identity::{resolve, Diagnostic};
use crate::models::RawBatch;
use crate::normalize::normalize;
use crate::source::{LookbackWindow, MeasurementSource};
use crate::store::{self, MeasurementStore, MergeResult};

// ---

/// Outputs requested for a fetch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOutputs {
    pub save_csv: bool,
    pub to_store: bool,
    /// Merge into an in-memory store instead of the database.
    pub dry_run: bool,
}

/// Configuration validated for one kind of run, before any I/O.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub source: Option<SourceSettings>,
    pub store: Option<StoreSettings>,
    pub archive_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl Preflight {
    /// Fetching needs source credentials; the database only when uploading
    /// for real.
    pub fn for_fetch(cfg: &Config, outputs: FetchOutputs) -> Result<Self, IngestError> {
        // ---
        let source = cfg.source_settings()?;
        let store = if outputs.to_store && !outputs.dry_run {
            Some(cfg.store_settings()?)
        } else {
            None
        };
        Ok(Preflight {
            source: Some(source),
            store,
            archive_dir: outputs.save_csv.then(|| PathBuf::from(&cfg.data_dir)),
            timeout: cfg.io_timeout,
        })
    }

    /// Re-ingesting files needs the database unless this is a dry run.
    pub fn for_upload(cfg: &Config, dry_run: bool) -> Result<Self, IngestError> {
        // ---
        let store = if dry_run {
            None
        } else {
            Some(cfg.store_settings()?)
        };
        Ok(Preflight {
            source: None,
            store,
            archive_dir: Some(PathBuf::from(&cfg.data_dir)),
            timeout: cfg.io_timeout,
        })
    }
}

/// Final state of one run or one file.
#[derive(Debug)]
pub enum RunOutcome {
    /// Normalized and resolved; `merge` is `None` when no store was enabled.
    Completed {
        received: usize,
        accepted: usize,
        duplicates_collapsed: usize,
        merge: Option<MergeResult>,
    },
    /// The source returned nothing.
    NoOp,
    Failed { stage: Stage, error: IngestError },
}

#[derive(Debug)]
pub struct RunReport {
    // ---
    pub run_id: Uuid,
    /// What was ingested: a source description or a file path.
    pub input: String,
    pub outcome: RunOutcome,
    pub diagnostics: Vec<Diagnostic>,
    /// Archive path written, or why archiving failed. `None` if not requested.
    pub archive: Option<Result<PathBuf, String>>,
}

impl RunReport {
    fn new(input: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            input: input.into(),
            outcome: RunOutcome::NoOp,
            diagnostics: Vec::new(),
            archive: None,
        }
    }

    fn fail(mut self, stage: Stage, error: IngestError) -> Self {
        // ---
        tracing::error!(
            "Run {} [{}] failed during {}: {}",
            self.run_id,
            self.input,
            stage,
            error
        );
        self.outcome = RunOutcome::Failed { stage, error };
        self
    }

    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, RunOutcome::Failed { .. })
    }

    pub fn merge_result(&self) -> Option<MergeResult> {
        match self.outcome {
            RunOutcome::Completed { merge, .. } => merge,
            _ => None,
        }
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        write!(f, "run {} [{}]: ", self.run_id, self.input)?;
        match &self.outcome {
            RunOutcome::NoOp => write!(f, "no data, nothing to do")?,
            RunOutcome::Failed { stage, error } => {
                write!(f, "{} during {}: {}", error.kind(), stage, error)?
            }
            RunOutcome::Completed {
                received,
                accepted,
                duplicates_collapsed,
                merge,
            } => {
                write!(
                    f,
                    "{received} received, {accepted} accepted, {duplicates_collapsed} duplicates collapsed"
                )?;
                match merge {
                    Some(m) => write!(f, ", {} inserted, {} updated", m.inserted, m.updated)?,
                    None => write!(f, ", not merged (no store enabled)")?,
                }
            }
        }
        if !self.diagnostics.is_empty() {
            write!(f, ", {} records excluded", self.diagnostics.len())?;
        }
        match &self.archive {
            Some(Ok(path)) => write!(f, "; archived to {}", path.display())?,
            Some(Err(reason)) => write!(f, "; archive failed: {reason}")?,
            None => {}
        }
        Ok(())
    }
}

/// Runs ingestions against an optional store. The archive, when set, only
/// receives batches fetched from a remote source.
pub struct Orchestrator {
    store: Option<Arc<dyn MeasurementStore>>,
    archive: Option<Archive>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            store: None,
            archive: None,
            timeout,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MeasurementStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_archive(mut self, archive: Archive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch the lookback window from `source` and merge it.
    pub async fn run_fetch(
        &self,
        source: &dyn MeasurementSource,
        window: LookbackWindow,
    ) -> RunReport {
        // ---
        let mut report = RunReport::new(source.describe());
        tracing::info!("Run {} starting: fetch from {}", report.run_id, report.input);

        if self.cancel.is_cancelled() {
            return report.fail(Stage::Fetch, IngestError::Cancelled { stage: Stage::Fetch });
        }

        let raw = match self.bounded(Stage::Fetch, source.fetch(window)).await {
            Ok(raw) => raw,
            Err(e) => return report.fail(Stage::Fetch, e),
        };

        if let (Some(archive), false) = (&self.archive, raw.is_empty()) {
            let written = archive.write(&raw, Utc::now().date_naive());
            if let Err(e) = &written {
                tracing::warn!("Error saving batch to archive: {}", e);
            }
            report.archive = Some(written.map_err(|e| e.to_string()));
        }

        self.ingest(raw, report).await
    }

    /// Re-ingest CSV files one at a time; a failing file does not stop the
    /// rest. Cancellation stops before the next file.
    pub async fn run_files(&self, paths: &[PathBuf]) -> Vec<RunReport> {
        // ---
        let mut reports = Vec::with_capacity(paths.len());

        for path in paths {
            let report = RunReport::new(path.display().to_string());
            tracing::info!("Processing file: {}", path.display());

            if self.cancel.is_cancelled() {
                reports.push(report.fail(Stage::Read, IngestError::Cancelled { stage: Stage::Read }));
                break;
            }

            let report = match read_csv(path) {
                Ok(raw) => self.ingest(raw, report).await,
                Err(e) => report.fail(Stage::Read, e),
            };
            tracing::info!("{}", report);
            reports.push(report);
        }

        reports
    }

    async fn ingest(&self, raw: RawBatch, mut report: RunReport) -> RunReport {
        // ---
        if raw.is_empty() {
            tracing::info!("No data returned from {}", report.input);
            report.outcome = RunOutcome::NoOp;
            return report;
        }
        let received = raw.len();

        let batch = match normalize(&raw) {
            Ok(batch) => batch,
            Err(e) => return report.fail(Stage::Normalize, e),
        };

        let resolution = resolve(batch);
        report.diagnostics = resolution.diagnostics;
        let accepted = resolution.measurements.len();

        let merge = match &self.store {
            None => None,
            Some(store) => {
                if self.cancel.is_cancelled() {
                    return report.fail(Stage::Merge, IngestError::Cancelled { stage: Stage::Merge });
                }
                let ingested_at = Utc::now();
                let merged = self
                    .bounded(
                        Stage::Merge,
                        store::merge(store.as_ref(), &resolution.measurements, ingested_at),
                    )
                    .await;
                match merged {
                    Ok(result) => Some(result),
                    Err(e) => return report.fail(Stage::Merge, e),
                }
            }
        };

        report.outcome = RunOutcome::Completed {
            received,
            accepted,
            duplicates_collapsed: resolution.duplicates_collapsed,
            merge,
        };
        report
    }

    async fn bounded<T, F>(&self, stage: Stage, fut: F) -> Result<T, IngestError>
    where
        F: Future<Output = Result<T, IngestError>>,
    {
        // ---
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::Timeout {
                stage,
                timeout: self.timeout,
            }),
        }
    }
}
