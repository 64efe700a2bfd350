use std::fs;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use airquality_ingest::archive::Archive;
use airquality_ingest::source::{AirGradientClient, LookbackWindow, MeasurementSource};
use airquality_ingest::store::{InMemoryStore, MeasurementStore, MergeResult};
use airquality_ingest::{
    IdentityKey, IngestError, Measurement, Orchestrator, RawBatch, RunOutcome, Stage,
};

// ---

/// Source returning a fixed batch.
struct StaticSource(RawBatch);

#[async_trait]
impl MeasurementSource for StaticSource {
    fn describe(&self) -> String {
        "static source".into()
    }

    async fn fetch(&self, _window: LookbackWindow) -> Result<RawBatch, IngestError> {
        Ok(self.0.clone())
    }
}

/// Source that never answers in time.
struct SlowSource;

#[async_trait]
impl MeasurementSource for SlowSource {
    fn describe(&self) -> String {
        "slow source".into()
    }

    async fn fetch(&self, _window: LookbackWindow) -> Result<RawBatch, IngestError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(RawBatch::default())
    }
}

/// Store whose database is unreachable.
struct UnreachableStore;

#[async_trait]
impl MeasurementStore for UnreachableStore {
    fn describe(&self) -> String {
        "unreachable store".into()
    }

    async fn ensure_table(&self) -> Result<(), IngestError> {
        Err(IngestError::MergeFailure("connection refused".into()))
    }

    async fn upsert(
        &self,
        _batch: &[Measurement],
        _ingested_at: DateTime<Utc>,
    ) -> Result<MergeResult, IngestError> {
        Err(IngestError::MergeFailure("connection refused".into()))
    }
}

/// Store whose writes never finish in time.
struct SlowStore;

#[async_trait]
impl MeasurementStore for SlowStore {
    fn describe(&self) -> String {
        "slow store".into()
    }

    async fn ensure_table(&self) -> Result<(), IngestError> {
        Ok(())
    }

    async fn upsert(
        &self,
        _batch: &[Measurement],
        _ingested_at: DateTime<Utc>,
    ) -> Result<MergeResult, IngestError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(MergeResult::default())
    }
}

fn raw(rows: Value) -> RawBatch {
    // ---
    let rows = match rows {
        Value::Array(items) => items
            .into_iter()
            .map(|v| match v {
                Value::Object(map) => map,
                _ => panic!("not an object"),
            })
            .collect(),
        _ => panic!("not an array"),
    };
    RawBatch::from_objects(rows)
}

fn reading(minute: u32, rco2: f64) -> Value {
    json!({
        "locationId": 61234,
        "locationName": "Office",
        "serialno": "ecda3b1eaaaf",
        "timestamp": format!("2025-06-15T10:{minute:02}:00.000Z"),
        "pm02": 3.0,
        "rco2": rco2,
        "datapoints": 5
    })
}

fn key(minute: u32) -> IdentityKey {
    IdentityKey {
        location_id: 61234,
        timestamp: Utc.with_ymd_and_hms(2025, 6, 15, 10, minute, 0).unwrap(),
        serialno: "ecda3b1eaaaf".into(),
    }
}

fn window() -> LookbackWindow {
    LookbackWindow::trailing(10, Utc::now())
}

fn orchestrator(store: &Arc<InMemoryStore>) -> Orchestrator {
    Orchestrator::new(Duration::from_secs(5)).with_store(store.clone())
}

#[tokio::test]
async fn merging_same_batch_twice_is_idempotent() {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let source = StaticSource(raw(json!([reading(0, 400.0), reading(5, 405.0)])));
    let orch = orchestrator(&store);

    let first = orch.run_fetch(&source, window()).await;
    let after_first = store.rows().await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = orch.run_fetch(&source, window()).await;
    let after_second = store.rows().await;

    assert_eq!(first.merge_result(), Some(MergeResult { inserted: 2, updated: 0 }));
    assert_eq!(second.merge_result(), Some(MergeResult { inserted: 0, updated: 2 }));

    assert_eq!(after_first.len(), after_second.len());
    for (a, b) in after_first.iter().zip(after_second.iter()) {
        assert_eq!(a.measurement, b.measurement);
        assert!(b.updated_at > a.updated_at, "updated_at should advance");
    }
}

#[tokio::test]
async fn later_batch_overwrites_earlier_values() {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(&store);

    orch.run_fetch(&StaticSource(raw(json!([reading(0, 400.0)]))), window())
        .await;
    orch.run_fetch(&StaticSource(raw(json!([reading(0, 410.0)]))), window())
        .await;

    let rows = store.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].measurement.values.rco2, Some(410.0));
}

#[tokio::test]
async fn duplicate_keys_in_one_batch_resolve_to_last_record() {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(&store);
    let source = StaticSource(raw(json!([
        reading(0, 400.0),
        reading(5, 500.0),
        reading(0, 420.0)
    ])));

    let report = orch.run_fetch(&source, window()).await;

    match report.outcome {
        RunOutcome::Completed {
            received,
            accepted,
            duplicates_collapsed,
            merge,
        } => {
            assert_eq!(received, 3);
            assert_eq!(accepted, 2);
            assert_eq!(duplicates_collapsed, 1);
            assert_eq!(merge, Some(MergeResult { inserted: 2, updated: 0 }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }

    let row = store.get(&key(0)).await.expect("row for key");
    assert_eq!(row.measurement.values.rco2, Some(420.0));
    assert_eq!(store.rows().await.len(), 2);
}

#[tokio::test]
async fn unrecognized_schema_causes_no_store_mutation() {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let source = StaticSource(raw(json!([{"sensor": "x", "co2": 400}])));

    let report = orchestrator(&store).run_fetch(&source, window()).await;

    match &report.outcome {
        RunOutcome::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Normalize);
            assert!(matches!(error, IngestError::UnrecognizedSchema { .. }));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(!store.table_exists().await);
}

#[tokio::test]
async fn empty_fetch_is_a_successful_no_op() {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let report = orchestrator(&store)
        .run_fetch(&StaticSource(RawBatch::default()), window())
        .await;

    assert!(report.is_success());
    assert!(matches!(report.outcome, RunOutcome::NoOp));
    assert_eq!(report.merge_result(), None);
    assert!(!store.table_exists().await);
}

#[tokio::test]
async fn records_without_identity_are_reported_not_merged() {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let mut orphan = reading(10, 400.0);
    orphan["serialno"] = Value::Null;
    let source = StaticSource(raw(json!([reading(0, 400.0), orphan])));

    let report = orchestrator(&store).run_fetch(&source, window()).await;

    assert!(report.is_success());
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(store.rows().await.len(), 1);
}

#[tokio::test]
async fn slow_source_times_out() {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let orch = Orchestrator::new(Duration::from_millis(50)).with_store(store.clone());

    let report = orch.run_fetch(&SlowSource, window()).await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            stage: Stage::Fetch,
            error: IngestError::Timeout { .. }
        }
    ));
    assert!(!store.table_exists().await);
}

#[tokio::test]
async fn slow_store_times_out_during_merge() {
    // ---
    let orch = Orchestrator::new(Duration::from_millis(50)).with_store(Arc::new(SlowStore));

    let report = orch
        .run_fetch(&StaticSource(raw(json!([reading(0, 400.0)]))), window())
        .await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            stage: Stage::Merge,
            error: IngestError::Timeout { .. }
        }
    ));
    assert!(report.to_string().contains("Timed out after 50ms during merge"));
}

#[tokio::test]
async fn cancelled_run_does_no_io() {
    // ---
    let store = Arc::new(InMemoryStore::new());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let orch = orchestrator(&store).with_cancellation(cancel);

    let report = orch
        .run_fetch(&StaticSource(raw(json!([reading(0, 400.0)]))), window())
        .await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            error: IngestError::Cancelled { .. },
            ..
        }
    ));
    assert!(store.rows().await.is_empty());
}

#[tokio::test]
async fn archive_failure_does_not_block_merge() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-directory");
    fs::write(&blocker, "occupied").unwrap();

    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(&store).with_archive(Archive::new(&blocker));

    let report = orch
        .run_fetch(&StaticSource(raw(json!([reading(0, 400.0)]))), window())
        .await;

    assert!(matches!(report.archive, Some(Err(_))));
    assert_eq!(report.merge_result(), Some(MergeResult { inserted: 1, updated: 0 }));
}

#[tokio::test]
async fn merge_failure_does_not_block_archive() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    let orch = Orchestrator::new(Duration::from_secs(5))
        .with_store(Arc::new(UnreachableStore))
        .with_archive(Archive::new(dir.path()));

    let report = orch
        .run_fetch(&StaticSource(raw(json!([reading(0, 400.0)]))), window())
        .await;

    assert!(matches!(report.archive, Some(Ok(_))));
    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            stage: Stage::Merge,
            error: IngestError::MergeFailure(_)
        }
    ));
}

#[tokio::test]
async fn backfill_isolates_failing_files() {
    // ---
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("2025-06-01-export.csv"),
        "Location ID,Location Name,Sensor ID,UTC Date/Time,CO2 (ppm) raw,Heat Index (°C)\n\
         61234,Office,airgradient:ABC123,2025-06-01 08:00:00,415,24.1\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("2025-06-02.csv"),
        "locationId,serialno,timestamp,rco2\n\
         61234,ABC123,2025-06-01T08:00:00.000Z,418\n\
         61234,ABC123,2025-06-02T08:00:00.000Z,430\n",
    )
    .unwrap();
    fs::write(dir.path().join("2025-06-03.csv"), "device,value\nx,1\n").unwrap();
    fs::write(dir.path().join("2025-06-04.csv"), "locationId,serialno,timestamp\n").unwrap();

    let store = Arc::new(InMemoryStore::new());
    let files = Archive::new(dir.path()).list().unwrap();
    let reports = orchestrator(&store).run_files(&files).await;

    assert_eq!(reports.len(), 4);
    assert_eq!(reports[0].merge_result(), Some(MergeResult { inserted: 1, updated: 0 }));
    assert_eq!(reports[1].merge_result(), Some(MergeResult { inserted: 1, updated: 1 }));
    assert!(!reports[2].is_success());
    assert!(matches!(reports[3].outcome, RunOutcome::NoOp));

    // Legacy prefix stripped, so the current-schema file hit the same key.
    let legacy_key = IdentityKey {
        location_id: 61234,
        timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap(),
        serialno: "ABC123".into(),
    };
    let row = store.get(&legacy_key).await.expect("legacy row");
    assert_eq!(row.measurement.values.rco2, Some(418.0));
    assert_eq!(row.measurement.values.location_name, None);
    assert_eq!(store.rows().await.len(), 2);
}

#[tokio::test]
async fn fetched_archive_reingests_as_updates() {
    // ---
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/locations/61234/measures/past"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([reading(0, 400.0), reading(5, 405.0)])),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let archive = Archive::new(dir.path());
    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(&store).with_archive(archive.clone());
    let client = AirGradientClient::new(server.uri(), "token", "61234");

    let fetched = orch.run_fetch(&client, window()).await;
    assert_eq!(fetched.merge_result(), Some(MergeResult { inserted: 2, updated: 0 }));
    let archived = match &fetched.archive {
        Some(Ok(path)) => path.clone(),
        other => panic!("archive not written: {other:?}"),
    };

    let reports = Orchestrator::new(Duration::from_secs(5))
        .with_store(store.clone())
        .run_files(&[archived])
        .await;

    assert_eq!(reports[0].merge_result(), Some(MergeResult { inserted: 0, updated: 2 }));
    let row = store.get(&key(5)).await.expect("row");
    assert_eq!(row.measurement.values.rco2, Some(405.0));
    assert_eq!(row.measurement.values.datapoints, Some(5));
}

#[tokio::test]
async fn unavailable_source_is_reported() {
    // ---
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let store = Arc::new(InMemoryStore::new());
    let client = AirGradientClient::new(server.uri(), "token", "61234");
    let report = orchestrator(&store).run_fetch(&client, window()).await;

    assert!(matches!(
        report.outcome,
        RunOutcome::Failed {
            stage: Stage::Fetch,
            error: IngestError::SourceUnavailable(_)
        }
    ));
    assert!(report.to_string().contains("SourceUnavailable during fetch"));
}
