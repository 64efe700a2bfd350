//! Command-line entry point for `airquality-ingest`.
//!
//! This binary wires configuration, logging and the concrete collaborators
//! (HTTP client, Postgres pool, archive directory) into the ingestion
//! orchestrator:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Validating the configuration required by the chosen command
//! - Running one fetch, or re-ingesting every archived CSV file
//! - Printing one report line per run and exiting non-zero on any failure
//!
//! # Environment Variables
//! See [`airquality_ingest::config::load_from_env`] for ingestion settings, plus:
//! - `INGEST_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `INGEST_SPAN_EVENTS` (optional) – span event mode for tracing
use std::{env, io::IsTerminal, path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use airquality_ingest::archive::Archive;
use airquality_ingest::config::{self, StoreSettings};
use airquality_ingest::pipeline::{FetchOutputs, Orchestrator, Preflight, RunReport};
use airquality_ingest::source::{AirGradientClient, LookbackWindow};
use airquality_ingest::store::{InMemoryStore, MeasurementStore, PgMeasurementStore};
use airquality_ingest::IngestError;

#[derive(Debug, Parser)]
#[command(name = "airquality-ingest")]
#[command(about = "Fetch AirGradient measurements and merge them into PostgreSQL")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the lookback window from the AirGradient API.
    Fetch {
        /// Save the downloaded data to a CSV file in DATA_DIR.
        #[arg(long)]
        save_csv: bool,

        /// Upload the downloaded data to the measures table.
        #[arg(long)]
        to_store: bool,

        /// Merge into an in-memory store instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-ingest every CSV file in the data directory.
    Upload {
        /// Directory to scan instead of DATA_DIR.
        #[arg(long)]
        dir: Option<String>,

        /// Merge into an in-memory store instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Check that the AirGradient API accepts the configured token.
    CheckToken,
}

// ---

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ---
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let cfg = config::load_from_env()?;
    cfg.log_config();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping before the next I/O call");
                cancel.cancel();
            }
        });
    }

    let reports = match cli.command {
        Commands::Fetch {
            save_csv,
            to_store,
            dry_run,
        } => {
            let outputs = FetchOutputs {
                save_csv,
                to_store,
                dry_run,
            };
            let preflight = Preflight::for_fetch(&cfg, outputs)?;
            let source = preflight
                .source
                .as_ref()
                .ok_or_else(|| IngestError::Configuration("source settings missing".into()))?;

            tracing::info!("Using Location ID: {}", source.location_id);
            tracing::info!("Using Token: {}", config::mask_token(&source.token));

            let client = AirGradientClient::new(&source.api_url, &source.token, &source.location_id);
            let mut orchestrator = Orchestrator::new(preflight.timeout).with_cancellation(cancel);
            if let Some(store) = open_store(preflight.store.as_ref(), to_store && dry_run)? {
                orchestrator = orchestrator.with_store(store);
            }
            if let Some(dir) = &preflight.archive_dir {
                orchestrator = orchestrator.with_archive(Archive::new(dir));
            }

            let window = LookbackWindow::trailing(source.lookback_days, Utc::now());
            vec![orchestrator.run_fetch(&client, window).await]
        }
        Commands::Upload { dir, dry_run } => {
            let preflight = Preflight::for_upload(&cfg, dry_run)?;
            let dir = dir
                .map(PathBuf::from)
                .or_else(|| preflight.archive_dir.clone())
                .unwrap_or_else(|| PathBuf::from(&cfg.data_dir));

            let mut orchestrator = Orchestrator::new(preflight.timeout).with_cancellation(cancel);
            if let Some(store) = open_store(preflight.store.as_ref(), dry_run)? {
                orchestrator = orchestrator.with_store(store);
            }

            let files = Archive::new(dir).list()?;
            if files.is_empty() {
                tracing::info!("No CSV files found to upload.");
            }
            orchestrator.run_files(&files).await
        }
        Commands::CheckToken => {
            let source = cfg.source_settings()?;
            let client = AirGradientClient::new(&source.api_url, &source.token, &source.location_id);
            return if client.check_token().await? {
                println!("Token is valid.");
                Ok(ExitCode::SUCCESS)
            } else {
                println!("Token is invalid or the API rejected the request.");
                Ok(ExitCode::FAILURE)
            };
        }
    };

    Ok(summarize(&reports))
}

/// Build the merge target: Postgres when configured, in-memory for dry runs.
///
/// The pool connects lazily so an unreachable database surfaces as a merge
/// failure in the run report rather than a startup crash.
fn open_store(
    settings: Option<&StoreSettings>,
    dry_run: bool,
) -> Result<Option<Arc<dyn MeasurementStore>>> {
    // ---
    if let Some(settings) = settings {
        tracing::info!(
            "Using database: {}",
            config::mask_db_url(&settings.db_url)
        );
        let pool = PgPoolOptions::new()
            .max_connections(settings.db_pool_max)
            .connect_lazy(&settings.db_url)
            .map_err(|e| IngestError::Configuration(format!("Invalid DATABASE_URL: {e}")))?;
        let store: Arc<dyn MeasurementStore> =
            Arc::new(PgMeasurementStore::new(pool, settings.table_name.clone()));
        return Ok(Some(store));
    }
    if dry_run {
        tracing::info!("Dry run: merging into an in-memory store");
        let store: Arc<dyn MeasurementStore> = Arc::new(InMemoryStore::new());
        return Ok(Some(store));
    }
    Ok(None)
}

fn summarize(reports: &[RunReport]) -> ExitCode {
    // ---
    let mut failed = 0;
    for report in reports {
        println!("{report}");
        for diagnostic in &report.diagnostics {
            println!("  {diagnostic}");
        }
        if !report.is_success() {
            failed += 1;
        }
    }
    if failed > 0 {
        tracing::error!("{} of {} runs failed", failed, reports.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `INGEST_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by the `INGEST_LOG_LEVEL` env var
///
/// Logs go to stderr so stdout carries only the run reports.
fn init_tracing() {
    // ---
    let span_events = match env::var("INGEST_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stderr().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to INGEST_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("INGEST_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
