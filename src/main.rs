//! Batch enrichment entrypoint.
//!
//! `death-enrich <subjects.json>` reads a JSON array of subjects, enriches
//! them with the configured sources and prints the batch report as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use death_enrichment::archive::{ArchiveFetcher, WaybackArchive};
use death_enrichment::cache::{FileCache, ResponseCache};
use death_enrichment::metrics::Metrics;
use death_enrichment::orchestrator::ProgressEvent;
use death_enrichment::session::SessionManager;
use death_enrichment::sources::build_sources;
use death_enrichment::{config, run_batch, EnrichmentSubject, Orchestrator, RunBudget};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line arguments for death-enrich
#[derive(Parser, Debug)]
#[command(name = "death-enrich")]
#[command(about = "Enrich death records from structured, archival, press and AI sources")]
#[command(version)]
struct Args {
    /// JSON array of subjects to enrich
    subjects: PathBuf,

    /// Config file (TOML or JSON); defaults to $ENRICH_CONFIG_PATH, then config/enrichment.*
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Worker count, overriding the config file
    #[arg(short, long)]
    workers: Option<usize>,
}

/// `RUST_LOG` filter (default `enrich=info,warn`); JSON lines when
/// `ENRICH_LOG_JSON=1`.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("enrich=info,warn"));
    let json = std::env::var("ENRICH_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .init();
    }
}

fn read_subjects(path: &Path) -> Result<Vec<EnrichmentSubject>> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading subjects from {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parsing subjects in {}", path.display()))
}

async fn log_progress(mut rx: mpsc::Receiver<ProgressEvent>) {
    while let Some(ev) = rx.recv().await {
        debug!(
            target: "enrich::progress",
            subject = %ev.subject_id,
            source = %ev.source_type,
            outcome = %ev.outcome,
            attempt = ev.attempt,
            spent = ev.subject_cost,
            "attempt finished"
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = Args::parse();
    let subjects = read_subjects(&args.subjects)?;
    let mut cfg = match &args.config {
        Some(path) => config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => config::load_default()?,
    };
    if let Some(w) = args.workers {
        cfg.workers = w.max(1);
    }
    let metrics = Metrics::init(cfg.cost_limits.max_total_cost)?;

    let sessions = cfg
        .session_dir
        .as_ref()
        .map(|dir| Arc::new(SessionManager::new(dir, cfg.session_ttl())));
    if let Some(s) = &sessions {
        s.clear_expired_sessions();
    }

    let mut builder = Orchestrator::builder(cfg.clone()).sources(build_sources(&cfg, sessions));
    if let Some(dir) = &cfg.cache_dir {
        let cache: Arc<dyn ResponseCache> = Arc::new(
            FileCache::new(dir).with_context(|| format!("opening cache at {}", dir.display()))?,
        );
        builder = builder.cache(cache);
    }
    if cfg.archive_fallback {
        match WaybackArchive::new(cfg.request_timeout()) {
            Ok(a) => builder = builder.archive(Arc::new(a) as Arc<dyn ArchiveFetcher>),
            Err(e) => warn!(target: "enrich", error = %e, "archive fallback disabled"),
        }
    }
    let (progress_tx, progress_rx) = mpsc::channel(cfg.progress_buffer);
    let progress = tokio::spawn(log_progress(progress_rx));
    let orchestrator = Arc::new(builder.progress(progress_tx).build());
    info!(target: "enrich", order = ?orchestrator.query_order(), subjects = subjects.len(), "starting");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(target: "enrich", "interrupt received, finishing in-flight subjects");
                cancel.cancel();
            }
        });
    }

    let budget = Arc::new(RunBudget::new(cfg.cost_limits.max_total_cost));
    let report = run_batch(orchestrator, subjects, cfg.workers, budget, cancel).await;
    // Every sender is gone once the batch has dropped the orchestrator.
    let _ = progress.await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    debug!(target: "enrich", metrics = %metrics.render(), "final metrics");
    Ok(())
}
