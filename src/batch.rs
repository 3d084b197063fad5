// src/batch.rs
//! Many subjects at once: N workers pull from a shared queue and share one
//! run budget. Each subject is still enriched sequentially.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cost::RunBudget;
use crate::orchestrator::{EnrichmentReport, ExitReason, Orchestrator};
use crate::types::EnrichmentSubject;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    /// In input order.
    pub reports: Vec<EnrichmentReport>,
    /// Subjects never started (cancelled or out of budget).
    pub unprocessed: Vec<String>,
    /// Subjects that failed transiently and are worth rescheduling.
    pub retry: Vec<String>,
    pub total_cost: f64,
    pub cancelled: bool,
    pub run_budget_exhausted: bool,
}

impl BatchReport {
    pub fn satisfied(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| r.stats.exit_reason == ExitReason::Satisfied)
            .count()
    }
}

type Queue = Arc<Mutex<VecDeque<(usize, EnrichmentSubject)>>>;

/// Enrich `subjects` with `workers` concurrent workers. Workers stop taking
/// new subjects once the run is cancelled or the run budget has refused a
/// reservation; subjects already in flight finish normally.
pub async fn run_batch(
    orchestrator: Arc<Orchestrator>,
    subjects: Vec<EnrichmentSubject>,
    workers: usize,
    budget: Arc<RunBudget>,
    cancel: CancellationToken,
) -> BatchReport {
    let total = subjects.len();
    let queue: Queue = Arc::new(Mutex::new(subjects.into_iter().enumerate().collect()));
    let exhausted = Arc::new(AtomicBool::new(false));
    let workers = workers.clamp(1, total.max(1));

    info!(target: "enrich", subjects = total, workers, "batch started");

    let mut set = JoinSet::new();
    for worker in 0..workers {
        let orchestrator = orchestrator.clone();
        let queue = queue.clone();
        let budget = budget.clone();
        let cancel = cancel.clone();
        let exhausted = exhausted.clone();
        set.spawn(async move {
            let mut done: Vec<(usize, EnrichmentReport)> = Vec::new();
            loop {
                if cancel.is_cancelled() || exhausted.load(Ordering::Acquire) {
                    break;
                }
                let Some((idx, subject)) = queue.lock().await.pop_front() else {
                    break;
                };
                let report = orchestrator.enrich(&subject, &budget, &cancel).await;
                if report.stats.run_budget_exhausted {
                    exhausted.store(true, Ordering::Release);
                }
                done.push((idx, report));
            }
            tracing::debug!(target: "enrich", worker, finished = done.len(), "worker idle");
            done
        });
    }

    let mut indexed: Vec<(usize, EnrichmentReport)> = Vec::with_capacity(total);
    while let Some(res) = set.join_next().await {
        match res {
            Ok(mut batch) => indexed.append(&mut batch),
            Err(e) => error!(target: "enrich", error = %e, "batch worker failed"),
        }
    }
    indexed.sort_by_key(|(idx, _)| *idx);
    let reports: Vec<EnrichmentReport> = indexed.into_iter().map(|(_, r)| r).collect();

    let unprocessed: Vec<String> = queue
        .lock()
        .await
        .drain(..)
        .map(|(_, s)| s.id)
        .collect();
    let retry = reports
        .iter()
        .filter(|r| r.stats.should_retry())
        .map(|r| r.subject_id.clone())
        .collect();
    let total_cost = reports.iter().map(|r| r.stats.total_cost).sum();
    let run_budget_exhausted = exhausted.load(Ordering::Acquire);

    info!(
        target: "enrich",
        processed = reports.len(),
        unprocessed = unprocessed.len(),
        total_cost,
        spent = budget.spent(),
        "batch finished"
    );

    BatchReport {
        reports,
        unprocessed,
        retry,
        total_cost,
        cancelled: cancel.is_cancelled(),
        run_budget_exhausted,
    }
}
