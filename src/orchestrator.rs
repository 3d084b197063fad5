// src/orchestrator.rs
//! Per-subject enrichment loop.
//!
//! Sources are tried one at a time, cheapest first (ties: most trusted first).
//! Each success is merged into the running answer; the loop stops as soon as
//! the answer is good enough, a spend ceiling is hit, or the run is cancelled.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use metrics::{gauge, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::archive::ArchiveFetcher;
use crate::cache::ResponseCache;
use crate::config::EnrichmentConfig;
use crate::cost::{RunBudget, SpendGate, SubjectLedger};
use crate::metrics::{self as m, ensure_metrics_described};
use crate::reliability::{answers_agree, MergedFields};
use crate::source::{ManagedSource, Source};
use crate::types::{
    DeathFields, EnrichmentSubject, FailureKind, LookupOutcome, ReliabilityTier, SourceEntry,
};

/// Why the loop for one subject ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Early-stop condition met.
    Satisfied,
    /// Every candidate source was tried.
    Completed,
    CostLimit,
    Cancelled,
    /// The subject already had every target field.
    NotNeeded,
}

/// Compact record of one attempt, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceAttempt {
    pub source_type: String,
    pub tier: ReliabilityTier,
    /// `"success"` or a `FailureKind` label.
    pub outcome: String,
    pub confidence: f64,
    pub cost: f64,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub via_archive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SourceAttempt {
    fn from_outcome(outcome: &LookupOutcome) -> Self {
        let entry = outcome.entry();
        let (label, message) = match outcome {
            LookupOutcome::Success { .. } => ("success", None),
            LookupOutcome::Failure { kind, message, .. } => (kind.as_str(), Some(message.clone())),
        };
        Self {
            source_type: entry.source_type.clone(),
            tier: entry.tier,
            outcome: label.to_string(),
            confidence: entry.confidence,
            cost: entry.cost,
            from_cache: entry.from_cache,
            via_archive: entry.via_archive,
            message,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub attempted: usize,
    pub succeeded: usize,
    pub no_data: usize,
    /// Transient and availability failures.
    pub errors: usize,
    /// The transient share of `errors`; only these are worth a retry.
    #[serde(default)]
    pub transient: usize,
    /// Blocked and not recovered through the archive.
    pub blocked: usize,
    pub archive_recovered: usize,
    pub cache_hits: usize,
    pub precondition_failed: usize,
    pub total_cost: f64,
    pub elapsed_ms: u64,
    pub exit_reason: ExitReason,
    #[serde(default)]
    pub run_budget_exhausted: bool,
    #[serde(default)]
    pub attempts: Vec<SourceAttempt>,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            attempted: 0,
            succeeded: 0,
            no_data: 0,
            errors: 0,
            transient: 0,
            blocked: 0,
            archive_recovered: 0,
            cache_hits: 0,
            precondition_failed: 0,
            total_cost: 0.0,
            elapsed_ms: 0,
            exit_reason: ExitReason::Completed,
            run_budget_exhausted: false,
            attempts: Vec::new(),
        }
    }
}

impl RunStats {
    /// The subject failed for transient reasons and is worth another try
    /// later; no-data, blocked and unavailable outcomes are not.
    pub fn should_retry(&self) -> bool {
        self.succeeded == 0 && self.transient > 0 && self.exit_reason != ExitReason::Cancelled
    }

    fn record(&mut self, outcome: &LookupOutcome) {
        let entry = outcome.entry();
        if entry.from_cache {
            self.cache_hits += 1;
        }
        self.total_cost += entry.cost;
        match outcome.failure_kind() {
            None => self.succeeded += 1,
            Some(FailureKind::NoDataFound) => self.no_data += 1,
            Some(FailureKind::Transient) => {
                self.errors += 1;
                self.transient += 1;
            }
            Some(FailureKind::Unavailable) => self.errors += 1,
            Some(FailureKind::AccessBlocked) => self.blocked += 1,
            Some(FailureKind::PreconditionFailed) => self.precondition_failed += 1,
            Some(FailureKind::CostLimitExceeded) | Some(FailureKind::Cancelled) => {}
        }
        self.attempts.push(SourceAttempt::from_outcome(outcome));
    }
}

/// Final result for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentReport {
    pub subject_id: String,
    pub merged: MergedFields,
    /// One entry per successful answer, in query order.
    pub provenance: Vec<SourceEntry>,
    pub stats: RunStats,
}

impl EnrichmentReport {
    pub fn fields(&self) -> DeathFields {
        self.merged.to_fields()
    }
}

/// Sent after every attempt when a progress channel is attached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub subject_id: String,
    pub source_type: String,
    pub outcome: String,
    pub attempt: usize,
    pub subject_cost: f64,
}

/// Mutable state for one subject while its candidates are tried.
struct SubjectRun {
    merged: MergedFields,
    provenance: Vec<SourceEntry>,
    stats: RunStats,
    ledger: SubjectLedger,
    /// Cause answered by each successful source, for corroboration.
    causes: Vec<(ReliabilityTier, String)>,
}

impl SubjectRun {
    fn new(subject: &EnrichmentSubject, max_cost: f64) -> Self {
        Self {
            merged: MergedFields::from_known(&subject.known),
            provenance: Vec::new(),
            stats: RunStats::default(),
            ledger: SubjectLedger::new(max_cost),
            causes: Vec::new(),
        }
    }
}

pub struct OrchestratorBuilder {
    config: EnrichmentConfig,
    sources: Vec<Arc<dyn Source>>,
    cache: Option<Arc<dyn ResponseCache>>,
    archive: Option<Arc<dyn ArchiveFetcher>>,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl OrchestratorBuilder {
    pub fn source(mut self, source: Arc<dyn Source>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn sources(mut self, sources: impl IntoIterator<Item = Arc<dyn Source>>) -> Self {
        self.sources.extend(sources);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn archive(mut self, archive: Arc<dyn ArchiveFetcher>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn progress(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Filter by enabled category and availability (checked once, here), then
    /// order cheapest first with the more trusted tier first on equal cost.
    pub fn build(self) -> Orchestrator {
        ensure_metrics_described();
        let timeout = self.config.request_timeout();
        let mut candidates: Vec<ManagedSource> = Vec::new();
        for src in self.sources {
            let desc = src.descriptor();
            if !self.config.source_categories.is_enabled(desc.category) {
                debug!(target: "enrich", source = %desc.source_type, "category disabled");
                continue;
            }
            if !src.is_available() {
                info!(target: "enrich", source = %desc.source_type, "source unavailable for this run");
                continue;
            }
            candidates.push(ManagedSource::new(src, self.cache.clone(), timeout));
        }
        candidates.sort_by(|a, b| {
            let (da, db) = (a.descriptor(), b.descriptor());
            da.cost_per_query
                .total_cmp(&db.cost_per_query)
                .then_with(|| db.tier.cmp(&da.tier))
        });
        Orchestrator {
            config: self.config,
            candidates,
            archive: self.archive,
            progress: self.progress,
        }
    }
}

pub struct Orchestrator {
    config: EnrichmentConfig,
    candidates: Vec<ManagedSource>,
    archive: Option<Arc<dyn ArchiveFetcher>>,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl Orchestrator {
    pub fn builder(config: EnrichmentConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            sources: Vec::new(),
            cache: None,
            archive: None,
            progress: None,
        }
    }

    pub fn config(&self) -> &EnrichmentConfig {
        &self.config
    }

    /// Source types in the order they will be queried.
    pub fn query_order(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.source_type()).collect()
    }

    fn emit(&self, subject: &EnrichmentSubject, attempt: usize, outcome: &LookupOutcome, spent: f64) {
        let Some(tx) = &self.progress else {
            return;
        };
        let ev = ProgressEvent {
            subject_id: subject.id.clone(),
            source_type: outcome.entry().source_type.clone(),
            outcome: outcome
                .failure_kind()
                .map_or("success", |k| k.as_str())
                .to_string(),
            attempt,
            subject_cost: spent,
        };
        // Full or closed channel: drop the event, never block the run.
        let _ = tx.try_send(ev);
    }

    /// An authoritative answer above the confidence threshold.
    fn confident_enough(&self, entry: &SourceEntry) -> bool {
        entry.tier.is_authoritative() && entry.confidence > self.config.confidence_threshold
    }

    /// Distinct trusted tiers whose cause agrees with the merged cause.
    fn corroborating_tiers(&self, merged: &MergedFields, causes: &[(ReliabilityTier, String)]) -> usize {
        let Some(best) = merged.cause.as_ref() else {
            return 0;
        };
        let weights = &self.config.tier_weights;
        causes
            .iter()
            .filter(|(tier, _)| weights.weight_for(*tier) >= self.config.reliability_threshold)
            .filter(|(_, cause)| answers_agree(cause, &best.value))
            .map(|(tier, _)| *tier)
            .collect::<HashSet<_>>()
            .len()
    }

    pub async fn enrich(
        &self,
        subject: &EnrichmentSubject,
        budget: &RunBudget,
        cancel: &CancellationToken,
    ) -> EnrichmentReport {
        let started = Instant::now();
        let mut run = SubjectRun::new(subject, self.config.cost_limits.max_cost_per_subject);

        run.stats.exit_reason = if subject.needs_enrichment() {
            self.run_candidates(subject, budget, cancel, &mut run).await
        } else {
            ExitReason::NotNeeded
        };

        let SubjectRun {
            merged,
            provenance,
            mut stats,
            ..
        } = run;
        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        histogram!(m::SUBJECT_MS).record(stats.elapsed_ms as f64);
        gauge!(m::RUN_SPENT_USD).set(budget.spent());
        info!(
            target: "enrich",
            subject = %subject.id,
            exit = ?stats.exit_reason,
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            cost = stats.total_cost,
            "subject done"
        );
        EnrichmentReport {
            subject_id: subject.id.clone(),
            merged,
            provenance,
            stats,
        }
    }

    async fn run_candidates(
        &self,
        subject: &EnrichmentSubject,
        budget: &RunBudget,
        cancel: &CancellationToken,
        run: &mut SubjectRun,
    ) -> ExitReason {
        for (order, src) in self.candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                return ExitReason::Cancelled;
            }
            let estimate = src.descriptor().cost_per_query;
            let outcome = src
                .lookup(
                    subject,
                    &SpendGate::new(&run.ledger, budget),
                    cancel,
                    self.config.ignore_cache,
                )
                .await;
            match outcome.failure_kind() {
                Some(FailureKind::Cancelled) => return ExitReason::Cancelled,
                Some(FailureKind::CostLimitExceeded) => {
                    if run.ledger.fits(estimate) {
                        run.stats.run_budget_exhausted = true;
                        info!(target: "enrich", subject = %subject.id, spent = budget.spent(), "run budget exhausted");
                    } else {
                        debug!(target: "enrich", subject = %subject.id, source = src.source_type(), "subject ceiling reached");
                    }
                    return ExitReason::CostLimit;
                }
                _ => {}
            }
            run.stats.attempted += 1;

            let outcome = match self.try_archive(src, subject, &outcome, cancel).await {
                Some(recovered) => {
                    run.stats.attempts.push(SourceAttempt::from_outcome(&outcome));
                    run.stats.archive_recovered += 1;
                    recovered
                }
                None => outcome,
            };
            run.ledger.record(outcome.entry().cost);
            run.stats.record(&outcome);
            self.emit(subject, order, &outcome, run.ledger.spent());

            if let LookupOutcome::Success { payload, entry } = outcome {
                run.merged.merge(&payload, &entry, order);
                if let Some(cause) = payload.fields.cause.as_deref().filter(|c| !c.trim().is_empty()) {
                    run.causes.push((entry.tier, cause.to_string()));
                }
                let confident = self.confident_enough(&entry);
                run.provenance.push(entry);
                if confident
                    || self.corroborating_tiers(&run.merged, &run.causes)
                        >= self.config.early_stop_source_count
                {
                    return ExitReason::Satisfied;
                }
            }
        }
        ExitReason::Completed
    }

    /// One archive attempt for a blocked page. Returns the recovered outcome
    /// only on success; a failed archive leaves the original block in place.
    async fn try_archive(
        &self,
        src: &ManagedSource,
        subject: &EnrichmentSubject,
        outcome: &LookupOutcome,
        cancel: &CancellationToken,
    ) -> Option<LookupOutcome> {
        if !self.config.archive_fallback {
            return None;
        }
        let archive = self.archive.as_ref()?;
        let LookupOutcome::Failure {
            kind: FailureKind::AccessBlocked,
            blocked: Some(blocked),
            ..
        } = outcome
        else {
            return None;
        };
        let url = blocked.url.as_deref()?;
        let recovered = src
            .lookup_archived(
                subject,
                url,
                archive.as_ref(),
                cancel,
                self.config.archive_confidence_discount,
            )
            .await;
        recovered.is_success().then_some(recovered)
    }
}
