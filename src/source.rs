// src/source.rs
//! Source contract and the shared wrapper every source runs behind.
//!
//! A `Source` only knows how to look a subject up. `ManagedSource` adds the
//! behavior common to all of them, in this order:
//! preconditions → cache → spend reservation → rate-limit wait → timed fetch
//! → classification → confidence clamp → cache write.
//! Cache hits skip the reservation and the delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::{counter, gauge};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::ArchiveFetcher;
use crate::cache::{cache_key, CacheEntry, ResponseCache};
use crate::cost::{Reservation, SpendGate};
use crate::error::{LookupError, LookupResult};
use crate::metrics as m;
use crate::types::{
    EnrichmentPayload, EnrichmentSubject, LookupOutcome, ReliabilityTier, SourceDescriptor,
    SourceEntry,
};

/// Highest confidence a non-exact answer can carry.
const NON_EXACT_CEILING: f64 = 0.99;

/// What a source hands back for one subject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceAnswer {
    pub payload: EnrichmentPayload,
    pub raw_response: String,
    /// The source matched the subject unambiguously (e.g. by death date).
    pub exact_match: bool,
    /// Actual spend if the source knows it (token usage); otherwise the
    /// descriptor estimate is charged.
    pub cost: Option<f64>,
}

impl SourceAnswer {
    pub fn new(payload: EnrichmentPayload, raw_response: impl Into<String>) -> Self {
        Self {
            payload,
            raw_response: raw_response.into(),
            exact_match: false,
            cost: None,
        }
    }

    pub fn exact(mut self, exact: bool) -> Self {
        self.exact_match = exact;
        self
    }

    pub fn with_cost(mut self, usd: f64) -> Self {
        self.cost = Some(usd);
        self
    }
}

/// Per-call settings a source may use for its own HTTP client.
#[derive(Debug, Clone)]
pub struct FetchContext {
    pub timeout: Duration,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait Source: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    /// Credentials/configuration present. Checked once per run.
    fn is_available(&self) -> bool {
        true
    }

    /// Cheap check on the subject before anything is spent.
    fn check_preconditions(&self, _subject: &EnrichmentSubject) -> LookupResult<()> {
        Ok(())
    }

    /// Source-specific part of the cache key.
    fn query_text(&self, subject: &EnrichmentSubject) -> String {
        subject.name.clone()
    }

    async fn fetch(
        &self,
        subject: &EnrichmentSubject,
        ctx: &FetchContext,
    ) -> LookupResult<SourceAnswer>;

    /// Extract an answer from a page body obtained elsewhere (archive snapshot).
    fn extract_from_page(
        &self,
        _subject: &EnrichmentSubject,
        url: &str,
        _body: &str,
    ) -> LookupResult<SourceAnswer> {
        Err(LookupError::no_data(format!("no page extraction for {url}")))
    }

    /// Heuristic confidence in `[0, 1]`; the wrapper clamps it further.
    fn confidence(&self, subject: &EnrichmentSubject, answer: &SourceAnswer) -> f64;
}

/// Clamp a reported confidence to what the source may claim.
pub fn clamp_confidence(desc: &SourceDescriptor, raw: f64, exact: bool) -> f64 {
    let raw = if raw.is_finite() { raw } else { 0.0 };
    if exact && desc.tier == ReliabilityTier::StructuredData {
        return raw.clamp(0.0, 1.0);
    }
    raw.clamp(0.0, desc.max_confidence.min(NON_EXACT_CEILING))
}

pub struct ManagedSource {
    source: Arc<dyn Source>,
    descriptor: SourceDescriptor,
    cache: Option<Arc<dyn ResponseCache>>,
    timeout: Duration,
    /// When this source was last called live. Held across the wait so
    /// concurrent callers queue in order.
    last_call: Mutex<Option<Instant>>,
}

impl ManagedSource {
    pub fn new(
        source: Arc<dyn Source>,
        cache: Option<Arc<dyn ResponseCache>>,
        timeout: Duration,
    ) -> Self {
        let descriptor = source.descriptor().clone();
        Self {
            source,
            descriptor,
            cache,
            timeout,
            last_call: Mutex::new(None),
        }
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn source_type(&self) -> &str {
        &self.descriptor.source_type
    }

    pub fn is_available(&self) -> bool {
        self.source.is_available()
    }

    fn entry(&self, confidence: f64, cost: f64, source_url: Option<String>, raw: String) -> SourceEntry {
        SourceEntry {
            source_type: self.descriptor.source_type.clone(),
            source_name: self.descriptor.name.clone(),
            retrieved_at: Utc::now(),
            confidence,
            tier: self.descriptor.tier,
            cost,
            from_cache: false,
            via_archive: false,
            source_url,
            raw_response: raw,
        }
    }

    fn failure(&self, err: LookupError, entry: SourceEntry) -> LookupOutcome {
        let kind = err.kind();
        let source = self.source_type();
        match &err {
            LookupError::NoDataFound(_) | LookupError::PreconditionFailed(_) => {
                debug!(target: "enrich::source", source, kind = kind.as_str(), error = %err, "no answer")
            }
            LookupError::CostLimitExceeded { .. } | LookupError::Cancelled => {
                info!(target: "enrich::source", source, kind = kind.as_str(), "attempt skipped")
            }
            _ => warn!(target: "enrich::source", source, kind = kind.as_str(), error = %err, "attempt failed"),
        }
        counter!(m::SOURCE_OUTCOMES_TOTAL, "source" => source.to_string(), "outcome" => kind.as_str())
            .increment(1);
        LookupOutcome::Failure {
            kind,
            message: err.to_string(),
            blocked: err.blocked_access(),
            entry,
        }
    }

    fn success(&self, payload: EnrichmentPayload, entry: SourceEntry) -> LookupOutcome {
        counter!(m::SOURCE_OUTCOMES_TOTAL, "source" => self.source_type().to_string(), "outcome" => "success")
            .increment(1);
        LookupOutcome::Success { payload, entry }
    }

    fn from_cache(&self, hit: CacheEntry) -> LookupOutcome {
        counter!(m::CACHE_HITS_TOTAL, "source" => self.source_type().to_string()).increment(1);
        debug!(target: "enrich::cache", source = self.source_type(), key = %hit.key, "cache hit");
        let mut entry = self.entry(hit.confidence, 0.0, None, hit.raw_response);
        entry.retrieved_at = hit.created_at;
        entry.from_cache = true;
        match hit.payload {
            Some(payload) => {
                entry.source_url = payload.source_url.clone();
                self.success(payload, entry)
            }
            None => self.failure(LookupError::no_data("cached: no data"), entry),
        }
    }

    fn store(&self, key: &str, subject: &EnrichmentSubject, entry: &SourceEntry, payload: Option<&EnrichmentPayload>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let record = CacheEntry {
            key: key.to_string(),
            source_type: entry.source_type.clone(),
            subject_id: subject.id.clone(),
            created_at: entry.retrieved_at,
            payload: payload.cloned(),
            raw_response: entry.raw_response.clone(),
            confidence: entry.confidence,
            tier: entry.tier,
            cost: entry.cost,
        };
        if let Err(e) = cache.put(&record) {
            warn!(target: "enrich::cache", source = %entry.source_type, error = %e, "cache write failed");
        }
    }

    /// Settle a completed call. A reported cost above the estimate is still
    /// charged at the estimate, so the ceilings hold, but it is surfaced.
    fn charge(&self, reservation: Reservation<'_>, reported: Option<f64>) -> f64 {
        let estimate = self.descriptor.cost_per_query;
        let actual = reported.unwrap_or(estimate);
        if actual > estimate + f64::EPSILON {
            warn!(
                target: "enrich::cost",
                source = self.source_type(),
                estimate,
                actual,
                "reported cost above estimate, charged the estimate"
            );
            counter!(m::COST_OVERRUNS_TOTAL, "source" => self.source_type().to_string()).increment(1);
        }
        reservation.settle(actual)
    }

    /// Wait out `min_delay` since the previous live call. Returns false if
    /// cancelled while waiting.
    async fn pace(&self, cancel: &CancellationToken) -> bool {
        let mut last = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            guard = self.last_call.lock() => guard,
        };
        if let Some(prev) = *last {
            let ready = prev + self.descriptor.min_delay;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(ready) => {}
            }
        }
        *last = Some(Instant::now());
        true
    }

    /// Run the source on its own task so a panic or a hang stays inside this
    /// boundary.
    async fn timed_fetch(
        &self,
        subject: &EnrichmentSubject,
        cancel: &CancellationToken,
    ) -> LookupResult<SourceAnswer> {
        let source = self.source.clone();
        let subject = subject.clone();
        let ctx = FetchContext {
            timeout: self.timeout,
            cancel: cancel.clone(),
        };
        let mut handle = tokio::spawn(async move { source.fetch(&subject, &ctx).await });

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout(self.timeout, &mut handle) => Some(r),
        };
        match joined {
            None => {
                handle.abort();
                Err(LookupError::Cancelled)
            }
            Some(Err(_elapsed)) => {
                handle.abort();
                Err(LookupError::Transient(format!(
                    "timed out after {}s",
                    self.timeout.as_secs_f64()
                )))
            }
            Some(Ok(Err(join))) if join.is_panic() => {
                Err(LookupError::Transient("source panicked".into()))
            }
            Some(Ok(Err(join))) => Err(LookupError::transient(join)),
            Some(Ok(Ok(res))) => res,
        }
    }

    /// One attempt for `subject`. Always returns an outcome with an entry.
    pub async fn lookup(
        &self,
        subject: &EnrichmentSubject,
        gate: &SpendGate<'_>,
        cancel: &CancellationToken,
        ignore_cache: bool,
    ) -> LookupOutcome {
        counter!(m::ATTEMPTS_TOTAL, "source" => self.source_type().to_string()).increment(1);

        if let Err(e) = self.source.check_preconditions(subject) {
            return self.failure(e, self.entry(0.0, 0.0, None, String::new()));
        }

        let key = cache_key(self.source_type(), subject, &self.source.query_text(subject));
        if !ignore_cache {
            if let Some(hit) = self
                .cache
                .as_ref()
                .and_then(|c| c.get(&key, self.descriptor.cache_ttl))
            {
                return self.from_cache(hit);
            }
        }

        let reservation = match gate.reserve(self.descriptor.cost_per_query) {
            Ok(r) => r,
            Err(scope) => {
                return self.failure(
                    LookupError::CostLimitExceeded { scope },
                    self.entry(0.0, 0.0, None, String::new()),
                )
            }
        };

        if !self.pace(cancel).await {
            reservation.settle(0.0);
            return self.failure(LookupError::Cancelled, self.entry(0.0, 0.0, None, String::new()));
        }

        match self.timed_fetch(subject, cancel).await {
            Ok(answer) if answer.payload.is_empty() => {
                let cost = self.charge(reservation, answer.cost);
                record_spend(cost);
                let entry = self.entry(0.0, cost, None, answer.raw_response);
                self.store(&key, subject, &entry, None);
                self.failure(LookupError::no_data("empty answer"), entry)
            }
            Ok(answer) => {
                let cost = self.charge(reservation, answer.cost);
                record_spend(cost);
                let raw = self.source.confidence(subject, &answer);
                let confidence = clamp_confidence(&self.descriptor, raw, answer.exact_match);
                let entry = self.entry(
                    confidence,
                    cost,
                    answer.payload.source_url.clone(),
                    answer.raw_response,
                );
                self.store(&key, subject, &entry, Some(&answer.payload));
                self.success(answer.payload, entry)
            }
            Err(e @ LookupError::NoDataFound(_)) => {
                let cost = reservation.settle(self.descriptor.cost_per_query);
                record_spend(cost);
                let entry = self.entry(0.0, cost, None, String::new());
                self.store(&key, subject, &entry, None);
                self.failure(e, entry)
            }
            Err(e) => {
                reservation.settle(0.0);
                if matches!(e, LookupError::AccessBlocked { .. }) {
                    counter!(m::BLOCKED_TOTAL, "source" => self.source_type().to_string()).increment(1);
                }
                let url = e.blocked_access().and_then(|b| b.url);
                self.failure(e, self.entry(0.0, 0.0, url, String::new()))
            }
        }
    }

    /// One archive attempt for a page this source could not reach directly.
    /// The archive is free; confidence is discounted by `discount`.
    pub async fn lookup_archived(
        &self,
        subject: &EnrichmentSubject,
        url: &str,
        archive: &dyn ArchiveFetcher,
        cancel: &CancellationToken,
        discount: f64,
    ) -> LookupOutcome {
        let archived_entry = |confidence: f64, source_url: Option<String>, raw: String| {
            let mut e = self.entry(confidence, 0.0, source_url, raw);
            e.via_archive = true;
            e
        };

        let page = match archive.fetch_archived(url, cancel).await {
            Ok(p) => p,
            Err(e) => return self.failure(e, archived_entry(0.0, Some(url.to_string()), String::new())),
        };

        match self.source.extract_from_page(subject, &page.original_url, &page.body) {
            Ok(answer) if !answer.payload.is_empty() => {
                let raw = self.source.confidence(subject, &answer);
                let confidence =
                    clamp_confidence(&self.descriptor, raw, answer.exact_match) * discount.clamp(0.0, 1.0);
                let mut payload = answer.payload;
                if payload.source_url.is_none() {
                    payload.source_url = Some(page.original_url.clone());
                }
                counter!(m::ARCHIVE_RECOVERIES_TOTAL, "source" => self.source_type().to_string())
                    .increment(1);
                info!(target: "enrich::source", source = self.source_type(), archive_url = %page.archive_url, "recovered from archive");
                let entry = archived_entry(confidence, Some(page.archive_url), answer.raw_response);
                self.success(payload, entry)
            }
            Ok(_) => self.failure(
                LookupError::no_data("archived page had no answer"),
                archived_entry(0.0, Some(page.archive_url), String::new()),
            ),
            Err(e) => self.failure(e, archived_entry(0.0, Some(page.archive_url), String::new())),
        }
    }
}

fn record_spend(usd: f64) {
    if usd > 0.0 {
        gauge!(m::COST_USD).increment(usd);
    }
}
