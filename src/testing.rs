//! Deterministic test doubles: a scripted source and a static archive.
//!
//! Useful for exercising the orchestrator without network calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::archive::{ArchiveFetcher, ArchivedPage};
use crate::error::{LookupError, LookupResult};
use crate::source::{FetchContext, Source, SourceAnswer};
use crate::types::{
    DeathFields, EnrichmentPayload, EnrichmentSubject, ReliabilityTier, SourceCategory,
    SourceDescriptor,
};

/// Payload with only a cause of death.
pub fn cause(value: &str) -> EnrichmentPayload {
    EnrichmentPayload {
        fields: DeathFields {
            cause: Some(value.to_string()),
            ..Default::default()
        },
        source_url: None,
    }
}

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Answer {
        payload: EnrichmentPayload,
        confidence: f64,
        exact: bool,
    },
    Fail(LookupError),
    Panic,
}

impl Reply {
    pub fn answer(payload: EnrichmentPayload, confidence: f64) -> Self {
        Reply::Answer {
            payload,
            confidence,
            exact: false,
        }
    }
}

/// A source that replays queued replies, then repeats its default reply.
pub struct ScriptedSource {
    descriptor: SourceDescriptor,
    available: bool,
    needs_death_date: bool,
    delay: Duration,
    queue: Mutex<VecDeque<Reply>>,
    default: Reply,
    page_reply: Option<Reply>,
    reported_cost: Option<f64>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        Self {
            descriptor,
            available: true,
            needs_death_date: false,
            delay: Duration::ZERO,
            queue: Mutex::new(VecDeque::new()),
            default: Reply::Fail(LookupError::no_data("scripted: nothing")),
            page_reply: None,
            reported_cost: None,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand descriptor: `source_type` doubles as the display name.
    pub fn simple(
        source_type: &str,
        tier: ReliabilityTier,
        category: SourceCategory,
        cost: f64,
    ) -> Self {
        Self::new(
            SourceDescriptor::new(source_type, source_type, tier, category)
                .cost(cost)
                .max_confidence(1.0),
        )
    }

    pub fn answering(mut self, payload: EnrichmentPayload, confidence: f64) -> Self {
        self.default = Reply::answer(payload, confidence);
        self
    }

    pub fn exact(mut self, payload: EnrichmentPayload, confidence: f64) -> Self {
        self.default = Reply::Answer {
            payload,
            confidence,
            exact: true,
        };
        self
    }

    pub fn failing(mut self, err: LookupError) -> Self {
        self.default = Reply::Fail(err);
        self
    }

    pub fn then(self, reply: Reply) -> Self {
        if let Ok(mut q) = self.queue.lock() {
            q.push_back(reply);
        }
        self
    }

    /// Actual cost reported with every answer.
    pub fn reporting_cost(mut self, usd: f64) -> Self {
        self.reported_cost = Some(usd);
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn requires_death_date(mut self) -> Self {
        self.needs_death_date = true;
        self
    }

    /// Reply used for archived page extraction.
    pub fn on_page(mut self, reply: Reply) -> Self {
        self.page_reply = Some(reply);
        self
    }

    /// Live fetches so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Subject ids in fetch order.
    pub fn subjects_seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next_reply(&self) -> Reply {
        self.queue
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or_else(|| self.default.clone())
    }

    fn resolve(reply: Reply) -> LookupResult<SourceAnswer> {
        match reply {
            Reply::Answer {
                payload,
                confidence,
                exact,
            } => {
                let raw = serde_json::json!({ "confidence": confidence, "payload": payload });
                Ok(SourceAnswer::new(payload, raw.to_string()).exact(exact))
            }
            Reply::Fail(e) => Err(e),
            Reply::Panic => panic!("scripted panic"),
        }
    }
}

#[async_trait]
impl Source for ScriptedSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn check_preconditions(&self, subject: &EnrichmentSubject) -> LookupResult<()> {
        if self.needs_death_date && subject.death_date.is_none() {
            return Err(LookupError::PreconditionFailed("death date required".into()));
        }
        Ok(())
    }

    async fn fetch(&self, subject: &EnrichmentSubject, _ctx: &FetchContext) -> LookupResult<SourceAnswer> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(subject.id.clone());
        }
        let reply = self.next_reply();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Self::resolve(reply).map(|mut a| {
            a.cost = self.reported_cost;
            a
        })
    }

    fn extract_from_page(
        &self,
        _subject: &EnrichmentSubject,
        url: &str,
        _body: &str,
    ) -> LookupResult<SourceAnswer> {
        match &self.page_reply {
            Some(reply) => Self::resolve(reply.clone()),
            None => Err(LookupError::no_data(format!("no page reply for {url}"))),
        }
    }

    fn confidence(&self, _subject: &EnrichmentSubject, answer: &SourceAnswer) -> f64 {
        serde_json::from_str::<serde_json::Value>(&answer.raw_response)
            .ok()
            .and_then(|v| v["confidence"].as_f64())
            .unwrap_or(0.0)
    }
}

/// Archive with fixed pages; unknown URLs are "not archived".
#[derive(Default)]
pub struct StaticArchive {
    pages: HashMap<String, String>,
    calls: AtomicUsize,
}

impl StaticArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), body.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ArchiveFetcher for StaticArchive {
    async fn fetch_archived(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> LookupResult<ArchivedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if cancel.is_cancelled() {
            return Err(LookupError::Cancelled);
        }
        match self.pages.get(url) {
            Some(body) => Ok(ArchivedPage {
                original_url: url.to_string(),
                archive_url: format!("https://archive.test/{url}"),
                body: body.clone(),
            }),
            None => Err(LookupError::no_data(format!("{url} not archived"))),
        }
    }
}
