// src/types.rs
//! Plain data shared across the engine: source identity, subjects, answers and
//! provenance. Everything a scheduler persists is `Serialize + Deserialize`.

use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::captcha::CaptchaDetectionResult;

/// Coarse, source-level trust classification. Ordered by trust, so
/// `StructuredData > Archival > TradePress > AiModel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReliabilityTier {
    StructuredData,
    Archival,
    TradePress,
    AiModel,
}

impl ReliabilityTier {
    pub const ALL: [ReliabilityTier; 4] = [
        ReliabilityTier::StructuredData,
        ReliabilityTier::Archival,
        ReliabilityTier::TradePress,
        ReliabilityTier::AiModel,
    ];

    fn rank(self) -> u8 {
        match self {
            ReliabilityTier::StructuredData => 4,
            ReliabilityTier::Archival => 3,
            ReliabilityTier::TradePress => 2,
            ReliabilityTier::AiModel => 1,
        }
    }

    /// Tiers allowed to end a run on their own when confident enough.
    pub fn is_authoritative(self) -> bool {
        matches!(
            self,
            ReliabilityTier::StructuredData | ReliabilityTier::Archival
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReliabilityTier::StructuredData => "structured_data",
            ReliabilityTier::Archival => "archival",
            ReliabilityTier::TradePress => "trade_press",
            ReliabilityTier::AiModel => "ai_model",
        }
    }
}

impl Ord for ReliabilityTier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl PartialOrd for ReliabilityTier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Category toggles exposed in configuration. Independent of the tier: a news
/// site and a trade-press archive can share a tier but not a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    StructuredData,
    Reference,
    WebSearch,
    News,
    Obituary,
    AiModel,
}

/// Identity and static economics of a source. Owned by the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    /// Unique tag, also the cache namespace (e.g. "wikidata").
    pub source_type: String,
    pub name: String,
    /// Estimated cost of one live query, in USD.
    pub cost_per_query: f64,
    pub tier: ReliabilityTier,
    pub category: SourceCategory,
    pub min_delay: Duration,
    /// `None` means cached answers never expire by age.
    pub cache_ttl: Option<Duration>,
    /// Ceiling applied to every non-exact confidence this source reports.
    pub max_confidence: f64,
}

impl SourceDescriptor {
    pub fn new(
        source_type: impl Into<String>,
        name: impl Into<String>,
        tier: ReliabilityTier,
        category: SourceCategory,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            name: name.into(),
            cost_per_query: 0.0,
            tier,
            category,
            min_delay: Duration::ZERO,
            cache_ttl: None,
            max_confidence: 0.9,
        }
    }

    pub fn cost(mut self, usd: f64) -> Self {
        self.cost_per_query = usd.max(0.0);
        self
    }

    pub fn min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn max_confidence(mut self, ceiling: f64) -> Self {
        self.max_confidence = ceiling.clamp(0.0, 1.0);
        self
    }

    pub fn is_free(&self) -> bool {
        self.cost_per_query <= 0.0
    }
}

/// The fields this engine tries to fill in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Circumstances,
    Cause,
    Manner,
    Location,
}

impl Field {
    pub const SCALARS: [Field; 4] = [
        Field::Cause,
        Field::Manner,
        Field::Location,
        Field::Circumstances,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Field::Circumstances => "circumstances",
            Field::Cause => "cause",
            Field::Manner => "manner",
            Field::Location => "location",
        }
    }
}

/// Death-related facts, either already known for a subject or answered by a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeathFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circumstances: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_entities: Vec<String>,
}

impl DeathFields {
    pub fn get(&self, field: Field) -> Option<&str> {
        let v = match field {
            Field::Circumstances => &self.circumstances,
            Field::Cause => &self.cause,
            Field::Manner => &self.manner,
            Field::Location => &self.location,
        };
        v.as_deref().filter(|s| !s.trim().is_empty())
    }

    pub fn set(&mut self, field: Field, value: Option<String>) {
        let slot = match field {
            Field::Circumstances => &mut self.circumstances,
            Field::Cause => &mut self.cause,
            Field::Manner => &mut self.manner,
            Field::Location => &mut self.location,
        };
        *slot = value;
    }

    /// True when no scalar field and no list field carries data.
    pub fn is_empty(&self) -> bool {
        Field::SCALARS.iter().all(|f| self.get(*f).is_none())
            && self.tags.is_empty()
            && self.related_entities.is_empty()
    }

    pub fn missing(&self) -> Vec<Field> {
        Field::SCALARS
            .iter()
            .copied()
            .filter(|f| self.get(*f).is_none())
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }
}

/// The entity being enriched. Supplied by the caller, never mutated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentSubject {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub death_date: Option<NaiveDate>,
    #[serde(default)]
    pub known: DeathFields,
}

impl EnrichmentSubject {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn born(mut self, date: NaiveDate) -> Self {
        self.birth_date = Some(date);
        self
    }

    pub fn died(mut self, date: NaiveDate) -> Self {
        self.death_date = Some(date);
        self
    }

    pub fn with_known(mut self, known: DeathFields) -> Self {
        self.known = known;
        self
    }

    pub fn needs_enrichment(&self) -> bool {
        !self.known.is_complete()
    }
}

/// A source's answer for one subject.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentPayload {
    #[serde(flatten)]
    pub fields: DeathFields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
}

impl EnrichmentPayload {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One provenance record. Created once per attempt, never edited afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub source_type: String,
    pub source_name: String,
    pub retrieved_at: DateTime<Utc>,
    pub confidence: f64,
    pub tier: ReliabilityTier,
    pub cost: f64,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub via_archive: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Raw response kept for audit/debugging.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub raw_response: String,
}

/// Classification of a failed attempt (see `error::LookupError`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unavailable,
    PreconditionFailed,
    NoDataFound,
    Transient,
    AccessBlocked,
    CostLimitExceeded,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Unavailable => "unavailable",
            FailureKind::PreconditionFailed => "precondition_failed",
            FailureKind::NoDataFound => "no_data",
            FailureKind::Transient => "transient",
            FailureKind::AccessBlocked => "blocked",
            FailureKind::CostLimitExceeded => "cost_limit",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

/// Details kept when a source refused access, so the caller can try an archive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedAccess {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha: Option<CaptchaDetectionResult>,
}

/// Result of one source attempt. Always carries a `SourceEntry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LookupOutcome {
    Success {
        payload: EnrichmentPayload,
        entry: SourceEntry,
    },
    Failure {
        kind: FailureKind,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        blocked: Option<BlockedAccess>,
        entry: SourceEntry,
    },
}

impl LookupOutcome {
    pub fn entry(&self) -> &SourceEntry {
        match self {
            LookupOutcome::Success { entry, .. } | LookupOutcome::Failure { entry, .. } => entry,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LookupOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            LookupOutcome::Success { .. } => None,
            LookupOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}
