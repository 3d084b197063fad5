//! # Reliability & merge precedence
//!
//! Maps reliability tiers to normalized trust weights in `[0.0, 1.0]` and
//! fuses per-source answers into one merged record.
//!
//! - Tiers only matter between sources that give different values; a unique
//!   answer is always accepted, whatever its tier.
//! - A more specific answer from a higher tier replaces a vaguer one
//!   ("Paris, Texas" over "Paris") without being logged as a conflict.
//! - Conflict order: higher tier → higher confidence → earlier-queried source.
//! - Values supplied with the subject are never overwritten.
//! - List fields (tags, related entities) are unioned case-insensitively.

use serde::{Deserialize, Serialize};

use crate::text::normalize_key;
use crate::types::{DeathFields, EnrichmentPayload, Field, ReliabilityTier, SourceEntry};

/// Similarity at or above which two answers are treated as the same answer.
const AGREEMENT_SIMILARITY: f64 = 0.85;

/// Trust weight per tier. Used to decide which sources may count toward
/// corroboration (`reliability_threshold`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierWeights {
    #[serde(default = "default_structured")]
    pub structured_data: f64,
    #[serde(default = "default_archival")]
    pub archival: f64,
    #[serde(default = "default_trade_press")]
    pub trade_press: f64,
    #[serde(default = "default_ai_model")]
    pub ai_model: f64,
}

fn default_structured() -> f64 {
    0.95
}
fn default_archival() -> f64 {
    0.85
}
fn default_trade_press() -> f64 {
    0.70
}
fn default_ai_model() -> f64 {
    0.50
}

impl Default for TierWeights {
    fn default() -> Self {
        Self {
            structured_data: default_structured(),
            archival: default_archival(),
            trade_press: default_trade_press(),
            ai_model: default_ai_model(),
        }
    }
}

impl TierWeights {
    pub fn weight_for(&self, tier: ReliabilityTier) -> f64 {
        let w = match tier {
            ReliabilityTier::StructuredData => self.structured_data,
            ReliabilityTier::Archival => self.archival,
            ReliabilityTier::TradePress => self.trade_press,
            ReliabilityTier::AiModel => self.ai_model,
        };
        clamp01(w)
    }

    pub(crate) fn sanitize(&mut self) {
        self.structured_data = clamp01(self.structured_data);
        self.archival = clamp01(self.archival);
        self.trade_press = clamp01(self.trade_press);
        self.ai_model = clamp01(self.ai_model);
    }
}

/// Whether two answers name the same thing: equal after normalization, one
/// containing the other, or close by normalized Levenshtein similarity.
pub fn answers_agree(a: &str, b: &str) -> bool {
    let (ka, kb) = (normalize_key(a), normalize_key(b));
    if ka.is_empty() || kb.is_empty() {
        return false;
    }
    if ka == kb || contains_words(&ka, &kb) || contains_words(&kb, &ka) {
        return true;
    }
    strsim::normalized_levenshtein(&ka, &kb) >= AGREEMENT_SIMILARITY
}

/// Word-boundary containment, so "cancer" agrees with "lung cancer" but
/// "art" does not agree with "heart attack".
fn contains_words(haystack: &str, needle: &str) -> bool {
    let hay = format!(" {haystack} ");
    hay.contains(&format!(" {needle} "))
}

/// Where a merged value came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldOrigin {
    /// Already known for the subject before enrichment.
    Subject,
    Source {
        source_type: String,
        tier: ReliabilityTier,
        confidence: f64,
        /// Position of the attempt in the query order (0 = first).
        order: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub value: String,
    pub origin: FieldOrigin,
}

/// A disagreement that was settled by precedence, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: Field,
    pub kept: String,
    pub kept_source: Option<String>,
    pub rejected: String,
    pub rejected_source: String,
}

/// The running best answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergedFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circumstances: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manner: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<FieldValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_entities: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<FieldConflict>,
}

impl MergedFields {
    /// Seed from values the caller already knows.
    pub fn from_known(known: &DeathFields) -> Self {
        let mut merged = MergedFields::default();
        for field in Field::SCALARS {
            if let Some(v) = known.get(field) {
                *merged.slot_mut(field) = Some(FieldValue {
                    value: v.to_string(),
                    origin: FieldOrigin::Subject,
                });
            }
        }
        union_into(&mut merged.tags, &known.tags);
        union_into(&mut merged.related_entities, &known.related_entities);
        merged
    }

    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        match field {
            Field::Circumstances => self.circumstances.as_ref(),
            Field::Cause => self.cause.as_ref(),
            Field::Manner => self.manner.as_ref(),
            Field::Location => self.location.as_ref(),
        }
    }

    fn slot_mut(&mut self, field: Field) -> &mut Option<FieldValue> {
        match field {
            Field::Circumstances => &mut self.circumstances,
            Field::Cause => &mut self.cause,
            Field::Manner => &mut self.manner,
            Field::Location => &mut self.location,
        }
    }

    /// Plain values, without provenance.
    pub fn to_fields(&self) -> DeathFields {
        let mut out = DeathFields::default();
        for field in Field::SCALARS {
            out.set(field, self.get(field).map(|fv| fv.value.clone()));
        }
        out.tags = self.tags.clone();
        out.related_entities = self.related_entities.clone();
        out
    }

    /// Merge one successful answer. Returns the fields that changed.
    pub fn merge(
        &mut self,
        payload: &EnrichmentPayload,
        entry: &SourceEntry,
        order: usize,
    ) -> Vec<Field> {
        let mut changed = Vec::new();
        for field in Field::SCALARS {
            let Some(candidate) = payload.fields.get(field) else {
                continue;
            };
            let incoming = FieldValue {
                value: candidate.to_string(),
                origin: FieldOrigin::Source {
                    source_type: entry.source_type.clone(),
                    tier: entry.tier,
                    confidence: entry.confidence,
                    order,
                },
            };
            let slot = self.slot_mut(field);
            match slot {
                None => {
                    *slot = Some(incoming);
                    changed.push(field);
                }
                Some(current) => {
                    if normalize_key(&current.value) == normalize_key(&incoming.value) {
                        continue;
                    }
                    // Near-matches still go through precedence; only real
                    // disagreements are kept for audit.
                    let disagree = !answers_agree(&current.value, &incoming.value);
                    let conflict = if outranks(&incoming.origin, &current.origin) {
                        let c = FieldConflict {
                            field,
                            kept: incoming.value.clone(),
                            kept_source: Some(entry.source_type.clone()),
                            rejected: current.value.clone(),
                            rejected_source: origin_label(&current.origin),
                        };
                        *current = incoming;
                        changed.push(field);
                        c
                    } else {
                        FieldConflict {
                            field,
                            kept: current.value.clone(),
                            kept_source: origin_source(&current.origin),
                            rejected: incoming.value,
                            rejected_source: entry.source_type.clone(),
                        }
                    };
                    if disagree {
                        self.conflicts.push(conflict);
                    }
                }
            }
        }
        union_into(&mut self.tags, &payload.fields.tags);
        union_into(&mut self.related_entities, &payload.fields.related_entities);
        changed
    }
}

/// Strictly higher tier wins; same tier → strictly higher confidence; else the
/// value already in place (earlier-queried) stays. Subject values always stay.
pub fn outranks(candidate: &FieldOrigin, current: &FieldOrigin) -> bool {
    match (candidate, current) {
        (_, FieldOrigin::Subject) => false,
        (FieldOrigin::Subject, _) => true,
        (
            FieldOrigin::Source {
                tier: t_new,
                confidence: c_new,
                ..
            },
            FieldOrigin::Source {
                tier: t_cur,
                confidence: c_cur,
                ..
            },
        ) => {
            if t_new != t_cur {
                t_new > t_cur
            } else {
                c_new > c_cur
            }
        }
    }
}

fn origin_source(origin: &FieldOrigin) -> Option<String> {
    match origin {
        FieldOrigin::Subject => None,
        FieldOrigin::Source { source_type, .. } => Some(source_type.clone()),
    }
}

fn origin_label(origin: &FieldOrigin) -> String {
    origin_source(origin).unwrap_or_else(|| "subject".to_string())
}

fn union_into(target: &mut Vec<String>, incoming: &[String]) {
    for item in incoming {
        let t = item.trim();
        if t.is_empty() {
            continue;
        }
        let key = normalize_key(t);
        if !target.iter().any(|x| normalize_key(x) == key) {
            target.push(t.to_string());
        }
    }
}

/// Clamp to [0.0, 1.0]; NaN becomes 0.0.
pub(crate) fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}
