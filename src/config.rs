// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::reliability::{clamp01, TierWeights};
use crate::sources::WebPageConfig;
use crate::types::SourceCategory;

const ENV_PATH: &str = "ENRICH_CONFIG_PATH";
const ENV_IGNORE_CACHE: &str = "ENRICH_IGNORE_CACHE";
const ENV_MAX_TOTAL_COST: &str = "ENRICH_MAX_TOTAL_COST";

fn default_confidence_threshold() -> f64 {
    0.8
}
fn default_reliability_threshold() -> f64 {
    0.6
}
fn default_early_stop_source_count() -> usize {
    2
}
fn default_request_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_archive_discount() -> f64 {
    0.85
}
fn default_session_ttl_hours() -> u64 {
    24
}
fn default_workers() -> usize {
    4
}
fn default_progress_buffer() -> usize {
    64
}
fn default_max_cost_per_subject() -> f64 {
    0.10
}
fn default_max_total_cost() -> f64 {
    10.0
}

/// Per-category on/off switches. Missing keys default to enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCategories {
    #[serde(default = "default_true")]
    pub structured_data: bool,
    #[serde(default = "default_true")]
    pub reference: bool,
    #[serde(default = "default_true")]
    pub web_search: bool,
    #[serde(default = "default_true")]
    pub news: bool,
    #[serde(default = "default_true")]
    pub obituary: bool,
    #[serde(default = "default_true")]
    pub ai_model: bool,
}

impl Default for SourceCategories {
    fn default() -> Self {
        Self::all(true)
    }
}

impl SourceCategories {
    pub fn all(enabled: bool) -> Self {
        Self {
            structured_data: enabled,
            reference: enabled,
            web_search: enabled,
            news: enabled,
            obituary: enabled,
            ai_model: enabled,
        }
    }

    pub fn is_enabled(&self, category: SourceCategory) -> bool {
        match category {
            SourceCategory::StructuredData => self.structured_data,
            SourceCategory::Reference => self.reference,
            SourceCategory::WebSearch => self.web_search,
            SourceCategory::News => self.news,
            SourceCategory::Obituary => self.obituary,
            SourceCategory::AiModel => self.ai_model,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostLimits {
    #[serde(default = "default_max_cost_per_subject")]
    pub max_cost_per_subject: f64,
    #[serde(default = "default_max_total_cost")]
    pub max_total_cost: f64,
}

impl Default for CostLimits {
    fn default() -> Self {
        Self {
            max_cost_per_subject: default_max_cost_per_subject(),
            max_total_cost: default_max_total_cost(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// An authoritative answer above this ends the subject early.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Minimum tier weight for a source to count toward corroboration.
    #[serde(default = "default_reliability_threshold")]
    pub reliability_threshold: f64,
    #[serde(default = "default_early_stop_source_count")]
    pub early_stop_source_count: usize,
    #[serde(default)]
    pub source_categories: SourceCategories,
    #[serde(default)]
    pub cost_limits: CostLimits,
    #[serde(default)]
    pub ignore_cache: bool,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub archive_fallback: bool,
    #[serde(default = "default_archive_discount")]
    pub archive_confidence_discount: f64,
    #[serde(default)]
    pub tier_weights: TierWeights,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_dir: Option<PathBuf>,
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
    /// Page sources to register alongside the built-in ones.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub web_sources: Vec<WebPageConfig>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            reliability_threshold: default_reliability_threshold(),
            early_stop_source_count: default_early_stop_source_count(),
            source_categories: SourceCategories::default(),
            cost_limits: CostLimits::default(),
            ignore_cache: false,
            request_timeout_secs: default_request_timeout_secs(),
            archive_fallback: true,
            archive_confidence_discount: default_archive_discount(),
            tier_weights: TierWeights::default(),
            cache_dir: None,
            session_dir: None,
            session_ttl_hours: default_session_ttl_hours(),
            workers: default_workers(),
            progress_buffer: default_progress_buffer(),
            web_sources: Vec::new(),
        }
    }
}

impl EnrichmentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours.saturating_mul(3600))
    }

    /// Clamp out-of-range values back into something usable instead of failing.
    pub fn sanitize(mut self) -> Self {
        self.confidence_threshold = clamp01(self.confidence_threshold);
        self.reliability_threshold = clamp01(self.reliability_threshold);
        self.early_stop_source_count = self.early_stop_source_count.max(1);
        self.archive_confidence_discount = clamp01(self.archive_confidence_discount);
        self.tier_weights.sanitize();

        let per = &mut self.cost_limits.max_cost_per_subject;
        if !per.is_finite() || *per < 0.0 {
            *per = default_max_cost_per_subject();
        }
        let total = &mut self.cost_limits.max_total_cost;
        if !total.is_finite() || *total < 0.0 {
            *total = default_max_total_cost();
        }

        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = default_request_timeout_secs();
        }
        self.workers = self.workers.clamp(1, 64);
        self.progress_buffer = self.progress_buffer.max(1);
        for web in &mut self.web_sources {
            web.max_confidence = clamp01(web.max_confidence);
            if !web.cost_per_query.is_finite() || web.cost_per_query < 0.0 {
                web.cost_per_query = 0.0;
            }
        }
        self
    }

    /// Environment overrides applied after file loading.
    pub fn apply_env(mut self) -> Self {
        if let Ok(v) = std::env::var(ENV_IGNORE_CACHE) {
            self.ignore_cache = matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var(ENV_MAX_TOTAL_COST) {
            match v.trim().parse::<f64>() {
                Ok(x) => self.cost_limits.max_total_cost = x,
                Err(_) => tracing::warn!(target: "enrich", value = %v, "ignoring bad {ENV_MAX_TOTAL_COST}"),
            }
        }
        self
    }
}

/// Load configuration from an explicit path. Supports TOML or JSON formats.
pub fn load_from(path: &Path) -> Result<EnrichmentConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading enrichment config from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let cfg = parse_config(&content, ext.as_str())?;
    Ok(cfg.apply_env().sanitize())
}

/// Load configuration using env var + fallbacks:
/// 1) $ENRICH_CONFIG_PATH
/// 2) config/enrichment.toml
/// 3) config/enrichment.json
/// 4) built-in defaults
pub fn load_default() -> Result<EnrichmentConfig> {
    if let Ok(p) = std::env::var(ENV_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return load_from(&pb);
        }
        return Err(anyhow!("{ENV_PATH} points to non-existent path"));
    }
    for candidate in ["config/enrichment.toml", "config/enrichment.json"] {
        let pb = PathBuf::from(candidate);
        if pb.exists() {
            return load_from(&pb);
        }
    }
    Ok(EnrichmentConfig::default().apply_env().sanitize())
}

fn parse_config(s: &str, hint_ext: &str) -> Result<EnrichmentConfig> {
    let looks_json = s.trim_start().starts_with('{');
    let try_toml = hint_ext == "toml" || (hint_ext != "json" && !looks_json);
    if try_toml {
        if let Ok(v) = toml::from_str::<EnrichmentConfig>(s) {
            return Ok(v);
        }
    }
    match serde_json::from_str::<EnrichmentConfig>(s) {
        Ok(v) => return Ok(v),
        Err(e) if !try_toml => {
            // Mislabelled file: give TOML one chance before reporting the JSON error.
            return toml::from_str::<EnrichmentConfig>(s)
                .map_err(|_| anyhow!("invalid enrichment config: {e}"));
        }
        Err(_) => {}
    }
    toml::from_str::<EnrichmentConfig>(s).context("invalid enrichment config")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_and_json_parse_with_defaults() {
        let toml = r#"
            confidence_threshold = 0.9
            [source_categories]
            ai_model = false
            [cost_limits]
            max_total_cost = 2.5
        "#;
        let c = parse_config(toml, "toml").unwrap();
        assert!(c.web_sources.is_empty());
        assert_eq!(c.confidence_threshold, 0.9);
        assert!(!c.source_categories.ai_model);
        assert!(c.source_categories.news);
        assert_eq!(c.cost_limits.max_total_cost, 2.5);
        assert_eq!(c.cost_limits.max_cost_per_subject, 0.10);

        let json = r#"{"early_stop_source_count": 3, "ignore_cache": true}"#;
        let j = parse_config(json, "").unwrap();
        assert_eq!(j.early_stop_source_count, 3);
        assert!(j.ignore_cache);
        assert_eq!(j.tier_weights, TierWeights::default());
    }

    #[test]
    fn sanitize_clamps_instead_of_failing() {
        let mut c = EnrichmentConfig {
            confidence_threshold: 1.7,
            early_stop_source_count: 0,
            archive_confidence_discount: -1.0,
            workers: 0,
            ..Default::default()
        };
        c.cost_limits.max_total_cost = f64::NAN;
        c.tier_weights.ai_model = 3.0;
        let c = c.sanitize();
        assert_eq!(c.confidence_threshold, 1.0);
        assert_eq!(c.early_stop_source_count, 1);
        assert_eq!(c.archive_confidence_discount, 0.0);
        assert_eq!(c.workers, 1);
        assert_eq!(c.cost_limits.max_total_cost, 10.0);
        assert_eq!(c.tier_weights.ai_model, 1.0);
    }

    #[test]
    fn web_sources_from_toml() {
        let toml = r#"
            [[web_sources]]
            source_type = "obits"
            name = "Obituaries"
            url_template = "https://obits.example/search?q={name}"
            category = "obituary"
            tier = "ARCHIVAL"
            cost_per_query = 0.01
        "#;
        let c = parse_config(toml, "toml").unwrap().sanitize();
        assert_eq!(c.web_sources.len(), 1);
        let w = &c.web_sources[0];
        assert_eq!(w.category, SourceCategory::Obituary);
        assert_eq!(w.tier, crate::types::ReliabilityTier::Archival);
        assert_eq!(w.max_confidence, 0.8);
        assert!(!w.require_session);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_config("confidence_threshold = [", "toml").is_err());
        assert!(parse_config("{\"workers\": \"many\"}", "json").is_err());
    }
}
