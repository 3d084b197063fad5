// src/metrics.rs
use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub const ATTEMPTS_TOTAL: &str = "enrich_attempts_total";
pub const SOURCE_OUTCOMES_TOTAL: &str = "enrich_source_outcomes_total";
pub const CACHE_HITS_TOTAL: &str = "enrich_cache_hits_total";
pub const BLOCKED_TOTAL: &str = "enrich_blocked_total";
pub const ARCHIVE_RECOVERIES_TOTAL: &str = "enrich_archive_recoveries_total";
pub const COST_USD: &str = "enrich_cost_usd";
pub const COST_OVERRUNS_TOTAL: &str = "enrich_cost_overruns_total";
pub const SUBJECT_MS: &str = "enrich_subject_ms";
pub const RUN_SPENT_USD: &str = "enrich_run_spent_usd";

/// One-time metrics registration (so series show up in the exposition).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(ATTEMPTS_TOTAL, "Live and cached source attempts.");
        describe_counter!(
            SOURCE_OUTCOMES_TOTAL,
            "Source attempts by source and outcome label."
        );
        describe_counter!(CACHE_HITS_TOTAL, "Answers served from the response cache.");
        describe_counter!(
            BLOCKED_TOTAL,
            "Attempts refused by an access block or CAPTCHA."
        );
        describe_counter!(
            ARCHIVE_RECOVERIES_TOTAL,
            "Blocked pages recovered through the web archive."
        );
        describe_counter!(
            COST_OVERRUNS_TOTAL,
            "Calls whose reported cost exceeded the reserved estimate."
        );
        describe_gauge!(COST_USD, "Cumulative spend charged for live queries, in USD.");
        describe_histogram!(SUBJECT_MS, "Wall time per enriched subject in milliseconds.");
        describe_gauge!(RUN_SPENT_USD, "Spend recorded against the current run budget.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Call once per process.
    pub fn init(run_limit_usd: f64) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        ensure_metrics_described();
        gauge!("enrich_run_limit_usd").set(run_limit_usd);
        Ok(Self { handle })
    }

    /// Current exposition text.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
