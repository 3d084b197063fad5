// tests/cache_flow.rs
use std::sync::Arc;

use death_enrichment::cache::{FileCache, MemoryCache, ResponseCache};
use death_enrichment::orchestrator::Orchestrator;
use death_enrichment::testing::{cause, ScriptedSource};
use death_enrichment::types::{EnrichmentSubject, ReliabilityTier, SourceCategory};
use death_enrichment::{EnrichmentConfig, LookupError, RunBudget};
use tokio_util::sync::CancellationToken;

fn paid_source() -> Arc<ScriptedSource> {
    Arc::new(
        ScriptedSource::simple("news", ReliabilityTier::TradePress, SourceCategory::News, 0.01)
            .answering(cause("drowning"), 0.6),
    )
}

#[tokio::test]
async fn second_lookup_is_free_and_identical() {
    let src = paid_source();
    let cache = Arc::new(MemoryCache::new());
    let orch = Orchestrator::builder(EnrichmentConfig::default())
        .source(src.clone())
        .cache(cache.clone())
        .build();
    let budget = RunBudget::new(1.0);
    let subject = EnrichmentSubject::new("7", "Sam Swimmer");
    let cancel = CancellationToken::new();

    let first = orch.enrich(&subject, &budget, &cancel).await;
    let second = orch.enrich(&subject, &budget, &cancel).await;

    assert_eq!(src.calls(), 1);
    assert!((first.stats.total_cost - 0.01).abs() < 1e-9);
    assert_eq!(second.stats.total_cost, 0.0);
    assert_eq!(second.stats.cache_hits, 1);

    let (a, b) = (&first.provenance[0], &second.provenance[0]);
    assert!(!a.from_cache);
    assert!(b.from_cache);
    assert_eq!(b.cost, 0.0);
    assert_eq!(a.raw_response, b.raw_response);
    assert_eq!(a.confidence, b.confidence);
    assert_eq!(first.fields(), second.fields());
    assert!((budget.spent() - 0.01).abs() < 1e-9);

    let summary = cache.summary();
    assert_eq!(summary.by_source["news"].entries, 1);
}

#[tokio::test]
async fn ignore_cache_forces_a_costed_call() {
    let src = paid_source();
    let cache = Arc::new(MemoryCache::new());
    let subject = EnrichmentSubject::new("7", "Sam Swimmer");
    let budget = RunBudget::new(1.0);
    let cancel = CancellationToken::new();

    Orchestrator::builder(EnrichmentConfig::default())
        .source(src.clone())
        .cache(cache.clone())
        .build()
        .enrich(&subject, &budget, &cancel)
        .await;

    let cfg = EnrichmentConfig {
        ignore_cache: true,
        ..Default::default()
    };
    let again = Orchestrator::builder(cfg)
        .source(src.clone())
        .cache(cache.clone())
        .build()
        .enrich(&subject, &budget, &cancel)
        .await;

    assert_eq!(src.calls(), 2);
    assert!((again.stats.total_cost - 0.01).abs() < 1e-9);
    assert_eq!(again.stats.cache_hits, 0);
}

#[tokio::test]
async fn no_data_answers_are_cached_but_errors_are_not() {
    let empty = Arc::new(
        ScriptedSource::simple("empty", ReliabilityTier::TradePress, SourceCategory::News, 0.0)
            .failing(LookupError::no_data("nobody")),
    );
    let flaky = Arc::new(
        ScriptedSource::simple("flaky", ReliabilityTier::AiModel, SourceCategory::AiModel, 0.0)
            .failing(LookupError::transient("reset")),
    );
    let orch = Orchestrator::builder(EnrichmentConfig::default())
        .source(empty.clone())
        .source(flaky.clone())
        .cache(Arc::new(MemoryCache::new()))
        .build();
    let subject = EnrichmentSubject::new("8", "Nobody Known");
    let budget = RunBudget::new(1.0);
    let cancel = CancellationToken::new();

    orch.enrich(&subject, &budget, &cancel).await;
    let second = orch.enrich(&subject, &budget, &cancel).await;

    assert_eq!(empty.calls(), 1);
    assert_eq!(flaky.calls(), 2);
    assert_eq!(second.stats.no_data, 1);
    assert_eq!(second.stats.cache_hits, 1);
}

#[tokio::test]
async fn file_cache_survives_a_new_orchestrator() {
    let tmp = tempfile::tempdir().unwrap();
    let src = paid_source();
    let subject = EnrichmentSubject::new("9", "Persisted Person");
    let budget = RunBudget::new(1.0);
    let cancel = CancellationToken::new();

    for _ in 0..2 {
        let cache: Arc<dyn ResponseCache> = Arc::new(FileCache::new(tmp.path()).unwrap());
        Orchestrator::builder(EnrichmentConfig::default())
            .source(src.clone())
            .cache(cache)
            .build()
            .enrich(&subject, &budget, &cancel)
            .await;
    }

    assert_eq!(src.calls(), 1);
    let files: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
    assert_eq!(files.len(), 1);
}
