// tests/config_env.rs
use death_enrichment::config::{load_default, load_from};
use death_enrichment::types::{ReliabilityTier, SourceCategory};
use std::{env, fs};

#[test]
fn toml_and_json_files_parse_to_the_same_shape() {
    let dir = tempfile::tempdir().unwrap();

    let p_toml = dir.path().join("enrichment.toml");
    fs::write(
        &p_toml,
        r#"
confidence_threshold = 0.9
workers = 2

[source_categories]
ai_model = false

[cost_limits]
max_cost_per_subject = 0.05

[[web_sources]]
source_type = "legacy"
name = "Legacy.com"
url_template = "https://www.legacy.com/search?name={name}"
tier = "ARCHIVAL"
category = "obituary"
"#,
    )
    .unwrap();
    let t = load_from(&p_toml).unwrap();
    assert_eq!(t.confidence_threshold, 0.9);
    assert_eq!(t.workers, 2);
    assert!(!t.source_categories.ai_model);
    assert!(t.source_categories.news);
    assert_eq!(t.cost_limits.max_cost_per_subject, 0.05);
    assert_eq!(t.web_sources.len(), 1);
    assert_eq!(t.web_sources[0].tier, ReliabilityTier::Archival);
    assert_eq!(t.web_sources[0].category, SourceCategory::Obituary);
    assert_eq!(t.web_sources[0].max_confidence, 0.8);

    let p_json = dir.path().join("enrichment.json");
    fs::write(
        &p_json,
        r#"{"confidence_threshold": 0.9, "workers": 2, "source_categories": {"ai_model": false}}"#,
    )
    .unwrap();
    let j = load_from(&p_json).unwrap();
    assert_eq!(j.confidence_threshold, 0.9);
    assert!(!j.source_categories.ai_model);
}

#[test]
fn out_of_range_values_are_clamped() {
    let dir = tempfile::tempdir().unwrap();
    let p = dir.path().join("enrichment.toml");
    fs::write(
        &p,
        r#"
confidence_threshold = 3.0
workers = 0
request_timeout_secs = 0
archive_confidence_discount = -1.0
"#,
    )
    .unwrap();
    let c = load_from(&p).unwrap();
    assert_eq!(c.confidence_threshold, 1.0);
    assert_eq!(c.workers, 1);
    assert_eq!(c.request_timeout_secs, 30);
    assert_eq!(c.archive_confidence_discount, 0.0);
}

#[serial_test::serial]
#[test]
fn default_uses_env_then_fallbacks() {
    // Isolate CWD so the repo's own config/ is not read.
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    env::remove_var("ENRICH_CONFIG_PATH");
    env::remove_var("ENRICH_MAX_TOTAL_COST");
    env::remove_var("ENRICH_IGNORE_CACHE");

    // 1) nothing on disk: defaults
    let d = load_default().unwrap();
    assert_eq!(d.workers, 4);
    assert!(!d.ignore_cache);

    // 2) ./config/enrichment.toml
    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(cfg_dir.join("enrichment.toml"), "workers = 7\n").unwrap();
    assert_eq!(load_default().unwrap().workers, 7);

    // 3) env path wins
    let p_env = tmp.path().join("other.json");
    fs::write(&p_env, r#"{"workers": 3}"#).unwrap();
    env::set_var("ENRICH_CONFIG_PATH", p_env.display().to_string());
    assert_eq!(load_default().unwrap().workers, 3);

    // 4) missing env path is an error, not a silent fallback
    env::set_var("ENRICH_CONFIG_PATH", tmp.path().join("nope.toml").display().to_string());
    assert!(load_default().is_err());
    env::remove_var("ENRICH_CONFIG_PATH");

    env::set_current_dir(&old).unwrap();
}

#[serial_test::serial]
#[test]
fn env_overrides_apply_after_file() {
    let old = env::current_dir().unwrap();
    let tmp = tempfile::tempdir().unwrap();
    env::set_current_dir(tmp.path()).unwrap();
    env::remove_var("ENRICH_CONFIG_PATH");

    let cfg_dir = tmp.path().join("config");
    fs::create_dir_all(&cfg_dir).unwrap();
    fs::write(
        cfg_dir.join("enrichment.toml"),
        "ignore_cache = false\n[cost_limits]\nmax_total_cost = 5.0\n",
    )
    .unwrap();

    env::set_var("ENRICH_MAX_TOTAL_COST", "1.25");
    env::set_var("ENRICH_IGNORE_CACHE", "true");
    let c = load_default().unwrap();
    assert_eq!(c.cost_limits.max_total_cost, 1.25);
    assert!(c.ignore_cache);

    // unparsable value keeps the file's setting
    env::set_var("ENRICH_MAX_TOTAL_COST", "lots");
    assert_eq!(load_default().unwrap().cost_limits.max_total_cost, 5.0);

    env::remove_var("ENRICH_MAX_TOTAL_COST");
    env::remove_var("ENRICH_IGNORE_CACHE");
    env::set_current_dir(&old).unwrap();
}
