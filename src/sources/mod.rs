// src/sources/mod.rs
pub mod openai;
pub mod web_page;
pub mod wikidata;

use std::sync::Arc;

use tracing::warn;

use crate::config::EnrichmentConfig;
use crate::session::SessionManager;
use crate::source::Source;

pub use openai::OpenAiSource;
pub use web_page::{WebPageConfig, WebPageSource};
pub use wikidata::WikidataSource;

/// The reference source set described by `config`. Sources that fail to
/// build are logged and left out; unavailable ones are filtered later by the
/// orchestrator.
pub fn build_sources(
    config: &EnrichmentConfig,
    sessions: Option<Arc<SessionManager>>,
) -> Vec<Arc<dyn Source>> {
    let mut out: Vec<Arc<dyn Source>> = Vec::new();

    match WikidataSource::new(config.request_timeout()) {
        Ok(s) => out.push(Arc::new(s)),
        Err(e) => warn!(target: "enrich", error = %e, "wikidata source disabled"),
    }

    for web in &config.web_sources {
        let mut src = WebPageSource::new(web.clone());
        if let Some(sessions) = &sessions {
            src = src.with_sessions(sessions.clone());
        }
        out.push(Arc::new(src));
    }

    match OpenAiSource::from_env() {
        Ok(s) => out.push(Arc::new(s)),
        Err(e) => warn!(target: "enrich", error = %e, "openai source disabled"),
    }
    out
}
