// src/sources/web_page.rs
//! Configurable HTML page source (news archives, obituary sites, reference
//! pages). The page is fetched with the stored login session for its domain,
//! checked for access blocks, and death sentences are extracted from the
//! visible text. The same extraction runs on archived copies.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::captcha::{classify_response, ResponseClass};
use crate::error::{LookupError, LookupResult, SessionError};
use crate::session::{SessionManager, StoredCookie};
use crate::source::{FetchContext, Source, SourceAnswer};
use crate::text::{html_to_text, normalize_key, normalize_text, sentences};
use crate::types::{
    DeathFields, EnrichmentPayload, EnrichmentSubject, ReliabilityTier, SourceCategory,
    SourceDescriptor,
};

/// Sentences kept as circumstances.
const MAX_SENTENCES: usize = 3;

static RE_DEATH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(died|dies|death|passed away|was killed|was found dead|succumbed)\b")
        .expect("static regex")
});
static RE_CAUSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(?:died (?:of|from)|succumbed to|cause of death was|death was caused by|due to) (?:an? |complications (?:of|from) )?([a-z][a-z '\-]{2,60}?)(?:\s+(?:at|in|on|after|while|aged|surrounded)\b|[,.;!]|$)",
    )
    .expect("static regex")
});
static RE_LOCATION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?:died|Died|passed away|was killed|was found dead)[^.]*?\b(?:in|at) ([A-Z][A-Za-z.'\-]+(?:,? [A-Z][A-Za-z.'\-]+){0,3})",
    )
    .expect("static regex")
});

const MANNER_RULES: &[(&str, &[&str])] = &[
    ("suicide", &["suicide", "took his own life", "took her own life", "took their own life"]),
    ("homicide", &["homicide", "murdered", "was shot dead", "stabbed to death"]),
    ("accident", &["accident", "crash", "accidental", "drowned"]),
    ("natural", &["natural causes", "after a long illness", "after a battle with"]),
];

fn default_tier() -> ReliabilityTier {
    ReliabilityTier::TradePress
}
fn default_category() -> SourceCategory {
    SourceCategory::News
}
fn default_max_confidence() -> f64 {
    0.8
}

/// One configured page source, as listed under `web_sources` in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebPageConfig {
    pub source_type: String,
    pub name: String,
    /// `{name}` (url-encoded), `{name_slug}` and `{death_year}` are substituted.
    pub url_template: String,
    #[serde(default = "default_tier")]
    pub tier: ReliabilityTier,
    #[serde(default = "default_category")]
    pub category: SourceCategory,
    #[serde(default)]
    pub cost_per_query: f64,
    #[serde(default)]
    pub min_delay_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_hours: Option<u64>,
    #[serde(default = "default_max_confidence")]
    pub max_confidence: f64,
    /// Domain whose stored login session is sent with each request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_domain: Option<String>,
    /// Without a live session the source is skipped for the subject.
    #[serde(default)]
    pub require_session: bool,
}

impl WebPageConfig {
    fn descriptor(&self) -> SourceDescriptor {
        SourceDescriptor::new(&self.source_type, &self.name, self.tier, self.category)
            .cost(self.cost_per_query)
            .min_delay(Duration::from_millis(self.min_delay_ms))
            .cache_ttl(self.cache_ttl_hours.map(|h| Duration::from_secs(h * 3600)))
            .max_confidence(self.max_confidence)
    }
}

pub struct WebPageSource {
    config: WebPageConfig,
    descriptor: SourceDescriptor,
    sessions: Option<Arc<SessionManager>>,
}

impl WebPageSource {
    pub fn new(config: WebPageConfig) -> Self {
        let descriptor = config.descriptor();
        Self {
            config,
            descriptor,
            sessions: None,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn url_for(&self, subject: &EnrichmentSubject) -> String {
        let year = subject
            .death_date
            .map(|d| d.year().to_string())
            .unwrap_or_default();
        self.config
            .url_template
            .replace("{name}", &urlencoding::encode(subject.name.trim()))
            .replace("{name_slug}", &normalize_key(&subject.name).replace(' ', "-"))
            .replace("{death_year}", &year)
    }

    fn client(&self, ctx: &FetchContext) -> LookupResult<reqwest::Client> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        if let (Some(domain), Some(sessions)) = (&self.config.session_domain, &self.sessions) {
            if sessions.apply_session_to_context(domain, jar.as_ref()) {
                debug!(target: "enrich::session", source = %self.config.source_type, domain, "session applied");
            }
        }
        reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .cookie_provider(jar)
            .connect_timeout(Duration::from_secs(5))
            .timeout(ctx.timeout)
            .build()
            .map_err(|e| LookupError::Unavailable(format!("http client: {e}")))
    }

    /// Keep the login state after a successful fetch: cookies the site just
    /// issued replace stored ones of the same name, otherwise the stored
    /// session is only touched.
    fn remember_session(&self, issued: Vec<StoredCookie>) {
        let (Some(domain), Some(sessions)) = (&self.config.session_domain, &self.sessions) else {
            return;
        };
        if issued.is_empty() {
            sessions.touch_session(domain);
            return;
        }
        let existing = sessions.load_session(domain);
        let identity = existing.as_ref().and_then(|r| r.login_identity.clone());
        let mut cookies: Vec<StoredCookie> = existing
            .map(|r| r.cookies)
            .unwrap_or_default()
            .into_iter()
            .filter(|old| !issued.iter().any(|c| c.name == old.name && c.path == old.path))
            .collect();
        cookies.extend(issued);
        match sessions.save_session(domain, &cookies, identity.as_deref()) {
            Ok(rec) => debug!(target: "enrich::session", domain = %rec.domain, cookies = rec.cookies.len(), "session stored"),
            Err(SessionError::EmptyCookieSet(d)) => {
                debug!(target: "enrich::session", domain = %d, "no cookies for session domain")
            }
            Err(e) => warn!(target: "enrich::session", domain, error = %e, "session not stored"),
        }
    }
}

/// Cookies set by the response, with the request host standing in for a
/// missing `Domain` attribute.
fn issued_cookies(resp: &reqwest::Response) -> Vec<StoredCookie> {
    let host = resp.url().host_str().unwrap_or_default().to_string();
    resp.cookies()
        .map(|c| StoredCookie {
            name: c.name().to_string(),
            value: c.value().to_string(),
            domain: c.domain().map(str::to_string).unwrap_or_else(|| host.clone()),
            path: c.path().unwrap_or("/").to_string(),
            expires: c.expires().map(DateTime::<Utc>::from),
            secure: c.secure(),
            http_only: c.http_only(),
        })
        .collect()
}

fn detect_manner(text: &str) -> Option<String> {
    let lower = text.to_lowercase();
    MANNER_RULES
        .iter()
        .find(|(_, cues)| cues.iter().any(|c| lower.contains(c)))
        .map(|(manner, _)| manner.to_string())
}

/// Death-related facts from the visible text of a page about `subject`.
pub fn extract_death_fields(subject: &EnrichmentSubject, html: &str) -> Option<DeathFields> {
    let text = html_to_text(html);
    let text_key = normalize_key(&text);
    let name_key = normalize_key(&subject.name);
    let surname = name_key.split(' ').last().unwrap_or_default();
    if surname.is_empty() || !format!(" {text_key} ").contains(&format!(" {surname} ")) {
        return None;
    }

    let death_sentences: Vec<String> = sentences(&text)
        .into_iter()
        .filter(|s| RE_DEATH.is_match(s))
        .take(MAX_SENTENCES)
        .collect();
    if death_sentences.is_empty() {
        return None;
    }
    let joined = death_sentences.join(" ");

    let cause = RE_CAUSE
        .captures(&joined)
        .and_then(|c| c.get(1))
        .map(|m| normalize_text(m.as_str()))
        .filter(|c| !c.is_empty());
    let location = RE_LOCATION
        .captures(&joined)
        .and_then(|c| c.get(1))
        .map(|m| normalize_text(m.as_str().trim_end_matches(['.', ','])));

    Some(DeathFields {
        circumstances: Some(normalize_text(&joined)),
        cause,
        manner: detect_manner(&joined),
        location,
        ..Default::default()
    })
}

#[async_trait]
impl Source for WebPageSource {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    fn is_available(&self) -> bool {
        let t = &self.config.url_template;
        t.starts_with("http") && (t.contains("{name}") || t.contains("{name_slug}"))
    }

    fn check_preconditions(&self, subject: &EnrichmentSubject) -> LookupResult<()> {
        if subject.name.trim().is_empty() {
            return Err(LookupError::PreconditionFailed("subject has no name".into()));
        }
        if self.config.url_template.contains("{death_year}") && subject.death_date.is_none() {
            return Err(LookupError::PreconditionFailed("death year required".into()));
        }
        if self.config.require_session {
            let live = match (&self.config.session_domain, &self.sessions) {
                (Some(domain), Some(sessions)) => sessions.load_session(domain).is_some(),
                _ => false,
            };
            if !live {
                return Err(LookupError::PreconditionFailed("no live login session".into()));
            }
        }
        Ok(())
    }

    fn query_text(&self, subject: &EnrichmentSubject) -> String {
        self.url_for(subject)
    }

    async fn fetch(&self, subject: &EnrichmentSubject, ctx: &FetchContext) -> LookupResult<SourceAnswer> {
        let url = self.url_for(subject);
        let client = self.client(ctx)?;
        let resp = client.get(&url).send().await?;
        let status = resp.status().as_u16();
        let issued = issued_cookies(&resp);
        let body = resp.text().await?;

        match classify_response(status, &body) {
            ResponseClass::Ok => {
                self.remember_session(issued);
                self.extract_from_page(subject, &url, &body)
            }
            ResponseClass::Blocked(captcha) => {
                if status == 401 {
                    if let (Some(domain), Some(sessions)) = (&self.config.session_domain, &self.sessions) {
                        info!(target: "enrich::session", domain, "login rejected, dropping session");
                        sessions.invalidate_session(domain);
                    }
                }
                Err(LookupError::AccessBlocked {
                    url: Some(url),
                    status: Some(status),
                    captcha,
                })
            }
            ResponseClass::NotFound => Err(LookupError::no_data(format!("{url} not found"))),
            ResponseClass::Transient(msg) => Err(LookupError::Transient(msg)),
        }
    }

    fn extract_from_page(
        &self,
        subject: &EnrichmentSubject,
        url: &str,
        body: &str,
    ) -> LookupResult<SourceAnswer> {
        let fields = extract_death_fields(subject, body)
            .ok_or_else(|| LookupError::no_data(format!("no death details for {} at {url}", subject.name)))?;
        let raw = fields.circumstances.clone().unwrap_or_default();
        let payload = EnrichmentPayload {
            fields,
            source_url: Some(url.to_string()),
        };
        Ok(SourceAnswer::new(payload, raw))
    }

    fn confidence(&self, subject: &EnrichmentSubject, answer: &SourceAnswer) -> f64 {
        let f = &answer.payload.fields;
        let mut c = 0.45;
        if f.cause.is_some() {
            c += 0.15;
        }
        if f.location.is_some() {
            c += 0.05;
        }
        let full_name = normalize_key(&subject.name);
        if normalize_key(&answer.raw_response).contains(&full_name) {
            c += 0.1;
        }
        if let Some(d) = subject.death_date {
            if answer.raw_response.contains(&d.year().to_string()) {
                c += 0.05;
            }
        }
        c
    }
}
