// src/session.rs
//! Per-domain login sessions persisted as JSON under a session directory.
//!
//! A session expires `ttl` after it was created, however recently it was
//! used; `touch_session` only records `last_used_at`. Expired files are
//! deleted on read. All I/O failures are logged and behave like a miss.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::SessionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    /// Cookie domain as sent by the server (may carry a leading dot).
    pub domain: String,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
}

fn default_path() -> String {
    "/".to_string()
}

impl StoredCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: default_path(),
            expires: None,
            secure: false,
            http_only: false,
        }
    }

    /// `Set-Cookie` style rendering, for cookie stores that only take strings.
    pub fn to_header(&self) -> String {
        let mut s = format!(
            "{}={}; Domain={}; Path={}",
            self.name,
            self.value,
            self.domain.trim_start_matches('.'),
            self.path
        );
        if let Some(exp) = self.expires {
            s.push_str(&format!("; Expires={}", exp.format("%a, %d %b %Y %H:%M:%S GMT")));
        }
        if self.secure {
            s.push_str("; Secure");
        }
        if self.http_only {
            s.push_str("; HttpOnly");
        }
        s
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub domain: String,
    pub cookies: Vec<StoredCookie>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_identity: Option<String>,
}

/// Anything that can receive cookies before a request is made.
pub trait CookieContext {
    fn add_cookie(&self, domain: &str, cookie: &StoredCookie);
}

impl CookieContext for reqwest::cookie::Jar {
    fn add_cookie(&self, domain: &str, cookie: &StoredCookie) {
        let origin = format!("https://{domain}/");
        match reqwest::Url::parse(&origin) {
            Ok(url) => self.add_cookie_str(&cookie.to_header(), &url),
            Err(e) => warn!(target: "enrich::session", domain, error = %e, "bad cookie origin"),
        }
    }
}

/// Lowercase, trim the trailing dot and a leading `www.`, then validate the
/// characters so the result is safe as a file name.
pub fn normalize_domain(domain: &str) -> Result<String, SessionError> {
    let d = domain.trim().to_ascii_lowercase();
    let d = d.trim_end_matches('.');
    let d = d.strip_prefix("www.").unwrap_or(d);
    let valid = !d.is_empty()
        && d.len() <= 253
        && !d.starts_with('.')
        && !d.starts_with('-')
        && !d.contains("..")
        && d
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    if valid {
        Ok(d.to_string())
    } else {
        Err(SessionError::InvalidDomain(domain.to_string()))
    }
}

/// A cookie belongs to a session domain when the two are equal or one is a
/// dot-suffix of the other (so `.example.com` and `login.example.com` both
/// match `example.com`).
fn cookie_matches(cookie_domain: &str, session_domain: &str) -> bool {
    let c = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    let c = c.strip_prefix("www.").unwrap_or(&c);
    c == session_domain
        || c.ends_with(&format!(".{session_domain}"))
        || session_domain.ends_with(&format!(".{c}"))
}

pub struct SessionManager {
    dir: PathBuf,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn path_for(&self, normalized: &str) -> PathBuf {
        self.dir.join(format!("{normalized}.json"))
    }

    fn is_expired(&self, rec: &SessionRecord, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - rec.created_at > ttl,
            Err(_) => false,
        }
    }

    fn read(&self, normalized: &str) -> Result<Option<SessionRecord>, SessionError> {
        let path = self.path_for(normalized);
        let s = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&s)?))
    }

    fn write(&self, rec: &SessionRecord) -> Result<(), SessionError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&rec.domain);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(rec)?;
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&json)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Live session for `domain`. Expired sessions are deleted; unreadable
    /// ones are logged and treated as absent.
    pub fn load_session(&self, domain: &str) -> Option<SessionRecord> {
        let normalized = match normalize_domain(domain) {
            Ok(d) => d,
            Err(e) => {
                warn!(target: "enrich::session", error = %e, "load skipped");
                return None;
            }
        };
        let rec = match self.read(&normalized) {
            Ok(Some(rec)) => rec,
            Ok(None) => return None,
            Err(e) => {
                warn!(target: "enrich::session", domain = %normalized, error = %e, "session unreadable");
                return None;
            }
        };
        if self.is_expired(&rec, Utc::now()) {
            info!(target: "enrich::session", domain = %normalized, "session expired, deleting");
            let _ = fs::remove_file(self.path_for(&normalized));
            return None;
        }
        Some(rec)
    }

    /// Persist the cookies that belong to `domain`. Cookies for other domains
    /// are dropped; an empty result is refused.
    pub fn save_session(
        &self,
        domain: &str,
        cookies: &[StoredCookie],
        login_identity: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        let normalized = normalize_domain(domain)?;
        let kept: Vec<StoredCookie> = cookies
            .iter()
            .filter(|c| cookie_matches(&c.domain, &normalized))
            .cloned()
            .collect();
        if kept.is_empty() {
            return Err(SessionError::EmptyCookieSet(normalized));
        }
        let now = Utc::now();
        let rec = SessionRecord {
            domain: normalized,
            cookies: kept,
            created_at: now,
            last_used_at: now,
            login_identity: login_identity.map(str::to_string),
        };
        self.write(&rec)?;
        debug!(target: "enrich::session", domain = %rec.domain, cookies = rec.cookies.len(), "session saved");
        Ok(rec)
    }

    /// Load the session for `domain` into `ctx`. Returns whether one was applied.
    pub fn apply_session_to_context(&self, domain: &str, ctx: &dyn CookieContext) -> bool {
        let Some(rec) = self.load_session(domain) else {
            return false;
        };
        let now = Utc::now();
        let mut applied = 0;
        for c in rec.cookies.iter().filter(|c| c.expires.map_or(true, |e| e > now)) {
            ctx.add_cookie(&rec.domain, c);
            applied += 1;
        }
        applied > 0
    }

    /// Mark the session as just used.
    pub fn touch_session(&self, domain: &str) {
        let Some(mut rec) = self.load_session(domain) else {
            return;
        };
        rec.last_used_at = Utc::now();
        if let Err(e) = self.write(&rec) {
            warn!(target: "enrich::session", domain = %rec.domain, error = %e, "touch failed");
        }
    }

    /// Forget the session, e.g. after the site rejected it.
    pub fn invalidate_session(&self, domain: &str) {
        let Ok(normalized) = normalize_domain(domain) else {
            return;
        };
        match fs::remove_file(self.path_for(&normalized)) {
            Ok(()) => info!(target: "enrich::session", domain = %normalized, "session invalidated"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(target: "enrich::session", domain = %normalized, error = %e, "invalidate failed"),
        }
    }

    /// Delete every expired or unreadable session file. Returns how many were removed.
    pub fn clear_expired_sessions(&self) -> usize {
        let Ok(rd) = fs::read_dir(&self.dir) else {
            return 0;
        };
        let now = Utc::now();
        let mut removed = 0;
        for path in rd.filter_map(|de| de.ok()).map(|de| de.path()) {
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            let stale = match fs::read_to_string(&path)
                .ok()
                .and_then(|s| serde_json::from_str::<SessionRecord>(&s).ok())
            {
                Some(rec) => self.is_expired(&rec, now),
                None => true,
            };
            if stale && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(target: "enrich::session", removed, "expired sessions cleared");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct Recorder(RefCell<Vec<String>>);

    impl CookieContext for Recorder {
        fn add_cookie(&self, domain: &str, cookie: &StoredCookie) {
            self.0.borrow_mut().push(format!("{domain}:{}", cookie.name));
        }
    }

    #[test]
    fn domains_normalize_and_reject_traversal() {
        assert_eq!(normalize_domain("WWW.Example.com.").unwrap(), "example.com");
        assert!(normalize_domain("../etc/passwd").is_err());
        assert!(normalize_domain("a..b.com").is_err());
        assert!(normalize_domain(".example.com").is_err());
        assert!(normalize_domain("").is_err());
    }

    #[test]
    fn save_filters_foreign_cookies_and_refuses_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let sm = SessionManager::new(tmp.path(), Duration::from_secs(3600));
        let cookies = vec![
            StoredCookie::new("sid", "1", ".example.com"),
            StoredCookie::new("pref", "2", "login.example.com"),
            StoredCookie::new("track", "3", "ads.other.net"),
        ];
        let rec = sm.save_session("www.example.com", &cookies, Some("me")).unwrap();
        assert_eq!(rec.cookies.len(), 2);
        assert!(tmp.path().join("example.com.json").exists());

        let err = sm
            .save_session("example.org", &cookies, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::EmptyCookieSet(_)));
    }

    #[test]
    fn apply_and_invalidate() {
        let tmp = tempfile::tempdir().unwrap();
        let sm = SessionManager::new(tmp.path(), Duration::from_secs(3600));
        sm.save_session("example.com", &[StoredCookie::new("sid", "1", "example.com")], None)
            .unwrap();
        let rec = Recorder::default();
        assert!(sm.apply_session_to_context("example.com", &rec));
        assert_eq!(rec.0.borrow().as_slice(), ["example.com:sid"]);

        sm.invalidate_session("example.com");
        assert!(sm.load_session("example.com").is_none());
    }

    #[test]
    fn expired_session_is_deleted_on_load() {
        let tmp = tempfile::tempdir().unwrap();
        let sm = SessionManager::new(tmp.path(), Duration::from_secs(3600));
        let old = Utc::now() - chrono::Duration::hours(2);
        let rec = SessionRecord {
            domain: "example.com".into(),
            cookies: vec![StoredCookie::new("sid", "1", "example.com")],
            created_at: old,
            last_used_at: old,
            login_identity: None,
        };
        fs::write(
            tmp.path().join("example.com.json"),
            serde_json::to_string(&rec).unwrap(),
        )
        .unwrap();
        assert!(sm.load_session("example.com").is_none());
        assert!(!tmp.path().join("example.com.json").exists());
    }

    #[test]
    fn recent_use_does_not_extend_lifetime() {
        let tmp = tempfile::tempdir().unwrap();
        let sm = SessionManager::new(tmp.path(), Duration::from_secs(24 * 3600));
        let rec = SessionRecord {
            domain: "example.com".into(),
            cookies: vec![StoredCookie::new("sid", "1", "example.com")],
            created_at: Utc::now() - chrono::Duration::hours(48),
            last_used_at: Utc::now(),
            login_identity: None,
        };
        let path = tmp.path().join("example.com.json");
        fs::write(&path, serde_json::to_string(&rec).unwrap()).unwrap();

        sm.touch_session("example.com");
        assert!(sm.load_session("example.com").is_none());
        assert!(!path.exists());
    }

    #[test]
    fn touch_keeps_created_at() {
        let tmp = tempfile::tempdir().unwrap();
        let sm = SessionManager::new(tmp.path(), Duration::from_secs(3600));
        let saved = sm
            .save_session("example.com", &[StoredCookie::new("sid", "1", "example.com")], None)
            .unwrap();
        sm.touch_session("example.com");
        let loaded = sm.load_session("example.com").unwrap();
        assert_eq!(loaded.created_at, saved.created_at);
        assert!(loaded.last_used_at >= saved.last_used_at);
    }

    #[test]
    fn clear_expired_keeps_fresh_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let sm = SessionManager::new(tmp.path(), Duration::from_secs(3600));
        sm.save_session("fresh.com", &[StoredCookie::new("a", "1", "fresh.com")], None)
            .unwrap();
        fs::write(tmp.path().join("broken.com.json"), "nope").unwrap();
        assert_eq!(sm.clear_expired_sessions(), 1);
        assert!(sm.load_session("fresh.com").is_some());
    }
}
