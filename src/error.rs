//! Typed errors for source lookups and session persistence.
//!
//! Library code returns these; `anyhow` is only used at the edges
//! (configuration loading and the binary).

use thiserror::Error;

use crate::captcha::CaptchaDetectionResult;
use crate::types::{BlockedAccess, FailureKind};

/// Which ceiling refused a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostScope {
    Subject,
    Run,
}

/// Everything a single source attempt can fail with.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    /// Missing credentials or configuration. Permanent for the whole run.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The subject lacks something this source needs (e.g. a death date).
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// The source answered but had nothing for this subject.
    #[error("no data found: {0}")]
    NoDataFound(String),

    /// Network error, timeout, upstream rate limit. Retried only by the caller's job policy.
    #[error("transient error: {0}")]
    Transient(String),

    /// HTTP 403-class refusal or a CAPTCHA page.
    #[error("access blocked at {}", .url.as_deref().unwrap_or("<unknown url>"))]
    AccessBlocked {
        url: Option<String>,
        status: Option<u16>,
        captcha: Option<CaptchaDetectionResult>,
    },

    /// A spend ceiling would be crossed by this attempt.
    #[error("cost limit exceeded ({scope:?})")]
    CostLimitExceeded { scope: CostScope },

    #[error("cancelled")]
    Cancelled,
}

impl LookupError {
    pub fn kind(&self) -> FailureKind {
        match self {
            LookupError::Unavailable(_) => FailureKind::Unavailable,
            LookupError::PreconditionFailed(_) => FailureKind::PreconditionFailed,
            LookupError::NoDataFound(_) => FailureKind::NoDataFound,
            LookupError::Transient(_) => FailureKind::Transient,
            LookupError::AccessBlocked { .. } => FailureKind::AccessBlocked,
            LookupError::CostLimitExceeded { .. } => FailureKind::CostLimitExceeded,
            LookupError::Cancelled => FailureKind::Cancelled,
        }
    }

    pub fn no_data(msg: impl Into<String>) -> Self {
        LookupError::NoDataFound(msg.into())
    }

    pub fn transient(msg: impl std::fmt::Display) -> Self {
        LookupError::Transient(msg.to_string())
    }

    pub fn blocked(url: impl Into<String>, status: Option<u16>) -> Self {
        LookupError::AccessBlocked {
            url: Some(url.into()),
            status,
            captcha: None,
        }
    }

    pub fn blocked_access(&self) -> Option<BlockedAccess> {
        match self {
            LookupError::AccessBlocked {
                url,
                status,
                captcha,
            } => Some(BlockedAccess {
                url: url.clone(),
                status: *status,
                captcha: captcha.clone(),
            }),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            let url = e.url().map(|u| u.to_string());
            return match status.as_u16() {
                401 | 403 => LookupError::AccessBlocked {
                    url,
                    status: Some(status.as_u16()),
                    captcha: None,
                },
                404 | 410 => LookupError::NoDataFound(format!("http {status}")),
                _ => LookupError::Transient(format!("http {status}")),
            };
        }
        if e.is_timeout() {
            return LookupError::Transient("request timed out".into());
        }
        LookupError::Transient(e.to_string())
    }
}

pub type LookupResult<T> = std::result::Result<T, LookupError>;

/// Session persistence failures. Callers log these and treat them as misses.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid session domain: {0:?}")]
    InvalidDomain(String),

    #[error("refusing to store an empty cookie set for {0}")]
    EmptyCookieSet(String),

    #[error("session io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_one_to_one() {
        assert_eq!(
            LookupError::no_data("x").kind(),
            FailureKind::NoDataFound
        );
        assert_eq!(
            LookupError::blocked("https://a.example/x", Some(403)).kind(),
            FailureKind::AccessBlocked
        );
        assert_eq!(
            LookupError::CostLimitExceeded {
                scope: CostScope::Run
            }
            .kind(),
            FailureKind::CostLimitExceeded
        );
    }

    #[test]
    fn blocked_display_names_url() {
        let e = LookupError::blocked("https://a.example/x", Some(403));
        assert_eq!(e.to_string(), "access blocked at https://a.example/x");
        let b = e.blocked_access().unwrap();
        assert_eq!(b.status, Some(403));
    }
}
