// src/archive.rs
//! Web-archive fallback for pages that refused direct access.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{LookupError, LookupResult};

const WAYBACK_PREFIX: &str = "https://web.archive.org/web/2id_/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPage {
    pub original_url: String,
    pub archive_url: String,
    pub body: String,
}

/// One archive lookup per call. No retries.
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch_archived(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> LookupResult<ArchivedPage>;
}

/// Latest Wayback Machine snapshot, raw (`id_`) so the toolbar is not injected.
pub struct WaybackArchive {
    http: reqwest::Client,
}

impl WaybackArchive {
    pub fn new(timeout: Duration) -> LookupResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(Duration::from_secs(5))
            .timeout(timeout)
            .build()
            .map_err(|e| LookupError::Unavailable(format!("archive client: {e}")))?;
        Ok(Self { http })
    }

    pub fn snapshot_url(url: &str) -> String {
        format!("{WAYBACK_PREFIX}{url}")
    }

    async fn fetch_once(&self, url: &str) -> LookupResult<ArchivedPage> {
        let archive_url = Self::snapshot_url(url);
        let resp = self.http.get(&archive_url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LookupError::no_data(format!("archive returned {status}")));
        }
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Err(LookupError::no_data("archive snapshot is empty"));
        }
        debug!(target: "enrich::source", %archive_url, bytes = body.len(), "archive snapshot fetched");
        Ok(ArchivedPage {
            original_url: url.to_string(),
            archive_url,
            body,
        })
    }
}

#[async_trait]
impl ArchiveFetcher for WaybackArchive {
    async fn fetch_archived(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> LookupResult<ArchivedPage> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LookupError::Cancelled),
            res = self.fetch_once(url) => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_url_keeps_original() {
        assert_eq!(
            WaybackArchive::snapshot_url("https://news.example/obit/1"),
            "https://web.archive.org/web/2id_/https://news.example/obit/1"
        );
    }

    #[tokio::test]
    async fn cancelled_before_fetch() {
        let a = WaybackArchive::new(Duration::from_secs(1)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let r = a.fetch_archived("https://example.invalid/", &cancel).await;
        assert!(matches!(r, Err(LookupError::Cancelled)));
    }
}
