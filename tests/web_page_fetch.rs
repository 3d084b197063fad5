// tests/web_page_fetch.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use death_enrichment::captcha::CaptchaVendor;
use death_enrichment::session::{SessionManager, StoredCookie};
use death_enrichment::source::FetchContext;
use death_enrichment::sources::{WebPageConfig, WebPageSource};
use death_enrichment::types::{EnrichmentSubject, ReliabilityTier, SourceCategory};
use death_enrichment::{LookupError, Source};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const OBITUARY: &str = "<html><body><article><h1>Jane Doe, 71</h1>\
    <p>Jane Doe, the actress, died of lung cancer in Los Angeles on May 3, 2001.</p>\
    <p>She had starred in forty films.</p></article></body></html>";

fn http(status: &str, headers: &[&str], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status}\r\nContent-Type: text/html\r\nConnection: close\r\n");
    for h in headers {
        out.push_str(h);
        out.push_str("\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    out
}

/// Local server answering every request with `response`. Returns its base URL.
async fn fixture_server(response: String) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let resp = response.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });
    format!("http://{addr}")
}

fn source(base: &str, sessions: Option<Arc<SessionManager>>) -> WebPageSource {
    let cfg = WebPageConfig {
        source_type: "obits".into(),
        name: "Obits".into(),
        url_template: format!("{base}/obituary/{{name_slug}}"),
        tier: ReliabilityTier::TradePress,
        category: SourceCategory::Obituary,
        cost_per_query: 0.0,
        min_delay_ms: 0,
        cache_ttl_hours: None,
        max_confidence: 0.8,
        session_domain: sessions.as_ref().map(|_| "127.0.0.1".to_string()),
        require_session: false,
    };
    let src = WebPageSource::new(cfg);
    match sessions {
        Some(s) => src.with_sessions(s),
        None => src,
    }
}

fn jane() -> EnrichmentSubject {
    EnrichmentSubject::new("1", "Jane Doe").died(NaiveDate::from_ymd_opt(2001, 5, 3).unwrap())
}

fn ctx() -> FetchContext {
    FetchContext {
        timeout: Duration::from_secs(5),
        cancel: CancellationToken::new(),
    }
}

#[tokio::test]
async fn forbidden_page_is_blocked_with_its_url() {
    let base = fixture_server(http("403 Forbidden", &[], "Forbidden")).await;
    let src = source(&base, None);

    let err = src.fetch(&jane(), &ctx()).await.unwrap_err();
    match err {
        LookupError::AccessBlocked { url, status, captcha } => {
            assert_eq!(url.as_deref(), Some(format!("{base}/obituary/jane-doe").as_str()));
            assert_eq!(status, Some(403));
            assert!(captcha.is_none());
        }
        other => panic!("expected AccessBlocked, got {other:?}"),
    }
}

#[tokio::test]
async fn captcha_page_with_ok_status_is_blocked() {
    let body = r#"<html><body><form action="/verify">
        <div class="g-recaptcha" data-sitekey="6LcXAbCdEfGhIjKlMnOpQrStUvWxYz0123456789"></div>
        </form></body></html>"#;
    let base = fixture_server(http("200 OK", &[], body)).await;

    let err = source(&base, None).fetch(&jane(), &ctx()).await.unwrap_err();
    match err {
        LookupError::AccessBlocked { url, status, captcha } => {
            assert!(url.unwrap().ends_with("/obituary/jane-doe"));
            assert_eq!(status, Some(200));
            let captcha = captcha.expect("captcha details");
            assert_eq!(captcha.vendor, Some(CaptchaVendor::Recaptcha));
            assert_eq!(
                captcha.site_key.as_deref(),
                Some("6LcXAbCdEfGhIjKlMnOpQrStUvWxYz0123456789")
            );
        }
        other => panic!("expected AccessBlocked, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_login_drops_the_stored_session() {
    let tmp = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionManager::new(tmp.path(), Duration::from_secs(3600)));
    sessions
        .save_session("127.0.0.1", &[StoredCookie::new("sid", "stale", "127.0.0.1")], None)
        .unwrap();
    let base = fixture_server(http("401 Unauthorized", &[], "Login required")).await;

    let err = source(&base, Some(sessions.clone()))
        .fetch(&jane(), &ctx())
        .await
        .unwrap_err();

    assert!(matches!(err, LookupError::AccessBlocked { status: Some(401), .. }));
    assert!(sessions.load_session("127.0.0.1").is_none());
    assert!(!tmp.path().join("127.0.0.1.json").exists());
}

#[tokio::test]
async fn successful_fetch_stores_issued_cookies() {
    let tmp = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionManager::new(tmp.path(), Duration::from_secs(3600)));
    let base = fixture_server(http(
        "200 OK",
        &["Set-Cookie: sid=abc123; Path=/; HttpOnly"],
        OBITUARY,
    ))
    .await;

    let answer = source(&base, Some(sessions.clone()))
        .fetch(&jane(), &ctx())
        .await
        .unwrap();
    assert_eq!(answer.payload.fields.cause.as_deref(), Some("lung cancer"));

    let rec = sessions.load_session("127.0.0.1").expect("session created");
    assert_eq!(rec.cookies.len(), 1);
    assert_eq!(rec.cookies[0].name, "sid");
    assert_eq!(rec.cookies[0].value, "abc123");
    assert!(rec.cookies[0].http_only);
}

#[tokio::test]
async fn fresh_cookie_replaces_stored_one_and_keeps_identity() {
    let tmp = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionManager::new(tmp.path(), Duration::from_secs(3600)));
    sessions
        .save_session(
            "127.0.0.1",
            &[
                StoredCookie::new("sid", "old", "127.0.0.1"),
                StoredCookie::new("pref", "dark", "127.0.0.1"),
            ],
            Some("reader@example.com"),
        )
        .unwrap();
    let base = fixture_server(http("200 OK", &["Set-Cookie: sid=new; Path=/"], OBITUARY)).await;

    source(&base, Some(sessions.clone()))
        .fetch(&jane(), &ctx())
        .await
        .unwrap();

    let rec = sessions.load_session("127.0.0.1").unwrap();
    assert_eq!(rec.login_identity.as_deref(), Some("reader@example.com"));
    let mut values: Vec<(String, String)> = rec
        .cookies
        .iter()
        .map(|c| (c.name.clone(), c.value.clone()))
        .collect();
    values.sort();
    assert_eq!(
        values,
        vec![("pref".to_string(), "dark".to_string()), ("sid".to_string(), "new".to_string())]
    );
}
