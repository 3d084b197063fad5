//! Access-block detection: recognizes CAPTCHA and bot-challenge pages.
//!
//! Checks run in priority order and the first positive match wins:
//! 1. challenge-service signatures inside `<script>` content or script URLs,
//! 2. per-vendor CSS/structural markers,
//! 3. a soft heuristic: very little visible text *and* challenge wording.
//!
//! Sparse pages without a signature or challenge wording are never flagged.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::text::html_to_text;

/// Visible-text length under which challenge wording alone counts as a block.
const SOFT_TEXT_LIMIT: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaVendor {
    Recaptcha,
    Hcaptcha,
    Turnstile,
    CloudflareChallenge,
    DataDome,
    PerimeterX,
    AkamaiBotManager,
    GeeTest,
    FunCaptcha,
    Unknown,
}

/// Transient detection result, consumed right away to pick a retry strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptchaDetectionResult {
    pub detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<CaptchaVendor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_cookie: Option<String>,
}

impl CaptchaDetectionResult {
    pub fn clear() -> Self {
        Self::default()
    }

    fn found(vendor: CaptchaVendor) -> Self {
        Self {
            detected: true,
            vendor: Some(vendor),
            ..Default::default()
        }
    }
}

// Script-embedded challenge services. Matched before markup because these can
// appear with no visible element at all.
const SCRIPT_SIGNATURES: &[(CaptchaVendor, &[&str])] = &[
    (
        CaptchaVendor::CloudflareChallenge,
        &["_cf_chl_opt", "/cdn-cgi/challenge-platform/", "cf_chl_"],
    ),
    (
        CaptchaVendor::DataDome,
        &["captcha-delivery.com", "var dd={", "var dd ="],
    ),
    (
        CaptchaVendor::PerimeterX,
        // The `_pxAppId` sensor ships on every protected page; only the
        // challenge loader marks a block.
        &["px-captcha", "captcha.px-cdn.net", "/captcha/captcha.js"],
    ),
    (
        CaptchaVendor::AkamaiBotManager,
        &["bm-verify", "/_sec/cp_challenge/"],
    ),
];

// Structural markers per vendor, checked against the lowercased document.
const MARKUP_MARKERS: &[(CaptchaVendor, &[&str])] = &[
    (
        CaptchaVendor::Hcaptcha,
        &["class=\"h-captcha", "hcaptcha.com/1/api.js", "newassets.hcaptcha.com"],
    ),
    (
        CaptchaVendor::Turnstile,
        &["cf-turnstile", "challenges.cloudflare.com/turnstile"],
    ),
    (
        CaptchaVendor::Recaptcha,
        &["g-recaptcha", "google.com/recaptcha/", "recaptcha/api.js", "recaptcha/enterprise.js"],
    ),
    (
        CaptchaVendor::PerimeterX,
        &["id=\"px-captcha\""],
    ),
    (
        CaptchaVendor::GeeTest,
        &["geetest_", "static.geetest.com"],
    ),
    (
        CaptchaVendor::FunCaptcha,
        &["funcaptcha", "arkoselabs.com"],
    ),
    (
        CaptchaVendor::CloudflareChallenge,
        &["id=\"challenge-form\"", "cf-browser-verification", "cf-challenge-running"],
    ),
];

const CHALLENGE_WORDING: &[&str] = &[
    "verify you are human",
    "verify that you are human",
    "verifying you are human",
    "security check",
    "checking your browser",
    "are you a robot",
    "not a robot",
    "unusual traffic",
    "complete the captcha",
    "press and hold",
];

static RE_SCRIPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script>").expect("script regex"));
static RE_SITEKEY_ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)data-sitekey\s*=\s*["']([^"']+)["']"#).expect("sitekey attr regex")
});
static RE_SITEKEY_SCRIPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)["']?site_?key["']?\s*[:=]\s*["']([A-Za-z0-9_\-]{8,})["']"#)
        .expect("sitekey script regex")
});
static RE_IFRAME_SRC: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<iframe\b[^>]*?\bsrc\s*=\s*["']([^"']+)["']"#).expect("iframe regex")
});
static RE_URL_KEY_PARAM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[?&#](?:k|sitekey)=([A-Za-z0-9_\-]+)").expect("url key param regex")
});
static RE_DATADOME_CID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]cid['"]\s*:\s*['"]([^'"]+)['"]"#).expect("datadome cid"));
static RE_DATADOME_HOST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"['"]host['"]\s*:\s*['"]([^'"]+)['"]"#).expect("datadome host"));

/// Inspect a fetched page and report whether it is a challenge page.
pub fn detect_captcha(html: &str) -> CaptchaDetectionResult {
    let lower = html.to_ascii_lowercase();

    // (a) script signatures
    let scripts = script_blobs(&lower);
    for (vendor, sigs) in SCRIPT_SIGNATURES {
        if scripts.iter().any(|s| sigs.iter().any(|sig| s.contains(sig))) {
            return with_vendor_details(*vendor, html);
        }
    }

    // (b) markup markers
    for (vendor, markers) in MARKUP_MARKERS {
        if markers.iter().any(|m| lower.contains(m)) {
            return with_vendor_details(*vendor, html);
        }
    }

    // (c) soft heuristic
    let visible = html_to_text(html);
    if visible.chars().count() < SOFT_TEXT_LIMIT {
        let visible_lower = visible.to_lowercase();
        if CHALLENGE_WORDING.iter().any(|w| visible_lower.contains(w)) {
            let mut res = CaptchaDetectionResult::found(CaptchaVendor::Unknown);
            res.site_key = extract_site_key(html);
            return res;
        }
    }

    CaptchaDetectionResult::clear()
}

/// Attribute and script bodies of every `<script>` element (lowercased input).
fn script_blobs(lower: &str) -> Vec<&str> {
    let mut out = Vec::new();
    for caps in RE_SCRIPT.captures_iter(lower) {
        if let Some(attrs) = caps.get(1) {
            out.push(attrs.as_str());
        }
        if let Some(body) = caps.get(2) {
            out.push(body.as_str());
        }
    }
    out
}

fn with_vendor_details(vendor: CaptchaVendor, html: &str) -> CaptchaDetectionResult {
    let mut res = CaptchaDetectionResult::found(vendor);
    res.site_key = extract_site_key(html);
    res.challenge_url = vendor_iframe(vendor, html);

    if vendor == CaptchaVendor::DataDome {
        let cid = RE_DATADOME_CID
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let host = RE_DATADOME_HOST
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        if let Some(cid) = &cid {
            let host = host.unwrap_or_else(|| "geo.captcha-delivery.com".to_string());
            res.challenge_url
                .get_or_insert_with(|| format!("https://{host}/captcha/?initialCid={cid}"));
        }
        res.vendor_cookie = cid;
    }
    res
}

/// Best-effort site key: attribute, then inline script, then iframe URL parameter.
pub fn extract_site_key(html: &str) -> Option<String> {
    if let Some(key) = RE_SITEKEY_ATTR
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|k| !k.is_empty())
    {
        return Some(key);
    }

    for caps in RE_SCRIPT.captures_iter(html) {
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        if let Some(key) = RE_SITEKEY_SCRIPT
            .captures(body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
        {
            return Some(key);
        }
    }

    RE_IFRAME_SRC
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .find_map(|src| {
            RE_URL_KEY_PARAM
                .captures(src.as_str())
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        })
}

fn vendor_iframe(vendor: CaptchaVendor, html: &str) -> Option<String> {
    let needle = match vendor {
        CaptchaVendor::Recaptcha => "recaptcha",
        CaptchaVendor::Hcaptcha => "hcaptcha",
        CaptchaVendor::Turnstile => "challenges.cloudflare.com",
        CaptchaVendor::DataDome => "captcha-delivery.com",
        CaptchaVendor::GeeTest => "geetest",
        CaptchaVendor::FunCaptcha => "arkoselabs",
        _ => return None,
    };
    RE_IFRAME_SRC
        .captures_iter(html)
        .filter_map(|c| c.get(1))
        .map(|m| html_escape::decode_html_entities(m.as_str()).to_string())
        .find(|src| src.to_ascii_lowercase().contains(needle))
}

/// How a fetched HTTP response should be treated by a page source.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseClass {
    Ok,
    Blocked(Option<CaptchaDetectionResult>),
    NotFound,
    Transient(String),
}

/// Combine the HTTP status with page inspection.
pub fn classify_response(status: u16, body: &str) -> ResponseClass {
    let captcha = detect_captcha(body);
    if captcha.detected {
        return ResponseClass::Blocked(Some(captcha));
    }
    match status {
        200..=299 => ResponseClass::Ok,
        401 | 403 => ResponseClass::Blocked(None),
        404 | 410 => ResponseClass::NotFound,
        429 => ResponseClass::Transient("upstream rate limited (429)".into()),
        s => ResponseClass::Transient(format!("unexpected http status {s}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perimeterx_sensor_alone_is_not_a_block() {
        let article = format!(
            r#"<html><head><script>window._pxAppId = 'PXabc123'; (function(){{}})();</script>
            <script src="//client.perimeterx.net/PXabc123/main.min.js"></script></head>
            <body><article>{}</article></body></html>"#,
            "Long article text about the obituary. ".repeat(60)
        );
        assert!(!detect_captcha(&article).detected);
        assert_eq!(classify_response(200, &article), ResponseClass::Ok);

        let challenge = r#"<html><head><script>window._pxAppId = 'PXabc123';</script>
            <script src="/PXabc123/captcha/captcha.js?a=c&m=0"></script></head>
            <body><div id="px-captcha"></div></body></html>"#;
        let r = detect_captcha(challenge);
        assert!(r.detected);
        assert_eq!(r.vendor, Some(CaptchaVendor::PerimeterX));
    }

    #[test]
    fn recaptcha_widget_with_attribute_key() {
        let html = r#"<html><body><form>
            <div class="g-recaptcha" data-sitekey="6LcXAbCdEfGhIjKlMnOpQrStUvWxYz0123456789"></div>
            </form></body></html>"#;
        let r = detect_captcha(html);
        assert!(r.detected);
        assert_eq!(r.vendor, Some(CaptchaVendor::Recaptcha));
        assert_eq!(
            r.site_key.as_deref(),
            Some("6LcXAbCdEfGhIjKlMnOpQrStUvWxYz0123456789")
        );
    }

    #[test]
    fn hcaptcha_key_from_iframe_param() {
        let html = r#"<iframe src="https://newassets.hcaptcha.com/captcha/v1/abc/static/hcaptcha.html#frame=checkbox&sitekey=a5f74b19-9e45-40e0-b45d-47ff91b7a6c2"></iframe>"#;
        let r = detect_captcha(html);
        assert_eq!(r.vendor, Some(CaptchaVendor::Hcaptcha));
        assert_eq!(
            r.site_key.as_deref(),
            Some("a5f74b19-9e45-40e0-b45d-47ff91b7a6c2")
        );
        assert!(r.challenge_url.unwrap().contains("hcaptcha.com"));
    }

    #[test]
    fn script_signature_beats_markup() {
        // Cloudflare challenge script plus a turnstile div: the script wins.
        let html = r#"<html><head><script>window._cf_chl_opt={cvId:'3',cZone:'x'};</script></head>
            <body><div class="cf-turnstile" data-sitekey="0x4AAAAAAAB"></div></body></html>"#;
        let r = detect_captcha(html);
        assert_eq!(r.vendor, Some(CaptchaVendor::CloudflareChallenge));
        assert_eq!(r.site_key.as_deref(), Some("0x4AAAAAAAB"));
    }

    #[test]
    fn datadome_cid_becomes_vendor_cookie() {
        let html = r#"<html><script>var dd={'rt':'c','cid':'AHrlqAAAAAMA1x','hsh':'AB12','host':'geo.captcha-delivery.com'}</script>
            <script src="https://ct.captcha-delivery.com/c.js"></script></html>"#;
        let r = detect_captcha(html);
        assert_eq!(r.vendor, Some(CaptchaVendor::DataDome));
        assert_eq!(r.vendor_cookie.as_deref(), Some("AHrlqAAAAAMA1x"));
        assert_eq!(
            r.challenge_url.as_deref(),
            Some("https://geo.captcha-delivery.com/captcha/?initialCid=AHrlqAAAAAMA1x")
        );
    }

    #[test]
    fn short_page_with_challenge_wording_is_unknown_vendor() {
        let html = "<html><body><h1>Security check</h1><p>Please verify you are human.</p></body></html>";
        let r = detect_captcha(html);
        assert!(r.detected);
        assert_eq!(r.vendor, Some(CaptchaVendor::Unknown));
        assert_eq!(r.site_key, None);
    }

    #[test]
    fn short_normal_page_is_not_blocked() {
        let html = "<html><body><h1>John Doe</h1><p>Actor, 1931-2004.</p></body></html>";
        let r = detect_captcha(html);
        assert!(!r.detected);
        assert_eq!(r.vendor, None);
    }

    #[test]
    fn long_article_mentioning_security_check_is_not_blocked() {
        let filler = "The actor spent decades on stage and screen. ".repeat(60);
        let html = format!("<html><body><p>{filler}</p><p>He joked about the airport security check.</p></body></html>");
        assert!(!detect_captcha(&html).detected);
    }

    #[test]
    fn classify_status_codes() {
        assert_eq!(classify_response(200, "<p>fine</p>"), ResponseClass::Ok);
        assert_eq!(classify_response(403, "<p>nope</p>"), ResponseClass::Blocked(None));
        assert_eq!(classify_response(404, ""), ResponseClass::NotFound);
        assert!(matches!(classify_response(429, ""), ResponseClass::Transient(_)));
        assert!(matches!(
            classify_response(200, r#"<div class="g-recaptcha" data-sitekey="k1234567890"></div>"#),
            ResponseClass::Blocked(Some(_))
        ));
    }
}
