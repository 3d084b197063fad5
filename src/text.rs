// src/text.rs
//! Text normalization shared by extraction, matching and cache keys.

use once_cell::sync::OnceCell;
use regex::Regex;

/// Upper bound on any extracted free-text field.
pub const MAX_TEXT_CHARS: usize = 1500;

fn re(cell: &'static OnceCell<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex"))
}

/// Visible text of an HTML document: scripts/styles dropped, tags stripped,
/// entities decoded, whitespace collapsed.
pub fn html_to_text(html: &str) -> String {
    static RE_BLOCKS: OnceCell<Regex> = OnceCell::new();
    static RE_BREAKS: OnceCell<Regex> = OnceCell::new();
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();

    let out = re(
        &RE_BLOCKS,
        r"(?is)<(script|style|noscript|template)\b[^>]*>.*?</(script|style|noscript|template)\s*>",
    )
    .replace_all(html, " ");
    // Block-level boundaries become sentence breaks so paragraphs don't run together.
    let out = re(&RE_BREAKS, r"(?i)</(p|div|li|h[1-6]|tr|section|article)\s*>|<br\s*/?>")
        .replace_all(&out, ". ");
    let out = re(&RE_TAGS, r"(?s)<[^>]+>").replace_all(&out, " ");
    let out = html_escape::decode_html_entities(&out).to_string();
    let out = re(&RE_WS, r"\s+").replace_all(&out, " ");
    out.trim().to_string()
}

/// Normalize a free-text answer: decode entities, strip tags, fold typographic
/// quotes, collapse whitespace, cap length.
pub fn normalize_text(s: &str) -> String {
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();

    let mut out = html_escape::decode_html_entities(s).to_string();
    out = re(&RE_TAGS, r"(?is)</?[^>]+>").replace_all(&out, "").to_string();

    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    out = re(&RE_WS, r"\s+").replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}

/// Comparison key: lowercase, punctuation and dashes to spaces, collapsed.
pub fn normalize_key(s: &str) -> String {
    let lowered = s.trim().to_lowercase();
    let replaced: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Split prose into sentences on terminal punctuation.
pub fn sentences(text: &str) -> Vec<String> {
    static RE_SENT: OnceCell<Regex> = OnceCell::new();
    re(&RE_SENT, r"[^.!?]+[.!?]*")
        .find_iter(text)
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| s.len() > 1)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_collapses_ws_and_entities() {
        let s = "  He died&nbsp;&nbsp; of <b>lung cancer</b>  ";
        assert_eq!(normalize_text(s), "He died of lung cancer");
    }

    #[test]
    fn html_to_text_drops_scripts_and_keeps_paragraphs_apart() {
        let html = "<html><script>var x = 1;</script><p>First</p><p>Second</p></html>";
        let t = html_to_text(html);
        assert!(!t.contains("var x"));
        assert!(t.starts_with("First."));
        assert!(t.contains("Second"));
    }

    #[test]
    fn key_ignores_case_and_punctuation() {
        assert_eq!(normalize_key("Heart-Attack!"), "heart attack");
        assert_eq!(normalize_key("  Los  Angeles, CA "), "los angeles ca");
    }

    #[test]
    fn sentence_split() {
        let s = sentences("He retired in 1990. He died of cancer in 2001! Sad.");
        assert_eq!(s.len(), 3);
        assert_eq!(s[1], "He died of cancer in 2001!");
    }
}
