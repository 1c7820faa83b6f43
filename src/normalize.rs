// src/normalize.rs
//! Normalizer: turns a source-native [`RawItem`] into a [`NormalizedItem`]
//! with cleaned text, a timezone-naive UTC timestamp, and a stable identity.
//!
//! Never fails: unrecoverable body corruption degrades to an empty body with a
//! `parse_error` flag in `raw_fields`, and unparseable timestamps fall back to
//! a fixed sentinel that always sorts oldest.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::sources::RawItem;

/// Body length cap after cleaning.
const MAX_BODY_CHARS: usize = 4000;
/// Gist length cap.
const MAX_GIST_CHARS: usize = 150;

static RE_STYLE_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<style[^>]*>.*?</style>").expect("style regex"));
static RE_TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
// Office/Outlook CSS rules that survive naive HTML stripping ("p.MsoNormal {...}").
static RE_CSS_RULE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)[\w.#@:,\s-]*\{[^{}]*\}").expect("css rule regex")
});
static RE_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));
// Email-thread sign-off tails: "Thanks, Jane Doe" / "Regards" at end of text.
static RE_SIGNOFF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\s+(?:thanks|thank you|regards|best)[,.!]?(?:\s+\S+(?:\s+\S+)?)?\s*$")
        .expect("signoff regex")
});
static RE_TITLE_PUNCT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\w\s]").expect("title punct regex"));

static EPOCH_SENTINEL: Lazy<NaiveDateTime> = Lazy::new(|| {
    NaiveDate::from_ymd_opt(1900, 1, 1)
        .expect("sentinel date")
        .and_hms_opt(0, 0, 0)
        .expect("sentinel time")
});

/// Cleaned, timezone-normalized representation of a raw source item.
/// `title`/`body` never mutate after creation; `created_at` is the single
/// timestamp used for ordering.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NormalizedItem {
    pub identity: String,
    pub source: String,
    pub title: String,
    pub gist: String,
    pub body: String,
    pub created_at: NaiveDateTime,
    pub url: Option<String>,
    pub raw_fields: Map<String, Value>,
}

/// The sentinel assigned to unparseable timestamps. Sorts before any real
/// feedback, never compares across timezones, never null.
pub fn epoch_sentinel() -> NaiveDateTime {
    *EPOCH_SENTINEL
}

/// Strip markup/CSS/email artifacts and collapse whitespace.
pub fn clean_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Drop <style> blocks wholesale, then remaining tags
    out = RE_STYLE_BLOCK.replace_all(&out, " ").to_string();
    out = RE_TAGS.replace_all(&out, " ").to_string();

    // 3) Remove CSS rule bodies that leak out of Office-generated HTML
    out = RE_CSS_RULE.replace_all(&out, " ").to_string();

    // 4) Normalize smart quotes to ASCII
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 5) Collapse whitespace
    out = RE_WS.replace_all(&out, " ").trim().to_string();

    // 6) Strip trailing email sign-offs
    out = RE_SIGNOFF.replace(&out, "").trim().to_string();

    // 7) Length cap
    if out.chars().count() > MAX_BODY_CHARS {
        out = out.chars().take(MAX_BODY_CHARS).collect();
    }

    out
}

/// Case/whitespace/punctuation-insensitive title key. Shared by identity
/// hashing and exact-duplicate grouping so the two can never disagree.
pub fn title_key(title: &str) -> String {
    let lowered = title.to_lowercase();
    let stripped = RE_TITLE_PUNCT.replace_all(&lowered, "");
    RE_WS.replace_all(stripped.trim(), " ").to_string()
}

/// Parse an accepted timestamp shape into timezone-naive UTC.
/// Accepted: RFC 3339 / ISO-8601 with zone, zone-less datetime (taken as UTC),
/// space-separated datetime, and date-only.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(t) {
        return Some(dt.naive_utc());
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(t, fmt) {
            return Some(dt);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(t, "%Y-%m-%d") {
        return d.and_hms_opt(0, 0, 0);
    }
    None
}

/// Deterministic identity: SHA-256 over `(source, title key, url-or-native-id)`
/// rendered as a UUID-shaped hex string. Identical logical items collected in
/// different runs hash to the same identity.
pub fn identity(source: &str, title: &str, reference: &str) -> String {
    let combined = format!(
        "{}|{}|{}",
        source.to_lowercase(),
        title_key(title),
        reference.trim()
    );
    let digest = Sha256::digest(combined.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Word-bounded summary of the cleaned text.
pub fn gist(text: &str) -> String {
    if text.is_empty() {
        return "No content".to_string();
    }
    let mut out = String::new();
    for word in text.split_whitespace() {
        if out.chars().count() + word.chars().count() + 1 > MAX_GIST_CHARS - 3 {
            out.push_str("...");
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out
}

/// Normalize one raw item. Infallible by contract: corrupted bodies degrade
/// with a `parse_error` flag instead of being dropped.
pub fn normalize(raw: RawItem, source: &str) -> NormalizedItem {
    let title = RE_WS.replace_all(raw.title.trim(), " ").to_string();
    let body = clean_text(&raw.body);
    let parse_error = !raw.body.trim().is_empty() && body.is_empty();

    let created_at = parse_timestamp(&raw.created_at_raw).unwrap_or_else(epoch_sentinel);

    let reference = raw
        .url
        .as_deref()
        .or(raw.native_id.as_deref())
        .unwrap_or_default();
    let identity = identity(source, &title, reference);

    let mut raw_fields = raw.extra;
    raw_fields.insert("author".into(), Value::String(raw.author));
    raw_fields.insert("created_at_raw".into(), Value::String(raw.created_at_raw));
    if parse_error {
        raw_fields.insert("parse_error".into(), Value::Bool(true));
    }

    let gist = gist(if body.is_empty() { &title } else { &body });

    NormalizedItem {
        identity,
        source: source.to_string(),
        title,
        gist,
        body,
        created_at,
        url: raw.url,
        raw_fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn raw(title: &str, body: &str, created: &str, url: Option<&str>) -> RawItem {
        RawItem {
            title: title.into(),
            body: body.into(),
            author: "someone".into(),
            created_at_raw: created.into(),
            url: url.map(String::from),
            native_id: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn clean_text_strips_markup_and_collapses_ws() {
        let s = "<p>Hello,&nbsp;&nbsp;   <b>world</b></p>";
        assert_eq!(clean_text(s), "Hello, world");
    }

    #[test]
    fn clean_text_removes_css_rules_and_signoffs() {
        let s = "p.MsoNormal {margin: 0; font-size: 11pt} The export hangs forever. Thanks, Jane Doe";
        assert_eq!(clean_text(s), "The export hangs forever.");
    }

    #[test]
    fn title_key_ignores_case_ws_and_punct() {
        assert_eq!(title_key("  Crash  on SAVE!! "), "crash on save");
        assert_eq!(title_key("Crash on save"), title_key("crash ON   save."));
    }

    #[test]
    fn timestamps_with_and_without_zone_normalize_to_utc() {
        let zoned = parse_timestamp("2025-01-15T12:00:00+02:00").expect("zoned");
        let naive = parse_timestamp("2025-01-15T10:00:00").expect("naive");
        assert_eq!(zoned, naive);

        let date_only = parse_timestamp("2025-01-15").expect("date only");
        assert_eq!(date_only.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_sentinel() {
        let item = normalize(raw("t", "b", "three days ago", None), "Reddit");
        assert_eq!(item.created_at, epoch_sentinel());
        // Sentinel sorts before any plausible feedback timestamp.
        assert!(item.created_at < parse_timestamp("2000-01-01").expect("date"));
    }

    #[test]
    fn identity_is_stable_across_runs_and_distinct_across_items() {
        let a = identity("Reddit", "Crash on Save", "https://x/1");
        let b = identity("Reddit", "  crash on save!  ", "https://x/1");
        assert_eq!(a, b);

        let c = identity("Reddit", "Crash on save", "https://x/2");
        assert_ne!(a, c);
        // UUID-shaped rendering.
        assert_eq!(a.split('-').map(str::len).collect::<Vec<_>>(), vec![8, 4, 4, 4, 12]);
    }

    #[test]
    fn corrupt_body_degrades_with_parse_error_flag() {
        let item = normalize(raw("t", "<style>p{color:red}</style>", "2025-01-01", None), "Fed");
        assert!(item.body.is_empty());
        assert_eq!(item.raw_fields.get("parse_error"), Some(&serde_json::Value::Bool(true)));
    }

    #[test]
    fn gist_is_word_bounded() {
        let long = "word ".repeat(100);
        let g = gist(&long);
        assert!(g.chars().count() <= 150);
        assert!(g.ends_with("..."));
        assert_eq!(gist(""), "No content");
    }
}
