//! Candidate items, listing context and record derivation.
//!
//! The dedup key is a pure function of five identity-bearing fields, so a
//! restarted run re-derives exactly the keys it wrote before.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use harvest_common::ReviewRecord;
use regex::Regex;
use sha2::{Digest, Sha256};

static CAPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?P<title>.+?)\s+(?P<level>\d+)\s*уров").unwrap());
static AUTHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/maps/user/([^/?#]+)").unwrap());
static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// The source a feed belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing {
    pub org_id: String,
    pub name: String,
    pub source_url: String,
}

/// One visible feed item after expansion, before dedup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub position: u64,
    pub author_id: String,
    pub caption: String,
    pub rating_raw: String,
    pub date_iso: String,
    pub text: String,
    pub expand_clicks: u32,
    pub still_truncated: bool,
}

/// Deterministic dedup key: SHA-256 over the pipe-joined identity fields.
pub fn review_key(
    org_id: &str,
    author_id: &str,
    date_iso: &str,
    rating_raw: &str,
    text: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{org_id}|{author_id}|{date_iso}|{rating_raw}|{text}").as_bytes());
    hex::encode(hasher.finalize())
}

/// Collapse whitespace runs to single spaces and trim.
pub fn normalize_text(raw: &str) -> String {
    WHITESPACE_RE.replace_all(raw.trim(), " ").into_owned()
}

/// Text that still ends in an ellipsis has most likely not been expanded.
pub fn looks_truncated(text: &str) -> bool {
    let t = text.trim_end();
    t.ends_with('…') || t.ends_with("...")
}

/// Split an author caption like "Знаток города 7 уровня" into badge and level.
/// Returns `(caption, badge, level)`; badge is empty and level `None` when the
/// caption has no level suffix.
pub fn parse_caption(caption: &str) -> (String, String, Option<u32>) {
    let caption = caption.trim();
    match CAPTION_RE.captures(caption) {
        Some(caps) => {
            let level = caps["level"].parse().ok();
            (caption.to_string(), caps["title"].trim().to_string(), level)
        }
        None => (caption.to_string(), String::new(), None),
    }
}

/// Parse a rating token, accepting a comma decimal separator.
pub fn parse_rating(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    raw.replace(',', ".")
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

/// Calendar date part of an ISO timestamp.
pub fn date_part(date_iso: &str) -> String {
    match date_iso.split_once('T') {
        Some((date, _)) => date.to_string(),
        None => date_iso.to_string(),
    }
}

pub fn author_id_from_href(href: &str) -> String {
    AUTHOR_RE
        .captures(href)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default()
}

impl Candidate {
    pub fn key(&self, listing: &Listing) -> String {
        review_key(
            &listing.org_id,
            &self.author_id,
            &self.date_iso,
            &self.rating_raw,
            &self.text,
        )
    }

    pub fn into_record(self, listing: &Listing, scraped_at: DateTime<Utc>) -> ReviewRecord {
        let review_key = self.key(listing);
        let (author_caption, author_badge, author_level) = parse_caption(&self.caption);
        ReviewRecord {
            review_key,
            org_id: listing.org_id.clone(),
            restaurant_name: listing.name.clone(),
            author_id: self.author_id,
            author_caption,
            author_badge,
            author_level,
            date: date_part(&self.date_iso),
            date_iso: self.date_iso,
            rating: parse_rating(&self.rating_raw),
            rating_raw: self.rating_raw,
            text: self.text,
            source_url: listing.source_url.clone(),
            scraped_at_unix: scraped_at.timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing() -> Listing {
        Listing {
            org_id: "1018907821".into(),
            name: "Пушкин".into(),
            source_url: "https://yandex.ru/maps/org/pushkin/1018907821/reviews/".into(),
        }
    }

    #[test]
    fn key_is_stable_across_calls() {
        let a = review_key("1", "u1", "2024-03-01T10:00:00Z", "5", "Отлично");
        let b = review_key("1", "u1", "2024-03-01T10:00:00Z", "5", "Отлично");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_changes_with_any_identity_field() {
        let base = review_key("1", "u1", "d", "5", "t");
        assert_ne!(base, review_key("2", "u1", "d", "5", "t"));
        assert_ne!(base, review_key("1", "u2", "d", "5", "t"));
        assert_ne!(base, review_key("1", "u1", "e", "5", "t"));
        assert_ne!(base, review_key("1", "u1", "d", "4", "t"));
        assert_ne!(base, review_key("1", "u1", "d", "5", "u"));
    }

    #[test]
    fn normalize_collapses_whitespace() {
        assert_eq!(normalize_text("  Очень\n\n вкусно\t и  быстро "), "Очень вкусно и быстро");
        assert_eq!(normalize_text(" \n "), "");
    }

    #[test]
    fn truncation_heuristic() {
        assert!(looks_truncated("Было неплохо, но…"));
        assert!(looks_truncated("Было неплохо, но..."));
        assert!(!looks_truncated("Было неплохо."));
        assert!(!looks_truncated(""));
    }

    #[test]
    fn caption_with_level_parses() {
        let (caption, badge, level) = parse_caption(" Знаток города 7 уровня ");
        assert_eq!(caption, "Знаток города 7 уровня");
        assert_eq!(badge, "Знаток города");
        assert_eq!(level, Some(7));
    }

    #[test]
    fn caption_without_level_keeps_raw_only() {
        let (caption, badge, level) = parse_caption("Местный эксперт");
        assert_eq!(caption, "Местный эксперт");
        assert_eq!(badge, "");
        assert_eq!(level, None);
    }

    #[test]
    fn rating_parses_comma_and_rejects_garbage() {
        assert_eq!(parse_rating("4,5"), Some(4.5));
        assert_eq!(parse_rating(" 5 "), Some(5.0));
        assert_eq!(parse_rating(""), None);
        assert_eq!(parse_rating("five"), None);
        assert_eq!(parse_rating("NaN"), None);
    }

    #[test]
    fn date_part_splits_on_t() {
        assert_eq!(date_part("2024-03-01T10:00:00.000Z"), "2024-03-01");
        assert_eq!(date_part("2024-03-01"), "2024-03-01");
        assert_eq!(date_part(""), "");
    }

    #[test]
    fn author_id_from_profile_link() {
        assert_eq!(author_id_from_href("/maps/user/abc123def/"), "abc123def");
        assert_eq!(
            author_id_from_href("https://yandex.ru/maps/user/xyz?utm=1"),
            "xyz"
        );
        assert_eq!(author_id_from_href("/maps/org/1/"), "");
    }

    #[test]
    fn malformed_rating_still_produces_record() {
        let candidate = Candidate {
            position: 3,
            author_id: "u1".into(),
            caption: "Гость".into(),
            rating_raw: "n/a".into(),
            date_iso: "2024-03-01T10:00:00Z".into(),
            text: "Нормально".into(),
            ..Default::default()
        };
        let listing = listing();
        let key = candidate.key(&listing);
        let record = candidate.into_record(&listing, Utc::now());

        assert_eq!(record.review_key, key);
        assert_eq!(record.rating, None);
        assert_eq!(record.rating_raw, "n/a");
        assert_eq!(record.date, "2024-03-01");
        assert_eq!(record.org_id, "1018907821");
        assert_eq!(record.restaurant_name, "Пушкин");
        assert_eq!(record.author_level, None);
    }
}
