use serde::{Deserialize, Serialize};

// --- Surface handles ---

/// Opaque handle to an element living in the rendering surface.
///
/// Handles are only meaningful to the surface that issued them and only
/// until that surface releases them (navigation or an explicit release).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ElementRef(pub u64);

/// Size measurements reported by a scroll step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScrollMetrics {
    pub moved: bool,
    pub before: f64,
    pub after: f64,
    pub client_height: f64,
    pub scroll_height: f64,
}

// --- Output record ---

/// One persisted review. Serialized as a flat JSON object per line; the
/// field names are the contract with the downstream tabular consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub review_key: String,
    pub org_id: String,
    pub restaurant_name: String,
    pub author_id: String,
    pub author_caption: String,
    pub author_badge: String,
    pub author_level: Option<u32>,
    pub date_iso: String,
    pub date: String,
    pub rating_raw: String,
    pub rating: Option<f64>,
    pub text: String,
    pub source_url: String,
    pub scraped_at_unix: i64,
}

// --- Selectors ---

/// CSS selectors and label sets for the review feed markup.
#[derive(Debug, Clone)]
pub struct Selectors {
    /// Tried in order; the first one matching anything wins.
    pub container_candidates: Vec<String>,
    /// Tried in order; the first one matching anything wins.
    pub card_candidates: Vec<String>,
    pub listing_name: Vec<String>,
    pub og_title: String,
    pub position_attribute: String,
    pub author_link: String,
    pub caption: String,
    pub rating_meta: String,
    pub date_meta: String,
    pub text: String,
    pub text_fallback: String,
    /// Descendant elements that may act as an "expand" control.
    pub clickable: String,
    pub expand_labels: Vec<String>,
    /// Popup buttons, clicked group by group before harvesting.
    pub popup_label_groups: Vec<Vec<String>>,
    /// Item descendants whose presence means review content has rendered.
    pub content_ready: Vec<String>,
}

impl Default for Selectors {
    fn default() -> Self {
        Self {
            container_candidates: strings(&[
                "div.business-reviews-card-view__reviews-container",
                "div[class*='business-reviews-card-view__reviews-container']",
            ]),
            card_candidates: strings(&[
                "div.business-reviews-card-view__review[role='listitem']",
                "div[class*='business-reviews-card-view__review'][role='listitem']",
            ]),
            listing_name: strings(&[
                "h1.card-title-view__title[itemprop='name']",
                "h1[itemprop='name']",
            ]),
            og_title: "meta[property='og:title']".to_string(),
            position_attribute: "aria-posinset".to_string(),
            author_link: "a.business-review-view__link[href*='/maps/user/']".to_string(),
            caption: ".business-review-view__author-caption".to_string(),
            rating_meta: "meta[itemprop='ratingValue']".to_string(),
            date_meta: "meta[itemprop='datePublished']".to_string(),
            text: ".business-review-view__text".to_string(),
            text_fallback: ".business-review-view__body".to_string(),
            clickable: "button,[role='button'],a,span".to_string(),
            expand_labels: strings(&[
                "Показать ещё",
                "Читать полностью",
                "Показать полностью",
                "Ещё",
            ]),
            popup_label_groups: vec![
                strings(&["Закрыть", "Понятно", "Ок", "ОК"]),
                strings(&["Принять", "Согласен", "Согласна"]),
            ],
            content_ready: strings(&[
                "meta[itemprop='datePublished']",
                "meta[itemprop='ratingValue']",
                ".business-review-view__body",
                ".business-review-view__text",
            ]),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scroll_metrics_parse_from_script_output() {
        let value = serde_json::json!({
            "moved": true,
            "before": 0,
            "after": 1200,
            "clientHeight": 600,
            "scrollHeight": 4800
        });
        let metrics: ScrollMetrics = serde_json::from_value(value).unwrap();
        assert!(metrics.moved);
        assert_eq!(metrics.after, 1200.0);
        assert_eq!(metrics.scroll_height, 4800.0);
    }

    #[test]
    fn scroll_metrics_tolerate_missing_fields() {
        let metrics: ScrollMetrics = serde_json::from_value(serde_json::json!({})).unwrap();
        assert_eq!(metrics, ScrollMetrics::default());
    }

    #[test]
    fn record_serializes_null_for_unparsed_fields() {
        let record = ReviewRecord {
            review_key: "k".into(),
            org_id: "1".into(),
            restaurant_name: String::new(),
            author_id: String::new(),
            author_caption: String::new(),
            author_badge: String::new(),
            author_level: None,
            date_iso: String::new(),
            date: String::new(),
            rating_raw: "n/a".into(),
            rating: None,
            text: "ok".into(),
            source_url: "https://example.com".into(),
            scraped_at_unix: 0,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert!(json["rating"].is_null());
        assert!(json["author_level"].is_null());
        assert_eq!(json["rating_raw"], "n/a");
    }
}
