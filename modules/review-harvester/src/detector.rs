//! Anti-automation challenge detection.

use std::time::Duration;

use tracing::debug;

use crate::traits::Surface;

const CHALLENGE_URL_PATTERNS: &[&str] = &["showcaptcha", "captcha"];
const CHALLENGE_MARKERS: &[&str] = &[
    "подтвердите, что вы не робот",
    "я не робот",
    "captcha",
    "robot",
];
const BODY_READ_TIMEOUT: Duration = Duration::from_millis(1500);

/// Classifies the current page as a challenge page or a normal one.
///
/// Either signal is enough: the address matches a challenge path, or the
/// visible text carries a challenge phrase. Read failures count as "not
/// blocked" so a flaky read never interrupts the operator.
#[derive(Debug, Clone)]
pub struct Detector {
    url_patterns: Vec<String>,
    markers: Vec<String>,
    read_timeout: Duration,
}

impl Default for Detector {
    fn default() -> Self {
        Self {
            url_patterns: CHALLENGE_URL_PATTERNS.iter().map(|s| s.to_string()).collect(),
            markers: CHALLENGE_MARKERS.iter().map(|s| s.to_string()).collect(),
            read_timeout: BODY_READ_TIMEOUT,
        }
    }
}

impl Detector {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub async fn is_blocked(&self, surface: &dyn Surface) -> bool {
        if let Ok(url) = surface.current_url().await {
            if self.url_is_challenge(&url) {
                debug!(url, "Challenge path in address");
                return true;
            }
        }

        let read = async {
            let body = surface.query("body").await?.into_iter().next();
            match body {
                Some(body) => surface.inner_text(body).await,
                None => Ok(String::new()),
            }
        };
        match tokio::time::timeout(self.read_timeout, read).await {
            Ok(Ok(text)) => self.text_is_challenge(&text),
            Ok(Err(e)) => {
                debug!(error = %e, "Body read failed, assuming not blocked");
                false
            }
            Err(_) => {
                debug!("Body read timed out, assuming not blocked");
                false
            }
        }
    }

    pub fn url_is_challenge(&self, url: &str) -> bool {
        let url = url.to_lowercase();
        self.url_patterns.iter().any(|p| url.contains(p.as_str()))
    }

    pub fn text_is_challenge(&self, text: &str) -> bool {
        let text = text.to_lowercase();
        self.markers.iter().any(|m| text.contains(m.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockItem, MockPage, MockSurface};

    #[test]
    fn challenge_url_matches_case_insensitively() {
        let detector = Detector::default();
        assert!(detector.url_is_challenge("https://yandex.ru/ShowCaptcha?cc=1&retpath=x"));
        assert!(!detector.url_is_challenge("https://yandex.ru/maps/org/cafe/123/reviews/"));
    }

    #[test]
    fn challenge_text_matches_any_marker() {
        let detector = Detector::default();
        assert!(detector.text_is_challenge("Подтвердите, что вы не робот"));
        assert!(detector.text_is_challenge("Please solve the CAPTCHA"));
        assert!(!detector.text_is_challenge("Отзывы о ресторане"));
    }

    #[tokio::test]
    async fn challenge_page_is_blocked() {
        let surface = MockSurface::single(MockPage::new(vec![MockItem::new(1, "ok")]).challenged());
        assert!(Detector::default().is_blocked(&surface).await);
    }

    #[tokio::test]
    async fn normal_page_is_not_blocked() {
        let surface = MockSurface::single(MockPage::new(vec![MockItem::new(1, "ok")]));
        assert!(!Detector::default().is_blocked(&surface).await);
    }

    #[tokio::test]
    async fn read_failure_fails_open() {
        let surface = MockSurface::single(
            MockPage::new(vec![MockItem::new(1, "ok")])
                .challenged()
                .failing_body_reads(),
        );
        assert!(!Detector::default().is_blocked(&surface).await);
    }

    #[tokio::test]
    async fn hanging_body_read_times_out_as_not_blocked() {
        let surface = MockSurface::single(
            MockPage::new(vec![MockItem::new(1, "ok")])
                .challenged()
                .slow_body_reads(Duration::from_secs(60)),
        );
        let detector = Detector::default().with_read_timeout(Duration::from_millis(1));
        assert!(!detector.is_blocked(&surface).await);
    }

    #[tokio::test]
    async fn challenge_address_wins_even_when_body_unreadable() {
        let surface = MockSurface::single(
            MockPage::new(vec![])
                .at_url("https://yandex.ru/showcaptcha?retpath=1")
                .failing_body_reads(),
        );
        assert!(Detector::default().is_blocked(&surface).await);
    }
}
