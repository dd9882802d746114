//! Scroll driver for the virtualized feed.

use harvest_common::ScrollMetrics;
use serde_json::json;
use tracing::debug;

use crate::traits::Surface;

/// Finds the element that actually scrolls (the feed container is usually a
/// child of it) and moves it down by `clientHeight * ratio`.
pub const SCROLL_SCRIPT: &str = r#"function(ratio) {
    function findScrollable(x) {
        while (x && x !== document.body) {
            const st = getComputedStyle(x);
            const oy = st.overflowY;
            if ((oy === 'auto' || oy === 'scroll') && x.scrollHeight > x.clientHeight + 5) {
                return x;
            }
            x = x.parentElement;
        }
        return document.scrollingElement || document.documentElement;
    }
    const sc = findScrollable(this);
    const before = sc.scrollTop;
    const step = Math.floor(sc.clientHeight * ratio);
    sc.scrollTop = before + step;
    return {
        moved: sc.scrollTop !== before,
        before: before,
        after: sc.scrollTop,
        clientHeight: sc.clientHeight,
        scrollHeight: sc.scrollHeight
    };
}"#;

/// Wheel distance for the fallback nudge at ratio 1.0.
pub const WHEEL_BASE_DELTA: f64 = 1600.0;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScrollOutcome {
    pub moved: bool,
    pub metrics: ScrollMetrics,
    /// The wheel fallback was attempted.
    pub nudged: bool,
}

/// Advance the feed by one step. Never fails: every problem degrades to
/// "did not move", which the collection loop already treats as a stall.
pub async fn advance(surface: &dyn Surface, container_selector: &str, step_ratio: f64) -> ScrollOutcome {
    let container = match surface.query(container_selector).await {
        Ok(found) => found.into_iter().next(),
        Err(e) => {
            debug!(error = %e, "Container lookup failed");
            None
        }
    };
    let Some(container) = container else {
        debug!(selector = container_selector, "Scroll container not present");
        return ScrollOutcome::default();
    };

    let metrics = match surface.evaluate(container, SCROLL_SCRIPT, json!(step_ratio)).await {
        Ok(value) => serde_json::from_value::<ScrollMetrics>(value).unwrap_or_default(),
        Err(e) => {
            debug!(error = %e, "Scroll script failed");
            ScrollMetrics::default()
        }
    };

    let mut outcome = ScrollOutcome {
        moved: metrics.moved,
        metrics,
        nudged: false,
    };

    if !metrics.moved {
        outcome.nudged = true;
        if let Err(e) = surface.wheel(container, WHEEL_BASE_DELTA * step_ratio).await {
            debug!(error = %e, "Wheel fallback failed");
        }
    }

    debug!(
        moved = metrics.moved,
        before = metrics.before,
        after = metrics.after,
        client_height = metrics.client_height,
        scroll_height = metrics.scroll_height,
        nudged = outcome.nudged,
        "Scroll step"
    );

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockItem, MockPage, MockSurface};
    use harvest_common::Selectors;

    fn items(n: u64) -> Vec<MockItem> {
        (1..=n).map(|p| MockItem::new(p, "текст")).collect()
    }

    #[tokio::test]
    async fn moves_when_more_content_exists() {
        let surface = MockSurface::single(MockPage::new(items(10)).revealing(4, 3));
        let container = &Selectors::default().container_candidates[0];

        let outcome = advance(&surface, container, 2.0).await;

        assert!(outcome.moved);
        assert!(!outcome.nudged);
        assert!(outcome.metrics.after > outcome.metrics.before);
        assert_eq!(surface.wheel_calls(), 0);
        assert_eq!(surface.visible_positions(), (1..=7).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn falls_back_to_wheel_at_bottom() {
        let surface = MockSurface::single(MockPage::new(items(3)));
        let container = &Selectors::default().container_candidates[0];

        let outcome = advance(&surface, container, 1.5).await;

        assert!(!outcome.moved);
        assert!(outcome.nudged);
        assert_eq!(surface.wheel_calls(), 1);
        assert_eq!(surface.last_wheel_delta(), Some(2400.0));
    }

    #[tokio::test]
    async fn missing_container_reports_no_movement() {
        let surface = MockSurface::single(MockPage::new(items(3)).without_container());
        let container = &Selectors::default().container_candidates[0];

        let outcome = advance(&surface, container, 2.0).await;

        assert_eq!(outcome, ScrollOutcome::default());
        assert_eq!(surface.wheel_calls(), 0);
    }
}
