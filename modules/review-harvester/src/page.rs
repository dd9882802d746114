//! Per-source page preparation: load, clear popups, resolve the feed
//! selectors, name the listing and wait for the first items.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use harvest_common::{ElementRef, HarvestConfig, Selectors};
use tracing::{debug, info, warn};

use crate::collector::FeedTarget;
use crate::detector::Detector;
use crate::record::Listing;
use crate::recovery::{RecoveryDecision, RecoveryHandler};
use crate::sources::org_id_from_url;
use crate::traits::Surface;

const TITLE_SEPARATORS: &[&str] = &["—", "|", "–", "-"];
const MAX_NAME_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct PageTimings {
    /// Fixed wait after navigation returns.
    pub settle: Duration,
    pub popup_settle: Duration,
    pub poll_interval: Duration,
    pub navigation_timeout: Duration,
    /// Critical: the source is abandoned when no item shows up in time.
    pub list_ready_timeout: Duration,
    /// Best-effort: harvesting starts anyway when it elapses.
    pub content_ready_timeout: Duration,
}

impl Default for PageTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(1200),
            popup_settle: Duration::from_millis(200),
            poll_interval: Duration::from_millis(250),
            navigation_timeout: Duration::from_secs(120),
            list_ready_timeout: Duration::from_secs(30),
            content_ready_timeout: Duration::from_secs(20),
        }
    }
}

impl PageTimings {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            navigation_timeout: config.navigation_timeout,
            list_ready_timeout: config.list_ready_timeout,
            content_ready_timeout: config.content_ready_timeout,
            ..Default::default()
        }
    }

    /// No waiting at all; waits still poll once before giving up.
    pub fn immediate() -> Self {
        Self {
            settle: Duration::ZERO,
            popup_settle: Duration::ZERO,
            poll_interval: Duration::ZERO,
            navigation_timeout: Duration::from_secs(5),
            list_ready_timeout: Duration::ZERO,
            content_ready_timeout: Duration::ZERO,
        }
    }
}

/// Result of preparing one source.
#[derive(Debug, Clone)]
pub enum Preparation {
    Ready(FeedTarget),
    /// Challenge page, recovery skipped the source.
    Skipped,
    /// Challenge page, operator stopped the run.
    Aborted,
}

/// Bring a source page into a harvestable state.
///
/// Errors are source-level: the caller reports them and moves on.
pub async fn prepare(
    surface: &dyn Surface,
    selectors: &Selectors,
    detector: &Detector,
    recovery: &dyn RecoveryHandler,
    timings: &PageTimings,
    url: &str,
) -> Result<Preparation> {
    tokio::time::timeout(timings.navigation_timeout, surface.navigate(url))
        .await
        .map_err(|_| {
            anyhow!(
                "navigation timed out after {}s",
                timings.navigation_timeout.as_secs()
            )
        })?
        .context("navigation failed")?;
    tokio::time::sleep(timings.settle).await;

    dismiss_popups(surface, selectors, timings.popup_settle).await;

    if detector.is_blocked(surface).await {
        match recovery.recover(surface, url).await {
            RecoveryDecision::Continue => {}
            RecoveryDecision::SkipSource => return Ok(Preparation::Skipped),
            RecoveryDecision::Abort => return Ok(Preparation::Aborted),
        }
    }

    let container = pick_first_existing(surface, &selectors.container_candidates).await;
    let cards = pick_first_existing(surface, &selectors.card_candidates).await;
    let (Some(container_selector), Some(card_selector)) = (container, cards) else {
        bail!("container/cards not found");
    };
    debug!(url, container = %container_selector, cards = %card_selector, "Feed selectors resolved");

    let listing = Listing {
        org_id: org_id_from_url(url),
        name: listing_name(surface, selectors).await,
        source_url: url.to_string(),
    };
    info!(url, org_id = %listing.org_id, name = %listing.name, "Listing identified");

    wait_for_items(surface, &card_selector, timings).await?;
    wait_content_ready(surface, selectors, &card_selector, timings).await;

    Ok(Preparation::Ready(FeedTarget {
        listing,
        container_selector,
        card_selector,
    }))
}

/// Click through cookie banners and hint overlays. Best-effort: every
/// failure is ignored.
pub async fn dismiss_popups(surface: &dyn Surface, selectors: &Selectors, settle: Duration) -> u32 {
    let mut clicked = 0;
    for group in &selectors.popup_label_groups {
        for label in group {
            let Ok(candidates) = surface.query(&selectors.clickable).await else {
                continue;
            };
            for candidate in candidates {
                let matches = match surface.inner_text(candidate).await {
                    Ok(text) => text.trim() == label,
                    Err(_) => false,
                };
                if !matches {
                    continue;
                }
                if surface.click(candidate).await.is_ok() {
                    debug!(label = %label, "Dismissed popup");
                    clicked += 1;
                    tokio::time::sleep(settle).await;
                }
                break;
            }
        }
    }
    clicked
}

/// First selector matching at least one element.
pub async fn pick_first_existing(surface: &dyn Surface, candidates: &[String]) -> Option<String> {
    for selector in candidates {
        match surface.query(selector).await {
            Ok(found) if !found.is_empty() => return Some(selector.clone()),
            Ok(_) => {}
            Err(e) => debug!(selector = %selector, error = %e, "Selector lookup failed"),
        }
    }
    None
}

/// Heading text, then `og:title`, then the document title. Empty when none
/// of them yields anything.
pub async fn listing_name(surface: &dyn Surface, selectors: &Selectors) -> String {
    for selector in &selectors.listing_name {
        let Ok(Some(heading)) = first_match(surface, selector).await else {
            continue;
        };
        let Ok(text) = surface.inner_text(heading).await else {
            continue;
        };
        if let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
            if line.chars().count() < MAX_NAME_CHARS {
                return line.to_string();
            }
        }
    }

    if let Ok(Some(meta)) = first_match(surface, &selectors.og_title).await {
        if let Ok(Some(content)) = surface.attribute(meta, "content").await {
            if !content.trim().is_empty() {
                return cleanup_title(&content);
            }
        }
    }

    match surface.title().await {
        Ok(title) if !title.trim().is_empty() => cleanup_title(&title),
        _ => String::new(),
    }
}

/// Strip the portal suffix from page titles like "Кафе Пушкин — Яндекс Карты".
pub fn cleanup_title(title: &str) -> String {
    let t = title.trim();
    if !t.to_lowercase().contains("яндекс") {
        return t.to_string();
    }
    for sep in TITLE_SEPARATORS {
        if let Some((left, _)) = t.split_once(sep) {
            let left = left.trim();
            if !left.is_empty() {
                return left.to_string();
            }
        }
    }
    t.to_string()
}

/// Poll until at least one item is present. Critical.
pub async fn wait_for_items(
    surface: &dyn Surface,
    card_selector: &str,
    timings: &PageTimings,
) -> Result<()> {
    let found = poll_until(timings, timings.list_ready_timeout, move || async move {
        matches!(surface.query(card_selector).await, Ok(found) if !found.is_empty())
    })
    .await;
    if !found {
        bail!(
            "review list not ready after {}s",
            timings.list_ready_timeout.as_secs()
        );
    }
    Ok(())
}

/// Poll until some item has rendered its content. Best-effort.
pub async fn wait_content_ready(
    surface: &dyn Surface,
    selectors: &Selectors,
    card_selector: &str,
    timings: &PageTimings,
) -> bool {
    let ready_selectors: Vec<String> = selectors
        .content_ready
        .iter()
        .map(|ready| format!("{card_selector} {ready}"))
        .collect();
    let ready_selectors = &ready_selectors;

    let ready = poll_until(timings, timings.content_ready_timeout, move || async move {
        for selector in ready_selectors {
            if matches!(surface.query(selector).await, Ok(found) if !found.is_empty()) {
                debug!(selector = %selector, "Item content ready");
                return true;
            }
        }
        false
    })
    .await;

    if !ready {
        warn!(
            selector = card_selector,
            "Item content readiness timed out, continuing anyway"
        );
    }
    ready
}

async fn first_match(surface: &dyn Surface, selector: &str) -> Result<Option<ElementRef>> {
    Ok(surface.query(selector).await?.into_iter().next())
}

/// Checks at least once, then keeps polling until `limit` has elapsed.
async fn poll_until<F, Fut>(timings: &PageTimings, limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(timings.poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::SkipOnBlock;
    use crate::testing::{MockItem, MockPage, MockSurface};

    fn items(n: u64) -> Vec<MockItem> {
        (1..=n).map(|p| MockItem::new(p, "текст")).collect()
    }

    #[test]
    fn title_cleanup_strips_portal_suffix() {
        assert_eq!(cleanup_title("Кафе Пушкин — Яндекс Карты"), "Кафе Пушкин");
        assert_eq!(cleanup_title("Пушкин | Яндекс"), "Пушкин");
        assert_eq!(cleanup_title("Пушкин - яндекс.карты"), "Пушкин");
        assert_eq!(cleanup_title(" Кафе — лучшее "), "Кафе — лучшее");
        assert_eq!(cleanup_title("— Яндекс Карты"), "— Яндекс Карты");
    }

    #[tokio::test]
    async fn name_prefers_heading_first_line() {
        let surface = MockSurface::single(
            MockPage::new(items(1))
                .with_name("Пушкин\nРесторан")
                .with_og_title("Другое — Яндекс Карты"),
        );
        assert_eq!(listing_name(&surface, &Selectors::default()).await, "Пушкин");
    }

    #[tokio::test]
    async fn name_falls_back_to_og_then_title() {
        let og = MockSurface::single(MockPage::new(items(1)).with_og_title("Кафе — Яндекс Карты"));
        assert_eq!(listing_name(&og, &Selectors::default()).await, "Кафе");

        let titled = MockSurface::single(MockPage::new(items(1)).with_title("Бар | Яндекс"));
        assert_eq!(listing_name(&titled, &Selectors::default()).await, "Бар");

        let bare = MockSurface::single(MockPage::new(items(1)));
        assert_eq!(listing_name(&bare, &Selectors::default()).await, "");
    }

    #[tokio::test]
    async fn popups_are_clicked_when_present() {
        let surface = MockSurface::single(MockPage::new(items(1)).with_popup("Закрыть"));
        let clicked = dismiss_popups(&surface, &Selectors::default(), Duration::ZERO).await;
        assert_eq!(clicked, 1);
        assert_eq!(surface.popup_clicks(), 1);
    }

    #[tokio::test]
    async fn prepare_resolves_feed_and_identity() {
        let surface = MockSurface::single(MockPage::new(items(3)).with_name("Пушкин"));
        let url = surface.default_url().to_string();

        let prepared = prepare(
            &surface,
            &Selectors::default(),
            &Detector::default(),
            &SkipOnBlock,
            &PageTimings::immediate(),
            &url,
        )
        .await
        .unwrap();

        let Preparation::Ready(target) = prepared else {
            panic!("expected a ready feed");
        };
        let selectors = Selectors::default();
        assert_eq!(target.container_selector, selectors.container_candidates[0]);
        assert_eq!(target.card_selector, selectors.card_candidates[0]);
        assert_eq!(target.listing.org_id, "1234567890");
        assert_eq!(target.listing.name, "Пушкин");
        assert_eq!(surface.navigations(), 1);
    }

    #[tokio::test]
    async fn prepare_fails_without_container() {
        let surface = MockSurface::single(MockPage::new(items(3)).without_container());
        let url = surface.default_url().to_string();

        let err = prepare(
            &surface,
            &Selectors::default(),
            &Detector::default(),
            &SkipOnBlock,
            &PageTimings::immediate(),
            &url,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("container/cards not found"));
    }

    #[tokio::test]
    async fn prepare_skips_challenged_source() {
        let surface = MockSurface::single(MockPage::new(items(3)).challenged());
        let url = surface.default_url().to_string();

        let prepared = prepare(
            &surface,
            &Selectors::default(),
            &Detector::default(),
            &SkipOnBlock,
            &PageTimings::immediate(),
            &url,
        )
        .await
        .unwrap();
        assert!(matches!(prepared, Preparation::Skipped));
    }

    #[tokio::test]
    async fn empty_feed_is_not_ready() {
        let surface = MockSurface::single(MockPage::new(items(3)).revealing(0, 0));
        let card = &Selectors::default().card_candidates[0];
        let err = wait_for_items(&surface, card, &PageTimings::immediate())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not ready"));
    }
}
