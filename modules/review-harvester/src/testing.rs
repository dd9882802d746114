// Test doubles for the harvester.
//
// - MockSurface (Surface): an in-memory review feed with virtualized
//   rendering, expandable items, challenge pages and injectable failures
// - ScriptedChannel (OperatorChannel): canned operator input, records prompts
// - VecSink (RecordSink): collects records in memory
//
// Element handles are encoded as `position * 16 + kind`; page-level
// elements use position 0.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use harvest_common::{ElementRef, HarvestError, ReviewRecord, Selectors};
use serde_json::{json, Value};

use crate::expansion::EXPAND_SCRIPT;
use crate::recovery::{OperatorChannel, OperatorCommand};
use crate::scroll::SCROLL_SCRIPT;
use crate::sink::RecordSink;
use crate::traits::Surface;

/// Address used by [`MockSurface::single`].
pub const DEFAULT_URL: &str = "https://yandex.ru/maps/org/test_place/1234567890/reviews/";

const CHALLENGE_TEXT: &str = "Подтвердите, что вы не робот";
const NORMAL_BODY_TEXT: &str = "Отзывы о заведении";
const EXPAND_LABEL: &str = "Ещё";
const REPLY_CONTROL_CLASS: &str = "business-review-comment__expand";
const ITEM_HEIGHT: f64 = 100.0;
const VIEWPORT_HEIGHT: f64 = 600.0;

// Per-item element kinds.
const CARD: u64 = 0;
const TEXT: u64 = 1;
const AUTHOR: u64 = 2;
const CAPTION: u64 = 3;
const RATING: u64 = 4;
const DATE: u64 = 5;

// Page-level element kinds (position 0).
const CONTAINER: u64 = 1;
const BODY: u64 = 2;
const HEADING: u64 = 3;
const OG_TITLE: u64 = 4;
const POPUP: u64 = 5;

fn handle(position: u64, kind: u64) -> ElementRef {
    ElementRef(position * 16 + kind)
}

fn decode(element: ElementRef) -> (u64, u64) {
    (element.0 / 16, element.0 % 16)
}

// ---------------------------------------------------------------------------
// MockItem
// ---------------------------------------------------------------------------

/// One review in the feed.
#[derive(Debug, Clone)]
pub struct MockItem {
    pub position: u64,
    author: String,
    caption: String,
    rating: String,
    date: String,
    /// Text as rendered after 0, 1, 2... expand clicks. The last entry
    /// sticks once clicks run past it.
    renders: Vec<String>,
    has_text: bool,
    reply_control: bool,
    failing_text_reads: u32,
    clicks: u32,
    text_reads: u32,
}

impl MockItem {
    pub fn new(position: u64, text: &str) -> Self {
        Self {
            position,
            author: format!("user{position}"),
            caption: "Знаток города 3 уровня".to_string(),
            rating: "5".to_string(),
            date: format!("2024-03-{:02}T12:00:00.000Z", position % 28 + 1),
            renders: vec![text.to_string()],
            has_text: true,
            reply_control: false,
            failing_text_reads: 0,
            clicks: 0,
            text_reads: 0,
        }
    }

    /// An item with an expand control; `renders[n]` is shown after `n` clicks.
    pub fn expandable(position: u64, renders: &[&str]) -> Self {
        let mut item = Self::new(position, renders.first().copied().unwrap_or_default());
        item.renders = renders.iter().map(|s| s.to_string()).collect();
        item
    }

    /// Adds an expand-looking control that sits inside a reply thread.
    pub fn with_reply_control(mut self) -> Self {
        self.reply_control = true;
        self
    }

    pub fn without_text(mut self) -> Self {
        self.has_text = false;
        self
    }

    pub fn with_author(mut self, author: &str) -> Self {
        self.author = author.to_string();
        self
    }

    pub fn with_caption(mut self, caption: &str) -> Self {
        self.caption = caption.to_string();
        self
    }

    pub fn with_rating(mut self, rating: &str) -> Self {
        self.rating = rating.to_string();
        self
    }

    pub fn with_date(mut self, date: &str) -> Self {
        self.date = date.to_string();
        self
    }

    /// The first `n` text reads fail.
    pub fn failing_text_reads(mut self, n: u32) -> Self {
        self.failing_text_reads = n;
        self
    }

    fn expandable_control(&self) -> bool {
        self.renders.len() > 1
    }

    fn current_text(&self) -> &str {
        let index = (self.clicks as usize).min(self.renders.len().saturating_sub(1));
        self.renders.get(index).map(String::as_str).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// MockPage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
enum Challenge {
    None,
    /// Blocked for the given number of body reads, forever when `None`.
    Blocked(Option<u32>),
}

/// A source page with a virtualized feed.
#[derive(Debug, Clone)]
pub struct MockPage {
    items: Vec<MockItem>,
    initial: Option<usize>,
    batch: usize,
    window: Option<usize>,
    has_container: bool,
    challenge: Challenge,
    failing_body_reads: bool,
    body_read_delay: Option<Duration>,
    hanging_navigation: bool,
    reported_url: Option<String>,
    failing_card_queries: u32,
    name: Option<String>,
    og_title: Option<String>,
    title: String,
    popup: Option<String>,
    rendered: usize,
    body_reads: u32,
}

impl MockPage {
    /// Every item rendered up front.
    pub fn new(items: Vec<MockItem>) -> Self {
        let rendered = items.len();
        Self {
            items,
            initial: None,
            batch: 0,
            window: None,
            has_container: true,
            challenge: Challenge::None,
            failing_body_reads: false,
            body_read_delay: None,
            hanging_navigation: false,
            reported_url: None,
            failing_card_queries: 0,
            name: None,
            og_title: None,
            title: String::new(),
            popup: None,
            rendered,
            body_reads: 0,
        }
    }

    /// `initial` items rendered at load, `batch` more per successful scroll.
    pub fn revealing(mut self, initial: usize, batch: usize) -> Self {
        let initial = initial.min(self.items.len());
        self.initial = Some(initial);
        self.rendered = initial;
        self.batch = batch;
        self
    }

    /// Only the last `n` rendered items stay in the document.
    pub fn with_window(mut self, n: usize) -> Self {
        self.window = Some(n);
        self
    }

    pub fn challenged(mut self) -> Self {
        self.challenge = Challenge::Blocked(None);
        self
    }

    /// Stays challenged for `reads` body reads, then clears.
    pub fn clearing_after(mut self, reads: u32) -> Self {
        self.challenge = Challenge::Blocked(Some(reads));
        self
    }

    pub fn failing_body_reads(mut self) -> Self {
        self.failing_body_reads = true;
        self
    }

    /// Every body read takes `delay` before answering.
    pub fn slow_body_reads(mut self, delay: Duration) -> Self {
        self.body_read_delay = Some(delay);
        self
    }

    /// Navigating here never completes.
    pub fn hanging_navigation(mut self) -> Self {
        self.hanging_navigation = true;
        self
    }

    /// Address reported by `current_url` once loaded.
    pub fn at_url(mut self, url: &str) -> Self {
        self.reported_url = Some(url.to_string());
        self
    }

    pub fn without_container(mut self) -> Self {
        self.has_container = false;
        self
    }

    /// The next `n` item queries fail.
    pub fn failing_card_queries(mut self, n: u32) -> Self {
        self.failing_card_queries = n;
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_og_title(mut self, title: &str) -> Self {
        self.og_title = Some(title.to_string());
        self
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }

    /// A dismissable overlay button labelled `label`.
    pub fn with_popup(mut self, label: &str) -> Self {
        self.popup = Some(label.to_string());
        self
    }

    fn visible(&self) -> &[MockItem] {
        let rendered = &self.items[..self.rendered.min(self.items.len())];
        match self.window {
            Some(n) => &rendered[rendered.len().saturating_sub(n)..],
            None => rendered,
        }
    }

    fn item(&self, position: u64) -> Result<&MockItem> {
        self.items
            .iter()
            .find(|i| i.position == position)
            .ok_or_else(|| anyhow!("stale element handle for position {position}"))
    }

    fn item_mut(&mut self, position: u64) -> Result<&mut MockItem> {
        self.items
            .iter_mut()
            .find(|i| i.position == position)
            .ok_or_else(|| anyhow!("stale element handle for position {position}"))
    }

    fn blocked_now(&self) -> bool {
        match self.challenge {
            Challenge::None => false,
            Challenge::Blocked(None) => true,
            Challenge::Blocked(Some(reads)) => self.body_reads <= reads,
        }
    }

    fn scroll(&mut self) -> Value {
        let before = self.rendered as f64 * ITEM_HEIGHT;
        let moved = self.batch > 0 && self.rendered < self.items.len();
        if moved {
            self.rendered = (self.rendered + self.batch).min(self.items.len());
        }
        json!({
            "moved": moved,
            "before": before,
            "after": self.rendered as f64 * ITEM_HEIGHT,
            "clientHeight": VIEWPORT_HEIGHT,
            "scrollHeight": self.items.len() as f64 * ITEM_HEIGHT,
        })
    }
}

// ---------------------------------------------------------------------------
// MockSurface
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockState {
    pages: HashMap<String, MockPage>,
    current: Option<String>,
    navigations: u32,
    scroll_calls: u32,
    wheel_calls: u32,
    last_wheel_delta: Option<f64>,
    fronted: u32,
    reply_clicks: u32,
    expand_scripts: u32,
    popup_clicks: u32,
    blocked_resources: bool,
    releases: u32,
}

/// In-memory [`Surface`]. Addresses must be registered before navigating
/// to them; unknown addresses fail like an unreachable host.
pub struct MockSurface {
    selectors: Selectors,
    default_url: String,
    state: Mutex<MockState>,
}

impl MockSurface {
    pub fn new() -> Self {
        Self {
            selectors: Selectors::default(),
            default_url: DEFAULT_URL.to_string(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// One page at [`DEFAULT_URL`], already loaded.
    pub fn single(page: MockPage) -> Self {
        let surface = Self::new().with_page(DEFAULT_URL, page);
        surface.state.lock().unwrap().current = Some(DEFAULT_URL.to_string());
        surface
    }

    pub fn with_page(self, url: &str, page: MockPage) -> Self {
        self.state.lock().unwrap().pages.insert(url.to_string(), page);
        self
    }

    pub fn default_url(&self) -> &str {
        &self.default_url
    }

    /// Handle of the item card at `position`.
    pub fn card(&self, position: u64) -> ElementRef {
        handle(position, CARD)
    }

    pub fn visible_positions(&self) -> Vec<u64> {
        self.read_page(|p| p.visible().iter().map(|i| i.position).collect())
    }

    pub fn text_reads(&self, position: u64) -> u32 {
        self.read_page(|p| p.item(position).map(|i| i.text_reads).unwrap_or_default())
    }

    pub fn expand_clicks(&self, position: u64) -> u32 {
        self.read_page(|p| p.item(position).map(|i| i.clicks).unwrap_or_default())
    }

    pub fn reply_clicks(&self) -> u32 {
        self.state.lock().unwrap().reply_clicks
    }

    /// Expansion script runs across all items.
    pub fn expand_scripts(&self) -> u32 {
        self.state.lock().unwrap().expand_scripts
    }

    pub fn popup_clicks(&self) -> u32 {
        self.state.lock().unwrap().popup_clicks
    }

    pub fn scroll_calls(&self) -> u32 {
        self.state.lock().unwrap().scroll_calls
    }

    pub fn wheel_calls(&self) -> u32 {
        self.state.lock().unwrap().wheel_calls
    }

    pub fn last_wheel_delta(&self) -> Option<f64> {
        self.state.lock().unwrap().last_wheel_delta
    }

    pub fn fronted(&self) -> u32 {
        self.state.lock().unwrap().fronted
    }

    pub fn navigations(&self) -> u32 {
        self.state.lock().unwrap().navigations
    }

    pub fn blocked_resources(&self) -> bool {
        self.state.lock().unwrap().blocked_resources
    }

    pub fn releases(&self) -> u32 {
        self.state.lock().unwrap().releases
    }

    fn read_page<R: Default>(&self, f: impl FnOnce(&MockPage) -> R) -> R {
        let state = self.state.lock().unwrap();
        state
            .current
            .as_ref()
            .and_then(|url| state.pages.get(url))
            .map(f)
            .unwrap_or_default()
    }

    fn on_current<R>(&self, f: impl FnOnce(&mut MockPage) -> Result<R>) -> Result<R> {
        let mut state = self.state.lock().unwrap();
        let url = state.current.clone().ok_or_else(|| anyhow!("no page loaded"))?;
        let page = state
            .pages
            .get_mut(&url)
            .ok_or_else(|| anyhow!("page vanished: {url}"))?;
        f(page)
    }

    fn is_card_selector(&self, selector: &str) -> bool {
        self.selectors.card_candidates.iter().any(|s| s == selector)
    }

    fn is_content_ready_query(&self, selector: &str) -> bool {
        self.selectors.card_candidates.iter().any(|card| {
            self.selectors
                .content_ready
                .iter()
                .any(|ready| selector == format!("{card} {ready}"))
        })
    }
}

impl Default for MockSurface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Surface for MockSurface {
    async fn navigate(&self, url: &str) -> Result<()> {
        let hangs = self
            .state
            .lock()
            .unwrap()
            .pages
            .get(url)
            .is_some_and(|p| p.hanging_navigation);
        if hangs {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        let Some(page) = state.pages.get_mut(url) else {
            bail!("net::ERR_NAME_NOT_RESOLVED at {url}");
        };
        page.rendered = page.initial.unwrap_or(page.items.len());
        state.current = Some(url.to_string());
        state.navigations += 1;
        Ok(())
    }

    async fn current_url(&self) -> Result<String> {
        let state = self.state.lock().unwrap();
        let url = state.current.clone().ok_or_else(|| anyhow!("no page loaded"))?;
        let reported = state.pages.get(&url).and_then(|p| p.reported_url.clone());
        Ok(reported.unwrap_or(url))
    }

    async fn title(&self) -> Result<String> {
        self.on_current(|p| Ok(p.title.clone()))
    }

    async fn query(&self, selector: &str) -> Result<Vec<ElementRef>> {
        let selectors = &self.selectors;
        self.on_current(|p| {
            if selectors.container_candidates.iter().any(|s| s == selector) {
                return Ok(if p.has_container {
                    vec![handle(0, CONTAINER)]
                } else {
                    vec![]
                });
            }
            if self.is_card_selector(selector) {
                if p.failing_card_queries > 0 {
                    p.failing_card_queries -= 1;
                    bail!("execution context was destroyed");
                }
                return Ok(p.visible().iter().map(|i| handle(i.position, CARD)).collect());
            }
            if self.is_content_ready_query(selector) {
                return Ok(p
                    .visible()
                    .first()
                    .map(|i| vec![handle(i.position, CARD)])
                    .unwrap_or_default());
            }
            let found = if selector == "body" {
                Some(handle(0, BODY))
            } else if selectors.listing_name.iter().any(|s| s == selector) {
                p.name.as_ref().map(|_| handle(0, HEADING))
            } else if selector == selectors.og_title {
                p.og_title.as_ref().map(|_| handle(0, OG_TITLE))
            } else if selector == selectors.clickable {
                p.popup.as_ref().map(|_| handle(0, POPUP))
            } else {
                None
            };
            Ok(found.into_iter().collect())
        })
    }

    async fn query_within(&self, scope: ElementRef, selector: &str) -> Result<Vec<ElementRef>> {
        let (position, kind) = decode(scope);
        if position == 0 || kind != CARD {
            return Ok(vec![]);
        }
        let selectors = &self.selectors;
        self.on_current(|p| {
            let item = p.item(position)?;
            let mut found = Vec::new();
            if selector == selectors.text {
                if item.has_text {
                    found.push(handle(position, TEXT));
                }
            } else if selector == selectors.author_link {
                found.push(handle(position, AUTHOR));
            } else if selector == selectors.caption {
                if !item.caption.is_empty() {
                    found.push(handle(position, CAPTION));
                }
            } else if selector == selectors.rating_meta {
                found.push(handle(position, RATING));
            } else if selector == selectors.date_meta {
                found.push(handle(position, DATE));
            }
            Ok(found)
        })
    }

    async fn inner_text(&self, element: ElementRef) -> Result<String> {
        let (position, kind) = decode(element);
        if (position, kind) == (0, BODY) {
            if let Some(delay) = self.read_page(|p| p.body_read_delay) {
                tokio::time::sleep(delay).await;
            }
        }
        self.on_current(|p| {
            if position == 0 {
                return match kind {
                    BODY => {
                        if p.failing_body_reads {
                            bail!("body read failed");
                        }
                        p.body_reads += 1;
                        Ok(if p.blocked_now() {
                            CHALLENGE_TEXT.to_string()
                        } else {
                            NORMAL_BODY_TEXT.to_string()
                        })
                    }
                    HEADING => Ok(p.name.clone().unwrap_or_default()),
                    POPUP => Ok(p.popup.clone().unwrap_or_default()),
                    _ => bail!("element has no text"),
                };
            }
            let item = p.item_mut(position)?;
            match kind {
                TEXT => {
                    if item.failing_text_reads > 0 {
                        item.failing_text_reads -= 1;
                        bail!("node is detached from document");
                    }
                    item.text_reads += 1;
                    Ok(item.current_text().to_string())
                }
                CAPTION => Ok(item.caption.clone()),
                _ => Ok(String::new()),
            }
        })
    }

    async fn attribute(&self, element: ElementRef, name: &str) -> Result<Option<String>> {
        let (position, kind) = decode(element);
        let position_attribute = self.selectors.position_attribute.as_str();
        self.on_current(|p| {
            if position == 0 {
                return Ok(match (kind, name) {
                    (OG_TITLE, "content") => p.og_title.clone(),
                    _ => None,
                });
            }
            let item = p.item(position)?;
            Ok(match (kind, name) {
                (CARD, n) if n == position_attribute => Some(item.position.to_string()),
                (AUTHOR, "href") => Some(format!("/maps/user/{}/", item.author)),
                (RATING, "content") => Some(item.rating.clone()),
                (DATE, "content") => Some(item.date.clone()),
                _ => None,
            })
        })
    }

    async fn evaluate(&self, element: ElementRef, script: &str, args: Value) -> Result<Value> {
        let (position, kind) = decode(element);
        if script == SCROLL_SCRIPT {
            if position != 0 || kind != CONTAINER {
                bail!("scroll script run on a non-container element");
            }
            let value = self.on_current(|p| Ok(p.scroll()))?;
            self.state.lock().unwrap().scroll_calls += 1;
            return Ok(value);
        }
        if script == EXPAND_SCRIPT {
            if position == 0 || kind != CARD {
                bail!("expand script run outside an item card");
            }
            let labelled = args["labels"]
                .as_array()
                .is_some_and(|labels| labels.iter().any(|l| l.as_str() == Some(EXPAND_LABEL)));
            let reply_hinted = args["classHints"].as_array().is_some_and(|hints| {
                hints
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|h| REPLY_CONTROL_CLASS.contains(h))
            });
            let (clicks, reply_clicked) = self.on_current(|p| {
                let item = p.item_mut(position)?;
                let mut clicks = 0u32;
                if labelled && item.expandable_control() {
                    item.clicks += 1;
                    clicks += 1;
                }
                let reply_clicked = labelled && item.reply_control && !reply_hinted;
                if reply_clicked {
                    clicks += 1;
                }
                Ok((clicks, reply_clicked))
            })?;
            let mut state = self.state.lock().unwrap();
            state.expand_scripts += 1;
            if reply_clicked {
                state.reply_clicks += 1;
            }
            return Ok(json!(clicks));
        }
        bail!("unexpected script")
    }

    async fn click(&self, element: ElementRef) -> Result<()> {
        if decode(element) == (0, POPUP) {
            self.on_current(|p| {
                p.popup = None;
                Ok(())
            })?;
            self.state.lock().unwrap().popup_clicks += 1;
        }
        Ok(())
    }

    async fn wheel(&self, _element: ElementRef, delta_y: f64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.wheel_calls += 1;
        state.last_wheel_delta = Some(delta_y);
        Ok(())
    }

    async fn bring_to_front(&self) -> Result<()> {
        self.state.lock().unwrap().fronted += 1;
        Ok(())
    }

    async fn block_heavy_resources(&self) -> Result<()> {
        self.state.lock().unwrap().blocked_resources = true;
        Ok(())
    }

    async fn release_handles(&self) {
        self.state.lock().unwrap().releases += 1;
    }
}

// ---------------------------------------------------------------------------
// ScriptedChannel
// ---------------------------------------------------------------------------

/// Operator channel fed from a fixed list of input lines. Closed once the
/// lines run out.
pub struct ScriptedChannel {
    commands: Mutex<VecDeque<OperatorCommand>>,
    notes: Mutex<Vec<String>>,
}

impl ScriptedChannel {
    pub fn new(lines: &[&str]) -> Self {
        Self {
            commands: Mutex::new(lines.iter().map(|l| OperatorCommand::parse(l)).collect()),
            notes: Mutex::new(Vec::new()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    pub fn notes(&self) -> Vec<String> {
        self.notes.lock().unwrap().clone()
    }
}

#[async_trait]
impl OperatorChannel for ScriptedChannel {
    async fn notify(&self, message: &str) {
        self.notes.lock().unwrap().push(message.to_string());
    }

    async fn next_command(&self) -> Option<OperatorCommand> {
        self.commands.lock().unwrap().pop_front()
    }
}

// ---------------------------------------------------------------------------
// VecSink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct VecSink {
    pub records: Vec<ReviewRecord>,
    pub flushes: u32,
    fail_after: Option<usize>,
}

impl VecSink {
    /// Accepts `n` records, then every append fails.
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Default::default()
        }
    }

    pub fn texts(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.text.as_str()).collect()
    }
}

impl RecordSink for VecSink {
    fn append(&mut self, record: &ReviewRecord) -> Result<(), HarvestError> {
        if self.fail_after.is_some_and(|n| self.records.len() >= n) {
            return Err(HarvestError::Io(std::io::Error::other("disk full")));
        }
        self.records.push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), HarvestError> {
        self.flushes += 1;
        Ok(())
    }
}
