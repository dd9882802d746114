//! Expand-then-read for a single feed item.
//!
//! Long reviews render cut off behind an "expand" control that may be a
//! button, a link or a bare span, and the control sits outside the text node,
//! so the text alone ending in "…" is the only hint that expansion failed.
//! Clicking is retried exactly once when the text still looks truncated.
//!
//! Finding and clicking the controls happens in one page-side script per
//! attempt, so a card with many buttons costs a single round trip.

use std::time::Duration;

use anyhow::Result;
use harvest_common::{ElementRef, Selectors};
use serde_json::json;
use tracing::debug;

use crate::record::{looks_truncated, normalize_text};
use crate::traits::Surface;

/// Attempts per item: the first read plus one retry.
pub const MAX_ATTEMPTS: usize = 2;

/// Clicks every control under the item whose trimmed label is one of
/// `args.labels`, except those inside a reply/comment thread. A control
/// counts as in a thread when its aria-label or any ancestor class up to the
/// enclosing list item matches a hint; a control whose placement can't be
/// read is left alone. Returns the number of clicks that went through.
pub const EXPAND_SCRIPT: &str = r#"function(args) {
    const inSubThread = (control) => {
        const aria = (control.getAttribute('aria-label') || '').toLowerCase();
        if (args.ariaHints.some(h => aria.includes(h))) return true;
        let node = control;
        while (node && node.getAttribute && node.getAttribute('role') !== 'listitem') {
            const cls = (typeof node.className === 'string' ? node.className : '').toLowerCase();
            if (args.classHints.some(h => cls.includes(h))) return true;
            node = node.parentElement;
        }
        return false;
    };
    let clicks = 0;
    for (const control of this.querySelectorAll(args.clickable)) {
        try {
            const label = (control.innerText || '').trim();
            if (!args.labels.includes(label) || inSubThread(control)) continue;
            control.click();
            clicks += 1;
        } catch (e) {}
    }
    return clicks;
}"#;

const ARIA_HINTS: &[&str] = &["ответ"];
const CLASS_HINTS: &[&str] = &["answer", "reply", "comment"];

#[derive(Debug, Clone)]
pub struct ExpansionSettings {
    /// Settle delay after clicking, per attempt.
    pub settle: [Duration; MAX_ATTEMPTS],
}

impl Default for ExpansionSettings {
    fn default() -> Self {
        Self {
            settle: [Duration::from_millis(70), Duration::from_millis(110)],
        }
    }
}

impl ExpansionSettings {
    pub fn immediate() -> Self {
        Self {
            settle: [Duration::ZERO; MAX_ATTEMPTS],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedText {
    pub text: String,
    /// Still ends in an ellipsis after every attempt. Reported, not acted on.
    pub still_truncated: bool,
    pub clicks: u32,
}

pub async fn expand_and_read(
    surface: &dyn Surface,
    selectors: &Selectors,
    settings: &ExpansionSettings,
    item: ElementRef,
) -> Result<ExpandedText> {
    let mut clicks = 0u32;
    let mut text = String::new();

    for attempt in 0..MAX_ATTEMPTS {
        clicks += click_expanders(surface, selectors, item).await?;
        if clicks > 0 {
            tokio::time::sleep(settings.settle[attempt]).await;
        }
        text = read_text(surface, selectors, item).await?;
        if !looks_truncated(&text) {
            break;
        }
        debug!(attempt, clicks, "Text still looks truncated");
    }

    Ok(ExpandedText {
        still_truncated: looks_truncated(&text),
        text,
        clicks,
    })
}

/// Click every expand control belonging to the item itself. Returns how
/// many clicks went through.
async fn click_expanders(
    surface: &dyn Surface,
    selectors: &Selectors,
    item: ElementRef,
) -> Result<u32> {
    let args = json!({
        "clickable": selectors.clickable,
        "labels": selectors.expand_labels,
        "ariaHints": ARIA_HINTS,
        "classHints": CLASS_HINTS,
    });
    let clicks = surface.evaluate(item, EXPAND_SCRIPT, args).await?;
    Ok(clicks.as_u64().unwrap_or_default() as u32)
}

async fn read_text(surface: &dyn Surface, selectors: &Selectors, item: ElementRef) -> Result<String> {
    let node = match surface.first_within(item, &selectors.text).await? {
        Some(node) => Some(node),
        None => surface.first_within(item, &selectors.text_fallback).await?,
    };
    match node {
        Some(node) => Ok(normalize_text(&surface.inner_text(node).await?)),
        None => Ok(String::new()),
    }
}
