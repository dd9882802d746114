//! Incremental collection loop for one source.
//!
//! Each round: check for a challenge, read items past the position
//! watermark, expand and key them, append the new ones, flush, then decide
//! whether to scroll for more. Rounds are strictly sequential and every
//! round ends with a flush, so a crash loses at most the round in flight.
//!
//! Watermark semantics: the highest position *fully processed*. Items are
//! handled in ascending position order and a failed read ends the round at
//! that item, so the watermark never jumps over something not yet read.
//! An item whose read fails in [`MAX_ITEM_FAILURES`] rounds is given up on
//! and counted as skipped, so one broken card cannot starve the feed.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use harvest_common::{ElementRef, HarvestConfig, Selectors};
use tracing::{debug, info, warn};

use crate::dedup::SeenKeys;
use crate::detector::Detector;
use crate::expansion::{expand_and_read, ExpansionSettings};
use crate::record::{author_id_from_href, Candidate, Listing};
use crate::recovery::{RecoveryDecision, RecoveryHandler};
use crate::scroll;
use crate::sink::RecordSink;
use crate::traits::Surface;

/// Rounds an item read may fail before the item is skipped.
pub const MAX_ITEM_FAILURES: u32 = 2;

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub max_rounds: u32,
    pub stall_limit: u32,
    /// 0 means unlimited.
    pub max_records: u32,
    pub scroll_step_ratio: f64,
    pub round_delay: Duration,
    pub expansion: ExpansionSettings,
}

impl CollectorSettings {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            max_rounds: config.max_rounds,
            stall_limit: config.stall_limit,
            max_records: config.max_records_per_source,
            scroll_step_ratio: config.scroll_step_ratio,
            round_delay: config.scroll_delay,
            expansion: ExpansionSettings::default(),
        }
    }
}

/// Why collection for a source ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// No watermark progress for `stall_limit` rounds.
    Exhausted,
    /// Per-source record cap reached.
    CapReached,
    /// `max_rounds` used up while still making progress.
    RoundBudgetSpent,
    /// Challenge page, recovery chose to skip the source.
    Skipped,
    /// Challenge page, operator stopped the run.
    Aborted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Exhausted => "exhausted",
            StopReason::CapReached => "cap reached",
            StopReason::RoundBudgetSpent => "round budget spent",
            StopReason::Skipped => "skipped (challenge)",
            StopReason::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Per-source, in-memory only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionState {
    pub watermark: u64,
    pub stall_count: u32,
    pub emitted: u32,
    /// Failed read rounds per position not yet processed.
    pub read_failures: HashMap<u64, u32>,
    pub skipped: u32,
}

impl CollectionState {
    /// Count a failed read of `position`. Returns true once the item has
    /// used up its retries and should be skipped.
    pub fn note_read_failure(&mut self, position: u64) -> bool {
        let failures = self.read_failures.entry(position).or_insert(0);
        *failures += 1;
        if *failures >= MAX_ITEM_FAILURES {
            self.read_failures.remove(&position);
            self.skipped += 1;
            true
        } else {
            false
        }
    }

    /// Fold the highest position processed this round into the watermark.
    /// Returns whether the watermark moved.
    pub fn advance(&mut self, highest_processed: Option<u64>) -> bool {
        match highest_processed {
            Some(position) if position > self.watermark => {
                self.watermark = position;
                self.stall_count = 0;
                true
            }
            _ => {
                self.stall_count += 1;
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionReport {
    pub outcome: StopReason,
    pub emitted: u32,
    pub watermark: u64,
    pub rounds: u32,
    pub expand_clicks: u32,
    pub still_truncated: u32,
    /// Items given up on after repeated read failures.
    pub skipped: u32,
}

/// A prepared feed: which source it is and how to find its parts.
#[derive(Debug, Clone)]
pub struct FeedTarget {
    pub listing: Listing,
    pub container_selector: String,
    pub card_selector: String,
}

#[derive(Default)]
struct RoundBatch {
    candidates: Vec<Candidate>,
    highest_processed: Option<u64>,
}

#[derive(Default)]
struct Diagnostics {
    rounds: u32,
    expand_clicks: u32,
    still_truncated: u32,
}

pub struct Collector<'a> {
    surface: &'a dyn Surface,
    selectors: &'a Selectors,
    detector: &'a Detector,
    recovery: &'a dyn RecoveryHandler,
    settings: &'a CollectorSettings,
}

impl<'a> Collector<'a> {
    pub fn new(
        surface: &'a dyn Surface,
        selectors: &'a Selectors,
        detector: &'a Detector,
        recovery: &'a dyn RecoveryHandler,
        settings: &'a CollectorSettings,
    ) -> Self {
        Self {
            surface,
            selectors,
            detector,
            recovery,
            settings,
        }
    }

    /// Run the loop until the source is exhausted, capped, out of rounds,
    /// skipped or aborted. Surface problems never escape; the only error is
    /// a failure to write the output.
    pub async fn collect(
        &self,
        target: &FeedTarget,
        seen: &mut SeenKeys,
        sink: &mut dyn RecordSink,
    ) -> Result<CollectionReport> {
        let url = target.listing.source_url.as_str();
        let mut state = CollectionState::default();
        let mut diag = Diagnostics::default();

        for round in 0..self.settings.max_rounds {
            diag.rounds = round + 1;

            if self.detector.is_blocked(self.surface).await {
                match self.recovery.recover(self.surface, url).await {
                    RecoveryDecision::Continue => {}
                    RecoveryDecision::SkipSource => {
                        return Ok(finish(StopReason::Skipped, &state, &diag));
                    }
                    RecoveryDecision::Abort => {
                        return Ok(finish(StopReason::Aborted, &state, &diag));
                    }
                }
            }

            let batch = match self.extract_round(target, &mut state).await {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(url, round, error = %e, "Item query failed, counting round as stalled");
                    RoundBatch::default()
                }
            };

            let mut written = 0u32;
            for candidate in batch.candidates {
                diag.expand_clicks += candidate.expand_clicks;
                if candidate.still_truncated {
                    diag.still_truncated += 1;
                    debug!(url, position = candidate.position, "Item text still looks truncated");
                }
                if candidate.text.is_empty() {
                    continue;
                }

                let key = candidate.key(&target.listing);
                if !seen.is_new(&key) {
                    continue;
                }
                let record = candidate.into_record(&target.listing, Utc::now());
                sink.append(&record)?;
                seen.mark_seen(key);
                state.emitted += 1;
                written += 1;

                if self.settings.max_records > 0 && state.emitted >= self.settings.max_records {
                    sink.flush()?;
                    info!(url, emitted = state.emitted, "Per-source record cap reached");
                    return Ok(finish(StopReason::CapReached, &state, &diag));
                }
            }
            sink.flush()?;

            state.advance(batch.highest_processed);
            self.surface.release_handles().await;

            debug!(
                url,
                round,
                watermark = state.watermark,
                written,
                emitted = state.emitted,
                stall_count = state.stall_count,
                expand_clicks = diag.expand_clicks,
                still_truncated = diag.still_truncated,
                "Round complete"
            );

            if state.stall_count >= self.settings.stall_limit {
                info!(
                    url,
                    watermark = state.watermark,
                    stalled_rounds = state.stall_count,
                    "No new items, treating feed as exhausted"
                );
                return Ok(finish(StopReason::Exhausted, &state, &diag));
            }

            scroll::advance(
                self.surface,
                &target.container_selector,
                self.settings.scroll_step_ratio,
            )
            .await;
            tokio::time::sleep(self.settings.round_delay).await;
        }

        Ok(finish(StopReason::RoundBudgetSpent, &state, &diag))
    }

    /// Read every visible item past the watermark, in position order.
    async fn extract_round(
        &self,
        target: &FeedTarget,
        state: &mut CollectionState,
    ) -> Result<RoundBatch> {
        let watermark = state.watermark;
        let cards = self.surface.query(&target.card_selector).await?;

        let mut fresh: Vec<(u64, ElementRef)> = Vec::new();
        for card in cards {
            match self.position_of(card).await {
                Ok(Some(position)) if position > watermark => fresh.push((position, card)),
                Ok(_) => {}
                Err(e) => debug!(error = %e, "Position read failed"),
            }
        }
        fresh.sort_by_key(|(position, _)| *position);
        fresh.dedup_by_key(|(position, _)| *position);

        let mut batch = RoundBatch::default();
        for (position, card) in fresh {
            match self.read_candidate(position, card).await {
                Ok(candidate) => {
                    state.read_failures.remove(&position);
                    batch.highest_processed = Some(position);
                    batch.candidates.push(candidate);
                }
                Err(e) => {
                    let url = target.listing.source_url.as_str();
                    if state.note_read_failure(position) {
                        warn!(url, position, error = %e, "Item read keeps failing, skipping it");
                        batch.highest_processed = Some(position);
                        continue;
                    }
                    warn!(url, position, error = %e, "Item read failed, retrying next round");
                    break;
                }
            }
        }
        Ok(batch)
    }

    async fn position_of(&self, card: ElementRef) -> Result<Option<u64>> {
        let raw = self
            .surface
            .attribute(card, &self.selectors.position_attribute)
            .await?;
        Ok(raw
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|p| *p > 0))
    }

    async fn read_candidate(&self, position: u64, card: ElementRef) -> Result<Candidate> {
        let expanded =
            expand_and_read(self.surface, self.selectors, &self.settings.expansion, card).await?;

        let href = self.attribute_of(card, &self.selectors.author_link, "href").await?;
        let caption = match self.surface.first_within(card, &self.selectors.caption).await? {
            Some(node) => self.surface.inner_text(node).await?.trim().to_string(),
            None => String::new(),
        };
        let rating_raw = self.attribute_of(card, &self.selectors.rating_meta, "content").await?;
        let date_iso = self.attribute_of(card, &self.selectors.date_meta, "content").await?;

        Ok(Candidate {
            position,
            author_id: author_id_from_href(&href),
            caption,
            rating_raw: rating_raw.trim().to_string(),
            date_iso: date_iso.trim().to_string(),
            text: expanded.text,
            expand_clicks: expanded.clicks,
            still_truncated: expanded.still_truncated,
        })
    }

    /// Attribute of the first descendant matching `selector`; empty when
    /// either is missing.
    async fn attribute_of(&self, card: ElementRef, selector: &str, name: &str) -> Result<String> {
        match self.surface.first_within(card, selector).await? {
            Some(node) => Ok(self.surface.attribute(node, name).await?.unwrap_or_default()),
            None => Ok(String::new()),
        }
    }
}

fn finish(outcome: StopReason, state: &CollectionState, diag: &Diagnostics) -> CollectionReport {
    CollectionReport {
        outcome,
        emitted: state.emitted,
        watermark: state.watermark,
        rounds: diag.rounds,
        expand_clicks: diag.expand_clicks,
        still_truncated: diag.still_truncated,
        skipped: state.skipped,
    }
}
