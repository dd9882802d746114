//! Run driver: every source in order, one at a time, on one surface.

use std::time::Duration;

use anyhow::Result;
use harvest_common::{HarvestConfig, Selectors};
use tracing::{info, info_span, warn, Instrument};

use crate::collector::{Collector, CollectorSettings, StopReason};
use crate::dedup::SeenKeys;
use crate::detector::Detector;
use crate::page::{self, PageTimings, Preparation};
use crate::recovery::RecoveryHandler;
use crate::sink::RecordSink;
use crate::stats::{RunStats, SourceReport, SourceStatus};
use crate::traits::Surface;

const CHALLENGE_REASON: &str = "captcha";

pub struct Harvester<'a> {
    surface: &'a dyn Surface,
    recovery: &'a dyn RecoveryHandler,
    selectors: Selectors,
    detector: Detector,
    settings: CollectorSettings,
    timings: PageTimings,
    source_delay: Duration,
    block_resources: bool,
}

impl<'a> Harvester<'a> {
    pub fn new(
        surface: &'a dyn Surface,
        recovery: &'a dyn RecoveryHandler,
        config: &HarvestConfig,
    ) -> Self {
        Self {
            surface,
            recovery,
            selectors: Selectors::default(),
            detector: Detector::default(),
            settings: CollectorSettings::from_config(config),
            timings: PageTimings::from_config(config),
            source_delay: config.source_delay,
            block_resources: config.block_resources,
        }
    }

    pub fn with_settings(mut self, settings: CollectorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_timings(mut self, timings: PageTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_source_delay(mut self, delay: Duration) -> Self {
        self.source_delay = delay;
        self
    }

    pub fn with_detector(mut self, detector: Detector) -> Self {
        self.detector = detector;
        self
    }

    /// Harvest `sources` in order. Source-level problems become report
    /// entries; only output failures end the run early with an error.
    pub async fn run(
        &self,
        sources: &[String],
        seen: &mut SeenKeys,
        sink: &mut dyn RecordSink,
    ) -> Result<RunStats> {
        let mut stats = RunStats::new(sources.len());

        if self.block_resources {
            match self.surface.block_heavy_resources().await {
                Ok(()) => info!("Heavy sub-resources blocked"),
                Err(e) => warn!(error = %e, "Resource blocking unavailable, continuing without it"),
            }
        }

        let total = sources.len();
        for (i, url) in sources.iter().enumerate() {
            let index = i + 1;
            let span = info_span!("source", index, total, url = url.as_str());
            let report = self.harvest_source(url, seen, sink).instrument(span).await?;

            println!("{}", report.progress_line(index, total));
            let aborted = report.status == SourceStatus::Aborted;
            stats.record(report);

            if aborted {
                info!("Operator abort, stopping run");
                break;
            }
            if index < total {
                tokio::time::sleep(self.source_delay).await;
            }
        }

        Ok(stats)
    }

    async fn harvest_source(
        &self,
        url: &str,
        seen: &mut SeenKeys,
        sink: &mut dyn RecordSink,
    ) -> Result<SourceReport> {
        let prepared = page::prepare(
            self.surface,
            &self.selectors,
            &self.detector,
            self.recovery,
            &self.timings,
            url,
        )
        .await;

        let target = match prepared {
            Ok(Preparation::Ready(target)) => target,
            Ok(Preparation::Skipped) => {
                return Ok(SourceReport::new(
                    url,
                    SourceStatus::Skipped(CHALLENGE_REASON.to_string()),
                ))
            }
            Ok(Preparation::Aborted) => return Ok(SourceReport::new(url, SourceStatus::Aborted)),
            Err(e) => {
                warn!(url, error = %e, "Source abandoned");
                self.surface.release_handles().await;
                return Ok(SourceReport::new(url, SourceStatus::Failed(format!("{e:#}"))));
            }
        };

        let collector = Collector::new(
            self.surface,
            &self.selectors,
            &self.detector,
            self.recovery,
            &self.settings,
        );
        let outcome = collector.collect(&target, seen, sink).await?;

        info!(
            url,
            outcome = %outcome.outcome,
            emitted = outcome.emitted,
            watermark = outcome.watermark,
            rounds = outcome.rounds,
            expand_clicks = outcome.expand_clicks,
            still_truncated = outcome.still_truncated,
            items_skipped = outcome.skipped,
            "Source finished"
        );

        let status = match outcome.outcome {
            StopReason::Skipped => SourceStatus::Skipped(CHALLENGE_REASON.to_string()),
            StopReason::Aborted => SourceStatus::Aborted,
            reason => SourceStatus::Completed(reason),
        };
        Ok(SourceReport {
            url: url.to_string(),
            status,
            emitted: outcome.emitted,
            expand_clicks: outcome.expand_clicks,
            still_truncated: outcome.still_truncated,
            items_skipped: outcome.skipped,
        })
    }
}
