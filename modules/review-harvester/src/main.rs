use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use browser_surface::ChromeSurface;
use harvest_common::{BrowserEndpoint, HarvestConfig, HarvestError};
use review_harvester::dedup::SeenKeys;
use review_harvester::detector::Detector;
use review_harvester::harvest::Harvester;
use review_harvester::recovery::{OperatorRecovery, RecoveryHandler, SkipOnBlock, StdinChannel};
use review_harvester::sink::{JsonlSink, RecordSink};
use review_harvester::sources::load_sources;

/// Harvest review feeds into an append-only JSONL file.
#[derive(Parser, Debug)]
#[command(name = "review-harvester", version)]
struct Cli {
    /// Source list, one listing address per line.
    #[arg(long, default_value = "urls.txt")]
    urls: PathBuf,

    /// Output JSONL file; reopened in append mode and used for dedup on restart.
    #[arg(long, default_value = "reviews.jsonl")]
    out: PathBuf,

    /// Show the browser window and let an operator solve challenges.
    #[arg(long)]
    headful: bool,

    /// Skip loading images, fonts and media.
    #[arg(long)]
    block_resources: bool,

    #[arg(long, default_value_t = 20_000)]
    max_scroll_rounds: u32,

    #[arg(long, default_value_t = 250)]
    scroll_delay_ms: u64,

    /// Scroll step as a multiple of the viewport height.
    #[arg(long, default_value_t = 2.0)]
    scroll_step_ratio: f64,

    /// Rounds without new items before a feed counts as exhausted.
    #[arg(long, default_value_t = 200)]
    no_progress_limit: u32,

    /// Per-source record cap, 0 for unlimited.
    #[arg(long, default_value_t = 0)]
    max_reviews: u32,

    #[arg(long, default_value_t = 1.0)]
    page_delay_sec: f64,

    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn into_config(self) -> Result<HarvestConfig, HarvestError> {
        let source_delay = Duration::try_from_secs_f64(self.page_delay_sec).map_err(|e| {
            HarvestError::Config(format!(
                "--page-delay-sec must be a finite, non-negative number of seconds, got {} ({e})",
                self.page_delay_sec
            ))
        })?;
        Ok(HarvestConfig {
            urls_path: self.urls,
            out_path: self.out,
            interactive: self.headful,
            block_resources: self.block_resources,
            max_rounds: self.max_scroll_rounds,
            scroll_delay: Duration::from_millis(self.scroll_delay_ms),
            scroll_step_ratio: self.scroll_step_ratio,
            stall_limit: self.no_progress_limit,
            max_records_per_source: self.max_reviews,
            source_delay,
            browser: BrowserEndpoint::from_env(),
            ..Default::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.debug {
        "review_harvester=debug"
    } else {
        "review_harvester=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let config = cli.into_config()?;
    config.validate()?;

    let run_id = Uuid::new_v4();
    run(config)
        .instrument(info_span!("run", %run_id))
        .await
}

async fn run(config: HarvestConfig) -> Result<()> {
    info!("Review harvester starting...");
    config.log_summary();

    let sources = load_sources(&config.urls_path)?;
    let mut seen = SeenKeys::load(&config.out_path)
        .with_context(|| format!("Failed to replay {}", config.out_path.display()))?;
    let mut sink = JsonlSink::open(&config.out_path)
        .with_context(|| format!("Output {} is not writable", config.out_path.display()))?;
    info!(
        sources = sources.len(),
        known_keys = seen.len(),
        "Loaded sources and existing output"
    );

    let surface = ChromeSurface::open(&config.browser, config.interactive)
        .await
        .map_err(|e| HarvestError::Surface(e.to_string()))
        .context("Failed to start or attach to the browser")?;

    let recovery: Box<dyn RecoveryHandler> = if config.interactive {
        Box::new(OperatorRecovery::new(StdinChannel::new(), Detector::default()))
    } else {
        Box::new(SkipOnBlock)
    };

    let harvester = Harvester::new(&surface, recovery.as_ref(), &config);
    let outcome = tokio::select! {
        result = harvester.run(&sources, &mut seen, &mut sink) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };

    sink.flush()?;
    surface.close().await;

    match outcome {
        Some(result) => {
            let stats = result?;
            println!("{stats}");
            info!(
                appended = sink.appended(),
                known_keys = seen.len(),
                out = %sink.path().display(),
                "Harvest finished"
            );
        }
        None => {
            warn!(appended = sink.appended(), "Interrupted, output flushed");
            println!("\nInterrupted by user. Progress already saved.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("review-harvester").chain(args.iter().copied()))
    }

    #[test]
    fn page_delay_becomes_source_delay() {
        let config = parse(&["--page-delay-sec", "0.5"]).into_config().unwrap();
        assert_eq!(config.source_delay, Duration::from_millis(500));
    }

    #[test]
    fn unusable_page_delay_is_a_config_error() {
        for bad in ["inf", "NaN", "-1"] {
            let arg = format!("--page-delay-sec={bad}");
            let err = parse(&[arg.as_str()]).into_config().unwrap_err();
            assert!(matches!(err, HarvestError::Config(_)), "{bad}: {err}");
        }
    }
}
