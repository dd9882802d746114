use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tracing::info;

use crate::error::HarvestError;

/// Where the browser comes from: a local Chromium launch or a remote
/// DevTools endpoint (Browserless or `--remote-debugging-port`).
#[derive(Debug, Clone, Default)]
pub struct BrowserEndpoint {
    pub chrome_bin: Option<String>,
    pub browserless_url: Option<String>,
    pub browserless_token: Option<String>,
}

impl BrowserEndpoint {
    /// Load from `CHROME_BIN`, `BROWSERLESS_URL` and `BROWSERLESS_TOKEN`.
    /// Unset or empty variables are treated as absent.
    pub fn from_env() -> Self {
        Self {
            chrome_bin: optional_env("CHROME_BIN"),
            browserless_url: optional_env("BROWSERLESS_URL"),
            browserless_token: optional_env("BROWSERLESS_TOKEN"),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.browserless_url.is_some()
    }
}

/// Harvester configuration. Defaults match a long unattended run against
/// a single review feed per source.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    // Files
    pub urls_path: PathBuf,
    pub out_path: PathBuf,

    // Run mode
    pub interactive: bool,
    pub block_resources: bool,

    // Collection loop
    pub max_rounds: u32,
    pub scroll_delay: Duration,
    pub scroll_step_ratio: f64,
    pub stall_limit: u32,
    /// 0 means unlimited.
    pub max_records_per_source: u32,
    pub source_delay: Duration,

    // Surface timeouts
    pub navigation_timeout: Duration,
    pub list_ready_timeout: Duration,
    pub content_ready_timeout: Duration,

    pub browser: BrowserEndpoint,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            urls_path: PathBuf::from("urls.txt"),
            out_path: PathBuf::from("reviews.jsonl"),
            interactive: false,
            block_resources: false,
            max_rounds: 20_000,
            scroll_delay: Duration::from_millis(250),
            scroll_step_ratio: 2.0,
            stall_limit: 200,
            max_records_per_source: 0,
            source_delay: Duration::from_secs(1),
            navigation_timeout: Duration::from_secs(120),
            list_ready_timeout: Duration::from_secs(30),
            content_ready_timeout: Duration::from_secs(20),
            browser: BrowserEndpoint::default(),
        }
    }
}

impl HarvestConfig {
    /// Reject settings the collection loop cannot make progress with.
    pub fn validate(&self) -> Result<(), HarvestError> {
        if !self.scroll_step_ratio.is_finite() || self.scroll_step_ratio <= 0.0 {
            return Err(HarvestError::Config(format!(
                "scroll step ratio must be a positive number, got {}",
                self.scroll_step_ratio
            )));
        }
        if self.stall_limit == 0 {
            return Err(HarvestError::Config(
                "stall limit must be at least 1".to_string(),
            ));
        }
        if self.max_rounds == 0 {
            return Err(HarvestError::Config(
                "max rounds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Log the effective configuration. The Browserless token is never printed.
    pub fn log_summary(&self) {
        info!(
            urls = %self.urls_path.display(),
            out = %self.out_path.display(),
            interactive = self.interactive,
            block_resources = self.block_resources,
            max_rounds = self.max_rounds,
            scroll_delay_ms = self.scroll_delay.as_millis() as u64,
            scroll_step_ratio = self.scroll_step_ratio,
            stall_limit = self.stall_limit,
            max_records_per_source = self.max_records_per_source,
            source_delay_ms = self.source_delay.as_millis() as u64,
            "Harvest configuration"
        );
        info!(
            remote = self.browser.is_remote(),
            chrome_bin = self.browser.chrome_bin.as_deref().unwrap_or("<default>"),
            browserless_url = self.browser.browserless_url.as_deref().unwrap_or("<none>"),
            browserless_token = if self.browser.browserless_token.is_some() { "<redacted>" } else { "<none>" },
            "Browser endpoint"
        );
    }
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(HarvestConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_step_ratio() {
        let config = HarvestConfig {
            scroll_step_ratio: 0.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(HarvestError::Config(_))));

        let config = HarvestConfig {
            scroll_step_ratio: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_stall_limit_and_rounds() {
        let config = HarvestConfig {
            stall_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = HarvestConfig {
            max_rounds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
