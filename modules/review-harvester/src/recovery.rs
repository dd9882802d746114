//! What to do when a source shows a challenge page.
//!
//! The collection loop only sees [`RecoveryHandler`]. Headless runs use
//! [`SkipOnBlock`]; headed runs put an operator in the loop through
//! [`OperatorRecovery`], which reads commands from an [`OperatorChannel`].

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::detector::Detector;
use crate::traits::Surface;

const OPERATOR_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    /// Challenge cleared; carry on with the current round.
    Continue,
    /// Give up on this source, move to the next one.
    SkipSource,
    /// Stop the whole run.
    Abort,
}

#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    async fn recover(&self, surface: &dyn Surface, source_url: &str) -> RecoveryDecision;
}

/// Nobody can solve a challenge in a headless run.
pub struct SkipOnBlock;

#[async_trait]
impl RecoveryHandler for SkipOnBlock {
    async fn recover(&self, _surface: &dyn Surface, source_url: &str) -> RecoveryDecision {
        warn!(
            url = source_url,
            "Challenge detected in non-interactive mode, skipping source (re-run headed to solve it)"
        );
        RecoveryDecision::SkipSource
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    ContinueCheck,
    Skip,
    Abort,
    Unknown(String),
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim().to_lowercase().as_str() {
            "" | "c" | "continue" | "continue-check" => OperatorCommand::ContinueCheck,
            "s" | "skip" => OperatorCommand::Skip,
            "q" | "quit" | "abort" => OperatorCommand::Abort,
            other => OperatorCommand::Unknown(other.to_string()),
        }
    }
}

/// Where operator commands come from and where prompts go.
#[async_trait]
pub trait OperatorChannel: Send + Sync {
    async fn notify(&self, message: &str);
    /// `None` once the channel is closed.
    async fn next_command(&self) -> Option<OperatorCommand>;
}

/// Operator prompt on the controlling terminal.
pub struct StdinChannel {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinChannel {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl Default for StdinChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OperatorChannel for StdinChannel {
    async fn notify(&self, message: &str) {
        println!("{message}");
    }

    async fn next_command(&self) -> Option<OperatorCommand> {
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(b"CAPTCHA> ").await;
        let _ = stdout.flush().await;

        match self.lines.lock().await.next_line().await {
            Ok(Some(line)) => Some(OperatorCommand::parse(&line)),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Operator input read failed");
                None
            }
        }
    }
}

pub struct OperatorRecovery<C> {
    channel: C,
    detector: Detector,
    poll_interval: Duration,
}

impl<C: OperatorChannel> OperatorRecovery<C> {
    pub fn new(channel: C, detector: Detector) -> Self {
        Self {
            channel,
            detector,
            poll_interval: OPERATOR_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }
}

#[async_trait]
impl<C: OperatorChannel> RecoveryHandler for OperatorRecovery<C> {
    async fn recover(&self, surface: &dyn Surface, source_url: &str) -> RecoveryDecision {
        if let Err(e) = surface.bring_to_front().await {
            warn!(error = %e, "Could not bring browser window to front");
        }

        let rule = "=".repeat(72);
        self.channel
            .notify(&format!(
                "\n{rule}\nCAPTCHA detected on {source_url}\n\
                 1) Solve it in the opened browser window.\n\
                 2) Then press Enter here (or type 'continue-check').\n\
                 Type 'skip' to skip this source, or 'abort' to stop the run.\n{rule}"
            ))
            .await;

        loop {
            match self.channel.next_command().await {
                None => {
                    warn!(url = source_url, "Operator channel closed, skipping source");
                    return RecoveryDecision::SkipSource;
                }
                Some(OperatorCommand::Abort) => {
                    info!(url = source_url, "Operator requested abort");
                    return RecoveryDecision::Abort;
                }
                Some(OperatorCommand::Skip) => {
                    info!(url = source_url, "Operator skipped source");
                    return RecoveryDecision::SkipSource;
                }
                Some(OperatorCommand::ContinueCheck) => {
                    if !self.detector.is_blocked(surface).await {
                        info!(url = source_url, "Challenge cleared, resuming");
                        return RecoveryDecision::Continue;
                    }
                    self.channel
                        .notify("Still on the challenge page. Solve it in the browser, then press Enter again.")
                        .await;
                }
                Some(OperatorCommand::Unknown(cmd)) => {
                    self.channel
                        .notify(&format!(
                            "Unknown command '{cmd}'. Use Enter/continue-check, skip or abort."
                        ))
                        .await;
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockItem, MockPage, MockSurface, ScriptedChannel};

    fn blocked_surface(clears_after: Option<u32>) -> MockSurface {
        let mut page = MockPage::new(vec![MockItem::new(1, "ok")]).challenged();
        if let Some(reads) = clears_after {
            page = page.clearing_after(reads);
        }
        MockSurface::single(page)
    }

    fn operator(commands: &[&str]) -> OperatorRecovery<ScriptedChannel> {
        OperatorRecovery::new(ScriptedChannel::new(commands), Detector::default())
            .with_poll_interval(Duration::ZERO)
    }

    #[test]
    fn command_parsing() {
        assert_eq!(OperatorCommand::parse(""), OperatorCommand::ContinueCheck);
        assert_eq!(OperatorCommand::parse(" Continue-Check "), OperatorCommand::ContinueCheck);
        assert_eq!(OperatorCommand::parse("s"), OperatorCommand::Skip);
        assert_eq!(OperatorCommand::parse("ABORT"), OperatorCommand::Abort);
        assert_eq!(OperatorCommand::parse("q"), OperatorCommand::Abort);
        assert_eq!(
            OperatorCommand::parse("help"),
            OperatorCommand::Unknown("help".to_string())
        );
    }

    #[tokio::test]
    async fn non_interactive_always_skips() {
        let surface = blocked_surface(None);
        let decision = SkipOnBlock.recover(&surface, "https://example.com").await;
        assert_eq!(decision, RecoveryDecision::SkipSource);
    }

    #[tokio::test]
    async fn continue_check_reprompts_until_clear() {
        // Two challenged body reads, then the page is clean.
        let surface = blocked_surface(Some(2));
        let recovery = operator(&["", "", "continue-check"]);

        let decision = recovery.recover(&surface, "https://example.com").await;

        assert_eq!(decision, RecoveryDecision::Continue);
        assert_eq!(recovery.channel().remaining(), 0);
        assert!(recovery
            .channel()
            .notes()
            .iter()
            .any(|n| n.starts_with("Still on the challenge page")));
        assert_eq!(surface.fronted(), 1);
    }

    #[tokio::test]
    async fn skip_and_abort_resolve_immediately() {
        let surface = blocked_surface(None);

        let skip = operator(&["skip", "abort"]);
        assert_eq!(
            skip.recover(&surface, "u").await,
            RecoveryDecision::SkipSource
        );
        assert_eq!(skip.channel().remaining(), 1);

        let abort = operator(&["q"]);
        assert_eq!(abort.recover(&surface, "u").await, RecoveryDecision::Abort);
    }

    #[tokio::test]
    async fn unknown_command_reprompts() {
        let surface = blocked_surface(None);
        let recovery = operator(&["solve it please", "abort"]);

        assert_eq!(recovery.recover(&surface, "u").await, RecoveryDecision::Abort);
        assert!(recovery
            .channel()
            .notes()
            .iter()
            .any(|n| n.contains("Unknown command 'solve it please'")));
    }

    #[tokio::test]
    async fn closed_channel_skips_source() {
        let surface = blocked_surface(None);
        let recovery = operator(&[""]);
        assert_eq!(
            recovery.recover(&surface, "u").await,
            RecoveryDecision::SkipSource
        );
    }
}
