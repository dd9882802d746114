use crate::collector::StopReason;

/// How a source ended from the run's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceStatus {
    Completed(StopReason),
    /// Challenge page and recovery gave up on it.
    Skipped(String),
    /// Source-level failure: navigation, selectors, list readiness.
    Failed(String),
    /// Operator stopped the run while on this source.
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceReport {
    pub url: String,
    pub status: SourceStatus,
    pub emitted: u32,
    pub expand_clicks: u32,
    pub still_truncated: u32,
    /// Items given up on after repeated read failures.
    pub items_skipped: u32,
}

impl SourceReport {
    pub fn new(url: &str, status: SourceStatus) -> Self {
        Self {
            url: url.to_string(),
            status,
            emitted: 0,
            expand_clicks: 0,
            still_truncated: 0,
            items_skipped: 0,
        }
    }

    /// Progress line for the operator, e.g. `[2/7] url -> +13 records (exhausted)`.
    pub fn progress_line(&self, index: usize, total: usize) -> String {
        match &self.status {
            SourceStatus::Completed(reason) if self.items_skipped > 0 => format!(
                "[{index}/{total}] {} -> +{} records, {} unreadable skipped ({reason})",
                self.url, self.emitted, self.items_skipped
            ),
            SourceStatus::Completed(reason) => format!(
                "[{index}/{total}] {} -> +{} records ({reason})",
                self.url, self.emitted
            ),
            SourceStatus::Skipped(reason) => {
                format!("[{index}/{total}] SKIP {}: {reason}", self.url)
            }
            SourceStatus::Failed(reason) => {
                format!("[{index}/{total}] ERROR {}: {reason}", self.url)
            }
            SourceStatus::Aborted => format!(
                "[{index}/{total}] {} -> +{} records (aborted by operator)",
                self.url, self.emitted
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct RunStats {
    pub sources_total: u32,
    pub sources_completed: u32,
    pub sources_skipped: u32,
    pub sources_failed: u32,
    pub records_written: u32,
    pub expand_clicks: u32,
    pub still_truncated: u32,
    pub items_skipped: u32,
    pub aborted: bool,
    pub reports: Vec<SourceReport>,
}

impl RunStats {
    pub fn new(sources_total: usize) -> Self {
        Self {
            sources_total: sources_total as u32,
            ..Default::default()
        }
    }

    pub fn record(&mut self, report: SourceReport) {
        match report.status {
            SourceStatus::Completed(_) => self.sources_completed += 1,
            SourceStatus::Skipped(_) => self.sources_skipped += 1,
            SourceStatus::Failed(_) => self.sources_failed += 1,
            SourceStatus::Aborted => self.aborted = true,
        }
        self.records_written += report.emitted;
        self.expand_clicks += report.expand_clicks;
        self.still_truncated += report.still_truncated;
        self.items_skipped += report.items_skipped;
        self.reports.push(report);
    }

    pub fn sources_visited(&self) -> u32 {
        self.reports.len() as u32
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Harvest Run Complete ===")?;
        writeln!(f, "Sources:            {}", self.sources_total)?;
        writeln!(f, "  visited:          {}", self.sources_visited())?;
        writeln!(f, "  completed:        {}", self.sources_completed)?;
        writeln!(f, "  skipped:          {}", self.sources_skipped)?;
        writeln!(f, "  failed:           {}", self.sources_failed)?;
        writeln!(f, "Records written:    {}", self.records_written)?;
        writeln!(f, "Expand clicks:      {}", self.expand_clicks)?;
        writeln!(f, "Still truncated:    {}", self.still_truncated)?;
        if self.items_skipped > 0 {
            writeln!(f, "Unreadable items:   {}", self.items_skipped)?;
        }
        if self.aborted {
            writeln!(f, "\nRun aborted by operator. Progress already saved.")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_lines() {
        let mut done = SourceReport::new("https://a", SourceStatus::Completed(StopReason::Exhausted));
        done.emitted = 12;
        assert_eq!(done.progress_line(1, 3), "[1/3] https://a -> +12 records (exhausted)");

        let skipped = SourceReport::new("https://b", SourceStatus::Skipped("captcha".into()));
        assert_eq!(skipped.progress_line(2, 3), "[2/3] SKIP https://b: captcha");

        let failed = SourceReport::new(
            "https://c",
            SourceStatus::Failed("container/cards not found".into()),
        );
        assert_eq!(
            failed.progress_line(3, 3),
            "[3/3] ERROR https://c: container/cards not found"
        );

        let mut partial =
            SourceReport::new("https://d", SourceStatus::Completed(StopReason::Exhausted));
        partial.emitted = 4;
        partial.items_skipped = 1;
        assert_eq!(
            partial.progress_line(1, 1),
            "[1/1] https://d -> +4 records, 1 unreadable skipped (exhausted)"
        );
    }

    #[test]
    fn totals_accumulate_per_status() {
        let mut stats = RunStats::new(4);
        let mut a = SourceReport::new("a", SourceStatus::Completed(StopReason::CapReached));
        a.emitted = 5;
        a.expand_clicks = 2;
        a.items_skipped = 3;
        stats.record(a);
        stats.record(SourceReport::new("b", SourceStatus::Failed("x".into())));
        stats.record(SourceReport::new("c", SourceStatus::Skipped("y".into())));
        stats.record(SourceReport::new("d", SourceStatus::Aborted));

        assert_eq!(stats.sources_completed, 1);
        assert_eq!(stats.sources_failed, 1);
        assert_eq!(stats.sources_skipped, 1);
        assert!(stats.aborted);
        assert_eq!(stats.records_written, 5);
        assert_eq!(stats.expand_clicks, 2);
        assert_eq!(stats.sources_visited(), 4);

        let summary = stats.to_string();
        assert!(summary.contains("Records written:    5"));
        assert!(summary.contains("Unreadable items:   3"));
        assert!(summary.contains("aborted by operator"));
    }
}
