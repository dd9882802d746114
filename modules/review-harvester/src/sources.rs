//! Source list loading and per-source identity.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;

static ORG_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"/org/[^/]+/(\d+)").unwrap());

/// Read source addresses, one per line. Blank lines and `#` comments are
/// ignored; a missing file is an error.
pub fn load_sources(path: &Path) -> Result<Vec<String>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read source list {}", path.display()))?;
    Ok(parse_sources(&raw))
}

pub fn parse_sources(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Numeric organization id from a listing address, `"unknown"` otherwise.
pub fn org_id_from_url(url: &str) -> String {
    ORG_ID_RE
        .captures(url)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
