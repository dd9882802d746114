//! Seen-key store: the dedup oracle for a whole run.
//!
//! Rebuilt at startup by replaying the output file; only keys are kept, not
//! the records themselves. Owned by the run driver and lent `&mut` to each
//! per-source collection, one source at a time.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use harvest_common::HarvestError;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Deserialize)]
struct KeyLine {
    review_key: Option<String>,
}

#[derive(Debug, Default)]
pub struct SeenKeys {
    keys: HashSet<String>,
}

impl SeenKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay an existing output file. A missing file yields an empty store;
    /// lines that are not JSON objects with a `review_key` are skipped.
    pub fn load(path: &Path) -> Result<Self, HarvestError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No previous output, starting with empty key set");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        let store = Self::from_reader(BufReader::new(file))?;
        info!(path = %path.display(), keys = store.len(), "Replayed previous output");
        Ok(store)
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, HarvestError> {
        let mut store = Self::new();
        let mut skipped = 0usize;
        for line in reader.split(b'\n') {
            let line = line?;
            // A crash can leave invalid UTF-8 mid-line; treat it like any other corrupt line.
            let Ok(text) = std::str::from_utf8(&line) else {
                skipped += 1;
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<KeyLine>(text) {
                Ok(KeyLine {
                    review_key: Some(key),
                }) if !key.is_empty() => {
                    store.keys.insert(key);
                }
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            debug!(skipped, "Skipped unreadable lines during replay");
        }
        Ok(store)
    }

    pub fn is_new(&self, key: &str) -> bool {
        !self.keys.contains(key)
    }

    pub fn mark_seen(&mut self, key: String) {
        self.keys.insert(key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn replay_collects_keys_and_skips_garbage() {
        let data = concat!(
            "{\"review_key\":\"a\",\"text\":\"x\"}\n",
            "not json at all\n",
            "\n",
            "{\"text\":\"no key\"}\n",
            "{\"review_key\":\"\"}\n",
            "{\"review_key\":\"b\"}\n",
            "{\"review_key\":\"c\",\"text\":\"cut off"
        );
        let store = SeenKeys::from_reader(Cursor::new(data)).unwrap();
        assert_eq!(store.len(), 2);
        assert!(!store.is_new("a"));
        assert!(!store.is_new("b"));
        assert!(store.is_new("c"));
    }

    #[test]
    fn invalid_utf8_line_is_skipped() {
        let mut data = b"{\"review_key\":\"a\"}\n".to_vec();
        data.extend_from_slice(&[0xff, 0xfe, b'\n']);
        data.extend_from_slice(b"{\"review_key\":\"b\"}\n");
        let store = SeenKeys::from_reader(Cursor::new(data)).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn missing_file_is_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SeenKeys::load(&dir.path().join("absent.jsonl")).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn mark_seen_flips_is_new() {
        let mut store = SeenKeys::new();
        assert!(store.is_new("k"));
        store.mark_seen("k".to_string());
        assert!(!store.is_new("k"));
        store.mark_seen("k".to_string());
        assert_eq!(store.len(), 1);
    }
}
