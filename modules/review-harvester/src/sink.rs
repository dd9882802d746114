//! Append-only JSONL output.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use harvest_common::{HarvestError, ReviewRecord};
use tracing::{info, warn};

pub trait RecordSink: Send {
    fn append(&mut self, record: &ReviewRecord) -> Result<(), HarvestError>;
    fn flush(&mut self) -> Result<(), HarvestError>;
}

pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
    appended: u64,
}

impl JsonlSink {
    /// Open `path` for appending, creating it (and its parent directories)
    /// if needed. If a previous run died mid-line, a newline is written first
    /// so new records never share a line with the partial one.
    pub fn open(path: &Path) -> Result<Self, HarvestError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        if file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                warn!(path = %path.display(), "Output ends mid-line, terminating it before appending");
                file.write_all(b"\n")?;
            }
        }

        info!(path = %path.display(), "Output opened for append");
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            appended: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }
}

impl RecordSink for JsonlSink {
    fn append(&mut self, record: &ReviewRecord) -> Result<(), HarvestError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.appended += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), HarvestError> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.flush() {
            warn!(path = %self.path.display(), error = %e, "Final flush failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::SeenKeys;

    fn record(key: &str, text: &str) -> ReviewRecord {
        ReviewRecord {
            review_key: key.into(),
            org_id: "42".into(),
            restaurant_name: "Кафе".into(),
            author_id: "u".into(),
            author_caption: String::new(),
            author_badge: String::new(),
            author_level: None,
            date_iso: "2024-01-01T00:00:00Z".into(),
            date: "2024-01-01".into(),
            rating_raw: "5".into(),
            rating: Some(5.0),
            text: text.into(),
            source_url: "https://example.com/org/x/42/".into(),
            scraped_at_unix: 1_700_000_000,
        }
    }

    #[test]
    fn appends_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.jsonl");

        let mut sink = JsonlSink::open(&path).unwrap();
        sink.append(&record("a", "первый\nотзыв")).unwrap();
        sink.append(&record("b", "второй")).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.appended(), 2);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["review_key"], "a");
        assert_eq!(first["text"], "первый\nотзыв");
    }

    #[test]
    fn reopening_accumulates_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        {
            let mut sink = JsonlSink::open(&path).unwrap();
            sink.append(&record("a", "x")).unwrap();
        }
        {
            let mut sink = JsonlSink::open(&path).unwrap();
            sink.append(&record("b", "y")).unwrap();
        }

        let store = SeenKeys::load(&path).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn partial_trailing_line_is_terminated_before_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        fs::write(&path, "{\"review_key\":\"a\"}\n{\"review_key\":\"b\",\"te").unwrap();

        {
            let mut sink = JsonlSink::open(&path).unwrap();
            sink.append(&record("c", "z")).unwrap();
        }

        let store = SeenKeys::load(&path).unwrap();
        assert!(!store.is_new("a"));
        assert!(store.is_new("b"));
        assert!(!store.is_new("c"));
    }
}
