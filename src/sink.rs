//! JSON Lines output
//!
//! Every record is serialized in full, written as one line and flushed before
//! the call returns, so an interrupted run leaves a prefix of complete lines
//! plus at most one torn line at the end. Resume mode indexes what is already
//! there and cuts the torn line off before appending.
//!
//! A failed write rolls the file back to its last complete line and closes the
//! sink: later appends fail instead of landing after a partial record.

use crate::error::{HarvestError, Result};
use crate::unified::UnifiedRecord;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// How to treat an existing output file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkMode {
    /// Truncate and start over
    Fresh,
    /// Keep complete lines and skip their papers
    Resume,
}

/// Just the keys needed to index an existing line
#[derive(Deserialize)]
struct IndexedLine {
    paper_id: String,
    year: i32,
}

/// Papers already present in an output file.
#[derive(Debug, Clone, Default)]
pub struct ResumeIndex {
    ids: HashMap<String, i32>,
    /// Bytes up to and including the last complete line
    valid_len: u64,
    lines: usize,
    torn_bytes: u64,
}

impl ResumeIndex {
    /// Scan `path`. A missing file is an empty index. A complete line that is not
    /// a record is an error: the file is not ours or was edited by hand.
    pub fn load(path: &Path) -> Result<Self> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut index = Self::default();
        let mut buf = Vec::new();

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                index.torn_bytes = n as u64;
                break;
            }

            let line_no = index.lines + 1;
            let line = trim_line_end(&buf);
            if !line.iter().all(u8::is_ascii_whitespace) {
                let parsed: IndexedLine = serde_json::from_slice(line).map_err(|e| {
                    HarvestError::Parse(format!(
                        "{} line {} is not a record: {}",
                        path.display(),
                        line_no,
                        e
                    ))
                })?;
                if let Some(prev) = index.ids.get(&parsed.paper_id) {
                    warn!(paper_id = %parsed.paper_id, year = prev, line = line_no, "Paper appears twice in existing output");
                } else {
                    index.ids.insert(parsed.paper_id, parsed.year);
                }
            }

            index.lines = line_no;
            index.valid_len += n as u64;
        }

        Ok(index)
    }

    pub fn contains(&self, paper_id: &str) -> bool {
        self.ids.contains_key(paper_id)
    }

    pub fn year_of(&self, paper_id: &str) -> Option<i32> {
        self.ids.get(paper_id).copied()
    }

    /// Distinct papers indexed
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn count_for_year(&self, year: i32) -> usize {
        self.ids.values().filter(|y| **y == year).count()
    }

    pub fn torn_bytes(&self) -> u64 {
        self.torn_bytes
    }

    pub fn into_ids(self) -> HashMap<String, i32> {
        self.ids
    }
}

fn trim_line_end(buf: &[u8]) -> &[u8] {
    let end = buf
        .iter()
        .rposition(|b| *b != b'\n' && *b != b'\r')
        .map_or(0, |i| i + 1);
    &buf[..end]
}

/// Output file plus the length it had after the last complete line
#[derive(Debug)]
struct Output {
    file: File,
    committed: u64,
    closed: bool,
}

impl Output {
    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        self.file.write_all(line)?;
        self.file.flush()?;
        self.committed += line.len() as u64;
        Ok(())
    }

    fn roll_back(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.committed)?;
        self.file.seek(SeekFrom::Start(self.committed))?;
        Ok(())
    }
}

/// Serialized single-writer JSON Lines sink.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    out: Mutex<Output>,
    written: AtomicUsize,
}

impl JsonlSink {
    /// Open `path` for appending. In resume mode the returned index lists papers
    /// already present; in fresh mode it is empty and the file is truncated.
    pub fn open(path: &Path, mode: SinkMode) -> Result<(Self, ResumeIndex)> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let (file, index) = match mode {
            SinkMode::Fresh => (File::create(path)?, ResumeIndex::default()),
            SinkMode::Resume => {
                let index = ResumeIndex::load(path)?;
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                if index.torn_bytes > 0 {
                    warn!(
                        path = %path.display(),
                        bytes = index.torn_bytes,
                        "Dropping torn last line"
                    );
                    file.set_len(index.valid_len)?;
                }
                (file, index)
            }
        };

        let committed = file.metadata()?.len();
        info!(path = %path.display(), mode = ?mode, existing = index.len(), "Opened output");
        Ok((
            Self {
                path: path.to_path_buf(),
                out: Mutex::new(Output {
                    file,
                    committed,
                    closed: false,
                }),
                written: AtomicUsize::new(0),
            },
            index,
        ))
    }

    /// Append one record as a single flushed line.
    ///
    /// After the first failed write the sink is closed and every later call
    /// fails too.
    pub fn append(&self, record: &UnifiedRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut out = self
            .out
            .lock()
            .map_err(|_| HarvestError::Io(std::io::Error::other("output writer lock poisoned")))?;
        if out.closed {
            return Err(HarvestError::Io(std::io::Error::other(format!(
                "output {} closed after an earlier write failure",
                self.path.display()
            ))));
        }
        if let Err(e) = out.write_line(&line) {
            out.closed = true;
            if let Err(rollback) = out.roll_back() {
                error!(path = %self.path.display(), error = %rollback, "Could not cut partial line from output");
            }
            return Err(e.into());
        }
        drop(out);

        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Records appended through this handle
    pub fn written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unified::PageMetadata;
    use std::sync::Arc;

    fn record(id: &str, year: i32) -> UnifiedRecord {
        UnifiedRecord {
            paper_id: id.into(),
            year,
            title: format!("Title {}", id),
            authors: vec![],
            affiliations: vec![],
            abstract_text: String::new(),
            url: String::new(),
            pdf_url: String::new(),
            page_metadata: PageMetadata {
                venue: format!("ICLR.cc/{}/Conference", year),
                keywords: vec![],
                number: None,
            },
            official_reviews: vec![],
            meta_review: None,
            decision: None,
            crawl_timestamp: "2025-01-01T00:00:00.000000Z".into(),
        }
    }

    fn lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .expect("read output")
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_fresh_truncates_and_appends_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/out.jsonl");

        let (sink, _) = JsonlSink::open(&path, SinkMode::Fresh).expect("open");
        sink.append(&record("a", 2020)).expect("append");
        sink.append(&record("b", 2020)).expect("append");
        assert_eq!(sink.written(), 2);
        drop(sink);

        let (sink, index) = JsonlSink::open(&path, SinkMode::Fresh).expect("reopen");
        assert!(index.is_empty());
        sink.append(&record("c", 2021)).expect("append");
        drop(sink);

        let out = lines(&path);
        assert_eq!(out.len(), 1);
        let parsed: UnifiedRecord = serde_json::from_str(&out[0]).expect("valid line");
        assert_eq!(parsed.paper_id, "c");
    }

    #[test]
    fn test_resume_indexes_existing_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        {
            let (sink, _) = JsonlSink::open(&path, SinkMode::Fresh).expect("open");
            sink.append(&record("a", 2019)).expect("append");
            sink.append(&record("b", 2020)).expect("append");
        }

        let (sink, index) = JsonlSink::open(&path, SinkMode::Resume).expect("resume");
        assert_eq!(index.len(), 2);
        assert_eq!(index.year_of("b"), Some(2020));
        assert_eq!(index.count_for_year(2019), 1);
        assert!(!index.contains("c"));

        sink.append(&record("c", 2020)).expect("append");
        drop(sink);
        assert_eq!(lines(&path).len(), 3);
    }

    #[test]
    fn test_resume_cuts_torn_tail() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        {
            let (sink, _) = JsonlSink::open(&path, SinkMode::Fresh).expect("open");
            for id in ["a", "b", "c"] {
                sink.append(&record(id, 2018)).expect("append");
            }
        }
        // Simulate a crash halfway through the fourth line
        let full = fs::read(&path).expect("read");
        let mut torn = full.clone();
        torn.extend_from_slice(br#"{"paper_id":"d","year":20"#);
        fs::write(&path, &torn).expect("write torn");

        let (sink, index) = JsonlSink::open(&path, SinkMode::Resume).expect("resume");
        assert_eq!(index.len(), 3);
        assert!(index.torn_bytes() > 0);
        sink.append(&record("d", 2018)).expect("append");
        drop(sink);

        let out = lines(&path);
        assert_eq!(out.len(), 4);
        for line in &out {
            serde_json::from_str::<UnifiedRecord>(line).expect("every line parses");
        }
    }

    #[test]
    fn test_complete_garbage_line_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        fs::write(&path, "not json\n").expect("write");

        let err = JsonlSink::open(&path, SinkMode::Resume).expect_err("garbage");
        assert!(matches!(err, HarvestError::Parse(_)));
    }

    #[test]
    fn test_resume_missing_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.jsonl");
        let (_, index) = JsonlSink::open(&path, SinkMode::Resume).expect("resume");
        assert!(index.is_empty());
        assert!(path.exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_write_failure_closes_sink() {
        let path = Path::new("/dev/full");
        if !path.exists() {
            return;
        }
        let (sink, _) = JsonlSink::open(path, SinkMode::Fresh).expect("open");

        let first = sink.append(&record("a", 2020)).expect_err("device is full");
        assert!(matches!(first, HarvestError::Io(_)));
        let second = sink.append(&record("b", 2020)).expect_err("closed");
        assert!(second.to_string().contains("closed"));
        assert_eq!(sink.written(), 0);
    }

    #[test]
    fn test_rollback_cuts_partial_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        let (sink, _) = JsonlSink::open(&path, SinkMode::Fresh).expect("open");
        sink.append(&record("a", 2020)).expect("append");

        {
            let mut out = sink.out.lock().expect("lock");
            out.file.write_all(br#"{"paper_id":"b","ye"#).expect("partial write");
            out.roll_back().expect("roll back");
        }
        sink.append(&record("c", 2020)).expect("append");
        drop(sink);

        let out = lines(&path);
        assert_eq!(out.len(), 2);
        for line in &out {
            serde_json::from_str::<UnifiedRecord>(line).expect("whole line");
        }
    }

    #[tokio::test]
    async fn test_concurrent_appends_never_interleave() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.jsonl");
        let (sink, _) = JsonlSink::open(&path, SinkMode::Fresh).expect("open");
        let sink = Arc::new(sink);

        let mut handles = Vec::new();
        for worker in 0..8 {
            let sink = Arc::clone(&sink);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    sink.append(&record(&format!("w{}-{}", worker, i), 2025))
                        .expect("append");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("worker");
        }

        let out = lines(&path);
        assert_eq!(out.len(), 400);
        for line in &out {
            serde_json::from_str::<UnifiedRecord>(line).expect("whole line");
        }
    }
}
