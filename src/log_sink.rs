use serde::Serialize;
use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

const MIRROR_ROTATE_BYTES: u64 = 50 * 1024 * 1024;
const MIRROR_MAX_BACKUPS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub ts_ms: i64,
    pub text: String,
}

/// Append-only job log shared between the control thread and the supervisor.
///
/// Memory holds at most `capacity` entries; when a mirror file is attached every
/// line is also written there, so the display window never loses data.
#[derive(Debug, Clone)]
pub struct LogSink {
    inner: Arc<Mutex<LogBuffer>>,
}

#[derive(Debug)]
struct LogBuffer {
    entries: VecDeque<LogEntry>,
    capacity: usize,
    next_seq: u64,
    mirror: Option<PathBuf>,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogBuffer {
                entries: VecDeque::new(),
                capacity: capacity.max(1),
                next_seq: 0,
                mirror: None,
            })),
        }
    }

    /// Routes subsequent lines to a JSONL file as well; `None` detaches.
    pub fn set_mirror(&self, path: Option<PathBuf>) {
        self.lock().mirror = path;
    }

    pub fn append(&self, line: impl Into<String>) {
        let text = line.into();
        tracing::debug!(target: "restream::job", "{text}");

        let mut buf = self.lock();
        let entry = LogEntry {
            seq: buf.next_seq,
            ts_ms: now_ms(),
            text,
        };
        buf.next_seq += 1;

        if let Some(path) = buf.mirror.as_deref() {
            if let Err(e) = write_mirror_line(path, &entry) {
                tracing::warn!(path = %path.display(), "job log mirror write failed: {e}");
            }
        }

        buf.entries.push_back(entry);
        while buf.entries.len() > buf.capacity {
            buf.entries.pop_front();
        }
    }

    /// Snapshot of the last `n` entries, oldest first.
    pub fn recent(&self, n: usize) -> RecentLogs {
        let buf = self.lock();
        let skip = buf.entries.len().saturating_sub(n);
        RecentLogs {
            entries: buf.entries.iter().skip(skip).cloned().collect(),
        }
    }

    pub fn render(&self, n: usize) -> String {
        self.recent(n).lines().collect::<Vec<_>>().join("\n")
    }

    /// Total number of lines ever appended.
    pub fn appended(&self) -> u64 {
        self.lock().next_seq
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Restartable view over a window of log entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentLogs {
    entries: Vec<LogEntry>,
}

impl RecentLogs {
    pub fn iter(&self) -> std::slice::Iter<'_, LogEntry> {
        self.entries.iter()
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.text.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a RecentLogs {
    type Item = &'a LogEntry;
    type IntoIter = std::slice::Iter<'a, LogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

fn write_mirror_line(path: &Path, entry: &LogEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    rotate_if_needed(path)?;
    let line = serde_json::to_string(entry)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(format!("{line}\n").as_bytes())
}

fn rotate_if_needed(path: &Path) -> std::io::Result<()> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(_) => return Ok(()),
    };
    if len < MIRROR_ROTATE_BYTES {
        return Ok(());
    }
    rotate_file_backups(path, MIRROR_MAX_BACKUPS)
}

fn rotate_file_backups(path: &Path, max_backups: usize) -> std::io::Result<()> {
    for i in (1..=max_backups).rev() {
        let dst = path_with_suffix(path, &format!(".{i}"));
        let src = if i == 1 {
            path.to_path_buf()
        } else {
            path_with_suffix(path, &format!(".{}", i - 1))
        };
        if !src.exists() {
            continue;
        }
        if dst.exists() {
            let _ = std::fs::remove_file(&dst);
        }
        std::fs::rename(src, dst)?;
    }
    Ok(())
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let file_name = match path.file_name() {
        Some(n) => n.to_string_lossy().to_string(),
        None => suffix.to_string(),
    };
    path.with_file_name(format!("{file_name}{suffix}"))
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
