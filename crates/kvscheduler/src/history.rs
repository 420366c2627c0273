//! Append-only log of committed transactions.
//!
//! Two backends:
//! - `MemoryHistory`: a vector of records, lost on restart
//! - `JsonlHistory`: same in-memory index, mirrored to a JSON-lines file that
//!   is reloaded on open and rewritten atomically when trimmed

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{Result, SchedulerError};
use crate::txn::record::RecordedTxn;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a committed record. Sequence numbers must grow.
    async fn append(&self, record: Arc<RecordedTxn>) -> Result<()>;

    async fn get(&self, seq_num: u64) -> Result<Option<Arc<RecordedTxn>>>;

    /// Every retained record, oldest first.
    async fn all(&self) -> Result<Vec<Arc<RecordedTxn>>>;

    /// Records with `from <= seq_num <= to`.
    async fn range(&self, from: u64, to: u64) -> Result<Vec<Arc<RecordedTxn>>>;

    /// Records started inside the time window. Open bounds are unlimited.
    async fn between(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Arc<RecordedTxn>>>;

    /// Drop records that finished before `cutoff`, except those started
    /// before `permanent_until`. Returns how many were dropped.
    async fn trim(&self, cutoff: DateTime<Utc>, permanent_until: DateTime<Utc>) -> Result<usize>;

    async fn last_seq(&self) -> Result<Option<u64>>;
}

fn is_trimmed(record: &RecordedTxn, cutoff: DateTime<Utc>, permanent_until: DateTime<Utc>) -> bool {
    record.stop < cutoff && record.start >= permanent_until
}

fn in_window(
    record: &RecordedTxn,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> bool {
    since.map(|s| record.start >= s).unwrap_or(true)
        && until.map(|u| record.start <= u).unwrap_or(true)
}

// ---------------------------------------------------------------------------
// MemoryHistory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<Arc<RecordedTxn>>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_records(records: Vec<Arc<RecordedTxn>>) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<RecordedTxn>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, record: Arc<RecordedTxn>) -> Result<()> {
        let mut records = self.lock();
        if let Some(last) = records.last() {
            if record.seq_num <= last.seq_num {
                return Err(SchedulerError::History(format!(
                    "record {} appended after record {}",
                    record.seq_num, last.seq_num
                )));
            }
        }
        records.push(record);
        Ok(())
    }

    fn find(&self, seq_num: u64) -> Option<Arc<RecordedTxn>> {
        let records = self.lock();
        records
            .binary_search_by_key(&seq_num, |r| r.seq_num)
            .ok()
            .map(|i| records[i].clone())
    }

    fn snapshot(&self) -> Vec<Arc<RecordedTxn>> {
        self.lock().clone()
    }

    fn retain_untrimmed(&self, cutoff: DateTime<Utc>, permanent_until: DateTime<Utc>) -> usize {
        let mut records = self.lock();
        let before = records.len();
        records.retain(|r| !is_trimmed(r, cutoff, permanent_until));
        before - records.len()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistory {
    async fn append(&self, record: Arc<RecordedTxn>) -> Result<()> {
        self.push(record)
    }

    async fn get(&self, seq_num: u64) -> Result<Option<Arc<RecordedTxn>>> {
        Ok(self.find(seq_num))
    }

    async fn all(&self) -> Result<Vec<Arc<RecordedTxn>>> {
        Ok(self.snapshot())
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<Arc<RecordedTxn>>> {
        Ok(self
            .lock()
            .iter()
            .filter(|r| r.seq_num >= from && r.seq_num <= to)
            .cloned()
            .collect())
    }

    async fn between(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Arc<RecordedTxn>>> {
        Ok(self
            .lock()
            .iter()
            .filter(|r| in_window(r, since, until))
            .cloned()
            .collect())
    }

    async fn trim(&self, cutoff: DateTime<Utc>, permanent_until: DateTime<Utc>) -> Result<usize> {
        Ok(self.retain_untrimmed(cutoff, permanent_until))
    }

    async fn last_seq(&self) -> Result<Option<u64>> {
        Ok(self.lock().last().map(|r| r.seq_num))
    }
}

// ---------------------------------------------------------------------------
// JsonlHistory
// ---------------------------------------------------------------------------

/// History mirrored to a JSON-lines file, one record per line.
#[derive(Debug)]
pub struct JsonlHistory {
    path: PathBuf,
    index: MemoryHistory,
    file: Mutex<()>,
}

impl JsonlHistory {
    /// Open (or create) the file at `path` and load the records it holds.
    /// Unparseable lines are skipped with a warning.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut records: Vec<Arc<RecordedTxn>> = Vec::new();
        if path.exists() {
            let reader = BufReader::new(fs::File::open(&path)?);
            for (lineno, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<RecordedTxn>(&line) {
                    Ok(record) => records.push(Arc::new(record)),
                    Err(e) => {
                        warn!(path = %path.display(), line = lineno + 1, error = %e, "skipping corrupt history line");
                    }
                }
            }
        }
        records.sort_by_key(|r| r.seq_num);
        records.dedup_by_key(|r| r.seq_num);
        Ok(Self {
            path,
            index: MemoryHistory::with_records(records),
            file: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, record: &RecordedTxn) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let _guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn rewrite(&self, records: &[Arc<RecordedTxn>]) -> Result<()> {
        let _guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = NamedTempFile::new_in(&dir)?;
        for record in records {
            writeln!(tmp, "{}", serde_json::to_string(record.as_ref())?)?;
        }
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for JsonlHistory {
    async fn append(&self, record: Arc<RecordedTxn>) -> Result<()> {
        self.write_line(&record)?;
        self.index.push(record)
    }

    async fn get(&self, seq_num: u64) -> Result<Option<Arc<RecordedTxn>>> {
        self.index.get(seq_num).await
    }

    async fn all(&self) -> Result<Vec<Arc<RecordedTxn>>> {
        self.index.all().await
    }

    async fn range(&self, from: u64, to: u64) -> Result<Vec<Arc<RecordedTxn>>> {
        self.index.range(from, to).await
    }

    async fn between(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<Arc<RecordedTxn>>> {
        self.index.between(since, until).await
    }

    async fn trim(&self, cutoff: DateTime<Utc>, permanent_until: DateTime<Utc>) -> Result<usize> {
        let dropped = self.index.retain_untrimmed(cutoff, permanent_until);
        if dropped > 0 {
            self.rewrite(&self.index.snapshot())?;
        }
        Ok(dropped)
    }

    async fn last_seq(&self) -> Result<Option<u64>> {
        self.index.last_seq().await
    }
}
