//! Per-session append-only record streams (JSON lines)
//!
//! Records are only ever appended. The single mutation allowed is flipping
//! `sync_status` to `synced`, which rewrites the whole file atomically.

use super::atomic::atomic_write;
use super::file_stem_for;
use crate::data::{ConversationRecord, MetricsDelta, SyncStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::marker::PhantomData;
use std::path::PathBuf;

/// A record that can live in an [`AppendLog`].
pub trait SyncRecord: Serialize + DeserializeOwned {
    fn record_id(&self) -> &str;
    fn sync_status(&self) -> SyncStatus;
    /// Flip to `synced`, bumping the attempt counter.
    fn mark_synced(&mut self, at: DateTime<Utc>);
}

impl SyncRecord for MetricsDelta {
    fn record_id(&self) -> &str {
        &self.record_id
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.sync_status = SyncStatus::Synced;
        self.sync_attempts += 1;
        self.synced_at = Some(at);
    }
}

impl SyncRecord for ConversationRecord {
    fn record_id(&self) -> &str {
        &self.record_id
    }

    fn sync_status(&self) -> SyncStatus {
        self.sync_status
    }

    fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.sync_status = SyncStatus::Synced;
        self.sync_attempts += 1;
        self.synced_at = Some(at);
    }
}

#[derive(Debug, Clone)]
pub struct AppendLog<T> {
    dir: PathBuf,
    _record: PhantomData<fn() -> T>,
}

impl<T: SyncRecord> AppendLog<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            _record: PhantomData,
        }
    }

    pub fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", file_stem_for(session_id)))
    }

    pub fn append(&self, session_id: &str, record: &T) -> Result<()> {
        self.append_all(session_id, std::slice::from_ref(record))
    }

    /// Append records in order with a single write + fsync.
    pub fn append_all(&self, session_id: &str, records: &[T]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record).context("Failed to serialize record")?;
            buf.push(b'\n');
        }

        let path = self.path(session_id);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(&buf)
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.sync_data()?;
        Ok(())
    }

    /// All records in append order.
    ///
    /// Lines that fail to parse (e.g. a torn final line) are skipped.
    pub fn read_all(&self, session_id: &str) -> Result<Vec<T>> {
        let path = self.path(session_id);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
        };

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<T>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    "Skipping malformed record at {}:{}: {}",
                    path.display(),
                    line_no + 1,
                    e
                ),
            }
        }
        Ok(records)
    }

    pub fn pending(&self, session_id: &str) -> Result<Vec<T>> {
        Ok(self
            .read_all(session_id)?
            .into_iter()
            .filter(|r| r.sync_status() == SyncStatus::Pending)
            .collect())
    }

    /// Flip records whose id is in `ids` to `synced` and atomically rewrite
    /// the stream. Returns how many records changed.
    pub fn mark_synced(&self, session_id: &str, ids: &HashSet<String>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut records = self.read_all(session_id)?;
        let now = Utc::now();
        let mut changed = 0;
        for record in records.iter_mut() {
            if record.sync_status() == SyncStatus::Pending && ids.contains(record.record_id()) {
                record.mark_synced(now);
                changed += 1;
            }
        }

        if changed == 0 {
            return Ok(0);
        }

        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record).context("Failed to serialize record")?;
            buf.push(b'\n');
        }
        atomic_write(&self.path(session_id), &buf)?;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::atomic::temp_path_for;
    use tempfile::TempDir;

    fn delta(id: &str) -> MetricsDelta {
        MetricsDelta {
            record_id: id.to_string(),
            session_id: "s1".to_string(),
            agent_session_id: None,
            timestamp: Utc::now(),
            git_branch: None,
            model: None,
            tokens: Default::default(),
            tool_calls: Default::default(),
            files_modified: vec![],
            user_prompts: vec![],
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            synced_at: None,
        }
    }

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_stream_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let log: AppendLog<MetricsDelta> = AppendLog::new(temp_dir.path());
        assert!(log.read_all("s1").unwrap().is_empty());
    }

    #[test]
    fn test_append_preserves_order() {
        let temp_dir = TempDir::new().unwrap();
        let log = AppendLog::new(temp_dir.path());
        log.append("s1", &delta("a")).unwrap();
        log.append_all("s1", &[delta("b"), delta("c")]).unwrap();

        let read: Vec<String> = log
            .read_all("s1")
            .unwrap()
            .into_iter()
            .map(|d: MetricsDelta| d.record_id)
            .collect();
        assert_eq!(read, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_mark_subset_synced() {
        let temp_dir = TempDir::new().unwrap();
        let log = AppendLog::new(temp_dir.path());
        let records: Vec<MetricsDelta> = ["a", "b", "c", "d", "e"].iter().map(|i| delta(i)).collect();
        log.append_all("s1", &records).unwrap();

        let changed = log.mark_synced("s1", &ids(&["b", "d"])).unwrap();
        assert_eq!(changed, 2);

        let all = log.read_all("s1").unwrap();
        assert_eq!(all.len(), 5);
        let synced: Vec<&MetricsDelta> = all
            .iter()
            .filter(|d| d.sync_status == SyncStatus::Synced)
            .collect();
        assert_eq!(synced.len(), 2);
        assert!(synced.iter().all(|d| d.sync_attempts == 1 && d.synced_at.is_some()));
        assert_eq!(log.pending("s1").unwrap().len(), 3);
    }

    #[test]
    fn test_already_synced_records_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let log = AppendLog::new(temp_dir.path());
        log.append_all("s1", &[delta("a")]).unwrap();

        assert_eq!(log.mark_synced("s1", &ids(&["a"])).unwrap(), 1);
        assert_eq!(log.mark_synced("s1", &ids(&["a"])).unwrap(), 0);

        let all: Vec<MetricsDelta> = log.read_all("s1").unwrap();
        assert_eq!(all[0].sync_attempts, 1);
    }

    #[test]
    fn test_torn_final_line_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let log = AppendLog::new(temp_dir.path());
        log.append_all("s1", &[delta("a"), delta("b")]).unwrap();

        let mut file = OpenOptions::new().append(true).open(log.path("s1")).unwrap();
        file.write_all(b"{\"record_id\":\"c\",\"times").unwrap();

        let all: Vec<MetricsDelta> = log.read_all("s1").unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_crash_before_rename_keeps_original() {
        let temp_dir = TempDir::new().unwrap();
        let log = AppendLog::new(temp_dir.path());
        log.append_all("s1", &[delta("a"), delta("b")]).unwrap();
        let before = fs::read_to_string(log.path("s1")).unwrap();

        // Simulate a rewrite that died after writing the temp file
        fs::write(temp_path_for(&log.path("s1")), "{\"record_id\":\"a\"").unwrap();

        assert_eq!(fs::read_to_string(log.path("s1")).unwrap(), before);
        let all: Vec<MetricsDelta> = log.read_all("s1").unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|d| d.sync_status == SyncStatus::Pending));
    }
}
