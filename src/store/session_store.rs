//! One JSON document per session
//!
//! Writes go through [`atomic_write`]; read-modify-write sequences hold an
//! exclusive fs2 lock on a sidecar `.lock` file so the collector, the
//! processors and the orchestrator never interleave updates to one record.

use super::atomic::atomic_write;
use super::file_stem_for;
use crate::data::Session;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

/// Held for the duration of a read-modify-write; unlocks on drop.
#[derive(Debug)]
pub struct SessionLock {
    file: File,
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem_for(session_id)))
    }

    fn lock_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem_for(session_id)))
    }

    /// Take the exclusive lock for `session_id`, blocking until available.
    ///
    /// Locks are not reentrant: do not call [`SessionStore::update`] while
    /// holding one for the same session.
    pub fn lock(&self, session_id: &str) -> Result<SessionLock> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.lock_path(session_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock {}", path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", path.display()))?;
        Ok(SessionLock { file })
    }

    /// Load a session; `None` if it was never saved.
    pub fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        read_session(&path).map(Some)
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(session).context("Failed to serialize session")?;
        atomic_write(&self.path(&session.session_id), &content)
    }

    /// Locked read-modify-write. Returns `None` when the session does not exist.
    pub fn update<R>(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Result<Option<R>> {
        let _lock = self.lock(session_id)?;
        let Some(mut session) = self.load(session_id)? else {
            return Ok(None);
        };
        let result = f(&mut session);
        self.save(&session)?;
        Ok(Some(result))
    }

    /// Every readable session; malformed records are logged and skipped.
    pub fn list(&self) -> Result<Vec<Session>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to list {}", self.dir.display()))
            }
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match read_session(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!("Skipping unreadable session {}: {:#}", path.display(), e),
            }
        }
        sessions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        Ok(sessions)
    }

    /// The session correlated with `agent_file`, if any.
    ///
    /// When several sessions claim the same file the most recent one wins.
    pub fn find_by_agent_file(&self, agent_file: &Path) -> Result<Option<Session>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|s| s.correlation.agent_session_file.as_deref() == Some(agent_file))
            .max_by_key(|s| s.start_time))
    }
}

fn read_session(path: &Path) -> Result<Session> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read session from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse session from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Correlation, SessionStatus};
    use tempfile::TempDir;

    fn make_session() -> Session {
        Session::new("claude", "anthropic", PathBuf::from("/work"))
    }

    #[test]
    fn test_load_missing_is_none() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path().join("sessions"));
        assert!(store.load("nope").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_save_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path().join("a/b/sessions"));
        let session = make_session();

        store.save(&session).unwrap();

        assert_eq!(store.load(&session.session_id).unwrap(), Some(session));
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        let session = make_session();
        store.save(&session).unwrap();

        let changed = store
            .update(&session.session_id, |s| {
                s.monitoring.change_count += 1;
                s.monitoring.change_count
            })
            .unwrap();
        assert_eq!(changed, Some(1));

        let loaded = store.load(&session.session_id).unwrap().unwrap();
        assert_eq!(loaded.monitoring.change_count, 1);
        assert_eq!(loaded.status, SessionStatus::Active);
    }

    #[test]
    fn test_update_missing_session() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        assert_eq!(store.update("ghost", |_| ()).unwrap(), None);
    }

    #[test]
    fn test_list_skips_malformed() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());
        store.save(&make_session()).unwrap();
        fs::write(temp_dir.path().join("broken.json"), "not json").unwrap();

        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_find_by_agent_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = SessionStore::new(temp_dir.path());

        let mut owner = make_session();
        owner.correlation =
            Correlation::matched("agent-1".to_string(), PathBuf::from("/logs/a.jsonl"), 1);
        store.save(&owner).unwrap();
        store.save(&make_session()).unwrap();

        let found = store
            .find_by_agent_file(Path::new("/logs/a.jsonl"))
            .unwrap()
            .unwrap();
        assert_eq!(found.session_id, owner.session_id);
        assert!(store
            .find_by_agent_file(Path::new("/logs/b.jsonl"))
            .unwrap()
            .is_none());
    }
}
