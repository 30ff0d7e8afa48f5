//! Local session persistence
//!
//! All saved sessions live in one JSON array (`sessions.json` in the data
//! directory), most recently updated first.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::paths;
use crate::settings::InterviewSettings;
use crate::transcript::{Message, Transcript};

const SESSIONS_FILE_NAME: &str = "sessions.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Session storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Session storage is corrupt: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No saved session with id {0}")]
    NotFound(String),
}

/// One saved interview
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedSession {
    pub id: String,
    #[serde(flatten)]
    pub settings: InterviewSettings,
    pub messages: Vec<Message>,
    /// Creation time, ms since the epoch
    pub timestamp: i64,
    /// Last save, ms since the epoch
    #[serde(default)]
    pub last_updated: i64,
}

impl SavedSession {
    pub fn new(settings: InterviewSettings) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4().to_string(),
            settings,
            messages: Vec::new(),
            timestamp: now,
            last_updated: now,
        }
    }

    pub fn transcript(&self) -> Transcript {
        Transcript::from_messages(self.messages.clone())
    }

    /// Short label for listings
    pub fn title(&self) -> String {
        let role = if self.settings.role.trim().is_empty() {
            "Untitled interview"
        } else {
            self.settings.role.trim()
        };
        if self.settings.company.trim().is_empty() {
            role.to_string()
        } else {
            format!("{} @ {}", role, self.settings.company.trim())
        }
    }

    pub fn updated_at(&self) -> Option<chrono::DateTime<chrono::Local>> {
        chrono::DateTime::from_timestamp_millis(self.last_updated)
            .map(|t| t.with_timezone(&chrono::Local))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// File-backed session list
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(paths::data_dir().join(SESSIONS_FILE_NAME))
    }
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every saved session, newest first. Read failures are logged and
    /// yield an empty list.
    pub fn list(&self) -> Vec<SavedSession> {
        match self.load() {
            Ok(sessions) => sessions,
            Err(e) => {
                log::error!("Store: failed to load sessions from {:?}: {}", self.path, e);
                Vec::new()
            }
        }
    }

    pub fn get(&self, id: &str) -> Result<SavedSession, StoreError> {
        self.load()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    /// Insert or replace `session` at the front of the list.
    ///
    /// A replaced entry keeps its original creation time. Returns the
    /// session as stored.
    pub fn save(&self, session: &SavedSession) -> Result<SavedSession, StoreError> {
        let mut sessions = self.load()?;
        let mut stored = session.clone();
        stored.last_updated = now_ms();

        if let Some(index) = sessions.iter().position(|s| s.id == session.id) {
            let previous = sessions.remove(index);
            stored.timestamp = previous.timestamp;
        }
        sessions.insert(0, stored.clone());

        self.write(&sessions)?;
        log::debug!(
            "Store: saved session {} ({} messages)",
            stored.id,
            stored.messages.len()
        );
        Ok(stored)
    }

    /// Remove one session and return the rest
    pub fn delete(&self, id: &str) -> Result<Vec<SavedSession>, StoreError> {
        let mut sessions = self.load()?;
        sessions.retain(|s| s.id != id);
        self.write(&sessions)?;
        Ok(sessions)
    }

    pub fn clear(&self) -> Result<(), StoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                log::info!("Store: cleared all sessions");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load(&self) -> Result<Vec<SavedSession>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(Vec::new()),
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, sessions: &[SavedSession]) -> Result<(), StoreError> {
        let contents = serde_json::to_vec_pretty(sessions)?;
        paths::write_atomic(&self.path, &contents)?;
        Ok(())
    }
}
