//! Transcript persistence.
//!
//! The orchestrator records every turn through a [`TranscriptStore`] and
//! rehydrates from it on start. Two stores are provided:
//! - [`JsonlStore`]: one `<session_id>.jsonl` file per session
//! - [`InMemoryStore`]: process-local, for tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::agent::Turn;
use crate::error::HistoryError;

/// Generate a fresh session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Session ids become file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_session_id(id: &str) -> Result<(), HistoryError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(HistoryError::InvalidSessionId { id: id.to_string() })
    }
}

/// One persisted line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredTurn {
    pub timestamp: DateTime<Utc>,
    pub turn: Turn,
}

/// Summary of a stored session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub turns: usize,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Durable record of transcripts, keyed by session id.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Append one turn to the end of a session.
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), HistoryError>;

    /// Load a session's turns in insertion order. Unknown sessions are empty.
    async fn load(&self, session_id: &str) -> Result<Vec<Turn>, HistoryError>;

    /// List stored sessions, most recently updated first.
    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, HistoryError>;

    /// Remove a session. Returns `false` when it did not exist.
    async fn delete(&self, session_id: &str) -> Result<bool, HistoryError>;

    /// Delete all but the `max_sessions` most recently updated sessions,
    /// never touching `keep`. `0` disables pruning. Returns the removed ids.
    async fn prune(
        &self,
        max_sessions: usize,
        keep: Option<&str>,
    ) -> Result<Vec<String>, HistoryError> {
        if max_sessions == 0 {
            return Ok(Vec::new());
        }
        let mut removed = Vec::new();
        for info in self.list_sessions().await?.into_iter().skip(max_sessions) {
            if Some(info.id.as_str()) == keep {
                continue;
            }
            if self.delete(&info.id).await? {
                removed.push(info.id);
            }
        }
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), max_sessions, "Pruned old transcripts");
        }
        Ok(removed)
    }
}

/// Newline-delimited JSON files under a directory.
#[derive(Debug, Clone)]
pub struct JsonlStore {
    dir: PathBuf,
}

impl JsonlStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf, HistoryError> {
        validate_session_id(session_id)?;
        Ok(self.dir.join(format!("{}.jsonl", session_id)))
    }

    async fn read_stored(path: &Path) -> Result<Vec<StoredTurn>, HistoryError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut stored = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredTurn>(line) {
                Ok(turn) => stored.push(turn),
                // A crash mid-append can leave a partial last line.
                Err(e) => tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    error = %e,
                    "Skipping unreadable transcript line"
                ),
            }
        }
        Ok(stored)
    }
}

#[async_trait]
impl TranscriptStore for JsonlStore {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), HistoryError> {
        let path = self.session_path(session_id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut line = serde_json::to_string(&StoredTurn {
            timestamp: Utc::now(),
            turn: turn.clone(),
        })?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<Turn>, HistoryError> {
        let path = self.session_path(session_id)?;
        let stored = Self::read_stored(&path).await?;
        tracing::debug!(session_id, turns = stored.len(), "Loaded transcript");
        Ok(stored.into_iter().map(|s| s.turn).collect())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, HistoryError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_session_id(id).is_err() {
                continue;
            }
            let stored = Self::read_stored(&path).await?;
            sessions.push(SessionInfo {
                id: id.to_string(),
                turns: stored.len(),
                updated_at: stored.last().map(|s| s.timestamp),
            });
        }

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    async fn delete(&self, session_id: &str) -> Result<bool, HistoryError> {
        let path = self.session_path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!(session_id, "Deleted transcript");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, Vec<StoredTurn>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryStore {
    async fn append(&self, session_id: &str, turn: &Turn) -> Result<(), HistoryError> {
        validate_session_id(session_id)?;
        self.sessions
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(StoredTurn {
                timestamp: Utc::now(),
                turn: turn.clone(),
            });
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Vec<Turn>, HistoryError> {
        validate_session_id(session_id)?;
        Ok(self
            .sessions
            .read()
            .await
            .get(session_id)
            .map(|turns| turns.iter().map(|s| s.turn.clone()).collect())
            .unwrap_or_default())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionInfo>, HistoryError> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, turns)| SessionInfo {
                id: id.clone(),
                turns: turns.len(),
                updated_at: turns.last().map(|s| s.timestamp),
            })
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(a.id.cmp(&b.id)));
        Ok(list)
    }

    async fn delete(&self, session_id: &str) -> Result<bool, HistoryError> {
        validate_session_id(session_id)?;
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }
}
