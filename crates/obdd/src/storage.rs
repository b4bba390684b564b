//! Session storage collaborator
//!
//! The orchestrator only needs to save a finished session and list recent
//! ones per vehicle. A failed save never invalidates the analysis already
//! returned to the caller.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use obd_core::DiagnosticSession;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{StorageConfig, StorageKind};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Repository-style contract for finished diagnostic sessions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a completed session, returning its record id
    async fn save_session(&self, session: &DiagnosticSession) -> Result<String, StorageError>;

    /// Most recent sessions for a vehicle, newest first
    async fn load_recent_sessions(
        &self,
        vehicle_id: &str,
        limit: usize,
    ) -> Result<Vec<DiagnosticSession>, StorageError>;
}

/// Build the store selected by configuration
pub fn create_store(config: &StorageConfig) -> Arc<dyn SessionStore> {
    match config.kind {
        StorageKind::Memory => Arc::new(MemorySessionStore::new()),
        StorageKind::Json => Arc::new(JsonSessionStore::new(config.dir())),
    }
}

/// Process-local store
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Vec<DiagnosticSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save_session(&self, session: &DiagnosticSession) -> Result<String, StorageError> {
        self.sessions
            .write()
            .entry(session.vehicle.vehicle_id.clone())
            .or_default()
            .push(session.clone());
        Ok(session.id.to_string())
    }

    async fn load_recent_sessions(
        &self,
        vehicle_id: &str,
        limit: usize,
    ) -> Result<Vec<DiagnosticSession>, StorageError> {
        let mut sessions = self
            .sessions
            .read()
            .get(vehicle_id)
            .cloned()
            .unwrap_or_default();
        newest_first(&mut sessions, limit);
        Ok(sessions)
    }
}

/// One JSON document per session under `<root>/<vehicle_id>/`
pub struct JsonSessionStore {
    root: PathBuf,
}

impl JsonSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn vehicle_dir(&self, vehicle_id: &str) -> PathBuf {
        self.root.join(sanitize(vehicle_id))
    }
}

/// Keep vehicle ids from escaping the storage root
fn sanitize(vehicle_id: &str) -> String {
    let cleaned: String = vehicle_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

fn io_error(path: &Path, error: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        message: error.to_string(),
    }
}

#[async_trait]
impl SessionStore for JsonSessionStore {
    async fn save_session(&self, session: &DiagnosticSession) -> Result<String, StorageError> {
        let dir = self.vehicle_dir(&session.vehicle.vehicle_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let path = dir.join(format!("{}.json", session.id));
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| io_error(&path, e))?;

        debug!(path = %path.display(), "Session saved");
        Ok(session.id.to_string())
    }

    async fn load_recent_sessions(
        &self,
        vehicle_id: &str,
        limit: usize,
    ) -> Result<Vec<DiagnosticSession>, StorageError> {
        let dir = self.vehicle_dir(vehicle_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match tokio::fs::read(&path).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                    continue;
                }
            };
            match serde_json::from_slice::<DiagnosticSession>(&content) {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping invalid session file"),
            }
        }

        newest_first(&mut sessions, limit);
        Ok(sessions)
    }
}

fn newest_first(sessions: &mut Vec<DiagnosticSession>, limit: usize) {
    sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    sessions.truncate(limit);
}
