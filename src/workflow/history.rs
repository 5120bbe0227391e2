// Persisted workflow history.
//
// Execution is modeled as an explicit log of recorded step outcomes keyed
// by step index and name. On resume the log is replayed to reconstruct
// state without re-running side effects; execution continues at the first
// unrecorded step. One history file per instance, written atomically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use super::instance::WorkflowPhase;
use crate::lock::LockTableSnapshot;
use crate::model::{Command, CommandResult};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Recorded terminal outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepOutcome {
    Completed { value: serde_json::Value },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    pub name: String,
    pub outcome: StepOutcome,
    pub recorded_at: DateTime<Utc>,
}

/// Where and by whom the history was last written
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMetadata {
    pub hostname: String,
    pub pid: Option<u32>,
    pub saved_at: DateTime<Utc>,
}

impl HistoryMetadata {
    fn capture() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            pid: Some(std::process::id()),
            saved_at: Utc::now(),
        }
    }
}

/// Complete durable state of one workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowHistory {
    pub instance_id: Uuid,
    pub command: Command,
    pub phase: WorkflowPhase,
    pub steps: Vec<StepRecord>,
    pub result: CommandResult,
    pub metadata: HistoryMetadata,
}

impl WorkflowHistory {
    pub fn new(command: Command) -> Self {
        let instance_id = command.correlation_id;
        Self {
            instance_id,
            result: CommandResult::pending(instance_id),
            command,
            phase: WorkflowPhase::Created,
            steps: Vec::new(),
            metadata: HistoryMetadata::capture(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn record_step(&mut self, name: &str, outcome: StepOutcome) {
        let record = StepRecord {
            index: self.steps.len() as u32,
            name: name.to_string(),
            outcome,
            recorded_at: Utc::now(),
        };
        self.steps.push(record);
        self.metadata = HistoryMetadata::capture();
    }
}

#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn save(&self, history: &WorkflowHistory) -> Result<(), HistoryError>;
    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowHistory>, HistoryError>;
    /// Histories whose instance has not reached a terminal phase, used to
    /// rebuild the lock table after a restart
    async fn list_active(&self) -> Result<Vec<WorkflowHistory>, HistoryError>;
    async fn remove(&self, instance_id: Uuid) -> Result<(), HistoryError>;
    /// Persist the lock table alongside the instance histories; restored
    /// on startup before any instance resumes
    async fn save_locks(&self, snapshot: &LockTableSnapshot) -> Result<(), HistoryError>;
    async fn load_locks(&self) -> Result<Option<LockTableSnapshot>, HistoryError>;
}

/// File system implementation: one JSON file per instance under a
/// configured directory, written via temp file and rename.
pub struct FileSystemHistoryStore {
    directory: PathBuf,
}

impl FileSystemHistoryStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn history_path(&self, instance_id: Uuid) -> PathBuf {
        self.directory.join(format!("{instance_id}.history.json"))
    }

    fn locks_path(&self) -> PathBuf {
        self.directory.join("locks.json")
    }
}

#[async_trait]
impl HistoryStore for FileSystemHistoryStore {
    async fn save(&self, history: &WorkflowHistory) -> Result<(), HistoryError> {
        fs::create_dir_all(&self.directory).await?;
        let path = self.history_path(history.instance_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(history)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        debug!(instance = %history.instance_id, phase = %history.phase, "history saved");
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowHistory>, HistoryError> {
        let path = self.history_path(instance_id);
        match fs::read(&path).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_active(&self) -> Result<Vec<WorkflowHistory>, HistoryError> {
        let mut active = Vec::new();
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(active),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !name.ends_with(".history.json") {
                continue;
            }
            let body = fs::read(&path).await?;
            match serde_json::from_slice::<WorkflowHistory>(&body) {
                Ok(history) if !history.is_terminal() => active.push(history),
                Ok(_) => {}
                Err(err) => {
                    // A torn file from a crash mid-write; skip it rather
                    // than refuse to start.
                    warn!(path = %path.display(), error = %err, "skipping unreadable history file");
                }
            }
        }
        Ok(active)
    }

    async fn remove(&self, instance_id: Uuid) -> Result<(), HistoryError> {
        let path = self.history_path(instance_id);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_locks(&self, snapshot: &LockTableSnapshot) -> Result<(), HistoryError> {
        fs::create_dir_all(&self.directory).await?;
        let path = self.locks_path();
        let tmp = self.directory.join("locks.json.tmp");
        let body = serde_json::to_vec_pretty(snapshot)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn load_locks(&self) -> Result<Option<LockTableSnapshot>, HistoryError> {
        match fs::read(&self.locks_path()).await {
            Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// In-memory store for tests
#[derive(Default)]
pub struct InMemoryHistoryStore {
    histories: RwLock<HashMap<Uuid, WorkflowHistory>>,
    locks: RwLock<Option<LockTableSnapshot>>,
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn save(&self, history: &WorkflowHistory) -> Result<(), HistoryError> {
        self.histories
            .write()
            .await
            .insert(history.instance_id, history.clone());
        Ok(())
    }

    async fn load(&self, instance_id: Uuid) -> Result<Option<WorkflowHistory>, HistoryError> {
        Ok(self.histories.read().await.get(&instance_id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<WorkflowHistory>, HistoryError> {
        Ok(self
            .histories
            .read()
            .await
            .values()
            .filter(|h| !h.is_terminal())
            .cloned()
            .collect())
    }

    async fn remove(&self, instance_id: Uuid) -> Result<(), HistoryError> {
        self.histories.write().await.remove(&instance_id);
        Ok(())
    }

    async fn save_locks(&self, snapshot: &LockTableSnapshot) -> Result<(), HistoryError> {
        *self.locks.write().await = Some(snapshot.clone());
        Ok(())
    }

    async fn load_locks(&self) -> Result<Option<LockTableSnapshot>, HistoryError> {
        Ok(self.locks.read().await.clone())
    }
}
