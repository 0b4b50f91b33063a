//! Persists executor state at node-completion boundaries and restores it on
//! resume. A child sub-workflow's checkpoint is namespaced by
//! `(parent_run_id, parent_node_id)`: on resume, if any child lacks a
//! completed terminal checkpoint, the parent restarts that sub-workflow
//! node from scratch rather than trying to resume the child mid-flight.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;

/// Namespaces a checkpoint to either a top-level run or a specific
/// sub-workflow invocation within a parent run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub run_id: Uuid,
    /// `Some((parent_run_id, parent_node_id))` for a sub-workflow child's
    /// checkpoint; `None` for a top-level run.
    pub parent: Option<(Uuid, String)>,
}

impl CheckpointKey {
    pub fn top_level(run_id: Uuid) -> Self {
        Self { run_id, parent: None }
    }

    pub fn child(run_id: Uuid, parent_run_id: Uuid, parent_node_id: impl Into<String>) -> Self {
        Self { run_id, parent: Some((parent_run_id, parent_node_id.into())) }
    }

    fn file_stem(&self) -> String {
        match &self.parent {
            None => self.run_id.to_string(),
            Some((parent_id, node_id)) => format!("{parent_id}__{node_id}__{}", self.run_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub run_id: Uuid,
    pub state: Value,
    pub completed_nodes: Vec<String>,
    /// Execution order recorded for compensation purposes, so a resumed
    /// run can still compensate in the right order if it later fails.
    pub execution_order: Vec<String>,
    /// Whether the run this snapshot describes reached a terminal state.
    /// A sub-workflow parent consults this on resume: a child lacking a
    /// terminal checkpoint means the parent restarts that node from
    /// scratch instead of trying to splice in partial child progress.
    pub terminal: bool,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, key: CheckpointKey, snapshot: CheckpointSnapshot) -> Result<(), EngineError>;
    async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointSnapshot>, EngineError>;
    async fn delete(&self, key: &CheckpointKey) -> Result<(), EngineError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    snapshots: dashmap::DashMap<CheckpointKey, CheckpointSnapshot>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn put(&self, key: CheckpointKey, snapshot: CheckpointSnapshot) -> Result<(), EngineError> {
        self.snapshots.insert(key, snapshot);
        Ok(())
    }

    async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointSnapshot>, EngineError> {
        Ok(self.snapshots.get(key).map(|s| s.clone()))
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<(), EngineError> {
        self.snapshots.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed implementation
// ---------------------------------------------------------------------------

pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| EngineError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &CheckpointKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.file_stem()))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, key: CheckpointKey, snapshot: CheckpointSnapshot) -> Result<(), EngineError> {
        let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|e| EngineError::Io(e.to_string()))?;
        tokio::fs::write(self.path_for(&key), bytes).await.map_err(|e| EngineError::Io(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &CheckpointKey) -> Result<Option<CheckpointSnapshot>, EngineError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::Io(e.to_string())),
        }
    }

    async fn delete(&self, key: &CheckpointKey) -> Result<(), EngineError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) | Err(_) => Ok(()),
        }
    }
}
