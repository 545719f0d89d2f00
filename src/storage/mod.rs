//! Persistence layer.
//!
//! Saves and loads per-agent state snapshots. The persisted snapshot is
//! the authoritative restart point for an `AgentStateMachine`.
//!
//! Two implementations are provided:
//! - `JsonFileStore` — one JSON file per agent in a directory (durable)
//! - `MemoryStore` — in-process map, used by tests and dry runs

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

use crate::types::AgentSnapshot;

/// Durable key-value store of per-agent state snapshots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatePersistence: Send + Sync {
    /// Persist the latest snapshot for an agent, replacing any previous one.
    async fn save_state(&self, agent_id: &str, snapshot: &AgentSnapshot) -> Result<()>;

    /// Load the last saved snapshot. Returns `None` for an unknown agent.
    async fn load_state(&self, agent_id: &str) -> Result<Option<AgentSnapshot>>;

    /// Remove the snapshot for an agent (no-op if absent).
    async fn delete_state(&self, agent_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// JSON file store
// ---------------------------------------------------------------------------

/// Stores each agent's snapshot as `<dir>/<agent_id>.json`.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, agent_id: &str) -> PathBuf {
        self.dir.join(agent_file_name(agent_id))
    }
}

/// Whether `agent_id` can name a per-agent file as-is.
pub fn is_valid_agent_id(agent_id: &str) -> bool {
    !agent_id.is_empty()
        && agent_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// `<agent_id>.json`, with characters that could escape a directory
/// replaced. Config validation rejects ids that would need replacing, so
/// distinct configured ids never share a file.
pub fn agent_file_name(agent_id: &str) -> String {
    let safe: String = agent_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}.json")
}

#[async_trait]
impl StatePersistence for JsonFileStore {
    async fn save_state(&self, agent_id: &str, snapshot: &AgentSnapshot) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create state dir {}", self.dir.display()))?;

        let path = self.path_for(agent_id);
        let json = serde_json::to_string_pretty(snapshot)
            .context("Failed to serialise agent snapshot")?;

        // Write-then-rename so a crash never leaves a torn snapshot.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .with_context(|| format!("Failed to write state to {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move state into {}", path.display()))?;

        debug!(agent_id, path = %path.display(), state = %snapshot.state, "State saved");
        Ok(())
    }

    async fn load_state(&self, agent_id: &str) -> Result<Option<AgentSnapshot>> {
        let path = self.path_for(agent_id);

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            info!(agent_id, path = %path.display(), "No saved state found, starting fresh");
            return Ok(None);
        }

        let json = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read state from {}", path.display()))?;

        let snapshot: AgentSnapshot = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse state from {}", path.display()))?;

        info!(
            agent_id,
            path = %path.display(),
            state = %snapshot.state,
            recovery_attempts = snapshot.recovery_attempts,
            "State loaded from disk"
        );

        Ok(Some(snapshot))
    }

    async fn delete_state(&self, agent_id: &str) -> Result<()> {
        let path = self.path_for(agent_id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::remove_file(&path)
                .await
                .with_context(|| format!("Failed to delete state file {}", path.display()))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Keeps snapshots as serialized JSON so round-trips behave like the
/// file store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StatePersistence for MemoryStore {
    async fn save_state(&self, agent_id: &str, snapshot: &AgentSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("Failed to serialise agent snapshot")?;
        self.entries
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?
            .insert(agent_id.to_string(), json);
        Ok(())
    }

    async fn load_state(&self, agent_id: &str) -> Result<Option<AgentSnapshot>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?;
        entries
            .get(agent_id)
            .map(|json| serde_json::from_str(json).context("Failed to parse stored snapshot"))
            .transpose()
    }

    async fn delete_state(&self, agent_id: &str) -> Result<()> {
        self.entries
            .write()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))?
            .remove(agent_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
