//! State store - authoritative in-memory agent states, optionally mirrored to disk

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::agent::{AgentState, AgentStatus};
use crate::error::{OverseerError, Result};
use crate::persist::SnapshotWriter;
use crate::retry::RetryPolicy;
use crate::session::{SessionTable, TableSnapshot};
use crate::types::{AgentId, SessionId};

/// Aggregate numbers for one session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateStats {
    pub total: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub token_sum: u64,
    pub cost_sum: f64,
}

/// Durable mirror of the agent tables, one JSON file per session.
///
/// Never the source of truth: every write replays the latest in-memory
/// snapshot of a session.
pub struct StatePersistence {
    dir: PathBuf,
    policy: RetryPolicy,
    writers: Mutex<HashMap<SessionId, Arc<SnapshotWriter>>>,
}

impl StatePersistence {
    pub fn new(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(&self, session_id: &SessionId) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    fn writer(&self, session_id: &SessionId) -> Arc<SnapshotWriter> {
        self.writers
            .lock()
            .entry(session_id.clone())
            .or_insert_with(|| {
                Arc::new(SnapshotWriter::new(self.path_for(session_id), self.policy))
            })
            .clone()
    }

    pub async fn save(&self, snapshot: &TableSnapshot) -> Result<bool> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        self.writer(&snapshot.session_id)
            .write(snapshot.revision, bytes)
            .await
    }

    pub async fn load(&self, session_id: &SessionId) -> Result<Option<TableSnapshot>> {
        let path = self.path_for(session_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OverseerError::io(&path, e)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Agent state store shared by every component of a controller.
///
/// Each session owns a [`SessionTable`] with its own lock; the outer map is
/// only locked long enough to look a table up.
pub struct StateStore {
    sessions: RwLock<HashMap<SessionId, Arc<SessionTable>>>,
    persistence: Option<StatePersistence>,
}

impl StateStore {
    /// Store without a durable mirror
    pub fn in_memory() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence: None,
        }
    }

    pub fn with_persistence(persistence: StatePersistence) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence: Some(persistence),
        }
    }

    fn table(&self, session_id: &SessionId) -> Arc<SessionTable> {
        if let Some(table) = self.sessions.read().get(session_id) {
            return Arc::clone(table);
        }
        self.sessions
            .write()
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(SessionTable::new(session_id.clone())))
            .clone()
    }

    fn existing(&self, session_id: &SessionId) -> Option<Arc<SessionTable>> {
        self.sessions.read().get(session_id).cloned()
    }

    async fn persist(&self, table: &SessionTable) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            let snapshot = table.snapshot();
            if persistence.save(&snapshot).await? {
                debug!(
                    session_id = %snapshot.session_id,
                    revision = snapshot.revision,
                    "Persisted agent states"
                );
            }
        }
        Ok(())
    }

    /// Insert or replace an agent's state
    pub async fn update(&self, state: AgentState) -> Result<()> {
        let table = self.table(&state.session_id);
        debug!(agent_id = %state.agent_id, status = state.status.as_str(), "Updating agent state");
        table.upsert(state);
        self.persist(&table).await
    }

    /// Atomically mutate an existing agent's state
    pub async fn modify<F>(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        f: F,
    ) -> Result<AgentState>
    where
        F: FnOnce(&mut AgentState),
    {
        let table = self
            .existing(session_id)
            .ok_or_else(|| OverseerError::AgentNotFound(agent_id.clone()))?;
        let updated = table
            .modify(agent_id, f)
            .ok_or_else(|| OverseerError::AgentNotFound(agent_id.clone()))?;
        self.persist(&table).await?;
        Ok(updated)
    }

    /// Set an agent's status, recording `error` when entering ERROR
    pub async fn set_status(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
        status: AgentStatus,
        error: Option<String>,
    ) -> Result<AgentState> {
        self.modify(session_id, agent_id, |state| state.set_status(status, error))
            .await
    }

    pub fn get(&self, session_id: &SessionId, agent_id: &AgentId) -> Result<AgentState> {
        self.existing(session_id)
            .and_then(|table| table.get(agent_id))
            .ok_or_else(|| OverseerError::AgentNotFound(agent_id.clone()))
    }

    pub fn get_all(&self, session_id: &SessionId) -> Vec<AgentState> {
        self.existing(session_id)
            .map(|table| table.list())
            .unwrap_or_default()
    }

    /// Remove an agent's state. Unknown ids are a no-op.
    pub async fn clear(
        &self,
        session_id: &SessionId,
        agent_id: &AgentId,
    ) -> Result<Option<AgentState>> {
        let Some(table) = self.existing(session_id) else {
            return Ok(None);
        };
        let removed = table.remove(agent_id);
        if removed.is_some() {
            debug!(agent_id = %agent_id, "Cleared agent state");
            self.persist(&table).await?;
        }
        Ok(removed)
    }

    /// Remove every state of a session, returning what was there
    #[instrument(skip(self))]
    pub async fn clear_session(&self, session_id: &SessionId) -> Result<Vec<AgentState>> {
        let Some(table) = self.existing(session_id) else {
            return Ok(Vec::new());
        };
        let drained = table.drain();
        info!(session_id = %session_id, cleared = drained.len(), "Cleared session states");
        self.persist(&table).await?;
        Ok(drained)
    }

    pub fn stats(&self, session_id: &SessionId) -> StateStats {
        let mut stats = StateStats::default();
        for state in self.get_all(session_id) {
            stats.total += 1;
            if state.status.is_busy() {
                stats.active += 1;
            }
            match state.status {
                AgentStatus::Completed => stats.completed += 1,
                AgentStatus::Error => stats.failed += 1,
                _ => {}
            }
            stats.token_sum += state.tokens_used;
            stats.cost_sum += state.cost;
        }
        stats
    }

    /// Reload a session from the durable mirror. Returns the number of agents restored.
    #[instrument(skip(self))]
    pub async fn restore(&self, session_id: &SessionId) -> Result<usize> {
        let Some(persistence) = &self.persistence else {
            return Ok(0);
        };
        let Some(snapshot) = persistence.load(session_id).await? else {
            return Ok(0);
        };

        let agents: Vec<AgentState> = snapshot
            .agents
            .into_iter()
            .filter(|state| &state.session_id == session_id)
            .collect();
        let count = agents.len();
        self.table(session_id).replace_all(agents);

        info!(session_id = %session_id, restored = count, "Restored agent states");
        Ok(count)
    }
}
