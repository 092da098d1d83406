//! Per-session agent table

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::agent::AgentState;
use crate::types::{AgentId, SessionId};

/// Point-in-time copy of a session table, as written to the durable backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub session_id: SessionId,
    pub revision: u64,
    pub agents: Vec<AgentState>,
}

struct TableInner {
    agents: BTreeMap<AgentId, AgentState>,
    revision: u64,
}

/// The agent states of one session behind a single lock.
///
/// Every method takes the lock for exactly one logical operation and never
/// across an await point.
pub struct SessionTable {
    id: SessionId,
    inner: Mutex<TableInner>,
}

impl SessionTable {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            inner: Mutex::new(TableInner {
                agents: BTreeMap::new(),
                revision: 0,
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Insert or replace an agent's state
    pub fn upsert(&self, state: AgentState) {
        let mut inner = self.inner.lock();
        inner.agents.insert(state.agent_id.clone(), state);
        inner.revision += 1;
    }

    /// Apply `f` to an existing entry; `None` if the agent is unknown
    pub fn modify<F>(&self, agent_id: &AgentId, f: F) -> Option<AgentState>
    where
        F: FnOnce(&mut AgentState),
    {
        let mut inner = self.inner.lock();
        let state = inner.agents.get_mut(agent_id)?;
        f(state);
        state.touch();
        let updated = state.clone();
        inner.revision += 1;
        Some(updated)
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<AgentState> {
        self.inner.lock().agents.get(agent_id).cloned()
    }

    pub fn list(&self) -> Vec<AgentState> {
        self.inner.lock().agents.values().cloned().collect()
    }

    pub fn remove(&self, agent_id: &AgentId) -> Option<AgentState> {
        let mut inner = self.inner.lock();
        let removed = inner.agents.remove(agent_id);
        if removed.is_some() {
            inner.revision += 1;
        }
        removed
    }

    pub fn drain(&self) -> Vec<AgentState> {
        let mut inner = self.inner.lock();
        let drained: Vec<AgentState> = std::mem::take(&mut inner.agents).into_values().collect();
        inner.revision += 1;
        drained
    }

    /// Replace the whole table, e.g. when restoring from disk
    pub fn replace_all(&self, agents: Vec<AgentState>) {
        let mut inner = self.inner.lock();
        inner.agents = agents
            .into_iter()
            .map(|state| (state.agent_id.clone(), state))
            .collect();
        inner.revision += 1;
    }

    pub fn snapshot(&self) -> TableSnapshot {
        let inner = self.inner.lock();
        TableSnapshot {
            session_id: self.id.clone(),
            revision: inner.revision,
            agents: inner.agents.values().cloned().collect(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.inner.lock().revision
    }

    pub fn len(&self) -> usize {
        self.inner.lock().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;

    fn create_test_table() -> SessionTable {
        SessionTable::new(SessionId::from("s1"))
    }

    fn state(id: &str) -> AgentState {
        AgentState::new(AgentId::from(id), "coder", SessionId::from("s1"))
    }

    #[test]
    fn test_table_creation() {
        let table = create_test_table();
        assert!(table.is_empty());
        assert_eq!(table.revision(), 0);
    }

    #[test]
    fn test_upsert_replaces_existing_entry() {
        let table = create_test_table();
        table.upsert(state("a1"));
        table.upsert(state("a1").with_status(AgentStatus::Active));

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&AgentId::from("a1")).unwrap().status, AgentStatus::Active);
        assert_eq!(table.revision(), 2);
    }

    #[test]
    fn test_modify_unknown_agent() {
        let table = create_test_table();
        let result = table.modify(&AgentId::from("ghost"), |s| s.add_usage(10, 0.0));
        assert!(result.is_none());
        assert_eq!(table.revision(), 0);
    }

    #[test]
    fn test_remove_missing_keeps_revision() {
        let table = create_test_table();
        table.upsert(state("a1"));

        assert!(table.remove(&AgentId::from("a1")).is_some());
        assert!(table.remove(&AgentId::from("a1")).is_none());
        assert_eq!(table.revision(), 2);
    }

    #[test]
    fn test_snapshot_is_sorted_by_agent() {
        let table = create_test_table();
        table.upsert(state("b"));
        table.upsert(state("a"));

        let snapshot = table.snapshot();
        let ids: Vec<&str> = snapshot.agents.iter().map(|s| s.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(snapshot.revision, 2);
    }

    #[test]
    fn test_drain_empties_table() {
        let table = create_test_table();
        table.upsert(state("a"));
        table.upsert(state("b"));

        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }
}
