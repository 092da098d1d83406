//! Agent state - the controller's record of a single worker

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{AgentId, SessionId};

/// Worker status as tracked by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Idle,
    Active,
    Thinking,
    Waiting,
    Error,
    Completed,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "IDLE",
            AgentStatus::Active => "ACTIVE",
            AgentStatus::Thinking => "THINKING",
            AgentStatus::Waiting => "WAITING",
            AgentStatus::Error => "ERROR",
            AgentStatus::Completed => "COMPLETED",
        }
    }

    /// The attempt is over; only a decision or cleanup moves it on
    pub fn is_settled(self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Error)
    }

    /// Busy statuses count toward `StateStats::active`
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            AgentStatus::Active | AgentStatus::Thinking | AgentStatus::Waiting
        )
    }
}

/// One entry per live (or pending-approval) worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub role: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub current_task: String,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub workspace_path: Option<PathBuf>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub session_id: SessionId,
    pub last_updated: DateTime<Utc>,
}

impl AgentState {
    /// A freshly spawned, idle worker
    pub fn new(agent_id: AgentId, role: impl Into<String>, session_id: SessionId) -> Self {
        Self {
            agent_id,
            role: role.into(),
            status: AgentStatus::Idle,
            current_task: String::new(),
            tokens_used: 0,
            cost: 0.0,
            workspace_path: None,
            error_message: None,
            session_id,
            last_updated: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_path = Some(path.into());
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.current_task = task.into();
        self
    }

    /// Set status; entering ERROR records the message, leaving it clears it
    pub fn set_status(&mut self, status: AgentStatus, error: Option<String>) {
        self.status = status;
        self.error_message = match status {
            AgentStatus::Error => error,
            _ => None,
        };
        self.touch();
    }

    /// Accumulate token usage and cost
    pub fn add_usage(&mut self, tokens: u64, cost: f64) {
        self.tokens_used += tokens;
        self.cost += cost;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}
