//! Overseer error types

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::types::{AgentId, ItemId, TaskId};

/// Errors that can occur in the orchestration core
#[derive(Debug, Error)]
pub enum OverseerError {
    /// Malformed task, message or approval record
    #[error("Validation error: {0}")]
    Validation(String),

    /// Durable store stayed locked after every retry
    #[error("Contention on {resource} after {attempts} attempts")]
    Contention { resource: String, attempts: u32 },

    /// Workspace cleanup failed
    #[error("Failed to release workspace {}: {reason}", path.display())]
    ResourceRelease { path: PathBuf, reason: String },

    /// Task failed more often than its retry budget allows
    #[error("Task {task_id} exhausted its retries after {attempts} attempts")]
    RetryExhausted { task_id: TaskId, attempts: u32 },

    /// Agent not found
    #[error("Agent not found: {0}")]
    AgentNotFound(AgentId),

    /// Task not found
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    /// Approval item not found
    #[error("Approval item not found: {0}")]
    ItemNotFound(ItemId),

    /// Session teardown finished with failures
    #[error("Cleanup incomplete: {}", failures.join("; "))]
    CleanupIncomplete { failures: Vec<String> },

    /// Filesystem error
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Record (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Channel error
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl OverseerError {
    /// Wrap an I/O error with the path it touched
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Whether a bounded local retry may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Not-found errors are tolerated by cleanup paths
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AgentNotFound(_) | Self::TaskNotFound(_) | Self::ItemNotFound(_)
        )
    }
}

impl From<serde_json::Error> for OverseerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for OverseerError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T, E = OverseerError> = std::result::Result<T, E>;
