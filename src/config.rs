//! Overseer configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{OverseerError, Result};
use crate::retry::RetryPolicy;

/// Configuration for an orchestration session
///
/// Every on-disk location is derived from `root`, so a session can be moved
/// or isolated in tests by pointing `root` somewhere else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverseerConfig {
    /// Directory holding queues, indexes, journals and workspaces
    pub root: PathBuf,
    /// Receiver name the controller polls messages for
    pub controller_id: String,
    /// Message polling period
    pub poll_interval_ms: u64,
    /// Maximum messages handled per poll
    pub poll_batch: usize,
    /// Automatic re-assignments before a failure needs human disposition
    pub max_retries: u32,
    /// Model written into assignment records when a task names none
    pub default_model: String,
    /// Mirror agent state to disk
    pub persist_state: bool,
    /// Failed deliveries after which a stuck message is logged as an error
    pub stuck_after: u32,
    /// Retry policy for durable writes
    pub store_retry: RetryPolicy,
}

impl Default for OverseerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".overseer"),
            controller_id: "controller".to_string(),
            poll_interval_ms: 1000,
            poll_batch: 64,
            max_retries: 3,
            default_model: "sonnet".to_string(),
            persist_state: true,
            stuck_after: 5,
            store_retry: RetryPolicy::default(),
        }
    }
}

impl OverseerConfig {
    /// Config rooted at `root` with every other value defaulted
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load a YAML config file; missing keys take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| OverseerError::io(path, e))?;
        let config: Self = serde_yaml::from_str(&raw)
            .map_err(|e| OverseerError::ConfigError(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller_id.trim().is_empty() {
            return Err(OverseerError::ConfigError("controller_id must not be empty".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(OverseerError::ConfigError("poll_interval_ms must be positive".into()));
        }
        if self.poll_batch == 0 {
            return Err(OverseerError::ConfigError("poll_batch must be positive".into()));
        }
        if self.store_retry.max_attempts == 0 {
            return Err(OverseerError::ConfigError(
                "store_retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.root.join("queue").join("messages")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("queue").join("processed")
    }

    pub fn approvals_dir(&self) -> PathBuf {
        self.root.join("approvals")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn mailbox_dir(&self) -> PathBuf {
        self.root.join("mailbox")
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.root.join("workspaces")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = OverseerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.store_retry.max_attempts, 3);
    }

    #[test]
    fn test_paths_follow_root() {
        let config = OverseerConfig::with_root("/srv/run");
        assert_eq!(config.queue_dir(), PathBuf::from("/srv/run/queue/messages"));
        assert_eq!(config.processed_dir(), PathBuf::from("/srv/run/queue/processed"));
        assert_eq!(config.logs_dir(), PathBuf::from("/srv/run/logs"));
    }

    #[test]
    fn test_load_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overseer.yaml");
        std::fs::write(&path, "max_retries: 2\npoll_interval_ms: 250\n").unwrap();

        let config = OverseerConfig::load(&path).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.controller_id, "controller");
    }

    #[test]
    fn test_load_rejects_zero_interval() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overseer.yaml");
        std::fs::write(&path, "poll_interval_ms: 0\n").unwrap();

        let err = OverseerConfig::load(&path).unwrap_err();
        assert!(matches!(err, OverseerError::ConfigError(_)));
    }
}
