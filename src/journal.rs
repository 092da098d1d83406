//! Per-agent journals - one human-readable log file per agent, kept after the agent is gone

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{OverseerError, Result};
use crate::types::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for JournalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JournalLevel::Debug => "DEBUG",
            JournalLevel::Info => "INFO",
            JournalLevel::Warn => "WARN",
            JournalLevel::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Appends `HH:MM:SS | LEVEL | message` lines to `<dir>/<agent>.log`.
///
/// Nothing in the crate deletes journal files.
pub struct AgentJournal {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AgentJournal {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, agent_id: &AgentId) -> PathBuf {
        self.dir.join(format!("{agent_id}.log"))
    }

    pub async fn append(
        &self,
        agent_id: &AgentId,
        level: JournalLevel,
        message: impl AsRef<str>,
    ) -> Result<()> {
        let line = format!(
            "{} | {level} | {}\n",
            Local::now().format("%H:%M:%S"),
            message.as_ref().replace('\n', " ")
        );
        let path = self.path_for(agent_id);

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| OverseerError::io(&self.dir, e))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| OverseerError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| OverseerError::io(&path, e))?;
        file.flush().await.map_err(|e| OverseerError::io(&path, e))
    }

    pub async fn info(&self, agent_id: &AgentId, message: impl AsRef<str>) -> Result<()> {
        self.append(agent_id, JournalLevel::Info, message).await
    }

    pub async fn warn(&self, agent_id: &AgentId, message: impl AsRef<str>) -> Result<()> {
        self.append(agent_id, JournalLevel::Warn, message).await
    }

    /// All lines written for `agent_id`; empty when it never logged
    pub async fn read(&self, agent_id: &AgentId) -> Result<Vec<String>> {
        let path = self.path_for(agent_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(raw.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(OverseerError::io(&path, e)),
        }
    }

    /// Last `n` lines
    pub async fn tail(&self, agent_id: &AgentId, n: usize) -> Result<Vec<String>> {
        let mut lines = self.read(agent_id).await?;
        let start = lines.len().saturating_sub(n);
        Ok(lines.split_off(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let journal = AgentJournal::new(dir.path().join("logs"));
        let agent = AgentId::from("coder-1");

        journal.info(&agent, "workspace created").await.unwrap();
        journal
            .append(&agent, JournalLevel::Error, "release failed\nbusy")
            .await
            .unwrap();

        let lines = journal.read(&agent).await.unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" | INFO | workspace created"));
        assert!(lines[1].ends_with(" | ERROR | release failed busy"));
        assert_eq!(lines[0].split(" | ").next().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_unknown_agent_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = AgentJournal::new(dir.path());
        assert!(journal.read(&AgentId::from("nobody")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tail() {
        let dir = tempfile::tempdir().unwrap();
        let journal = AgentJournal::new(dir.path());
        let agent = AgentId::from("coder-1");
        for i in 0..5 {
            journal.info(&agent, format!("line {i}")).await.unwrap();
        }

        let tail = journal.tail(&agent, 2).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert!(tail[1].ends_with("line 4"));
    }
}
