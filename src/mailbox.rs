//! Worker mailbox - assignment records handed out and report records handed back

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error};

use crate::error::{OverseerError, Result};
use crate::persist::write_atomic;
use crate::types::{AgentId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssignmentStatus {
    Assigned,
    InProgress,
    Completed,
    Failed,
}

/// `assignments/<agent>.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub role: String,
    pub prompt: String,
    pub model: String,
    pub status: AssignmentStatus,
    pub assigned_at: DateTime<Utc>,
}

/// `reports/<agent>.yaml`, written by the worker when it is done
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub task_id: TaskId,
    pub role: String,
    pub status: AssignmentStatus,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub changed_resources: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl Report {
    pub fn is_final(&self) -> bool {
        matches!(self.status, AssignmentStatus::Completed | AssignmentStatus::Failed)
    }
}

pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn assignment_path(&self, agent_id: &AgentId) -> PathBuf {
        self.dir.join("assignments").join(format!("{agent_id}.yaml"))
    }

    pub fn report_path(&self, agent_id: &AgentId) -> PathBuf {
        self.dir.join("reports").join(format!("{agent_id}.yaml"))
    }

    fn collected_dir(&self) -> PathBuf {
        self.dir.join("reports").join("collected")
    }

    async fn write_yaml<T: Serialize>(path: &Path, record: &T) -> Result<()> {
        let yaml = serde_yaml::to_string(record)?;
        write_atomic(path, yaml.as_bytes()).await
    }

    async fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(raw) => Ok(Some(serde_yaml::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OverseerError::io(path, e)),
        }
    }

    pub async fn write_assignment(
        &self,
        agent_id: &AgentId,
        assignment: &Assignment,
    ) -> Result<()> {
        let path = self.assignment_path(agent_id);
        Self::write_yaml(&path, assignment).await?;
        debug!(agent_id = %agent_id, task_id = %assignment.task_id, "Assignment written");
        Ok(())
    }

    pub async fn read_assignment(&self, agent_id: &AgentId) -> Result<Option<Assignment>> {
        Self::read_yaml(&self.assignment_path(agent_id)).await
    }

    /// Update the status of an existing assignment; `false` if there is none
    pub async fn set_assignment_status(
        &self,
        agent_id: &AgentId,
        status: AssignmentStatus,
    ) -> Result<bool> {
        let Some(mut assignment) = self.read_assignment(agent_id).await? else {
            return Ok(false);
        };
        assignment.status = status;
        self.write_assignment(agent_id, &assignment).await?;
        Ok(true)
    }

    pub async fn write_report(&self, agent_id: &AgentId, report: &Report) -> Result<()> {
        Self::write_yaml(&self.report_path(agent_id), report).await
    }

    /// Final reports waiting to be collected, by agent
    pub async fn reports(&self) -> Result<Vec<(AgentId, Report)>> {
        let dir = self.dir.join("reports");
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(OverseerError::io(&dir, e)),
        };

        let mut reports = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OverseerError::io(&dir, e))?
        {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "yaml") {
                continue;
            }
            let Some(agent) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            match Self::read_yaml::<Report>(&path).await {
                Ok(Some(report)) if report.is_final() => {
                    reports.push((AgentId::from(agent), report))
                }
                Ok(_) => {}
                Err(e) => error!(path = %path.display(), error = %e, "Skipping unreadable report"),
            }
        }
        reports.sort_by(|a, b| a.1.completed_at.cmp(&b.1.completed_at));
        Ok(reports)
    }

    /// Move a collected report out of the way so it is ingested once
    pub async fn archive_report(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<()> {
        let from = self.report_path(agent_id);
        let collected = self.collected_dir();
        fs::create_dir_all(&collected)
            .await
            .map_err(|e| OverseerError::io(&collected, e))?;
        let to = collected.join(format!(
            "{agent_id}-{task_id}-{}.yaml",
            Utc::now().format("%Y%m%d%H%M%S%3f")
        ));
        fs::rename(&from, &to)
            .await
            .map_err(|e| OverseerError::io(&from, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment() -> Assignment {
        Assignment {
            task_id: TaskId::from("t1"),
            role: "coder".into(),
            prompt: "Implement the parser".into(),
            model: "sonnet".into(),
            status: AssignmentStatus::Assigned,
            assigned_at: Utc::now(),
        }
    }

    fn report(status: AssignmentStatus) -> Report {
        Report {
            task_id: TaskId::from("t1"),
            role: "coder".into(),
            status,
            result: "parser done".into(),
            changed_resources: vec!["src/parser.rs".into()],
            completed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_assignment_status_update() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());
        let agent = AgentId::from("coder-1");

        assert!(!mailbox
            .set_assignment_status(&agent, AssignmentStatus::InProgress)
            .await
            .unwrap());

        mailbox.write_assignment(&agent, &assignment()).await.unwrap();
        mailbox
            .set_assignment_status(&agent, AssignmentStatus::InProgress)
            .await
            .unwrap();

        let stored = mailbox.read_assignment(&agent).await.unwrap().unwrap();
        assert_eq!(stored.status, AssignmentStatus::InProgress);

        let raw = std::fs::read_to_string(mailbox.assignment_path(&agent)).unwrap();
        assert!(raw.contains("status: IN_PROGRESS"));
    }

    #[tokio::test]
    async fn test_only_final_reports_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());

        mailbox
            .write_report(&AgentId::from("coder-1"), &report(AssignmentStatus::Completed))
            .await
            .unwrap();
        mailbox
            .write_report(&AgentId::from("coder-2"), &report(AssignmentStatus::InProgress))
            .await
            .unwrap();

        let reports = mailbox.reports().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0.as_str(), "coder-1");
    }

    #[tokio::test]
    async fn test_archived_reports_are_not_collected_again() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Mailbox::new(dir.path());
        let agent = AgentId::from("coder-1");

        mailbox
            .write_report(&agent, &report(AssignmentStatus::Failed))
            .await
            .unwrap();
        mailbox.archive_report(&agent, &TaskId::from("t1")).await.unwrap();

        assert!(mailbox.reports().await.unwrap().is_empty());
        assert!(!mailbox.report_path(&agent).exists());
    }
}
