//! Tasks - units of work handed to workers

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::{OverseerError, Result};
use crate::types::{AgentId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

fn default_role() -> String {
    "worker".to_string()
}

fn default_max_retries() -> u32 {
    3
}

/// A subtask derived from the session goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Role label of the worker that should take the task
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub assigned_agent: Option<AgentId>,
    pub status: TaskStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub dependencies: BTreeSet<TaskId>,
    /// Reviewer feedback from rejected attempts, oldest first
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Reported complete but not yet approved
    #[serde(default)]
    pub under_review: bool,
    /// Failed past its retry budget; waiting on a human decision
    #[serde(default)]
    pub exhausted: bool,
}

impl Task {
    pub fn new(task_id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            task_id: task_id.into(),
            description: title.clone(),
            title,
            role: default_role(),
            model: None,
            assigned_agent: None,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries: default_max_retries(),
            dependencies: BTreeSet::new(),
            feedback: Vec::new(),
            result: None,
            error: None,
            under_review: false,
            exhausted: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn depends_on(mut self, task_id: impl Into<TaskId>) -> Self {
        self.dependencies.insert(task_id.into());
        self
    }

    /// Completed and approved; dependents may start
    pub fn is_settled(&self) -> bool {
        self.status == TaskStatus::Completed && !self.under_review
    }

    pub fn is_assignable(&self) -> bool {
        self.status == TaskStatus::Pending && !self.exhausted
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_id.as_str().trim().is_empty() {
            return Err(OverseerError::Validation("task id is empty".into()));
        }
        if self.title.trim().is_empty() {
            return Err(OverseerError::Validation(format!(
                "task {} has an empty title",
                self.task_id
            )));
        }
        if self.dependencies.contains(&self.task_id) {
            return Err(OverseerError::Validation(format!(
                "task {} depends on itself",
                self.task_id
            )));
        }
        Ok(())
    }

    /// Prompt handed to the worker, including feedback from rejected attempts
    pub fn prompt(&self) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "{}", self.description.trim());
        let _ = writeln!(prompt);
        let _ = writeln!(prompt, "## Task Details");
        let _ = writeln!(prompt, "- Task ID: {}", self.task_id);
        let _ = writeln!(prompt, "- Title: {}", self.title);

        if !self.feedback.is_empty() {
            let _ = writeln!(prompt);
            let _ = writeln!(prompt, "## Reviewer Feedback");
            for (attempt, note) in self.feedback.iter().enumerate() {
                let _ = writeln!(prompt, "- Attempt {} was rejected: {}", attempt + 1, note.trim());
            }
            let _ = writeln!(prompt);
            let _ = writeln!(prompt, "Address every point above before reporting completion.");
        }
        prompt
    }
}

/// Progress across all tasks of a session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub percent_complete: f64,
}

impl TaskSummary {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut summary = Self::default();
        for task in tasks {
            summary.total += 1;
            match task.status {
                TaskStatus::Pending => summary.pending += 1,
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
            }
        }
        if summary.total > 0 {
            summary.percent_complete = summary.completed as f64 / summary.total as f64 * 100.0;
        }
        summary
    }
}
