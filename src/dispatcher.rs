//! Task dispatcher - FIFO queue with dependency gating, assignment and bounded retries

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::bus::MessageBus;
use crate::error::{OverseerError, Result};
use crate::message::{Message, MessagePayload};
use crate::task::{Task, TaskStatus, TaskSummary};
use crate::types::{AgentId, MessageId, TaskId};

/// A progress report from a worker
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub text: String,
    pub percentage: Option<u8>,
    pub tokens_used: u64,
    pub cost: f64,
}

impl Progress {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn percent(mut self, percentage: u8) -> Self {
        self.percentage = Some(percentage);
        self
    }

    pub fn usage(mut self, tokens_used: u64, cost: f64) -> Self {
        self.tokens_used = tokens_used;
        self.cost = cost;
        self
    }
}

#[derive(Default)]
struct TaskBook {
    /// Enqueue order
    order: Vec<TaskId>,
    tasks: HashMap<TaskId, Task>,
}

impl TaskBook {
    fn get_mut(&mut self, task_id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(task_id)
            .ok_or_else(|| OverseerError::TaskNotFound(task_id.clone()))
    }

    fn holds_task(&self, agent_id: &AgentId) -> Option<&Task> {
        self.tasks.values().find(|task| {
            task.status == TaskStatus::InProgress && task.assigned_agent.as_ref() == Some(agent_id)
        })
    }

    fn dependencies_settled(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.tasks.get(dep).is_some_and(Task::is_settled))
    }
}

/// Owns every task of a session and publishes worker reports onto the bus.
///
/// All queue mutations happen under one short lock; messages are sent after
/// the lock is released.
pub struct TaskDispatcher {
    book: Mutex<TaskBook>,
    bus: Arc<MessageBus>,
    controller_id: String,
}

impl TaskDispatcher {
    pub fn new(bus: Arc<MessageBus>, controller_id: impl Into<String>) -> Self {
        Self {
            book: Mutex::new(TaskBook::default()),
            bus,
            controller_id: controller_id.into(),
        }
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    /// Add a task to the back of the queue.
    ///
    /// Every dependency must already be enqueued, so the graph stays acyclic.
    pub fn enqueue(&self, mut task: Task) -> Result<()> {
        task.validate()?;
        let mut book = self.book.lock();
        if book.tasks.contains_key(&task.task_id) {
            return Err(OverseerError::Validation(format!(
                "task {} is already enqueued",
                task.task_id
            )));
        }
        if let Some(missing) = task.dependencies.iter().find(|dep| !book.tasks.contains_key(*dep)) {
            return Err(OverseerError::Validation(format!(
                "task {} depends on unknown task {missing}",
                task.task_id
            )));
        }

        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        info!(task_id = %task.task_id, deps = task.dependencies.len(), "Task enqueued");
        book.order.push(task.task_id.clone());
        book.tasks.insert(task.task_id.clone(), task);
        Ok(())
    }

    /// Hand the first eligible pending task to `agent_id`
    #[instrument(skip(self))]
    pub fn assign_next(&self, agent_id: &AgentId) -> Option<Task> {
        let mut book = self.book.lock();
        if let Some(held) = book.holds_task(agent_id) {
            warn!(agent_id = %agent_id, task_id = %held.task_id, "Agent already holds a task");
            return None;
        }

        let next = book
            .order
            .iter()
            .filter_map(|id| book.tasks.get(id))
            .find(|task| task.is_assignable() && book.dependencies_settled(task))
            .map(|task| task.task_id.clone())?;

        let task = book.tasks.get_mut(&next)?;
        task.status = TaskStatus::InProgress;
        task.assigned_agent = Some(agent_id.clone());
        task.error = None;
        info!(agent_id = %agent_id, task_id = %task.task_id, "Task assigned");
        Some(task.clone())
    }

    pub fn get(&self, task_id: &TaskId) -> Result<Task> {
        self.book
            .lock()
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| OverseerError::TaskNotFound(task_id.clone()))
    }

    /// Every task in enqueue order
    pub fn tasks(&self) -> Vec<Task> {
        let book = self.book.lock();
        book.order
            .iter()
            .filter_map(|id| book.tasks.get(id).cloned())
            .collect()
    }

    pub fn task_for_agent(&self, agent_id: &AgentId) -> Option<Task> {
        self.book.lock().holds_task(agent_id).cloned()
    }

    pub fn summary(&self) -> TaskSummary {
        let book = self.book.lock();
        TaskSummary::from_tasks(book.tasks.values())
    }

    /// Drop every task, returning how many there were
    pub fn clear(&self) -> usize {
        let mut book = self.book.lock();
        let count = book.tasks.len();
        book.order.clear();
        book.tasks.clear();
        count
    }

    fn check_reporter(&self, agent_id: &AgentId, task_id: &TaskId) -> Result<()> {
        let book = self.book.lock();
        let task = book
            .tasks
            .get(task_id)
            .ok_or_else(|| OverseerError::TaskNotFound(task_id.clone()))?;
        if task.status != TaskStatus::InProgress || task.assigned_agent.as_ref() != Some(agent_id) {
            return Err(OverseerError::Validation(format!(
                "agent {agent_id} does not hold task {task_id}"
            )));
        }
        Ok(())
    }

    async fn publish(&self, sender: &str, payload: MessagePayload) -> Result<MessageId> {
        self.bus
            .send(Message::new(sender, self.controller_id.as_str(), payload))
            .await
    }

    pub async fn report_started(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        description: impl Into<String>,
    ) -> Result<MessageId> {
        self.check_reporter(agent_id, task_id)?;
        self.publish(
            agent_id.as_str(),
            MessagePayload::TaskStarted {
                task_id: task_id.clone(),
                description: description.into(),
            },
        )
        .await
    }

    pub async fn report_progress(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        progress: Progress,
    ) -> Result<MessageId> {
        self.check_reporter(agent_id, task_id)?;
        self.publish(
            agent_id.as_str(),
            MessagePayload::TaskProgress {
                task_id: task_id.clone(),
                progress: progress.text,
                percentage: progress.percentage,
                tokens_used: progress.tokens_used,
                cost: progress.cost,
            },
        )
        .await
    }

    /// Apply a worker's completion: IN_PROGRESS becomes COMPLETED, held under
    /// review until a decision confirms it.
    ///
    /// `Ok(false)` when this attempt's completion was already applied.
    pub fn mark_completed(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        result: impl Into<String>,
    ) -> Result<bool> {
        let mut book = self.book.lock();
        let task = book.get_mut(task_id)?;
        let held = task.assigned_agent.as_ref() == Some(agent_id);
        match task.status {
            TaskStatus::InProgress if held => {
                task.status = TaskStatus::Completed;
                task.under_review = true;
                task.result = Some(result.into());
                info!(agent_id = %agent_id, task_id = %task_id, "Task completed, awaiting review");
                Ok(true)
            }
            TaskStatus::Completed if held && task.under_review => Ok(false),
            _ => Err(OverseerError::Validation(format!(
                "agent {agent_id} does not hold task {task_id}"
            ))),
        }
    }

    /// Apply a worker's failure: IN_PROGRESS becomes FAILED.
    ///
    /// `Ok(false)` when this attempt's failure was already applied.
    pub fn mark_failed(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        error: impl Into<String>,
    ) -> Result<bool> {
        let mut book = self.book.lock();
        let task = book.get_mut(task_id)?;
        let held = task.assigned_agent.as_ref() == Some(agent_id);
        match task.status {
            TaskStatus::InProgress if held => {
                task.status = TaskStatus::Failed;
                task.error = Some(error.into());
                warn!(agent_id = %agent_id, task_id = %task_id, "Task failed");
                Ok(true)
            }
            TaskStatus::Failed if held => Ok(false),
            _ => Err(OverseerError::Validation(format!(
                "agent {agent_id} does not hold task {task_id}"
            ))),
        }
    }

    /// Undo a transition whose message never reached the bus
    fn reopen(&self, agent_id: &AgentId, task_id: &TaskId) {
        let mut book = self.book.lock();
        let Ok(task) = book.get_mut(task_id) else {
            return;
        };
        if task.assigned_agent.as_ref() != Some(agent_id) || task.exhausted {
            return;
        }
        if matches!(task.status, TaskStatus::Completed | TaskStatus::Failed) {
            task.status = TaskStatus::InProgress;
            task.under_review = false;
            task.result = None;
            task.error = None;
            debug!(
                agent_id = %agent_id,
                task_id = %task_id,
                "Report withdrawn, task back in progress"
            );
        }
    }

    /// Report a finished attempt. The task is COMPLETED before the message is
    /// visible to any handler.
    #[instrument(skip(self, result, changed_resources))]
    pub async fn report_completed(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        result: impl Into<String>,
        changed_resources: Vec<String>,
    ) -> Result<MessageId> {
        let result = result.into();
        if !self.mark_completed(agent_id, task_id, result.clone())? {
            return Err(OverseerError::Validation(format!(
                "task {task_id} was already reported completed"
            )));
        }
        let payload = MessagePayload::TaskCompleted {
            task_id: task_id.clone(),
            result,
            changed_resources,
        };
        match self.publish(agent_id.as_str(), payload).await {
            Ok(message_id) => Ok(message_id),
            Err(e) => {
                self.reopen(agent_id, task_id);
                Err(e)
            }
        }
    }

    /// Report a failed attempt. The task is FAILED before the message is
    /// visible to any handler.
    #[instrument(skip(self, error))]
    pub async fn report_failed(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        error: impl Into<String>,
    ) -> Result<MessageId> {
        let error = error.into();
        if !self.mark_failed(agent_id, task_id, error.clone())? {
            return Err(OverseerError::Validation(format!(
                "task {task_id} was already reported failed"
            )));
        }
        let payload = MessagePayload::TaskFailed {
            task_id: task_id.clone(),
            error,
        };
        match self.publish(agent_id.as_str(), payload).await {
            Ok(message_id) => Ok(message_id),
            Err(e) => {
                self.reopen(agent_id, task_id);
                Err(e)
            }
        }
    }

    /// Put a task back in the queue for a different worker.
    ///
    /// Tasks waiting on a decision (under review, or out of retries) are
    /// refused; the decision requeues them.
    #[instrument(skip(self, reason))]
    pub async fn request_reassignment(
        &self,
        task_id: &TaskId,
        reason: impl Into<String>,
    ) -> Result<()> {
        let previous_agent = {
            let mut book = self.book.lock();
            let task = book.get_mut(task_id)?;
            if task.status == TaskStatus::Completed {
                let state = if task.under_review { "awaiting review" } else { "already approved" };
                return Err(OverseerError::Validation(format!("task {task_id} is {state}")));
            }
            if task.exhausted {
                return Err(OverseerError::Validation(format!(
                    "task {task_id} is out of retries and awaiting a decision"
                )));
            }
            task.status = TaskStatus::Pending;
            task.result = None;
            task.assigned_agent.take()
        };

        self.publish(
            &self.controller_id,
            MessagePayload::ReassignRequest {
                task_id: task_id.clone(),
                reason: reason.into(),
                previous_agent,
            },
        )
        .await?;
        Ok(())
    }

    /// Re-enqueue a FAILED task if its retry budget allows.
    ///
    /// `Ok(false)` when the task is not retryable right now (not FAILED, or
    /// already exhausted and waiting on a decision).
    #[instrument(skip(self))]
    pub async fn retry_failed(&self, task_id: &TaskId) -> Result<bool> {
        let (attempt, max) = {
            let mut book = self.book.lock();
            let task = book.get_mut(task_id)?;
            if task.status != TaskStatus::Failed || task.exhausted {
                return Ok(false);
            }
            if task.retry_count >= task.max_retries {
                task.exhausted = true;
                warn!(task_id = %task_id, retries = task.retry_count, "Retry budget exhausted");
                return Err(OverseerError::RetryExhausted {
                    task_id: task_id.clone(),
                    attempts: task.retry_count + 1,
                });
            }
            task.retry_count += 1;
            (task.retry_count, task.max_retries)
        };

        info!(task_id = %task_id, attempt, max, "Retrying failed task");
        self.request_reassignment(task_id, format!("retry {attempt}/{max}"))
            .await?;
        Ok(true)
    }

    /// An approved completion unblocks dependents
    pub fn confirm(&self, task_id: &TaskId) -> Result<()> {
        let mut book = self.book.lock();
        let task = book.get_mut(task_id)?;
        if task.status != TaskStatus::Completed {
            return Err(OverseerError::Validation(format!(
                "task {task_id} is {:?}, not completed",
                task.status
            )));
        }
        task.under_review = false;
        debug!(task_id = %task_id, "Task confirmed");
        Ok(())
    }

    /// Rejection path: back to PENDING with the reviewer's feedback attached
    pub fn requeue_with_feedback(
        &self,
        task_id: &TaskId,
        feedback: impl Into<String>,
    ) -> Result<()> {
        let mut book = self.book.lock();
        let task = book.get_mut(task_id)?;
        if task.is_settled() {
            return Err(OverseerError::Validation(format!(
                "task {task_id} is already approved"
            )));
        }
        if task.exhausted {
            task.exhausted = false;
            task.retry_count = 0;
        }
        task.feedback.push(feedback.into());
        task.status = TaskStatus::Pending;
        task.assigned_agent = None;
        task.under_review = false;
        task.result = None;
        info!(task_id = %task_id, rejections = task.feedback.len(), "Task requeued with feedback");
        Ok(())
    }
}
