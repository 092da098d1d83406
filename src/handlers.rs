//! Controller-side message handlers, one per message kind

use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::agent::{AgentState, AgentStatus};
use crate::approval::ApprovalOutcome;
use crate::bus::{MessageBus, MessageHandler};
use crate::channel::{Event, EventSink};
use crate::dispatcher::TaskDispatcher;
use crate::error::{OverseerError, Result};
use crate::journal::{AgentJournal, JournalLevel};
use crate::lifecycle::LifecycleManager;
use crate::mailbox::{AssignmentStatus, Mailbox};
use crate::message::{Message, MessageKind, MessagePayload};
use crate::state::StateStore;
use crate::types::{AgentId, SessionId, TaskId};

/// Everything a handler may touch, shared by all of them
pub struct HandlerContext {
    pub session_id: SessionId,
    pub store: Arc<StateStore>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub lifecycle: Arc<LifecycleManager>,
    pub journal: Arc<AgentJournal>,
    pub mailbox: Arc<Mailbox>,
    pub events: Arc<EventSink>,
}

impl HandlerContext {
    /// Apply `f` to the sender's state. Messages from agents that are already
    /// gone are acknowledged without effect.
    async fn modify_agent<F>(&self, agent_id: &AgentId, f: F) -> Result<Option<AgentState>>
    where
        F: FnOnce(&mut AgentState),
    {
        match self.store.modify(&self.session_id, agent_id, f).await {
            Ok(state) => Ok(Some(state)),
            Err(e) if e.is_not_found() => {
                warn!(agent_id = %agent_id, "Message from unknown agent ignored");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark_assignment(&self, agent_id: &AgentId, status: AssignmentStatus) {
        if let Err(e) = self.mailbox.set_assignment_status(agent_id, status).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to update assignment record");
        }
    }

    async fn note(&self, agent_id: &AgentId, level: JournalLevel, message: String) {
        if let Err(e) = self.journal.append(agent_id, level, &message).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to write agent journal");
        }
    }

    fn status_changed(&self, state: Option<AgentState>) {
        if let Some(state) = state {
            self.events.emit(Event::AgentStatusChanged {
                agent_id: state.agent_id,
                status: state.status,
            });
        }
    }

    /// Tear down an attempt, surfacing cleanup failures as warnings
    async fn release(&self, agent_id: &AgentId, what: &str) {
        let cleanup = self.lifecycle.release_agent(agent_id).await;
        for failure in &cleanup.failures {
            self.events.emit(Event::Warning {
                message: format!("cleanup after {what}: {failure}"),
            });
        }
    }

    /// Route a task that ran out of retries to a human
    async fn escalate(&self, agent_id: &AgentId, task_id: &TaskId, error: &str) -> Result<()> {
        let item = self
            .lifecycle
            .await_approval(
                agent_id,
                task_id,
                format!("retries exhausted: {error}"),
                Vec::new(),
                ApprovalOutcome::Failed,
            )
            .await?;
        self.events.emit(Event::RetryExhausted {
            task_id: task_id.clone(),
        });
        self.events.emit(Event::ApprovalRequested { item });
        Ok(())
    }
}

struct StartedHandler(Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for StartedHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let MessagePayload::TaskStarted { task_id, description } = &message.payload else {
            return Ok(());
        };
        let ctx = &self.0;
        let agent_id = AgentId::from(message.sender.as_str());
        let task = task_id.to_string();
        let state = ctx
            .modify_agent(&agent_id, |s| {
                if !s.status.is_settled() {
                    s.set_status(AgentStatus::Active, None);
                }
                s.current_task = task;
            })
            .await
            .with_context(|| format!("marking {agent_id} active"))?;
        if state.as_ref().is_some_and(|s| s.status == AgentStatus::Active) {
            ctx.mark_assignment(&agent_id, AssignmentStatus::InProgress).await;
            ctx.note(&agent_id, JournalLevel::Info, format!("started {task_id}: {description}"))
                .await;
        }
        ctx.status_changed(state);
        Ok(())
    }
}

struct ProgressHandler(Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for ProgressHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let MessagePayload::TaskProgress {
            task_id,
            progress,
            percentage,
            tokens_used,
            cost,
        } = &message.payload
        else {
            return Ok(());
        };
        let ctx = &self.0;
        let agent_id = AgentId::from(message.sender.as_str());
        let (tokens, cost) = (*tokens_used, *cost);
        let state = ctx
            .modify_agent(&agent_id, |s| {
                if !s.status.is_settled() {
                    s.set_status(AgentStatus::Thinking, None);
                }
                s.add_usage(tokens, cost);
            })
            .await
            .with_context(|| format!("recording progress for {agent_id}"))?;
        if state.is_some() {
            let pct = percentage.map(|p| format!(" ({p}%)")).unwrap_or_default();
            ctx.note(&agent_id, JournalLevel::Debug, format!("{task_id}: {progress}{pct}"))
                .await;
        }
        ctx.status_changed(state);
        Ok(())
    }
}

struct CompletedHandler(Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for CompletedHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let MessagePayload::TaskCompleted {
            task_id,
            result,
            changed_resources,
        } = &message.payload
        else {
            return Ok(());
        };
        let ctx = &self.0;
        let agent_id = AgentId::from(message.sender.as_str());

        // Workers may publish straight onto the bus; the transition is
        // idempotent when the dispatcher already applied it
        if let Err(e) = ctx.dispatcher.mark_completed(&agent_id, task_id, result.clone()) {
            info!(agent_id = %agent_id, task_id = %task_id, error = %e, "Stale completion ignored");
            return Ok(());
        }

        let item = ctx
            .lifecycle
            .await_approval(
                &agent_id,
                task_id,
                result.clone(),
                changed_resources.clone(),
                ApprovalOutcome::Completed,
            )
            .await
            .with_context(|| format!("submitting {task_id} for approval"))?;
        ctx.mark_assignment(&agent_id, AssignmentStatus::Completed).await;
        ctx.status_changed(ctx.store.get(&ctx.session_id, &agent_id).ok());
        ctx.events.emit(Event::ApprovalRequested { item });
        Ok(())
    }
}

struct FailedHandler(Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for FailedHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let MessagePayload::TaskFailed { task_id, error } = &message.payload else {
            return Ok(());
        };
        let ctx = &self.0;
        let agent_id = AgentId::from(message.sender.as_str());

        if let Err(e) = ctx.dispatcher.mark_failed(&agent_id, task_id, error.clone()) {
            info!(agent_id = %agent_id, task_id = %task_id, error = %e, "Stale failure ignored");
            return Ok(());
        }

        let error_message = error.clone();
        let state = ctx
            .modify_agent(&agent_id, |s| s.set_status(AgentStatus::Error, Some(error_message)))
            .await?;
        ctx.status_changed(state);
        ctx.mark_assignment(&agent_id, AssignmentStatus::Failed).await;
        ctx.note(&agent_id, JournalLevel::Error, format!("{task_id} failed: {error}"))
            .await;

        ctx.release(&agent_id, "failed attempt").await;

        match ctx.dispatcher.retry_failed(task_id).await {
            Ok(true) => {
                ctx.events.emit(Event::TaskRequeued {
                    task_id: task_id.clone(),
                    reason: error.clone(),
                });
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(OverseerError::RetryExhausted { .. }) => {
                ctx.escalate(&agent_id, task_id, error).await?;
                Ok(())
            }
            Err(e) => Err::<(), _>(e).with_context(|| format!("retrying {task_id}")),
        }
    }
}

struct QuestionHandler(Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for QuestionHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let MessagePayload::Question { task_id, question } = &message.payload else {
            return Ok(());
        };
        let ctx = &self.0;
        let agent_id = AgentId::from(message.sender.as_str());
        let state = ctx
            .modify_agent(&agent_id, |s| {
                if !s.status.is_settled() {
                    s.set_status(AgentStatus::Waiting, None);
                }
            })
            .await?;
        ctx.status_changed(state);
        ctx.events.emit(Event::Question {
            agent_id,
            task_id: task_id.clone(),
            question: question.clone(),
        });
        Ok(())
    }
}

struct ReassignHandler(Arc<HandlerContext>);

#[async_trait]
impl MessageHandler for ReassignHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let MessagePayload::ReassignRequest {
            task_id,
            reason,
            previous_agent,
        } = &message.payload
        else {
            return Ok(());
        };
        let ctx = &self.0;
        if let Some(previous) = previous_agent {
            // A retry already released the agent before asking for reassignment
            if ctx.store.get(&ctx.session_id, previous).is_ok() {
                ctx.mark_assignment(previous, AssignmentStatus::Failed).await;
                ctx.note(previous, JournalLevel::Warn, format!("{task_id} reassigned: {reason}"))
                    .await;
                ctx.release(previous, "reassigned attempt").await;
            }
        }
        ctx.events.emit(Event::ReassignRequested {
            task_id: task_id.clone(),
            reason: reason.clone(),
            previous_agent: previous_agent.clone(),
        });
        Ok(())
    }
}

/// Install the controller's dispatch table on `bus`
pub fn register_all(bus: &MessageBus, ctx: Arc<HandlerContext>) {
    bus.register_handler(
        MessageKind::TaskStarted,
        Arc::new(StartedHandler(Arc::clone(&ctx))),
    );
    bus.register_handler(
        MessageKind::TaskProgress,
        Arc::new(ProgressHandler(Arc::clone(&ctx))),
    );
    bus.register_handler(
        MessageKind::TaskCompleted,
        Arc::new(CompletedHandler(Arc::clone(&ctx))),
    );
    bus.register_handler(
        MessageKind::TaskFailed,
        Arc::new(FailedHandler(Arc::clone(&ctx))),
    );
    bus.register_handler(
        MessageKind::Question,
        Arc::new(QuestionHandler(Arc::clone(&ctx))),
    );
    bus.register_handler(MessageKind::ReassignRequest, Arc::new(ReassignHandler(ctx)));
    bus.register_fn(MessageKind::Response, |message| {
        if let MessagePayload::Response { in_reply_to, answer } = &message.payload {
            info!(
                sender = %message.sender,
                in_reply_to = ?in_reply_to,
                answer = %answer,
                "Response received"
            );
        }
        Ok(())
    });
}
