//! Lifecycle manager - approval gating and guaranteed cleanup of agent resources

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentStatus;
use crate::approval::{ApprovalIndex, ApprovalItem, ApprovalOutcome, Decision};
use crate::dispatcher::TaskDispatcher;
use crate::error::{OverseerError, Result};
use crate::journal::{AgentJournal, JournalLevel};
use crate::state::StateStore;
use crate::types::{AgentId, ItemId, SessionId, TaskId};
use crate::workspace::{ProcessHandle, WorkspaceProvisioner};

/// Feedback recorded on items still pending when a session shuts down
pub const SESSION_TERMINATED: &str = "session terminated";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Running,
    AwaitingApproval,
    Approved,
    Rejected,
    Closed,
}

impl LifecyclePhase {
    pub fn can_transition_to(self, next: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        matches!(
            (self, next),
            (Running, AwaitingApproval)
                | (Running, Closed)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Rejected)
                | (Approved, Closed)
                | (Rejected, Closed)
        )
    }
}

/// What was torn down, and what could not be
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub released: Vec<PathBuf>,
    pub cleared: Vec<AgentId>,
    pub closed_items: Vec<ItemId>,
    pub failures: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<CleanupReport> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(OverseerError::CleanupIncomplete {
                failures: self.failures,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecisionOutcome {
    /// The decision was recorded and its cleanup ran
    Applied {
        item: ApprovalItem,
        cleanup: CleanupReport,
    },
    /// The item had already been decided; nothing was done
    AlreadyDecided(ApprovalItem),
}

impl DecisionOutcome {
    pub fn item(&self) -> &ApprovalItem {
        match self {
            DecisionOutcome::Applied { item, .. } | DecisionOutcome::AlreadyDecided(item) => item,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, DecisionOutcome::Applied { .. })
    }
}

/// Drives each agent attempt from Running to Closed.
///
/// Every path that ends an attempt (approve, reject, failed attempt,
/// session shutdown) releases the workspace, forgets the worker process and
/// clears the agent state. Journals are never touched beyond appending.
pub struct LifecycleManager {
    session_id: SessionId,
    store: Arc<StateStore>,
    dispatcher: Arc<TaskDispatcher>,
    approvals: Arc<ApprovalIndex>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    journal: Arc<AgentJournal>,
    /// Open attempts only; an attempt leaves the map when it closes
    phases: Mutex<HashMap<AgentId, LifecyclePhase>>,
    processes: Mutex<HashMap<AgentId, ProcessHandle>>,
    submit_gate: tokio::sync::Mutex<()>,
}

impl LifecycleManager {
    pub fn new(
        session_id: SessionId,
        store: Arc<StateStore>,
        dispatcher: Arc<TaskDispatcher>,
        approvals: Arc<ApprovalIndex>,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        journal: Arc<AgentJournal>,
    ) -> Self {
        Self {
            session_id,
            store,
            dispatcher,
            approvals,
            provisioner,
            journal,
            phases: Mutex::new(HashMap::new()),
            processes: Mutex::new(HashMap::new()),
            submit_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn approvals(&self) -> &ApprovalIndex {
        &self.approvals
    }

    /// `None` once the attempt is closed
    pub fn phase(&self, agent_id: &AgentId) -> Option<LifecyclePhase> {
        self.phases.lock().get(agent_id).copied()
    }

    /// Remember the worker process of a running attempt
    pub fn attach_process(&self, handle: ProcessHandle) {
        self.processes.lock().insert(handle.agent_id.clone(), handle);
    }

    pub fn processes(&self) -> Vec<ProcessHandle> {
        self.processes.lock().values().cloned().collect()
    }

    fn advance(&self, agent_id: &AgentId, next: LifecyclePhase) -> bool {
        let mut phases = self.phases.lock();
        let Some(current) = phases.get(agent_id).copied() else {
            debug!(agent_id = %agent_id, next = ?next, "No lifecycle tracked for agent");
            return false;
        };
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                agent_id = %agent_id,
                from = ?current,
                to = ?next,
                "Invalid lifecycle transition"
            );
            return false;
        }
        if next == LifecyclePhase::Closed {
            phases.remove(agent_id);
        } else {
            phases.insert(agent_id.clone(), next);
        }
        true
    }

    async fn note(&self, agent_id: &AgentId, level: JournalLevel, message: String) {
        if let Err(e) = self.journal.append(agent_id, level, &message).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to write agent journal");
        }
    }

    /// Start tracking an attempt
    pub async fn register(&self, agent_id: &AgentId, task_id: &TaskId) {
        self.phases
            .lock()
            .insert(agent_id.clone(), LifecyclePhase::Running);
        info!(agent_id = %agent_id, task_id = %task_id, "Attempt registered");
        self.note(agent_id, JournalLevel::Info, format!("assigned task {task_id}"))
            .await;
    }

    /// Put an attempt's result in front of a human.
    ///
    /// A duplicate delivery of the same completion returns the item already
    /// submitted.
    #[instrument(skip(self, summary, changed_resources))]
    pub async fn await_approval(
        &self,
        agent_id: &AgentId,
        task_id: &TaskId,
        summary: String,
        changed_resources: Vec<String>,
        outcome: ApprovalOutcome,
    ) -> Result<ApprovalItem> {
        let _gate = self.submit_gate.lock().await;
        if let Some(existing) = self.approvals.find_pending(agent_id, task_id) {
            debug!(item_id = %existing.item_id, "Approval already pending");
            return Ok(existing);
        }

        let workspace = match self.store.get(&self.session_id, agent_id) {
            Ok(state) => state.workspace_path,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        let error = (outcome == ApprovalOutcome::Failed).then(|| summary.clone());
        let item = ApprovalItem::new(
            agent_id.clone(),
            task_id.clone(),
            self.session_id.clone(),
            summary,
        )
        .with_changes(changed_resources)
        .with_workspace(workspace)
        .with_outcome(outcome);
        let item = self.approvals.submit(item).await?;

        let status = match outcome {
            ApprovalOutcome::Completed => AgentStatus::Completed,
            ApprovalOutcome::Failed => AgentStatus::Error,
        };
        match self
            .store
            .set_status(&self.session_id, agent_id, status, error)
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        self.advance(agent_id, LifecyclePhase::AwaitingApproval);
        self.note(
            agent_id,
            JournalLevel::Info,
            format!("awaiting approval as item {} ({:?})", item.item_id, outcome),
        )
        .await;
        Ok(item)
    }

    /// Release one workspace, recording the attempt in the agent's journal
    async fn release_workspace(
        &self,
        agent_id: &AgentId,
        path: &Path,
        report: &mut CleanupReport,
    ) {
        match self.provisioner.release(path).await {
            Ok(existed) => {
                report.released.push(path.to_path_buf());
                let message = if existed {
                    format!("workspace released: {}", path.display())
                } else {
                    format!("workspace already gone: {}", path.display())
                };
                self.note(agent_id, JournalLevel::Info, message).await;
            }
            Err(e) => {
                warn!(
                    agent_id = %agent_id,
                    path = %path.display(),
                    error = %e,
                    "Workspace release failed"
                );
                report.failures.push(format!("{}: {e}", path.display()));
                self.note(
                    agent_id,
                    JournalLevel::Error,
                    format!("workspace release failed: {e}"),
                )
                .await;
            }
        }
    }

    async fn clear_state(&self, agent_id: &AgentId, report: &mut CleanupReport) {
        match self.store.clear(&self.session_id, agent_id).await {
            Ok(Some(_)) => report.cleared.push(agent_id.clone()),
            Ok(None) => {}
            Err(e) => report.failures.push(format!("agent {agent_id}: {e}")),
        }
    }

    async fn teardown(
        &self,
        agent_id: &AgentId,
        workspace: Option<&Path>,
        report: &mut CleanupReport,
    ) {
        self.processes.lock().remove(agent_id);
        let fallback = match workspace {
            Some(_) => None,
            None => self
                .store
                .get(&self.session_id, agent_id)
                .ok()
                .and_then(|state| state.workspace_path),
        };
        if let Some(path) = workspace.or(fallback.as_deref()) {
            self.release_workspace(agent_id, path, report).await;
        }
        self.clear_state(agent_id, report).await;
    }

    pub async fn approve(
        &self,
        item_ref: &str,
        feedback: Option<String>,
    ) -> Result<DecisionOutcome> {
        self.decide(item_ref, Decision::Approved, feedback).await
    }

    pub async fn reject(
        &self,
        item_ref: &str,
        feedback: impl Into<String>,
    ) -> Result<DecisionOutcome> {
        self.decide(item_ref, Decision::Rejected, Some(feedback.into()))
            .await
    }

    /// Apply a human decision to a pending item, addressed by id or unique prefix.
    ///
    /// The first decision wins; later ones return `AlreadyDecided` and never
    /// release the workspace a second time.
    #[instrument(skip(self, feedback))]
    pub async fn decide(
        &self,
        item_ref: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> Result<DecisionOutcome> {
        let phase = match decision {
            Decision::Approved => LifecyclePhase::Approved,
            Decision::Rejected => LifecyclePhase::Rejected,
            Decision::Pending => {
                return Err(OverseerError::Validation("a decision cannot be pending".into()))
            }
        };
        let feedback = feedback.filter(|f| !f.trim().is_empty());
        if decision == Decision::Rejected && feedback.is_none() {
            return Err(OverseerError::Validation(
                "rejecting requires feedback for the next attempt".into(),
            ));
        }

        let item = self.approvals.lookup(item_ref).await?;
        let Some(decided) = self
            .approvals
            .record_decision(&item.item_id, decision, feedback.clone())
            .await?
        else {
            info!(item_id = %item.item_id, "Item already decided");
            let current = match self.approvals.decided_item(&item.item_id).await? {
                Some(current) => current,
                None => ApprovalItem {
                    decision: self.approvals.decision_of(&item.item_id).unwrap_or(item.decision),
                    ..item
                },
            };
            return Ok(DecisionOutcome::AlreadyDecided(current));
        };

        let agent_id = &decided.agent_id;
        self.advance(agent_id, phase);
        self.note(
            agent_id,
            JournalLevel::Info,
            format!("item {} {:?}", decided.item_id, decision),
        )
        .await;

        let mut cleanup = CleanupReport::default();
        self.teardown(agent_id, decided.workspace.as_deref(), &mut cleanup)
            .await;

        let task_result = match (decision, decided.outcome) {
            (Decision::Approved, ApprovalOutcome::Completed) => {
                self.dispatcher.confirm(&decided.task_id)
            }
            (Decision::Approved, ApprovalOutcome::Failed) => {
                info!(task_id = %decided.task_id, "Failure accepted, task stays failed");
                Ok(())
            }
            _ => self.dispatcher.requeue_with_feedback(
                &decided.task_id,
                feedback.unwrap_or_default(),
            ),
        };
        if let Err(e) = task_result {
            warn!(task_id = %decided.task_id, error = %e, "Task update after decision failed");
            cleanup.failures.push(format!("task {}: {e}", decided.task_id));
        }

        self.advance(agent_id, LifecyclePhase::Closed);
        Ok(DecisionOutcome::Applied {
            item: decided,
            cleanup,
        })
    }

    /// Tear down a failed attempt so its task can be retried elsewhere
    #[instrument(skip(self))]
    pub async fn release_agent(&self, agent_id: &AgentId) -> CleanupReport {
        let mut report = CleanupReport::default();
        self.teardown(agent_id, None, &mut report).await;
        self.advance(agent_id, LifecyclePhase::Closed);
        self.note(agent_id, JournalLevel::Warn, "attempt closed".to_string())
            .await;
        report
    }

    /// Release every workspace and clear every agent of the session.
    ///
    /// Continues past failures; the report lists what could not be cleaned.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        let mut workspaces: BTreeMap<PathBuf, AgentId> = BTreeMap::new();
        let mut agents: Vec<AgentId> = Vec::new();

        for item in self.approvals.pending_for_session(&self.session_id) {
            match self
                .approvals
                .record_decision(
                    &item.item_id,
                    Decision::Rejected,
                    Some(SESSION_TERMINATED.to_string()),
                )
                .await
            {
                Ok(Some(_)) => report.closed_items.push(item.item_id.clone()),
                Ok(None) => {}
                Err(e) => report.failures.push(format!("item {}: {e}", item.item_id)),
            }
            if let Some(path) = item.workspace {
                workspaces.insert(path, item.agent_id.clone());
            }
            if !agents.contains(&item.agent_id) {
                agents.push(item.agent_id);
            }
        }

        for state in self.store.get_all(&self.session_id) {
            if let Some(path) = state.workspace_path {
                workspaces.insert(path, state.agent_id.clone());
            }
            if !agents.contains(&state.agent_id) {
                agents.push(state.agent_id);
            }
        }

        for (path, agent_id) in &workspaces {
            self.release_workspace(agent_id, path, &mut report).await;
        }
        for agent_id in &agents {
            self.clear_state(agent_id, &mut report).await;
        }

        self.phases.lock().clear();
        self.processes.lock().clear();

        info!(
            session_id = %self.session_id,
            released = report.released.len(),
            cleared = report.cleared.len(),
            closed_items = report.closed_items.len(),
            failures = report.failures.len(),
            "Session shut down"
        );
        report
    }
}
