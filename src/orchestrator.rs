//! Main orchestrator - wires the store, bus, dispatcher and lifecycle into one controller

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::agent::AgentState;
use crate::approval::{ApprovalIndex, ApprovalItem, ApprovalStats, Decision};
use crate::bus::{MessageBus, ProcessReport};
use crate::channel::{ChannelPair, Event, EventSink, Op};
use crate::config::OverseerConfig;
use crate::dispatcher::TaskDispatcher;
use crate::error::{OverseerError, Result};
use crate::handlers::{self, HandlerContext};
use crate::journal::{AgentJournal, JournalLevel};
use crate::lifecycle::{CleanupReport, DecisionOutcome, LifecycleManager};
use crate::mailbox::{Assignment, AssignmentStatus, Mailbox};
use crate::state::{StatePersistence, StateStats, StateStore};
use crate::task::{Task, TaskSummary};
use crate::transport::{FileTransport, TransportStats};
use crate::types::{AgentId, SessionId};
use crate::workspace::{WorkerLauncher, WorkspaceProvisioner};

/// Read-only view of a session for the UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub session_id: SessionId,
    pub agents: Vec<AgentState>,
    pub tasks: Vec<Task>,
    pub summary: TaskSummary,
    pub stats: StateStats,
    pub pending_approvals: Vec<ApprovalItem>,
    pub approval_stats: ApprovalStats,
    pub messages: TransportStats,
}

/// The controller of one orchestration session.
///
/// Owns every component; nothing is global, so several controllers can
/// coexist in one process as long as their roots differ.
pub struct Orchestrator {
    config: OverseerConfig,
    session_id: SessionId,
    store: Arc<StateStore>,
    bus: Arc<MessageBus>,
    dispatcher: Arc<TaskDispatcher>,
    lifecycle: Arc<LifecycleManager>,
    journal: Arc<AgentJournal>,
    mailbox: Arc<Mailbox>,
    provisioner: Arc<dyn WorkspaceProvisioner>,
    launcher: Arc<dyn WorkerLauncher>,
    events: Arc<EventSink>,
}

impl Orchestrator {
    /// Start a fresh session
    pub async fn new(
        config: OverseerConfig,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self> {
        Self::open(config, SessionId::new(), provisioner, launcher).await
    }

    /// Open `session_id`, restoring its agent states when they were persisted
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn open(
        config: OverseerConfig,
        session_id: SessionId,
        provisioner: Arc<dyn WorkspaceProvisioner>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(if config.persist_state {
            StateStore::with_persistence(StatePersistence::new(
                config.state_dir(),
                config.store_retry,
            ))
        } else {
            StateStore::in_memory()
        });
        let restored = store.restore(&session_id).await?;

        let transport = FileTransport::open(config.queue_dir(), config.processed_dir()).await?;
        let bus =
            Arc::new(MessageBus::new(Arc::new(transport)).with_stuck_after(config.stuck_after));
        let dispatcher =
            Arc::new(TaskDispatcher::new(Arc::clone(&bus), config.controller_id.clone()));
        let approvals =
            Arc::new(ApprovalIndex::open(config.approvals_dir(), config.store_retry).await?);
        let journal = Arc::new(AgentJournal::new(config.logs_dir()));
        let mailbox = Arc::new(Mailbox::new(config.mailbox_dir()));
        let lifecycle = Arc::new(LifecycleManager::new(
            session_id.clone(),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            approvals,
            Arc::clone(&provisioner),
            Arc::clone(&journal),
        ));
        let events = Arc::new(EventSink::default());

        handlers::register_all(
            &bus,
            Arc::new(HandlerContext {
                session_id: session_id.clone(),
                store: Arc::clone(&store),
                dispatcher: Arc::clone(&dispatcher),
                lifecycle: Arc::clone(&lifecycle),
                journal: Arc::clone(&journal),
                mailbox: Arc::clone(&mailbox),
                events: Arc::clone(&events),
            }),
        );

        info!(root = %config.root.display(), restored, "Orchestrator ready");
        Ok(Self {
            config,
            session_id,
            store,
            bus,
            dispatcher,
            lifecycle,
            journal,
            mailbox,
            provisioner,
            launcher,
            events,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn config(&self) -> &OverseerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn journal(&self) -> &Arc<AgentJournal> {
        &self.journal
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn events(&self) -> &Arc<EventSink> {
        &self.events
    }

    /// A task carrying this session's retry budget and default model
    pub fn new_task(&self, task_id: &str, title: &str) -> Task {
        Task::new(task_id, title)
            .with_max_retries(self.config.max_retries)
            .with_model(self.config.default_model.clone())
    }

    pub fn enqueue(&self, task: Task) -> Result<()> {
        let task_id = task.task_id.clone();
        self.dispatcher.enqueue(task)?;
        self.events.emit(Event::TaskEnqueued { task_id });
        Ok(())
    }

    /// Provision, assign and launch one worker.
    ///
    /// Returns `None` (and gives the workspace back) when no task is eligible.
    #[instrument(skip(self))]
    pub async fn spawn_worker(&self, role: &str) -> Result<Option<AgentId>> {
        let agent_id = AgentId::generate(role);
        let workspace = self.provisioner.create(&agent_id).await?;

        let state = AgentState::new(agent_id.clone(), role, self.session_id.clone())
            .with_workspace(&workspace);
        if let Err(e) = self.store.update(state).await {
            if let Err(release) = self.provisioner.release(&workspace).await {
                warn!(agent_id = %agent_id, error = %release, "Failed to release unused workspace");
            }
            return Err(e);
        }

        let Some(task) = self.dispatcher.assign_next(&agent_id) else {
            debug!(agent_id = %agent_id, "No eligible task, releasing worker");
            let report = self.lifecycle.release_agent(&agent_id).await;
            if !report.is_clean() {
                warn!(failures = ?report.failures, "Unused worker cleanup incomplete");
            }
            return Ok(None);
        };

        let assignment = Assignment {
            task_id: task.task_id.clone(),
            role: role.to_string(),
            prompt: task.prompt(),
            model: task
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            status: AssignmentStatus::Assigned,
            assigned_at: Utc::now(),
        };
        self.mailbox.write_assignment(&agent_id, &assignment).await?;

        let task_label = task.task_id.to_string();
        self.store
            .modify(&self.session_id, &agent_id, |s| s.current_task = task_label)
            .await?;
        self.lifecycle.register(&agent_id, &task.task_id).await;

        match self.launcher.spawn(&agent_id, role, &workspace).await {
            Ok(handle) => {
                self.lifecycle.attach_process(handle);
            }
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Worker launch failed");
                // The failure handler releases the attempt and retries the task
                self.dispatcher
                    .report_failed(&agent_id, &task.task_id, format!("launch failed: {e}"))
                    .await?;
                return Err(e);
            }
        }

        info!(agent_id = %agent_id, task_id = %task.task_id, "Worker spawned");
        self.events.emit(Event::WorkerSpawned {
            agent_id: agent_id.clone(),
            task_id: task.task_id,
        });
        Ok(Some(agent_id))
    }

    /// Turn final worker reports from the mailbox into completion/failure reports
    pub async fn collect_reports(&self) -> Result<usize> {
        let mut collected = 0;
        for (agent_id, report) in self.mailbox.reports().await? {
            let reported = match report.status {
                AssignmentStatus::Completed => {
                    self.dispatcher
                        .report_completed(
                            &agent_id,
                            &report.task_id,
                            report.result.clone(),
                            report.changed_resources.clone(),
                        )
                        .await
                }
                AssignmentStatus::Failed => {
                    self.dispatcher
                        .report_failed(&agent_id, &report.task_id, report.result.clone())
                        .await
                }
                AssignmentStatus::Assigned | AssignmentStatus::InProgress => continue,
            };

            match reported {
                Ok(_) => collected += 1,
                Err(e @ (OverseerError::Validation(_) | OverseerError::TaskNotFound(_))) => {
                    warn!(
                        agent_id = %agent_id,
                        task_id = %report.task_id,
                        error = %e,
                        "Dropping stale report"
                    );
                }
                Err(e) => return Err(e),
            }
            self.mailbox.archive_report(&agent_id, &report.task_id).await?;
        }
        Ok(collected)
    }

    /// Deliver pending controller messages to their handlers
    pub async fn process_messages(&self) -> Result<ProcessReport> {
        self.bus
            .process(&self.config.controller_id, self.config.poll_batch)
            .await
    }

    /// One polling pass: collect reports, then handle messages
    pub async fn tick(&self) -> Result<ProcessReport> {
        let collected = self.collect_reports().await?;
        let report = self.process_messages().await?;
        if collected > 0 || report.handled > 0 || report.failed > 0 {
            debug!(collected, handled = report.handled, failed = report.failed, "Poll pass");
        }
        Ok(report)
    }

    pub async fn snapshot(&self) -> Snapshot {
        let messages = match self.bus.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %e, "Message stats unavailable");
                TransportStats::default()
            }
        };
        let approvals = self.lifecycle.approvals();
        Snapshot {
            session_id: self.session_id.clone(),
            agents: self.store.get_all(&self.session_id),
            tasks: self.dispatcher.tasks(),
            summary: self.dispatcher.summary(),
            stats: self.store.stats(&self.session_id),
            pending_approvals: approvals.pending_for_session(&self.session_id),
            approval_stats: approvals.stats(),
            messages,
        }
    }

    /// Apply a human decision to an approval item (full id or unique prefix)
    #[instrument(skip(self, feedback))]
    pub async fn decide(
        &self,
        item: &str,
        decision: Decision,
        feedback: Option<String>,
    ) -> Result<DecisionOutcome> {
        let outcome = self.lifecycle.decide(item, decision, feedback).await?;
        if let DecisionOutcome::Applied { item, cleanup } = &outcome {
            for failure in &cleanup.failures {
                self.events.emit(Event::Warning {
                    message: format!("cleanup after decision on {}: {failure}", item.item_id),
                });
            }
            self.events.emit(Event::Decided {
                item_id: item.item_id.clone(),
                decision,
            });
        }
        Ok(outcome)
    }

    pub async fn approve(&self, item: &str) -> Result<DecisionOutcome> {
        self.decide(item, Decision::Approved, None).await
    }

    pub async fn reject(&self, item: &str, feedback: &str) -> Result<DecisionOutcome> {
        self.decide(item, Decision::Rejected, Some(feedback.to_string()))
            .await
    }

    /// Busy agents that have not reported for longer than `window`.
    ///
    /// Nothing is failed automatically; callers decide what to do with them.
    pub fn stale_agents(&self, window: Duration) -> Vec<AgentState> {
        let now = Utc::now();
        self.store
            .get_all(&self.session_id)
            .into_iter()
            .filter(|state| state.status.is_busy())
            .filter(|state| {
                (now - state.last_updated)
                    .to_std()
                    .is_ok_and(|age| age > window)
            })
            .collect()
    }

    /// Release every resource of the session
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<CleanupReport> {
        let report = self.lifecycle.shutdown().await;
        for agent_id in &report.cleared {
            if let Err(e) = self
                .journal
                .append(agent_id, JournalLevel::Info, "session shut down")
                .await
            {
                warn!(agent_id = %agent_id, error = %e, "Failed to write agent journal");
            }
        }
        self.events.emit(Event::ShutdownComplete {
            report: report.clone(),
        });
        report.into_result()
    }

    /// Run the controller loop until shutdown or until every client is gone
    #[instrument(skip_all, fields(session_id = %self.session_id))]
    pub async fn run(self, channels: ChannelPair) -> Result<()> {
        let ChannelPair { mut op_rx, event_tx } = channels;
        self.events.attach(event_tx);
        info!("Starting orchestrator loop");

        let mut ticker = tokio::time::interval(self.config.poll_interval());
        loop {
            tokio::select! {
                op = op_rx.recv() => match op {
                    Some(op) => {
                        if self.handle_op(op).await {
                            break;
                        }
                    }
                    None => {
                        info!("All clients gone, shutting down");
                        if let Err(e) = self.shutdown().await {
                            error!(error = %e, "Shutdown incomplete");
                        }
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Polling pass failed");
                    }
                }
            }
        }

        info!("Orchestrator loop stopped");
        Ok(())
    }

    /// Handle a single operation. Returns `true` when the loop should stop.
    async fn handle_op(&self, op: Op) -> bool {
        match op {
            Op::Enqueue { task, reply } => {
                let _ = reply.send(self.enqueue(task));
            }
            Op::SpawnWorker { role, reply } => {
                let _ = reply.send(self.spawn_worker(&role).await);
            }
            Op::Decide {
                item,
                decision,
                feedback,
                reply,
            } => {
                let _ = reply.send(self.decide(&item, decision, feedback).await);
            }
            Op::Snapshot { reply } => {
                let _ = reply.send(self.snapshot().await);
            }
            Op::Shutdown { reply } => {
                let _ = reply.send(self.shutdown().await);
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::agent::AgentStatus;
    use crate::approval::ApprovalOutcome;
    use crate::channel::OverseerChannel;
    use crate::mailbox::Report;
    use crate::message::{Message, MessagePayload};
    use crate::task::TaskStatus;
    use crate::types::TaskId;
    use crate::workspace::{DirectoryProvisioner, ProcessHandle};

    #[derive(Default)]
    struct RecordingLauncher {
        spawned: Mutex<Vec<(AgentId, String)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl WorkerLauncher for RecordingLauncher {
        async fn spawn(
            &self,
            agent_id: &AgentId,
            role: &str,
            _workspace: &Path,
        ) -> Result<ProcessHandle> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(OverseerError::io(
                    "/bin/worker",
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary"),
                ));
            }
            self.spawned.lock().push((agent_id.clone(), role.to_string()));
            Ok(ProcessHandle {
                agent_id: agent_id.clone(),
                pid: None,
            })
        }
    }

    async fn create_test_orchestrator(
        root: &Path,
    ) -> (Orchestrator, Arc<RecordingLauncher>) {
        let config = OverseerConfig::with_root(root);
        let launcher = Arc::new(RecordingLauncher::default());
        let orchestrator = Orchestrator::new(
            config.clone(),
            Arc::new(DirectoryProvisioner::new(config.workspaces_dir())),
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
        )
        .await
        .unwrap();
        (orchestrator, launcher)
    }

    fn report(task_id: &str, status: AssignmentStatus, result: &str) -> Report {
        Report {
            task_id: TaskId::from(task_id),
            role: "coder".into(),
            status,
            result: result.into(),
            changed_resources: vec!["src/lib.rs".into()],
            completed_at: Utc::now(),
        }
    }

    fn workspace_of(orchestrator: &Orchestrator, agent: &AgentId) -> std::path::PathBuf {
        orchestrator
            .store()
            .get(orchestrator.session_id(), agent)
            .unwrap()
            .workspace_path
            .unwrap()
    }

    /// Worker side of one attempt: announce the start and drop a final report
    async fn finish(
        orchestrator: &Orchestrator,
        agent: &AgentId,
        task: &str,
        status: AssignmentStatus,
        result: &str,
    ) {
        orchestrator
            .dispatcher()
            .report_started(agent, &TaskId::from(task), "working")
            .await
            .unwrap();
        orchestrator
            .mailbox()
            .write_report(agent, &report(task, status, result))
            .await
            .unwrap();
        orchestrator.tick().await.unwrap();
    }

    /// Worker side publishing straight onto the bus
    async fn send_from(orchestrator: &Orchestrator, agent: &AgentId, payload: MessagePayload) {
        let receiver = orchestrator.config().controller_id.clone();
        orchestrator
            .bus()
            .send(Message::new(agent.as_str(), receiver, payload))
            .await
            .unwrap();
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..300 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    #[tokio::test]
    async fn test_happy_path() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, launcher) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "Write parser")).unwrap();

        let agent = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        assert_eq!(launcher.spawned.lock().len(), 1);
        let workspace = workspace_of(&orchestrator, &agent);
        assert!(workspace.is_dir());

        let assignment = orchestrator.mailbox().read_assignment(&agent).await.unwrap().unwrap();
        assert_eq!(assignment.task_id, TaskId::from("t1"));
        assert_eq!(assignment.model, "sonnet");

        finish(&orchestrator, &agent, "t1", AssignmentStatus::Completed, "parser done").await;

        let snapshot = orchestrator.snapshot().await;
        assert_eq!(snapshot.pending_approvals.len(), 1);
        assert_eq!(snapshot.agents[0].status, AgentStatus::Completed);
        assert_eq!(snapshot.messages.unprocessed, 0);
        let item = snapshot.pending_approvals[0].clone();
        assert_eq!(item.summary, "parser done");
        assert_eq!(item.workspace.as_deref(), Some(workspace.as_path()));

        assert_eq!(orchestrator.lifecycle().processes().len(), 1);

        let outcome = orchestrator.approve(item.item_id.as_str()).await.unwrap();
        assert!(outcome.was_applied());

        let approvals = orchestrator.lifecycle().approvals();
        assert!(approvals.get(item.item_id.as_str()).is_err());
        let index = std::fs::read_to_string(approvals.dir().join("index.json")).unwrap();
        assert!(!index.contains(item.item_id.as_str()));
        assert!(orchestrator.lifecycle().processes().is_empty());
        assert_eq!(orchestrator.lifecycle().phase(&agent), None);

        assert!(!workspace.exists());
        assert!(orchestrator.store().get_all(orchestrator.session_id()).is_empty());
        let task = orchestrator.dispatcher().get(&TaskId::from("t1")).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.is_settled());
        assert!(!orchestrator.journal().read(&agent).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejection_feeds_back_into_next_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "Write parser")).unwrap();

        let first = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        let first_workspace = workspace_of(&orchestrator, &first);
        finish(&orchestrator, &first, "t1", AssignmentStatus::Completed, "done?").await;

        let item = orchestrator.snapshot().await.pending_approvals[0].clone();
        orchestrator.reject(item.item_id.as_str(), "fix X").await.unwrap();
        assert!(!first_workspace.exists());

        let second = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        assert_ne!(first, second);
        let assignment = orchestrator.mailbox().read_assignment(&second).await.unwrap().unwrap();
        assert!(assignment.prompt.contains("fix X"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        for id in ["t1", "t2", "t3"] {
            orchestrator.enqueue(orchestrator.new_task(id, "work")).unwrap();
        }

        let mut workspaces = Vec::new();
        for _ in 0..3 {
            let agent = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
            workspaces.push(workspace_of(&orchestrator, &agent));
        }

        let report = orchestrator.shutdown().await.unwrap();
        assert_eq!(report.released.len(), 3);
        assert_eq!(report.cleared.len(), 3);
        assert!(workspaces.iter().all(|ws| !ws.exists()));
        assert!(orchestrator.store().get_all(orchestrator.session_id()).is_empty());

        let logs = std::fs::read_dir(orchestrator.config().logs_dir()).unwrap().count();
        assert_eq!(logs, 3);
    }

    #[tokio::test]
    async fn test_second_approval_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "work")).unwrap();
        let agent = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        finish(&orchestrator, &agent, "t1", AssignmentStatus::Completed, "done").await;

        let item = orchestrator.snapshot().await.pending_approvals[0].clone();
        assert!(orchestrator.approve(item.item_id.as_str()).await.unwrap().was_applied());
        let again = orchestrator.approve(item.item_id.as_str()).await.unwrap();
        assert!(matches!(again, DecisionOutcome::AlreadyDecided(_)));

        let history = orchestrator.lifecycle().approvals().history().await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_failures_retry_then_escalate() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator
            .enqueue(orchestrator.new_task("t1", "flaky").with_max_retries(1))
            .unwrap();

        let first = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        let first_workspace = workspace_of(&orchestrator, &first);
        finish(&orchestrator, &first, "t1", AssignmentStatus::Failed, "compile error").await;

        assert!(!first_workspace.exists());
        let task = orchestrator.dispatcher().get(&TaskId::from("t1")).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);

        let second = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        finish(&orchestrator, &second, "t1", AssignmentStatus::Failed, "compile error").await;

        let snapshot = orchestrator.snapshot().await;
        assert_eq!(snapshot.pending_approvals.len(), 1);
        assert_eq!(snapshot.pending_approvals[0].outcome, ApprovalOutcome::Failed);
        assert!(snapshot.tasks[0].exhausted);
        assert!(orchestrator.spawn_worker("coder").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_eligible_task_releases_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, launcher) = create_test_orchestrator(dir.path()).await;

        assert!(orchestrator.spawn_worker("coder").await.unwrap().is_none());
        assert!(launcher.spawned.lock().is_empty());
        assert!(orchestrator.store().get_all(orchestrator.session_id()).is_empty());
        let leftover = std::fs::read_dir(orchestrator.config().workspaces_dir())
            .unwrap()
            .count();
        assert_eq!(leftover, 0);
    }

    #[tokio::test]
    async fn test_launch_failure_requeues_task() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, launcher) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "work")).unwrap();
        launcher.fail.store(true, Ordering::SeqCst);

        assert!(orchestrator.spawn_worker("coder").await.is_err());
        orchestrator.tick().await.unwrap();

        let task = orchestrator.dispatcher().get(&TaskId::from("t1")).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(orchestrator.store().get_all(orchestrator.session_id()).is_empty());
    }

    #[tokio::test]
    async fn test_stale_agents() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "work")).unwrap();
        let agent = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        orchestrator
            .dispatcher()
            .report_started(&agent, &TaskId::from("t1"), "working")
            .await
            .unwrap();
        orchestrator.tick().await.unwrap();

        assert!(orchestrator.stale_agents(Duration::from_secs(3600)).is_empty());
        tokio::time::sleep(Duration::from_millis(30)).await;
        let stale = orchestrator.stale_agents(Duration::from_millis(10));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].agent_id, agent);
    }

    #[tokio::test]
    async fn test_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "work")).unwrap();
        let agent = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        let session = orchestrator.session_id().clone();
        let config = orchestrator.config().clone();
        drop(orchestrator);

        let reopened = Orchestrator::open(
            config.clone(),
            session,
            Arc::new(DirectoryProvisioner::new(config.workspaces_dir())),
            Arc::new(RecordingLauncher::default()),
        )
        .await
        .unwrap();
        let agents = reopened.store().get_all(reopened.session_id());
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent_id, agent);
    }

    #[tokio::test]
    async fn test_run_loop_over_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        let task = orchestrator.new_task("t1", "work");
        let (channel, pair) = OverseerChannel::new();
        let handle = tokio::spawn(orchestrator.run(pair));

        channel.enqueue(task).await.unwrap();
        let agent = channel.spawn_worker("coder").await.unwrap();
        assert!(agent.is_some());

        let snapshot = channel.snapshot().await.unwrap();
        assert_eq!(snapshot.summary.in_progress, 1);

        let report = channel.shutdown().await.unwrap();
        assert_eq!(report.cleared.len(), 1);
        tokio_test::assert_ok!(handle.await.unwrap());

        let mut saw_spawn = false;
        while let Some(event) = channel.try_recv() {
            saw_spawn |= matches!(event, Event::WorkerSpawned { .. });
        }
        assert!(saw_spawn);
    }

    #[tokio::test]
    async fn test_completion_sent_on_the_bus_reaches_approval() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "work")).unwrap();
        let agent = orchestrator.spawn_worker("coder").await.unwrap().unwrap();

        let completed = MessagePayload::TaskCompleted {
            task_id: TaskId::from("t1"),
            result: "done".into(),
            changed_resources: vec!["src/lib.rs".into()],
        };
        send_from(&orchestrator, &agent, completed.clone()).await;
        send_from(&orchestrator, &agent, completed).await;
        let report = orchestrator.tick().await.unwrap();
        assert_eq!(report.handled, 2);

        let task = orchestrator.dispatcher().get(&TaskId::from("t1")).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.under_review);
        let pending = orchestrator.lifecycle().approvals().pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].agent_id, agent);

        orchestrator.approve(pending[0].item_id.as_str()).await.unwrap();
        assert!(orchestrator.dispatcher().get(&TaskId::from("t1")).unwrap().is_settled());
    }

    #[tokio::test]
    async fn test_failure_sent_on_the_bus_retries_the_task() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "work")).unwrap();
        let first = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        let workspace = workspace_of(&orchestrator, &first);

        send_from(
            &orchestrator,
            &first,
            MessagePayload::TaskFailed {
                task_id: TaskId::from("t1"),
                error: "segfault".into(),
            },
        )
        .await;
        orchestrator.tick().await.unwrap();

        let task = orchestrator.dispatcher().get(&TaskId::from("t1")).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.assigned_agent.is_none());
        assert!(!workspace.exists());
        assert!(orchestrator.store().get_all(orchestrator.session_id()).is_empty());
        assert!(orchestrator.lifecycle().processes().is_empty());

        let second = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        let task = orchestrator.dispatcher().get(&TaskId::from("t1")).unwrap();
        assert_eq!(task.assigned_agent, Some(second));
    }

    #[tokio::test]
    async fn test_reports_handled_by_the_polling_loop() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "work")).unwrap();
        let polling = orchestrator.bus().start_polling(
            orchestrator.config().controller_id.clone(),
            Duration::from_millis(2),
            10,
        );

        let first = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        orchestrator
            .dispatcher()
            .report_failed(&first, &TaskId::from("t1"), "crash")
            .await
            .unwrap();
        let dispatcher = Arc::clone(orchestrator.dispatcher());
        wait_until(|| {
            dispatcher
                .get(&TaskId::from("t1"))
                .is_ok_and(|task| task.status == TaskStatus::Pending && task.retry_count == 1)
        })
        .await;

        let second = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        orchestrator
            .dispatcher()
            .report_completed(&second, &TaskId::from("t1"), "done", vec![])
            .await
            .unwrap();
        let lifecycle = Arc::clone(orchestrator.lifecycle());
        wait_until(|| lifecycle.approvals().pending().len() == 1).await;
        polling.stop().await;

        let task = orchestrator.dispatcher().get(&TaskId::from("t1")).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.assigned_agent, Some(second));
    }

    #[tokio::test]
    async fn test_reassignment_releases_previous_agent() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, _) = create_test_orchestrator(dir.path()).await;
        orchestrator.enqueue(orchestrator.new_task("t1", "work")).unwrap();
        let agent = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        let workspace = workspace_of(&orchestrator, &agent);

        orchestrator
            .dispatcher()
            .request_reassignment(&TaskId::from("t1"), "worker stalled")
            .await
            .unwrap();
        orchestrator.tick().await.unwrap();

        assert!(!workspace.exists());
        assert!(orchestrator.store().get_all(orchestrator.session_id()).is_empty());
        assert!(orchestrator.lifecycle().processes().is_empty());
        assert_eq!(orchestrator.lifecycle().phase(&agent), None);
        let assignment = orchestrator.mailbox().read_assignment(&agent).await.unwrap().unwrap();
        assert_eq!(assignment.status, AssignmentStatus::Failed);

        let next = orchestrator.spawn_worker("coder").await.unwrap().unwrap();
        assert_ne!(next, agent);
    }
}
