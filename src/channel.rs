//! Communication channels between the controller loop and its UI

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::agent::AgentStatus;
use crate::approval::{ApprovalItem, Decision};
use crate::error::{OverseerError, Result};
use crate::lifecycle::{CleanupReport, DecisionOutcome};
use crate::orchestrator::Snapshot;
use crate::task::Task;
use crate::types::{AgentId, ItemId, TaskId};

type Reply<T> = oneshot::Sender<Result<T>>;

/// Operations submitted to the controller loop
#[derive(Debug)]
pub enum Op {
    Enqueue {
        task: Task,
        reply: Reply<()>,
    },
    SpawnWorker {
        role: String,
        reply: Reply<Option<AgentId>>,
    },
    Decide {
        /// Item id or unique prefix
        item: String,
        decision: Decision,
        feedback: Option<String>,
        reply: Reply<DecisionOutcome>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown {
        reply: Reply<CleanupReport>,
    },
}

/// Notifications emitted by the controller
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    TaskEnqueued {
        task_id: TaskId,
    },
    WorkerSpawned {
        agent_id: AgentId,
        task_id: TaskId,
    },
    AgentStatusChanged {
        agent_id: AgentId,
        status: AgentStatus,
    },
    ApprovalRequested {
        item: ApprovalItem,
    },
    Decided {
        item_id: ItemId,
        decision: Decision,
    },
    TaskRequeued {
        task_id: TaskId,
        reason: String,
    },
    RetryExhausted {
        task_id: TaskId,
    },
    Question {
        agent_id: AgentId,
        task_id: Option<TaskId>,
        question: String,
    },
    ReassignRequested {
        task_id: TaskId,
        reason: String,
        previous_agent: Option<AgentId>,
    },
    Warning {
        message: String,
    },
    ShutdownComplete {
        report: CleanupReport,
    },
}

/// Channel pair held by the controller loop
pub struct ChannelPair {
    /// Receiver for operations
    pub op_rx: mpsc::UnboundedReceiver<Op>,
    /// Sender for events
    pub event_tx: mpsc::UnboundedSender<Event>,
}

/// Client side of the controller loop
#[derive(Clone)]
pub struct OverseerChannel {
    op_tx: mpsc::UnboundedSender<Op>,
    event_rx: Arc<Mutex<mpsc::UnboundedReceiver<Event>>>,
}

impl OverseerChannel {
    /// Returns the client channel and the controller's channel pair
    pub fn new() -> (Self, ChannelPair) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let channel = Self {
            op_tx,
            event_rx: Arc::new(Mutex::new(event_rx)),
        };
        (channel, ChannelPair { op_rx, event_tx })
    }

    pub fn send(&self, op: Op) -> Result<()> {
        self.op_tx
            .send(op)
            .map_err(|_| OverseerError::ChannelError("controller loop is gone".into()))
    }

    async fn request<T>(&self, op: Op, rx: oneshot::Receiver<T>) -> Result<T> {
        self.send(op)?;
        rx.await
            .map_err(|_| OverseerError::ChannelError("controller dropped the reply".into()))
    }

    pub async fn enqueue(&self, task: Task) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Op::Enqueue { task, reply }, rx).await?
    }

    pub async fn spawn_worker(&self, role: impl Into<String>) -> Result<Option<AgentId>> {
        let (reply, rx) = oneshot::channel();
        let role = role.into();
        self.request(Op::SpawnWorker { role, reply }, rx).await?
    }

    pub async fn decide(
        &self,
        item: impl Into<String>,
        decision: Decision,
        feedback: Option<String>,
    ) -> Result<DecisionOutcome> {
        let (reply, rx) = oneshot::channel();
        let op = Op::Decide {
            item: item.into(),
            decision,
            feedback,
            reply,
        };
        self.request(op, rx).await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.request(Op::Snapshot { reply }, rx).await
    }

    pub async fn shutdown(&self) -> Result<CleanupReport> {
        let (reply, rx) = oneshot::channel();
        self.request(Op::Shutdown { reply }, rx).await?
    }

    /// Try to receive an event (non-blocking)
    pub fn try_recv(&self) -> Option<Event> {
        self.event_rx.try_lock().ok()?.try_recv().ok()
    }

    pub async fn recv(&self) -> Option<Event> {
        self.event_rx.lock().await.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.op_tx.is_closed()
    }
}

/// Event sender the controller's components share.
///
/// Events emitted before a loop is attached are dropped.
#[derive(Default)]
pub struct EventSink {
    tx: RwLock<Option<mpsc::UnboundedSender<Event>>>,
}

impl EventSink {
    pub fn attach(&self, tx: mpsc::UnboundedSender<Event>) {
        *self.tx.write() = Some(tx);
    }

    pub fn emit(&self, event: Event) {
        match self.tx.read().as_ref() {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Event receiver dropped");
                }
            }
            None => debug!(event = ?event, "No event listener attached"),
        }
    }
}
