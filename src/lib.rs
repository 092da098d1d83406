//! # Overseer
//!
//! Approval-gated task orchestration for a pool of worker agents.
//!
//! A single controller hands tasks to external worker processes, collects
//! their progress through a priority message bus, and holds every finished
//! attempt until a human approves or rejects it. Whatever the outcome, the
//! worker's workspace is released and its state cleared.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                       ORCHESTRATOR (controller)                      │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  │
//! │  │ State Store │  │ Message Bus │  │ Dispatcher  │  │  Lifecycle  │  │
//! │  └─────────────┘  └──────┬──────┘  └──────┬──────┘  └──────┬──────┘  │
//! └──────────────────────────┼────────────────┼────────────────┼─────────┘
//!              reports       │   assignments  │     approvals  │
//!          ┌─────────────────┼────────────────┘                ▼
//!          ▼                 ▼                          ┌─────────────┐
//!   ┌─────────────┐   ┌─────────────┐                   │   Human     │
//!   │  Worker A   │   │  Worker B   │   ...             │  reviewer   │
//!   └─────────────┘   └─────────────┘                   └─────────────┘
//! ```
//!
//! ## Key Concepts
//!
//! - **Agent**: One worker attempt with its own workspace and state entry
//! - **Task**: A unit of work, gated on its dependencies being approved
//! - **Message**: A typed progress report from a worker, delivered at least once
//! - **Approval item**: A finished attempt waiting on a human decision
//! - **Session**: The set of agents one controller run owns and must clean up

pub mod agent;
pub mod approval;
pub mod bus;
pub mod channel;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod journal;
pub mod lifecycle;
pub mod mailbox;
pub mod message;
pub mod orchestrator;
pub mod persist;
pub mod retry;
pub mod session;
pub mod state;
pub mod task;
pub mod transport;
pub mod types;
pub mod workspace;

pub use agent::{AgentState, AgentStatus};
pub use approval::{ApprovalIndex, ApprovalItem, ApprovalOutcome, Decision};
pub use bus::{MessageBus, MessageHandler, PollingHandle, ProcessReport};
pub use channel::{ChannelPair, Event, Op, OverseerChannel};
pub use config::OverseerConfig;
pub use dispatcher::{Progress, TaskDispatcher};
pub use error::{OverseerError, Result};
pub use lifecycle::{CleanupReport, DecisionOutcome, LifecycleManager, LifecyclePhase};
pub use message::{Message, MessageKind, MessagePayload, MessagePriority};
pub use orchestrator::{Orchestrator, Snapshot};
pub use state::{StateStats, StateStore};
pub use task::{Task, TaskStatus, TaskSummary};
pub use transport::{FileTransport, MemoryTransport, MessageTransport};
pub use types::{AgentId, ItemId, MessageId, SessionId, TaskId};
pub use workspace::{
    CommandLauncher, DirectoryProvisioner, ProcessHandle, WorkerLauncher, WorkspaceProvisioner,
};
