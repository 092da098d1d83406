//! Progress messages exchanged between workers and the controller

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{OverseerError, Result};
use crate::types::{AgentId, MessageId, TaskId};

/// Dispatch key for message handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    Question,
    Response,
    ReassignRequest,
}

/// Delivery priority; declaration order is the ordering (`Low < Urgent`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Typed message body, serialized as `type` + `content`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum MessagePayload {
    TaskStarted {
        task_id: TaskId,
        description: String,
    },
    TaskProgress {
        task_id: TaskId,
        progress: String,
        #[serde(default)]
        percentage: Option<u8>,
        #[serde(default)]
        tokens_used: u64,
        #[serde(default)]
        cost: f64,
    },
    TaskCompleted {
        task_id: TaskId,
        result: String,
        #[serde(default)]
        changed_resources: Vec<String>,
    },
    TaskFailed {
        task_id: TaskId,
        error: String,
    },
    Question {
        #[serde(default)]
        task_id: Option<TaskId>,
        question: String,
    },
    Response {
        #[serde(default)]
        in_reply_to: Option<MessageId>,
        answer: String,
    },
    ReassignRequest {
        task_id: TaskId,
        reason: String,
        #[serde(default)]
        previous_agent: Option<AgentId>,
    },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::TaskStarted { .. } => MessageKind::TaskStarted,
            MessagePayload::TaskProgress { .. } => MessageKind::TaskProgress,
            MessagePayload::TaskCompleted { .. } => MessageKind::TaskCompleted,
            MessagePayload::TaskFailed { .. } => MessageKind::TaskFailed,
            MessagePayload::Question { .. } => MessageKind::Question,
            MessagePayload::Response { .. } => MessageKind::Response,
            MessagePayload::ReassignRequest { .. } => MessageKind::ReassignRequest,
        }
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            MessagePayload::TaskStarted { task_id, .. }
            | MessagePayload::TaskProgress { task_id, .. }
            | MessagePayload::TaskCompleted { task_id, .. }
            | MessagePayload::TaskFailed { task_id, .. }
            | MessagePayload::ReassignRequest { task_id, .. } => Some(task_id),
            MessagePayload::Question { task_id, .. } => task_id.as_ref(),
            MessagePayload::Response { .. } => None,
        }
    }

    /// Priority a report of this kind is sent with unless overridden
    pub fn default_priority(&self) -> MessagePriority {
        match self.kind() {
            MessageKind::TaskProgress => MessagePriority::Low,
            MessageKind::TaskStarted | MessageKind::Question | MessageKind::Response => {
                MessagePriority::Medium
            }
            MessageKind::TaskCompleted | MessageKind::ReassignRequest => MessagePriority::High,
            MessageKind::TaskFailed => MessagePriority::Urgent,
        }
    }
}

/// One progress event. The bus stamps `message_id` and `timestamp` on send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub sender: String,
    pub receiver: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        payload: MessagePayload,
    ) -> Self {
        Self {
            message_id: MessageId::from(""),
            sender: sender.into(),
            receiver: receiver.into(),
            priority: payload.default_priority(),
            payload,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn validate(&self) -> Result<()> {
        if self.sender.trim().is_empty() {
            return Err(OverseerError::Validation("message sender is empty".into()));
        }
        if self.receiver.trim().is_empty() {
            return Err(OverseerError::Validation("message receiver is empty".into()));
        }
        if let Some(task_id) = self.payload.task_id() {
            if task_id.as_str().trim().is_empty() {
                return Err(OverseerError::Validation(format!(
                    "{:?} message from {} has an empty task id",
                    self.kind(),
                    self.sender
                )));
            }
        }
        if let MessagePayload::TaskProgress {
            percentage: Some(pct),
            ..
        } = &self.payload
        {
            if *pct > 100 {
                return Err(OverseerError::Validation(format!(
                    "progress percentage {pct} is out of range"
                )));
            }
        }
        Ok(())
    }
}
