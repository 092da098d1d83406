//! Approval index - durable queue of finished work awaiting a human decision

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use crate::error::{OverseerError, Result};
use crate::persist::SnapshotWriter;
use crate::retry::RetryPolicy;
use crate::types::{AgentId, ItemId, SessionId, TaskId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Pending,
    Approved,
    Rejected,
}

/// What the worker produced: finished work, or a task that ran out of retries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    #[default]
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalItem {
    pub item_id: ItemId,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub summary: String,
    #[serde(default)]
    pub changed_resources: Vec<String>,
    #[serde(default)]
    pub decision: Decision,
    #[serde(default)]
    pub feedback: Option<String>,
    /// Workspace to release once decided
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    #[serde(default)]
    pub outcome: ApprovalOutcome,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalItem {
    pub fn new(
        agent_id: AgentId,
        task_id: TaskId,
        session_id: SessionId,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            item_id: ItemId::generate(),
            agent_id,
            task_id,
            session_id,
            summary: summary.into(),
            changed_resources: Vec::new(),
            decision: Decision::Pending,
            feedback: None,
            workspace: None,
            outcome: ApprovalOutcome::Completed,
            created_at: Utc::now(),
            decided_at: None,
        }
    }

    pub fn with_changes(mut self, changed_resources: Vec<String>) -> Self {
        self.changed_resources = changed_resources;
        self
    }

    pub fn with_workspace(mut self, workspace: Option<PathBuf>) -> Self {
        self.workspace = workspace;
        self
    }

    pub fn with_outcome(mut self, outcome: ApprovalOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalStats {
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
}

#[derive(Default)]
struct IndexInner {
    /// Pending items only
    items: BTreeMap<ItemId, ApprovalItem>,
    /// Decisions already recorded, rebuilt from the history log on open
    decided: BTreeMap<ItemId, Decision>,
    revision: u64,
}

/// `index.json` of pending items keyed by item id, plus an append-only
/// `history.jsonl` of decided ones.
///
/// A decision moves the item from the index to the history.
pub struct ApprovalIndex {
    dir: PathBuf,
    inner: Mutex<IndexInner>,
    writer: SnapshotWriter,
    history: tokio::sync::Mutex<()>,
}

impl ApprovalIndex {
    /// Open the index under `dir`, loading any items already on disk
    #[instrument(skip_all)]
    pub async fn open(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| OverseerError::io(&dir, e))?;

        let index_path = dir.join("index.json");
        let mut items: BTreeMap<ItemId, ApprovalItem> = match tokio::fs::read(&index_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(OverseerError::io(&index_path, e)),
        };
        let decided: BTreeMap<ItemId, Decision> = read_history(&dir.join("history.jsonl"))
            .await?
            .into_iter()
            .map(|item| (item.item_id, item.decision))
            .collect();
        // A decision logged just before a crash may not have reached the index
        items.retain(|id, item| item.is_pending() && !decided.contains_key(id));
        info!(
            pending = items.len(),
            decided = decided.len(),
            path = %index_path.display(),
            "Opened approval index"
        );

        Ok(Self {
            writer: SnapshotWriter::new(index_path, policy),
            inner: Mutex::new(IndexInner {
                items,
                decided,
                revision: 0,
            }),
            history: tokio::sync::Mutex::new(()),
            dir,
        })
    }

    fn history_path(&self) -> PathBuf {
        self.dir.join("history.jsonl")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn persist(&self) -> Result<()> {
        let (revision, bytes) = {
            let inner = self.inner.lock();
            (inner.revision, serde_json::to_vec_pretty(&inner.items)?)
        };
        self.writer.write(revision, bytes).await?;
        Ok(())
    }

    async fn append_history(&self, item: &ApprovalItem) -> Result<()> {
        let path = self.history_path();
        let mut line = serde_json::to_vec(item)?;
        line.push(b'\n');

        let _guard = self.history.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| OverseerError::io(&path, e))?;
        file.write_all(&line)
            .await
            .map_err(|e| OverseerError::io(&path, e))?;
        file.flush().await.map_err(|e| OverseerError::io(&path, e))
    }

    pub async fn submit(&self, item: ApprovalItem) -> Result<ApprovalItem> {
        {
            let mut inner = self.inner.lock();
            let id = &item.item_id;
            if inner.items.contains_key(id) || inner.decided.contains_key(id) {
                return Err(OverseerError::Validation(format!(
                    "approval item {} already exists",
                    item.item_id
                )));
            }
            inner.items.insert(item.item_id.clone(), item.clone());
            inner.revision += 1;
        }
        self.persist().await?;
        info!(
            item_id = %item.item_id,
            agent_id = %item.agent_id,
            task_id = %item.task_id,
            "Approval item submitted"
        );
        Ok(item)
    }

    /// Look a pending item up by full id or by a unique id prefix
    pub fn get(&self, id_or_prefix: &str) -> Result<ApprovalItem> {
        let inner = self.inner.lock();
        let item = resolve(inner.items.values(), id_or_prefix)?;
        Ok(item.clone())
    }

    /// Like [`get`](Self::get), falling back to decided items in the history
    pub async fn lookup(&self, id_or_prefix: &str) -> Result<ApprovalItem> {
        match self.get(id_or_prefix) {
            Err(OverseerError::ItemNotFound(_)) => {}
            found => return found,
        }
        let history = self.history().await?;
        let item = resolve(history.iter().rev(), id_or_prefix)?;
        Ok(item.clone())
    }

    /// The decision already recorded for `item_id`, if any
    pub fn decision_of(&self, item_id: &ItemId) -> Option<Decision> {
        self.inner.lock().decided.get(item_id).copied()
    }

    /// The decided record of `item_id` from the history log
    pub async fn decided_item(&self, item_id: &ItemId) -> Result<Option<ApprovalItem>> {
        if self.decision_of(item_id).is_none() {
            return Ok(None);
        }
        Ok(self
            .history()
            .await?
            .into_iter()
            .rev()
            .find(|item| &item.item_id == item_id))
    }

    /// Pending items, oldest first
    pub fn pending(&self) -> Vec<ApprovalItem> {
        let mut items: Vec<_> = self.inner.lock().items.values().cloned().collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    pub fn pending_for_agent(&self, agent_id: &AgentId) -> Vec<ApprovalItem> {
        self.pending()
            .into_iter()
            .filter(|item| &item.agent_id == agent_id)
            .collect()
    }

    pub fn pending_for_session(&self, session_id: &SessionId) -> Vec<ApprovalItem> {
        self.pending()
            .into_iter()
            .filter(|item| &item.session_id == session_id)
            .collect()
    }

    /// The pending item for a given attempt, if one was already submitted
    pub fn find_pending(&self, agent_id: &AgentId, task_id: &TaskId) -> Option<ApprovalItem> {
        self.inner
            .lock()
            .items
            .values()
            .find(|item| &item.agent_id == agent_id && &item.task_id == task_id)
            .cloned()
    }

    /// Record a decision on a pending item, moving it from the index to the
    /// history.
    ///
    /// Returns `None` when the item was already decided; the first decision wins.
    #[instrument(skip(self, feedback))]
    pub async fn record_decision(
        &self,
        item_id: &ItemId,
        decision: Decision,
        feedback: Option<String>,
    ) -> Result<Option<ApprovalItem>> {
        if decision == Decision::Pending {
            return Err(OverseerError::Validation("a decision cannot be pending".into()));
        }

        let decided = {
            let mut inner = self.inner.lock();
            if let Some(previous) = inner.decided.get(item_id) {
                debug!(item_id = %item_id, decision = ?previous, "Item already decided");
                return Ok(None);
            }
            let mut item = inner
                .items
                .remove(item_id)
                .ok_or_else(|| OverseerError::ItemNotFound(item_id.clone()))?;
            item.decision = decision;
            item.feedback = feedback;
            item.decided_at = Some(Utc::now());
            inner.decided.insert(item_id.clone(), decision);
            inner.revision += 1;
            item
        };

        // History first: on reopen, a logged decision drops the item from the index
        self.append_history(&decided).await?;
        self.persist().await?;
        info!(item_id = %item_id, decision = ?decision, "Decision recorded");
        Ok(Some(decided))
    }

    /// Every decision ever recorded, oldest first
    pub async fn history(&self) -> Result<Vec<ApprovalItem>> {
        read_history(&self.history_path()).await
    }

    pub fn stats(&self) -> ApprovalStats {
        let inner = self.inner.lock();
        let mut stats = ApprovalStats {
            pending: inner.items.len(),
            ..Default::default()
        };
        for decision in inner.decided.values() {
            match decision {
                Decision::Approved => stats.approved += 1,
                Decision::Rejected => stats.rejected += 1,
                Decision::Pending => {}
            }
        }
        stats
    }
}

async fn read_history(path: &Path) -> Result<Vec<ApprovalItem>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(OverseerError::io(path, e)),
    };
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(OverseerError::from))
        .collect()
}

/// Exact id first, then a unique prefix
fn resolve<'a>(
    items: impl Iterator<Item = &'a ApprovalItem> + Clone,
    id_or_prefix: &str,
) -> Result<&'a ApprovalItem> {
    if let Some(item) = items.clone().find(|item| item.item_id.as_str() == id_or_prefix) {
        return Ok(item);
    }
    if id_or_prefix.is_empty() {
        return Err(OverseerError::ItemNotFound(ItemId::from(id_or_prefix)));
    }

    let mut matches = items.filter(|item| item.item_id.as_str().starts_with(id_or_prefix));
    match (matches.next(), matches.next()) {
        (Some(item), None) => Ok(item),
        (Some(_), Some(_)) => Err(OverseerError::Validation(format!(
            "approval id prefix {id_or_prefix} is ambiguous"
        ))),
        (None, _) => Err(OverseerError::ItemNotFound(ItemId::from(id_or_prefix))),
    }
}
