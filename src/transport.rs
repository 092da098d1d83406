//! Message transports - where undelivered messages live between send and archive

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error};

use crate::error::{OverseerError, Result};
use crate::message::Message;
use crate::persist::write_atomic;
use crate::types::MessageId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub unprocessed: usize,
    pub processed: usize,
}

impl TransportStats {
    pub fn total(&self) -> usize {
        self.unprocessed + self.processed
    }
}

/// Storage behind the message bus.
///
/// `pending` must never drop a message; only `archive` removes one from the
/// undelivered set, and archived messages are kept for audit.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn push(&self, message: &Message) -> Result<()>;

    /// Every undelivered message, in no particular order
    async fn pending(&self) -> Result<Vec<Message>>;

    /// Move a message to the archive. `false` if it was not pending.
    async fn archive(&self, message_id: &MessageId) -> Result<bool>;

    async fn stats(&self) -> Result<TransportStats>;
}

/// In-process transport
#[derive(Default)]
pub struct MemoryTransport {
    pending: Mutex<BTreeMap<MessageId, Message>>,
    archived: Mutex<Vec<Message>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn archived(&self) -> Vec<Message> {
        self.archived.lock().clone()
    }
}

#[async_trait]
impl MessageTransport for MemoryTransport {
    async fn push(&self, message: &Message) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&message.message_id) {
            return Err(OverseerError::Validation(format!(
                "duplicate message id {}",
                message.message_id
            )));
        }
        pending.insert(message.message_id.clone(), message.clone());
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<Message>> {
        Ok(self.pending.lock().values().cloned().collect())
    }

    async fn archive(&self, message_id: &MessageId) -> Result<bool> {
        let removed = self.pending.lock().remove(message_id);
        match removed {
            Some(message) => {
                self.archived.lock().push(message);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(TransportStats {
            unprocessed: self.pending.lock().len(),
            processed: self.archived.lock().len(),
        })
    }
}

/// One YAML file per undelivered message; archived files move to `processed`
pub struct FileTransport {
    messages_dir: PathBuf,
    processed_dir: PathBuf,
}

impl FileTransport {
    pub async fn open(
        messages_dir: impl Into<PathBuf>,
        processed_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let transport = Self {
            messages_dir: messages_dir.into(),
            processed_dir: processed_dir.into(),
        };
        for dir in [&transport.messages_dir, &transport.processed_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| OverseerError::io(dir, e))?;
        }
        Ok(transport)
    }

    fn file_for(dir: &Path, message_id: &MessageId) -> PathBuf {
        dir.join(format!("{message_id}.yaml"))
    }

    async fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| OverseerError::io(dir, e))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| OverseerError::io(dir, e))?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "yaml") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn read_message(path: &Path) -> Result<Message> {
        let raw = fs::read_to_string(path)
            .await
            .map_err(|e| OverseerError::io(path, e))?;
        let message: Message = serde_yaml::from_str(&raw).map_err(|e| {
            OverseerError::Validation(format!("{}: {e}", path.display()))
        })?;
        message.validate()?;
        Ok(message)
    }
}

#[async_trait]
impl MessageTransport for FileTransport {
    async fn push(&self, message: &Message) -> Result<()> {
        let path = Self::file_for(&self.messages_dir, &message.message_id);
        if fs::try_exists(&path).await.map_err(|e| OverseerError::io(&path, e))? {
            return Err(OverseerError::Validation(format!(
                "duplicate message id {}",
                message.message_id
            )));
        }
        let yaml = serde_yaml::to_string(message)?;
        write_atomic(&path, yaml.as_bytes()).await?;
        debug!(message_id = %message.message_id, path = %path.display(), "Wrote message file");
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<Message>> {
        let mut messages = Vec::new();
        for path in Self::yaml_files(&self.messages_dir).await? {
            match Self::read_message(&path).await {
                Ok(message) => messages.push(message),
                // Left in place for inspection; a malformed file is never delivered
                Err(e) => error!(path = %path.display(), error = %e, "Skipping unreadable message"),
            }
        }
        Ok(messages)
    }

    async fn archive(&self, message_id: &MessageId) -> Result<bool> {
        let from = Self::file_for(&self.messages_dir, message_id);
        let to = Self::file_for(&self.processed_dir, message_id);
        match fs::rename(&from, &to).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OverseerError::io(&from, e)),
        }
    }

    async fn stats(&self) -> Result<TransportStats> {
        Ok(TransportStats {
            unprocessed: Self::yaml_files(&self.messages_dir).await?.len(),
            processed: Self::yaml_files(&self.processed_dir).await?.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;
    use crate::types::TaskId;

    fn message(id: &str) -> Message {
        let mut message = Message::new(
            "coder-1",
            "controller",
            MessagePayload::TaskStarted {
                task_id: TaskId::from("t1"),
                description: "build the parser".into(),
            },
        );
        message.message_id = MessageId::from(id);
        message
    }

    #[tokio::test]
    async fn test_memory_archive_moves_message() {
        let transport = MemoryTransport::new();
        transport.push(&message("m1")).await.unwrap();

        assert!(transport.archive(&MessageId::from("m1")).await.unwrap());
        assert!(!transport.archive(&MessageId::from("m1")).await.unwrap());
        assert!(transport.pending().await.unwrap().is_empty());
        assert_eq!(transport.archived().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_rejects_duplicate_ids() {
        let transport = MemoryTransport::new();
        transport.push(&message("m1")).await.unwrap();
        assert!(transport.push(&message("m1")).await.is_err());
    }

    #[tokio::test]
    async fn test_file_transport_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            FileTransport::open(dir.path().join("messages"), dir.path().join("processed"))
                .await
                .unwrap();

        let sent = message("m1");
        transport.push(&sent).await.unwrap();

        let pending = transport.pending().await.unwrap();
        assert_eq!(pending, vec![sent]);

        assert!(transport.archive(&MessageId::from("m1")).await.unwrap());
        assert!(dir.path().join("processed").join("m1.yaml").exists());

        let stats = transport.stats().await.unwrap();
        assert_eq!(stats, TransportStats { unprocessed: 0, processed: 1 });
    }

    #[tokio::test]
    async fn test_file_transport_rejects_duplicate_ids() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            FileTransport::open(dir.path().join("messages"), dir.path().join("processed"))
                .await
                .unwrap();
        transport.push(&message("m1")).await.unwrap();
        assert!(transport.push(&message("m1")).await.is_err());
    }

    #[tokio::test]
    async fn test_malformed_files_are_skipped_not_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let messages = dir.path().join("messages");
        let transport = FileTransport::open(&messages, dir.path().join("processed"))
            .await
            .unwrap();

        std::fs::write(messages.join("broken.yaml"), "type: [not a message").unwrap();
        transport.push(&message("m1")).await.unwrap();

        let pending = transport.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(messages.join("broken.yaml").exists());
    }
}
