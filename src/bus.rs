//! Message bus - priority-ordered, at-least-once delivery from workers to the controller

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;
use crate::message::{Message, MessageKind};
use crate::transport::{MessageTransport, TransportStats};
use crate::types::MessageId;

/// Handles one kind of message.
///
/// Delivery is at-least-once: a handler that fails leaves the message pending
/// and it is offered again on the next poll, so handlers must tolerate
/// duplicates.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> anyhow::Result<()>;
}

/// Adapter for synchronous handlers
struct FnHandler<F>(F);

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// Outcome of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessReport {
    /// Archived after every handler succeeded
    pub handled: usize,
    /// Left pending because a handler failed
    pub failed: usize,
    /// Archived with no handler registered for their kind
    pub unrouted: usize,
}

pub struct MessageBus {
    transport: Arc<dyn MessageTransport>,
    handlers: RwLock<HashMap<MessageKind, Vec<Arc<dyn MessageHandler>>>>,
    sequence: AtomicU64,
    failures: Mutex<HashMap<MessageId, u32>>,
    stuck_after: u32,
}

impl MessageBus {
    pub fn new(transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            transport,
            handlers: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            failures: Mutex::new(HashMap::new()),
            stuck_after: 5,
        }
    }

    /// Failed deliveries after which a message is reported as stuck
    pub fn with_stuck_after(mut self, attempts: u32) -> Self {
        self.stuck_after = attempts.max(1);
        self
    }

    fn next_id(&self) -> MessageId {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        MessageId::from(format!("msg-{}-{:06}", Utc::now().format("%Y%m%d%H%M%S%3f"), seq))
    }

    /// Stamp and enqueue a message
    pub async fn send(&self, mut message: Message) -> Result<MessageId> {
        message.validate()?;
        message.message_id = self.next_id();
        message.timestamp = Utc::now();
        self.transport.push(&message).await?;

        info!(
            message_id = %message.message_id,
            kind = ?message.kind(),
            sender = %message.sender,
            receiver = %message.receiver,
            "Message sent"
        );
        Ok(message.message_id)
    }

    /// Pending messages for `receiver`, most urgent first, FIFO within a priority.
    ///
    /// Polling does not consume; only successful handling archives.
    pub async fn poll(&self, receiver: &str, max_count: usize) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = self
            .transport
            .pending()
            .await?
            .into_iter()
            .filter(|m| m.receiver == receiver)
            .collect();

        messages.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.timestamp.cmp(&b.timestamp))
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        messages.truncate(max_count);
        Ok(messages)
    }

    pub fn register_handler(&self, kind: MessageKind, handler: Arc<dyn MessageHandler>) {
        debug!(kind = ?kind, "Registering message handler");
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Register a synchronous closure as a handler
    pub fn register_fn<F>(&self, kind: MessageKind, f: F)
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_handler(kind, Arc::new(FnHandler(f)));
    }

    fn handlers_for(&self, kind: MessageKind) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers.read().get(&kind).cloned().unwrap_or_default()
    }

    /// Dispatch pending messages for `receiver` and archive the ones handled
    #[instrument(skip(self))]
    pub async fn process(&self, receiver: &str, max_count: usize) -> Result<ProcessReport> {
        let mut report = ProcessReport::default();

        for message in self.poll(receiver, max_count).await? {
            let handlers = self.handlers_for(message.kind());

            if handlers.is_empty() {
                warn!(
                    message_id = %message.message_id,
                    kind = ?message.kind(),
                    "No handler registered; archiving"
                );
                self.transport.archive(&message.message_id).await?;
                report.unrouted += 1;
                continue;
            }

            let mut failure = None;
            for handler in &handlers {
                if let Err(e) = handler.handle(&message).await {
                    failure = Some(e);
                    break;
                }
            }

            match failure {
                None => {
                    self.transport.archive(&message.message_id).await?;
                    self.failures.lock().remove(&message.message_id);
                    report.handled += 1;
                }
                Some(e) => {
                    let attempts = {
                        let mut failures = self.failures.lock();
                        let count = failures.entry(message.message_id.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    if attempts >= self.stuck_after {
                        error!(
                            message_id = %message.message_id,
                            kind = ?message.kind(),
                            attempts,
                            error = %format!("{e:#}"),
                            "Message is stuck; leaving it pending"
                        );
                    } else {
                        warn!(
                            message_id = %message.message_id,
                            kind = ?message.kind(),
                            attempts,
                            error = %format!("{e:#}"),
                            "Handler failed; message will be redelivered"
                        );
                    }
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Messages that failed at least `stuck_after` times
    pub fn stuck_messages(&self) -> Vec<(MessageId, u32)> {
        let mut stuck: Vec<(MessageId, u32)> = self
            .failures
            .lock()
            .iter()
            .filter(|(_, count)| **count >= self.stuck_after)
            .map(|(id, count)| (id.clone(), *count))
            .collect();
        stuck.sort();
        stuck
    }

    pub async fn stats(&self) -> Result<TransportStats> {
        self.transport.stats().await
    }

    /// Spawn a loop that processes `receiver`'s messages every `interval`
    pub fn start_polling(
        self: &Arc<Self>,
        receiver: impl Into<String>,
        interval: Duration,
        max_count: usize,
    ) -> PollingHandle {
        let bus = Arc::clone(self);
        let receiver = receiver.into();
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let join = tokio::spawn(async move {
            info!(
                receiver = %receiver,
                interval_ms = interval.as_millis() as u64,
                "Starting message polling"
            );
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = bus.process(&receiver, max_count).await {
                            error!(receiver = %receiver, error = %e, "Polling pass failed");
                        }
                    }
                }
            }
            info!(receiver = %receiver, "Message polling stopped");
        });

        PollingHandle {
            stop: Some(stop_tx),
            join,
        }
    }
}

/// Handle to a running polling loop
pub struct PollingHandle {
    stop: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl PollingHandle {
    /// Stop polling after the current pass and wait for the loop to exit
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        let _ = (&mut self.join).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessagePayload, MessagePriority};
    use crate::transport::MemoryTransport;
    use crate::types::TaskId;
    use std::sync::atomic::AtomicUsize;

    fn create_test_bus() -> (Arc<MessageBus>, Arc<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let bus = Arc::new(MessageBus::new(transport.clone()).with_stuck_after(2));
        (bus, transport)
    }

    fn progress(text: &str) -> Message {
        Message::new(
            "coder-1",
            "controller",
            MessagePayload::TaskProgress {
                task_id: TaskId::from("t1"),
                progress: text.into(),
                percentage: None,
                tokens_used: 0,
                cost: 0.0,
            },
        )
    }

    #[tokio::test]
    async fn test_poll_orders_by_priority() {
        let (bus, _) = create_test_bus();
        bus.send(progress("low").with_priority(MessagePriority::Low)).await.unwrap();
        bus.send(progress("urgent").with_priority(MessagePriority::Urgent)).await.unwrap();
        bus.send(progress("medium").with_priority(MessagePriority::Medium)).await.unwrap();

        let polled = bus.poll("controller", 10).await.unwrap();
        let priorities: Vec<MessagePriority> = polled.iter().map(|m| m.priority).collect();
        assert_eq!(
            priorities,
            vec![MessagePriority::Urgent, MessagePriority::Medium, MessagePriority::Low]
        );
    }

    #[tokio::test]
    async fn test_poll_is_fifo_within_priority() {
        let (bus, _) = create_test_bus();
        let first = bus.send(progress("first")).await.unwrap();
        let second = bus.send(progress("second")).await.unwrap();

        let polled = bus.poll("controller", 10).await.unwrap();
        assert_eq!(polled[0].message_id, first);
        assert_eq!(polled[1].message_id, second);
    }

    #[tokio::test]
    async fn test_poll_filters_receiver_and_limits() {
        let (bus, _) = create_test_bus();
        bus.send(progress("a")).await.unwrap();
        bus.send(progress("b")).await.unwrap();
        bus.send(Message::new("controller", "coder-1", MessagePayload::Response {
            in_reply_to: None,
            answer: "use serde".into(),
        }))
        .await
        .unwrap();

        assert_eq!(bus.poll("controller", 1).await.unwrap().len(), 1);
        assert_eq!(bus.poll("coder-1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handled_messages_are_archived_once() {
        let (bus, transport) = create_test_bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.register_fn(MessageKind::TaskProgress, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.send(progress("a")).await.unwrap();
        let report = bus.process("controller", 10).await.unwrap();
        assert_eq!(report.handled, 1);

        let again = bus.process("controller", 10).await.unwrap();
        assert_eq!(again, ProcessReport::default());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(transport.archived().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_handler_leaves_message_pending() {
        let (bus, transport) = create_test_bus();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        bus.register_fn(MessageKind::TaskProgress, move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("state store busy")
            }
            Ok(())
        });

        let id = bus.send(progress("a")).await.unwrap();

        assert_eq!(bus.process("controller", 10).await.unwrap().failed, 1);
        assert_eq!(bus.process("controller", 10).await.unwrap().failed, 1);
        assert_eq!(bus.stuck_messages(), vec![(id.clone(), 2)]);
        assert!(transport.archived().is_empty());

        assert_eq!(bus.process("controller", 10).await.unwrap().handled, 1);
        assert!(bus.stuck_messages().is_empty());
        assert_eq!(transport.archived()[0].message_id, id);
    }

    #[tokio::test]
    async fn test_unrouted_messages_are_archived() {
        let (bus, _) = create_test_bus();
        bus.send(progress("a")).await.unwrap();

        let report = bus.process("controller", 10).await.unwrap();
        assert_eq!(report.unrouted, 1);
        assert_eq!(bus.stats().await.unwrap().processed, 1);
    }

    struct AsyncCounter(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for AsyncCounter {
        async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_polling_loop_dispatches_async_handlers() {
        let (bus, _) = create_test_bus();
        let seen = Arc::new(AtomicUsize::new(0));
        bus.register_handler(MessageKind::TaskProgress, Arc::new(AsyncCounter(seen.clone())));
        bus.send(progress("a")).await.unwrap();

        let handle = bus.start_polling("controller", Duration::from_millis(5), 10);
        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.stop().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
