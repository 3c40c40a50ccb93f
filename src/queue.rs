//! The bounded outbound queue and its worker pool.
//!
//! Both front doors (ingress API and inbound sessions) enqueue into the
//! same bounded channel. Workers drain it concurrently; each message is
//! delivered exactly once by exactly one worker. Closing the queue stops
//! intake while letting workers finish what is already buffered.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::task::JoinHandle;

use crate::{
    delivery::{DeliveryError, DeliveryExecutor},
    message::Message,
};

/// Middleware verdict on a message about to be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    /// Discard the message with the given reason. Cancelled messages are
    /// logged and dropped, never retried.
    Cancel(String),
}

/// An inspection stage run by workers before delivery.
pub trait Middleware: Send + Sync {
    fn inspect(&self, message: &Message) -> Decision;
}

/// Callback invoked with every delivery failure.
pub type ErrorHandler = Arc<dyn Fn(&DeliveryError) + Send + Sync>;

/// Logs the failure and its source chain.
#[must_use]
pub fn default_error_handler() -> ErrorHandler {
    Arc::new(|error: &DeliveryError| {
        tracing::error!(%error, "delivery failed");
    })
}

/// The bounded channel both front doors feed.
pub struct OutboundQueue {
    sender: RwLock<Option<flume::Sender<Message>>>,
    receiver: flume::Receiver<Message>,
    capacity: usize,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = flume::bounded(capacity);
        Self {
            sender: RwLock::new(Some(sender)),
            receiver,
            capacity,
        }
    }

    /// Enqueue a message without blocking.
    ///
    /// Returns `false` when the queue is full or closed; the message is
    /// dropped and the caller decides how to report that.
    pub fn enqueue(&self, message: Message) -> bool {
        match self.sender.read().as_ref() {
            Some(sender) => sender.try_send(message).is_ok(),
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stop intake. Messages already buffered remain deliverable; once
    /// they drain, worker receive loops terminate.
    pub fn close(&self) {
        self.sender.write().take();
    }

    #[must_use]
    pub fn receiver(&self) -> flume::Receiver<Message> {
        self.receiver.clone()
    }
}

/// Spawn the worker pool draining `queue` through `executor`.
///
/// Each worker loops until the queue is closed and empty. Middleware runs
/// in order before delivery; the first `Cancel` discards the message.
pub fn spawn_workers(
    count: usize,
    queue: &Arc<OutboundQueue>,
    executor: Arc<DeliveryExecutor>,
    middleware: Arc<[Arc<dyn Middleware>]>,
    on_error: ErrorHandler,
) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|worker| {
            let receiver = queue.receiver();
            let executor = Arc::clone(&executor);
            let middleware = Arc::clone(&middleware);
            let on_error = Arc::clone(&on_error);

            tokio::spawn(async move {
                tracing::debug!(worker, "outbound worker started");

                while let Ok(message) = receiver.recv_async().await {
                    let cancelled = middleware.iter().find_map(|stage| {
                        match stage.inspect(&message) {
                            Decision::Proceed => None,
                            Decision::Cancel(reason) => Some(reason),
                        }
                    });

                    if let Some(reason) = cancelled {
                        tracing::info!(
                            worker,
                            subject = %message.subject,
                            reason,
                            "message cancelled before delivery"
                        );
                        continue;
                    }

                    if let Err(error) = executor.deliver(&message).await {
                        on_error(&error);
                    }
                }

                tracing::debug!(worker, "outbound worker stopped");
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::message::Mailbox;

    fn sample(subject: &str) -> Message {
        Message {
            from: Mailbox::new("", "sender@example.org"),
            to: vec![Mailbox::new("", "recipient@example.net")],
            subject: subject.to_string(),
            content: "body".to_string(),
            is_markup: false,
            attachments: Vec::new(),
        }
    }

    #[test]
    fn enqueue_fails_when_full_without_disturbing_contents() {
        let queue = OutboundQueue::new(2);
        assert!(queue.enqueue(sample("one")));
        assert!(queue.enqueue(sample("two")));
        assert!(!queue.enqueue(sample("three")));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.receiver().try_recv().unwrap().subject, "one");
        assert_eq!(queue.receiver().try_recv().unwrap().subject, "two");
    }

    #[test]
    fn closed_queue_rejects_but_still_drains() {
        let queue = OutboundQueue::new(4);
        assert!(queue.enqueue(sample("buffered")));

        queue.close();
        assert!(!queue.enqueue(sample("late")));

        let receiver = queue.receiver();
        assert_eq!(receiver.recv().unwrap().subject, "buffered");
        // Sender gone and buffer empty terminates the receive loop.
        assert!(receiver.recv().is_err());
    }

    struct SubjectVeto;

    impl Middleware for SubjectVeto {
        fn inspect(&self, message: &Message) -> Decision {
            if message.subject.contains("blocked") {
                Decision::Cancel("blocked subject".to_string())
            } else {
                Decision::Proceed
            }
        }
    }

    #[test]
    fn middleware_first_veto_wins() {
        let stages: Vec<Arc<dyn Middleware>> = vec![Arc::new(SubjectVeto)];
        let message = sample("blocked: spam");

        let verdict = stages
            .iter()
            .find_map(|stage| match stage.inspect(&message) {
                Decision::Proceed => None,
                Decision::Cancel(reason) => Some(reason),
            });
        assert_eq!(verdict.as_deref(), Some("blocked subject"));

        let clean = sample("fine");
        let verdict = stages
            .iter()
            .find_map(|stage| match stage.inspect(&clean) {
                Decision::Proceed => None,
                Decision::Cancel(reason) => Some(reason),
            });
        assert!(verdict.is_none());
    }
}
