// ABOUTME: Notifications produced by connections and the send path, and the producer handle
// ABOUTME: Producers enqueue without blocking; a single consumer task fans out to observers

mod dispatcher;
mod observer;

pub use dispatcher::NotificationDispatcher;
pub use observer::{CallObserver, InboundObserver, OutboundObserver, StatusObserver};

use crate::gateway::{ConnectionId, GatewayStatus};
use crate::message::{InboundKind, InboundMessage, OutboundMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

/// Event delivered to observers
#[derive(Debug, Clone)]
pub enum Notification {
    ConnectionStatusChanged {
        gateway: ConnectionId,
        old: GatewayStatus,
        new: GatewayStatus,
    },
    CallReceived {
        gateway: ConnectionId,
        caller_id: String,
    },
    MessageReceived {
        gateway: ConnectionId,
        kind: InboundKind,
        message: InboundMessage,
    },
    MessageSent {
        gateway: ConnectionId,
        message: OutboundMessage,
    },
}

impl Notification {
    pub fn gateway(&self) -> &ConnectionId {
        match self {
            Notification::ConnectionStatusChanged { gateway, .. }
            | Notification::CallReceived { gateway, .. }
            | Notification::MessageReceived { gateway, .. }
            | Notification::MessageSent { gateway, .. } => gateway,
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    sender: RwLock<Option<mpsc::UnboundedSender<Notification>>>,
    pending: AtomicUsize,
}

/// Producer side of the notification queue
///
/// Cheap to clone. Enqueueing never blocks; while the dispatcher is not
/// running notifications are dropped.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    queue: Arc<Queue>,
}

impl Notifier {
    /// Enqueue a notification; returns false if the queue is closed
    pub fn notify(&self, notification: Notification) -> bool {
        let sender = self
            .queue
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            trace!(gateway = %notification.gateway(), "queue closed, notification dropped");
            return false;
        };

        self.queue.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(notification).is_err() {
            self.queue.pending.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Notifications enqueued but not yet handed to an observer
    pub fn len(&self) -> usize {
        self.queue.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_open(&self) -> bool {
        self.queue
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn open(&self) -> Option<mpsc::UnboundedReceiver<Notification>> {
        let mut sender = self
            .queue
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if sender.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *sender = Some(tx);
        Some(rx)
    }

    /// Stop accepting notifications; already queued ones stay receivable
    fn close(&self) {
        self.queue
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn consumed(&self) {
        // Saturating: an abandoned drain may already have zeroed the counter
        let _ = self
            .queue
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn discard_pending(&self) -> usize {
        self.queue.pending.swap(0, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_change(id: &str) -> Notification {
        Notification::ConnectionStatusChanged {
            gateway: ConnectionId::new(id),
            old: GatewayStatus::Stopped,
            new: GatewayStatus::Starting,
        }
    }

    #[test]
    fn closed_queue_drops_notifications() {
        let notifier = Notifier::default();
        assert!(!notifier.notify(status_change("g1")));
        assert!(notifier.is_empty());
    }

    #[tokio::test]
    async fn open_queue_counts_pending() {
        let notifier = Notifier::default();
        let mut rx = notifier.open().unwrap();
        assert!(notifier.open().is_none());

        assert!(notifier.notify(status_change("g1")));
        assert!(notifier.notify(status_change("g2")));
        assert_eq!(notifier.len(), 2);

        notifier.close();
        assert!(!notifier.notify(status_change("g3")));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.gateway(), &ConnectionId::new("g1"));
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }
}
