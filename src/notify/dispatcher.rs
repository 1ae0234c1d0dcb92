// ABOUTME: Single-consumer notification dispatcher with per-category observer registration
// ABOUTME: Cancel closes the queue and drains it until the backlog stops shrinking for too many polls

use super::observer::{CallObserver, InboundObserver, OutboundObserver, StatusObserver};
use super::{Notification, Notifier};
use crate::error::{SmsError, SmsResult};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

#[derive(Default)]
struct Observers {
    status: RwLock<Option<Arc<dyn StatusObserver>>>,
    call: RwLock<Option<Arc<dyn CallObserver>>>,
    inbound: RwLock<Option<Arc<dyn InboundObserver>>>,
    outbound: RwLock<Option<Arc<dyn OutboundObserver>>>,
}

fn current<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>) -> Option<Arc<T>> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn replace<T: ?Sized>(slot: &RwLock<Option<Arc<T>>>, observer: Option<Arc<T>>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = observer;
}

impl Observers {
    /// Hand one notification to the observer of its category, if any
    fn dispatch(&self, notification: Notification) {
        let gateway = notification.gateway().clone();
        let outcome = catch_unwind(AssertUnwindSafe(|| match &notification {
            Notification::ConnectionStatusChanged { gateway, old, new } => current(&self.status)
                .map(|o| o.on_status_change(gateway, *old, *new)),
            Notification::CallReceived { gateway, caller_id } => {
                current(&self.call).map(|o| o.on_call(gateway, caller_id))
            }
            Notification::MessageReceived {
                gateway,
                kind,
                message,
            } => current(&self.inbound).map(|o| o.on_message(gateway, *kind, message)),
            Notification::MessageSent { gateway, message } => {
                current(&self.outbound).map(|o| o.on_sent(gateway, message))
            }
        }));

        match outcome {
            Ok(None) => debug!(gateway = %gateway, "no observer registered, notification dropped"),
            Ok(Some(Ok(()))) => {}
            Ok(Some(Err(e))) => error!(gateway = %gateway, "observer failed: {}", e),
            Err(_) => error!(gateway = %gateway, "observer panicked"),
        }
    }
}

struct Consumer {
    handle: JoinHandle<()>,
    abandoned: Arc<AtomicBool>,
}

/// Ordered fan-out from producers to observers
///
/// Many producers enqueue through cloned [`Notifier`]s; one consumer task
/// delivers notifications in enqueue order, one at a time. Observers are
/// invoked on the consumer task, so a slow observer delays later
/// notifications but never blocks a producer.
pub struct NotificationDispatcher {
    notifier: Notifier,
    observers: Arc<Observers>,
    consumer: Mutex<Option<Consumer>>,
    poll_interval: Duration,
    max_stalled_polls: u32,
}

impl NotificationDispatcher {
    /// Create a stopped dispatcher
    ///
    /// On cancel the backlog is checked every `poll_interval`; the drain is
    /// abandoned once `max_stalled_polls` checks in a row see no progress.
    pub fn new(poll_interval: Duration, max_stalled_polls: u32) -> Self {
        NotificationDispatcher {
            notifier: Notifier::default(),
            observers: Arc::new(Observers::default()),
            consumer: Mutex::new(None),
            poll_interval,
            max_stalled_polls: max_stalled_polls.max(1),
        }
    }

    /// Producer handle for this dispatcher's queue
    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Open the queue and spawn the consumer task
    pub fn start(&self) -> SmsResult<()> {
        let Some(receiver) = self.notifier.open() else {
            return Err(SmsError::InvalidState(
                "notification dispatcher already running".to_string(),
            ));
        };
        let abandoned = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(consume(
            receiver,
            self.notifier.clone(),
            Arc::clone(&self.observers),
            Arc::clone(&abandoned),
        ));
        *self.consumer.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Consumer { handle, abandoned });
        debug!("notification dispatcher started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.notifier.is_open()
    }

    /// Close the queue and wait for the consumer to drain it
    ///
    /// Notifications enqueued before this call are delivered as long as the
    /// backlog keeps shrinking. When it has not shrunk for the configured
    /// number of polls the rest is dropped and the consumer is told to stop;
    /// it finishes the observer call it is in and never dispatches again.
    pub async fn cancel(&self) {
        self.notifier.close();
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Consumer {
            mut handle,
            abandoned,
        }) = consumer
        else {
            return;
        };

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last = self.notifier.len();
        let mut stalled = 0;

        loop {
            tokio::select! {
                joined = &mut handle => {
                    match joined {
                        Ok(()) => debug!("notification dispatcher drained"),
                        Err(e) => error!("notification consumer ended abnormally: {}", e),
                    }
                    return;
                }
                _ = ticker.tick() => {
                    let backlog = self.notifier.len();
                    if backlog < last {
                        last = backlog;
                        stalled = 0;
                        continue;
                    }
                    stalled += 1;
                    if stalled >= self.max_stalled_polls {
                        abandoned.store(true, Ordering::SeqCst);
                        let dropped = self.notifier.discard_pending();
                        warn!(dropped, stalled, "notification drain made no progress, dropping the rest");
                        return;
                    }
                }
            }
        }
    }

    /// Notifications waiting for delivery
    pub fn len(&self) -> usize {
        self.notifier.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifier.is_empty()
    }

    pub fn set_status_observer(&self, observer: impl StatusObserver + 'static) {
        replace(&self.observers.status, Some(Arc::new(observer)));
    }

    pub fn set_call_observer(&self, observer: impl CallObserver + 'static) {
        replace(&self.observers.call, Some(Arc::new(observer)));
    }

    pub fn set_inbound_observer(&self, observer: impl InboundObserver + 'static) {
        replace(&self.observers.inbound, Some(Arc::new(observer)));
    }

    pub fn set_outbound_observer(&self, observer: impl OutboundObserver + 'static) {
        replace(&self.observers.outbound, Some(Arc::new(observer)));
    }

    pub fn clear_observers(&self) {
        replace(&self.observers.status, None);
        replace(&self.observers.call, None);
        replace(&self.observers.inbound, None);
        replace(&self.observers.outbound, None);
    }
}

async fn consume(
    mut receiver: mpsc::UnboundedReceiver<Notification>,
    notifier: Notifier,
    observers: Arc<Observers>,
    abandoned: Arc<AtomicBool>,
) {
    while let Some(notification) = receiver.recv().await {
        if abandoned.load(Ordering::SeqCst) {
            debug!("notification drain abandoned, consumer exiting");
            return;
        }
        notifier.consumed();
        observers.dispatch(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ConnectionId, GatewayStatus};
    use crate::message::{MessageStatus, OutboundMessage};
    use std::sync::atomic::AtomicUsize;

    fn status(id: &str, new: GatewayStatus) -> Notification {
        Notification::ConnectionStatusChanged {
            gateway: ConnectionId::new(id),
            old: GatewayStatus::Stopped,
            new,
        }
    }

    fn collecting_status_observer(
        seen: Arc<Mutex<Vec<(String, GatewayStatus)>>>,
    ) -> impl StatusObserver {
        move |gateway: &ConnectionId, _old: GatewayStatus, new: GatewayStatus| -> crate::Result<()> {
            seen.lock().unwrap().push((gateway.to_string(), new));
            Ok(())
        }
    }

    #[tokio::test]
    async fn per_producer_order_is_preserved() {
        let dispatcher = NotificationDispatcher::new(Duration::from_millis(50), 20);
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.set_status_observer(collecting_status_observer(Arc::clone(&seen)));
        dispatcher.start().unwrap();

        let notifier = dispatcher.notifier();
        let producers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    for new in [
                        GatewayStatus::Starting,
                        GatewayStatus::Started,
                        GatewayStatus::Stopping,
                        GatewayStatus::Stopped,
                    ] {
                        notifier.notify(status(id, new));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }
        dispatcher.cancel().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 8);
        for id in ["a", "b"] {
            let order: Vec<_> = seen.iter().filter(|(g, _)| g == id).map(|(_, s)| *s).collect();
            assert_eq!(
                order,
                vec![
                    GatewayStatus::Starting,
                    GatewayStatus::Started,
                    GatewayStatus::Stopping,
                    GatewayStatus::Stopped
                ]
            );
        }
    }

    #[tokio::test]
    async fn cancel_drains_everything_enqueued_before_it() {
        let dispatcher = NotificationDispatcher::new(Duration::from_millis(50), 40);
        let seen = Arc::new(Mutex::new(Vec::new()));
        dispatcher.set_status_observer(collecting_status_observer(Arc::clone(&seen)));
        dispatcher.start().unwrap();

        let notifier = dispatcher.notifier();
        for _ in 0..100 {
            notifier.notify(status("g", GatewayStatus::Started));
        }
        dispatcher.cancel().await;

        assert_eq!(seen.lock().unwrap().len(), 100);
        assert!(dispatcher.is_empty());
        assert!(!notifier.notify(status("g", GatewayStatus::Started)));
    }

    #[tokio::test]
    async fn failing_and_panicking_observers_do_not_stop_the_loop() {
        let dispatcher = NotificationDispatcher::new(Duration::from_millis(50), 20);
        let delivered = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&delivered);
        dispatcher.set_status_observer(
            move |_: &ConnectionId, _: GatewayStatus, new: GatewayStatus| -> crate::Result<()> {
                *counter.lock().unwrap() += 1;
                match new {
                    GatewayStatus::Failed => Err("observer refused".into()),
                    GatewayStatus::Restart => panic!("observer blew up"),
                    _ => Ok(()),
                }
            },
        );
        dispatcher.start().unwrap();

        let notifier = dispatcher.notifier();
        notifier.notify(status("g", GatewayStatus::Failed));
        notifier.notify(status("g", GatewayStatus::Restart));
        notifier.notify(status("g", GatewayStatus::Starting));
        dispatcher.cancel().await;

        assert_eq!(*delivered.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn unregistered_categories_are_dropped() {
        let dispatcher = NotificationDispatcher::new(Duration::from_millis(50), 20);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        dispatcher.set_outbound_observer(
            move |_: &ConnectionId, message: &OutboundMessage| -> crate::Result<()> {
                sink.lock().unwrap().push(message.status());
                Ok(())
            },
        );
        dispatcher.start().unwrap();

        let notifier = dispatcher.notifier();
        notifier.notify(status("g", GatewayStatus::Started));
        notifier.notify(Notification::CallReceived {
            gateway: ConnectionId::new("g"),
            caller_id: "+30".into(),
        });
        notifier.notify(Notification::MessageSent {
            gateway: ConnectionId::new("g"),
            message: OutboundMessage::text("1", "x"),
        });
        dispatcher.cancel().await;

        assert_eq!(*sent.lock().unwrap(), vec![MessageStatus::Unsent]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_but_progressing_consumer_drains_fully() {
        // 5ms per item against a 60ms no-progress window: 40 items take far longer than the window
        let dispatcher = NotificationDispatcher::new(Duration::from_millis(20), 3);
        let delivered = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&delivered);
        dispatcher.set_status_observer(
            move |_: &ConnectionId, _: GatewayStatus, _: GatewayStatus| -> crate::Result<()> {
                std::thread::sleep(Duration::from_millis(5));
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        dispatcher.start().unwrap();

        let notifier = dispatcher.notifier();
        for _ in 0..40 {
            notifier.notify(status("g", GatewayStatus::Started));
        }
        dispatcher.cancel().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 40);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stuck_observer_is_abandoned_and_never_called_again() {
        let dispatcher = NotificationDispatcher::new(Duration::from_millis(10), 3);
        let calls = Arc::new(AtomicUsize::new(0));
        let released = Arc::new(AtomicBool::new(false));
        let (counter, gate) = (Arc::clone(&calls), Arc::clone(&released));
        dispatcher.set_status_observer(
            move |_: &ConnectionId, _: GatewayStatus, _: GatewayStatus| -> crate::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                while !gate.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Ok(())
            },
        );
        dispatcher.start().unwrap();

        let notifier = dispatcher.notifier();
        for _ in 0..5 {
            notifier.notify(status("g", GatewayStatus::Started));
        }
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        dispatcher.cancel().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.is_empty());

        released.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(dispatcher.is_empty());
    }

    #[tokio::test]
    async fn double_start_is_rejected_and_restart_after_cancel_works() {
        let dispatcher = NotificationDispatcher::new(Duration::from_millis(50), 20);
        dispatcher.start().unwrap();
        assert!(matches!(dispatcher.start(), Err(SmsError::InvalidState(_))));
        dispatcher.cancel().await;
        assert!(!dispatcher.is_running());
        dispatcher.start().unwrap();
        dispatcher.cancel().await;
    }
}
