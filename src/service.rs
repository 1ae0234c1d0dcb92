// ABOUTME: Dispatch service tying registry, router, balancer, keys and notifications together
// ABOUTME: Owns start/stop of all connections, the watchdog task and the outbound send path

use crate::crypto::KeyManager;
use crate::error::{SmsError, SmsResult};
use crate::gateway::{Gateway, GatewayStatus, Registry};
use crate::message::{
    FailureCause, InboundMessage, MessageClass, MessageStatus, OutboundMessage, Payload,
};
use crate::notify::{Notification, NotificationDispatcher};
use crate::routing::{LoadBalancer, RoundRobin, Router};
use crate::settings::Settings;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

struct Watchdog {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The dispatch engine
///
/// An explicit context object: several independent services can live in one
/// process. Connections are added before [`start`](Self::start); after that
/// the registry is fixed until [`stop`](Self::stop).
///
/// # Example
///
/// ```rust,no_run
/// use smsgate::gateway::Gateway;
/// use smsgate::loopback::LoopbackTransport;
/// use smsgate::message::OutboundMessage;
/// use smsgate::service::Service;
/// use smsgate::settings::Settings;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let service = Service::new(Settings::default());
///     service.add_gateway(Gateway::new("virtual", LoopbackTransport::new()))?;
///     service.start().await?;
///
///     let mut sms = OutboundMessage::text("+306970000000", "Hello, World!");
///     if service.send(&mut sms).await? {
///         println!("sent via {:?}", sms.gateway_id());
///     }
///
///     service.stop().await?;
///     Ok(())
/// }
/// ```
pub struct Service {
    settings: Settings,
    registry: Arc<Registry>,
    router: Router,
    balancer: Box<dyn LoadBalancer>,
    dispatcher: NotificationDispatcher,
    keys: KeyManager,
    started: AtomicBool,
    watchdog: Mutex<Option<Watchdog>>,
}

impl Service {
    pub fn new(settings: Settings) -> Self {
        Service {
            dispatcher: NotificationDispatcher::new(
                settings.drain_poll_interval,
                settings.drain_max_stalled_polls,
            ),
            settings,
            registry: Arc::new(Registry::new()),
            router: Router::new(),
            balancer: Box::new(RoundRobin::new()),
            keys: KeyManager::new(),
            started: AtomicBool::new(false),
            watchdog: Mutex::new(None),
        }
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn with_balancer(mut self, balancer: impl LoadBalancer + 'static) -> Self {
        self.balancer = Box::new(balancer);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gateway(&self, id: &str) -> Option<Arc<Gateway>> {
        self.registry.get(id)
    }

    /// Observer registration and queue inspection
    pub fn notifications(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub fn keys(&self) -> &KeyManager {
        &self.keys
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Register a connection; only allowed while the service is stopped
    pub fn add_gateway(&self, gateway: Gateway) -> SmsResult<Arc<Gateway>> {
        if self.is_started() {
            return Err(SmsError::InvalidState(
                "gateways can only be added before start".to_string(),
            ));
        }
        if self.registry.get(gateway.id().as_str()).is_some() {
            return Err(SmsError::Config(format!(
                "duplicate gateway id {}",
                gateway.id()
            )));
        }
        gateway.attach(self.dispatcher.notifier())?;
        let gateway = Arc::new(gateway);
        self.registry.add(Arc::clone(&gateway))?;
        info!(gateway = %gateway.id(), kind = gateway.kind(), "gateway registered");
        Ok(gateway)
    }

    /// Start the notification consumer, every connection, then the watchdog
    ///
    /// A connection that fails to start is left `Failed` for the watchdog;
    /// it does not abort the others.
    pub async fn start(&self) -> SmsResult<()> {
        let mut watchdog = self.watchdog.lock().await;
        if self.is_started() {
            return Err(SmsError::InvalidState("service already started".to_string()));
        }
        self.dispatcher.start()?;
        self.started.store(true, Ordering::SeqCst);
        info!(gateways = self.registry.len(), "starting service");

        let mut starts = JoinSet::new();
        for gateway in self.registry.snapshot() {
            starts.spawn(async move {
                let result = gateway.start().await;
                (gateway, result)
            });
        }
        while let Some(joined) = starts.join_next().await {
            match joined {
                Ok((gateway, Err(e))) => {
                    warn!(gateway = %gateway.id(), "gateway failed to start: {}", e)
                }
                Ok((_, Ok(()))) => {}
                Err(e) => error!("gateway start task panicked: {}", e),
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_watchdog(
            Arc::clone(&self.registry),
            self.settings.watchdog_interval,
            shutdown_rx,
        ));
        *watchdog = Some(Watchdog { shutdown, handle });
        info!("service started");
        Ok(())
    }

    /// Stop the watchdog, every connection (best effort), then drain notifications
    pub async fn stop(&self) -> SmsResult<()> {
        let mut watchdog = self.watchdog.lock().await;
        if !self.is_started() {
            return Ok(());
        }
        info!("stopping service");

        if let Some(Watchdog { shutdown, handle }) = watchdog.take() {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                error!("watchdog task ended abnormally: {}", e);
            }
        }

        let mut stops = JoinSet::new();
        for gateway in self.registry.snapshot() {
            stops.spawn(async move {
                let result = gateway.stop().await;
                (gateway, result)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((gateway, Err(e))) => {
                    warn!(gateway = %gateway.id(), "gateway did not stop cleanly: {}", e)
                }
                Ok((_, Ok(()))) => {}
                Err(e) => error!("gateway stop task panicked: {}", e),
            }
        }

        self.started.store(false, Ordering::SeqCst);
        self.dispatcher.cancel().await;
        info!("service stopped");
        Ok(())
    }

    /// Route, balance and send one message
    ///
    /// Returns `Ok(true)` when the message ended `Sent`. Transport failures
    /// are recorded on the message, not returned. With no eligible
    /// connection the message fails with `NoRoute`, no connection is touched
    /// and no notification is produced.
    pub async fn send(&self, message: &mut OutboundMessage) -> SmsResult<bool> {
        if !self.is_started() {
            return Err(SmsError::InvalidState("service not started".to_string()));
        }
        match message.status() {
            MessageStatus::Sent => {
                return Err(SmsError::InvalidState(format!(
                    "message {} was already sent",
                    message.id()
                )));
            }
            MessageStatus::Failed => message.retry(),
            MessageStatus::Unsent | MessageStatus::Retrying => {}
        }

        let candidates = self.router.route(message, &self.registry.snapshot());
        let Some(gateway) = self.balancer.balance(message, &candidates) else {
            debug!(message = message.id(), target = message.target(), "no route");
            message.mark_failed(FailureCause::NoRoute);
            return Ok(false);
        };

        // Outcomes are recorded on the message by the gateway
        match self.seal(message) {
            Ok(None) => {
                let _ = gateway.send(message).await;
            }
            Ok(Some(mut sealed)) => {
                let _ = gateway.send(&mut sealed).await;
                message.adopt_outcome(sealed);
            }
            Err(e) => {
                warn!(message = message.id(), "payload encryption failed: {}", e);
                message.mark_failed(e.failure_cause());
            }
        }

        self.dispatcher
            .notifier()
            .notify(Notification::MessageSent {
                gateway: gateway.id().clone(),
                message: message.clone(),
            });
        Ok(message.status() == MessageStatus::Sent)
    }

    /// Send through one specific connection
    pub async fn send_to(&self, message: &mut OutboundMessage, gateway_id: &str) -> SmsResult<bool> {
        message.set_target(gateway_id);
        self.send(message).await
    }

    /// Send a batch in order; returns how many ended `Sent`
    pub async fn send_all(&self, messages: &mut [OutboundMessage]) -> SmsResult<usize> {
        let mut sent = 0;
        for message in messages.iter_mut() {
            if self.send(message).await? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    /// Encrypted copy for the wire; the caller's message keeps its plaintext
    fn seal(&self, message: &OutboundMessage) -> SmsResult<Option<OutboundMessage>> {
        let plaintext = message.payload().to_bytes();
        Ok(self
            .keys
            .encrypt(message.recipient(), &plaintext)?
            .map(|sealed| message.with_sealed_payload(sealed)))
    }

    /// Read stored messages from every started inbound connection
    ///
    /// A connection that fails to read is skipped (and moved to `Failed` on
    /// channel errors); payloads from numbers with a registered key are
    /// decrypted.
    pub async fn read_messages(&self, class: MessageClass) -> SmsResult<Vec<InboundMessage>> {
        if !self.is_started() {
            return Err(SmsError::InvalidState("service not started".to_string()));
        }
        let mut messages = Vec::new();
        for gateway in self.registry.snapshot() {
            if !gateway.is_inbound() || gateway.status() != GatewayStatus::Started {
                continue;
            }
            match gateway.read_messages(class).await {
                Ok(read) => messages.extend(read),
                Err(SmsError::NotSupported(_)) => {}
                Err(e) => warn!(gateway = %gateway.id(), "reading messages failed: {}", e),
            }
        }
        for message in &mut messages {
            self.open(message);
        }
        Ok(messages)
    }

    fn open(&self, message: &mut InboundMessage) {
        let Payload::Binary(data) = &message.payload else {
            return;
        };
        match self.keys.decrypt(&message.originator, data) {
            Ok(Some(plain)) => {
                message.payload = Payload::Text(String::from_utf8_lossy(&plain).into_owned())
            }
            Ok(None) => {}
            Err(e) => warn!(originator = %message.originator, "payload decryption failed: {}", e),
        }
    }

    /// Delete a stored message from the connection it was read from
    pub async fn delete_message(&self, message: &InboundMessage) -> SmsResult<()> {
        let gateway = self.registry.get(message.gateway_id.as_str()).ok_or_else(|| {
            SmsError::InvalidData(format!("unknown gateway {}", message.gateway_id))
        })?;
        gateway.delete_message(message).await
    }
}

/// Periodically restart failed connections that allow it
async fn run_watchdog(
    registry: Arc<Registry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        for gateway in registry.snapshot() {
            if gateway.status() != GatewayStatus::Failed || !gateway.auto_restart() {
                continue;
            }
            match gateway.restart().await {
                Ok(true) => info!(gateway = %gateway.id(), "gateway restarted by watchdog"),
                Ok(false) => {}
                Err(e) => warn!(gateway = %gateway.id(), "watchdog restart failed: {}", e),
            }
        }
    }
    debug!("watchdog stopped");
}
