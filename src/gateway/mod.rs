// ABOUTME: Connection abstraction: identity, capabilities, lifecycle state machine and counters
// ABOUTME: Wraps a protocol Transport and turns its failures into status transitions and notifications

mod registry;

pub use registry::Registry;

use crate::error::{SmsError, SmsResult};
use crate::message::{InboundMessage, MessageClass, OutboundMessage};
use crate::notify::{Notification, Notifier};
use async_trait::async_trait;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Connection identifier
///
/// Equality, hashing and ordering ignore ASCII case; `Display` keeps the
/// spelling the connection was configured with.
#[derive(Debug, Clone, Eq)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against a raw identifier
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl PartialEq for ConnectionId {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.0)
    }
}

impl Hash for ConnectionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.0.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        state.write_u8(0xff);
    }
}

impl PartialOrd for ConnectionId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConnectionId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let lhs = self.0.bytes().map(|b| b.to_ascii_lowercase());
        let rhs = other.0.bytes().map(|b| b.to_ascii_lowercase());
        lhs.cmp(rhs)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        ConnectionId::new(id)
    }
}

/// Set of features a transport supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const SEND: Capabilities = Capabilities(0x01);
    pub const RECEIVE: Capabilities = Capabilities(0x02);
    pub const CUSTOM_FROM: Capabilities = Capabilities(0x04);
    pub const BIG_MESSAGES: Capabilities = Capabilities(0x08);
    pub const WAP_SI: Capabilities = Capabilities(0x10);
    pub const PORT_ADDRESSING: Capabilities = Capabilities(0x20);
    pub const FLASH_SMS: Capabilities = Capabilities(0x40);
    pub const DELIVERY_REPORTS: Capabilities = Capabilities(0x80);

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Capabilities) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Capabilities) {
        self.0 &= !other.0;
    }
}

impl BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        Capabilities(self.0 | rhs.0)
    }
}

/// Connection lifecycle state
///
/// ```text
/// Stopped → Starting → Started → Stopping → Stopped
///              ↓          ↓
///            Failed → Restart → Starting
///              ↓
///           Stopping
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GatewayStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
    Failed,
    Restart,
}

impl GatewayStatus {
    pub fn can_transition_to(self, next: GatewayStatus) -> bool {
        use GatewayStatus::*;
        match (self, next) {
            (Failed, Failed) => false,
            (_, Failed) => true,
            (Stopped | Restart, Starting) => true,
            (Starting, Started) => true,
            (Started | Failed, Stopping) => true,
            (Stopping, Stopped) => true,
            (Failed, Restart) => true,
            _ => false,
        }
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayStatus::Stopped => "stopped",
            GatewayStatus::Starting => "starting",
            GatewayStatus::Started => "started",
            GatewayStatus::Stopping => "stopping",
            GatewayStatus::Failed => "failed",
            GatewayStatus::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// Protocol driver behind a connection
///
/// A transport owns its channel (serial line, TCP session, HTTP client) and
/// its background tasks. It never touches the connection status directly:
/// lifecycle calls return errors and runtime faults are reported through the
/// [`GatewayLink`] passed to [`Transport::start`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs and `NotSupported` errors
    fn kind(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Open the channel and run protocol initialization
    async fn start(&self, link: GatewayLink) -> SmsResult<()>;

    /// Graceful teardown; background tasks are joined before returning
    async fn stop(&self) -> SmsResult<()>;

    /// Submit one message; sets the provider reference on success
    async fn send(&self, message: &mut OutboundMessage) -> SmsResult<()>;

    async fn read_messages(&self, _class: MessageClass) -> SmsResult<Vec<InboundMessage>> {
        Err(SmsError::NotSupported(self.kind()))
    }

    async fn delete_message(&self, _message: &InboundMessage) -> SmsResult<()> {
        Err(SmsError::NotSupported(self.kind()))
    }
}

/// Counters kept per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GatewayStats {
    pub inbound: u64,
    pub outbound: u64,
    pub restarts: u64,
}

#[derive(Debug)]
struct GatewayState {
    id: ConnectionId,
    status: RwLock<GatewayStatus>,
    inbound: AtomicU64,
    outbound: AtomicU64,
    restarts: AtomicU64,
    notifier: OnceLock<Notifier>,
}

impl GatewayState {
    fn status(&self) -> GatewayStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: GatewayStatus) -> SmsResult<GatewayStatus> {
        self.transition_when(next, |current| current.can_transition_to(next))
    }

    /// Move to `next` if `allowed` accepts the current status; returns the old status
    fn transition_when(
        &self,
        next: GatewayStatus,
        allowed: impl Fn(GatewayStatus) -> bool,
    ) -> SmsResult<GatewayStatus> {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        let old = *status;
        if !allowed(old) || !old.can_transition_to(next) {
            return Err(SmsError::InvalidState(format!(
                "gateway {} cannot go from {old} to {next}",
                self.id
            )));
        }
        *status = next;
        debug!(gateway = %self.id, %old, new = %next, "status changed");

        // Enqueued under the lock so per-connection transitions stay ordered
        self.notify(Notification::ConnectionStatusChanged {
            gateway: self.id.clone(),
            old,
            new: next,
        });
        Ok(old)
    }

    fn notify(&self, notification: Notification) {
        if let Some(notifier) = self.notifier.get() {
            notifier.notify(notification);
        }
    }
}

/// Handle given to a transport so its background tasks can report events
#[derive(Debug, Clone)]
pub struct GatewayLink {
    state: Arc<GatewayState>,
}

impl GatewayLink {
    pub fn gateway_id(&self) -> &ConnectionId {
        &self.state.id
    }

    pub fn status(&self) -> GatewayStatus {
        self.state.status()
    }

    /// Deliver an inbound message or status report to observers
    pub fn message_received(&self, message: InboundMessage) {
        self.state.inbound.fetch_add(1, Ordering::Relaxed);
        self.state.notify(Notification::MessageReceived {
            gateway: self.state.id.clone(),
            kind: message.kind,
            message,
        });
    }

    pub fn call_received(&self, caller_id: impl Into<String>) {
        self.state.notify(Notification::CallReceived {
            gateway: self.state.id.clone(),
            caller_id: caller_id.into(),
        });
    }

    /// Report a fault detected outside a lifecycle call (I/O error, dead keep-alive)
    ///
    /// Only a `Started` connection is moved to `Failed`; faults reported while
    /// starting or stopping are left to the lifecycle call in progress.
    pub fn report_failure(&self, error: &SmsError) {
        match self
            .state
            .transition_when(GatewayStatus::Failed, |s| s == GatewayStatus::Started)
        {
            Ok(_) => warn!(gateway = %self.state.id, "connection failed: {}", error),
            Err(_) => debug!(gateway = %self.state.id, "ignoring fault: {}", error),
        }
    }
}

/// One configured connection
///
/// Owns the status and counters of the connection and serializes protocol
/// exchanges on it. Outbound and inbound directions can only be switched on
/// if the transport has the matching capability.
pub struct Gateway {
    state: Arc<GatewayState>,
    transport: Arc<dyn Transport>,
    outbound: AtomicBool,
    inbound: AtomicBool,
    auto_restart: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    exchange: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("id", &self.state.id)
            .field("kind", &self.transport.kind())
            .field("status", &self.status())
            .finish()
    }
}

impl Gateway {
    /// Create a connection; directions default to what the transport supports
    pub fn new(id: impl Into<String>, transport: impl Transport + 'static) -> Self {
        Self::from_arc(id, Arc::new(transport))
    }

    pub fn from_arc(id: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let capabilities = transport.capabilities();
        Gateway {
            state: Arc::new(GatewayState {
                id: ConnectionId::new(id),
                status: RwLock::new(GatewayStatus::Stopped),
                inbound: AtomicU64::new(0),
                outbound: AtomicU64::new(0),
                restarts: AtomicU64::new(0),
                notifier: OnceLock::new(),
            }),
            transport,
            outbound: AtomicBool::new(capabilities.contains(Capabilities::SEND)),
            inbound: AtomicBool::new(capabilities.contains(Capabilities::RECEIVE)),
            auto_restart: AtomicBool::new(true),
            lifecycle: tokio::sync::Mutex::new(()),
            exchange: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_auto_restart(self, enabled: bool) -> Self {
        self.auto_restart.store(enabled, Ordering::Relaxed);
        self
    }

    pub fn id(&self) -> &ConnectionId {
        &self.state.id
    }

    pub fn kind(&self) -> &'static str {
        self.transport.kind()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.transport.capabilities()
    }

    pub fn status(&self) -> GatewayStatus {
        self.state.status()
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound.load(Ordering::Relaxed)
    }

    pub fn is_inbound(&self) -> bool {
        self.inbound.load(Ordering::Relaxed)
    }

    pub fn auto_restart(&self) -> bool {
        self.auto_restart.load(Ordering::Relaxed)
    }

    pub fn set_outbound(&self, enabled: bool) -> SmsResult<()> {
        self.set_direction(&self.outbound, Capabilities::SEND, enabled)
    }

    pub fn set_inbound(&self, enabled: bool) -> SmsResult<()> {
        self.set_direction(&self.inbound, Capabilities::RECEIVE, enabled)
    }

    fn set_direction(
        &self,
        flag: &AtomicBool,
        required: Capabilities,
        enabled: bool,
    ) -> SmsResult<()> {
        if enabled && !self.capabilities().contains(required) {
            return Err(SmsError::NotSupported(self.kind()));
        }
        flag.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            inbound: self.state.inbound.load(Ordering::Relaxed),
            outbound: self.state.outbound.load(Ordering::Relaxed),
            restarts: self.state.restarts.load(Ordering::Relaxed),
        }
    }

    /// Attach the notification queue; a connection belongs to one service only
    pub(crate) fn attach(&self, notifier: Notifier) -> SmsResult<()> {
        self.state.notifier.set(notifier).map_err(|_| {
            SmsError::InvalidState(format!("gateway {} is already registered", self.id()))
        })
    }

    fn link(&self) -> GatewayLink {
        GatewayLink {
            state: Arc::clone(&self.state),
        }
    }

    /// Start the connection: Stopped|Restart → Starting → Started, or → Failed
    pub async fn start(&self) -> SmsResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status() == GatewayStatus::Started {
            return Ok(());
        }
        self.start_locked().await
    }

    async fn start_locked(&self) -> SmsResult<()> {
        self.state.transition(GatewayStatus::Starting)?;
        info!(gateway = %self.id(), kind = self.kind(), "starting");

        match self.transport.start(self.link()).await {
            Ok(()) => {
                self.state.transition(GatewayStatus::Started)?;
                info!(gateway = %self.id(), "started");
                Ok(())
            }
            Err(e) => {
                warn!(gateway = %self.id(), "start failed: {}", e);
                self.state.transition(GatewayStatus::Failed)?;
                Err(e)
            }
        }
    }

    /// Stop the connection; it ends up `Stopped` whatever teardown reports
    pub async fn stop(&self) -> SmsResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status() == GatewayStatus::Stopped {
            return Ok(());
        }
        self.state.transition(GatewayStatus::Stopping)?;
        info!(gateway = %self.id(), "stopping");

        let result = self.transport.stop().await;
        if let Err(e) = &result {
            warn!(gateway = %self.id(), "teardown failed: {}", e);
        }
        self.state.transition(GatewayStatus::Stopped)?;
        info!(gateway = %self.id(), "stopped");
        result
    }

    /// Failed → Restart → Starting; returns false when there was nothing to restart
    pub async fn restart(&self) -> SmsResult<bool> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.status() != GatewayStatus::Failed {
            return Ok(false);
        }
        self.state.transition(GatewayStatus::Restart)?;
        let restarts = self.state.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        info!(gateway = %self.id(), restarts, "restarting");

        // Release whatever the failed session still holds
        if let Err(e) = self.transport.stop().await {
            debug!(gateway = %self.id(), "cleanup before restart: {}", e);
        }
        self.start_locked().await.map(|()| true)
    }

    /// Send through this connection under its exchange lock
    ///
    /// Records the outcome on the message. A channel failure moves the
    /// connection to `Failed`; a plain rejection only fails the message.
    pub async fn send(&self, message: &mut OutboundMessage) -> SmsResult<()> {
        let result = self.send_inner(message).await;
        match &result {
            Ok(()) => {
                self.state.outbound.fetch_add(1, Ordering::Relaxed);
                message.mark_sent(self.id().clone());
                debug!(gateway = %self.id(), message = message.id(), "message sent");
            }
            Err(e) => {
                message.mark_failed(e.failure_cause());
                warn!(gateway = %self.id(), message = message.id(), "send failed: {}", e);
                self.fail_on_link_error(e);
            }
        }
        result
    }

    async fn send_inner(&self, message: &mut OutboundMessage) -> SmsResult<()> {
        self.ensure_started()?;
        let _exchange = self.exchange.lock().await;
        self.transport.send(message).await
    }

    /// Read stored messages; timeouts and I/O errors fail the connection
    pub async fn read_messages(&self, class: MessageClass) -> SmsResult<Vec<InboundMessage>> {
        self.ensure_started()?;
        let result = {
            let _exchange = self.exchange.lock().await;
            self.transport.read_messages(class).await
        };
        match result {
            Ok(messages) => {
                self.state
                    .inbound
                    .fetch_add(messages.len() as u64, Ordering::Relaxed);
                Ok(messages)
            }
            Err(e) => {
                self.fail_on_link_error(&e);
                Err(e)
            }
        }
    }

    pub async fn delete_message(&self, message: &InboundMessage) -> SmsResult<()> {
        self.ensure_started()?;
        let result = {
            let _exchange = self.exchange.lock().await;
            self.transport.delete_message(message).await
        };
        if let Err(e) = &result {
            self.fail_on_link_error(e);
        }
        result
    }

    fn ensure_started(&self) -> SmsResult<()> {
        match self.status() {
            GatewayStatus::Started => Ok(()),
            other => Err(SmsError::InvalidState(format!(
                "gateway {} is {other}",
                self.id()
            ))),
        }
    }

    fn fail_on_link_error(&self, error: &SmsError) {
        if error.is_link_failure() {
            self.link().report_failure(error);
        }
    }
}
