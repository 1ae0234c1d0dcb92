// ABOUTME: Virtual in-process transport that accepts every message without a network
// ABOUTME: Used for dry runs and tests; supports scripted failures and injected inbound traffic

use crate::error::{SmsError, SmsResult};
use crate::gateway::{Capabilities, GatewayLink, Transport};
use crate::message::{InboundMessage, MessageClass, OutboundMessage, Payload};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    fail_start: AtomicBool,
    send_failures: Mutex<VecDeque<SmsError>>,
    sent: Mutex<Vec<OutboundMessage>>,
    inbox: Mutex<Vec<InboundMessage>>,
    link: Mutex<Option<GatewayLink>>,
    next_reference: AtomicU64,
    next_index: AtomicU32,
}

/// Loopback transport
///
/// Clones share state, so a test can keep one handle while the gateway
/// owns another.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    capabilities: Capabilities,
    inner: Arc<Inner>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        LoopbackTransport {
            capabilities: Capabilities::SEND
                | Capabilities::RECEIVE
                | Capabilities::CUSTOM_FROM
                | Capabilities::BIG_MESSAGES
                | Capabilities::FLASH_SMS
                | Capabilities::DELIVERY_REPORTS,
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn outbound_only(mut self) -> Self {
        self.capabilities.remove(Capabilities::RECEIVE);
        self
    }

    pub fn inbound_only(mut self) -> Self {
        self.capabilities.remove(Capabilities::SEND);
        self
    }

    /// Make the next `start` fail
    pub fn fail_next_start(&self) {
        self.inner.fail_start.store(true, Ordering::SeqCst);
    }

    /// Queue an error returned by the next `send`
    pub fn fail_next_send(&self, error: SmsError) {
        lock(&self.inner.send_failures).push_back(error);
    }

    /// Messages accepted so far
    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.inner.sent).clone()
    }

    /// Simulate an incoming SMS; returns false when the transport is not running
    pub fn inject(&self, originator: &str, text: &str) -> bool {
        let Some(link) = lock(&self.inner.link).clone() else {
            return false;
        };
        let mut message = InboundMessage::new(
            link.gateway_id().clone(),
            originator,
            Payload::Text(text.to_string()),
        );
        message.memory_location = Some("LB".to_string());
        message.memory_index = Some(self.inner.next_index.fetch_add(1, Ordering::Relaxed));

        let mut stored = message.clone();
        stored.class = MessageClass::Read;
        lock(&self.inner.inbox).push(stored);
        link.message_received(message);
        true
    }

    /// Simulate an incoming voice call
    pub fn ring(&self, caller_id: &str) -> bool {
        match lock(&self.inner.link).as_ref() {
            Some(link) => {
                link.call_received(caller_id);
                true
            }
            None => false,
        }
    }

    /// Simulate a fault detected by a background task
    pub fn break_link(&self, error: SmsError) {
        if let Some(link) = lock(&self.inner.link).as_ref() {
            link.report_failure(&error);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> &'static str {
        "loopback"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn start(&self, link: GatewayLink) -> SmsResult<()> {
        if self.inner.fail_start.swap(false, Ordering::SeqCst) {
            return Err(SmsError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "loopback start refused",
            )));
        }
        debug!(gateway = %link.gateway_id(), "loopback up");
        *lock(&self.inner.link) = Some(link);
        Ok(())
    }

    async fn stop(&self) -> SmsResult<()> {
        lock(&self.inner.link).take();
        Ok(())
    }

    async fn send(&self, message: &mut OutboundMessage) -> SmsResult<()> {
        if let Some(error) = lock(&self.inner.send_failures).pop_front() {
            return Err(error);
        }
        let reference = self.inner.next_reference.fetch_add(1, Ordering::Relaxed) + 1;
        message.set_reference(reference.to_string());
        lock(&self.inner.sent).push(message.clone());
        Ok(())
    }

    async fn read_messages(&self, class: MessageClass) -> SmsResult<Vec<InboundMessage>> {
        let inbox = lock(&self.inner.inbox);
        Ok(inbox
            .iter()
            .filter(|m| class == MessageClass::All || m.class == class)
            .cloned()
            .collect())
    }

    async fn delete_message(&self, message: &InboundMessage) -> SmsResult<()> {
        let mut inbox = lock(&self.inner.inbox);
        let before = inbox.len();
        inbox.retain(|m| m.memory_index != message.memory_index);
        if inbox.len() == before {
            return Err(SmsError::InvalidData(format!(
                "no stored message at index {:?}",
                message.memory_index
            )));
        }
        Ok(())
    }
}
