// ABOUTME: Uniform message model shared by every transport: outbound and inbound SMS
// ABOUTME: Tracks send status, failure cause and dispatch metadata, plus GSM part splitting

use crate::gateway::ConnectionId;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Target filter meaning "any outbound connection"
pub const ANY_GATEWAY: &str = "*";

/// Lifecycle of an outbound message inside the send pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageStatus {
    #[default]
    Unsent,
    Sent,
    Failed,
    Retrying,
}

/// Why an outbound message ended up `Failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    GatewayFailure,
    AuthFailure,
    BadRecipient,
    NoRoute,
    BadFormat,
    Unknown,
}

/// Encoding tag attached to a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEncoding {
    /// GSM 03.38 default alphabet, 7 bits per character
    Gsm7,
    /// UCS-2, 16 bits per character
    Ucs2,
    /// Raw 8-bit data
    Binary,
}

/// Message body: text or opaque bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// Text view of the payload; binary payloads are rendered lossily
    pub fn as_text(&self) -> String {
        match self {
            Payload::Text(text) => text.clone(),
            Payload::Binary(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match self {
            Payload::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
            Payload::Binary(bytes) => bytes.clone(),
        }
    }
}

/// Which stored messages a listing operation should return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    All,
    Unread,
    Read,
}

/// Kind of inbound message carried by a `MessageReceived` notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Sms,
    StatusReport,
}

/// Delivery receipt correlated with an already sent message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub delivered: bool,
    pub at: DateTime<Utc>,
}

/// An SMS submitted by a caller for delivery
///
/// Created by the caller and mutated only by the send pipeline. Once the
/// status is `Sent` or `Failed` the only remaining mutation is
/// [`OutboundMessage::correlate_receipt`].
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    id: u64,
    recipient: String,
    originator: Option<String>,
    payload: Payload,
    encoding: MessageEncoding,
    target: String,
    priority: u8,
    validity_minutes: i32,
    flash: bool,
    status_report: bool,
    status: MessageStatus,
    failure_cause: Option<FailureCause>,
    dispatched_at: Option<DateTime<Utc>>,
    gateway_id: Option<ConnectionId>,
    reference: Option<String>,
    retry_count: u32,
    receipt: Option<DeliveryReceipt>,
}

impl OutboundMessage {
    /// Create a text message; the encoding is picked from the characters used
    pub fn text(recipient: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let encoding = if is_gsm7(&text) {
            MessageEncoding::Gsm7
        } else {
            MessageEncoding::Ucs2
        };
        Self::with_payload(recipient.into(), Payload::Text(text), encoding)
    }

    /// Create a binary (8-bit) message
    pub fn binary(recipient: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::with_payload(
            recipient.into(),
            Payload::Binary(data.into()),
            MessageEncoding::Binary,
        )
    }

    fn with_payload(recipient: String, payload: Payload, encoding: MessageEncoding) -> Self {
        Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            recipient,
            originator: None,
            payload,
            encoding,
            target: ANY_GATEWAY.to_string(),
            priority: 0,
            validity_minutes: -1,
            flash: false,
            status_report: false,
            status: MessageStatus::Unsent,
            failure_cause: None,
            dispatched_at: None,
            gateway_id: None,
            reference: None,
            retry_count: 0,
            receipt: None,
        }
    }

    /// Restrict delivery to one connection (`"*"` means any)
    pub fn via(mut self, gateway_id: impl Into<String>) -> Self {
        self.target = gateway_id.into();
        self
    }

    pub fn from(mut self, originator: impl Into<String>) -> Self {
        self.originator = Some(originator.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.set_priority(priority);
        self
    }

    /// Validity in minutes; negative means no preference
    pub fn with_validity(mut self, minutes: i32) -> Self {
        self.validity_minutes = minutes;
        self
    }

    pub fn flash(mut self) -> Self {
        self.flash = true;
        self
    }

    pub fn with_status_report(mut self) -> Self {
        self.status_report = true;
        self
    }

    /// Priority is clamped to 0..=3
    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority.clamp(0, 3) as u8;
    }

    pub fn set_target(&mut self, gateway_id: impl Into<String>) {
        self.target = gateway_id.into();
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn originator(&self) -> Option<&str> {
        self.originator.as_deref()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn encoding(&self) -> MessageEncoding {
        self.encoding
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_wildcard(&self) -> bool {
        self.target == ANY_GATEWAY
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn validity_minutes(&self) -> Option<u32> {
        u32::try_from(self.validity_minutes).ok()
    }

    pub fn is_flash(&self) -> bool {
        self.flash
    }

    pub fn wants_status_report(&self) -> bool {
        self.status_report
    }

    pub fn status(&self) -> MessageStatus {
        self.status
    }

    pub fn failure_cause(&self) -> Option<FailureCause> {
        self.failure_cause
    }

    pub fn dispatched_at(&self) -> Option<DateTime<Utc>> {
        self.dispatched_at
    }

    pub fn gateway_id(&self) -> Option<&ConnectionId> {
        self.gateway_id.as_ref()
    }

    pub fn reference(&self) -> Option<&str> {
        self.reference.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn receipt(&self) -> Option<&DeliveryReceipt> {
        self.receipt.as_ref()
    }

    /// True once the pipeline has produced a final outcome
    pub fn is_final(&self) -> bool {
        matches!(self.status, MessageStatus::Sent | MessageStatus::Failed)
    }

    /// Number of SMS parts needed to carry the payload
    pub fn part_count(&self) -> usize {
        match &self.payload {
            Payload::Text(text) => split_text(text, self.encoding).len(),
            Payload::Binary(data) => split_binary(data).len(),
        }
    }

    /// Copy of this message carrying an encrypted binary body
    pub(crate) fn with_sealed_payload(&self, data: Bytes) -> OutboundMessage {
        OutboundMessage {
            payload: Payload::Binary(data),
            encoding: MessageEncoding::Binary,
            ..self.clone()
        }
    }

    /// Take the send outcome of a copy handed to a transport in our place
    pub(crate) fn adopt_outcome(&mut self, sent: OutboundMessage) {
        self.status = sent.status;
        self.failure_cause = sent.failure_cause;
        self.dispatched_at = sent.dispatched_at;
        self.gateway_id = sent.gateway_id;
        self.reference = sent.reference;
    }

    pub(crate) fn set_reference(&mut self, reference: impl Into<String>) {
        self.reference = Some(reference.into());
    }

    pub(crate) fn mark_sent(&mut self, gateway_id: ConnectionId) {
        self.status = MessageStatus::Sent;
        self.failure_cause = None;
        self.dispatched_at = Some(Utc::now());
        self.gateway_id = Some(gateway_id);
    }

    pub(crate) fn mark_failed(&mut self, cause: FailureCause) {
        self.status = MessageStatus::Failed;
        self.failure_cause = Some(cause);
    }

    /// Re-submit a failed message; it keeps its id and counts the attempt
    pub fn retry(&mut self) {
        if self.status == MessageStatus::Failed {
            self.status = MessageStatus::Retrying;
            self.failure_cause = None;
            self.retry_count += 1;
        }
    }

    /// Attach a delivery receipt reported later by the provider
    pub fn correlate_receipt(&mut self, delivered: bool, at: DateTime<Utc>) {
        if self.status == MessageStatus::Sent {
            self.receipt = Some(DeliveryReceipt { delivered, at });
        }
    }
}

/// A message read from a connection
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub originator: String,
    pub payload: Payload,
    pub received_at: DateTime<Utc>,
    pub class: MessageClass,
    pub kind: InboundKind,
    pub gateway_id: ConnectionId,
    /// Modem storage the message was read from, when applicable
    pub memory_location: Option<String>,
    pub memory_index: Option<u32>,
    /// Provider-side message id (SMPP, HTTP callbacks)
    pub provider_id: Option<String>,
}

impl InboundMessage {
    pub fn new(gateway_id: ConnectionId, originator: impl Into<String>, payload: Payload) -> Self {
        Self {
            originator: originator.into(),
            payload,
            received_at: Utc::now(),
            class: MessageClass::Unread,
            kind: InboundKind::Sms,
            gateway_id,
            memory_location: None,
            memory_index: None,
            provider_id: None,
        }
    }

    pub fn text(&self) -> String {
        self.payload.as_text()
    }
}

const GSM7_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";
const GSM7_EXTENDED: &str = "^{}\\[~]|€\x0c";

/// True when every character is representable in the GSM default alphabet
pub fn is_gsm7(text: &str) -> bool {
    text.chars()
        .all(|c| GSM7_BASIC.contains(c) || GSM7_EXTENDED.contains(c))
}

fn septets(c: char) -> usize {
    if GSM7_EXTENDED.contains(c) { 2 } else { 1 }
}

/// Split text into SMS parts: 160/153 septets for GSM-7, 70/67 characters
/// for UCS-2. A message that fits in one part is returned unchanged.
pub fn split_text(text: &str, encoding: MessageEncoding) -> Vec<String> {
    let (single, multi) = match encoding {
        MessageEncoding::Gsm7 => (160, 153),
        MessageEncoding::Ucs2 => (70, 67),
        MessageEncoding::Binary => (140, 134),
    };
    let weight = |c: char| match encoding {
        MessageEncoding::Gsm7 => septets(c),
        MessageEncoding::Ucs2 => 1,
        MessageEncoding::Binary => c.len_utf8(),
    };

    let total: usize = text.chars().map(weight).sum();
    if total <= single {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut used = 0;
    for c in text.chars() {
        let w = weight(c);
        if used + w > multi {
            parts.push(std::mem::take(&mut current));
            used = 0;
        }
        current.push(c);
        used += w;
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Split binary data into 140/134 byte parts
pub fn split_binary(data: &[u8]) -> Vec<Bytes> {
    if data.len() <= 140 {
        return vec![Bytes::copy_from_slice(data)];
    }
    data.chunks(134).map(Bytes::copy_from_slice).collect()
}
