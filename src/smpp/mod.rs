// ABOUTME: SMPP v3.4 transceiver transport: bind, submit_sm, deliver_sm, enquire_link and unbind
// ABOUTME: A reader task routes responses by sequence number and answers SMSC-originated requests

mod codec;
mod connection;
mod pdu;

pub use codec::{CodecError, CommandId, CommandStatus, PduHeader};
pub use connection::{FrameReader, FrameWriter};
pub use pdu::{
    DeliveryReceiptText, ESM_DELIVERY_RECEIPT, ESM_UDHI, Frame, Pdu, ShortMessage,
    relative_validity,
};

use crate::error::{SmsError, SmsResult};
use crate::gateway::{Capabilities, ConnectionId, GatewayLink, Transport};
use crate::keepalive::{KeepAliveConfig, KeepAliveManager};
use crate::message::{InboundKind, InboundMessage, MessageEncoding, OutboundMessage, Payload};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, timeout};
use tracing::{debug, info, warn};

const DC_DEFAULT: u8 = 0x00;
const DC_BINARY: u8 = 0x04;
const DC_UCS2: u8 = 0x08;
/// Message class 0 bit for the general data coding group
const DC_FLASH: u8 = 0x10;

const SINGLE_PART: usize = 140;
const MULTI_PART: usize = 134;

/// Connection settings for one SMPP account
#[derive(Clone)]
pub struct SmppConfig {
    /// `host:port` of the SMSC
    pub address: String,
    pub system_id: String,
    pub password: String,
    pub system_type: String,
    /// Originator used when a message carries none
    pub source_addr: String,
    pub source_ton: u8,
    pub source_npi: u8,
    pub dest_ton: u8,
    pub dest_npi: u8,
    pub connect_timeout: Duration,
    /// Wait for any response PDU, bind included
    pub response_timeout: Duration,
    pub keepalive: KeepAliveConfig,
}

impl fmt::Debug for SmppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmppConfig")
            .field("address", &self.address)
            .field("system_id", &self.system_id)
            .field("system_type", &self.system_type)
            .field("source_addr", &self.source_addr)
            .field("response_timeout", &self.response_timeout)
            .field("keepalive", &self.keepalive)
            .finish_non_exhaustive()
    }
}

impl SmppConfig {
    pub fn new(
        address: impl Into<String>,
        system_id: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        SmppConfig {
            address: address.into(),
            system_id: system_id.into(),
            password: password.into(),
            system_type: String::new(),
            source_addr: String::new(),
            source_ton: 1,
            source_npi: 1,
            dest_ton: 1,
            dest_npi: 1,
            connect_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(10),
            keepalive: KeepAliveConfig::default(),
        }
    }

    pub fn with_system_type(mut self, system_type: impl Into<String>) -> Self {
        self.system_type = system_type.into();
        self
    }

    /// Default originator, with TON/NPI
    pub fn with_source(mut self, addr: impl Into<String>, ton: u8, npi: u8) -> Self {
        self.source_addr = addr.into();
        self.source_ton = ton;
        self.source_npi = npi;
        self
    }

    pub fn with_destination_numbering(mut self, ton: u8, npi: u8) -> Self {
        self.dest_ton = ton;
        self.dest_npi = npi;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = keepalive;
        self
    }
}

type Pending = StdMutex<HashMap<u32, oneshot::Sender<Frame>>>;

/// State shared by requesters, the reader task and the keep-alive task
struct Shared {
    gateway: ConnectionId,
    writer: Mutex<FrameWriter<OwnedWriteHalf>>,
    pending: Pending,
    sequence: AtomicU32,
    response_timeout: Duration,
}

impl Shared {
    /// Sequence numbers run 1..=0x7FFFFFFF and wrap
    fn next_sequence(&self) -> u32 {
        let next = self.sequence.fetch_add(1, Ordering::Relaxed) % 0x7FFF_FFFF;
        next + 1
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u32, oneshot::Sender<Frame>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn write(&self, frame: &Frame) -> SmsResult<()> {
        debug!(
            gateway = %self.gateway,
            sequence = frame.sequence_number,
            command = ?frame.command_id(),
            "SEND"
        );
        self.writer.lock().await.write_frame(frame).await?;
        Ok(())
    }

    /// Send a request and wait for the response with the same sequence number
    ///
    /// A non-zero command_status comes back as [`SmsError::Smpp`].
    async fn request(&self, pdu: Pdu) -> SmsResult<Frame> {
        let sequence = self.next_sequence();
        let (tx, rx) = oneshot::channel();
        self.pending().insert(sequence, tx);

        if let Err(e) = self.write(&Frame::request(sequence, pdu)).await {
            self.pending().remove(&sequence);
            return Err(e);
        }

        let response = match timeout(self.response_timeout, rx).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(_)) => return Err(SmsError::ConnectionClosed),
            Err(_) => {
                self.pending().remove(&sequence);
                return Err(SmsError::Timeout);
            }
        };
        match response.command_status {
            CommandStatus::Ok => Ok(response),
            status => Err(SmsError::Smpp(status)),
        }
    }
}

struct Session {
    shared: Arc<Shared>,
    link: GatewayLink,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// SMPP transceiver bind
pub struct SmppTransport {
    config: SmppConfig,
    session: Mutex<Option<Session>>,
    concatenation: AtomicU8,
}

impl fmt::Debug for SmppTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmppTransport")
            .field("config", &self.config)
            .finish()
    }
}

impl SmppTransport {
    pub fn new(config: SmppConfig) -> Self {
        SmppTransport {
            config,
            session: Mutex::new(None),
            concatenation: AtomicU8::new(0),
        }
    }

    pub fn config(&self) -> &SmppConfig {
        &self.config
    }

    async fn shared(&self) -> SmsResult<Arc<Shared>> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.shared))
            .ok_or_else(|| SmsError::InvalidState("SMPP session is not bound".to_string()))
    }

    /// Build the submit_sm bodies for a message, one per part
    fn submissions(&self, message: &OutboundMessage) -> SmsResult<Vec<ShortMessage>> {
        let (mut data_coding, body) = encode_payload(message);
        if message.is_flash() {
            data_coding |= DC_FLASH;
        }
        let reference = self.concatenation.fetch_add(1, Ordering::Relaxed);
        let parts = segment(&body, reference)?;

        let source_addr = message
            .originator()
            .unwrap_or(self.config.source_addr.as_str())
            .to_string();
        let validity_period = message
            .validity_minutes()
            .map(relative_validity)
            .unwrap_or_default();

        Ok(parts
            .into_iter()
            .map(|(esm_class, short_message)| ShortMessage {
                source_addr_ton: self.config.source_ton,
                source_addr_npi: self.config.source_npi,
                source_addr: source_addr.clone(),
                dest_addr_ton: self.config.dest_ton,
                dest_addr_npi: self.config.dest_npi,
                destination_addr: message.recipient().to_string(),
                esm_class,
                priority_flag: message.priority().min(3),
                validity_period: validity_period.clone(),
                registered_delivery: u8::from(message.wants_status_report()),
                data_coding,
                short_message,
                ..Default::default()
            })
            .collect())
    }
}

fn encode_payload(message: &OutboundMessage) -> (u8, Vec<u8>) {
    match message.payload() {
        Payload::Binary(data) => (DC_BINARY, data.to_vec()),
        Payload::Text(text) => match message.encoding() {
            MessageEncoding::Ucs2 => (
                DC_UCS2,
                text.encode_utf16().flat_map(u16::to_be_bytes).collect(),
            ),
            // Latin-1 octets; characters outside it become '?'
            _ => (
                DC_DEFAULT,
                text.chars()
                    .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                    .collect(),
            ),
        },
    }
}

/// Split a body into (esm_class, short_message) parts with a concatenation UDH
fn segment(body: &[u8], reference: u8) -> SmsResult<Vec<(u8, Bytes)>> {
    if body.len() <= SINGLE_PART {
        return Ok(vec![(0, Bytes::copy_from_slice(body))]);
    }
    let chunks: Vec<&[u8]> = body.chunks(MULTI_PART).collect();
    let total = u8::try_from(chunks.len()).map_err(|_| {
        SmsError::InvalidData(format!("message needs {} parts, at most 255", chunks.len()))
    })?;
    Ok(chunks
        .into_iter()
        .zip(1..=total)
        .map(|(chunk, index)| {
            let mut part = Vec::with_capacity(6 + chunk.len());
            part.extend_from_slice(&[0x05, 0x00, 0x03, reference, total, index]);
            part.extend_from_slice(chunk);
            (ESM_UDHI, Bytes::from(part))
        })
        .collect())
}

fn decode_short_message(sm: &ShortMessage) -> Payload {
    let mut body = &sm.short_message[..];
    if sm.esm_class & ESM_UDHI != 0 {
        let header = body.first().map(|len| *len as usize + 1).unwrap_or(0);
        body = body.get(header..).unwrap_or_default();
    }
    match sm.data_coding & !DC_FLASH {
        DC_UCS2 => {
            let units = body.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]]));
            Payload::Text(
                char::decode_utf16(units)
                    .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect(),
            )
        }
        DC_BINARY | 0x02 => Payload::Binary(Bytes::copy_from_slice(body)),
        _ => Payload::Text(body.iter().map(|b| char::from(*b)).collect()),
    }
}

fn inbound_from_deliver(sm: &ShortMessage, gateway: &ConnectionId) -> InboundMessage {
    let payload = decode_short_message(sm);
    if sm.esm_class & ESM_DELIVERY_RECEIPT != 0 {
        let text = payload.as_text();
        let receipt = DeliveryReceiptText::parse(&text);
        let mut report = InboundMessage::new(
            gateway.clone(),
            sm.source_addr.clone(),
            Payload::Text(
                receipt
                    .as_ref()
                    .map(|r| r.state.clone())
                    .unwrap_or_else(|| text.clone()),
            ),
        );
        report.kind = InboundKind::StatusReport;
        report.provider_id = receipt.map(|r| r.message_id);
        return report;
    }
    InboundMessage::new(gateway.clone(), sm.source_addr.clone(), payload)
}

/// Dispatch one frame from the SMSC; returns false when the session is over
async fn handle_frame(shared: &Shared, link: &GatewayLink, frame: Frame) -> SmsResult<bool> {
    let sequence = frame.sequence_number;
    debug!(
        gateway = %shared.gateway,
        sequence,
        command = ?frame.command_id(),
        status = ?frame.command_status,
        "RECV"
    );

    if frame.command_id().is_response() {
        match shared.pending().remove(&sequence) {
            Some(waiter) => {
                let _ = waiter.send(frame);
            }
            None => debug!(gateway = %shared.gateway, sequence, "response without a request"),
        }
        return Ok(true);
    }

    match frame.pdu {
        Pdu::DeliverSm(sm) => {
            shared
                .write(&Frame::response(sequence, CommandStatus::Ok, Pdu::DeliverSmResp))
                .await?;
            link.message_received(inbound_from_deliver(&sm, &shared.gateway));
            Ok(true)
        }
        Pdu::EnquireLink => {
            shared
                .write(&Frame::response(sequence, CommandStatus::Ok, Pdu::EnquireLinkResp))
                .await?;
            Ok(true)
        }
        Pdu::Unbind => {
            info!(gateway = %shared.gateway, "SMSC unbound the session");
            shared
                .write(&Frame::response(sequence, CommandStatus::Ok, Pdu::UnbindResp))
                .await?;
            Ok(false)
        }
        other => {
            warn!(gateway = %shared.gateway, command = ?other.command_id(), "unexpected request");
            shared
                .write(&Frame::response(
                    sequence,
                    CommandStatus::InvalidCommandId,
                    Pdu::GenericNack,
                ))
                .await?;
            Ok(true)
        }
    }
}

async fn read_loop(
    mut reader: FrameReader<OwnedReadHalf>,
    shared: Arc<Shared>,
    link: GatewayLink,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = reader.read_frame() => frame,
        };
        let outcome = match frame {
            Ok(Some(frame)) => handle_frame(&shared, &link, frame).await,
            Ok(None) => Err(SmsError::ConnectionClosed),
            Err(e) => Err(SmsError::from(e)),
        };
        match outcome {
            Ok(true) => {}
            Ok(false) => {
                link.report_failure(&SmsError::ConnectionClosed);
                break;
            }
            Err(e) => {
                link.report_failure(&e);
                break;
            }
        }
    }
    // Wake every requester still waiting
    shared.pending().clear();
    debug!(gateway = %shared.gateway, "SMPP reader stopped");
}

async fn keepalive_loop(
    shared: Arc<Shared>,
    link: GatewayLink,
    config: KeepAliveConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    if !config.enabled {
        return;
    }
    let mut manager = KeepAliveManager::new(config);
    let every = manager.interval().max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + every, every);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if !manager.should_probe() {
            continue;
        }
        manager.on_probe_sent();
        match timeout(manager.timeout(), shared.request(Pdu::EnquireLink)).await {
            Ok(Ok(_)) => manager.on_probe_success(),
            // An error status still proves the SMSC is there
            Ok(Err(SmsError::Smpp(_))) => manager.on_probe_success(),
            Ok(Err(_)) | Err(_) => manager.on_probe_failure(),
        }
        if manager.is_link_dead() {
            let status = manager.status();
            warn!(
                gateway = %link.gateway_id(),
                failures = status.consecutive_failures,
                probes = status.total_probes,
                answers = status.total_answers,
                "enquire_link unanswered, session is dead"
            );
            link.report_failure(&SmsError::Timeout);
            break;
        }
    }
}

#[async_trait]
impl Transport for SmppTransport {
    fn kind(&self) -> &'static str {
        "smpp"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SEND
            | Capabilities::RECEIVE
            | Capabilities::CUSTOM_FROM
            | Capabilities::BIG_MESSAGES
            | Capabilities::FLASH_SMS
            | Capabilities::DELIVERY_REPORTS
    }

    async fn start(&self, link: GatewayLink) -> SmsResult<()> {
        if self.session.lock().await.is_some() {
            self.stop().await?;
        }

        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect(&self.config.address),
        )
        .await
        .map_err(|_| SmsError::Timeout)??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();

        let shared = Arc::new(Shared {
            gateway: link.gateway_id().clone(),
            writer: Mutex::new(FrameWriter::new(write)),
            pending: StdMutex::new(HashMap::new()),
            sequence: AtomicU32::new(0),
            response_timeout: self.config.response_timeout,
        });
        let (shutdown, signal) = watch::channel(false);
        let reader = tokio::spawn(read_loop(
            FrameReader::new(read),
            Arc::clone(&shared),
            link.clone(),
            signal.clone(),
        ));

        let bound = shared
            .request(Pdu::BindTransceiver {
                system_id: self.config.system_id.clone(),
                password: self.config.password.clone(),
                system_type: self.config.system_type.clone(),
            })
            .await
            .and_then(|response| match response.pdu {
                Pdu::BindTransceiverResp { system_id } => Ok(system_id),
                other => Err(SmsError::InvalidData(format!(
                    "expected bind_transceiver_resp, got {:?}",
                    other.command_id()
                ))),
            });
        let smsc = match bound {
            Ok(smsc) => smsc,
            Err(e) => {
                let _ = shutdown.send(true);
                let _ = reader.await;
                let _ = shared.writer.lock().await.shutdown().await;
                return Err(e);
            }
        };
        info!(gateway = %link.gateway_id(), smsc, address = %self.config.address, "bound as transceiver");

        let keepalive = tokio::spawn(keepalive_loop(
            Arc::clone(&shared),
            link.clone(),
            self.config.keepalive.clone(),
            signal,
        ));
        *self.session.lock().await = Some(Session {
            shared,
            link,
            shutdown,
            tasks: vec![reader, keepalive],
        });
        Ok(())
    }

    async fn stop(&self) -> SmsResult<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        let gateway = session.link.gateway_id().clone();
        match session.shared.request(Pdu::Unbind).await {
            Ok(_) => debug!(gateway = %gateway, "unbound"),
            Err(e) => debug!(gateway = %gateway, "unbind skipped: {}", e),
        }

        let _ = session.shutdown.send(true);
        for task in session.tasks {
            if let Err(e) = task.await {
                warn!(gateway = %gateway, "SMPP task ended abnormally: {}", e);
            }
        }
        if let Err(e) = session.shared.writer.lock().await.shutdown().await {
            debug!(gateway = %gateway, "socket shutdown: {}", e);
        }
        info!(gateway = %gateway, "SMPP session closed");
        Ok(())
    }

    async fn send(&self, message: &mut OutboundMessage) -> SmsResult<()> {
        let shared = self.shared().await?;
        let mut message_id = None;
        for sm in self.submissions(message)? {
            let response = shared.request(Pdu::SubmitSm(Box::new(sm))).await?;
            if let Pdu::SubmitSmResp { message_id: id } = response.pdu {
                message_id = Some(id);
            }
        }
        if let Some(id) = message_id.filter(|id| !id.is_empty()) {
            message.set_reference(id);
        }
        Ok(())
    }
}
