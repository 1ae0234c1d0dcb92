// ABOUTME: GSM modem transport: AT command driver behind the Transport trait
// ABOUTME: A monitor task turns unsolicited codes into inbound notifications and probes the link

mod channel;
mod dialect;
mod handler;
pub mod parse;
mod pdu;
#[cfg(test)]
pub(crate) mod testing;

pub use channel::{
    AsyncStream, AtChannel, AtError, AtResponse, ModemPort, SimState, TcpModemPort, Terminal,
    UnsolicitedEvent,
};
pub use dialect::Dialect;
pub use handler::{AtHandler, Protocol, Submission};
pub use pdu::{DecodedPdu, PduCodec, PduPart};

use crate::error::{SmsError, SmsResult};
use crate::gateway::{Capabilities, ConnectionId, GatewayLink, Transport};
use crate::keepalive::{KeepAliveConfig, KeepAliveManager};
use crate::message::{InboundKind, InboundMessage, MessageClass, OutboundMessage, Payload, split_text};
use crate::settings::Settings;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, info, warn};

/// Per-modem configuration
#[derive(Clone)]
pub struct ModemConfig {
    pub dialect: Dialect,
    pub protocol: Protocol,
    pub sim_pin: Option<String>,
    pub sim_pin2: Option<String>,
    /// SMSC address handed to the PDU codec; `None` uses the SIM default
    pub smsc: Option<String>,
    /// Storage codes such as `"SMME"`; detected with `AT+CPMS=?` when unset
    pub storage_locations: Option<String>,
    /// Extra command run right after the reset, e.g. `AT+CSMS=1`
    pub init_string: Option<String>,
    pub settings: Arc<Settings>,
    /// Liveness probe; defaults to one `AT` every `keepalive_interval`
    pub keepalive: Option<KeepAliveConfig>,
    pub codec: Option<Arc<dyn PduCodec>>,
}

impl Default for ModemConfig {
    fn default() -> Self {
        ModemConfig {
            dialect: Dialect::default(),
            protocol: Protocol::default(),
            sim_pin: None,
            sim_pin2: None,
            smsc: None,
            storage_locations: None,
            init_string: None,
            settings: Arc::new(Settings::default()),
            keepalive: None,
            codec: None,
        }
    }
}

impl fmt::Debug for ModemConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModemConfig")
            .field("dialect", &self.dialect)
            .field("protocol", &self.protocol)
            .field("smsc", &self.smsc)
            .field("storage_locations", &self.storage_locations)
            .field("init_string", &self.init_string)
            .field("codec", &self.codec.is_some())
            .finish_non_exhaustive()
    }
}

impl ModemConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_sim_pin(mut self, pin: impl Into<String>) -> Self {
        self.sim_pin = Some(pin.into());
        self
    }

    pub fn with_sim_pin2(mut self, pin2: impl Into<String>) -> Self {
        self.sim_pin2 = Some(pin2.into());
        self
    }

    pub fn with_smsc(mut self, smsc: impl Into<String>) -> Self {
        self.smsc = Some(smsc.into());
        self
    }

    pub fn with_storage_locations(mut self, locations: impl Into<String>) -> Self {
        self.storage_locations = Some(locations.into());
        self
    }

    pub fn with_init_string(mut self, init: impl Into<String>) -> Self {
        self.init_string = Some(init.into());
        self
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = Arc::new(settings);
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepAliveConfig) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    pub fn with_pdu_codec(mut self, codec: impl PduCodec + 'static) -> Self {
        self.codec = Some(Arc::new(codec));
        self
    }

    fn keepalive_config(&self) -> KeepAliveConfig {
        self.keepalive.clone().unwrap_or_else(|| {
            KeepAliveConfig::new(self.settings.keepalive_interval)
                .with_timeout(self.settings.serial_timeout)
                .with_max_failures(1)
        })
    }
}

struct Session {
    handler: Arc<Mutex<AtHandler>>,
    link: GatewayLink,
    shutdown: watch::Sender<bool>,
    monitor: JoinHandle<()>,
}

/// GSM modem reachable through a [`ModemPort`]
pub struct ModemTransport {
    port: Arc<dyn ModemPort>,
    config: ModemConfig,
    session: Mutex<Option<Session>>,
    multipart_reference: AtomicU16,
}

impl fmt::Debug for ModemTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModemTransport")
            .field("port", &self.port.describe())
            .field("config", &self.config)
            .finish()
    }
}

impl ModemTransport {
    pub fn new(port: impl ModemPort + 'static, config: ModemConfig) -> Self {
        ModemTransport {
            port: Arc::new(port),
            config,
            session: Mutex::new(None),
            multipart_reference: AtomicU16::new(0),
        }
    }

    /// Modem on a TCP terminal server
    pub fn tcp(address: impl Into<String>, config: ModemConfig) -> Self {
        Self::new(TcpModemPort::new(address), config)
    }

    pub fn config(&self) -> &ModemConfig {
        &self.config
    }

    async fn handler(&self) -> SmsResult<(Arc<Mutex<AtHandler>>, ConnectionId)> {
        let session = self.session.lock().await;
        let session = session
            .as_ref()
            .ok_or_else(|| SmsError::InvalidState("modem is not connected".to_string()))?;
        Ok((Arc::clone(&session.handler), session.link.gateway_id().clone()))
    }

    fn codec(&self) -> SmsResult<&Arc<dyn PduCodec>> {
        self.config
            .codec
            .as_ref()
            .ok_or_else(|| SmsError::Config("PDU protocol needs a PDU codec".to_string()))
    }

    /// Bring the modem from power-on to ready; returns whether indications are on
    async fn initialize(&self, at: &mut AtHandler) -> SmsResult<bool> {
        let config = &self.config;
        at.reset().await?;
        at.sync().await?;
        at.echo_off().await?;
        if let Some(init) = &config.init_string {
            at.send_custom(init).await?;
            at.echo_off().await?;
        }
        at.unlock_sim(config.sim_pin.as_deref(), config.sim_pin2.as_deref())
            .await?;
        at.echo_off().await?;
        at.init().await?;
        at.echo_off().await?;

        if !at.wait_for_network_registration().await? {
            warn!("network registration check failed, proceeding with defaults");
        }
        at.set_verbose_errors().await?;

        if at.storage_locations().is_empty() {
            if let Err(e) = at.read_storage_locations().await {
                if e.is_link_failure() {
                    return Err(e);
                }
                warn!("storage detection failed, staying on the default storage: {}", e);
                at.set_storage_locations("--");
            }
        }

        let indications = at.set_indications().await?;
        let accepted = match config.protocol {
            Protocol::Pdu => at.set_pdu_protocol().await?,
            Protocol::Text => at.set_text_protocol().await?,
        };
        if !accepted {
            return Err(SmsError::rejected(format!(
                "the modem does not support the {:?} protocol",
                config.protocol
            )));
        }

        let signal = at.signal_level().await?;
        info!(
            dialect = %at.dialect(),
            storages = at.storage_locations(),
            indications,
            "modem ready, {}",
            signal.lines().map(str::trim).find(|l| l.starts_with("+CSQ")).unwrap_or("no signal report")
        );
        Ok(indications)
    }
}

#[async_trait]
impl Transport for ModemTransport {
    fn kind(&self) -> &'static str {
        "modem"
    }

    fn capabilities(&self) -> Capabilities {
        let text = Capabilities::SEND | Capabilities::RECEIVE | Capabilities::BIG_MESSAGES;
        match self.config.protocol {
            Protocol::Text => text,
            Protocol::Pdu => {
                text | Capabilities::WAP_SI
                    | Capabilities::PORT_ADDRESSING
                    | Capabilities::FLASH_SMS
                    | Capabilities::DELIVERY_REPORTS
            }
        }
    }

    async fn start(&self, link: GatewayLink) -> SmsResult<()> {
        if self.config.protocol == Protocol::Pdu {
            self.codec()?;
        }
        if self.session.lock().await.is_some() {
            self.stop().await?;
        }

        let stream = self.port.open().await?;
        info!(gateway = %link.gateway_id(), port = %self.port.describe(), "modem port open");
        let channel = AtChannel::new(
            link.gateway_id().to_string(),
            stream,
            Arc::clone(&self.config.settings),
        )?;
        let mut at = AtHandler::new(channel, self.config.dialect, self.config.protocol);
        if let Some(locations) = &self.config.storage_locations {
            at.set_storage_locations(locations.as_str());
        }

        let indications = match self.initialize(&mut at).await {
            Ok(indications) => indications,
            Err(e) => {
                let _ = at.close().await;
                return Err(e);
            }
        };

        let handler = Arc::new(Mutex::new(at));
        let (shutdown, signal) = watch::channel(false);
        let monitor = Monitor {
            handler: Arc::clone(&handler),
            link: link.clone(),
            settings: Arc::clone(&self.config.settings),
            codec: self.config.codec.clone(),
            polling: !indications,
            keepalive: KeepAliveManager::new(self.config.keepalive_config()),
        };
        let monitor = tokio::spawn(monitor.run(signal));

        *self.session.lock().await = Some(Session {
            handler,
            link,
            shutdown,
            monitor,
        });
        Ok(())
    }

    async fn stop(&self) -> SmsResult<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        let _ = session.shutdown.send(true);
        if let Err(e) = session.monitor.await {
            warn!(gateway = %session.link.gateway_id(), "modem monitor ended abnormally: {}", e);
        }

        let mut at = session.handler.lock().await;
        if let Err(e) = at.done().await {
            debug!(gateway = %session.link.gateway_id(), "power down skipped: {}", e);
        }
        if let Err(e) = at.close().await {
            debug!(gateway = %session.link.gateway_id(), "close: {}", e);
        }
        info!(gateway = %session.link.gateway_id(), "modem disconnected");
        Ok(())
    }

    async fn send(&self, message: &mut OutboundMessage) -> SmsResult<()> {
        let (handler, _) = self.handler().await?;
        let mut at = handler.lock().await;

        let reference = match self.config.protocol {
            Protocol::Text => {
                let Payload::Text(text) = message.payload() else {
                    return Err(SmsError::InvalidData(
                        "binary payloads need the PDU protocol".to_string(),
                    ));
                };
                let mut reference = None;
                for part in split_text(text, message.encoding()) {
                    reference = at
                        .send_message(Submission::Text {
                            recipient: message.recipient(),
                            body: &part,
                        })
                        .await?;
                }
                reference
            }
            Protocol::Pdu => {
                let codec = self.codec()?;
                let concatenation = self.multipart_reference.fetch_add(1, Ordering::Relaxed);
                let parts =
                    codec.encode_submit(message, self.config.smsc.as_deref(), concatenation)?;
                if parts.len() > 1 {
                    at.keep_link_open().await?;
                }
                let mut reference = None;
                for part in &parts {
                    reference = at.send_message(Submission::Pdu(part)).await?;
                }
                reference
            }
        };

        if let Some(reference) = reference {
            message.set_reference(reference.to_string());
        }
        Ok(())
    }

    async fn read_messages(&self, class: MessageClass) -> SmsResult<Vec<InboundMessage>> {
        let (handler, gateway) = self.handler().await?;
        let mut at = handler.lock().await;
        read_stored(&mut at, class, &gateway, self.config.codec.as_deref()).await
    }

    async fn delete_message(&self, message: &InboundMessage) -> SmsResult<()> {
        let (Some(index), Some(location)) = (message.memory_index, message.memory_location.as_deref())
        else {
            return Err(SmsError::InvalidData(
                "message has no modem storage position".to_string(),
            ));
        };
        let (handler, _) = self.handler().await?;
        let mut at = handler.lock().await;
        if !at.delete_message(index, location).await? {
            return Err(SmsError::rejected(format!(
                "modem refused to delete {location}:{index}"
            )));
        }
        Ok(())
    }
}

/// List every storage and turn the listings into messages
async fn read_stored(
    at: &mut AtHandler,
    class: MessageClass,
    gateway: &ConnectionId,
    codec: Option<&dyn PduCodec>,
) -> SmsResult<Vec<InboundMessage>> {
    let mut messages = Vec::new();
    for location in at.storages() {
        if !at.switch_storage_location(&location).await? {
            debug!(gateway = %gateway, "storage {} not selectable", location);
            continue;
        }
        let listing = at.list_messages(class).await?;
        match (at.protocol(), codec) {
            (Protocol::Text, _) => {
                messages.extend(parse::parse_text_listing(&listing, gateway, &location));
            }
            (Protocol::Pdu, Some(codec)) => {
                for listed in parse::parse_pdu_listing(&listing) {
                    match codec.decode_deliver(&listed.hex) {
                        Ok(decoded) => {
                            let mut message = inbound_from_pdu(decoded, gateway);
                            message.class = listed.class;
                            message.memory_index = Some(listed.index);
                            message.memory_location = Some(location.clone());
                            messages.push(message);
                        }
                        Err(e) => warn!(gateway = %gateway, index = listed.index, "undecodable PDU: {}", e),
                    }
                }
            }
            (Protocol::Pdu, None) => {
                return Err(SmsError::Config("PDU protocol needs a PDU codec".to_string()));
            }
        }
    }
    Ok(messages)
}

fn inbound_from_pdu(decoded: DecodedPdu, gateway: &ConnectionId) -> InboundMessage {
    match decoded {
        DecodedPdu::Sms {
            originator,
            payload,
            timestamp,
        } => {
            let mut message = InboundMessage::new(gateway.clone(), originator, payload);
            if let Some(at) = timestamp {
                message.received_at = at;
            }
            message
        }
        DecodedPdu::StatusReport {
            recipient,
            reference,
            status,
            discharged,
        } => {
            let mut report =
                InboundMessage::new(gateway.clone(), recipient, Payload::Text(status.to_string()));
            report.kind = InboundKind::StatusReport;
            report.provider_id = Some(reference.to_string());
            if let Some(at) = discharged {
                report.received_at = at;
            }
            report
        }
    }
}

/// Background task of a started modem
struct Monitor {
    handler: Arc<Mutex<AtHandler>>,
    link: GatewayLink,
    settings: Arc<Settings>,
    codec: Option<Arc<dyn PduCodec>>,
    /// Inbound is found by listing instead of `+CMTI`
    polling: bool,
    keepalive: KeepAliveManager,
}

fn period(duration: Duration) -> Duration {
    duration.max(Duration::from_millis(1))
}

impl Monitor {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut events = interval(period(self.settings.serial_polling_interval));
        let poll_every = period(self.settings.polling_interval);
        let mut poll = interval_at(Instant::now() + poll_every, poll_every);
        let probe_every = period(self.keepalive.interval());
        let mut probe = interval_at(Instant::now() + probe_every, probe_every);
        for ticker in [&mut events, &mut poll, &mut probe] {
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        loop {
            let result = tokio::select! {
                _ = shutdown.changed() => break,
                _ = events.tick() => self.process_events().await,
                _ = poll.tick(), if self.polling => self.deliver(MessageClass::Unread).await,
                _ = probe.tick() => self.probe().await,
            };
            if let Err(e) = result {
                if e.is_link_failure() {
                    self.link.report_failure(&e);
                    break;
                }
                warn!(gateway = %self.link.gateway_id(), "modem monitor: {}", e);
            }
        }
        debug!(gateway = %self.link.gateway_id(), "modem monitor stopped");
    }

    /// Pick up unsolicited codes; skipped while a command holds the modem
    async fn process_events(&mut self) -> SmsResult<()> {
        let events = {
            let Ok(mut at) = self.handler.try_lock() else {
                return Ok(());
            };
            let mut events = at.take_events();
            events.extend(at.poll_events().await?);
            events
        };

        let mut read_inbox = false;
        for event in events {
            match event {
                UnsolicitedEvent::MessageIndication { storage, index }
                | UnsolicitedEvent::StatusReportIndication { storage, index } => {
                    debug!(gateway = %self.link.gateway_id(), storage, index, "new message indication");
                    read_inbox = true;
                }
                UnsolicitedEvent::CallerId(caller) => self.link.call_received(caller),
                UnsolicitedEvent::Ring => debug!(gateway = %self.link.gateway_id(), "ring"),
            }
        }
        if read_inbox {
            self.deliver(MessageClass::Unread).await?;
        }
        Ok(())
    }

    async fn deliver(&mut self, class: MessageClass) -> SmsResult<()> {
        let messages = {
            let mut at = self.handler.lock().await;
            read_stored(&mut at, class, self.link.gateway_id(), self.codec.as_deref()).await?
        };
        for message in messages {
            self.link.message_received(message);
        }
        Ok(())
    }

    async fn probe(&mut self) -> SmsResult<()> {
        if !self.keepalive.should_probe() {
            return Ok(());
        }
        // A command in progress proves the line is alive
        let Ok(mut at) = self.handler.try_lock() else {
            self.keepalive.reset_failures();
            return Ok(());
        };
        self.keepalive.on_probe_sent();
        match at.is_alive().await {
            Ok(true) => {
                self.keepalive.on_probe_success();
                Ok(())
            }
            Ok(false) => {
                self.keepalive.on_probe_failure();
                if self.keepalive.is_link_dead() {
                    self.report_dead_link();
                    return Err(SmsError::Timeout);
                }
                Ok(())
            }
            Err(e) if e.is_link_failure() => {
                self.keepalive.on_probe_failure();
                if self.keepalive.is_link_dead() {
                    self.report_dead_link();
                    return Err(e);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn report_dead_link(&self) {
        let status = self.keepalive.status();
        warn!(
            gateway = %self.link.gateway_id(),
            failures = status.consecutive_failures,
            probes = status.total_probes,
            answers = status.total_answers,
            "modem stopped answering AT probes"
        );
    }
}
