// ABOUTME: AT command driver: every high level modem operation as a sequence of channel exchanges
// ABOUTME: Vendor quirks are selected by the Dialect instead of per-vendor handler types

use super::channel::{AtChannel, AtResponse, Terminal, UnsolicitedEvent};
use super::dialect::Dialect;
use super::parse;
use super::pdu::PduPart;
use crate::error::{SmsError, SmsResult};
use crate::message::MessageClass;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const CTRL_Z: char = '\u{1a}';
const CNMI_ATTEMPTS: u32 = 3;
const SIM_CHECKS: u32 = 20;
const NETWORK_SEARCH_ATTEMPTS: u32 = 6;

/// Message format the modem is switched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Text,
    Pdu,
}

/// One `AT+CMGS` submission
#[derive(Debug, Clone, Copy)]
pub enum Submission<'a> {
    Text { recipient: &'a str, body: &'a str },
    Pdu(&'a PduPart),
}

/// High level AT operations for one modem
#[derive(Debug)]
pub struct AtHandler {
    channel: AtChannel,
    dialect: Dialect,
    protocol: Protocol,
    storage_locations: String,
}

impl AtHandler {
    pub fn new(channel: AtChannel, dialect: Dialect, protocol: Protocol) -> Self {
        AtHandler {
            channel,
            dialect,
            protocol,
            storage_locations: dialect.default_storage().unwrap_or_default().to_string(),
        }
    }

    /// Preset storage codes (e.g. `"SMME"`); skips detection on start
    pub fn set_storage_locations(&mut self, locations: impl Into<String>) {
        self.storage_locations = locations.into();
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Concatenated two-letter storage codes, `"--"` when storage can't be switched
    pub fn storage_locations(&self) -> &str {
        &self.storage_locations
    }

    pub fn storages(&self) -> Vec<String> {
        self.storage_locations
            .as_bytes()
            .chunks(2)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    pub fn take_events(&mut self) -> Vec<UnsolicitedEvent> {
        self.channel.take_events()
    }

    pub async fn poll_events(&mut self) -> SmsResult<Vec<UnsolicitedEvent>> {
        self.channel.poll_events().await
    }

    pub async fn close(&mut self) -> SmsResult<()> {
        self.channel.shutdown().await
    }

    /// Write a command without waiting for its response
    async fn blind(&mut self, command: &str, settle: Duration) -> SmsResult<()> {
        self.channel.write(command).await?;
        sleep(settle).await;
        Ok(())
    }

    pub async fn sync(&mut self) -> SmsResult<()> {
        let settings = self.channel.settings();
        let reset = format!("{}\r", self.dialect.reset_command());
        self.blind(&reset, settings.at_wait).await?;
        if self.dialect.reloads_smsc() {
            self.blind("AT+CSCA?\r", settings.at_wait).await?;
        }
        Ok(())
    }

    /// Escape to command mode and reset the modem
    pub async fn reset(&mut self) -> SmsResult<()> {
        let settings = self.channel.settings();
        self.blind("\u{1b}", settings.at_wait_cmd).await?;
        self.blind("+++", settings.at_wait_cmd).await?;
        let reset = format!("{}\r", self.dialect.reset_command());
        self.blind(&reset, settings.at_wait).await?;
        if self.dialect.reloads_smsc() {
            self.blind("AT+CSCA?\r", settings.at_wait).await?;
        }
        self.channel.clear_buffer().await?;

        if self.dialect.is_wavecom() {
            self.blind("AT+CFUN=1\r", settings.at_wait_after_reset).await?;
            self.channel.clear_buffer().await?;
        }
        Ok(())
    }

    pub async fn echo_off(&mut self) -> SmsResult<()> {
        let settings = self.channel.settings();
        self.blind("ATE0\r", settings.at_wait).await?;
        self.channel.clear_buffer().await
    }

    /// Caller id presentation and automatic operator selection
    pub async fn init(&mut self) -> SmsResult<()> {
        let settings = self.channel.settings();
        if self.dialect.powers_up_on_init() {
            self.blind("AT+CFUN=1\r", settings.at_wait_after_reset).await?;
            self.channel.clear_buffer().await?;
            if !self.channel.command("AT^CURC=0").await?.is_ok() {
                warn!("periodic status reports could not be silenced");
            }
        }
        if !self.channel.command("AT+CLIP=1").await?.is_ok() {
            warn!("caller id presentation not supported");
        }
        if self.dialect.selects_operator() && !settings.disable_cops {
            if !self.channel.command("AT+COPS=0").await?.is_ok() {
                warn!("automatic operator selection refused");
            }
            sleep(settings.at_wait_network).await;
        }
        Ok(())
    }

    /// Power down sequence run before the channel is closed
    pub async fn done(&mut self) -> SmsResult<()> {
        if self.dialect.is_wavecom() {
            let settings = self.channel.settings();
            self.blind("AT+WATH=31\r", settings.at_wait).await?;
            self.blind("AT+CFUN=0\r", settings.at_wait_after_reset).await?;
        }
        Ok(())
    }

    pub async fn is_alive(&mut self) -> SmsResult<bool> {
        Ok(self.channel.command("AT").await?.is_ok())
    }

    /// Raw `AT+CPIN?` answer
    pub async fn sim_status(&mut self) -> SmsResult<String> {
        Ok(self.channel.command("AT+CPIN?").await?.text)
    }

    pub async fn enter_pin(&mut self, pin: &str) -> SmsResult<bool> {
        Ok(self
            .channel
            .command(&format!("AT+CPIN=\"{pin}\""))
            .await?
            .is_ok())
    }

    /// Wait out a busy SIM and enter PIN or PIN2 when asked for one
    pub async fn unlock_sim(&mut self, pin: Option<&str>, pin2: Option<&str>) -> SmsResult<()> {
        let wait = self.channel.settings().at_wait_simpin;
        for _ in 0..SIM_CHECKS {
            let status = self.sim_status().await?;
            if status.contains("BUSY") {
                debug!("SIM busy, waiting");
            } else if status.contains("SIM PUK") {
                return Err(SmsError::rejected("SIM is blocked and requires a PUK"));
            } else if status.contains("SIM PIN2") {
                self.submit_pin(pin2, "PIN2").await?;
            } else if status.contains("SIM PIN") {
                self.submit_pin(pin, "PIN").await?;
            } else if status.contains("READY") || status.contains("OK") {
                return Ok(());
            } else if status.contains("ERROR") {
                warn!("erroneous CPIN response, proceeding with defaults");
                return Ok(());
            } else {
                warn!("cannot understand CPIN response: {}", status.trim());
            }
            sleep(wait).await;
        }
        Err(SmsError::rejected("SIM did not become ready"))
    }

    async fn submit_pin(&mut self, pin: Option<&str>, kind: &str) -> SmsResult<()> {
        debug!("SIM requesting {}", kind);
        let pin = pin
            .filter(|p| !p.is_empty())
            .ok_or_else(|| SmsError::Config(format!("the modem requires SIM {kind}")))?;
        if !self.enter_pin(pin).await? {
            return Err(SmsError::rejected(format!("SIM {kind} not accepted")));
        }
        Ok(())
    }

    pub async fn set_verbose_errors(&mut self) -> SmsResult<bool> {
        Ok(self.channel.command("AT+CMEE=1").await?.is_ok())
    }

    pub async fn set_pdu_protocol(&mut self) -> SmsResult<bool> {
        Ok(self.channel.command("AT+CMGF=0").await?.is_ok())
    }

    pub async fn set_text_protocol(&mut self) -> SmsResult<bool> {
        if !self.channel.command("AT+CMGF=1").await?.is_ok() {
            return Ok(false);
        }
        let charset = format!("AT+CSCS=\"{}\"", self.dialect.text_charset());
        if !self.channel.command(&charset).await?.is_ok() {
            return Ok(false);
        }
        if self.dialect == Dialect::WavecomCdma {
            let settle = self.channel.settings().at_wait;
            self.blind("AT+WSCL=1,2\r", settle).await?;
            self.echo_off().await?;
        }
        Ok(true)
    }

    /// Switch on new message indications
    ///
    /// Returns false when indications are unavailable (or the chosen mode
    /// buffers them away) and inbound messages have to be polled for.
    pub async fn set_indications(&mut self) -> SmsResult<bool> {
        if self.dialect.polls_inbound() {
            if self.dialect.disables_indications()
                && !self.channel.command("AT+CNMI=0,0,0,0,0").await?.is_ok()
            {
                warn!("could not disable message indications");
            }
            info!(dialect = %self.dialect, "polling for inbound messages");
            return Ok(false);
        }

        let wait = self.channel.settings().at_wait_cnmi;
        for attempt in 1..=CNMI_ATTEMPTS {
            let offered = self.channel.command("AT+CNMI=?").await?;
            match parse::detect_cnmi(&offered.text) {
                Some(command) => {
                    let polling = command.starts_with("AT+CNMI=0");
                    let accepted = self.channel.command(&command).await?.is_ok();
                    return Ok(accepted && !polling);
                }
                None => {
                    warn!(attempt, "retrying CNMI detection, modem busy?");
                    sleep(wait).await;
                }
            }
        }
        warn!("CNMI detection failed, proceeding with defaults");
        Ok(false)
    }

    /// Ask the modem which storages it has (`AT+CPMS=?`)
    pub async fn read_storage_locations(&mut self) -> SmsResult<()> {
        let response = self.channel.command("AT+CPMS=?").await?;
        self.storage_locations = parse::parse_storage_locations(&response.text);
        info!("storage locations found: {}", self.storage_locations);
        Ok(())
    }

    /// Select the storage to read from; `"--"` means stay put
    pub async fn switch_storage_location(&mut self, location: &str) -> SmsResult<bool> {
        let Some(command) = self.dialect.storage_switch_command(location) else {
            return Ok(true);
        };
        Ok(self.channel.command(&command).await?.is_ok())
    }

    /// Raw listing of the current storage
    pub async fn list_messages(&mut self, class: MessageClass) -> SmsResult<String> {
        let command = match (self.protocol, class) {
            (Protocol::Pdu, MessageClass::All) => "AT+CMGL=4",
            (Protocol::Pdu, MessageClass::Unread) => "AT+CMGL=0",
            (Protocol::Pdu, MessageClass::Read) => "AT+CMGL=1",
            (Protocol::Text, MessageClass::All) => "AT+CMGL=\"ALL\"",
            (Protocol::Text, MessageClass::Unread) => "AT+CMGL=\"REC UNREAD\"",
            (Protocol::Text, MessageClass::Read) => "AT+CMGL=\"REC READ\"",
        };
        let listing = self.channel.command(command).await?.into_result()?;
        if self.dialect.rereads_listing() && self.protocol == Protocol::Text {
            return self.reread_cdma_listing(&listing).await;
        }
        Ok(listing)
    }

    /// CDMA listings lack timestamps: fetch each entry again and rebuild a
    /// listing with canonical headers
    async fn reread_cdma_listing(&mut self, listing: &str) -> SmsResult<String> {
        let indexes: Vec<u32> = listing
            .lines()
            .map(str::trim)
            .filter(|l| l.starts_with("+CMGL:"))
            .filter_map(parse::header_index)
            .collect();

        let mut rebuilt = String::new();
        for index in indexes {
            let entry = self.message_by_index(index).await?;
            let mut lines = entry.lines().map(str::trim).filter(|l| !l.is_empty());
            let Some(header) = lines.next() else {
                continue;
            };
            let (header, _encoding) = parse::rewrite_cdma_header(header, index)?;
            let body: String = lines.filter(|l| !l.eq_ignore_ascii_case("OK")).collect();
            rebuilt.push_str(&format!("{header}\r\n{body}\r\n"));
        }
        rebuilt.push_str("OK\r\n");
        Ok(rebuilt)
    }

    pub async fn message_by_index(&mut self, index: u32) -> SmsResult<String> {
        self.channel
            .command(&format!("AT+CMGR={index}"))
            .await?
            .into_result()
    }

    /// Keep the radio link up between the parts of a multipart message
    pub async fn keep_link_open(&mut self) -> SmsResult<()> {
        if !self.channel.settings().disable_cmms {
            self.channel.command("AT+CMMS=2").await?;
        }
        Ok(())
    }

    /// Submit one message part and return the network reference, if reported
    ///
    /// CMS/CME errors are retried `outbound_retries` times, then the last
    /// error response is returned as `Rejected`.
    pub async fn send_message(&mut self, submission: Submission<'_>) -> SmsResult<Option<u32>> {
        let settings = self.channel.settings();
        let (command, body) = match submission {
            Submission::Text { recipient, body } => {
                (format!("AT+CMGS=\"{recipient}\"\r"), body.to_string())
            }
            Submission::Pdu(part) => (format!("AT+CMGS={}\r", part.tpdu_len), part.hex.clone()),
        };

        let mut retries = 0;
        loop {
            let response = self.submit(&command, &body, settings.at_wait_cgms).await?;
            if !response.is_error() {
                return Ok(parse::parse_cmgs_reference(&response.text));
            }
            let error = response.text.trim();
            if retries >= settings.outbound_retries {
                warn!("{}: giving up, message lost", error);
                return Err(SmsError::rejected(error));
            }
            retries += 1;
            warn!(retries, "{}: retrying", error);
            sleep(settings.outbound_retry_wait).await;
        }
    }

    async fn submit(&mut self, command: &str, body: &str, settle: Duration) -> SmsResult<AtResponse> {
        let prompt = self.channel.exchange(command, settle).await?;
        match prompt.terminal {
            Terminal::Prompt => {}
            Terminal::Error(_) => return Ok(prompt),
            _ => return Err(SmsError::rejected(prompt.text.trim())),
        }
        self.channel
            .exchange(&format!("{body}{CTRL_Z}"), Duration::ZERO)
            .await
    }

    pub async fn delete_message(&mut self, index: u32, location: &str) -> SmsResult<bool> {
        if !self.switch_storage_location(location).await? {
            return Ok(false);
        }
        Ok(self
            .channel
            .command(&format!("AT+CMGD={index}"))
            .await?
            .is_ok())
    }

    /// Run an arbitrary command and return the raw answer
    pub async fn send_custom(&mut self, command: &str) -> SmsResult<String> {
        Ok(self.channel.command(command).await?.text)
    }

    pub async fn signal_level(&mut self) -> SmsResult<String> {
        Ok(self.channel.command("AT+CSQ").await?.text)
    }

    pub async fn network_registration(&mut self) -> SmsResult<String> {
        self.channel.command("AT+CREG=1").await?;
        Ok(self.channel.command("AT+CREG?").await?.text)
    }

    /// Poll `AT+CREG?` until the modem is registered (home or roaming)
    ///
    /// Returns false when the modem answers `ERROR`; denied or disabled
    /// registration is a rejection.
    pub async fn wait_for_network_registration(&mut self) -> SmsResult<bool> {
        let wait = self.channel.settings().at_wait_network;
        let mut searches = 0;
        loop {
            let response = self.network_registration().await?;
            if response.contains("ERROR") {
                return Ok(false);
            }
            match parse::parse_creg(&response) {
                Some(1) => {
                    info!("registered to home network");
                    return Ok(true);
                }
                Some(5) => {
                    info!("registered to foreign network (roaming)");
                    return Ok(true);
                }
                Some(2) => {
                    searches += 1;
                    warn!(searches, "not registered, searching for network");
                    if searches >= NETWORK_SEARCH_ATTEMPTS {
                        return Err(SmsError::rejected("network registration failed"));
                    }
                }
                Some(0) => return Err(SmsError::rejected("network auto-registration disabled")),
                Some(3) => return Err(SmsError::rejected("network registration denied")),
                _ => return Err(SmsError::rejected(format!("bad CREG answer: {}", response.trim()))),
            }
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::testing::{ScriptedModem, standard_reply};
    use crate::settings::Settings;
    use std::sync::Arc;

    fn handler(modem: &ScriptedModem, dialect: Dialect) -> AtHandler {
        handler_with(modem, dialect, Settings::fast())
    }

    fn handler_with(modem: &ScriptedModem, dialect: Dialect, settings: Settings) -> AtHandler {
        let channel = AtChannel::new("test", modem.connect(), Arc::new(settings)).unwrap();
        AtHandler::new(channel, dialect, Protocol::Text)
    }

    #[tokio::test]
    async fn storage_switch_selects_the_read_storage() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::Generic);

        assert!(at.switch_storage_location("SM").await.unwrap());
        assert!(at.switch_storage_location("--").await.unwrap());
        assert_eq!(modem.commands(), vec!["AT+CPMS=\"SM\""]);
    }

    #[tokio::test]
    async fn ubinetics_storage_switch_names_every_slot() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::UbineticsGdc201);
        assert_eq!(at.storage_locations(), "SM");

        assert!(at.switch_storage_location("SM").await.unwrap());
        assert_eq!(modem.commands(), vec!["AT+CPMS=\"SM\",\"SM\",\"SM\""]);
    }

    #[tokio::test]
    async fn storage_detection() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::Generic);
        at.read_storage_locations().await.unwrap();
        assert_eq!(at.storage_locations(), "SMME");
        assert_eq!(at.storages(), vec!["SM", "ME"]);

        let wavecom = handler(&modem, Dialect::Wavecom);
        assert_eq!(wavecom.storages(), vec!["SM", "SR"]);
    }

    #[tokio::test]
    async fn text_send_returns_reference() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::Generic);

        let reference = at
            .send_message(Submission::Text {
                recipient: "+306970000000",
                body: "hello",
            })
            .await
            .unwrap();
        assert_eq!(reference, Some(42));
        assert_eq!(
            modem.commands(),
            vec!["AT+CMGS=\"+306970000000\"", "hello\u{1a}"]
        );
    }

    #[tokio::test]
    async fn device_errors_are_retried_then_rejected() {
        let modem = ScriptedModem::new(|command| {
            if command.ends_with('\u{1a}') {
                Some("+CMS ERROR: 500".into())
            } else {
                standard_reply(command)
            }
        });
        let settings = Settings::fast().with_outbound_retries(2);
        let mut at = handler_with(&modem, Dialect::Generic, settings);

        let result = at
            .send_message(Submission::Text {
                recipient: "1",
                body: "x",
            })
            .await;
        assert!(matches!(result, Err(SmsError::Rejected { response }) if response == "+CMS ERROR: 500"));
        let attempts = modem
            .commands()
            .iter()
            .filter(|c| c.starts_with("AT+CMGS"))
            .count();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn pdu_send_uses_tpdu_length() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::Generic);
        let part = PduPart::with_default_smsc("0011000B91");

        at.send_message(Submission::Pdu(&part)).await.unwrap();
        assert_eq!(modem.commands(), vec!["AT+CMGS=5", "000011000B91\u{1a}"]);
    }

    #[tokio::test]
    async fn unanswered_command_times_out() {
        let modem = ScriptedModem::new(|_| None);
        let settings = Settings::fast().with_serial_timeout(Duration::from_millis(50));
        let mut at = handler_with(&modem, Dialect::Generic, settings);

        assert!(matches!(at.is_alive().await, Err(SmsError::Timeout)));
    }

    #[tokio::test]
    async fn sim_pin_is_entered_when_requested() {
        let unlocked = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let state = Arc::clone(&unlocked);
        let modem = ScriptedModem::new(move |command| match command {
            "AT+CPIN?" if state.load(std::sync::atomic::Ordering::SeqCst) => {
                Some("+CPIN: READY\r\n\r\nOK".into())
            }
            "AT+CPIN?" => Some("+CPIN: SIM PIN".into()),
            "AT+CPIN=\"1234\"" => {
                state.store(true, std::sync::atomic::Ordering::SeqCst);
                Some("OK".into())
            }
            other => standard_reply(other),
        });
        let mut at = handler(&modem, Dialect::Generic);

        assert!(matches!(
            at.unlock_sim(None, None).await,
            Err(SmsError::Config(_))
        ));
        at.unlock_sim(Some("1234"), None).await.unwrap();
        assert!(unlocked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn blocked_sim_is_rejected() {
        let modem = ScriptedModem::new(|command| match command {
            "AT+CPIN?" => Some("+CPIN: SIM PUK\r\n\r\nOK".into()),
            other => standard_reply(other),
        });
        let mut at = handler(&modem, Dialect::Generic);
        assert!(matches!(
            at.unlock_sim(Some("1234"), None).await,
            Err(SmsError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn indications_use_detected_cnmi() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::Generic);

        assert!(at.set_indications().await.unwrap());
        assert_eq!(modem.commands(), vec!["AT+CNMI=?", "AT+CNMI=3,1,0,2,0"]);
    }

    #[tokio::test]
    async fn telit_polls_instead_of_indications() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::Telit);

        assert!(!at.set_indications().await.unwrap());
        assert_eq!(modem.commands(), vec!["AT+CNMI=0,0,0,0,0"]);
    }

    #[tokio::test]
    async fn wavecom_reset_and_done() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::Wavecom);

        at.reset().await.unwrap();
        at.done().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            modem.commands(),
            vec!["ATZ", "AT+CFUN=1", "AT+WATH=31", "AT+CFUN=0"]
        );
    }

    #[tokio::test]
    async fn siemens_sync_reloads_smsc() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::SiemensHc25);

        at.sync().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(modem.commands(), vec!["ATZ", "AT+CSCA?"]);
    }

    #[tokio::test]
    async fn mc35i_fd_resets_to_factory_profile() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::SiemensMc35iFd);

        at.sync().await.unwrap();
        at.reset().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(modem.commands(), vec!["AT&F", "AT&F"]);
    }

    #[tokio::test]
    async fn huawei_powers_up_and_polls_without_cnmi() {
        let modem = ScriptedModem::new(standard_reply);
        let mut at = handler(&modem, Dialect::Huawei);

        at.init().await.unwrap();
        assert!(!at.set_indications().await.unwrap());
        assert_eq!(modem.commands(), vec!["AT+CFUN=1", "AT^CURC=0", "AT+CLIP=1"]);
    }

    #[tokio::test]
    async fn cdma_listing_is_reread_by_index() {
        let modem = ScriptedModem::new(|command| match command {
            "AT+CMGL=\"REC UNREAD\"" => {
                Some("+CMGL:6,\"REC UNREAD\",\"13911577644\",0,2,23\r\nJust for test\r\n\r\nOK".into())
            }
            "AT+CMGR=6" => Some(
                "+CMGR:\"REC UNREAD\",\"13911577644\",\"08/07/09,11 :41 :49\",0,2,3,23\r\nJust for test\r\n\r\nOK"
                    .into(),
            ),
            other => standard_reply(other),
        });
        let mut at = handler(&modem, Dialect::WavecomCdma);

        let listing = at.list_messages(MessageClass::Unread).await.unwrap();
        assert!(listing.starts_with("+CMGR: 6,\"REC UNREAD\",\"13911577644\",,"));
        assert!(listing.contains("Just for test"));
    }

    #[tokio::test]
    async fn registration_waits_while_searching() {
        let searching = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let polls = Arc::clone(&searching);
        let modem = ScriptedModem::new(move |command| match command {
            "AT+CREG?" if polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2 => {
                Some("+CREG: 1,2\r\n\r\nOK".into())
            }
            other => standard_reply(other),
        });
        let mut at = handler(&modem, Dialect::Generic);

        assert!(at.wait_for_network_registration().await.unwrap());
        assert_eq!(searching.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
