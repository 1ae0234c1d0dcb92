// ABOUTME: Byte channel to a modem: raw writes, buffered reads and terminal response detection
// ABOUTME: Unsolicited result codes are cut out of the input and queued as events

use crate::error::{SmsError, SmsResult};
use crate::settings::Settings;
use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use regex::bytes::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

/// Byte stream a modem is reachable through
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Something that can open a fresh stream to a modem
///
/// Opened again on every (re)start of the owning connection.
#[async_trait]
pub trait ModemPort: Send + Sync {
    /// Human readable endpoint for logs
    fn describe(&self) -> String;

    async fn open(&self) -> SmsResult<Box<dyn AsyncStream>>;
}

/// Modem attached through a TCP terminal server (IP modem)
#[derive(Debug, Clone)]
pub struct TcpModemPort {
    address: String,
    connect_timeout: Duration,
}

impl TcpModemPort {
    pub fn new(address: impl Into<String>) -> Self {
        TcpModemPort {
            address: address.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl ModemPort for TcpModemPort {
    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }

    async fn open(&self) -> SmsResult<Box<dyn AsyncStream>> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| SmsError::Timeout)??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Unsolicited result code reported by the modem
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsolicitedEvent {
    /// `+CMTI: "<mem>",<index>`
    MessageIndication { storage: String, index: u32 },
    /// `+CDSI: "<mem>",<index>`
    StatusReportIndication { storage: String, index: u32 },
    Ring,
    /// `+CLIP: "<number>",...`
    CallerId(String),
}

/// Error terminator of a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtError {
    Generic,
    NoCarrier,
    NoDialtone,
    /// `+CME ERROR: n`; `None` when the modem answered in verbose text
    Cme(Option<u32>),
    /// `+CMS ERROR: n`
    Cms(Option<u32>),
}

/// SIM state terminator (`+CPIN:` answers without a trailing `OK`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimState {
    Ready,
    Pin,
    Puk,
    Pin2,
    Puk2,
    Busy,
}

/// How a response ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    Ok,
    /// `>` body prompt of `AT+CMGS`
    Prompt,
    Error(AtError),
    Sim(SimState),
}

/// A complete modem response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtResponse {
    pub terminal: Terminal,
    /// Raw text up to and including the terminator
    pub text: String,
}

impl AtResponse {
    pub fn is_ok(&self) -> bool {
        self.terminal == Terminal::Ok
    }

    pub fn is_error(&self) -> bool {
        matches!(self.terminal, Terminal::Error(_))
    }

    /// Text of a non-error response; an error terminator becomes `Rejected`
    pub fn into_result(self) -> SmsResult<String> {
        match self.terminal {
            Terminal::Error(_) => Err(SmsError::rejected(self.text.trim())),
            _ => Ok(self.text),
        }
    }
}

struct Patterns {
    device_error: Regex,
    plain_error: Regex,
    ok: Regex,
    sim: Regex,
    prompt: Regex,
    unsolicited: Regex,
    indication: Regex,
    caller_id: Regex,
}

impl Patterns {
    fn compile() -> SmsResult<Self> {
        let build = |pattern: &str| {
            Regex::new(pattern).map_err(|e| SmsError::Config(format!("bad pattern: {e}")))
        };
        Ok(Patterns {
            device_error: build(r"\+CM([ES]) ERROR:[ \t]*([^\r\n]*)\r?\n")?,
            plain_error: build(r"(?:^|[\r\n])(ERROR|NO CARRIER|NO DIALTONE)(?:\r\n|[\r\n])")?,
            ok: build(r"(?:^|[\r\n])OK(?:\r\n|[\r\n])")?,
            sim: build(
                r"(?:^|[\r\n])(?:\+CPIN:[ \t]*)?(READY|SIM PIN2|SIM PUK2|SIM PIN|SIM PUK|SIM BUSY)(?:\r\n|[\r\n])",
            )?,
            prompt: build(r"(?:^|\n)[ \t]*>[ \t]?$")?,
            unsolicited: build(
                r#"(?m)^[ \t]*(\+CMTI:[ \t]*"\w*",[ \t]*\d+|\+CDSI:[ \t]*"\w*",[ \t]*\d+|\+CLIP:[ \t]*"[^"\r\n]*"[^\r\n]*|RING)[ \t]*\r?\n"#,
            )?,
            indication: build(r#"^\+(CMTI|CDSI):[ \t]*"(\w*)",[ \t]*(\d+)"#)?,
            caller_id: build(r#"^\+CLIP:[ \t]*"([^"\r\n]*)""#)?,
        })
    }
}

/// Buffered command channel to one modem
///
/// Responses are recognized by matching terminators against the whole
/// accumulated input, never line by line. Whatever follows a terminator
/// stays buffered.
pub struct AtChannel {
    label: String,
    stream: Box<dyn AsyncStream>,
    buffer: BytesMut,
    settings: Arc<Settings>,
    patterns: Patterns,
    events: Vec<UnsolicitedEvent>,
}

impl fmt::Debug for AtChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtChannel")
            .field("label", &self.label)
            .field("buffered", &self.buffer.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl AtChannel {
    pub fn new(
        label: impl Into<String>,
        stream: Box<dyn AsyncStream>,
        settings: Arc<Settings>,
    ) -> SmsResult<Self> {
        Ok(AtChannel {
            label: label.into(),
            stream,
            buffer: BytesMut::with_capacity(settings.serial_buffer_size),
            patterns: Patterns::compile()?,
            settings,
            events: Vec::new(),
        })
    }

    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// Write raw text without waiting for anything
    pub async fn write(&mut self, data: &str) -> SmsResult<()> {
        debug!(gateway = %self.label, "SEND: {}", data.escape_debug());
        self.stream.write_all(data.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Send `command` + CR, settle, and wait for its terminal response
    pub async fn command(&mut self, command: &str) -> SmsResult<AtResponse> {
        let settle = self.settings.at_wait;
        self.exchange(&format!("{command}\r"), settle).await
    }

    /// Drop stale input, write `data` as is, settle, and wait for a response
    pub async fn exchange(&mut self, data: &str, settle: Duration) -> SmsResult<AtResponse> {
        self.discard_stale();
        self.write(data).await?;
        sleep(settle).await;
        self.read_response().await
    }

    /// Wait for the next terminal response
    pub async fn read_response(&mut self) -> SmsResult<AtResponse> {
        let deadline = Instant::now() + self.settings.serial_timeout;
        loop {
            self.extract_events();
            if let Some(response) = self.take_response() {
                debug!(gateway = %self.label, "RECV: {}", response.text.escape_debug());
                return Ok(response);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out());
            }
            match timeout(remaining, self.stream.read_buf(&mut self.buffer)).await {
                Err(_) => return Err(self.timed_out()),
                Ok(Ok(0)) => return Err(SmsError::ConnectionClosed),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Wait for the line to go quiet, then throw away everything buffered
    pub async fn clear_buffer(&mut self) -> SmsResult<()> {
        sleep(self.settings.serial_clear_wait).await;
        while self.read_available().await? > 0 {}
        self.extract_events();
        if !self.buffer.is_empty() {
            debug!(gateway = %self.label, "CLEAR: {}", self.buffered_text().escape_debug());
            self.buffer.clear();
        }
        Ok(())
    }

    /// Collect whatever arrived since the last exchange and return pending events
    pub async fn poll_events(&mut self) -> SmsResult<Vec<UnsolicitedEvent>> {
        self.read_available().await?;
        self.extract_events();
        Ok(self.take_events())
    }

    /// Events seen during command exchanges, oldest first
    pub fn take_events(&mut self) -> Vec<UnsolicitedEvent> {
        std::mem::take(&mut self.events)
    }

    pub async fn shutdown(&mut self) -> SmsResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }

    /// One read bounded by the polling interval; 0 when nothing arrived
    async fn read_available(&mut self) -> SmsResult<usize> {
        match timeout(
            self.settings.serial_polling_interval,
            self.stream.read_buf(&mut self.buffer),
        )
        .await
        {
            Err(_) => Ok(0),
            Ok(Ok(0)) => Err(SmsError::ConnectionClosed),
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    fn timed_out(&self) -> SmsError {
        warn!(
            gateway = %self.label,
            "no response within {:?}, buffered: {}",
            self.settings.serial_timeout,
            self.buffered_text().escape_debug()
        );
        SmsError::Timeout
    }

    fn buffered_text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    fn discard_stale(&mut self) {
        self.extract_events();
        if !self.buffer.is_empty() {
            debug!(gateway = %self.label, "stale input: {}", self.buffered_text().escape_debug());
            self.buffer.clear();
        }
    }

    /// Cut unsolicited result codes out of the buffer
    fn extract_events(&mut self) {
        let mut kept = BytesMut::with_capacity(self.buffer.len());
        let mut last = 0;
        for found in self.patterns.unsolicited.captures_iter(&self.buffer) {
            let (Some(whole), Some(code)) = (found.get(0), found.get(1)) else {
                continue;
            };
            kept.extend_from_slice(&self.buffer[last..whole.start()]);
            last = whole.end();

            let code = String::from_utf8_lossy(code.as_bytes()).into_owned();
            if let Some(event) = self.parse_event(&code) {
                debug!(gateway = %self.label, ?event, "unsolicited");
                self.events.push(event);
            }
        }
        if last > 0 {
            kept.extend_from_slice(&self.buffer[last..]);
            self.buffer = kept;
        }
    }

    fn parse_event(&self, code: &str) -> Option<UnsolicitedEvent> {
        if code == "RING" {
            return Some(UnsolicitedEvent::Ring);
        }
        if let Some(found) = self.patterns.indication.captures(code.as_bytes()) {
            let text = |i: usize| {
                found
                    .get(i)
                    .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
                    .unwrap_or_default()
            };
            let index = text(3).parse().ok()?;
            let storage = text(2);
            return Some(if text(1) == "CMTI" {
                UnsolicitedEvent::MessageIndication { storage, index }
            } else {
                UnsolicitedEvent::StatusReportIndication { storage, index }
            });
        }
        self.patterns
            .caller_id
            .captures(code.as_bytes())
            .and_then(|found| found.get(1))
            .map(|m| UnsolicitedEvent::CallerId(String::from_utf8_lossy(m.as_bytes()).into_owned()))
    }

    /// Split off a complete response if the buffer holds a terminator
    fn take_response(&mut self) -> Option<AtResponse> {
        let (terminal, end) = self.find_terminal()?;
        let text = String::from_utf8_lossy(&self.buffer[..end]).into_owned();
        self.buffer.advance(end);
        Some(AtResponse { terminal, text })
    }

    fn find_terminal(&self) -> Option<(Terminal, usize)> {
        let input = &self.buffer[..];
        let p = &self.patterns;

        if let Some(found) = p.device_error.captures(input) {
            let end = found.get(0)?.end();
            let code = found
                .get(2)
                .and_then(|m| std::str::from_utf8(m.as_bytes()).ok())
                .and_then(|s| s.trim().parse().ok());
            let error = match found.get(1).map(|m| m.as_bytes()) {
                Some(b"E") => AtError::Cme(code),
                _ => AtError::Cms(code),
            };
            return Some((Terminal::Error(error), end));
        }
        if let Some(found) = p.plain_error.captures(input) {
            let end = found.get(0)?.end();
            let error = match found.get(1).map(|m| m.as_bytes()) {
                Some(b"NO CARRIER") => AtError::NoCarrier,
                Some(b"NO DIALTONE") => AtError::NoDialtone,
                _ => AtError::Generic,
            };
            return Some((Terminal::Error(error), end));
        }
        if let Some(found) = p.ok.find(input) {
            return Some((Terminal::Ok, found.end()));
        }
        if let Some(found) = p.sim.captures(input) {
            let end = found.get(0)?.end();
            let state = match found.get(1).map(|m| m.as_bytes()) {
                Some(b"READY") => SimState::Ready,
                Some(b"SIM PIN2") => SimState::Pin2,
                Some(b"SIM PUK2") => SimState::Puk2,
                Some(b"SIM PIN") => SimState::Pin,
                Some(b"SIM PUK") => SimState::Puk,
                _ => SimState::Busy,
            };
            return Some((Terminal::Sim(state), end));
        }
        p.prompt
            .find(input)
            .map(|found| (Terminal::Prompt, found.end()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    fn channel() -> (AtChannel, DuplexStream) {
        let (ours, theirs) = duplex(4096);
        let channel = AtChannel::new("test", Box::new(ours), Arc::new(Settings::fast())).unwrap();
        (channel, theirs)
    }

    #[tokio::test]
    async fn ok_terminates_and_keeps_the_rest() {
        let (mut channel, mut modem) = channel();
        modem.write_all(b"\r\n+CSQ: 21,99\r\n\r\nOK\r\nleftover").await.unwrap();

        let response = channel.read_response().await.unwrap();
        assert!(response.is_ok());
        assert!(response.text.contains("+CSQ: 21,99"));
        assert_eq!(&channel.buffer[..], b"leftover");
    }

    #[tokio::test]
    async fn device_errors_carry_their_code() {
        let (mut channel, mut modem) = channel();
        modem.write_all(b"\r\n+CMS ERROR: 500\r\n").await.unwrap();

        let response = channel.read_response().await.unwrap();
        assert_eq!(response.terminal, Terminal::Error(AtError::Cms(Some(500))));
        assert!(matches!(
            response.into_result(),
            Err(SmsError::Rejected { response }) if response == "+CMS ERROR: 500"
        ));
    }

    #[tokio::test]
    async fn verbose_errors_have_no_code() {
        let (mut channel, mut modem) = channel();
        modem.write_all(b"\r\n+CME ERROR: SIM busy\r\n").await.unwrap();

        let response = channel.read_response().await.unwrap();
        assert_eq!(response.terminal, Terminal::Error(AtError::Cme(None)));
    }

    #[tokio::test]
    async fn plain_error_variants() {
        let (mut channel, mut modem) = channel();
        modem.write_all(b"\r\nNO CARRIER\r\n").await.unwrap();
        let response = channel.read_response().await.unwrap();
        assert_eq!(response.terminal, Terminal::Error(AtError::NoCarrier));

        modem.write_all(b"\r\nERROR\r\n").await.unwrap();
        let response = channel.read_response().await.unwrap();
        assert_eq!(response.terminal, Terminal::Error(AtError::Generic));
    }

    #[tokio::test]
    async fn unsolicited_codes_become_events() {
        let (mut channel, mut modem) = channel();
        modem
            .write_all(b"\r\n+CMTI: \"SM\",3\r\n\r\nRING\r\n\r\n+CLIP: \"+30697\",145\r\n\r\nOK\r\n")
            .await
            .unwrap();

        let response = channel.read_response().await.unwrap();
        assert!(response.is_ok());
        assert!(!response.text.contains("CMTI"));
        assert_eq!(
            channel.take_events(),
            vec![
                UnsolicitedEvent::MessageIndication {
                    storage: "SM".into(),
                    index: 3
                },
                UnsolicitedEvent::Ring,
                UnsolicitedEvent::CallerId("+30697".into()),
            ]
        );
    }

    #[tokio::test]
    async fn sim_state_without_ok() {
        let (mut channel, mut modem) = channel();
        modem.write_all(b"\r\n+CPIN: SIM PIN\r\n").await.unwrap();

        let response = channel.read_response().await.unwrap();
        assert_eq!(response.terminal, Terminal::Sim(SimState::Pin));
    }

    #[tokio::test]
    async fn prompt_is_a_terminal() {
        let (mut channel, mut modem) = channel();
        modem.write_all(b"\r\n> ").await.unwrap();

        let response = channel.read_response().await.unwrap();
        assert_eq!(response.terminal, Terminal::Prompt);
    }

    #[tokio::test]
    async fn silence_is_a_timeout() {
        let (ours, _modem) = duplex(64);
        let settings = Settings::fast().with_serial_timeout(Duration::from_millis(50));
        let mut channel = AtChannel::new("test", Box::new(ours), Arc::new(settings)).unwrap();

        channel.write("AT\r").await.unwrap();
        assert!(matches!(channel.read_response().await, Err(SmsError::Timeout)));
    }

    #[tokio::test]
    async fn closed_stream_is_reported() {
        let (mut channel, modem) = channel();
        drop(modem);
        assert!(matches!(
            channel.read_response().await,
            Err(SmsError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn poll_collects_indications_only() {
        let (mut channel, mut modem) = channel();
        modem.write_all(b"\r\n+CDSI: \"SR\",7\r\n").await.unwrap();

        let events = channel.poll_events().await.unwrap();
        assert_eq!(
            events,
            vec![UnsolicitedEvent::StatusReportIndication {
                storage: "SR".into(),
                index: 7
            }]
        );
    }

    #[tokio::test]
    async fn command_discards_stale_input() {
        let (mut channel, mut modem) = channel();
        modem.write_all(b"garbage\r\n").await.unwrap();
        channel.poll_events().await.unwrap();

        let reply = tokio::spawn(async move {
            let mut seen = vec![0u8; 16];
            let n = modem.read(&mut seen).await.unwrap();
            modem.write_all(b"\r\nOK\r\n").await.unwrap();
            (String::from_utf8_lossy(&seen[..n]).into_owned(), modem)
        });

        let response = channel.command("AT").await.unwrap();
        assert_eq!(response.text.trim(), "OK");
        let (written, _modem) = reply.await.unwrap();
        assert_eq!(written, "AT\r");
    }
}
