// ABOUTME: Timing and retry settings shared by the dispatch service and every transport
// ABOUTME: Builder-style configuration with defaults, loadable from TOML (durations in milliseconds)

use crate::error::{SmsError, SmsResult};
use serde::Deserialize;
use std::time::Duration;

/// Engine-wide tuning knobs
///
/// Every timing constant the AT driver, the watchdog and the notification
/// dispatcher rely on lives here. A `Settings` value is owned by the
/// [`Service`](crate::service::Service) and shared read-only with the
/// transports it starts.
///
/// # Example
///
/// ```rust
/// use smsgate::settings::Settings;
/// use std::time::Duration;
///
/// let settings = Settings::default()
///     .with_serial_timeout(Duration::from_secs(5))
///     .with_outbound_retries(1);
/// assert_eq!(settings.outbound_retries, 1);
/// ```
///
/// In TOML every duration is given in milliseconds:
///
/// ```toml
/// at_wait = 250
/// serial_timeout = 20000
/// outbound_retries = 5
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Settling delay after every AT command (default: 200ms)
    #[serde(with = "millis")]
    pub at_wait: Duration,

    /// Pause after a modem reset before it accepts commands (default: 10s)
    #[serde(with = "millis")]
    pub at_wait_after_reset: Duration,

    /// Guard pause around the `+++` escape sequence (default: 1.1s)
    #[serde(with = "millis")]
    pub at_wait_cmd: Duration,

    /// Wait between `AT+CMGS=` and writing the message body (default: 200ms)
    #[serde(with = "millis")]
    pub at_wait_cgms: Duration,

    /// Wait for network registration after `AT+COPS=0` (default: 5s)
    #[serde(with = "millis")]
    pub at_wait_network: Duration,

    /// Wait between SIM PIN checks while the SIM is busy (default: 5s)
    #[serde(with = "millis")]
    pub at_wait_simpin: Duration,

    /// Wait between `AT+CNMI=?` detection attempts (default: 3s)
    #[serde(with = "millis")]
    pub at_wait_cnmi: Duration,

    /// Maximum wait for a terminal response to one AT command (default: 15s)
    #[serde(with = "millis")]
    pub serial_timeout: Duration,

    /// Quiet period used when draining stale modem input (default: 1s)
    #[serde(with = "millis")]
    pub serial_clear_wait: Duration,

    /// Read poll granularity for the modem channel (default: 200ms)
    #[serde(with = "millis")]
    pub serial_polling_interval: Duration,

    /// Initial capacity of the modem read buffer (default: 16384)
    pub serial_buffer_size: usize,

    /// Retries of a rejected modem send (default: 3)
    pub outbound_retries: u32,

    /// Wait between modem send retries (default: 3s)
    #[serde(with = "millis")]
    pub outbound_retry_wait: Duration,

    /// Period of the watchdog that restarts failed connections (default: 15s)
    #[serde(with = "millis")]
    pub watchdog_interval: Duration,

    /// Inbound polling period when the modem has no indications (default: 30s)
    #[serde(with = "millis")]
    pub polling_interval: Duration,

    /// Period of the modem liveness probe (default: 60s)
    #[serde(with = "millis")]
    pub keepalive_interval: Duration,

    /// Poll period while draining the notification queue on shutdown (default: 200ms)
    #[serde(with = "millis")]
    pub drain_poll_interval: Duration,

    /// Consecutive drain polls without progress before the rest is dropped (default: 25)
    pub drain_max_stalled_polls: u32,

    /// Skip `AT+COPS=0` during modem init (default: false)
    pub disable_cops: bool,

    /// Skip `AT+CMMS=1` before multipart sends (default: false)
    pub disable_cmms: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            at_wait: Duration::from_millis(200),
            at_wait_after_reset: Duration::from_millis(10_000),
            at_wait_cmd: Duration::from_millis(1_100),
            at_wait_cgms: Duration::from_millis(200),
            at_wait_network: Duration::from_millis(5_000),
            at_wait_simpin: Duration::from_millis(5_000),
            at_wait_cnmi: Duration::from_millis(3_000),
            serial_timeout: Duration::from_millis(15_000),
            serial_clear_wait: Duration::from_millis(1_000),
            serial_polling_interval: Duration::from_millis(200),
            serial_buffer_size: 16_384,
            outbound_retries: 3,
            outbound_retry_wait: Duration::from_millis(3_000),
            watchdog_interval: Duration::from_secs(15),
            polling_interval: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(60),
            drain_poll_interval: Duration::from_millis(200),
            drain_max_stalled_polls: 25,
            disable_cops: false,
            disable_cmms: false,
        }
    }
}

impl Settings {
    /// Parse settings from a TOML document; missing keys keep their defaults
    pub fn from_toml_str(source: &str) -> SmsResult<Self> {
        toml::from_str(source).map_err(|e| SmsError::Config(e.to_string()))
    }

    /// Settings with every AT delay shortened, for scripted modems and dry runs
    pub fn fast() -> Self {
        Self {
            at_wait: Duration::ZERO,
            at_wait_after_reset: Duration::ZERO,
            at_wait_cmd: Duration::ZERO,
            at_wait_cgms: Duration::ZERO,
            at_wait_network: Duration::ZERO,
            at_wait_simpin: Duration::from_millis(10),
            at_wait_cnmi: Duration::ZERO,
            serial_timeout: Duration::from_secs(2),
            serial_clear_wait: Duration::from_millis(10),
            serial_polling_interval: Duration::from_millis(10),
            outbound_retry_wait: Duration::ZERO,
            drain_poll_interval: Duration::from_millis(20),
            ..Self::default()
        }
    }

    pub fn with_at_wait(mut self, at_wait: Duration) -> Self {
        self.at_wait = at_wait;
        self
    }

    pub fn with_serial_timeout(mut self, timeout: Duration) -> Self {
        self.serial_timeout = timeout;
        self
    }

    pub fn with_outbound_retries(mut self, retries: u32) -> Self {
        self.outbound_retries = retries;
        self
    }

    pub fn with_outbound_retry_wait(mut self, wait: Duration) -> Self {
        self.outbound_retry_wait = wait;
        self
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Set the shutdown drain poll period and how many polls may pass without progress
    pub fn with_drain_window(mut self, poll_interval: Duration, max_stalled_polls: u32) -> Self {
        self.drain_poll_interval = poll_interval;
        self.drain_max_stalled_polls = max_stalled_polls;
        self
    }

    pub fn with_disable_cops(mut self, disable: bool) -> Self {
        self.disable_cops = disable;
        self
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
