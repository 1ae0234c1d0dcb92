// ABOUTME: Liveness probing for long-running connections (SMPP enquire_link, modem AT probe)
// ABOUTME: Tracks probe timing and consecutive failures so a transport can report a dead link

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for periodic liveness probes
///
/// SMPP sessions probe with `enquire_link`, modems with a bare `AT`. Once
/// `max_failures` probes in a row fail the transport reports the link as
/// dead and the owning gateway moves to `Failed`.
///
/// # Example
///
/// ```rust
/// use smsgate::keepalive::KeepAliveConfig;
/// use std::time::Duration;
///
/// let config = KeepAliveConfig::new(Duration::from_secs(60))
///     .with_timeout(Duration::from_secs(15))
///     .with_max_failures(5);
/// assert!(config.enabled);
/// assert!(!KeepAliveConfig::disabled().enabled);
/// ```
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between probes (default: 30 seconds)
    pub interval: Duration,

    /// Maximum wait for a probe response (default: 10 seconds)
    pub timeout: Duration,

    /// Consecutive failures before the link is considered dead (default: 3)
    pub max_failures: u32,

    /// Whether probes are sent at all (default: true)
    pub enabled: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            max_failures: 3,
            enabled: true,
        }
    }
}

impl KeepAliveConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Snapshot of probe statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveStatus {
    pub running: bool,
    pub consecutive_failures: u32,
    pub total_probes: u32,
    pub total_answers: u32,
}

/// Decides when to probe and when a link is dead
///
/// Polling model: the transport's background task asks
/// [`should_probe`](Self::should_probe) on every tick, sends the probe and
/// reports the outcome.
#[derive(Debug)]
pub struct KeepAliveManager {
    config: KeepAliveConfig,
    last_probe: Option<Instant>,
    consecutive_failures: u32,
    total_probes: u32,
    total_answers: u32,
}

impl KeepAliveManager {
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            last_probe: None,
            consecutive_failures: 0,
            total_probes: 0,
            total_answers: 0,
        }
    }

    /// True when enabled, the interval has elapsed and the link is not yet dead
    pub fn should_probe(&self) -> bool {
        if !self.config.enabled || self.is_link_dead() {
            return false;
        }
        match self.last_probe {
            None => true,
            Some(last) => last.elapsed() >= self.config.interval,
        }
    }

    pub fn on_probe_sent(&mut self) {
        self.last_probe = Some(Instant::now());
        self.total_probes += 1;
        debug!("Keep-alive probe sent (total: {})", self.total_probes);
    }

    pub fn on_probe_success(&mut self) {
        self.consecutive_failures = 0;
        self.total_answers += 1;
        debug!("Keep-alive probe answered (total: {})", self.total_answers);
    }

    pub fn on_probe_failure(&mut self) {
        self.consecutive_failures += 1;
        warn!(
            "Keep-alive probe failed (consecutive failures: {})",
            self.consecutive_failures
        );
    }

    /// Any successful exchange on the link proves it is alive
    pub fn reset_failures(&mut self) {
        if self.consecutive_failures > 0 {
            debug!("Resetting {} consecutive failures", self.consecutive_failures);
            self.consecutive_failures = 0;
        }
    }

    pub fn is_link_dead(&self) -> bool {
        self.consecutive_failures >= self.config.max_failures
    }

    pub fn status(&self) -> KeepAliveStatus {
        KeepAliveStatus {
            running: self.config.enabled,
            consecutive_failures: self.consecutive_failures,
            total_probes: self.total_probes,
            total_answers: self.total_answers,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}
