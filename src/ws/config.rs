#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_RECEIVE_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_UNCOMPRESSED_BUFFER_SIZE: usize = 64 * 1024;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 1.0;

/// How many times a [`ConnectionClient`](super::ConnectionClient) may retry after the
/// first connect attempt of a `connect` call.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconnectAttempts {
    /// At most `n` retries; `Limited(0)` disables reconnection entirely
    Limited(u32),
    /// Retry forever
    #[default]
    Unlimited,
}

impl From<i32> for ReconnectAttempts {
    /// `0` means no reconnect, any negative value (conventionally `-1`) means infinite.
    fn from(value: i32) -> Self {
        u32::try_from(value).map_or(Self::Unlimited, Self::Limited)
    }
}

/// Configuration for [`ConnectionClient`](super::ConnectionClient) behavior.
///
/// ```
/// use std::time::Duration;
///
/// use resilient_ws::ws::config::{Config, ReconnectAttempts};
///
/// let config = Config::builder()
///     .reconnect_attempts(ReconnectAttempts::Limited(5))
///     .reconnect_interval(Duration::from_millis(500))
///     .build();
///
/// assert_eq!(config.resend_interval, Duration::from_secs(2));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Delay before each reconnect attempt
    #[builder(default = DEFAULT_RECONNECT_INTERVAL)]
    pub reconnect_interval: Duration,
    /// Upper bound for the retry delay when `backoff_multiplier` grows it
    pub max_reconnect_interval: Option<Duration>,
    /// Growth factor applied to the retry delay after each failed attempt.
    /// The default of `1.0` keeps the delay fixed at `reconnect_interval`.
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
    /// Delay between two replayed commands during a resend pass
    #[builder(default = DEFAULT_RESEND_INTERVAL)]
    pub resend_interval: Duration,
    /// Retry budget, refilled on every explicit `connect`
    #[builder(default)]
    pub reconnect_attempts: ReconnectAttempts,
    /// Skip the automatic resend pass after a reconnect
    #[builder(default)]
    pub disable_auto_resend: bool,
    /// Delay between a successful reconnect and the start of its resend pass
    #[builder(default)]
    pub resend_timeout: Duration,
    /// Upper bound for the graceful close handshake
    #[builder(default = DEFAULT_DISCONNECT_TIMEOUT)]
    pub disconnect_timeout: Duration,
    /// Transport read buffer size, also the initial capacity of the reassembly buffer
    #[builder(default = DEFAULT_RECEIVE_BUFFER_SIZE)]
    pub receive_buffer_size: usize,
    /// Size of the output buffer handed to a [`Preprocessor`](super::Preprocessor)
    #[builder(default = DEFAULT_UNCOMPRESSED_BUFFER_SIZE)]
    pub uncompressed_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Retry delay schedule for one connect sequence.
    #[must_use]
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(self.reconnect_interval)
            .with_max_interval(
                self.max_reconnect_interval
                    .map_or(Duration::MAX, |max| max.max(self.reconnect_interval)),
            )
            .with_multiplier(self.backoff_multiplier)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // Attempts are bounded by `reconnect_attempts`
            .build()
    }
}
