//! Event service configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balancer::LoadBalanceKind;
use crate::error::EventError;

/// Lower bound applied to `time_between_connect_attempts`.
pub const MIN_TIME_BETWEEN_CONNECT_ATTEMPTS: Duration = Duration::from_secs(1);

/// How a publish behaves when a consumer's output queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Drop the event immediately.
    NonBlocking,
    /// Wait until the consumer makes room.
    Blocking,
    /// Wait at most this long, then drop the event.
    Timeout(Duration),
}

impl Backpressure {
    /// Interpret a signed consumer timeout: negative drops, zero blocks,
    /// positive waits that many milliseconds.
    pub fn from_timeout_ms(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => Self::NonBlocking,
            0 => Self::Blocking,
            ms => Self::Timeout(Duration::from_millis(ms as u64)),
        }
    }
}

/// Configuration for the event dispatcher and client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventServiceConfig {
    /// Capacity of each consumer output queue.
    #[serde(default = "default_buffer_size")]
    pub event_consumer_buffer_size: usize,
    /// Backpressure policy for publishing, see [`Backpressure::from_timeout_ms`].
    #[serde(default = "default_consumer_timeout_ms")]
    pub event_consumer_timeout_ms: i64,
    /// Capacity of the dispatcher input queue.
    #[serde(default = "default_buffer_size")]
    pub input_queue_size: usize,
    /// Reconnect automatically after an unsolicited disconnect.
    #[serde(default = "bool_true")]
    pub reconnect: bool,
    /// Connect attempts made by `connect()` (0 = unbounded).
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Connect attempts made per reconnect (0 = unbounded).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_time_between_connect_attempts_ms")]
    pub time_between_connect_attempts_ms: u64,
    /// Timeout for dispatcher request/response round-trips and for opening
    /// a connection.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub load_balance: LoadBalanceKind,
}

fn default_buffer_size() -> usize { 100 }
fn default_consumer_timeout_ms() -> i64 { 500 }
fn default_max_connect_attempts() -> u32 { 1 }
fn default_time_between_connect_attempts_ms() -> u64 { 5_000 }
fn default_response_timeout_ms() -> u64 { 5_000 }
fn bool_true() -> bool { true }

impl Default for EventServiceConfig {
    fn default() -> Self {
        Self {
            event_consumer_buffer_size: default_buffer_size(),
            event_consumer_timeout_ms: default_consumer_timeout_ms(),
            input_queue_size: default_buffer_size(),
            reconnect: true,
            max_connect_attempts: default_max_connect_attempts(),
            max_reconnect_attempts: 0,
            reconnect_initial_delay_ms: 0,
            time_between_connect_attempts_ms: default_time_between_connect_attempts_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            load_balance: LoadBalanceKind::default(),
        }
    }
}

impl EventServiceConfig {
    pub fn backpressure(&self) -> Backpressure {
        Backpressure::from_timeout_ms(self.event_consumer_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    /// Delay between connect attempts, never below one second.
    pub fn time_between_connect_attempts(&self) -> Duration {
        Duration::from_millis(self.time_between_connect_attempts_ms)
            .max(MIN_TIME_BETWEEN_CONNECT_ATTEMPTS)
    }

    /// Queue capacities must be non-zero for the underlying channels.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_consumer_buffer_size == 0 {
            return Err(EventError::Config(
                "event_consumer_buffer_size must be greater than 0".into(),
            ));
        }
        if self.input_queue_size == 0 {
            return Err(EventError::Config(
                "input_queue_size must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
