//! Hub configuration

use std::time::Duration;

/// Lower bound for timer intervals; a zero period would panic the timers
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Settings for a [`Hub`](crate::hub::Hub)
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of each connection's outbound queue
    pub outbound_capacity: usize,

    /// Interval between heartbeat pings
    pub heartbeat_interval: Duration,

    pub relay: RelayConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            heartbeat_interval: Duration::from_secs(3),
            relay: RelayConfig::default(),
        }
    }
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the outbound queue capacity (at least 1)
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Set the heartbeat interval (never zero)
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn relay(mut self, relay: RelayConfig) -> Self {
        self.relay = relay;
        self
    }
}

/// Settings for the cross-process relay
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Capacity of the queue between the broadcaster and the bus
    pub uplink_capacity: usize,

    /// Initial delay before reconnecting to the bus
    pub backoff_min: Duration,

    /// Maximum delay between reconnection attempts
    pub backoff_max: Duration,

    /// How often the bus connection is checked while idle
    pub health_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            uplink_capacity: 1024,
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(30),
            health_interval: Duration::from_secs(1),
        }
    }
}

impl RelayConfig {
    /// Set the uplink queue capacity (at least 1)
    pub fn uplink_capacity(mut self, capacity: usize) -> Self {
        self.uplink_capacity = capacity.max(1);
        self
    }

    /// Set the reconnection delay range
    pub fn backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff_min = min;
        self.backoff_max = max.max(min);
        self
    }

    /// Set how often the bus connection is checked (never zero)
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.health_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Delay before reconnect attempt number `attempt` (0-based), without jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_min
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}
