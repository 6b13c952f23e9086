use std::time::Duration;

use serde::Deserialize;

/// Port ToolWeb listens on unless the device was reconfigured.
pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// TCP port of the device
    pub port: u16,
    /// Per-request deadline in milliseconds, counted from submission
    pub timeout_ms: u64,
    /// Limit on establishing the TCP connection
    pub connect_timeout_ms: u64,
    /// How long to wait for the late reply of a timed-out request before
    /// giving up on the connection
    pub resync_grace_ms: u64,
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn resync_grace(&self) -> Duration {
        Duration::from_millis(self.resync_grace_ms)
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            timeout_ms: 1000,
            connect_timeout_ms: 1000,
            resync_grace_ms: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn huge_timeout_saturates() {
        let config = ClientConfig::default().with_timeout(Duration::MAX);
        assert_eq!(config.timeout_ms, u64::MAX);
        assert_eq!(config.timeout(), Duration::from_millis(u64::MAX));

        let config = ClientConfig::default().with_timeout(Duration::from_millis(250));
        assert_eq!(config.timeout_ms, 250);
    }
}
