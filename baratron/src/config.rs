use std::path::Path;
use std::time::Duration;

use baratron_client::ClientConfig;
use color_eyre::eyre::eyre;
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub client: ClientConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Milliseconds between snapshots in `--stream` mode
    pub interval_ms: u64,
}

impl StreamConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> color_eyre::Result<()> {
        if self.stream.interval_ms == 0 {
            return Err(eyre!("stream.interval_ms must be at least 1"));
        }
        if self.client.timeout_ms == 0 {
            return Err(eyre!("client.timeout_ms must be at least 1"));
        }
        if self.client.connect_timeout_ms == 0 {
            return Err(eyre!("client.connect_timeout_ms must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [client]
            port = 8080
            timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.client.port, 8080);
        assert_eq!(config.client.timeout(), Duration::from_millis(250));
        assert_eq!(config.client.resync_grace_ms, 1000);
        assert_eq!(config.stream.interval(), Duration::from_secs(1));
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.client.port, 80);
        assert_eq!(config.stream.interval_ms, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_durations_are_rejected() {
        let config: Config = toml::from_str("[stream]\ninterval_ms = 0").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("[client]\ntimeout_ms = 0").unwrap();
        assert!(config.validate().is_err());
    }
}
