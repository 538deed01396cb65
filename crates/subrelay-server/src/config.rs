//! Relay listener configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use subrelay_settings::RelaySettings;

/// Configuration for the relay listener.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Path of the WebSocket endpoint.
    pub path: String,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Frames queued per connection before forwarders wait on the writer.
    pub outbound_buffer: usize,
    /// How long `stop` waits for the listener to drain.
    pub shutdown_timeout_secs: u64,
}

impl ServerConfig {
    /// Listener config for loaded settings: `RELAY_HOST` on `PORT + 1`.
    pub fn from_settings(settings: &RelaySettings) -> Self {
        Self {
            host: settings.relay_host.clone(),
            port: settings.relay_port(),
            ..Self::default()
        }
    }

    /// [`shutdown_timeout_secs`](Self::shutdown_timeout_secs) as a duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            path: "/graphql".into(),
            max_message_size: 16 * 1024 * 1024, // 16 MB
            outbound_buffer: 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use subrelay_settings::{LogFormat, UpstreamDescriptor};

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.path, "/graphql");
        assert_eq!(cfg.outbound_buffer, 1024);
        assert_eq!(cfg.shutdown_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn from_settings_uses_relay_port_and_host() {
        let settings = RelaySettings {
            port: 4000,
            relay_host: "0.0.0.0".into(),
            subgraphs: vec![UpstreamDescriptor::new("a", "http://a")],
            rabbitmq_url: "amqp://localhost".into(),
            loki_host: None,
            log_level: "info".into(),
            log_format: LogFormat::Compact,
        };
        let cfg = ServerConfig::from_settings(&settings);
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 4001);
        assert_eq!(cfg.path, "/graphql");
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
