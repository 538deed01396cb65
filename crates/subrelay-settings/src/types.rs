//! Settings types.

use serde::{Deserialize, Serialize};

/// Port the federated query executor listens on when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 4000;

/// Log filter used when `LOG_LEVEL` is unset.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Bind address of the relay listener when `RELAY_HOST` is unset.
pub const DEFAULT_RELAY_HOST: &str = "0.0.0.0";

/// The relay listens this many ports above the query executor.
pub const RELAY_PORT_OFFSET: u16 = 1;

/// One upstream subgraph.
///
/// Every descriptor is handed to the federated query executor. Only those
/// with a `ws_url` take part in subscription fan-out.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamDescriptor {
    /// Unique name within one configuration.
    pub name: String,
    /// HTTP query endpoint.
    pub url: String,
    /// WebSocket subscription endpoint, if the subgraph has one.
    #[serde(rename = "wsUrl", default, skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
}

impl UpstreamDescriptor {
    /// Descriptor without a subscription endpoint.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            ws_url: None,
        }
    }

    /// Attach a subscription endpoint.
    #[must_use]
    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    /// Whether this upstream takes part in subscription fan-out.
    pub fn supports_subscriptions(&self) -> bool {
        self.ws_url.is_some()
    }
}

/// Output format of the stderr log stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per event, for log shippers.
    Json,
}

impl LogFormat {
    /// Parse a `LOG_FORMAT` value (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "compact" | "text" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Complete gateway configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Port of the federated query executor. The relay uses `port + 1`.
    pub port: u16,
    /// Bind address of the relay listener.
    pub relay_host: String,
    /// Upstream subgraphs, in configuration order.
    pub subgraphs: Vec<UpstreamDescriptor>,
    /// Message broker URL carried for the deployment.
    pub rabbitmq_url: String,
    /// Log aggregation host, if logs are shipped off-host.
    pub loki_host: Option<String>,
    /// Tracing filter directive.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl RelaySettings {
    /// Port the subscription relay listens on.
    ///
    /// The loader rejects `port == u16::MAX`, so this never collides with
    /// the query executor for loaded settings.
    pub fn relay_port(&self) -> u16 {
        self.port.saturating_add(RELAY_PORT_OFFSET)
    }

    /// Upstreams that take part in subscription fan-out.
    pub fn subscription_upstreams(&self) -> impl Iterator<Item = &UpstreamDescriptor> {
        self.subgraphs.iter().filter(|sg| sg.supports_subscriptions())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(port: u16) -> RelaySettings {
        RelaySettings {
            port,
            relay_host: DEFAULT_RELAY_HOST.into(),
            subgraphs: vec![
                UpstreamDescriptor::new("a", "http://a/graphql"),
                UpstreamDescriptor::new("b", "http://b/graphql").with_ws_url("ws://b/graphql"),
            ],
            rabbitmq_url: "amqp://localhost:5672".into(),
            loki_host: None,
            log_level: DEFAULT_LOG_LEVEL.into(),
            log_format: LogFormat::Compact,
        }
    }

    #[test]
    fn relay_port_is_offset_by_one() {
        assert_eq!(settings(4000).relay_port(), 4001);
    }

    #[test]
    fn subscription_upstreams_filters_missing_ws_url() {
        let s = settings(4000);
        let names: Vec<_> = s.subscription_upstreams().map(|sg| sg.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn descriptor_serde_uses_ws_url_camel_case() {
        let d = UpstreamDescriptor::new("b", "http://b").with_ws_url("ws://b");
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["wsUrl"], "ws://b");

        let bare = serde_json::to_value(UpstreamDescriptor::new("a", "http://a")).unwrap();
        assert!(bare.get("wsUrl").is_none());
    }

    #[test]
    fn log_format_parse() {
        assert_eq!(LogFormat::parse("JSON"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("compact"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("yaml"), None);
    }
}
