//! Settings loading from environment variables.
//!
//! Loading flow:
//! 1. Read required variables (`SUBGRAPHS`, `RABBITMQ_URL`), failing if absent
//! 2. Parse `SUBGRAPHS` as a JSON array of descriptors and validate each entry
//! 3. Apply optional variables; invalid optional values fall back to defaults
//!
//! All parsing goes through an injected lookup so tests never touch the
//! process environment.

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{
    DEFAULT_LOG_LEVEL, DEFAULT_PORT, DEFAULT_RELAY_HOST, LogFormat, RelaySettings,
    UpstreamDescriptor,
};

/// Load settings from the process environment.
pub fn load_settings() -> Result<RelaySettings> {
    load_settings_from(|key| std::env::var(key).ok())
}

/// Load settings through an arbitrary variable lookup.
pub fn load_settings_from<F>(lookup: F) -> Result<RelaySettings>
where
    F: Fn(&str) -> Option<String>,
{
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

    let port = parse_port(read("PORT").as_deref());
    if port == u16::MAX {
        return Err(SettingsError::InvalidValue(format!(
            "PORT {port} leaves no room for the relay listener on PORT+1"
        )));
    }

    let subgraphs = parse_subgraphs(read("SUBGRAPHS").as_deref())?;
    let rabbitmq_url = read("RABBITMQ_URL").ok_or(SettingsError::MissingEnv("RABBITMQ_URL"))?;

    if subgraphs.is_empty() {
        return Err(SettingsError::InvalidSubgraphs(
            "SUBGRAPHS must contain at least one subgraph".into(),
        ));
    }

    let log_format = match read("LOG_FORMAT") {
        Some(v) => LogFormat::parse(&v).unwrap_or_else(|| {
            warn!(key = "LOG_FORMAT", value = %v, "invalid log format, ignoring");
            LogFormat::default()
        }),
        None => LogFormat::default(),
    };

    let settings = RelaySettings {
        port,
        relay_host: read("RELAY_HOST").unwrap_or_else(|| DEFAULT_RELAY_HOST.to_string()),
        subgraphs,
        rabbitmq_url,
        loki_host: read("LOKI_HOST"),
        log_level: read("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        log_format,
    };
    debug!(
        port = settings.port,
        subgraphs = settings.subgraphs.len(),
        "settings loaded"
    );
    Ok(settings)
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse `PORT`. Missing, non-numeric, zero and negative values fall back to
/// [`DEFAULT_PORT`]; so does anything above `u16::MAX`.
pub fn parse_port(value: Option<&str>) -> u16 {
    let Some(raw) = value else {
        return DEFAULT_PORT;
    };
    match raw.trim().parse::<i64>() {
        Ok(n) if n > 0 => u16::try_from(n).unwrap_or_else(|_| {
            warn!(key = "PORT", value = raw, "port out of range, using default");
            DEFAULT_PORT
        }),
        _ => {
            warn!(key = "PORT", value = raw, "invalid port, using default");
            DEFAULT_PORT
        }
    }
}

/// Parse `SUBGRAPHS`: a JSON array of `{name, url, wsUrl?}` objects.
///
/// `name` and `url` must be non-empty strings and names must be unique. An
/// empty or `null` `wsUrl` means the subgraph has no subscription endpoint.
pub fn parse_subgraphs(value: Option<&str>) -> Result<Vec<UpstreamDescriptor>> {
    let raw = value.ok_or(SettingsError::MissingEnv("SUBGRAPHS"))?;

    let parsed: Value = serde_json::from_str(raw)
        .map_err(|e| SettingsError::InvalidSubgraphs(format!("SUBGRAPHS is not valid JSON: {e}")))?;
    let Value::Array(entries) = parsed else {
        return Err(SettingsError::InvalidSubgraphs(
            "SUBGRAPHS must be a JSON array".into(),
        ));
    };

    let mut seen = HashSet::new();
    let mut subgraphs = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let descriptor = parse_subgraph(index, entry)?;
        if !seen.insert(descriptor.name.clone()) {
            return Err(SettingsError::InvalidSubgraphs(format!(
                "duplicate subgraph name \"{}\"",
                descriptor.name
            )));
        }
        subgraphs.push(descriptor);
    }
    Ok(subgraphs)
}

fn parse_subgraph(index: usize, entry: &Value) -> Result<UpstreamDescriptor> {
    let name = non_empty_str(entry, "name").ok_or_else(|| {
        SettingsError::InvalidSubgraphs(format!(
            "subgraph at index {index} missing required \"name\" field"
        ))
    })?;
    let url = non_empty_str(entry, "url").ok_or_else(|| {
        SettingsError::InvalidSubgraphs(format!(
            "subgraph \"{name}\" missing required \"url\" field"
        ))
    })?;
    let ws_url = match entry.get("wsUrl") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(SettingsError::InvalidSubgraphs(format!(
                "subgraph \"{name}\" has a non-string \"wsUrl\" field"
            )));
        }
    };

    Ok(UpstreamDescriptor {
        name: name.to_string(),
        url: url.to_string(),
        ws_url,
    })
}

fn non_empty_str<'a>(entry: &'a Value, field: &str) -> Option<&'a str> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    const ONE_SUBGRAPH: &str =
        r#"[{"name":"docker-health-monitor","url":"http://localhost:4002/graphql"}]"#;

    fn base_env() -> HashMap<&'static str, String> {
        HashMap::from([
            ("SUBGRAPHS", ONE_SUBGRAPH.to_string()),
            ("RABBITMQ_URL", "amqp://localhost:5672".to_string()),
        ])
    }

    fn load(env: &HashMap<&'static str, String>) -> Result<RelaySettings> {
        load_settings_from(|key| env.get(key).cloned())
    }

    // ── required variables ──────────────────────────────────────────

    #[test]
    fn missing_subgraphs_is_an_error() {
        let mut env = base_env();
        let _ = env.remove("SUBGRAPHS");
        assert_matches!(load(&env), Err(SettingsError::MissingEnv("SUBGRAPHS")));
    }

    #[test]
    fn missing_rabbitmq_url_is_an_error() {
        let mut env = base_env();
        let _ = env.remove("RABBITMQ_URL");
        assert_matches!(load(&env), Err(SettingsError::MissingEnv("RABBITMQ_URL")));
    }

    #[test]
    fn empty_rabbitmq_url_counts_as_missing() {
        let mut env = base_env();
        let _ = env.insert("RABBITMQ_URL", String::new());
        assert_matches!(load(&env), Err(SettingsError::MissingEnv("RABBITMQ_URL")));
    }

    #[test]
    fn empty_subgraph_array_is_an_error() {
        let mut env = base_env();
        let _ = env.insert("SUBGRAPHS", "[]".into());
        assert_matches!(load(&env), Err(SettingsError::InvalidSubgraphs(msg)) if msg.contains("at least one"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let mut env = base_env();
        let _ = env.insert("SUBGRAPHS", "not-json".into());
        assert_matches!(load(&env), Err(SettingsError::InvalidSubgraphs(msg)) if msg.contains("not valid JSON"));
    }

    #[test]
    fn non_array_is_an_error() {
        let err = parse_subgraphs(Some(r#"{"name":"a"}"#)).unwrap_err();
        assert!(err.to_string().contains("must be a JSON array"));
    }

    #[test]
    fn subgraph_missing_name_is_an_error() {
        let err = parse_subgraphs(Some(r#"[{"url":"http://localhost:4002/graphql"}]"#)).unwrap_err();
        assert!(err.to_string().contains("index 0 missing required \"name\""));
    }

    #[test]
    fn subgraph_missing_url_is_an_error() {
        let err = parse_subgraphs(Some(r#"[{"name":"test-service"}]"#)).unwrap_err();
        assert!(err.to_string().contains("\"test-service\" missing required \"url\""));
    }

    #[test]
    fn subgraph_with_numeric_name_is_an_error() {
        let err = parse_subgraphs(Some(r#"[{"name":7,"url":"http://x"}]"#)).unwrap_err();
        assert!(err.to_string().contains("\"name\""));
    }

    #[test]
    fn duplicate_names_are_an_error() {
        let err = parse_subgraphs(Some(
            r#"[{"name":"a","url":"http://a"},{"name":"a","url":"http://b"}]"#,
        ))
        .unwrap_err();
        assert!(err.to_string().contains("duplicate subgraph name \"a\""));
    }

    #[test]
    fn non_string_ws_url_is_an_error() {
        let err = parse_subgraphs(Some(r#"[{"name":"a","url":"http://a","wsUrl":1}]"#)).unwrap_err();
        assert!(err.to_string().contains("wsUrl"));
    }

    // ── subgraph parsing ────────────────────────────────────────────

    #[test]
    fn parses_single_subgraph() {
        let settings = load(&base_env()).unwrap();
        assert_eq!(
            settings.subgraphs,
            vec![UpstreamDescriptor::new(
                "docker-health-monitor",
                "http://localhost:4002/graphql"
            )]
        );
    }

    #[test]
    fn parses_multiple_subgraphs_in_order() {
        let subgraphs = parse_subgraphs(Some(
            r#"[
                {"name":"service-a","url":"http://localhost:4001/graphql"},
                {"name":"service-b","url":"http://localhost:4002/graphql","wsUrl":"ws://localhost:4003/graphql"}
            ]"#,
        ))
        .unwrap();
        assert_eq!(subgraphs.len(), 2);
        assert_eq!(subgraphs[0].name, "service-a");
        assert_eq!(subgraphs[0].ws_url, None);
        assert_eq!(subgraphs[1].name, "service-b");
        assert_eq!(
            subgraphs[1].ws_url.as_deref(),
            Some("ws://localhost:4003/graphql")
        );
    }

    #[test]
    fn empty_ws_url_means_no_subscriptions() {
        let subgraphs =
            parse_subgraphs(Some(r#"[{"name":"a","url":"http://a","wsUrl":""}]"#)).unwrap();
        assert!(!subgraphs[0].supports_subscriptions());
    }

    #[test]
    fn extra_fields_are_ignored() {
        let subgraphs =
            parse_subgraphs(Some(r#"[{"name":"a","url":"http://a","owner":"team"}]"#)).unwrap();
        assert_eq!(subgraphs[0], UpstreamDescriptor::new("a", "http://a"));
    }

    // ── defaults ────────────────────────────────────────────────────

    #[test]
    fn defaults_apply() {
        let settings = load(&base_env()).unwrap();
        assert_eq!(settings.port, 4000);
        assert_eq!(settings.relay_port(), 4001);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.log_format, LogFormat::Compact);
        assert_eq!(settings.relay_host, "0.0.0.0");
        assert!(settings.loki_host.is_none());
    }

    // ── custom values ───────────────────────────────────────────────

    #[test]
    fn custom_values_apply() {
        let mut env = base_env();
        let _ = env.insert("PORT", "8080".into());
        let _ = env.insert("LOKI_HOST", "http://loki:3100".into());
        let _ = env.insert("LOG_LEVEL", "debug".into());
        let _ = env.insert("LOG_FORMAT", "json".into());
        let _ = env.insert("RELAY_HOST", "127.0.0.1".into());

        let settings = load(&env).unwrap();
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.relay_port(), 8081);
        assert_eq!(settings.loki_host.as_deref(), Some("http://loki:3100"));
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.relay_host, "127.0.0.1");
    }

    #[test]
    fn invalid_log_format_falls_back() {
        let mut env = base_env();
        let _ = env.insert("LOG_FORMAT", "xml".into());
        assert_eq!(load(&env).unwrap().log_format, LogFormat::Compact);
    }

    // ── port validation ─────────────────────────────────────────────

    #[test]
    fn parse_port_fallbacks() {
        assert_eq!(parse_port(None), 4000);
        assert_eq!(parse_port(Some("invalid")), 4000);
        assert_eq!(parse_port(Some("-1")), 4000);
        assert_eq!(parse_port(Some("0")), 4000);
        assert_eq!(parse_port(Some("70000")), 4000);
        assert_eq!(parse_port(Some("9000")), 9000);
    }

    #[test]
    fn max_port_is_rejected() {
        let mut env = base_env();
        let _ = env.insert("PORT", "65535".into());
        assert_matches!(load(&env), Err(SettingsError::InvalidValue(_)));
    }
}
