//! Client configuration from environment variables.

use std::time::Duration;

use url::Url;

use crate::ws::ReconnectPolicy;

const DEFAULT_API_URL: &str = "http://localhost:8000/api";
const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is not a valid URL: {source}")]
    InvalidUrl {
        var: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("{var} has an invalid value {value:?}")]
    InvalidValue { var: &'static str, value: String },
}

/// Timing knobs for the session lifecycle tracker.
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Redirect automatically once the session is archived, when the server suggests it.
    pub auto_redirect: bool,
    /// How long before the archival deadline the "archival imminent" warning fires.
    pub warning_lead: Duration,
    /// How often the countdown is recomputed from the clock.
    pub tick: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            auto_redirect: true,
            warning_lead: Duration::from_secs(5 * 60),
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for the REST surface (`.../sessions/<id>/cart/` etc.).
    pub api_base_url: String,
    /// Base URL for the duplex endpoint; `session/<id>/` is appended.
    pub ws_base_url: Url,
    pub reconnect: ReconnectPolicy,
    pub lifecycle: LifecycleOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            ws_base_url: Url::parse(DEFAULT_WS_URL).expect("default websocket URL is valid"),
            reconnect: ReconnectPolicy::default(),
            lifecycle: LifecycleOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Build a configuration for explicit endpoints, keeping default timings.
    pub fn new(api_base_url: impl Into<String>, ws_base_url: &str) -> Result<Self, ConfigError> {
        let ws_base_url = Url::parse(ws_base_url).map_err(|source| ConfigError::InvalidUrl {
            var: "ws_base_url",
            source,
        })?;
        Ok(Self {
            api_base_url: api_base_url.into(),
            ws_base_url,
            ..Self::default()
        })
    }

    /// Parse configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TABLESIDE_API_URL`: REST base URL (default: "http://localhost:8000/api")
    /// - `TABLESIDE_WS_URL`: duplex endpoint base (default: "ws://localhost:8000/ws")
    /// - `TABLESIDE_AUTO_REDIRECT`: "true" | "false" (default: "true")
    /// - `TABLESIDE_RECONNECT_MAX_ATTEMPTS`: reconnection cap (default: 5)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base_url = lookup("TABLESIDE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let ws_raw = lookup("TABLESIDE_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());
        let ws_base_url = Url::parse(&ws_raw).map_err(|source| ConfigError::InvalidUrl {
            var: "TABLESIDE_WS_URL",
            source,
        })?;

        let mut config = Self {
            api_base_url,
            ws_base_url,
            ..Self::default()
        };

        if let Some(raw) = lookup("TABLESIDE_AUTO_REDIRECT") {
            config.lifecycle.auto_redirect = match raw.trim().to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: "TABLESIDE_AUTO_REDIRECT",
                        value: raw,
                    })
                }
            };
        }

        if let Some(raw) = lookup("TABLESIDE_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts =
                raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    var: "TABLESIDE_RECONNECT_MAX_ATTEMPTS",
                    value: raw.clone(),
                })?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = ClientConfig::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.api_base_url, DEFAULT_API_URL);
        assert_eq!(config.ws_base_url.as_str(), "ws://localhost:8000/ws");
        assert_eq!(config.reconnect.max_attempts, 5);
        assert!(config.lifecycle.auto_redirect);
    }

    #[test]
    fn reads_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("TABLESIDE_WS_URL", "wss://example.com/realtime"),
            ("TABLESIDE_AUTO_REDIRECT", "off"),
            ("TABLESIDE_RECONNECT_MAX_ATTEMPTS", "2"),
        ]))
        .unwrap();
        assert_eq!(config.ws_base_url.host_str(), Some("example.com"));
        assert!(!config.lifecycle.auto_redirect);
        assert_eq!(config.reconnect.max_attempts, 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            ClientConfig::from_lookup(lookup_from(&[("TABLESIDE_WS_URL", "not a url")])),
            Err(ConfigError::InvalidUrl { .. })
        ));
        assert!(matches!(
            ClientConfig::from_lookup(lookup_from(&[("TABLESIDE_AUTO_REDIRECT", "maybe")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
