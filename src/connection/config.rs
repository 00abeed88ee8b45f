//! Client configuration

use std::time::Duration;

use alarm_stream_shared::{defaults, ReconnectPolicy};

/// Where the alarm channel lives when no explicit URL is given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Upgrade to `wss` (the page or service was reached over https)
    pub secure: bool,
    /// `host[:port]` of the current transport context
    pub host: String,
    /// Well-known path of the push endpoint
    pub path: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            secure: false,
            host: defaults::DEFAULT_HOST.into(),
            path: defaults::ALARM_CHANNEL_PATH.into(),
        }
    }
}

impl EndpointConfig {
    /// Derive the endpoint from an http(s) origin such as `https://example.com:8443`
    pub fn from_origin(origin: &str) -> Option<Self> {
        let (secure, rest) = if let Some(rest) = origin.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = origin.strip_prefix("http://") {
            (false, rest)
        } else {
            return None;
        };

        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() {
            return None;
        }

        Some(Self {
            secure,
            host: host.to_string(),
            ..Self::default()
        })
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "wss"
        } else {
            "ws"
        }
    }

    /// Full WebSocket URL of the endpoint
    pub fn url(&self) -> String {
        let path = self.path.trim_start_matches('/');
        format!("{}://{}/{}", self.scheme(), self.host, path)
    }
}

/// Configuration for the connection manager
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Used to derive the URL when `connect` is called without one
    pub endpoint: EndpointConfig,
    /// Reconnect backoff
    pub policy: ReconnectPolicy,
    /// Opening handshake timeout
    pub connect_timeout: Duration,
    /// Graceful close timeout
    pub close_timeout: Duration,
    /// Frames above this size are rejected as decode errors
    pub max_frame_bytes: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            policy: ReconnectPolicy::default(),
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            close_timeout: Duration::from_millis(defaults::CLOSE_TIMEOUT_MS),
            max_frame_bytes: defaults::MAX_FRAME_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_url() {
        let endpoint = EndpointConfig::default();
        assert_eq!(endpoint.url(), "ws://127.0.0.1:18080/channel/analysis/alarm");
    }

    #[test]
    fn test_secure_origin_upgrades_scheme() {
        let endpoint = EndpointConfig::from_origin("https://vmp.example.com:8443/#/analysis").unwrap();
        assert!(endpoint.secure);
        assert_eq!(
            endpoint.url(),
            "wss://vmp.example.com:8443/channel/analysis/alarm"
        );
    }

    #[test]
    fn test_plain_origin() {
        let endpoint = EndpointConfig::from_origin("http://10.0.0.5:18080").unwrap();
        assert_eq!(endpoint.url(), "ws://10.0.0.5:18080/channel/analysis/alarm");
    }

    #[test]
    fn test_rejects_unknown_origin() {
        assert!(EndpointConfig::from_origin("ftp://host").is_none());
        assert!(EndpointConfig::from_origin("https://").is_none());
    }

    #[test]
    fn test_custom_path_without_leading_slash() {
        let endpoint = EndpointConfig {
            path: "alarms/live".into(),
            ..Default::default()
        };
        assert_eq!(endpoint.url(), "ws://127.0.0.1:18080/alarms/live");
    }

    #[test]
    fn test_default_stream_config() {
        let config = StreamConfig::default();
        assert_eq!(config.policy.max_attempts, 5);
        assert_eq!(config.policy.base_delay, Duration::from_secs(3));
    }
}
