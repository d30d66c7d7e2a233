//! Configuration for Tether clients and servers.
//!
//! All structs deserialize from TOML with every field optional; missing
//! fields take the defaults below.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Default first reconnection delay in milliseconds.
pub const DEFAULT_RECONNECTION_MINIMUM_MS: u64 = 200;
/// Default multiplier applied to the delay after each failed attempt.
pub const DEFAULT_RECONNECTION_FACTOR: f64 = 1.15;

/// Which codec turns envelopes into frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// JSON text frames.
    Json,
    /// MessagePack binary frames with named fields.
    #[default]
    #[serde(alias = "messagepack")]
    Msgpack,
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Msgpack => write!(f, "msgpack"),
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::Msgpack),
            other => Err(format!("unknown codec '{other}' (expected json or msgpack)")),
        }
    }
}

/// Client-side connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpoint to connect to.
    pub url: String,
    /// Subprotocols offered during the handshake.
    pub protocols: Vec<String>,
    /// Reconnect after an unclean closure.
    pub auto_reconnect: bool,
    /// First reconnection delay in milliseconds.
    pub reconnection_minimum_ms: u64,
    /// Delay multiplier after each failed attempt. Must be greater than 1.
    pub reconnection_factor: f64,
    /// Optional ceiling on the reconnection delay. Unset means unbounded.
    pub reconnection_maximum_ms: Option<u64>,
    /// Optional per-request timeout. Unset means requests wait forever.
    pub request_timeout_ms: Option<u64>,
    /// Envelope codec.
    pub codec: CodecKind,
    /// Largest accepted inbound message, in bytes. Unset keeps the transport default.
    pub max_message_size: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8000".to_string(),
            protocols: Vec::new(),
            auto_reconnect: true,
            reconnection_minimum_ms: DEFAULT_RECONNECTION_MINIMUM_MS,
            reconnection_factor: DEFAULT_RECONNECTION_FACTOR,
            reconnection_maximum_ms: None,
            request_timeout_ms: None,
            codec: CodecKind::default(),
            max_message_size: None,
        }
    }
}

impl ClientConfig {
    /// First reconnection delay.
    pub fn reconnection_minimum(&self) -> Duration {
        Duration::from_millis(self.reconnection_minimum_ms)
    }

    /// Ceiling on the reconnection delay, if any.
    pub fn reconnection_maximum(&self) -> Option<Duration> {
        self.reconnection_maximum_ms.map(Duration::from_millis)
    }

    /// Per-request timeout, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the reconnection settings.
    ///
    /// - `reconnection_minimum_ms` must be non-zero.
    /// - `reconnection_factor` must be a finite number greater than 1.
    /// - `reconnection_maximum_ms`, if set, must not be below the minimum.
    pub fn validate(&self) -> Result<(), String> {
        if self.reconnection_minimum_ms == 0 {
            return Err("reconnection_minimum_ms must be greater than 0".to_string());
        }
        if !self.reconnection_factor.is_finite() || self.reconnection_factor <= 1.0 {
            return Err(format!(
                "reconnection_factor must be greater than 1 (got {})",
                self.reconnection_factor
            ));
        }
        if let Some(max) = self.reconnection_maximum_ms {
            if max < self.reconnection_minimum_ms {
                return Err(format!(
                    "reconnection_maximum_ms ({max}) is below reconnection_minimum_ms ({})",
                    self.reconnection_minimum_ms
                ));
            }
        }
        if self.request_timeout_ms == Some(0) {
            return Err("request_timeout_ms must be greater than 0 when set".to_string());
        }
        Ok(())
    }
}

/// Server-side listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Subprotocols the server agrees to, in preference order.
    pub protocols: Vec<String>,
    /// Optional per-request timeout for requests sent to peers.
    pub request_timeout_ms: Option<u64>,
    /// Envelope codec.
    pub codec: CodecKind,
    /// Largest accepted inbound message, in bytes.
    pub max_message_size: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            protocols: Vec::new(),
            request_timeout_ms: None,
            codec: CodecKind::default(),
            max_message_size: None,
        }
    }
}

impl ServerConfig {
    /// Per-request timeout for requests sent to peers, if any.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Reject a zero request timeout.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout_ms == Some(0) {
            return Err("request_timeout_ms must be greater than 0 when set".to_string());
        }
        Ok(())
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Root configuration file layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TetherConfig {
    pub client: ClientConfig,
    pub server: ServerConfig,
    pub log: LogConfig,
}

impl TetherConfig {
    /// Validate both sections.
    pub fn validate(&self) -> Result<(), String> {
        self.client.validate().map_err(|e| format!("[client] {e}"))?;
        self.server.validate().map_err(|e| format!("[server] {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_defaults() {
        let config = ClientConfig::default();
        assert!(config.auto_reconnect);
        assert_eq!(config.reconnection_minimum(), Duration::from_millis(200));
        assert!((config.reconnection_factor - 1.15).abs() < f64::EPSILON);
        assert_eq!(config.reconnection_maximum(), None);
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.codec, CodecKind::Msgpack);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let toml_str = r#"
            [client]
            url = "ws://example.test:9000/rpc"
            reconnection_factor = 2.0
            codec = "json"

            [server]
            listen_addr = "0.0.0.0:9100"
        "#;
        let config: TetherConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.url, "ws://example.test:9000/rpc");
        assert!((config.client.reconnection_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.client.reconnection_minimum_ms, 200);
        assert_eq!(config.client.codec, CodecKind::Json);
        assert_eq!(config.server.listen_addr.port(), 9100);
        assert_eq!(config.server.codec, CodecKind::Msgpack);
        assert_eq!(config.log.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_backoff() {
        let mut config = ClientConfig {
            reconnection_factor: 1.0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().contains("reconnection_factor"));

        config.reconnection_factor = 1.5;
        config.reconnection_minimum_ms = 0;
        assert!(config.validate().is_err());

        config.reconnection_minimum_ms = 500;
        config.reconnection_maximum_ms = Some(100);
        assert!(config.validate().unwrap_err().contains("below"));
    }

    #[test]
    fn test_root_validate_names_section() {
        let mut config = TetherConfig::default();
        config.server.request_timeout_ms = Some(0);
        assert!(config.validate().unwrap_err().starts_with("[server]"));
    }

    #[test]
    fn test_codec_kind_parsing() {
        assert_eq!("JSON".parse::<CodecKind>().unwrap(), CodecKind::Json);
        assert_eq!("messagepack".parse::<CodecKind>().unwrap(), CodecKind::Msgpack);
        assert!("cbor".parse::<CodecKind>().is_err());
        assert_eq!(CodecKind::Msgpack.to_string(), "msgpack");
    }
}
