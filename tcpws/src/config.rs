//! Validated configuration values handed to the proxies at construction time.
//! Loading them from disk is the front end's job.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::handshake::DEFAULT_RSA_BITS;
use crate::transport::Target;

/// Worst-case framing and envelope overhead on top of a data payload.
const PACKET_OVERHEAD: usize = 4 + 16 + 4 + 1 + 16 + 4 + 4 + 1 + 16 + 16 + 32;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no port mappings defined")]
    NoPortMappings,
    #[error("invalid target port 0 for listen port {0}")]
    ZeroTargetPort(u16),
    #[error("listen port {0} is mapped more than once")]
    DuplicateListenPort(u16),
    #[error("unsupported websocket url scheme '{0}', expected ws or wss")]
    UnsupportedScheme(String),
    #[error("buffer '{0}' must be greater than zero")]
    ZeroBuffer(&'static str),
    #[error("tcp read buffer of {buffer} bytes cannot fit in a {limit} byte message")]
    BufferExceedsMessage { buffer: usize, limit: usize },
    #[error("websocket path '{0}' must start with '/'")]
    InvalidPath(String),
    #[error("rsa key size {0} is below 1024 bits")]
    RsaTooSmall(usize),
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes read from a TCP socket per data packet.
    pub tcp_read_buffer: usize,
    pub websocket_read_buffer: usize,
    pub max_message_size: usize,
    /// Payloads that may wait for a slow TCP socket before it is dropped.
    pub write_queue_depth: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            tcp_read_buffer: 32 * 1024,
            websocket_read_buffer: 64 * 1024,
            max_message_size: 4 * 1024 * 1024,
            write_queue_depth: 256,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_read_buffer == 0 {
            return Err(ConfigError::ZeroBuffer("tcp_read_buffer"));
        }
        if self.websocket_read_buffer == 0 {
            return Err(ConfigError::ZeroBuffer("websocket_read_buffer"));
        }
        if self.max_message_size == 0 {
            return Err(ConfigError::ZeroBuffer("max_message_size"));
        }
        if self.write_queue_depth == 0 {
            return Err(ConfigError::ZeroBuffer("write_queue_depth"));
        }
        if self.tcp_read_buffer + PACKET_OVERHEAD > self.max_message_size {
            return Err(ConfigError::BufferExceedsMessage {
                buffer: self.tcp_read_buffer,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// `0` binds an ephemeral port.
    pub listen_port: u16,
    pub target_ip: IpAddr,
    pub target_port: u16,
}

impl PortMapping {
    pub fn target(&self) -> Target {
        Target::new(self.target_ip, self.target_port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Port {} -> {}",
            self.listen_port,
            SocketAddr::new(self.target_ip, self.target_port)
        )
    }
}

fn default_listen_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub websocket_url: Url,
    #[serde(default = "default_listen_address")]
    pub listen_address: IpAddr,
    pub port_mappings: Vec<PortMapping>,
    /// Extra headers sent with the WebSocket upgrade request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub buffers: BufferConfig,
}

impl LocalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.websocket_url.scheme() {
            "ws" | "wss" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }

        if self.port_mappings.is_empty() {
            return Err(ConfigError::NoPortMappings);
        }
        let mut seen = HashSet::new();
        for mapping in &self.port_mappings {
            if mapping.target_port == 0 {
                return Err(ConfigError::ZeroTargetPort(mapping.listen_port));
            }
            // Port 0 asks the OS for an ephemeral port and may repeat.
            if mapping.listen_port != 0 && !seen.insert(mapping.listen_port) {
                return Err(ConfigError::DuplicateListenPort(mapping.listen_port));
            }
        }

        for (name, value) in &self.headers {
            if http::HeaderName::from_bytes(name.as_bytes()).is_err()
                || http::HeaderValue::from_str(value).is_err()
            {
                return Err(ConfigError::InvalidHeader(name.clone()));
            }
        }

        self.buffers.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub listen: SocketAddr,
    /// Request path that is upgraded to the tunnel WebSocket.
    pub path: String,
    pub rsa_bits: usize,
    pub buffers: BufferConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            path: "/tunnel".to_string(),
            rsa_bits: DEFAULT_RSA_BITS,
            buffers: BufferConfig::default(),
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.path.starts_with('/') {
            return Err(ConfigError::InvalidPath(self.path.clone()));
        }
        if self.rsa_bits < 1024 {
            return Err(ConfigError::RsaTooSmall(self.rsa_bits));
        }
        self.buffers.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalConfig {
        LocalConfig {
            websocket_url: Url::parse("ws://localhost:8080/tunnel").unwrap(),
            listen_address: default_listen_address(),
            port_mappings: vec![PortMapping {
                listen_port: 9999,
                target_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                target_port: 8888,
            }],
            headers: BTreeMap::new(),
            buffers: BufferConfig::default(),
        }
    }

    #[test]
    fn test_valid_local_config() {
        local().validate().unwrap();
        assert_eq!(
            local().port_mappings[0].to_string(),
            "Port 9999 -> 127.0.0.1:8888"
        );
    }

    #[test]
    fn test_rejects_bad_local_config() {
        let mut config = local();
        config.websocket_url = Url::parse("http://localhost/tunnel").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedScheme(_))));

        let mut config = local();
        config.port_mappings.clear();
        assert!(matches!(config.validate(), Err(ConfigError::NoPortMappings)));

        let mut config = local();
        config.port_mappings.push(config.port_mappings[0].clone());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateListenPort(9999))
        ));

        let mut config = local();
        config.port_mappings[0].target_port = 0;
        assert!(matches!(config.validate(), Err(ConfigError::ZeroTargetPort(9999))));

        let mut config = local();
        config.headers.insert("bad header".into(), "x".into());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidHeader(_))));
    }

    #[test]
    fn test_buffer_must_fit_message() {
        let buffers = BufferConfig {
            tcp_read_buffer: 1024,
            websocket_read_buffer: 1024,
            max_message_size: 1024,
            ..BufferConfig::default()
        };
        assert!(matches!(
            buffers.validate(),
            Err(ConfigError::BufferExceedsMessage { .. })
        ));

        let buffers = BufferConfig {
            write_queue_depth: 0,
            ..BufferConfig::default()
        };
        assert!(matches!(
            buffers.validate(),
            Err(ConfigError::ZeroBuffer("write_queue_depth"))
        ));
    }

    #[test]
    fn test_remote_defaults_are_valid() {
        let config = RemoteConfig::default();
        config.validate().unwrap();

        let mut config = RemoteConfig::default();
        config.path = "tunnel".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPath(_))));
    }
}
