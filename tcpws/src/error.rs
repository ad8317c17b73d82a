use std::io;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::config::ConfigError;
use crate::handshake::HandshakeError;
use crate::transport::{ClientId, DecodeError, EncodeError, Target};

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed packet: {0}")]
    MalformedPacket(DecodeError),

    #[error("packet authentication failed")]
    AuthenticationFailure,

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("target {target} unreachable: {source}")]
    TargetUnreachable {
        target: Target,
        #[source]
        source: io::Error,
    },

    #[error("transport closed")]
    TransportClosed,

    #[error("unknown client {0}")]
    UnknownClientId(ClientId),

    #[error("failed to encode packet: {0}")]
    Encode(#[from] EncodeError),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::AuthenticationFailure => Self::AuthenticationFailure,
            other => Self::MalformedPacket(other),
        }
    }
}

impl Error {
    /// Whether the error must end the whole session rather than one stream.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::TargetUnreachable { .. } | Self::UnknownClientId(_) | Self::TransportClosed
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
