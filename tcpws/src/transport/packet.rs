//! Plaintext packet framing.
//!
//! Every packet is laid out as follows, all integers little-endian:
//!
//! | field          | size            |
//! |----------------|-----------------|
//! | magic          | 4 (`0xDEADBEEF`)|
//! | client id      | 16 (RFC 4122)   |
//! | message kind   | 4               |
//! | address tag    | 1 (0 / 4 / 6)   |
//! | address        | 0, 4 or 16      |
//! | port           | 4               |
//! | payload length | 4               |
//! | payload        | payload length  |

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const MAGIC: u32 = 0xDEAD_BEEF;

/// magic + client id + kind + address tag + port + payload length
pub const MIN_FRAME_LEN: usize = 4 + 16 + 4 + 1 + 4 + 4;

const TAG_NONE: u8 = 0;
const TAG_V4: u8 = 4;
const TAG_V6: u8 = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
    #[error("bad magic marker {0:#010x}")]
    BadMagic(u32),
    #[error("unknown address tag {0}")]
    UnknownAddressTag(u8),
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u32),
    #[error("port {0} is out of range")]
    InvalidPort(u32),
    #[error("payload declares {declared} bytes but only {available} remain")]
    Truncated { declared: usize, available: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
    #[error("invalid IV length {0}")]
    InvalidIvLength(u8),
    #[error("ciphertext is empty or not block aligned")]
    InvalidCiphertext,
    #[error("bad block padding")]
    BadPadding,
    #[error("message authentication failed")]
    AuthenticationFailure,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("payload of {0} bytes does not fit a 32-bit length field")]
    PayloadTooLarge(usize),
    #[error("cipher setup failed")]
    Cipher,
}

/// Identifies one logical TCP stream end to end.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Session-level notices that do not belong to any stream.
    pub const CONTROL: ClientId = ClientId(Uuid::nil());

    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn is_control(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl From<Uuid> for ClientId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Text = 1,
    Binary = 2,
    File = 3,
    Error = 4,
    Disconnect = 5,
    HandshakeRequest = 10,
    PublicKey = 11,
    EncryptedSymmetricKey = 12,
    HandshakeComplete = 13,
}

impl MessageKind {
    pub fn is_data(self) -> bool {
        matches!(self, Self::Text | Self::Binary | Self::File)
    }

    pub fn is_handshake(self) -> bool {
        matches!(
            self,
            Self::HandshakeRequest
                | Self::PublicKey
                | Self::EncryptedSymmetricKey
                | Self::HandshakeComplete
        )
    }
}

impl TryFrom<u32> for MessageKind {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, DecodeError> {
        Ok(match value {
            1 => Self::Text,
            2 => Self::Binary,
            3 => Self::File,
            4 => Self::Error,
            5 => Self::Disconnect,
            10 => Self::HandshakeRequest,
            11 => Self::PublicKey,
            12 => Self::EncryptedSymmetricKey,
            13 => Self::HandshakeComplete,
            other => return Err(DecodeError::UnknownMessageKind(other)),
        })
    }
}

/// Destination a stream's bytes must reach on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Target {
    pub address: Option<IpAddr>,
    pub port: u16,
}

impl Target {
    pub const NONE: Target = Target {
        address: None,
        port: 0,
    };

    pub fn new(address: IpAddr, port: u16) -> Self {
        Self {
            address: Some(address),
            port,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.address.map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Target {
    fn from(value: SocketAddr) -> Self {
        Self::new(value.ip(), value.port())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.socket_addr() {
            Some(addr) => write!(f, "{}", addr),
            None => write!(f, "-:{}", self.port),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub client_id: ClientId,
    pub kind: MessageKind,
    pub target: Target,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(client_id: ClientId, kind: MessageKind, target: Target, payload: impl Into<Bytes>) -> Self {
        Self {
            client_id,
            kind,
            target,
            payload: payload.into(),
        }
    }

    pub fn data(client_id: ClientId, target: Target, payload: impl Into<Bytes>) -> Self {
        Self::new(client_id, MessageKind::Binary, target, payload)
    }

    pub fn error(client_id: ClientId, target: Target, reason: &str) -> Self {
        Self::new(
            client_id,
            MessageKind::Error,
            target,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn disconnect(client_id: ClientId, target: Target, reason: &str) -> Self {
        Self::new(
            client_id,
            MessageKind::Disconnect,
            target,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn control(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self::new(ClientId::CONTROL, kind, Target::NONE, payload)
    }

    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub(crate) fn encoded_len(&self) -> usize {
        let address_len = match self.target.address {
            None => 0,
            Some(IpAddr::V4(_)) => 4,
            Some(IpAddr::V6(_)) => 16,
        };
        MIN_FRAME_LEN + address_len + self.payload.len()
    }

    /// Serializes the plaintext frame.
    pub fn to_frame(&self) -> Result<BytesMut, EncodeError> {
        let payload_len = u32::try_from(self.payload.len())
            .map_err(|_| EncodeError::PayloadTooLarge(self.payload.len()))?;

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u32_le(MAGIC);
        buf.put_slice(self.client_id.as_bytes());
        buf.put_u32_le(self.kind as u32);
        match self.target.address {
            None => buf.put_u8(TAG_NONE),
            Some(IpAddr::V4(v4)) => {
                buf.put_u8(TAG_V4);
                buf.put_slice(&v4.octets());
            }
            Some(IpAddr::V6(v6)) => {
                buf.put_u8(TAG_V6);
                buf.put_slice(&v6.octets());
            }
        }
        buf.put_u32_le(u32::from(self.target.port));
        buf.put_u32_le(payload_len);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Parses a plaintext frame. The whole buffer must be consumed.
    pub fn from_frame(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(DecodeError::TooShort {
                len: frame.len(),
                min: MIN_FRAME_LEN,
            });
        }

        let mut buf = frame;
        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }

        let mut id = [0u8; 16];
        buf.copy_to_slice(&mut id);
        let kind = MessageKind::try_from(buf.get_u32_le())?;

        let address = match buf.get_u8() {
            TAG_NONE => None,
            TAG_V4 => {
                ensure_remaining(buf, 4 + 8, frame.len())?;
                let mut octets = [0u8; 4];
                buf.copy_to_slice(&mut octets);
                Some(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            TAG_V6 => {
                ensure_remaining(buf, 16 + 8, frame.len())?;
                let mut octets = [0u8; 16];
                buf.copy_to_slice(&mut octets);
                Some(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            tag => return Err(DecodeError::UnknownAddressTag(tag)),
        };

        let port = buf.get_u32_le();
        let port = u16::try_from(port).map_err(|_| DecodeError::InvalidPort(port))?;

        let declared = buf.get_u32_le() as usize;
        if declared > buf.remaining() {
            return Err(DecodeError::Truncated {
                declared,
                available: buf.remaining(),
            });
        }
        let payload = Bytes::copy_from_slice(&buf[..declared]);
        buf.advance(declared);
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            client_id: ClientId::from_bytes(id),
            kind,
            target: Target { address, port },
            payload,
        })
    }
}

fn ensure_remaining(buf: &[u8], needed: usize, total: usize) -> Result<(), DecodeError> {
    if buf.len() < needed {
        return Err(DecodeError::TooShort {
            len: total,
            min: total - buf.len() + needed,
        });
    }
    Ok(())
}
