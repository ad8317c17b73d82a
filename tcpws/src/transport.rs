//! Packet codec: plaintext framing plus the optional authenticated envelope.

pub mod cipher;
pub mod message;
pub mod packet;

pub use cipher::SessionKey;
pub use message::Message;
pub use packet::{ClientId, DecodeError, EncodeError, MessageKind, Packet, Target};
