use bytes::Bytes;
use rand::rngs::OsRng;

use super::cipher::{self, SessionKey};
use super::packet::{DecodeError, EncodeError, Packet};

/// One encoded packet, exactly as carried by a single WebSocket message.
#[derive(Debug, Clone)]
pub struct Message {
    inner: Bytes,
}

impl From<Bytes> for Message {
    fn from(value: Bytes) -> Self {
        Self { inner: value }
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self {
            inner: value.into(),
        }
    }
}

impl From<Message> for Bytes {
    fn from(value: Message) -> Self {
        value.inner
    }
}

impl Message {
    pub fn into_inner(self) -> Bytes {
        self.inner
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Frames `packet`, sealing it when a session key is present.
    pub fn encode(packet: &Packet, key: Option<&SessionKey>) -> Result<Self, EncodeError> {
        let frame = packet.to_frame()?;
        match key {
            None => Ok(frame.freeze().into()),
            Some(key) => Ok(cipher::seal(key, &frame, &mut OsRng)?.into()),
        }
    }

    pub fn decode(&self, key: Option<&SessionKey>) -> Result<Packet, DecodeError> {
        match key {
            None => Packet::from_frame(&self.inner),
            Some(key) => {
                let frame = cipher::open(key, &self.inner)?;
                Packet::from_frame(&frame)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use crate::transport::{ClientId, MessageKind, Target};

    use super::*;

    fn packets() -> Vec<Packet> {
        vec![
            Packet::data(
                ClientId::new(),
                Target::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8888),
                Bytes::from_static(b"PING"),
            ),
            Packet::disconnect(
                ClientId::new(),
                Target::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5432),
                "Client disconnected",
            ),
            Packet::control(MessageKind::HandshakeRequest, Bytes::new()),
            Packet::data(ClientId::new(), Target::NONE, vec![0xAB; 70_000]),
        ]
    }

    #[test]
    fn test_message_roundtrip() {
        let key = SessionKey::from_bytes([7; 32]);
        for packet in packets() {
            for key in [None, Some(&key)] {
                let message = Message::encode(&packet, key).unwrap();
                assert_eq!(message.decode(key).unwrap(), packet);
            }
        }
    }

    #[test]
    fn test_cleartext_is_readable_without_key() {
        let packet = Packet::control(MessageKind::PublicKey, Bytes::from_static(b"der"));
        let message = Message::encode(&packet, None).unwrap();
        assert_eq!(&message.clone().into_inner()[0..4], &[0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_every_bit_flip_is_rejected() {
        let key = SessionKey::from_bytes([3; 32]);
        let packet = Packet::data(
            ClientId::new(),
            Target::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 3389),
            Bytes::from_static(b"sensitive"),
        );
        let encoded = Message::encode(&packet, Some(&key)).unwrap().into_inner();

        for bit in 0..encoded.len() * 8 {
            let mut tampered = encoded.to_vec();
            tampered[bit / 8] ^= 1 << (bit % 8);
            let result = Message::from(tampered).decode(Some(&key));
            match result {
                Err(DecodeError::AuthenticationFailure)
                | Err(DecodeError::InvalidIvLength(_))
                | Err(DecodeError::InvalidCiphertext)
                | Err(DecodeError::TooShort { .. }) => {}
                other => panic!("bit {} produced {:?}", bit, other),
            }
        }
    }

    #[test]
    fn test_sealed_message_needs_key() {
        let key = SessionKey::from_bytes([1; 32]);
        let packet = packets().remove(0);
        let message = Message::encode(&packet, Some(&key)).unwrap();
        assert!(message.decode(None).is_err());
    }
}
