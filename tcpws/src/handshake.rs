//! Per-session key agreement.
//!
//! The local side initiates, the remote side responds:
//!
//! ```text
//! initiator                               responder
//!   HandshakeRequest        ------------>
//!                           <------------   PublicKey (RSA, PKCS#1 DER)
//!   EncryptedSymmetricKey   ------------>
//!   (adopts key optimistically)             (adopts key)
//!                           <------------   HandshakeComplete "OK" (sealed)
//! ```
//!
//! The state machines below are pure; [`initiate`] and [`respond`] drive them
//! over a session.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;
use tracing::debug;

use crate::error::Result;
use crate::session::{SessionReceiver, SessionSender};
use crate::transport::{MessageKind, Packet, SessionKey};

pub const ACK_PAYLOAD: &[u8] = b"OK";
pub const DEFAULT_RSA_BITS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingPublicKey,
    /// The initiator has sent the encrypted key and waits for the sealed ack;
    /// the responder has published its public key and waits for the key.
    AwaitingKeyAck,
    Established,
    Failed,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unexpected {kind:?} message in state {state:?}")]
    UnexpectedMessage {
        kind: MessageKind,
        state: HandshakeState,
    },
    #[error("decrypted session key is {0} bytes, expected 32")]
    InvalidKeyLength(usize),
    #[error("handshake acknowledgment mismatch")]
    AckMismatch,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("rsa: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("session key already established")]
    AlreadyEstablished,
    #[error("handshake has not completed")]
    NotEstablished,
    #[error("connection closed during handshake")]
    Closed,
}

/// RSA keypair of the responding side, generated once per process.
pub struct ServerKeyPair {
    private: RsaPrivateKey,
    public_der: Bytes,
}

impl ServerKeyPair {
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R, bits: usize) -> Result<Self, HandshakeError> {
        let private = RsaPrivateKey::new(rng, bits)?;
        let public_der = private
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| HandshakeError::InvalidPublicKey(e.to_string()))?;
        Ok(Self {
            private,
            public_der: Bytes::copy_from_slice(public_der.as_bytes()),
        })
    }

    pub fn public_key_der(&self) -> &Bytes {
        &self.public_der
    }
}

impl std::fmt::Debug for ServerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeyPair")
            .field("public_der_len", &self.public_der.len())
            .finish_non_exhaustive()
    }
}

fn expect_message(
    state: &mut HandshakeState,
    expected_state: HandshakeState,
    packet: &Packet,
    expected_kind: MessageKind,
) -> Result<(), HandshakeError> {
    if *state != expected_state || packet.kind != expected_kind {
        let actual = *state;
        *state = HandshakeState::Failed;
        return Err(HandshakeError::UnexpectedMessage {
            kind: packet.kind,
            state: actual,
        });
    }
    Ok(())
}

fn wrap_session_key<R: RngCore + CryptoRng>(
    public_der: &[u8],
    rng: &mut R,
) -> Result<(Packet, SessionKey), HandshakeError> {
    let public = RsaPublicKey::from_pkcs1_der(public_der)
        .map_err(|e| HandshakeError::InvalidPublicKey(e.to_string()))?;
    let key = SessionKey::generate(rng);
    let wrapped = public.encrypt(rng, Pkcs1v15Encrypt, key.as_bytes())?;
    Ok((
        Packet::control(MessageKind::EncryptedSymmetricKey, wrapped),
        key,
    ))
}

#[derive(Debug)]
pub struct Initiator {
    state: HandshakeState,
}

impl Default for Initiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Initiator {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn request(&mut self) -> Result<Packet, HandshakeError> {
        if self.state != HandshakeState::Idle {
            let state = self.state;
            self.state = HandshakeState::Failed;
            return Err(HandshakeError::UnexpectedMessage {
                kind: MessageKind::HandshakeRequest,
                state,
            });
        }
        self.state = HandshakeState::AwaitingPublicKey;
        Ok(Packet::control(MessageKind::HandshakeRequest, Bytes::new()))
    }

    /// Generates the session key and wraps it for the responder. The caller
    /// adopts the returned key before the acknowledgment arrives.
    pub fn receive_public_key<R: RngCore + CryptoRng>(
        &mut self,
        packet: &Packet,
        rng: &mut R,
    ) -> Result<(Packet, SessionKey), HandshakeError> {
        expect_message(
            &mut self.state,
            HandshakeState::AwaitingPublicKey,
            packet,
            MessageKind::PublicKey,
        )?;

        let result = wrap_session_key(&packet.payload, rng);
        self.state = match result {
            Ok(_) => HandshakeState::AwaitingKeyAck,
            Err(_) => HandshakeState::Failed,
        };
        result
    }

    pub fn receive_complete(&mut self, packet: &Packet) -> Result<(), HandshakeError> {
        expect_message(
            &mut self.state,
            HandshakeState::AwaitingKeyAck,
            packet,
            MessageKind::HandshakeComplete,
        )?;
        if packet.payload.as_ref() != ACK_PAYLOAD {
            self.state = HandshakeState::Failed;
            return Err(HandshakeError::AckMismatch);
        }
        self.state = HandshakeState::Established;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Responder {
    keypair: Arc<ServerKeyPair>,
    state: HandshakeState,
}

impl Responder {
    pub fn new(keypair: Arc<ServerKeyPair>) -> Self {
        Self {
            keypair,
            state: HandshakeState::Idle,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn receive_request(&mut self, packet: &Packet) -> Result<Packet, HandshakeError> {
        expect_message(
            &mut self.state,
            HandshakeState::Idle,
            packet,
            MessageKind::HandshakeRequest,
        )?;
        self.state = HandshakeState::AwaitingKeyAck;
        Ok(Packet::control(
            MessageKind::PublicKey,
            self.keypair.public_der.clone(),
        ))
    }

    /// Unwraps the session key. The returned acknowledgment must be sealed
    /// with that key.
    pub fn receive_key_exchange(&mut self, packet: &Packet) -> Result<(Packet, SessionKey), HandshakeError> {
        expect_message(
            &mut self.state,
            HandshakeState::AwaitingKeyAck,
            packet,
            MessageKind::EncryptedSymmetricKey,
        )?;

        let result = self
            .keypair
            .private
            .decrypt(Pkcs1v15Encrypt, &packet.payload)
            .map_err(HandshakeError::from)
            .and_then(|plain| {
                SessionKey::try_from(plain.as_slice()).map_err(HandshakeError::InvalidKeyLength)
            });

        match result {
            Ok(key) => {
                self.state = HandshakeState::Established;
                Ok((
                    Packet::control(MessageKind::HandshakeComplete, Bytes::from_static(ACK_PAYLOAD)),
                    key,
                ))
            }
            Err(e) => {
                self.state = HandshakeState::Failed;
                Err(e)
            }
        }
    }
}

async fn next_handshake_packet(
    receiver: &mut SessionReceiver,
    key: Option<&SessionKey>,
) -> Result<Packet> {
    receiver
        .next_packet(key)
        .await?
        .ok_or_else(|| HandshakeError::Closed.into())
}

/// Runs the initiating side. On success the sender holds the session key.
pub async fn initiate(sender: &SessionSender, receiver: &mut SessionReceiver) -> Result<()> {
    let mut initiator = Initiator::new();

    sender.send(&initiator.request()?).await?;
    debug!("Handshake: request sent");

    let packet = next_handshake_packet(receiver, None).await?;
    let (exchange, key) = initiator.receive_public_key(&packet, &mut OsRng)?;
    sender.send(&exchange).await?;
    sender.adopt_key(key)?;
    debug!("Handshake: session key sent");

    let packet = next_handshake_packet(receiver, sender.key()).await?;
    initiator.receive_complete(&packet)?;
    Ok(())
}

/// Runs the responding side with the process-wide keypair.
pub async fn respond(
    sender: &SessionSender,
    receiver: &mut SessionReceiver,
    keypair: Arc<ServerKeyPair>,
) -> Result<()> {
    let mut responder = Responder::new(keypair);

    let packet = next_handshake_packet(receiver, None).await?;
    sender.send(&responder.receive_request(&packet)?).await?;
    debug!("Handshake: public key sent");

    let packet = next_handshake_packet(receiver, None).await?;
    let (complete, key) = responder.receive_key_exchange(&packet)?;
    sender.adopt_key(key)?;
    sender.send(&complete).await?;
    Ok(())
}
