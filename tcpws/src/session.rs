//! One WebSocket connection: a serialized send half shared by every pump, a
//! single receive half, and the session key once the handshake settles it.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::error::{Error, Result};
use crate::handshake::{HandshakeError, HandshakeState};
use crate::status::{StatusEvent, StatusReporter};
use crate::transport::{Message, Packet, SessionKey};

type BoxSink = Pin<Box<dyn Sink<WsMessage, Error = WsError> + Send>>;
type BoxStream = Pin<Box<dyn Stream<Item = Result<WsMessage, WsError>> + Send>>;

pub fn websocket_config(buffers: &BufferConfig) -> WebSocketConfig {
    WebSocketConfig::default()
        .read_buffer_size(buffers.websocket_read_buffer)
        .max_message_size(Some(buffers.max_message_size))
        .max_frame_size(Some(buffers.max_message_size))
}

/// Splits an established WebSocket into the two session halves.
pub fn split<S>(ws: WebSocketStream<S>, max_message_size: usize) -> (SessionSender, SessionReceiver)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    (
        SessionSender::new(sink, max_message_size),
        SessionReceiver::new(stream),
    )
}

struct SenderInner {
    sink: Mutex<BoxSink>,
    key: OnceLock<SessionKey>,
    open: AtomicBool,
    max_message_size: usize,
}

/// Cheap to clone; every clone sends through the same lock.
#[derive(Clone)]
pub struct SessionSender {
    inner: Arc<SenderInner>,
}

impl SessionSender {
    pub fn new<K>(sink: K, max_message_size: usize) -> Self
    where
        K: Sink<WsMessage, Error = WsError> + Send + 'static,
    {
        Self {
            inner: Arc::new(SenderInner {
                sink: Mutex::new(Box::pin(sink)),
                key: OnceLock::new(),
                open: AtomicBool::new(true),
                max_message_size,
            }),
        }
    }

    pub fn key(&self) -> Option<&SessionKey> {
        self.inner.key.get()
    }

    /// The key can be set exactly once per session.
    pub(crate) fn adopt_key(&self, key: SessionKey) -> Result<(), HandshakeError> {
        self.inner
            .key
            .set(key)
            .map_err(|_| HandshakeError::AlreadyEstablished)
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    pub async fn send(&self, packet: &Packet) -> Result<()> {
        if !self.is_open() {
            return Err(Error::TransportClosed);
        }

        let message = Message::encode(packet, self.key())?;
        if message.len() > self.inner.max_message_size {
            return Err(Error::MessageTooLarge {
                size: message.len(),
                limit: self.inner.max_message_size,
            });
        }

        let mut sink = self.inner.sink.lock().await;
        if let Err(e) = sink.send(WsMessage::Binary(message.into_inner())).await {
            self.inner.open.store(false, Ordering::Release);
            return Err(match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => Error::TransportClosed,
                other => other.into(),
            });
        }
        Ok(())
    }

    pub async fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            let mut sink = self.inner.sink.lock().await;
            if let Err(e) = sink.close().await {
                debug!("WebSocket close failed: {}", e);
            }
        }
    }
}

pub struct SessionReceiver {
    stream: BoxStream,
}

impl SessionReceiver {
    pub fn new<T>(stream: T) -> Self
    where
        T: Stream<Item = Result<WsMessage, WsError>> + Send + 'static,
    {
        Self {
            stream: Box::pin(stream),
        }
    }

    /// Next complete message, or `None` once the peer has closed.
    ///
    /// Continuation frames are reassembled by the WebSocket layer, so one
    /// returned message is always exactly one encoded packet.
    pub async fn next_message(&mut self) -> Result<Option<Message>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(WsMessage::Text(text))) => {
                    return Ok(Some(Bytes::copy_from_slice(text.as_bytes()).into()));
                }
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!("Peer closed WebSocket: {:?}", frame);
                    return Ok(None);
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn next_packet(&mut self, key: Option<&SessionKey>) -> Result<Option<Packet>> {
        match self.next_message().await? {
            Some(message) => Ok(Some(message.decode(key)?)),
            None => Ok(None),
        }
    }
}

/// Per-side handling of packets that arrive after the handshake.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, packet: Packet) -> impl Future<Output = Result<()>> + Send;
}

/// Receive loop of an established session.
///
/// Returns `Ok(())` when the peer closes or `cancel` fires. Any decode failure
/// or stray handshake message ends the session with an error, since framing
/// cannot be resynchronized mid-stream.
pub async fn run<D: Dispatch>(
    receiver: &mut SessionReceiver,
    sender: &SessionSender,
    dispatcher: &D,
    reporter: &dyn StatusReporter,
    cancel: &CancellationToken,
) -> Result<()> {
    let key = sender.key().ok_or(HandshakeError::NotEstablished)?;

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            message = receiver.next_message() => message?,
        };
        let Some(message) = message else {
            return Ok(());
        };

        let packet = match message.decode(Some(key)) {
            Ok(packet) => packet,
            Err(e) => {
                reporter.report(StatusEvent::DecodeFailed {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        if packet.kind.is_handshake() {
            return Err(HandshakeError::UnexpectedMessage {
                kind: packet.kind,
                state: HandshakeState::Established,
            }
            .into());
        }

        if let Err(e) = dispatcher.dispatch(packet).await {
            if e.is_fatal() {
                return Err(e);
            }
            warn!("{}", e);
        }
    }
}
