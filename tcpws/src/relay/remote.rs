//! Remote end: one accepted WebSocket session fanned out to TCP targets.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TcpConnection, TcpRegistry, deliver, spawn_pump};
use crate::config::BufferConfig;
use crate::error::{Error, Result};
use crate::handshake::{self, ServerKeyPair};
use crate::registry::Registry;
use crate::session::{self, Dispatch, SessionReceiver, SessionSender};
use crate::status::{StatusEvent, StatusReporter};
use crate::transport::{MessageKind, Packet};

/// Payload of the Disconnect acknowledgment for ids that are already gone.
const CLOSED_ACK: &str = "TCP connection closed";

/// Demultiplexes packets from the local end onto outbound TCP connections.
pub struct RemoteRelay {
    registry: Arc<TcpRegistry>,
    buffers: BufferConfig,
}

impl RemoteRelay {
    pub fn new(registry: Arc<TcpRegistry>, buffers: BufferConfig) -> Self {
        Self { registry, buffers }
    }

    /// Delivers data to the client's target connection, opening it on the
    /// first packet. Ids whose connection already closed are answered with a
    /// Disconnect and never reconnected.
    async fn forward(&self, packet: Packet) -> Result<()> {
        let client_id = packet.client_id;
        if let Some(entry) = self.registry.get(client_id) {
            deliver(&self.registry, &entry, packet.payload);
            return Ok(());
        }

        if self.registry.is_retired(client_id) {
            let sender = self.registry.sender();
            if sender.is_open() {
                sender
                    .send(&Packet::disconnect(client_id, packet.target, CLOSED_ACK))
                    .await?;
            }
            return Err(Error::UnknownClientId(client_id));
        }

        let Some(addr) = packet.target.socket_addr() else {
            return self
                .refuse(&packet, "Error forwarding data: missing target address")
                .await;
        };

        let queue_depth = self.buffers.write_queue_depth;
        let created = self
            .registry
            .get_or_create(client_id, packet.target, || async move {
                let stream = TcpStream::connect(addr).await?;
                Ok::<_, io::Error>(TcpConnection::new(stream, queue_depth))
            })
            .await;

        match created {
            Ok((entry, created)) => {
                if created {
                    spawn_pump(
                        entry.clone(),
                        self.registry.clone(),
                        self.buffers.tcp_read_buffer,
                    );
                }
                deliver(&self.registry, &entry, packet.payload);
                Ok(())
            }
            Err(e) => {
                self.registry.retire(client_id);
                self.registry
                    .reporter()
                    .report(StatusEvent::TargetUnreachable {
                        client_id,
                        target: packet.target,
                        reason: e.to_string(),
                    });
                self.refuse(&packet, &format!("Error forwarding data: {}", e))
                    .await
            }
        }
    }

    /// Answers a packet that could not be forwarded with an Error packet for
    /// the same client.
    async fn refuse(&self, packet: &Packet, reason: &str) -> Result<()> {
        let reply = Packet::error(packet.client_id, packet.target, reason);
        self.registry.sender().send(&reply).await
    }
}

impl Dispatch for RemoteRelay {
    async fn dispatch(&self, packet: Packet) -> Result<()> {
        let client_id = packet.client_id;
        match packet.kind {
            kind if kind.is_data() => self.forward(packet).await?,
            MessageKind::Disconnect if client_id.is_control() => {
                debug!("Ignoring session-level disconnect notice");
            }
            MessageKind::Disconnect => {
                // Removing a live entry sends the acknowledgment itself.
                if self.registry.remove(client_id).is_none() {
                    let sender = self.registry.sender();
                    if sender.is_open() {
                        sender
                            .send(&Packet::disconnect(client_id, packet.target, CLOSED_ACK))
                            .await?;
                    }
                }
            }
            MessageKind::Error => {
                warn!("Client {}: peer reported: {}", client_id, packet.payload_lossy());
            }
            kind => debug!("Client {}: ignoring {:?}", client_id, kind),
        }
        Ok(())
    }
}

/// One accepted tunnel session that has completed its handshake.
pub struct RemoteSession {
    sender: SessionSender,
    receiver: SessionReceiver,
    relay: RemoteRelay,
    reporter: Arc<dyn StatusReporter>,
    cancel: CancellationToken,
}

impl RemoteSession {
    pub async fn accept<S>(
        ws: WebSocketStream<S>,
        keypair: Arc<ServerKeyPair>,
        buffers: &BufferConfig,
        reporter: Arc<dyn StatusReporter>,
        cancel: CancellationToken,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, mut receiver) = session::split(ws, buffers.max_message_size);

        let handshake = tokio::select! {
            _ = cancel.cancelled() => Err(Error::TransportClosed),
            result = handshake::respond(&sender, &mut receiver, keypair) => result,
        };
        if let Err(e) = handshake {
            reporter.report(StatusEvent::HandshakeFailed {
                reason: e.to_string(),
            });
            sender.close().await;
            return Err(e);
        }
        reporter.report(StatusEvent::HandshakeSucceeded);

        let cancel = cancel.child_token();
        let registry = Arc::new(Registry::new(
            sender.clone(),
            reporter.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            sender,
            receiver,
            relay: RemoteRelay::new(registry, buffers.clone()),
            reporter,
            cancel,
        })
    }

    pub fn registry(&self) -> Arc<TcpRegistry> {
        self.relay.registry.clone()
    }

    /// Relays until the peer closes or a fatal error occurs, then closes every
    /// target connection of this session.
    pub async fn run(mut self) -> Result<()> {
        let result = session::run(
            &mut self.receiver,
            &self.sender,
            &self.relay,
            self.reporter.as_ref(),
            &self.cancel,
        )
        .await;
        match &result {
            Ok(()) => info!("Session closed"),
            Err(e) => error!("Session failed: {}", e),
        }

        self.cancel.cancel();
        let closed = self.relay.registry.close_all().await;
        self.sender.close().await;
        debug!("Closed {} target connections", closed);
        result
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::session::tests::{capture_sender, decode_captured};
    use crate::status::TracingReporter;
    use crate::transport::{ClientId, Target};

    use super::*;

    fn relay() -> (
        RemoteRelay,
        tokio::sync::mpsc::Receiver<tokio_tungstenite::tungstenite::Message>,
    ) {
        relay_with(CancellationToken::new())
    }

    fn relay_with(
        cancel: CancellationToken,
    ) -> (
        RemoteRelay,
        tokio::sync::mpsc::Receiver<tokio_tungstenite::tungstenite::Message>,
    ) {
        let (sender, rx) = capture_sender(1 << 20);
        let registry = Arc::new(Registry::new(sender, Arc::new(TracingReporter), cancel));
        let buffers = BufferConfig {
            tcp_read_buffer: 4096,
            ..BufferConfig::default()
        };
        (RemoteRelay::new(registry, buffers), rx)
    }

    #[tokio::test]
    async fn test_first_data_opens_target() {
        let (relay, mut rx) = relay();
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::from(target_listener.local_addr().unwrap());
        let client_id = ClientId::new();

        relay
            .dispatch(Packet::data(client_id, target, Bytes::from_static(b"PING")))
            .await
            .unwrap();
        let (mut upstream, _) = target_listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        upstream.write_all(b"PONG").await.unwrap();
        let reply = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(reply.client_id, client_id);
        assert_eq!(reply.kind, MessageKind::Binary);
        assert_eq!(reply.target, target);
        assert_eq!(&reply.payload[..], b"PONG");
        assert_eq!(relay.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_is_refused() {
        let (relay, mut rx) = relay();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::from(closed.local_addr().unwrap());
        drop(closed);
        let client_id = ClientId::new();

        relay
            .dispatch(Packet::data(client_id, target, Bytes::from_static(b"PING")))
            .await
            .unwrap();

        let reply = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(reply.kind, MessageKind::Error);
        assert_eq!(reply.client_id, client_id);
        assert!(reply.payload_lossy().starts_with("Error forwarding data"));
        assert!(relay.registry.get(client_id).is_none());
        assert!(relay.registry.is_empty());
    }

    #[tokio::test]
    async fn test_missing_address_is_refused() {
        let (relay, mut rx) = relay();
        let client_id = ClientId::new();

        relay
            .dispatch(Packet::data(client_id, Target::NONE, Bytes::from_static(b"x")))
            .await
            .unwrap();
        let reply = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(reply.kind, MessageKind::Error);
        assert!(relay.registry.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_closes_target_and_acknowledges() {
        let (relay, mut rx) = relay();
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::from(target_listener.local_addr().unwrap());
        let client_id = ClientId::new();

        relay
            .dispatch(Packet::data(client_id, target, Bytes::new()))
            .await
            .unwrap();
        let (mut upstream, _) = target_listener.accept().await.unwrap();

        // A later packet carrying a different target must not replace the cached one.
        let other = Target::new([10, 9, 8, 7].into(), 1);
        relay
            .dispatch(Packet::disconnect(client_id, other, "Client disconnected"))
            .await
            .unwrap();

        let ack = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(ack.kind, MessageKind::Disconnect);
        assert_eq!(ack.target, target);

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), upstream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.is_empty());
        assert!(relay.registry.is_empty());

        relay
            .dispatch(Packet::disconnect(client_id, other, "Client disconnected"))
            .await
            .unwrap();
        let ack = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(ack.kind, MessageKind::Disconnect);
        assert_eq!(ack.target, other);
    }

    #[tokio::test]
    async fn test_closed_target_is_not_reopened() {
        let (relay, mut rx) = relay();
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::from(target_listener.local_addr().unwrap());
        let client_id = ClientId::new();

        relay
            .dispatch(Packet::data(client_id, target, Bytes::from_static(b"first")))
            .await
            .unwrap();
        let (mut upstream, _) = target_listener.accept().await.unwrap();
        let mut buf = [0u8; 5];
        upstream.read_exact(&mut buf).await.unwrap();
        drop(upstream);

        let notice = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(notice.kind, MessageKind::Disconnect);
        assert_eq!(notice.client_id, client_id);
        assert!(relay.registry.is_empty());

        // Data that was in flight when the target closed.
        let err = relay
            .dispatch(Packet::data(client_id, target, Bytes::from_static(b"late")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownClientId(id) if id == client_id));
        assert!(!err.is_fatal());

        let reply = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(reply.kind, MessageKind::Disconnect);
        assert_eq!(reply.client_id, client_id);
        assert!(relay.registry.is_empty());
        assert!(
            tokio::time::timeout(Duration::from_millis(200), target_listener.accept())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_refused_client_is_not_retried() {
        let (relay, mut rx) = relay();
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::from(closed.local_addr().unwrap());
        drop(closed);
        let client_id = ClientId::new();

        relay
            .dispatch(Packet::data(client_id, target, Bytes::from_static(b"one")))
            .await
            .unwrap();
        let reply = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(reply.kind, MessageKind::Error);

        assert!(relay
            .dispatch(Packet::data(client_id, target, Bytes::from_static(b"two")))
            .await
            .is_err());
        let reply = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(reply.kind, MessageKind::Disconnect);
    }

    #[tokio::test]
    async fn test_cancel_stops_blocked_delivery() {
        let cancel = CancellationToken::new();
        let (relay, _rx) = relay_with(cancel.clone());
        let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Target::from(target_listener.local_addr().unwrap());
        let client_id = ClientId::new();

        relay
            .dispatch(Packet::data(client_id, target, Bytes::new()))
            .await
            .unwrap();
        let (mut upstream, _) = target_listener.accept().await.unwrap();

        // The target never reads, so the writer ends up blocked mid-stream.
        let chunk = Bytes::from(vec![3u8; 1024 * 1024]);
        for _ in 0..32 {
            tokio::time::timeout(
                Duration::from_secs(1),
                relay.dispatch(Packet::data(client_id, target, chunk.clone())),
            )
            .await
            .unwrap()
            .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(relay.registry.len(), 1);

        cancel.cancel();
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), upstream.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.len() < 32 * 1024 * 1024);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !relay.registry.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
