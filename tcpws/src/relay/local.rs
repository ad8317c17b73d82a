//! Local end: TCP listeners feeding one outbound WebSocket session.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderName, HeaderValue};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{TcpConnection, TcpRegistry, deliver, spawn_pump};
use crate::config::{BufferConfig, ConfigError, LocalConfig, PortMapping};
use crate::error::{Error, Result};
use crate::handshake;
use crate::registry::Registry;
use crate::session::{self, Dispatch, SessionReceiver, SessionSender};
use crate::status::{StatusEvent, StatusReporter};
use crate::transport::{ClientId, MessageKind, Packet, Target};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Handles packets the remote end sends back to the local end.
pub struct LocalDispatcher {
    registry: Arc<TcpRegistry>,
}

impl LocalDispatcher {
    pub fn new(registry: Arc<TcpRegistry>) -> Self {
        Self { registry }
    }
}

impl Dispatch for LocalDispatcher {
    async fn dispatch(&self, packet: Packet) -> Result<()> {
        let client_id = packet.client_id;
        match packet.kind {
            kind if kind.is_data() => {
                let entry = self
                    .registry
                    .get(client_id)
                    .ok_or(Error::UnknownClientId(client_id))?;
                deliver(&self.registry, &entry, packet.payload);
            }
            MessageKind::Error => {
                let reason = packet.payload_lossy();
                self.registry.reporter().report(StatusEvent::TargetUnreachable {
                    client_id,
                    target: packet.target,
                    reason,
                });
                self.registry.discard(client_id);
            }
            MessageKind::Disconnect if client_id.is_control() => {
                info!("Remote notice: {}", packet.payload_lossy());
            }
            MessageKind::Disconnect => {
                if self.registry.discard(client_id).is_some() {
                    debug!("Client {}: closed by remote", client_id);
                } else {
                    debug!("Client {}: disconnect acknowledged", client_id);
                }
            }
            kind => debug!("Client {}: ignoring {:?}", client_id, kind),
        }
        Ok(())
    }
}

/// The local proxy after its listeners are bound and the handshake is done.
pub struct LocalProxy {
    listeners: Vec<(PortMapping, TcpListener)>,
    sender: SessionSender,
    receiver: SessionReceiver,
    registry: Arc<TcpRegistry>,
    reporter: Arc<dyn StatusReporter>,
    buffers: BufferConfig,
    cancel: CancellationToken,
}

impl LocalProxy {
    /// Binds every mapped port, opens the WebSocket and runs the handshake.
    pub async fn connect(
        config: LocalConfig,
        reporter: Arc<dyn StatusReporter>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        config.validate()?;

        let mut listeners = Vec::with_capacity(config.port_mappings.len());
        for mapping in &config.port_mappings {
            let listener =
                TcpListener::bind(SocketAddr::new(config.listen_address, mapping.listen_port))
                    .await?;
            info!("Listening on {}: {}", listener.local_addr()?, mapping);
            listeners.push((mapping.clone(), listener));
        }

        let mut request = config.websocket_url.as_str().into_client_request()?;
        for (name, value) in &config.headers {
            let header = HeaderName::from_bytes(name.as_bytes())
                .ok()
                .zip(HeaderValue::from_str(value).ok())
                .ok_or_else(|| ConfigError::InvalidHeader(name.clone()))?;
            request.headers_mut().insert(header.0, header.1);
        }

        info!("Connecting to {}...", config.websocket_url);
        let ws_config = session::websocket_config(&config.buffers);
        let (ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::TransportClosed),
            connected = connect_async_with_config(request, Some(ws_config), true) => connected?,
        };

        let (sender, mut receiver) = session::split(ws, config.buffers.max_message_size);
        let handshake = tokio::select! {
            _ = cancel.cancelled() => Err(Error::TransportClosed),
            result = handshake::initiate(&sender, &mut receiver) => result,
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
            listeners,
            sender,
            receiver,
            registry,
            reporter,
            buffers: config.buffers,
            cancel,
        })
    }

    /// Bound listen addresses, in port mapping order.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|(_, listener)| listener.local_addr().ok())
            .collect()
    }

    pub fn registry(&self) -> Arc<TcpRegistry> {
        self.registry.clone()
    }

    /// Relays until the WebSocket closes, a fatal error occurs, or the token
    /// given to [`LocalProxy::connect`] is cancelled. Every client socket is
    /// closed before this returns.
    pub async fn run(self) -> Result<()> {
        let Self {
            listeners,
            sender,
            mut receiver,
            registry,
            reporter,
            buffers,
            cancel,
        } = self;

        let mut accept_loops = JoinSet::new();
        for (mapping, listener) in listeners {
            accept_loops.spawn(accept_loop(
                listener,
                mapping.target(),
                registry.clone(),
                buffers.clone(),
                cancel.clone(),
            ));
        }

        let dispatcher = LocalDispatcher::new(registry.clone());
        let result = session::run(
            &mut receiver,
            &sender,
            &dispatcher,
            reporter.as_ref(),
            &cancel,
        )
        .await;
        match &result {
            Ok(()) => info!("Session closed"),
            Err(e) => error!("Session failed: {}", e),
        }

        cancel.cancel();
        accept_loops.shutdown().await;
        let closed = registry.close_all().await;
        sender.close().await;
        debug!("Closed {} client connections", closed);
        result
    }
}

/// Accepts until cancelled. Accept errors are logged and retried.
async fn accept_loop(
    listener: TcpListener,
    target: Target,
    registry: Arc<TcpRegistry>,
    buffers: BufferConfig,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted {} for {}", peer, target);
                open_client(stream, target, &registry, &buffers).await;
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn open_client(
    stream: TcpStream,
    target: Target,
    registry: &Arc<TcpRegistry>,
    buffers: &BufferConfig,
) {
    let client_id = ClientId::new();
    let connection = TcpConnection::new(stream, buffers.write_queue_depth);
    let created = registry
        .get_or_create(client_id, target, || async move {
            Ok::<_, Infallible>(connection)
        })
        .await;
    let (entry, _) = match created {
        Ok(created) => created,
        Err(never) => match never {},
    };
    spawn_pump(entry, registry.clone(), buffers.tcp_read_buffer);
}
