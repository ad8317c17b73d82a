//! HTTP front of the remote end: upgrades tunnel requests to WebSocket
//! sessions and keeps the process-wide RSA key pair.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_tungstenite::HyperWebsocket;
use hyper_util::rt::TokioIo;
use rand::rngs::OsRng;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;
use crate::error::Result;
use crate::handshake::ServerKeyPair;
use crate::relay::TcpRegistry;
use crate::relay::remote::RemoteSession;
use crate::session::websocket_config;
use crate::status::{ConnectionInfo, StatusReporter};

const HEALTH_PATH: &str = "/health";
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct RemoteServer {
    config: RemoteConfig,
    keypair: Arc<ServerKeyPair>,
    reporter: Arc<dyn StatusReporter>,
    sessions: Mutex<HashMap<u64, Arc<TcpRegistry>>>,
    next_session: AtomicU64,
}

impl RemoteServer {
    /// Validates the config and generates the key pair shared by every
    /// session this server accepts.
    pub fn new(config: RemoteConfig, reporter: Arc<dyn StatusReporter>) -> Result<Self> {
        config.validate()?;
        info!("Generating {}-bit RSA key pair...", config.rsa_bits);
        let keypair = ServerKeyPair::generate(&mut OsRng, config.rsa_bits)?;
        Ok(Self::with_keypair(config, Arc::new(keypair), reporter))
    }

    pub fn with_keypair(
        config: RemoteConfig,
        keypair: Arc<ServerKeyPair>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            config,
            keypair,
            reporter,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.config.listen).await?)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<u64, Arc<TcpRegistry>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session_count(&self) -> usize {
        self.sessions().len()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions().values().map(|registry| registry.len()).sum()
    }

    /// Live target connections across every session.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let registries: Vec<_> = self.sessions().values().cloned().collect();
        registries
            .iter()
            .flat_map(|registry| registry.snapshot())
            .collect()
    }

    /// Serves HTTP on `listener` until `cancel` fires. Cancelling also ends
    /// every session started here.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!(
            "Listening on ws://{}{}",
            listener.local_addr()?,
            self.config.path
        );

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };
            debug!("New connection from {}", peer);

            let server = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| server.clone().handle(req, peer, cancel.clone()));
                if let Err(e) = http1::Builder::new()
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Connection from {} ended: {:?}", peer, e);
                }
            });
        }

        Ok(())
    }

    async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
        let path = req.uri().path();
        if path == HEALTH_PATH {
            return Ok(text_response(StatusCode::OK, "OK"));
        }
        if path != self.config.path {
            return Ok(text_response(StatusCode::NOT_FOUND, "Not Found"));
        }
        if !hyper_tungstenite::is_upgrade_request(&req) {
            return Ok(text_response(
                StatusCode::UPGRADE_REQUIRED,
                "WebSocket upgrade required",
            ));
        }

        let ws_config = websocket_config(&self.config.buffers);
        match hyper_tungstenite::upgrade(&mut req, Some(ws_config)) {
            Ok((response, websocket)) => {
                tokio::spawn(self.run_session(websocket, peer, cancel));
                Ok(response)
            }
            Err(e) => {
                warn!("Bad upgrade request from {}: {}", peer, e);
                Ok(text_response(StatusCode::BAD_REQUEST, "Invalid upgrade request"))
            }
        }
    }

    async fn run_session(self: Arc<Self>, websocket: HyperWebsocket, peer: SocketAddr, cancel: CancellationToken) {
        let ws = match websocket.await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket upgrade from {} failed: {}", peer, e);
                return;
            }
        };

        let session = match RemoteSession::accept(
            ws,
            self.keypair.clone(),
            &self.config.buffers,
            self.reporter.clone(),
            cancel,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                warn!("Session from {} rejected: {}", peer, e);
                return;
            }
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.sessions().insert(id, session.registry());
        info!("Session {} established with {}", id, peer);

        if let Err(e) = session.run().await {
            debug!("Session {} ended with error: {}", id, e);
        }

        self.sessions().remove(&id);
        info!("Session {} with {} ended", id, peer);
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(mime::TEXT_PLAIN_UTF_8.as_ref()) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}
