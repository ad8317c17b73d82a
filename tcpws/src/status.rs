//! Connection and session events for whatever front end is watching the proxy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::transport::{ClientId, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from a local TCP socket and sent to the peer.
    ToPeer,
    /// Bytes received from the peer and written to a local TCP socket.
    FromPeer,
}

#[derive(Debug, Clone)]
pub enum StatusEvent {
    ConnectionOpened {
        client_id: ClientId,
        target: Target,
        peer: Option<SocketAddr>,
    },
    ConnectionClosed {
        client_id: ClientId,
        target: Target,
        bytes_sent: u64,
        bytes_received: u64,
        duration: Duration,
    },
    Transferred {
        client_id: ClientId,
        direction: Direction,
        bytes: usize,
    },
    TargetUnreachable {
        client_id: ClientId,
        target: Target,
        reason: String,
    },
    HandshakeSucceeded,
    HandshakeFailed {
        reason: String,
    },
    DecodeFailed {
        reason: String,
    },
}

pub trait StatusReporter: Send + Sync + 'static {
    fn report(&self, event: StatusEvent);
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn report(&self, event: StatusEvent) {
        match event {
            StatusEvent::ConnectionOpened {
                client_id,
                target,
                peer,
            } => match peer {
                Some(peer) => info!("Client {}: connected from {} -> {}", client_id, peer, target),
                None => info!("Client {}: connected -> {}", client_id, target),
            },
            StatusEvent::ConnectionClosed {
                client_id,
                target,
                bytes_sent,
                bytes_received,
                duration,
            } => info!(
                "Client {}: closed {} (sent {}, received {}, {:.1}s)",
                client_id,
                target,
                format_bytes(bytes_sent),
                format_bytes(bytes_received),
                duration.as_secs_f64()
            ),
            StatusEvent::Transferred {
                client_id,
                direction,
                bytes,
            } => trace!("Client {}: {:?} {} bytes", client_id, direction, bytes),
            StatusEvent::TargetUnreachable {
                client_id,
                target,
                reason,
            } => warn!("Client {}: target {} unreachable: {}", client_id, target, reason),
            StatusEvent::HandshakeSucceeded => info!("Handshake complete, session encrypted"),
            StatusEvent::HandshakeFailed { reason } => warn!("Handshake failed: {}", reason),
            StatusEvent::DecodeFailed { reason } => debug!("Decode failed: {}", reason),
        }
    }
}

/// Live counters kept on every registry entry.
#[derive(Debug)]
pub struct ConnectionStats {
    opened_at: Instant,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self {
            opened_at: Instant::now(),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }
}

impl ConnectionStats {
    pub fn record(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::ToPeer => &self.bytes_sent,
            Direction::FromPeer => &self.bytes_received,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

/// One row of the live connection table.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub client_id: ClientId,
    pub target: Target,
    pub peer: Option<SocketAddr>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub age: Duration,
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
