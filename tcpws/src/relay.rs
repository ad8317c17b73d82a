//! Byte pumps shared by both ends of the tunnel.

pub mod local;
pub mod remote;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Error;
use crate::registry::{Connection, Entry, Registry};
use crate::status::{Direction, StatusEvent};
use crate::transport::Packet;

pub type TcpRegistry = Registry<TcpConnection>;
pub type TcpEntry = Entry<TcpConnection>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A TCP socket split into a reader pump and a queued writer.
///
/// Payloads from the peer are queued and written by a per-connection task,
/// so a socket that stops reading only ever stalls itself.
pub struct TcpConnection {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<(OwnedWriteHalf, mpsc::Receiver<Bytes>)>>,
    queue: Mutex<Option<mpsc::Sender<Bytes>>>,
    abort: CancellationToken,
    peer: Option<SocketAddr>,
}

impl TcpConnection {
    /// `queue_depth` bounds how many payloads may wait for the socket.
    pub fn new(stream: TcpStream, queue_depth: usize) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        let (queue, outbox) = mpsc::channel(queue_depth.max(1));
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some((writer, outbox))),
            queue: Mutex::new(Some(queue)),
            abort: CancellationToken::new(),
            peer,
        }
    }

    /// The read half can be taken once, by the entry's pump.
    pub fn take_reader(&self) -> Option<OwnedReadHalf> {
        lock(&self.reader).take()
    }

    fn take_writer(&self) -> Option<(OwnedWriteHalf, mpsc::Receiver<Bytes>)> {
        lock(&self.writer).take()
    }

    /// Queues a payload without waiting for the socket.
    pub fn enqueue(&self, payload: Bytes) -> Result<(), TrySendError<Bytes>> {
        match lock(&self.queue).as_ref() {
            Some(queue) => queue.try_send(payload),
            None => Err(TrySendError::Closed(payload)),
        }
    }

    /// Drops whatever is still queued and stops the writer.
    pub fn abort(&self) {
        self.abort.cancel();
    }
}

impl Connection for TcpConnection {
    /// Closes the queue; the writer flushes what is left, then shuts the
    /// socket down.
    async fn close(&self) -> io::Result<()> {
        drop(lock(&self.queue).take());
        let unclaimed = self.take_writer();
        match unclaimed {
            Some((mut writer, _)) => writer.shutdown().await,
            None => Ok(()),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Starts the reader pump and the writer of a freshly created entry. Returns
/// the reader pump's handle.
pub(crate) fn spawn_pump(
    entry: Arc<TcpEntry>,
    registry: Arc<TcpRegistry>,
    buffer_size: usize,
) -> Option<JoinHandle<()>> {
    let Some(reader) = entry.connection().take_reader() else {
        debug!("Client {}: pump already running", entry.client_id());
        return None;
    };
    if let Some((writer, outbox)) = entry.connection().take_writer() {
        tokio::spawn(drain_to_socket(
            entry.clone(),
            writer,
            outbox,
            registry.clone(),
        ));
    }
    Some(tokio::spawn(pump_to_peer(entry, reader, registry, buffer_size)))
}

/// Reads the socket until EOF, error, cancellation or a dead session, sending
/// every read as one data packet tagged with the entry's cached target. The
/// entry is removed on every exit path.
async fn pump_to_peer(
    entry: Arc<TcpEntry>,
    mut reader: OwnedReadHalf,
    registry: Arc<TcpRegistry>,
    buffer_size: usize,
) {
    let client_id = entry.client_id();
    let sender = registry.sender().clone();
    let mut buf = vec![0u8; buffer_size];

    loop {
        let read = tokio::select! {
            _ = entry.closed() => break,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!("Client {}: EOF", client_id);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Client {}: read failed: {}", client_id, e);
                break;
            }
        };

        let payload = Bytes::copy_from_slice(&buf[..n]);
        if let Err(e) = sender.send(&Packet::data(client_id, entry.target(), payload)).await {
            match e {
                Error::TransportClosed => debug!("Client {}: session closed", client_id),
                e => warn!("Client {}: send failed: {}", client_id, e),
            }
            break;
        }
        entry.stats().record(Direction::ToPeer, n);
        registry.reporter().report(StatusEvent::Transferred {
            client_id,
            direction: Direction::ToPeer,
            bytes: n,
        });
    }

    registry.remove(client_id);
}

/// Writes queued payloads until the queue is closed, then shuts the socket's
/// write side down. Aborting or ending the session stops it at once, even
/// mid-write.
async fn drain_to_socket(
    entry: Arc<TcpEntry>,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::Receiver<Bytes>,
    registry: Arc<TcpRegistry>,
) {
    let client_id = entry.client_id();
    let abort = entry.connection().abort.clone();
    let session = registry.session_token().clone();

    loop {
        let payload = tokio::select! {
            _ = abort.cancelled() => return,
            _ = session.cancelled() => return,
            payload = outbox.recv() => payload,
        };
        let Some(payload) = payload else {
            break;
        };

        let written = tokio::select! {
            _ = abort.cancelled() => return,
            _ = session.cancelled() => return,
            written = writer.write_all(&payload) => written,
        };
        if let Err(e) = written {
            warn!("Client {}: write failed: {}", client_id, e);
            registry.remove(client_id);
            return;
        }
        entry.stats().record(Direction::FromPeer, payload.len());
        registry.reporter().report(StatusEvent::Transferred {
            client_id,
            direction: Direction::FromPeer,
            bytes: payload.len(),
        });
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Client {}: shutdown failed: {}", client_id, e);
    }
}

/// Hands a payload from the peer to the entry's writer. A socket whose queue
/// is full is not keeping up and is torn down.
pub(crate) fn deliver(registry: &TcpRegistry, entry: &TcpEntry, payload: Bytes) {
    if payload.is_empty() {
        return;
    }

    let client_id = entry.client_id();
    match entry.connection().enqueue(payload) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            entry.connection().abort();
            if registry.remove(client_id).is_some() {
                warn!("Client {}: not reading, closing connection", client_id);
            }
        }
        Err(TrySendError::Closed(payload)) => {
            debug!("Client {}: closing, dropped {} bytes", client_id, payload.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::time::Duration;

    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    use crate::session::tests::{capture_sender, decode_captured};
    use crate::status::TracingReporter;
    use crate::transport::{ClientId, MessageKind, Target};

    use super::*;

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_pump_forwards_then_disconnects_once() {
        let (sender, mut rx) = capture_sender(1 << 20);
        let registry = Arc::new(Registry::new(
            sender,
            Arc::new(TracingReporter),
            CancellationToken::new(),
        ));
        let (mut outside, inside) = socket_pair().await;
        let client_id = ClientId::new();
        let target = Target::new([127, 0, 0, 1].into(), 8888);

        let (entry, created) = registry
            .get_or_create(client_id, target, || async move {
                Ok::<_, Infallible>(TcpConnection::new(inside, 16))
            })
            .await
            .unwrap();
        assert!(created);
        let pump = spawn_pump(entry.clone(), registry.clone(), 1024).unwrap();
        assert!(spawn_pump(entry.clone(), registry.clone(), 1024).is_none());

        outside.write_all(b"PING").await.unwrap();
        let packet = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(packet.kind, MessageKind::Binary);
        assert_eq!(packet.target, target);
        assert_eq!(&packet.payload[..], b"PING");

        outside.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();
        let packet = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(packet.kind, MessageKind::Disconnect);
        assert_eq!(packet.client_id, client_id);
        assert!(registry.get(client_id).is_none());
        assert_eq!(entry.stats().bytes_sent(), 4);
    }

    #[tokio::test]
    async fn test_deliver_writes_and_counts() {
        let (sender, _rx) = capture_sender(1 << 20);
        let registry = Arc::new(Registry::new(
            sender,
            Arc::new(TracingReporter),
            CancellationToken::new(),
        ));
        let (mut outside, inside) = socket_pair().await;
        let client_id = ClientId::new();

        let (entry, _) = registry
            .get_or_create(client_id, Target::NONE, || async move {
                Ok::<_, Infallible>(TcpConnection::new(inside, 16))
            })
            .await
            .unwrap();
        spawn_pump(entry.clone(), registry.clone(), 1024).unwrap();
        deliver(&registry, &entry, Bytes::from_static(b"PO"));
        deliver(&registry, &entry, Bytes::new());
        deliver(&registry, &entry, Bytes::from_static(b"NG"));

        let mut buf = [0u8; 4];
        outside.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");
        wait_until(|| entry.stats().bytes_received() == 4).await;
    }

    #[tokio::test]
    async fn test_close_flushes_queued_payloads() {
        let (sender, mut rx) = capture_sender(1 << 20);
        let registry = Arc::new(Registry::new(
            sender,
            Arc::new(TracingReporter),
            CancellationToken::new(),
        ));
        let (mut outside, inside) = socket_pair().await;
        let client_id = ClientId::new();

        let (entry, _) = registry
            .get_or_create(client_id, Target::NONE, || async move {
                Ok::<_, Infallible>(TcpConnection::new(inside, 16))
            })
            .await
            .unwrap();
        spawn_pump(entry.clone(), registry.clone(), 1024).unwrap();
        deliver(&registry, &entry, Bytes::from_static(b"last words"));
        registry.discard(client_id);

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), outside.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..], b"last words");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stalled_client_does_not_block_others() {
        let (sender, mut rx) = capture_sender(1 << 20);
        let registry = Arc::new(Registry::new(
            sender,
            Arc::new(TracingReporter),
            CancellationToken::new(),
        ));
        let (_stalled_outside, stalled_inside) = socket_pair().await;
        let (mut healthy_outside, healthy_inside) = socket_pair().await;
        let stalled = ClientId::new();
        let healthy = ClientId::new();

        let (stalled_entry, _) = registry
            .get_or_create(stalled, Target::NONE, || async move {
                Ok::<_, Infallible>(TcpConnection::new(stalled_inside, 4))
            })
            .await
            .unwrap();
        let (healthy_entry, _) = registry
            .get_or_create(healthy, Target::NONE, || async move {
                Ok::<_, Infallible>(TcpConnection::new(healthy_inside, 4))
            })
            .await
            .unwrap();
        spawn_pump(stalled_entry.clone(), registry.clone(), 1024).unwrap();
        spawn_pump(healthy_entry.clone(), registry.clone(), 1024).unwrap();

        // Far more than the socket buffers and the queue can hold.
        let chunk = Bytes::from(vec![7u8; 64 * 1024]);
        for _ in 0..512 {
            deliver(&registry, &stalled_entry, chunk.clone());
            tokio::task::yield_now().await;
        }
        deliver(&registry, &healthy_entry, Bytes::from_static(b"PONG"));

        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(2), healthy_outside.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"PONG");

        assert!(stalled_entry.is_closed());
        assert!(registry.get(stalled).is_none());
        assert!(registry.get(healthy).is_some());
        let notice = decode_captured(rx.recv().await.unwrap(), None);
        assert_eq!(notice.kind, MessageKind::Disconnect);
        assert_eq!(notice.client_id, stalled);
    }

    #[tokio::test]
    async fn test_session_cancel_interrupts_blocked_write() {
        let (sender, _rx) = capture_sender(1 << 20);
        let cancel = CancellationToken::new();
        let registry = Arc::new(Registry::new(
            sender,
            Arc::new(TracingReporter),
            cancel.clone(),
        ));
        let (mut outside, inside) = socket_pair().await;
        let client_id = ClientId::new();

        let (entry, _) = registry
            .get_or_create(client_id, Target::NONE, || async move {
                Ok::<_, Infallible>(TcpConnection::new(inside, 64))
            })
            .await
            .unwrap();
        let pump = spawn_pump(entry.clone(), registry.clone(), 1024).unwrap();

        // Enough to leave the writer blocked on a peer that is not reading.
        for _ in 0..32 {
            deliver(&registry, &entry, Bytes::from(vec![1u8; 1024 * 1024]));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!entry.is_closed());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();
        assert!(registry.is_empty());

        // Both halves are gone, so the peer reaches EOF after the buffered bytes.
        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), outside.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf.len() < 32 * 1024 * 1024);
    }
}
