//! Per-session table of live client streams, keyed by [`ClientId`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::session::SessionSender;
use crate::status::{ConnectionInfo, ConnectionStats, StatusEvent, StatusReporter};
use crate::transport::{ClientId, Packet, Target};

/// Payload of the Disconnect notice sent when an entry is removed.
pub const CLOSED_REASON: &str = "Connection closed";

/// How many removed ids a registry remembers.
pub const RETIRED_CAPACITY: usize = 4096;

/// The transport half a registry entry owns.
pub trait Connection: Send + Sync + 'static {
    fn close(&self) -> impl Future<Output = io::Result<()>> + Send;

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

pub struct Entry<C> {
    client_id: ClientId,
    target: Target,
    connection: C,
    stats: ConnectionStats,
    cancel: CancellationToken,
}

impl<C: Connection> Entry<C> {
    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// Target cached when the entry was created. Replies and disconnect
    /// notices always carry this value.
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Fires once the entry leaves the registry.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            client_id: self.client_id,
            target: self.target,
            peer: self.connection.peer_addr(),
            bytes_sent: self.stats.bytes_sent(),
            bytes_received: self.stats.bytes_received(),
            age: self.stats.age(),
        }
    }
}

type Slot<C> = Arc<OnceCell<Arc<Entry<C>>>>;

/// Ids whose entries were removed, oldest first.
#[derive(Default)]
struct Retired {
    ids: HashSet<ClientId>,
    order: VecDeque<ClientId>,
}

impl Retired {
    fn insert(&mut self, client_id: ClientId) {
        if !self.ids.insert(client_id) {
            return;
        }
        self.order.push_back(client_id);
        if self.order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

pub struct Registry<C> {
    slots: Mutex<HashMap<ClientId, Slot<C>>>,
    retired: Mutex<Retired>,
    sender: SessionSender,
    reporter: Arc<dyn StatusReporter>,
    cancel: CancellationToken,
}

impl<C: Connection> Registry<C> {
    /// Every entry's token is a child of `cancel`, so cancelling the session
    /// stops all pumps.
    pub fn new(
        sender: SessionSender,
        reporter: Arc<dyn StatusReporter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            retired: Mutex::new(Retired::default()),
            sender,
            reporter,
            cancel,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ClientId, Slot<C>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the entry for `client_id`, building it with `factory` if none
    /// exists. The flag is `true` only for the caller whose factory ran.
    ///
    /// Concurrent callers for the same id wait on one initialization; at most
    /// one factory runs at a time. A failed factory leaves no slot behind.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        client_id: ClientId,
        target: Target,
        factory: F,
    ) -> Result<(Arc<Entry<C>>, bool), E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let slot = self.slots().entry(client_id).or_default().clone();

        let created = AtomicBool::new(false);
        let created_ref = &created;
        let cancel = self.cancel.child_token();
        let result = slot
            .get_or_try_init(|| async move {
                let connection = factory().await?;
                created_ref.store(true, Ordering::Release);
                Ok::<_, E>(Arc::new(Entry {
                    client_id,
                    target,
                    connection,
                    stats: ConnectionStats::default(),
                    cancel,
                }))
            })
            .await;

        let entry = match result {
            Ok(entry) => entry.clone(),
            Err(e) => {
                let mut slots = self.slots();
                if slots
                    .get(&client_id)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !slot.initialized())
                {
                    slots.remove(&client_id);
                }
                return Err(e);
            }
        };

        if !created.load(Ordering::Acquire) {
            return Ok((entry, false));
        }

        let still_registered = self
            .slots()
            .get(&client_id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot));
        if !still_registered {
            // Removed while the factory was running.
            debug!("Client {}: removed during setup, closing", client_id);
            entry.cancel.cancel();
            spawn_close(entry.clone());
            return Ok((entry, false));
        }

        self.reporter.report(StatusEvent::ConnectionOpened {
            client_id,
            target,
            peer: entry.connection.peer_addr(),
        });
        Ok((entry, true))
    }

    pub fn get(&self, client_id: ClientId) -> Option<Arc<Entry<C>>> {
        self.slots()
            .get(&client_id)
            .and_then(|slot| slot.get().cloned())
    }

    /// Marks `client_id` as used up. Packets for a retired id must never open
    /// a new connection.
    pub fn retire(&self, client_id: ClientId) {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id);
    }

    pub fn is_retired(&self, client_id: ClientId) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(&client_id)
    }

    fn take(&self, client_id: ClientId) -> Option<Arc<Entry<C>>> {
        let slot = {
            let mut slots = self.slots();
            let slot = slots.remove(&client_id)?;
            // An id is always either in the table or retired.
            self.retire(client_id);
            slot
        };
        let entry = slot.get()?.clone();
        entry.cancel.cancel();
        self.report_closed(&entry);
        Some(entry)
    }

    fn report_closed(&self, entry: &Entry<C>) {
        self.reporter.report(StatusEvent::ConnectionClosed {
            client_id: entry.client_id,
            target: entry.target,
            bytes_sent: entry.stats.bytes_sent(),
            bytes_received: entry.stats.bytes_received(),
            duration: entry.stats.age(),
        });
    }

    /// Removes the entry and, in the background, tells the peer with a
    /// Disconnect carrying the cached target before closing the connection.
    ///
    /// Removing an absent id is a no-op, so the notice and the close happen
    /// at most once per entry. Failures are logged, never returned.
    pub fn remove(&self, client_id: ClientId) -> Option<Arc<Entry<C>>> {
        let entry = self.take(client_id)?;

        let sender = self.sender.clone();
        let closing = entry.clone();
        tokio::spawn(async move {
            if sender.is_open() {
                let notice = Packet::disconnect(closing.client_id, closing.target, CLOSED_REASON);
                if let Err(e) = sender.send(&notice).await {
                    debug!("Client {}: disconnect notice not sent: {}", closing.client_id, e);
                }
            }
            if let Err(e) = closing.connection.close().await {
                debug!("Client {}: close failed: {}", closing.client_id, e);
            }
        });

        Some(entry)
    }

    /// Like [`Registry::remove`] but without notifying the peer, for streams
    /// the peer already tore down.
    pub fn discard(&self, client_id: ClientId) -> Option<Arc<Entry<C>>> {
        let entry = self.take(client_id)?;
        spawn_close(entry.clone());
        Some(entry)
    }

    /// Closes every entry at session end. No notices are sent.
    pub async fn close_all(&self) -> usize {
        let slots: Vec<_> = self.slots().drain().map(|(_, slot)| slot).collect();

        let mut closed = 0;
        for slot in slots {
            let Some(entry) = slot.get() else {
                continue;
            };
            entry.cancel.cancel();
            self.report_closed(entry);
            if let Err(e) = entry.connection.close().await {
                debug!("Client {}: close failed: {}", entry.client_id, e);
            }
            closed += 1;
        }
        closed
    }

    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut rows: Vec<_> = self
            .slots()
            .values()
            .filter_map(|slot| slot.get().map(|entry| entry.info()))
            .collect();
        rows.sort_by(|a, b| b.age.cmp(&a.age));
        rows
    }

    pub fn len(&self) -> usize {
        self.slots().values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sender(&self) -> &SessionSender {
        &self.sender
    }

    /// The session token every entry token descends from.
    pub fn session_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn reporter(&self) -> &dyn StatusReporter {
        self.reporter.as_ref()
    }
}

fn spawn_close<C: Connection>(entry: Arc<Entry<C>>) {
    tokio::spawn(async move {
        if let Err(e) = entry.connection.close().await {
            debug!("Client {}: close failed: {}", entry.client_id, e);
        }
    });
}
