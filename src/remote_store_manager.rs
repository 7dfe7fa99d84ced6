//! Registry of peer sessions
//!
//! Bridges discovery and both connection listeners into [`RemoteStore`]
//! lifecycles and pushes local index changes to every connected peer.
//! Index-change events arrive on whichever thread changed the index, so
//! they are only queued here; a worker thread does the sending.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::discovery::{DiscoveredPeer, DiscoveryHandler};
use crate::events::{Event, EventBus, EventHandler, EventKind, Flow, SubscriptionId};
use crate::identity::PeerId;
use crate::protocol::{timeouts, ControlMessage, TransferMessage, VERSION};
use crate::remote_store::{RemoteStore, StoreObserver};
use crate::transfer::TransferManager;
use crate::transport::{ConnectionHandler, IncomingConnection, Messenger};

const PROPAGATION_QUEUE_DEPTH: usize = 64;

#[derive(Default)]
struct Registry {
    sessions: HashMap<PeerId, Arc<RemoteStore>>,
    dialing: HashSet<PeerId>,
}

/// Connected sessions plus peers with an outbound dial in flight
#[derive(Default)]
pub struct PeerRegistry {
    inner: Mutex<Registry>,
}

impl PeerRegistry {
    /// Claim the right to dial `peer`; false if it is connected or being dialed
    fn begin_dial(&self, peer: PeerId) -> bool {
        let mut inner = self.inner.lock();
        if inner.sessions.contains_key(&peer) {
            return false;
        }
        inner.dialing.insert(peer)
    }

    fn end_dial(&self, peer: PeerId) {
        self.inner.lock().dialing.remove(&peer);
    }

    /// Register `store`, returning the session it displaced
    fn replace(&self, store: Arc<RemoteStore>) -> Option<Arc<RemoteStore>> {
        self.inner.lock().sessions.insert(store.peer(), store)
    }

    fn remove_if_same(&self, store: &RemoteStore) -> bool {
        let mut inner = self.inner.lock();
        match inner.sessions.get(&store.peer()) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), store) => {
                inner.sessions.remove(&store.peer());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, peer: PeerId) -> Option<Arc<RemoteStore>> {
        self.inner.lock().sessions.get(&peer).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<RemoteStore>> {
        self.inner.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

enum Propagation {
    Delta(BTreeSet<String>),
    Stop,
}

/// Ports peers listen on
#[derive(Debug, Clone, Copy)]
pub struct PeerPorts {
    pub control: u16,
    pub transfer: u16,
}

pub struct RemoteStoreManager {
    this: Weak<RemoteStoreManager>,
    local_id: PeerId,
    directory: Arc<Directory>,
    transfers: Arc<TransferManager>,
    events: Arc<EventBus>,
    registry: PeerRegistry,
    ports: PeerPorts,
    connect_timeout: Duration,
    queue: SyncSender<Propagation>,
    overflowed: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl RemoteStoreManager {
    pub fn new(
        directory: Arc<Directory>,
        transfers: Arc<TransferManager>,
        events: Arc<EventBus>,
        ports: PeerPorts,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let (queue, changes) = mpsc::sync_channel(PROPAGATION_QUEUE_DEPTH);
        let manager = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            local_id: directory.local_id(),
            directory,
            transfers,
            events,
            registry: PeerRegistry::default(),
            ports,
            connect_timeout,
            queue,
            overflowed: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            subscription: Mutex::new(None),
        });

        let weak = Arc::downgrade(&manager);
        let worker = thread::Builder::new()
            .name("propagate".into())
            .spawn(move || propagation_loop(weak, changes))
            .context("spawn propagation thread")?;
        *manager.worker.lock() = Some(worker);

        let id = manager.events.subscribe(
            EventKind::IndexChanged,
            Arc::clone(&manager) as Arc<dyn EventHandler>,
            0,
        );
        *manager.subscription.lock() = Some(id);
        Ok(manager)
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn transfers(&self) -> &Arc<TransferManager> {
        &self.transfers
    }

    /// Full index (or `INDEX_NO_CHANGE`) to every peer
    pub fn send_index(&self) {
        for store in self.registry.snapshot() {
            store.send_index();
        }
    }

    pub fn send_index_delta(&self, paths: &BTreeSet<String>) {
        if paths.is_empty() {
            return;
        }
        for store in self.registry.snapshot() {
            store.send_index_delta(paths);
        }
    }

    /// Wrap a fresh control connection in a session; a session already
    /// registered for the same peer is closed and replaced
    fn register_session(&self, messenger: Arc<Messenger<ControlMessage>>) -> Result<()> {
        let observer: Weak<dyn StoreObserver> = self.this.clone();
        let store = RemoteStore::new(
            messenger,
            Arc::clone(&self.directory),
            Arc::clone(&self.transfers),
            Arc::clone(&self.events),
            observer,
            self.ports.transfer,
        );
        if let Some(old) = self.registry.replace(Arc::clone(&store)) {
            debug!(peer = %store.peer(), "replacing existing session");
            old.replace_and_disconnect();
        }
        if let Err(e) = store.start() {
            self.registry.remove_if_same(&store);
            store.disconnect();
            return Err(e);
        }
        Ok(())
    }

    fn dial(&self, peer: DiscoveredPeer) {
        let address = SocketAddr::new(peer.address, self.ports.control);
        let connected = Messenger::<ControlMessage>::connect(
            address,
            self.local_id,
            peer.peer,
            self.connect_timeout,
        )
        .and_then(|messenger| self.register_session(messenger));
        self.registry.end_dial(peer.peer);
        if let Err(e) = connected {
            warn!(peer = %peer.peer, %address, error = %e, "could not connect to peer");
        }
    }

    pub fn accept_control(&self, connection: IncomingConnection) {
        let address = connection.address;
        let registered = Messenger::from_connection(connection, self.local_id)
            .and_then(|messenger| self.register_session(messenger));
        if let Err(e) = registered {
            warn!(%address, error = %e, "rejecting control connection");
        }
    }

    /// Route a transfer connection to the session it claims to belong to
    pub fn accept_transfer(&self, connection: IncomingConnection) {
        let Some(store) = self.registry.get(connection.remote_id) else {
            debug!(peer = %connection.remote_id, address = %connection.address,
                "transfer connection from unknown peer");
            return;
        };
        if store.address().ip() != connection.address.ip() {
            warn!(peer = %connection.remote_id, claimed = %store.address().ip(),
                actual = %connection.address.ip(), "transfer connection address mismatch");
            return;
        }
        let accepted = Messenger::<TransferMessage>::from_connection(connection, self.local_id)
            .and_then(|messenger| self.transfers.process_transfer(messenger));
        if let Err(e) = accepted {
            warn!(peer = %store.peer(), error = %e, "could not start inbound transfer");
        }
    }

    pub fn shutdown(&self) {
        if let Some(id) = self.subscription.lock().take() {
            self.events.unsubscribe(id);
        }
        let _ = self.queue.send(Propagation::Stop);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        for store in self.registry.snapshot() {
            store.disconnect();
        }
        self.transfers.stop_all();
        info!("peer sessions closed");
    }
}

fn propagation_loop(manager: Weak<RemoteStoreManager>, changes: Receiver<Propagation>) {
    loop {
        let next = changes.recv_timeout(Duration::from_millis(timeouts::POLL_MS));
        let Some(manager) = manager.upgrade() else {
            return;
        };
        match next {
            Ok(Propagation::Delta(paths)) => manager.send_index_delta(&paths),
            Ok(Propagation::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        // Changes were dropped while the queue was full
        if manager.overflowed.swap(false, Ordering::AcqRel) {
            manager.send_index();
        }
    }
}

impl EventHandler for RemoteStoreManager {
    fn handle(&self, event: &Event) -> Flow {
        if let Event::IndexChanged { paths } = event {
            if paths.is_empty() {
                return Flow::Continue;
            }
            match self.queue.try_send(Propagation::Delta(paths.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.overflowed.store(true, Ordering::Release),
                Err(TrySendError::Disconnected(_)) => {}
            }
        }
        Flow::Continue
    }
}

impl DiscoveryHandler for RemoteStoreManager {
    fn peer_discovered(&self, peer: DiscoveredPeer) {
        self.events.publish(Event::PeerDiscovered {
            address: peer.address,
            version: peer.version,
            peer: peer.peer,
        });
        if peer.version != VERSION {
            debug!(peer = %peer.peer, version = peer.version, "ignoring peer on another version");
            return;
        }
        if peer.peer == self.local_id || !self.registry.begin_dial(peer.peer) {
            return;
        }

        let Some(manager) = self.this.upgrade() else {
            self.registry.end_dial(peer.peer);
            return;
        };
        let spawned = thread::Builder::new()
            .name(format!("dial-{}", peer.peer))
            .spawn(move || manager.dial(peer));
        if let Err(e) = spawned {
            self.registry.end_dial(peer.peer);
            warn!(error = %e, "could not spawn dial thread");
        }
    }
}

impl StoreObserver for RemoteStoreManager {
    fn store_disconnected(&self, store: &RemoteStore) {
        if self.registry.remove_if_same(store) {
            debug!(peer = %store.peer(), "session removed");
        }
    }
}

/// Hands accepted control connections to the manager
pub struct ControlAcceptor(pub Weak<RemoteStoreManager>);

impl ConnectionHandler for ControlAcceptor {
    fn connection_established(&self, connection: IncomingConnection) {
        if let Some(manager) = self.0.upgrade() {
            manager.accept_control(connection);
        }
    }
}

/// Hands accepted transfer connections to the manager
pub struct TransferAcceptor(pub Weak<RemoteStoreManager>);

impl ConnectionHandler for TransferAcceptor {
    fn connection_established(&self, connection: IncomingConnection) {
        if let Some(manager) = self.0.upgrade() {
            manager.accept_transfer(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_is_claimed_once_per_peer() {
        let registry = PeerRegistry::default();
        let peer = PeerId::from_u128(7);

        assert!(registry.begin_dial(peer));
        assert!(!registry.begin_dial(peer));
        assert!(registry.begin_dial(PeerId::from_u128(8)));

        registry.end_dial(peer);
        assert!(registry.begin_dial(peer));
        assert!(registry.is_empty());
    }
}
