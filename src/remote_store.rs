//! Per-peer session over the control channel
//!
//! A store keeps a cached copy of the peer's index, diffs it against the
//! local one after every exchange and hands the files the peer is missing
//! to the transfer manager. Pulling is never initiated here: the peer runs
//! the same diff from its side and pushes.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::directory::Directory;
use crate::events::{Event, EventBus};
use crate::identity::PeerId;
use crate::index::{merge_delta, FileIndex};
use crate::protocol::ControlMessage;
use crate::transfer::TransferManager;
use crate::transport::{MessageHandler, Messenger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Connected,
    IndexExchanging,
    Synchronized,
    Disconnected,
}

/// What we know of the peer's index
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteIndex {
    Unknown,
    Known(FileIndex),
}

/// Owner of the session registry
pub trait StoreObserver: Send + Sync {
    fn store_disconnected(&self, store: &RemoteStore);
}

struct Session {
    phase: SessionPhase,
    remote_index: RemoteIndex,
    /// Directory version of the last full index sent
    last_sent_version: Option<u64>,
}

pub struct RemoteStore {
    peer: PeerId,
    address: SocketAddr,
    transfer_address: SocketAddr,
    messenger: Arc<Messenger<ControlMessage>>,
    directory: Arc<Directory>,
    transfers: Arc<TransferManager>,
    events: Arc<EventBus>,
    observer: Weak<dyn StoreObserver>,
    session: Mutex<Session>,
    replaced: AtomicBool,
}

impl RemoteStore {
    pub fn new(
        messenger: Arc<Messenger<ControlMessage>>,
        directory: Arc<Directory>,
        transfers: Arc<TransferManager>,
        events: Arc<EventBus>,
        observer: Weak<dyn StoreObserver>,
        transfer_port: u16,
    ) -> Arc<Self> {
        let address = messenger.address();
        Arc::new(Self {
            peer: messenger.remote_id(),
            address,
            transfer_address: SocketAddr::new(address.ip(), transfer_port),
            messenger,
            directory,
            transfers,
            events,
            observer,
            session: Mutex::new(Session {
                phase: SessionPhase::Connected,
                remote_index: RemoteIndex::Unknown,
                last_sent_version: None,
            }),
            replaced: AtomicBool::new(false),
        })
    }

    /// Start receiving and open the exchange with our full index
    pub fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        self.messenger
            .start_receiving(Arc::clone(self) as Arc<dyn MessageHandler<ControlMessage>>)?;
        info!(peer = %self.peer, address = %self.address, "peer connected");
        self.events.publish(Event::PeerConnected {
            peer: self.peer,
            address: self.address,
        });
        self.send_full_index();
        Ok(())
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.lock().phase
    }

    pub fn remote_index(&self) -> RemoteIndex {
        self.session.lock().remote_index.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.messenger.is_connected()
    }

    /// Close the session because a newer connection to the same peer won
    pub fn replace_and_disconnect(&self) {
        self.replaced.store(true, Ordering::Release);
        self.messenger.disconnect();
    }

    pub fn disconnect(&self) {
        self.messenger.disconnect();
    }

    fn send(&self, message: &ControlMessage) {
        if let Err(e) = self.messenger.send(message) {
            debug!(peer = %self.peer, error = %e, "control send failed");
        }
    }

    /// Full index if the directory changed since the last one we sent,
    /// `INDEX_NO_CHANGE` otherwise
    pub fn send_index(&self) {
        let (index, version) = self.directory.snapshot();
        let unchanged = {
            let mut session = self.session.lock();
            let unchanged = session.last_sent_version == Some(version);
            session.last_sent_version = Some(version);
            unchanged
        };
        if unchanged {
            self.send(&ControlMessage::IndexNoChange);
        } else {
            self.send(&ControlMessage::Index(index));
        }
    }

    pub fn send_full_index(&self) {
        let (index, version) = self.directory.snapshot();
        self.session.lock().last_sent_version = Some(version);
        self.send(&ControlMessage::Index(index));
    }

    pub fn send_index_delta(&self, paths: &BTreeSet<String>) {
        let records = self.directory.records(paths);
        if records.is_empty() {
            return;
        }
        self.send(&ControlMessage::IndexDelta(records));
    }

    pub fn request_index(&self) {
        self.send(&ControlMessage::RequestIndex);
    }

    /// Diff against the cached remote index and push what the peer lacks
    fn synchronize(&self) {
        let diff = {
            let session = self.session.lock();
            match &session.remote_index {
                RemoteIndex::Known(remote) => self.directory.diff(remote),
                RemoteIndex::Unknown => return,
            }
        };

        for file in &diff.conflicts {
            warn!(file, peer = %self.peer, "conflict: both sides changed independently");
        }
        if !diff.updates.is_empty() {
            debug!(peer = %self.peer, files = diff.updates.len(), "peer needs updates");
            self.transfers
                .sync_files(self.peer, self.transfer_address, &diff.updates);
        }
        self.session.lock().phase = SessionPhase::Synchronized;
    }
}

impl MessageHandler<ControlMessage> for RemoteStore {
    fn message_received(&self, message: ControlMessage) {
        match message {
            ControlMessage::Index(index) => {
                {
                    let mut session = self.session.lock();
                    session.remote_index = RemoteIndex::Known(index);
                    session.phase = SessionPhase::IndexExchanging;
                }
                self.synchronize();
                self.send_index();
            }
            ControlMessage::IndexDelta(delta) => {
                let known = {
                    let mut session = self.session.lock();
                    match &mut session.remote_index {
                        RemoteIndex::Known(cached) => {
                            merge_delta(cached, delta);
                            session.phase = SessionPhase::IndexExchanging;
                            true
                        }
                        RemoteIndex::Unknown => false,
                    }
                };
                if known {
                    self.synchronize();
                    self.send_index();
                } else {
                    self.request_index();
                }
            }
            ControlMessage::IndexNoChange => {
                if matches!(self.session.lock().remote_index, RemoteIndex::Unknown) {
                    self.request_index();
                } else {
                    self.synchronize();
                }
            }
            ControlMessage::RequestIndex => self.send_full_index(),
        }
    }

    fn disconnected(&self) {
        self.session.lock().phase = SessionPhase::Disconnected;
        if !self.replaced.load(Ordering::Acquire) {
            self.transfers.cancel_peer(self.peer);
        }
        info!(peer = %self.peer, "peer disconnected");
        self.events
            .publish(Event::PeerDisconnected { peer: self.peer });
        if let Some(observer) = self.observer.upgrade() {
            observer.store_disconnected(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::hash::Digest;
    use crate::index::FileRecord;
    use crate::transport::{ConnectionHandler, ConnectionListener, IncomingConnection};
    use std::sync::mpsc;
    use std::time::Duration;

    const ME: PeerId = PeerId::from_u128(0x1);
    const PEER: PeerId = PeerId::from_u128(0x2);

    struct Forward(Mutex<mpsc::Sender<IncomingConnection>>);

    impl ConnectionHandler for Forward {
        fn connection_established(&self, connection: IncomingConnection) {
            let _ = self.0.lock().send(connection);
        }
    }

    struct Inbox(Mutex<mpsc::Sender<ControlMessage>>);

    impl MessageHandler<ControlMessage> for Inbox {
        fn message_received(&self, message: ControlMessage) {
            let _ = self.0.lock().send(message);
        }
        fn disconnected(&self) {}
    }

    struct NoObserver;

    impl StoreObserver for NoObserver {
        fn store_disconnected(&self, _store: &RemoteStore) {}
    }

    #[test]
    fn test_index_exchange_protocol() {
        let tmp = tempfile::tempdir().unwrap();
        let events = Arc::new(EventBus::new());
        let directory =
            Directory::open(ME, tmp.path(), &SyncConfig::default(), Arc::clone(&events)).unwrap();
        let transfers = Arc::new(TransferManager::new(
            Arc::clone(&directory),
            Arc::clone(&events),
            4096,
            Duration::from_secs(1),
        ));

        let (conn_tx, conn_rx) = mpsc::channel();
        let listener = ConnectionListener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(Forward(Mutex::new(conn_tx))),
        )
        .unwrap();

        let remote = Messenger::<ControlMessage>::connect(
            listener.local_addr(),
            PEER,
            ME,
            Duration::from_secs(2),
        )
        .unwrap();
        let (msg_tx, msg_rx) = mpsc::channel();
        remote
            .start_receiving(Arc::new(Inbox(Mutex::new(msg_tx))))
            .unwrap();

        let incoming = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let observer: Weak<dyn StoreObserver> = Weak::<NoObserver>::new();
        let store = RemoteStore::new(
            Messenger::from_connection(incoming, ME).unwrap(),
            directory,
            transfers,
            events,
            observer,
            1,
        );
        assert_eq!(store.peer(), PEER);
        assert_eq!(store.remote_index(), RemoteIndex::Unknown);
        store.start().unwrap();

        let next = || msg_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(next(), ControlMessage::Index(FileIndex::new()));

        // A delta before any full index cannot be merged
        let delta = FileIndex::from([(
            "a".to_string(),
            FileRecord::new_local(PEER, Digest::of(b"a"), 5),
        )]);
        remote.send(&ControlMessage::IndexDelta(delta)).unwrap();
        assert_eq!(next(), ControlMessage::RequestIndex);

        // Nothing changed locally since our last full index
        remote.send(&ControlMessage::Index(FileIndex::new())).unwrap();
        assert_eq!(next(), ControlMessage::IndexNoChange);
        assert_eq!(store.remote_index(), RemoteIndex::Known(FileIndex::new()));

        remote.send(&ControlMessage::RequestIndex).unwrap();
        assert_eq!(next(), ControlMessage::Index(FileIndex::new()));

        remote.send(&ControlMessage::IndexNoChange).unwrap();
        assert!(msg_rx.recv_timeout(Duration::from_millis(300)).is_err());
        assert_eq!(store.phase(), SessionPhase::Synchronized);

        store.disconnect();
        assert!(!store.is_connected());
    }
}
