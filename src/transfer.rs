//! Per-file delta transfers
//!
//! Each (file, peer) pair gets its own TCP connection on the transfer port.
//! The sender opens it and sends `INIT`; the receiver answers with block
//! checksums of its current copy; the sender streams delta ops and `DONE`;
//! the receiver rebuilds the file in a temp file, commits it and answers
//! `DONE_ACCEPT` with its commit timestamp.
//!
//! Every transfer reaches exactly one terminal state, and reaching it
//! releases the temp file, closes the connection and drops the transfer from
//! the table.

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::BufWriter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::delta::{batch_ops, decode_ops, encode_ops, DeltaAlgorithm, Patcher};
use crate::directory::Directory;
use crate::events::{Event, EventBus, TransferDirection};
use crate::hash::Digest;
use crate::identity::PeerId;
use crate::index::{compare_file, FileRecord, SyncStatus};
use crate::protocol::{TransferMessage, MAX_BLOCK_DATA_BYTES};
use crate::transport::{MessageHandler, Messenger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Init,
    Negotiating,
    /// Sender: delta sent, waiting for `DONE_ACCEPT`
    Streaming,
    /// Receiver: checksums sent, no block data yet
    Accepted,
    Receiving,
    Completing,
    Done,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub file: String,
    pub peer: PeerId,
}

enum Registration {
    Inserted,
    Replaced(Arc<FileTransfer>),
    Existing,
}

/// Live transfers by (file, peer)
#[derive(Default)]
pub struct TransferTable {
    transfers: Mutex<HashMap<TransferKey, Arc<FileTransfer>>>,
}

impl TransferTable {
    /// Register an outbound transfer of `record` unless one for the same
    /// version (or an inbound one) is already running
    fn register_outbound(
        &self,
        key: TransferKey,
        transfer: Arc<FileTransfer>,
        record: &FileRecord,
    ) -> Registration {
        let mut transfers = self.transfers.lock();
        if let Some(existing) = transfers.get(&key) {
            let current = existing.direction == TransferDirection::Inbound
                || existing.record().is_some_and(|r| r.same_version(record));
            if current {
                return Registration::Existing;
            }
        }
        match transfers.insert(key, transfer) {
            Some(old) => Registration::Replaced(old),
            None => Registration::Inserted,
        }
    }

    fn replace(&self, key: TransferKey, transfer: Arc<FileTransfer>) -> Option<Arc<FileTransfer>> {
        self.transfers.lock().insert(key, transfer)
    }

    fn remove_if_same(&self, key: &TransferKey, transfer: &FileTransfer) -> bool {
        let mut transfers = self.transfers.lock();
        match transfers.get(key) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), transfer) => {
                transfers.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, file: &str, peer: PeerId) -> Option<Arc<FileTransfer>> {
        self.transfers
            .lock()
            .get(&TransferKey {
                file: file.to_string(),
                peer,
            })
            .cloned()
    }

    pub fn for_file(&self, file: &str) -> Vec<Arc<FileTransfer>> {
        self.transfers
            .lock()
            .iter()
            .filter(|(k, _)| k.file == file)
            .map(|(_, t)| Arc::clone(t))
            .collect()
    }

    pub fn for_peer(&self, peer: PeerId) -> Vec<Arc<FileTransfer>> {
        self.transfers
            .lock()
            .iter()
            .filter(|(k, _)| k.peer == peer)
            .map(|(_, t)| Arc::clone(t))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<FileTransfer>> {
        self.transfers.lock().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.transfers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Shared {
    directory: Arc<Directory>,
    events: Arc<EventBus>,
    table: TransferTable,
    block_size: usize,
    connect_timeout: Duration,
}

struct Receiving {
    patcher: Patcher<File, BufWriter<File>>,
}

struct Inner {
    state: TransferState,
    file: Option<String>,
    record: Option<FileRecord>,
    temp_path: Option<PathBuf>,
    receiving: Option<Receiving>,
}

enum Step {
    Continue,
    Finish(TransferState),
}

/// One delta transfer of one file with one peer
pub struct FileTransfer {
    this: Weak<FileTransfer>,
    peer: PeerId,
    direction: TransferDirection,
    shared: Arc<Shared>,
    messenger: Mutex<Option<Arc<Messenger<TransferMessage>>>>,
    inner: Mutex<Inner>,
    cancelled: AtomicBool,
    finished: AtomicBool,
}

impl FileTransfer {
    fn new(
        shared: Arc<Shared>,
        peer: PeerId,
        direction: TransferDirection,
        file: Option<String>,
        record: Option<FileRecord>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            peer,
            direction,
            shared,
            messenger: Mutex::new(None),
            inner: Mutex::new(Inner {
                state: TransferState::Init,
                file,
                record,
                temp_path: None,
                receiving: None,
            }),
            cancelled: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn state(&self) -> TransferState {
        self.inner.lock().state
    }

    /// Unknown for an inbound transfer until its `INIT` arrives
    pub fn file(&self) -> Option<String> {
        self.inner.lock().file.clone()
    }

    /// Version being transferred
    pub fn record(&self) -> Option<FileRecord> {
        self.inner.lock().record.clone()
    }

    fn set_state(&self, state: TransferState) {
        self.inner.lock().state = state;
    }

    fn send(&self, message: &TransferMessage) -> Result<()> {
        let messenger = self.messenger.lock().clone();
        match messenger {
            Some(m) => m.send(message),
            None => bail!("transfer is not connected"),
        }
    }

    /// Stop the transfer: best-effort `CANCEL`, then close the connection
    pub fn cancel(&self) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        self.cancelled.store(true, Ordering::Release);
        let messenger = self.messenger.lock().clone();
        match messenger {
            Some(m) => {
                let _ = m.send(&TransferMessage::Cancel);
                m.disconnect();
            }
            None => self.finish(TransferState::Cancelled, None),
        }
    }

    fn start_outbound(self: &Arc<Self>, address: SocketAddr) {
        let transfer = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name(format!("transfer-{}", self.peer))
            .spawn(move || {
                if let Err(e) = transfer.connect_and_init(address) {
                    transfer.finish(TransferState::Failed, Some(format!("{e:#}")));
                }
            });
        if let Err(e) = spawned {
            self.finish(TransferState::Failed, Some(format!("spawn: {e}")));
        }
    }

    fn connect_and_init(self: &Arc<Self>, address: SocketAddr) -> Result<()> {
        let messenger = Messenger::connect(
            address,
            self.shared.directory.local_id(),
            self.peer,
            self.shared.connect_timeout,
        )?;
        *self.messenger.lock() = Some(Arc::clone(&messenger));
        if self.cancelled.load(Ordering::Acquire) || self.finished.load(Ordering::Acquire) {
            messenger.disconnect();
            return Ok(());
        }

        messenger.start_receiving(Arc::clone(self) as Arc<dyn MessageHandler<TransferMessage>>)?;
        let (file, record) = {
            let mut inner = self.inner.lock();
            inner.state = TransferState::Negotiating;
            (inner.file.clone(), inner.record.clone())
        };
        let (Some(file_name), Some(record)) = (file, record) else {
            bail!("outbound transfer without a file");
        };

        self.publish_started(&file_name);
        messenger.send(&TransferMessage::Init { file_name, record })
    }

    fn publish_started(&self, file: &str) {
        debug!(file, peer = %self.peer, direction = ?self.direction, "transfer started");
        self.shared.events.publish(Event::TransferStarted {
            file: file.to_string(),
            peer: self.peer,
            direction: self.direction,
        });
    }

    fn on_sender_message(&self, message: TransferMessage) -> Result<Step> {
        match message {
            TransferMessage::InitAccept {
                block_size,
                checksums,
            } => {
                let (file, record) = {
                    let inner = self.inner.lock();
                    if inner.state != TransferState::Negotiating {
                        bail!("unexpected INIT_ACCEPT in state {:?}", inner.state);
                    }
                    (inner.file.clone(), inner.record.clone())
                };
                let (Some(file), Some(record)) = (file, record) else {
                    bail!("transfer has no file");
                };
                let Some(expected) = record.hash() else {
                    bail!("peer accepted content for a deleted file");
                };
                if block_size == 0 {
                    bail!("peer proposed a zero block size");
                }

                let path = self.shared.directory.file_path(&file)?;
                let source = std::fs::read(&path)
                    .with_context(|| format!("read source {}", path.display()))?;
                if Digest::of(&source) != *expected {
                    bail!("source changed since the transfer started");
                }

                let ops = DeltaAlgorithm::new(block_size as usize).compute_delta(&source, &checksums);
                for batch in batch_ops(ops, MAX_BLOCK_DATA_BYTES) {
                    if self.cancelled.load(Ordering::Acquire) {
                        return Ok(Step::Finish(TransferState::Cancelled));
                    }
                    self.send(&TransferMessage::BlockData(encode_ops(&batch)?))?;
                }
                self.set_state(TransferState::Streaming);
                self.send(&TransferMessage::Done)?;
                Ok(Step::Continue)
            }
            TransferMessage::DoneAccept { timestamp } => {
                let (state, file, record) = {
                    let inner = self.inner.lock();
                    (inner.state, inner.file.clone(), inner.record.clone())
                };
                if state != TransferState::Streaming {
                    bail!("unexpected DONE_ACCEPT in state {state:?}");
                }
                let (Some(file), Some(record)) = (file, record) else {
                    bail!("transfer has no file");
                };
                if !self
                    .shared
                    .directory
                    .finalize_outbound(&file, &record, self.peer, timestamp)?
                {
                    debug!(file, peer = %self.peer, "local record moved on, sync log not updated");
                }
                Ok(Step::Finish(TransferState::Done))
            }
            // Nothing to send: deleted file or receiver already up to date
            TransferMessage::Done => Ok(Step::Finish(TransferState::Done)),
            TransferMessage::Cancel => Ok(Step::Finish(TransferState::Cancelled)),
            other => bail!("unexpected message for a sender: {other:?}"),
        }
    }

    fn on_receiver_message(&self, message: TransferMessage) -> Result<Step> {
        match message {
            TransferMessage::Init { file_name, record } => self.accept_init(file_name, record),
            TransferMessage::BlockData(payload) => {
                let ops = decode_ops(&payload)?;
                let mut inner = self.inner.lock();
                if !matches!(inner.state, TransferState::Accepted | TransferState::Receiving) {
                    bail!("unexpected BLOCK_DATA in state {:?}", inner.state);
                }
                let Some(receiving) = inner.receiving.as_mut() else {
                    bail!("no reconstruction in progress");
                };
                for op in &ops {
                    receiving.patcher.apply(op)?;
                }
                inner.state = TransferState::Receiving;
                Ok(Step::Continue)
            }
            TransferMessage::Done => self.complete(),
            TransferMessage::Cancel => Ok(Step::Finish(TransferState::Cancelled)),
            other => bail!("unexpected message for a receiver: {other:?}"),
        }
    }

    fn accept_init(&self, file_name: String, record: FileRecord) -> Result<Step> {
        if self.state() != TransferState::Init {
            bail!("duplicate INIT");
        }
        let file = self
            .shared
            .directory
            .check_key(&file_name)
            .with_context(|| format!("rejecting file name {file_name:?}"))?;
        {
            let mut inner = self.inner.lock();
            inner.file = Some(file.clone());
            inner.record = Some(record.clone());
            inner.state = TransferState::Negotiating;
        }

        let Some(this) = self.this.upgrade() else {
            bail!("transfer dropped");
        };
        let key = TransferKey {
            file: file.clone(),
            peer: self.peer,
        };
        if let Some(old) = self.shared.table.replace(key, this) {
            old.cancel();
        }
        self.publish_started(&file);

        let directory = &self.shared.directory;
        if record.is_deleted() {
            self.send(&TransferMessage::Done)?;
            return Ok(Step::Finish(TransferState::Done));
        }
        if compare_file(&record, directory.record(&file).as_ref()) != SyncStatus::NeedsUpdate {
            debug!(file, peer = %self.peer, "incoming version is not newer, rejecting");
            let _ = self.send(&TransferMessage::Cancel);
            return Ok(Step::Finish(TransferState::Cancelled));
        }

        let temp_path = directory.get_temp_path(&file)?;
        self.inner.lock().temp_path = Some(temp_path.clone());

        let (checksums, basis) = directory.block_checksums(&file, self.shared.block_size)?;
        let out = File::create(&temp_path)
            .with_context(|| format!("open temp {}", temp_path.display()))?;
        {
            let mut inner = self.inner.lock();
            inner.receiving = Some(Receiving {
                patcher: Patcher::new(basis, BufWriter::new(out)),
            });
            inner.state = TransferState::Accepted;
        }

        let block_size = u32::try_from(self.shared.block_size).context("block size too large")?;
        self.send(&TransferMessage::InitAccept {
            block_size,
            checksums,
        })?;
        Ok(Step::Continue)
    }

    fn complete(&self) -> Result<Step> {
        let (receiving, file, record, temp_path) = {
            let mut inner = self.inner.lock();
            if !matches!(inner.state, TransferState::Accepted | TransferState::Receiving) {
                bail!("unexpected DONE in state {:?}", inner.state);
            }
            inner.state = TransferState::Completing;
            (
                inner.receiving.take(),
                inner.file.clone(),
                inner.record.clone(),
                inner.temp_path.clone(),
            )
        };
        let (Some(receiving), Some(file), Some(record), Some(temp_path)) =
            (receiving, file, record, temp_path)
        else {
            bail!("no reconstruction in progress");
        };

        let out = receiving.patcher.finish()?;
        let out = out.into_inner().map_err(|e| anyhow!("flush temp file: {}", e.error()))?;
        out.sync_all().ok();
        drop(out);

        let timestamp = self
            .shared
            .directory
            .commit_transfer(&file, &temp_path, &record)?;
        self.send(&TransferMessage::DoneAccept { timestamp })?;
        Ok(Step::Finish(TransferState::Done))
    }

    /// Enter a terminal state; only the first call has any effect
    fn finish(&self, state: TransferState, reason: Option<String>) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let (file, temp_path) = {
            let mut inner = self.inner.lock();
            inner.state = state;
            inner.receiving = None;
            (inner.file.clone(), inner.temp_path.take())
        };
        if let Some(temp_path) = temp_path {
            self.shared.directory.release_temp_file(&temp_path);
        }
        if let Some(file) = &file {
            self.shared.table.remove_if_same(
                &TransferKey {
                    file: file.clone(),
                    peer: self.peer,
                },
                self,
            );
        }
        if let Some(messenger) = self.messenger.lock().take() {
            messenger.disconnect();
        }

        let Some(file) = file else {
            return;
        };
        let (peer, direction) = (self.peer, self.direction);
        let event = match state {
            TransferState::Done => {
                info!(file, %peer, ?direction, "transfer complete");
                Event::TransferCompleted { file, peer, direction }
            }
            TransferState::Cancelled => {
                debug!(file, %peer, ?direction, "transfer cancelled");
                Event::TransferCancelled { file, peer, direction }
            }
            _ => {
                let reason = reason.unwrap_or_else(|| "unknown error".into());
                warn!(file, %peer, ?direction, %reason, "transfer failed");
                Event::TransferFailed {
                    file,
                    peer,
                    direction,
                    reason,
                }
            }
        };
        self.shared.events.publish(event);
    }
}

impl MessageHandler<TransferMessage> for FileTransfer {
    fn message_received(&self, message: TransferMessage) {
        if self.finished.load(Ordering::Acquire) {
            return;
        }
        let step = match self.direction {
            TransferDirection::Outbound => self.on_sender_message(message),
            TransferDirection::Inbound => self.on_receiver_message(message),
        };
        match step {
            Ok(Step::Continue) => {}
            Ok(Step::Finish(state)) => self.finish(state, None),
            Err(e) => {
                let _ = self.send(&TransferMessage::Cancel);
                self.finish(TransferState::Failed, Some(format!("{e:#}")));
            }
        }
    }

    fn disconnected(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.finish(TransferState::Cancelled, None);
        } else {
            self.finish(TransferState::Failed, Some("connection lost".into()));
        }
    }
}

/// Owns the transfer table and starts transfers in both directions
pub struct TransferManager {
    shared: Arc<Shared>,
}

impl TransferManager {
    pub fn new(
        directory: Arc<Directory>,
        events: Arc<EventBus>,
        block_size: usize,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                directory,
                events,
                table: TransferTable::default(),
                block_size: block_size.max(1),
                connect_timeout,
            }),
        }
    }

    pub fn table(&self) -> &TransferTable {
        &self.shared.table
    }

    /// Push `files` to `peer`, whose transfer listener is at `address`.
    ///
    /// A file already being sent to that peer is left alone unless its
    /// local record changed since that transfer started.
    pub fn sync_files(&self, peer: PeerId, address: SocketAddr, files: &BTreeSet<String>) {
        for file in files {
            let Some(record) = self.shared.directory.record(file) else {
                continue;
            };
            let transfer = FileTransfer::new(
                Arc::clone(&self.shared),
                peer,
                TransferDirection::Outbound,
                Some(file.clone()),
                Some(record.clone()),
            );
            let key = TransferKey {
                file: file.clone(),
                peer,
            };
            match self
                .shared
                .table
                .register_outbound(key, Arc::clone(&transfer), &record)
            {
                Registration::Existing => continue,
                Registration::Replaced(stale) => {
                    debug!(file, %peer, "replacing stale transfer");
                    stale.cancel();
                }
                Registration::Inserted => {}
            }
            transfer.start_outbound(address);
        }
    }

    /// Serve an inbound transfer connection from an already verified peer
    pub fn process_transfer(&self, messenger: Arc<Messenger<TransferMessage>>) -> Result<()> {
        let transfer = FileTransfer::new(
            Arc::clone(&self.shared),
            messenger.remote_id(),
            TransferDirection::Inbound,
            None,
            None,
        );
        *transfer.messenger.lock() = Some(Arc::clone(&messenger));
        messenger.start_receiving(transfer)
    }

    pub fn cancel_peer(&self, peer: PeerId) {
        for transfer in self.shared.table.for_peer(peer) {
            transfer.cancel();
        }
    }

    pub fn stop_all(&self) {
        for transfer in self.shared.table.snapshot() {
            transfer.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::events::{EventHandler, EventKind, Flow};

    const ME: PeerId = PeerId::from_u128(0x1);
    const PEER: PeerId = PeerId::from_u128(0x2);

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Event>>);

    impl EventHandler for Recorder {
        fn handle(&self, event: &Event) -> Flow {
            self.0.lock().push(event.clone());
            Flow::Continue
        }
    }

    fn manager(root: &std::path::Path) -> (TransferManager, Arc<Recorder>) {
        let events = Arc::new(EventBus::new());
        let recorder = Arc::new(Recorder::default());
        events.subscribe(EventKind::TransferCancelled, recorder.clone(), 0);
        let directory =
            Directory::open(ME, root, &SyncConfig::default(), Arc::clone(&events)).unwrap();
        let manager = TransferManager::new(directory, events, 4096, Duration::from_secs(1));
        (manager, recorder)
    }

    fn outbound(manager: &TransferManager, record: &FileRecord) -> Arc<FileTransfer> {
        FileTransfer::new(
            Arc::clone(&manager.shared),
            PEER,
            TransferDirection::Outbound,
            Some("f".into()),
            Some(record.clone()),
        )
    }

    fn key() -> TransferKey {
        TransferKey {
            file: "f".into(),
            peer: PEER,
        }
    }

    #[test]
    fn test_same_version_is_not_restarted() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, _) = manager(tmp.path());
        let table = manager.table();

        let v1 = FileRecord::new_local(ME, Digest::of(b"one"), 10);
        let v2 = FileRecord::new_local(ME, Digest::of(b"two"), 20);

        let first = outbound(&manager, &v1);
        assert!(matches!(
            table.register_outbound(key(), Arc::clone(&first), &v1),
            Registration::Inserted
        ));
        assert!(matches!(
            table.register_outbound(key(), outbound(&manager, &v1), &v1),
            Registration::Existing
        ));
        assert!(Arc::ptr_eq(&table.get("f", PEER).unwrap(), &first));

        match table.register_outbound(key(), outbound(&manager, &v2), &v2) {
            Registration::Replaced(old) => assert!(Arc::ptr_eq(&old, &first)),
            _ => panic!("stale transfer was not replaced"),
        }
        assert_eq!(table.len(), 1);
        assert_eq!(table.for_file("f").len(), 1);
        assert_eq!(table.for_peer(PEER).len(), 1);
        assert!(table.for_peer(ME).is_empty());
    }

    #[test]
    fn test_cancel_before_connect() {
        let tmp = tempfile::tempdir().unwrap();
        let (manager, recorder) = manager(tmp.path());
        let record = FileRecord::new_local(ME, Digest::of(b"x"), 10);

        let transfer = outbound(&manager, &record);
        manager
            .table()
            .register_outbound(key(), Arc::clone(&transfer), &record);

        manager.cancel_peer(PEER);
        transfer.cancel();

        assert_eq!(transfer.state(), TransferState::Cancelled);
        assert!(transfer.state().is_terminal());
        assert!(manager.table().is_empty());
        assert_eq!(recorder.0.lock().len(), 1);
    }

    #[test]
    fn test_unreachable_peer_fails_and_deregisters() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("f"), b"data").unwrap();
        let (manager, _) = manager(tmp.path());
        manager.shared.directory.update_index().unwrap();

        // Bound then dropped, so nothing listens there
        let address = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        manager.sync_files(PEER, address, &BTreeSet::from(["f".to_string()]));

        for _ in 0..100 {
            if manager.table().is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(manager.table().is_empty());
        assert_eq!(manager.shared.directory.temp_file_count(), 0);
    }
}
