//! A running sync engine for one directory

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::directory::Directory;
use crate::discovery::{DiscoveryHandler, NetworkDiscovery};
use crate::events::EventBus;
use crate::identity::PeerId;
use crate::protocol::{timeouts, VERSION};
use crate::remote_store_manager::{
    ControlAcceptor, PeerPorts, RemoteStoreManager, TransferAcceptor,
};
use crate::transfer::TransferManager;
use crate::transport::ConnectionListener;

struct Listeners {
    control: ConnectionListener,
    transfer: ConnectionListener,
    discovery: Arc<NetworkDiscovery>,
}

pub struct SyncNode {
    local_id: PeerId,
    events: Arc<EventBus>,
    directory: Arc<Directory>,
    manager: Arc<RemoteStoreManager>,
    listeners: Listeners,
    running: Arc<AtomicBool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl SyncNode {
    /// Start with the persisted peer id from `config.id_file`
    pub fn start(config: SyncConfig) -> Result<Self> {
        let local_id = PeerId::load_or_create(&config.id_file)?;
        Self::start_with(config, local_id, Arc::new(EventBus::new()))
    }

    pub fn start_with(config: SyncConfig, local_id: PeerId, events: Arc<EventBus>) -> Result<Self> {
        let directory = Directory::open(local_id, &config.root, &config, Arc::clone(&events))?;
        let changed = directory.update_index().context("initial scan")?;
        info!(
            id = %local_id,
            root = %directory.root().display(),
            changed = changed.len(),
            "directory indexed"
        );

        let transfers = Arc::new(TransferManager::new(
            Arc::clone(&directory),
            Arc::clone(&events),
            config.block_size,
            config.connect_timeout(),
        ));
        let manager = RemoteStoreManager::new(
            Arc::clone(&directory),
            transfers,
            Arc::clone(&events),
            PeerPorts {
                control: config.control_port,
                transfer: config.transfer_port,
            },
            config.connect_timeout(),
        )?;

        let listeners = match open_listeners(&config, local_id, &manager) {
            Ok(listeners) => listeners,
            Err(e) => {
                manager.shutdown();
                return Err(e);
            }
        };
        if let Err(e) = listeners.discovery.request() {
            warn!(error = %e, "initial discovery request failed");
        }

        let running = Arc::new(AtomicBool::new(true));
        let maintenance = spawn_maintenance(
            &config,
            Arc::clone(&running),
            Arc::clone(&directory),
            Arc::clone(&listeners.discovery),
        )?;

        info!(
            control = %listeners.control.local_addr(),
            transfer = %listeners.transfer.local_addr(),
            discovery = %listeners.discovery.local_addr(),
            "sync node started"
        );
        Ok(Self {
            local_id,
            events,
            directory,
            manager,
            listeners,
            running,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn manager(&self) -> &Arc<RemoteStoreManager> {
        &self.manager
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.listeners.control.local_addr()
    }

    pub fn transfer_addr(&self) -> SocketAddr {
        self.listeners.transfer.local_addr()
    }

    /// Broadcast a discovery request now
    pub fn discover(&self) -> Result<()> {
        self.listeners.discovery.request()
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(maintenance) = self.maintenance.lock().take() {
            let _ = maintenance.join();
        }
        self.listeners.discovery.shutdown();
        self.listeners.control.shutdown();
        self.listeners.transfer.shutdown();
        self.manager.shutdown();
        self.directory.clear_temp_dir();
        if let Err(e) = self.directory.save_index() {
            warn!(error = %e, "failed to save index on shutdown");
        }
        info!("sync node stopped");
    }
}

fn open_listeners(
    config: &SyncConfig,
    local_id: PeerId,
    manager: &Arc<RemoteStoreManager>,
) -> Result<Listeners> {
    let control = ConnectionListener::bind(
        SocketAddr::new(config.listen_address, config.control_port),
        Arc::new(ControlAcceptor(Arc::downgrade(manager))),
    )?;
    let transfer = ConnectionListener::bind(
        SocketAddr::new(config.listen_address, config.transfer_port),
        Arc::new(TransferAcceptor(Arc::downgrade(manager))),
    )?;
    let discovery = Arc::new(NetworkDiscovery::bind(
        local_id,
        VERSION,
        SocketAddr::new(config.listen_address, config.discovery_port),
        SocketAddr::new(config.broadcast_address, config.discovery_port),
    )?);
    discovery.start_listening(Arc::clone(manager) as Arc<dyn DiscoveryHandler>)?;
    Ok(Listeners {
        control,
        transfer,
        discovery,
    })
}

/// Periodic rescans and discovery requests
fn spawn_maintenance(
    config: &SyncConfig,
    running: Arc<AtomicBool>,
    directory: Arc<Directory>,
    discovery: Arc<NetworkDiscovery>,
) -> Result<JoinHandle<()>> {
    let rescan_every = config.rescan_interval();
    let discover_every = config.discovery_interval();

    thread::Builder::new()
        .name("maintenance".into())
        .spawn(move || {
            let mut last_scan = Instant::now();
            let mut last_discovery = Instant::now();
            while running.load(Ordering::Acquire) {
                thread::sleep(Duration::from_millis(timeouts::POLL_MS));
                if last_scan.elapsed() >= rescan_every {
                    if let Err(e) = directory.update_index() {
                        warn!(error = %e, "rescan failed");
                    }
                    last_scan = Instant::now();
                }
                if last_discovery.elapsed() >= discover_every {
                    if let Err(e) = discovery.request() {
                        warn!(error = %e, "discovery request failed");
                    }
                    last_discovery = Instant::now();
                }
            }
        })
        .context("spawn maintenance thread")
}
