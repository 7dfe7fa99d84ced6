//! Peer-to-peer LAN directory synchronization
//!
//! Peers find each other by UDP broadcast, exchange per-file version
//! records over a control connection, and push changed files to each
//! other with an rsync-style delta protocol over per-file connections.
//! Divergent edits are detected and reported, never merged.

pub mod checksum;
pub mod codec;
pub mod config;
pub mod delta;
pub mod directory;
pub mod discovery;
pub mod events;
pub mod hash;
pub mod identity;
pub mod index;
pub mod node;
pub mod paths;
pub mod protocol;
pub mod remote_store;
pub mod remote_store_manager;
pub mod transfer;
pub mod transport;

pub use config::SyncConfig;
pub use identity::PeerId;
pub use node::SyncNode;
