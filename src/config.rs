//! Engine configuration

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::{
    timeouts, BROADCAST_ADDRESS, DEFAULT_BLOCK_SIZE, DEFAULT_DISCOVERY_PORT, DEFAULT_PORT,
    DEFAULT_TRANSFER_PORT, INDEX_FILE_NAME, TEMP_DIR_NAME,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory kept in sync
    pub root: PathBuf,
    /// File holding this install's peer id
    pub id_file: PathBuf,

    /// Local address the TCP listeners and discovery bind to
    pub listen_address: IpAddr,
    pub control_port: u16,
    pub transfer_port: u16,
    pub discovery_port: u16,
    pub broadcast_address: IpAddr,

    pub block_size: usize,
    pub connect_timeout_ms: u64,

    pub rescan_interval_secs: u64,
    pub discovery_interval_secs: u64,

    pub index_file_name: String,
    pub temp_dir_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            id_file: default_id_file(),
            listen_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: DEFAULT_PORT,
            transfer_port: DEFAULT_TRANSFER_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: IpAddr::V4(BROADCAST_ADDRESS),
            block_size: DEFAULT_BLOCK_SIZE,
            connect_timeout_ms: timeouts::CONNECT_MS,
            rescan_interval_secs: 10,
            discovery_interval_secs: 60,
            index_file_name: INDEX_FILE_NAME.to_string(),
            temp_dir_name: TEMP_DIR_NAME.to_string(),
        }
    }
}

impl SyncConfig {
    /// Load from a TOML file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs.max(1))
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_interval_secs.max(1))
    }
}

/// Per-user config dir, falling back to the working directory
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(dir).join("syncall");
    }
    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        return PathBuf::from(home).join(".config").join("syncall");
    }
    PathBuf::from(".syncall")
}

fn default_id_file() -> PathBuf {
    config_dir().join("peer_id")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("syncall.toml");
        std::fs::write(
            &path,
            "root = \"/srv/share\"\nblock_size = 1024\nbroadcast_address = \"192.168.1.255\"\n",
        )
        .unwrap();

        let cfg = SyncConfig::load(&path).unwrap();
        assert_eq!(cfg.root, PathBuf::from("/srv/share"));
        assert_eq!(cfg.block_size, 1024);
        assert_eq!(cfg.broadcast_address, "192.168.1.255".parse::<IpAddr>().unwrap());
        assert_eq!(cfg.control_port, DEFAULT_PORT);
        assert_eq!(cfg.transfer_port, DEFAULT_TRANSFER_PORT);
        assert_eq!(cfg.index_file_name, INDEX_FILE_NAME);
        assert!(cfg.listen_address.is_unspecified());
    }

    #[test]
    fn test_ports_are_distinct() {
        let cfg = SyncConfig::default();
        assert_ne!(cfg.control_port, cfg.transfer_port);
    }
}
