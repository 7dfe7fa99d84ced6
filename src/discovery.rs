//! UDP broadcast peer discovery
//!
//! Independent of the TCP transport: a request is one MessagePack datagram
//! `{version, uuid}` sent to the broadcast address, and every listening
//! instance reports the sender. Repeats are not filtered here.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::identity::PeerId;
use crate::protocol::timeouts;

#[derive(Debug, Serialize, Deserialize)]
struct Announcement {
    version: u32,
    uuid: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: IpAddr,
    pub version: u32,
    pub peer: PeerId,
}

pub trait DiscoveryHandler: Send + Sync {
    /// Runs on the listener thread
    fn peer_discovered(&self, peer: DiscoveredPeer);
}

/// Decode one datagram; `None` for garbage and for our own broadcasts
fn decode_announcement(data: &[u8], source: IpAddr, local_id: PeerId) -> Option<DiscoveredPeer> {
    let announcement: Announcement = match rmp_serde::from_slice(data) {
        Ok(a) => a,
        Err(e) => {
            debug!(%source, error = %e, "ignoring undecodable discovery packet");
            return None;
        }
    };
    let peer: PeerId = match announcement.uuid.parse() {
        Ok(peer) => peer,
        Err(e) => {
            debug!(%source, error = %e, "ignoring discovery packet with bad id");
            return None;
        }
    };
    if peer == local_id {
        return None;
    }
    Some(DiscoveredPeer {
        address: source,
        version: announcement.version,
        peer,
    })
}

pub struct NetworkDiscovery {
    local_id: PeerId,
    version: u32,
    target: SocketAddr,
    sender: UdpSocket,
    listener: Mutex<Option<UdpSocket>>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkDiscovery {
    /// Listen for requests on `port` and broadcast our own to `target`
    pub fn new(local_id: PeerId, version: u32, port: u16, target: SocketAddr) -> Result<Self> {
        Self::bind(
            local_id,
            version,
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
            target,
        )
    }

    pub fn bind(
        local_id: PeerId,
        version: u32,
        listen: SocketAddr,
        target: SocketAddr,
    ) -> Result<Self> {
        let listener =
            UdpSocket::bind(listen).with_context(|| format!("bind discovery socket {listen}"))?;
        listener.set_read_timeout(Some(Duration::from_millis(timeouts::POLL_MS)))?;
        let local_addr = listener.local_addr()?;

        let sender = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
            .context("bind discovery sender")?;
        sender.set_broadcast(true).context("enable broadcast")?;

        Ok(Self {
            local_id,
            version,
            target,
            sender,
            listener: Mutex::new(Some(listener)),
            local_addr,
            running: Arc::new(AtomicBool::new(true)),
            thread: Mutex::new(None),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Announce ourselves to every host on the LAN
    pub fn request(&self) -> Result<()> {
        let packet = rmp_serde::to_vec_named(&Announcement {
            version: self.version,
            uuid: self.local_id.to_string(),
        })?;
        self.sender
            .send_to(&packet, self.target)
            .with_context(|| format!("broadcast discovery to {}", self.target))?;
        trace!(target = %self.target, "discovery request sent");
        Ok(())
    }

    pub fn start_listening(&self, handler: Arc<dyn DiscoveryHandler>) -> Result<()> {
        let Some(socket) = self.listener.lock().take() else {
            anyhow::bail!("discovery listener already started");
        };
        let running = Arc::clone(&self.running);
        let local_id = self.local_id;

        let thread = thread::Builder::new()
            .name("discovery".into())
            .spawn(move || {
                let mut buf = [0u8; 1500];
                while running.load(Ordering::Acquire) {
                    match socket.recv_from(&mut buf) {
                        Ok((n, source)) => {
                            if let Some(peer) = decode_announcement(&buf[..n], source.ip(), local_id)
                            {
                                debug!(peer = %peer.peer, address = %peer.address, "peer discovered");
                                handler.peer_discovered(peer);
                            }
                        }
                        Err(e)
                            if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
                        Err(e) => {
                            warn!(error = %e, "discovery receive failed");
                            thread::sleep(Duration::from_millis(timeouts::POLL_MS));
                        }
                    }
                }
            })
            .context("spawn discovery thread")?;
        *self.thread.lock() = Some(thread);
        Ok(())
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for NetworkDiscovery {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    struct Forward(Mutex<mpsc::Sender<DiscoveredPeer>>);

    impl DiscoveryHandler for Forward {
        fn peer_discovered(&self, peer: DiscoveredPeer) {
            let _ = self.0.lock().send(peer);
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_decode_filters_self_and_garbage() {
        let me = PeerId::from_u128(1);
        let other = PeerId::from_u128(2);
        let source: IpAddr = "10.0.0.7".parse().unwrap();

        let packet = |id: PeerId| {
            rmp_serde::to_vec_named(&Announcement {
                version: 0,
                uuid: id.to_string(),
            })
            .unwrap()
        };

        assert_eq!(decode_announcement(&packet(me), source, me), None);
        assert_eq!(
            decode_announcement(&packet(other), source, me),
            Some(DiscoveredPeer {
                address: source,
                version: 0,
                peer: other
            })
        );
        assert_eq!(decode_announcement(b"\xc1garbage", source, me), None);

        let bad_id = rmp_serde::to_vec_named(&Announcement {
            version: 0,
            uuid: "not-a-uuid".into(),
        })
        .unwrap();
        assert_eq!(decode_announcement(&bad_id, source, me), None);
    }

    #[test]
    fn test_request_reaches_listener() {
        let a = PeerId::from_u128(0xA);
        let b = PeerId::from_u128(0xB);

        let listening = NetworkDiscovery::bind(a, 3, loopback(), loopback()).unwrap();
        let (tx, rx) = mpsc::channel();
        listening
            .start_listening(Arc::new(Forward(Mutex::new(tx))))
            .unwrap();

        let asking = NetworkDiscovery::bind(b, 3, loopback(), listening.local_addr()).unwrap();
        asking.request().unwrap();

        let found = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(found.peer, b);
        assert_eq!(found.version, 3);
        assert!(found.address.is_loopback());

        // Our own request is not reported back
        let echo = NetworkDiscovery::bind(a, 3, loopback(), listening.local_addr()).unwrap();
        echo.request().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(500)).is_err());

        listening.shutdown();
    }
}
