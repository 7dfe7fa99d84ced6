//! Event bus boundary
//!
//! The engine publishes lifecycle events (index changes, peer sessions,
//! transfers) through an [`EventBus`]. Handlers run synchronously on the
//! publishing thread, which is usually a socket receive loop, so they must
//! not block; anything slow has to be handed off to a queue.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::identity::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Local file pushed to the peer
    Outbound,
    /// Peer's file pulled into the local directory
    Inbound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    IndexChanged {
        paths: BTreeSet<String>,
    },
    PeerDiscovered {
        address: IpAddr,
        version: u32,
        peer: PeerId,
    },
    PeerConnected {
        peer: PeerId,
        address: SocketAddr,
    },
    PeerDisconnected {
        peer: PeerId,
    },
    TransferStarted {
        file: String,
        peer: PeerId,
        direction: TransferDirection,
    },
    TransferCompleted {
        file: String,
        peer: PeerId,
        direction: TransferDirection,
    },
    TransferFailed {
        file: String,
        peer: PeerId,
        direction: TransferDirection,
        reason: String,
    },
    TransferCancelled {
        file: String,
        peer: PeerId,
        direction: TransferDirection,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    IndexChanged,
    PeerDiscovered,
    PeerConnected,
    PeerDisconnected,
    TransferStarted,
    TransferCompleted,
    TransferFailed,
    TransferCancelled,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::IndexChanged { .. } => EventKind::IndexChanged,
            Event::PeerDiscovered { .. } => EventKind::PeerDiscovered,
            Event::PeerConnected { .. } => EventKind::PeerConnected,
            Event::PeerDisconnected { .. } => EventKind::PeerDisconnected,
            Event::TransferStarted { .. } => EventKind::TransferStarted,
            Event::TransferCompleted { .. } => EventKind::TransferCompleted,
            Event::TransferFailed { .. } => EventKind::TransferFailed,
            Event::TransferCancelled { .. } => EventKind::TransferCancelled,
        }
    }
}

/// Whether lower-priority handlers still see the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event) -> Flow;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    priority: i32,
    handler: Arc<dyn EventHandler>,
}

/// Registry of (handler, priority) pairs per event kind
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Higher priority handlers run first; equal priorities run in
    /// subscription order
    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: Arc<dyn EventHandler>,
        priority: i32,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subs = self.subscriptions.lock();
        let pos = subs
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(subs.len());
        subs.insert(
            pos,
            Subscription {
                id,
                kind,
                priority,
                handler,
            },
        );
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.lock();
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        // Handlers may subscribe/unsubscribe, so never call them under the lock
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in handlers {
            if handler.handle(&event) == Flow::Stop {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        name: &'static str,
        flow: Flow,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    impl EventHandler for Recorder {
        fn handle(&self, _event: &Event) -> Flow {
            self.seen.lock().push(self.name);
            self.flow
        }
    }

    fn recorder(
        name: &'static str,
        flow: Flow,
        seen: &Arc<Mutex<Vec<&'static str>>>,
    ) -> Arc<dyn EventHandler> {
        Arc::new(Recorder {
            name,
            flow,
            seen: Arc::clone(seen),
        })
    }

    fn changed() -> Event {
        Event::IndexChanged {
            paths: BTreeSet::from(["a".to_string()]),
        }
    }

    #[test]
    fn test_priority_order_and_stop() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe(EventKind::IndexChanged, recorder("low", Flow::Continue, &seen), 0);
        bus.subscribe(EventKind::IndexChanged, recorder("high", Flow::Continue, &seen), 10);
        bus.subscribe(EventKind::IndexChanged, recorder("mid", Flow::Stop, &seen), 5);

        bus.publish(changed());
        assert_eq!(*seen.lock(), vec!["high", "mid"]);
    }

    #[test]
    fn test_kind_filter_and_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let id = bus.subscribe(EventKind::IndexChanged, recorder("a", Flow::Continue, &seen), 0);
        bus.subscribe(
            EventKind::PeerDisconnected,
            recorder("b", Flow::Continue, &seen),
            0,
        );

        bus.publish(changed());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(changed());

        assert_eq!(*seen.lock(), vec!["a"]);
    }
}
