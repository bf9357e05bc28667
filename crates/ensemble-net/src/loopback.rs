//! In-process transport for tests and the demo.
//!
//! A [`LoopbackNetwork`] owns any number of [`LoopbackTransport`] endpoints.
//! Sends are queued on the receiver's inbox channel and only delivered when
//! [`LoopbackNetwork::pump`] runs, so a test controls exactly when packets
//! arrive. Links can be partitioned to simulate packet loss.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::transport::{EventHandler, PeerId, Transport, TransportEvent};

/// Upper bound on delivery rounds per pump, so handlers that answer every
/// packet cannot spin forever.
const MAX_PUMP_ROUNDS: usize = 64;

struct Endpoint {
    inbox_tx: Sender<TransportEvent>,
    inbox_rx: Receiver<TransportEvent>,
    handler: Option<EventHandler>,
    links: HashSet<PeerId>,
    blocked: HashSet<PeerId>,
    open: bool,
}

impl Endpoint {
    fn new() -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        Self {
            inbox_tx,
            inbox_rx,
            handler: None,
            links: HashSet::new(),
            blocked: HashSet::new(),
            open: true,
        }
    }
}

#[derive(Default)]
struct Hub {
    endpoints: HashMap<PeerId, Endpoint>,
}

impl Hub {
    fn push(&self, to: PeerId, event: TransportEvent) {
        if let Some(endpoint) = self.endpoints.get(&to)
            && endpoint.open
        {
            let _ = endpoint.inbox_tx.send(event);
        }
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A set of in-process endpoints that can reach each other.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl LoopbackNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or reopen) the endpoint for `id`.
    pub fn endpoint(&self, id: PeerId) -> Arc<LoopbackTransport> {
        let mut hub = lock(&self.hub);
        let endpoint = hub.endpoints.entry(id).or_insert_with(Endpoint::new);
        endpoint.open = true;
        Arc::new(LoopbackTransport {
            id,
            hub: Arc::clone(&self.hub),
        })
    }

    /// Establish a link between two endpoints. Both sides see `PeerJoined`.
    pub fn connect(&self, a: PeerId, b: PeerId) {
        let mut hub = lock(&self.hub);
        let both_open = [a, b]
            .iter()
            .all(|id| hub.endpoints.get(id).is_some_and(|e| e.open));
        if !both_open || a == b {
            tracing::warn!(%a, %b, "cannot link loopback endpoints");
            return;
        }
        let newly_linked = hub
            .endpoints
            .get_mut(&a)
            .is_some_and(|e| e.links.insert(b));
        if let Some(e) = hub.endpoints.get_mut(&b) {
            e.links.insert(a);
        }
        if newly_linked {
            hub.push(a, TransportEvent::PeerJoined(b));
            hub.push(b, TransportEvent::PeerJoined(a));
        }
    }

    /// Tear down the link between two endpoints. Both sides see `PeerLeft`.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        let mut hub = lock(&self.hub);
        let was_linked = hub
            .endpoints
            .get_mut(&a)
            .is_some_and(|e| e.links.remove(&b));
        if let Some(e) = hub.endpoints.get_mut(&b) {
            e.links.remove(&a);
        }
        if was_linked {
            hub.push(a, TransportEvent::PeerLeft(b));
            hub.push(b, TransportEvent::PeerLeft(a));
        }
    }

    /// Silently drop all packets between `a` and `b` while `partitioned`.
    pub fn set_partitioned(&self, a: PeerId, b: PeerId, partitioned: bool) {
        let mut hub = lock(&self.hub);
        for (from, to) in [(a, b), (b, a)] {
            if let Some(e) = hub.endpoints.get_mut(&from) {
                if partitioned {
                    e.blocked.insert(to);
                } else {
                    e.blocked.remove(&to);
                }
            }
        }
    }

    /// Number of events waiting in inboxes.
    pub fn pending(&self) -> usize {
        lock(&self.hub)
            .endpoints
            .values()
            .map(|e| e.inbox_rx.len())
            .sum()
    }

    /// Deliver queued events to subscribed handlers until the network goes
    /// quiet. Returns the number of events handed to a handler.
    pub fn pump(&self) -> usize {
        let mut delivered = 0;
        for _ in 0..MAX_PUMP_ROUNDS {
            let mut batches: Vec<(Option<EventHandler>, Vec<TransportEvent>)> = Vec::new();
            {
                let hub = lock(&self.hub);
                for endpoint in hub.endpoints.values() {
                    let events: Vec<TransportEvent> = endpoint.inbox_rx.try_iter().collect();
                    if !events.is_empty() {
                        batches.push((endpoint.handler.clone(), events));
                    }
                }
            }
            if batches.is_empty() {
                break;
            }
            // Handlers run with the hub unlocked; they may send.
            for (handler, events) in batches {
                let Some(handler) = handler else { continue };
                for event in events {
                    handler(event);
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// One endpoint of a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    id: PeerId,
    hub: Arc<Mutex<Hub>>,
}

impl Transport for LoopbackTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn send(&self, peer: PeerId, bytes: &[u8]) -> bool {
        let hub = lock(&self.hub);
        let Some(me) = hub.endpoints.get(&self.id) else {
            return false;
        };
        if !me.open || !me.links.contains(&peer) {
            return false;
        }
        if me.blocked.contains(&peer) {
            tracing::trace!(from = %self.id, to = %peer, "loopback packet dropped");
            return true;
        }
        hub.push(peer, TransportEvent::DataReceived(self.id, bytes.to_vec()));
        true
    }

    fn broadcast(&self, bytes: &[u8]) {
        let peers: Vec<PeerId> = {
            let hub = lock(&self.hub);
            hub.endpoints
                .get(&self.id)
                .map(|e| e.links.iter().copied().collect())
                .unwrap_or_default()
        };
        for peer in peers {
            self.send(peer, bytes);
        }
    }

    fn subscribe(&self, handler: EventHandler) {
        if let Some(e) = lock(&self.hub).endpoints.get_mut(&self.id) {
            e.handler = Some(handler);
        }
    }

    fn unsubscribe(&self) {
        if let Some(e) = lock(&self.hub).endpoints.get_mut(&self.id) {
            e.handler = None;
        }
    }

    fn shutdown(&self) {
        let mut hub = lock(&self.hub);
        let links: Vec<PeerId> = match hub.endpoints.get_mut(&self.id) {
            Some(e) => {
                e.open = false;
                e.handler = None;
                e.inbox_rx.try_iter().for_each(drop);
                e.links.drain().collect()
            }
            None => return,
        };
        for peer in links {
            if let Some(e) = hub.endpoints.get_mut(&peer) {
                e.links.remove(&self.id);
            }
            hub.push(peer, TransportEvent::PeerLeft(self.id));
        }
        tracing::debug!(id = %self.id, "loopback endpoint shut down");
    }
}
