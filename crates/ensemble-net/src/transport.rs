//! The narrow interface through which the session layer talks to the
//! underlying peer-to-peer transport.
//!
//! Transports deliver [`TransportEvent`]s to a single subscribed
//! [`EventHandler`]. The handler may be invoked from a thread other than the
//! one driving the game tick, so everything it touches must be `Sync`.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::messages::Message;

/// Opaque 64-bit peer identifier, stable for the lifetime of a connection.
/// The default value is [`PeerId::NONE`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PeerId(pub u64);

impl PeerId {
    /// The reserved "no peer" identifier. Never assigned to a real peer.
    pub const NONE: PeerId = PeerId(0);

    /// Returns `true` unless this is [`PeerId::NONE`].
    pub fn is_valid(self) -> bool {
        self != Self::NONE
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{:016x}", self.0)
    }
}

/// Events raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A transport-level session with `PeerId` was established.
    PeerJoined(PeerId),
    /// The transport-level session with `PeerId` ended.
    PeerLeft(PeerId),
    /// A datagram arrived from `PeerId`.
    DataReceived(PeerId, Vec<u8>),
}

/// Callback receiving transport events.
pub type EventHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// A fire-and-forget packet transport.
pub trait Transport: Send + Sync {
    /// Identifier of the local peer on this transport.
    fn local_id(&self) -> PeerId;

    /// Send `bytes` to one peer. Returns `false` if the packet could not be
    /// handed to the transport.
    fn send(&self, peer: PeerId, bytes: &[u8]) -> bool;

    /// Send `bytes` to every connected peer except the local one.
    fn broadcast(&self, bytes: &[u8]);

    /// Install the event handler, replacing any previous one.
    fn subscribe(&self, handler: EventHandler);

    /// Remove the event handler. Events arriving afterwards are dropped.
    fn unsubscribe(&self);

    /// Release the transport session. Further sends fail.
    fn shutdown(&self);
}

/// A message queued for transmission once component locks are released.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Deliver to a single peer.
    To(PeerId, Message),
    /// Deliver to every connected peer.
    Broadcast(Message),
}
