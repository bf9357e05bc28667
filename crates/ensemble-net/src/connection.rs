//! Connection lifecycle and the session handshake.
//!
//! Each peer known to the transport gets a [`ConnectionRecord`] that moves
//! Connecting → Handshaking → Ready, and is removed (Disconnected) on peer
//! leave, an explicit Disconnect packet, or liveness timeout. The registry
//! never performs I/O itself: replies are pushed onto an [`Outbound`] queue
//! that the caller flushes after the registry lock is released.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use ensemble_config::ConnectionConfig;

use crate::messages::{HandshakeRequest, Message};
use crate::transport::{Outbound, PeerId};

/// Which side of the session a peer plays. Fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The single authoritative peer.
    Host,
    /// Any other peer.
    Client,
}

/// Lifecycle state of a connection record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport session exists, no handshake traffic yet.
    Connecting,
    /// Handshake in flight.
    Handshaking,
    /// Handshake complete; usable for replication.
    Ready,
    /// Terminal. Records in this state are removed immediately.
    Disconnected,
}

/// Why a connection record was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The transport reported the peer left.
    PeerLeft,
    /// The peer sent an explicit Disconnect.
    Disconnected,
    /// No packet arrived within the liveness timeout.
    TimedOut,
}

/// Notable transitions reported to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The peer completed the handshake.
    Ready(PeerId),
    /// The peer's record was removed.
    Dropped(PeerId, DropReason),
}

/// Per-peer connection state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    /// The remote peer.
    pub peer_id: PeerId,
    /// Role of the remote peer.
    pub role: Role,
    /// Lifecycle state.
    pub state: ConnectionState,
    /// Whether the transport reported the peer as joined.
    pub connected: bool,
    /// Set once both handshake directions have been observed on this side.
    pub handshake_complete: bool,
    /// A HandshakeRequest was sent (client) or received (host).
    pub request_observed: bool,
    /// A HandshakeResponse was received (client) or dispatched (host).
    pub response_observed: bool,
    /// Last time any packet arrived from this peer.
    pub last_activity: Instant,
    /// When the record was created.
    pub connection_start: Instant,
    /// Last time this side sent a HandshakeRequest to the peer.
    pub last_request_sent: Option<Instant>,
}

impl ConnectionRecord {
    fn new(peer_id: PeerId, role: Role, connected: bool, now: Instant) -> Self {
        Self {
            peer_id,
            role,
            state: ConnectionState::Connecting,
            connected,
            handshake_complete: false,
            request_observed: false,
            response_observed: false,
            last_activity: now,
            connection_start: now,
            last_request_sent: None,
        }
    }
}

#[derive(Debug)]
struct RegistryInner {
    local_id: PeerId,
    role: Option<Role>,
    host: Option<PeerId>,
    records: HashMap<PeerId, ConnectionRecord>,
    last_sweep: Option<Instant>,
}

impl RegistryInner {
    fn remote_role(&self, peer: PeerId) -> Role {
        if self.host == Some(peer) {
            Role::Host
        } else {
            Role::Client
        }
    }

    fn record_entry(&mut self, peer: PeerId, connected: bool, now: Instant) -> &mut ConnectionRecord {
        let role = self.remote_role(peer);
        self.records
            .entry(peer)
            .or_insert_with(|| ConnectionRecord::new(peer, role, connected, now))
    }

    fn send_request(&mut self, peer: PeerId, now: Instant, out: &mut Vec<Outbound>) {
        let local_id = self.local_id;
        let record = self.record_entry(peer, false, now);
        if record.state == ConnectionState::Ready {
            return;
        }
        record.state = ConnectionState::Handshaking;
        record.request_observed = true;
        record.last_request_sent = Some(now);
        out.push(Outbound::To(
            peer,
            Message::HandshakeRequest(HandshakeRequest { peer_id: local_id }),
        ));
        tracing::debug!(%peer, "sent HandshakeRequest");
    }
}

/// Tracks every peer's [`ConnectionRecord`] and drives the handshake.
pub struct ConnectionRegistry {
    config: ConnectionConfig,
    inner: Mutex<RegistryInner>,
}

impl ConnectionRegistry {
    /// Create an idle registry. Call [`ConnectionRegistry::begin`] before use.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(RegistryInner {
                local_id: PeerId::NONE,
                role: None,
                host: None,
                records: HashMap::new(),
                last_sweep: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a session. `host` is the host's id when joining as a
    /// client, and `None` when this side is the host.
    pub fn begin(&self, local_id: PeerId, role: Role, host: Option<PeerId>) {
        let mut inner = self.lock();
        inner.local_id = local_id;
        inner.role = Some(role);
        inner.host = host;
        inner.records.clear();
        inner.last_sweep = None;
    }

    /// Forget every record and leave the session. Returns the peers that
    /// were known.
    pub fn clear(&self) -> Vec<PeerId> {
        let mut inner = self.lock();
        inner.role = None;
        inner.host = None;
        inner.last_sweep = None;
        inner.records.drain().map(|(peer, _)| peer).collect()
    }

    /// Local role, or `None` outside a session.
    pub fn role(&self) -> Option<Role> {
        self.lock().role
    }

    /// The session host as seen by a client.
    pub fn host_peer(&self) -> Option<PeerId> {
        self.lock().host
    }

    /// Copy of one peer's record.
    pub fn record(&self, peer: PeerId) -> Option<ConnectionRecord> {
        self.lock().records.get(&peer).cloned()
    }

    /// Every peer with a record.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.lock().records.keys().copied().collect()
    }

    /// Peers whose handshake has completed.
    pub fn ready_peers(&self) -> Vec<PeerId> {
        self.lock()
            .records
            .values()
            .filter(|r| r.handshake_complete)
            .map(|r| r.peer_id)
            .collect()
    }

    /// Returns `true` if at least one connection is usable for replication.
    pub fn has_ready_peer(&self) -> bool {
        self.lock().records.values().any(|r| r.handshake_complete)
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Returns `true` when no records are tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Transport reported a new peer. A client starts the handshake when the
    /// joined peer is its host.
    pub fn on_peer_join(&self, peer: PeerId, now: Instant, out: &mut Vec<Outbound>) {
        let mut inner = self.lock();
        let Some(role) = inner.role else {
            tracing::debug!(%peer, "peer joined outside a session, ignoring");
            return;
        };
        let record = inner.record_entry(peer, true, now);
        record.connected = true;
        record.last_activity = now;
        let fresh = record.state == ConnectionState::Connecting;

        if role == Role::Client && inner.host == Some(peer) && fresh {
            inner.send_request(peer, now, out);
        }
        tracing::info!(%peer, "peer joined");
    }

    /// Client-side: (re)send the HandshakeRequest to the host without waiting
    /// for a transport join event.
    pub fn request_handshake(&self, now: Instant, out: &mut Vec<Outbound>) {
        let mut inner = self.lock();
        if inner.role != Some(Role::Client) {
            return;
        }
        if let Some(host) = inner.host {
            inner.send_request(host, now, out);
        }
    }

    /// Transport reported the peer left.
    pub fn on_peer_leave(&self, peer: PeerId) -> Option<RegistryEvent> {
        let removed = self.lock().records.remove(&peer);
        removed.map(|_| {
            tracing::info!(%peer, "peer left");
            RegistryEvent::Dropped(peer, DropReason::PeerLeft)
        })
    }

    /// Process one decoded packet from `peer`. Every packet refreshes the
    /// peer's liveness; handshake packets also advance the state machine.
    pub fn on_message(
        &self,
        peer: PeerId,
        msg: &Message,
        now: Instant,
        out: &mut Vec<Outbound>,
    ) -> Option<RegistryEvent> {
        let mut inner = self.lock();
        let role = inner.role?;
        let host = inner.host;

        if matches!(msg, Message::Disconnect) {
            inner.records.remove(&peer);
            tracing::info!(%peer, "peer disconnected");
            return Some(RegistryEvent::Dropped(peer, DropReason::Disconnected));
        }

        let record = inner.record_entry(peer, true, now);
        record.last_activity = now;

        match msg {
            Message::HandshakeRequest(req) => {
                if role != Role::Host {
                    tracing::warn!(%peer, "HandshakeRequest received but this side is not the host");
                    return None;
                }
                if req.peer_id != peer {
                    tracing::warn!(%peer, claimed = %req.peer_id, "HandshakeRequest id mismatch, ignoring");
                    return None;
                }
                record.request_observed = true;
                record.response_observed = true;
                out.push(Outbound::To(peer, Message::HandshakeResponse));
                if record.handshake_complete {
                    tracing::debug!(%peer, "duplicate HandshakeRequest, response re-sent");
                    return None;
                }
                record.handshake_complete = true;
                record.state = ConnectionState::Ready;
                tracing::info!(%peer, "handshake complete (host)");
                Some(RegistryEvent::Ready(peer))
            }
            Message::HandshakeResponse => {
                if role != Role::Client || host != Some(peer) {
                    tracing::warn!(%peer, "unexpected HandshakeResponse, ignoring");
                    return None;
                }
                if record.state == ConnectionState::Ready {
                    tracing::warn!(%peer, "HandshakeResponse while already Ready, ignoring");
                    return None;
                }
                if !record.request_observed {
                    tracing::warn!(%peer, "HandshakeResponse without a request, ignoring");
                    return None;
                }
                record.response_observed = true;
                record.handshake_complete = true;
                record.state = ConnectionState::Ready;
                out.push(Outbound::To(peer, Message::HandshakeComplete));
                tracing::info!(%peer, "handshake complete (client)");
                Some(RegistryEvent::Ready(peer))
            }
            Message::HandshakeComplete => {
                if !record.handshake_complete {
                    tracing::debug!(%peer, "premature HandshakeComplete, ignoring");
                }
                None
            }
            _ => None,
        }
    }

    /// Periodic upkeep: liveness sweep (at the configured interval) and
    /// handshake retries for a client still waiting on its host.
    pub fn sweep(&self, now: Instant, out: &mut Vec<Outbound>) -> Vec<RegistryEvent> {
        let mut inner = self.lock();
        let mut events = Vec::new();
        if inner.role.is_none() {
            return events;
        }

        let sweep_due = inner
            .last_sweep
            .is_none_or(|last| now.saturating_duration_since(last) >= self.config.sweep_interval());
        if sweep_due {
            inner.last_sweep = Some(now);
            let timeout = self.config.liveness_timeout();
            let stale: Vec<PeerId> = inner
                .records
                .values()
                .filter(|r| now.saturating_duration_since(r.last_activity) > timeout)
                .map(|r| r.peer_id)
                .collect();
            for peer in stale {
                inner.records.remove(&peer);
                tracing::warn!(%peer, "connection timed out");
                events.push(RegistryEvent::Dropped(peer, DropReason::TimedOut));
            }
        }

        if inner.role == Some(Role::Client)
            && let Some(host) = inner.host
            && let Some(record) = inner.records.get(&host)
            && record.state == ConnectionState::Handshaking
            && record.last_request_sent.is_none_or(|sent| {
                now.saturating_duration_since(sent) >= self.config.handshake_retry()
            })
        {
            tracing::debug!(%host, "retrying handshake");
            inner.send_request(host, now, out);
        }

        events
    }
}
