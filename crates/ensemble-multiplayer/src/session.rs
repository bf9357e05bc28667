//! The session orchestrator.
//!
//! [`Session`] owns the connection registry, replication engine, scene
//! coherence controller and authority gate, routes decoded packets between
//! them, and drives them from a single tick. Components collect their side
//! effects in an [`Effects`] batch; the session flushes it (encode + send,
//! presentation callbacks, scene loads) with no component lock held.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use ensemble_config::Config;
use ensemble_net::{
    ConnectionRecord, ConnectionRegistry, MapSync, Message, NetworkCounters, NetworkStats,
    Outbound, PacketCodec, PeerId, PerKindCounters, ProjectileId, RegistryEvent, Role,
    ShootRequest, Transport, TransportEvent,
};
use glam::Vec2;

use crate::authority::{AuthorityGate, WeaponSpec};
use crate::clock::{Clock, SystemClock};
use crate::host::HostEngine;
use crate::presentation::{Effects, Presentation};
use crate::replication::{LocalFrame, RemotePlayerSnapshot, ReplicationEngine};
use crate::scene::{SceneCoherence, SceneTransitionState};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a session could not be started or joined. Nothing is mutated when one
/// of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// A session is already running.
    #[error("a session is already active")]
    AlreadyActive,
    /// The game is not in a safe location.
    #[error("sessions can only be started or joined from a safe location (current map: {map})")]
    UnsafeLocation {
        /// Map the game is currently on.
        map: String,
    },
    /// The host id is the reserved zero id.
    #[error("invalid host peer id: {0}")]
    InvalidPeer(PeerId),
    /// The host id is the local peer.
    #[error("cannot join a session hosted by the local peer ({0})")]
    SelfJoin(PeerId),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles a [`Session`].
pub struct SessionBuilder {
    config: Config,
    transport: Arc<dyn Transport>,
    host: Arc<dyn HostEngine>,
    presentation: Arc<dyn Presentation>,
    clock: Arc<dyn Clock>,
    weapons: Vec<(u32, WeaponSpec)>,
}

impl SessionBuilder {
    /// Use `clock` instead of wall-clock time.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a weapon's ballistics.
    pub fn weapon(mut self, weapon_id: u32, spec: WeaponSpec) -> Self {
        self.weapons.push((weapon_id, spec));
        self
    }

    /// Build the session. It starts inactive.
    pub fn build(self) -> Arc<Session> {
        let authority = self
            .weapons
            .into_iter()
            .fold(AuthorityGate::new(self.config.authority.clone()), |gate, (id, spec)| {
                gate.with_weapon(id, spec)
            });
        Arc::new(Session {
            codec: PacketCodec::from_config(&self.config.network),
            registry: ConnectionRegistry::new(self.config.connection.clone()),
            replication: ReplicationEngine::new(self.config.replication.clone()),
            scene: SceneCoherence::new(self.config.scene.clone()),
            authority,
            counters: NetworkCounters::new(),
            per_kind: PerKindCounters::new(),
            stats: Mutex::new(NetworkStats::new(self.config.network.bandwidth_warning_bytes)),
            state: Mutex::new(SessionState::default()),
            transport: self.transport,
            host: self.host,
            presentation: self.presentation,
            clock: self.clock,
            config: self.config,
        })
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    role: Option<Role>,
    host_peer: Option<PeerId>,
    last_tick: Option<Instant>,
    last_stats_roll: Option<Instant>,
}

/// One multiplayer session, hosted or joined.
pub struct Session {
    config: Config,
    transport: Arc<dyn Transport>,
    host: Arc<dyn HostEngine>,
    presentation: Arc<dyn Presentation>,
    clock: Arc<dyn Clock>,
    codec: PacketCodec,
    registry: ConnectionRegistry,
    replication: ReplicationEngine,
    scene: SceneCoherence,
    authority: AuthorityGate,
    counters: NetworkCounters,
    per_kind: PerKindCounters,
    stats: Mutex<NetworkStats>,
    state: Mutex<SessionState>,
}

impl Session {
    /// Start building a session over `transport`.
    pub fn builder(
        config: Config,
        transport: Arc<dyn Transport>,
        host: Arc<dyn HostEngine>,
        presentation: Arc<dyn Presentation>,
    ) -> SessionBuilder {
        SessionBuilder {
            config,
            transport,
            host,
            presentation,
            clock: Arc::new(SystemClock),
            weapons: Vec::new(),
        }
    }

    /// Create an inactive session with wall-clock time and no weapon catalog.
    pub fn new(
        config: Config,
        transport: Arc<dyn Transport>,
        host: Arc<dyn HostEngine>,
        presentation: Arc<dyn Presentation>,
    ) -> Arc<Self> {
        Self::builder(config, transport, host, presentation).build()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- lifecycle ----------------------------------------------------------

    fn check_can_begin(&self) -> Result<(), SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        if !self.host.current_safe_location() {
            return Err(SessionError::UnsafeLocation {
                map: self.host.current_map_name(),
            });
        }
        Ok(())
    }

    fn activate(self: &Arc<Self>, role: Role, host_peer: Option<PeerId>) {
        let local = self.transport.local_id();
        self.registry.begin(local, role, host_peer);
        self.replication.begin(local);
        self.authority.begin(role == Role::Host, local);
        self.scene.clear();
        {
            let mut state = self.state();
            *state = SessionState {
                active: true,
                role: Some(role),
                host_peer,
                ..Default::default()
            };
        }

        let weak: Weak<Session> = Arc::downgrade(self);
        self.transport.subscribe(Arc::new(move |event| {
            if let Some(session) = weak.upgrade() {
                session.handle_event(event);
            }
        }));
    }

    /// Host a new session.
    pub fn start_session(self: &Arc<Self>) -> Result<(), SessionError> {
        self.check_can_begin()?;
        self.activate(Role::Host, None);
        tracing::info!(local = %self.transport.local_id(), "session started as host");
        Ok(())
    }

    /// Join the session hosted by `host_peer`.
    pub fn join_session(self: &Arc<Self>, host_peer: PeerId) -> Result<(), SessionError> {
        if self.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        if !host_peer.is_valid() {
            return Err(SessionError::InvalidPeer(host_peer));
        }
        if host_peer == self.transport.local_id() {
            return Err(SessionError::SelfJoin(host_peer));
        }
        self.check_can_begin()?;

        self.activate(Role::Client, Some(host_peer));
        let mut effects = Effects::new();
        self.registry
            .request_handshake(self.clock.now(), &mut effects.outbound);
        self.flush(effects);
        tracing::info!(local = %self.transport.local_id(), host = %host_peer, "joining session");
        Ok(())
    }

    /// Leave the session. Safe to call at any time; a no-op when inactive.
    pub fn stop_session(&self) {
        if !self.deactivate() {
            tracing::debug!("stop_session called without an active session");
            return;
        }
        self.teardown();
    }

    fn deactivate(&self) -> bool {
        std::mem::replace(&mut self.state().active, false)
    }

    /// Best-effort teardown: every step runs even if an earlier one failed.
    fn teardown(&self) {
        let peers = self.registry.known_peers();
        match self.codec.encode(&Message::Disconnect) {
            Ok(bytes) => {
                for peer in peers {
                    if self.transport.send(peer, &bytes) {
                        self.counters.record_send(bytes.len() as u64);
                    } else {
                        self.counters.record_send_failure();
                        tracing::warn!(%peer, "failed to send Disconnect");
                    }
                }
            }
            Err(e) => tracing::error!("failed to encode Disconnect: {e}"),
        }

        self.transport.unsubscribe();

        let mut effects = Effects::new();
        self.registry.clear();
        self.replication.clear(&mut effects);
        self.authority.clear();
        self.scene.clear();
        for event in &effects.events {
            event.dispatch(self.presentation.as_ref());
        }

        self.transport.shutdown();

        *self.state() = SessionState::default();
        tracing::info!("session stopped");
    }

    fn lose_host(&self) {
        if self.deactivate() {
            tracing::warn!("connection to session host lost, leaving session");
            self.teardown();
        }
    }

    // -- transport events ---------------------------------------------------

    fn handle_event(&self, event: TransportEvent) {
        if !self.is_active() {
            return;
        }
        let now = self.clock.now();
        let mut effects = Effects::new();
        let host_lost = match event {
            TransportEvent::PeerJoined(peer) => {
                self.registry.on_peer_join(peer, now, &mut effects.outbound);
                false
            }
            TransportEvent::PeerLeft(peer) => self
                .registry
                .on_peer_leave(peer)
                .is_some_and(|event| self.on_registry_event(event, &mut effects)),
            TransportEvent::DataReceived(peer, bytes) => {
                self.on_packet(peer, &bytes, now, &mut effects)
            }
        };
        self.flush(effects);
        if host_lost {
            self.lose_host();
        }
    }

    /// Decode and route one packet. Returns `true` if the host was lost.
    fn on_packet(&self, peer: PeerId, bytes: &[u8], now: Instant, effects: &mut Effects) -> bool {
        let wire_len = bytes.len() as u64;
        self.counters.record_receive(wire_len);
        let message = match self.codec.decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                self.counters.record_decode_failure();
                tracing::warn!(%peer, "dropping malformed packet: {e}");
                return false;
            }
        };
        self.per_kind.record(message.kind(), wire_len);

        let host_lost = self
            .registry
            .on_message(peer, &message, now, &mut effects.outbound)
            .is_some_and(|event| self.on_registry_event(event, effects));
        if message.is_handshake() {
            return host_lost;
        }

        match message {
            Message::PositionUpdate(update) => {
                let created = self.replication.apply_update(peer, &update, now, effects);
                // A host mid-transition has no settled map to announce.
                if created
                    && self.role() == Some(Role::Host)
                    && !self.scene.is_transition_active()
                {
                    let map_name = self.host.current_map_name();
                    effects
                        .outbound
                        .push(Outbound::To(peer, Message::MapSync(MapSync { map_name })));
                }
            }
            Message::MapSync(sync) => {
                let host_peer = self.state().host_peer;
                self.scene.on_map_sync(peer, host_peer, sync.map_name);
            }
            Message::ProjectileSpawn(spawn) => {
                let host_peer = self.state().host_peer;
                self.authority
                    .on_remote_spawn(peer, &spawn, host_peer, now, effects);
            }
            Message::ProjectileDestroy(destroy) => {
                self.authority.on_remote_destroy(destroy.id, effects);
            }
            Message::ShootRequest(request) => {
                self.authority.on_shoot_request(peer, &request, now, effects);
            }
            // Handshake traffic returned above.
            _ => {}
        }
        host_lost
    }

    /// Returns `true` if the event means a client lost its host.
    fn on_registry_event(&self, event: RegistryEvent, effects: &mut Effects) -> bool {
        match event {
            RegistryEvent::Ready(peer) => {
                tracing::info!(%peer, "peer ready");
                self.replication.on_peer_ready();
                false
            }
            RegistryEvent::Dropped(peer, reason) => {
                tracing::info!(%peer, ?reason, "peer dropped");
                self.replication.remove_peer(peer, effects);
                self.scene.forget(peer);
                let state = self.state();
                state.role == Some(Role::Client) && state.host_peer == Some(peer)
            }
        }
    }

    // -- tick ---------------------------------------------------------------

    /// Advance the session using the session clock.
    pub fn tick(&self) {
        self.tick_at(self.clock.now());
    }

    /// Advance the session to `now`.
    pub fn tick_at(&self, now: Instant) {
        let dt = {
            let mut state = self.state();
            if !state.active {
                return;
            }
            let dt = state
                .last_tick
                .map(|last| now.saturating_duration_since(last))
                .unwrap_or(Duration::ZERO);
            state.last_tick = Some(now);
            dt
        };

        let mut effects = Effects::new();
        let mut host_lost = false;
        for event in self.registry.sweep(now, &mut effects.outbound) {
            host_lost |= self.on_registry_event(event, &mut effects);
        }

        let player_ready = self.host.local_player_ready();
        let map_name = self.host.current_map_name();
        let step = self.scene.step(now, player_ready, &map_name);
        if let Some(persisted) = step.restore {
            self.replication.restore(persisted, &mut effects);
        }
        effects.scene_load = step.load_map;

        let frame = LocalFrame {
            player: if player_ready {
                self.host.local_player()
            } else {
                None
            },
            map_name,
        };
        let character = self
            .replication
            .character_check_due(now)
            .then(|| self.host.local_character());
        self.replication.tick(
            now,
            dt,
            &frame,
            character,
            self.registry.has_ready_peer(),
            self.scene.is_transition_active(),
            &mut effects,
        );
        self.authority.tick(now, &mut effects);

        self.maybe_roll_stats(now);
        self.flush(effects);
        if host_lost {
            self.lose_host();
        }
    }

    // -- effects ------------------------------------------------------------

    fn flush(&self, effects: Effects) {
        for outbound in effects.outbound {
            match outbound {
                Outbound::To(peer, message) => self.send_to(peer, &message),
                Outbound::Broadcast(message) => self.broadcast(&message),
            }
        }
        for event in &effects.events {
            event.dispatch(self.presentation.as_ref());
        }
        if let Some(map) = effects.scene_load {
            self.host.request_scene_load(&map);
        }
    }

    fn send_to(&self, peer: PeerId, message: &Message) {
        let bytes = match self.codec.encode(message) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.counters.record_send_failure();
                tracing::warn!(%peer, kind = ?message.kind(), "failed to encode message: {e}");
                return;
            }
        };
        if self.transport.send(peer, &bytes) {
            self.counters.record_send(bytes.len() as u64);
            self.per_kind.record(message.kind(), bytes.len() as u64);
        } else {
            self.counters.record_send_failure();
            tracing::debug!(%peer, kind = ?message.kind(), "transport refused send");
        }
    }

    fn broadcast(&self, message: &Message) {
        match self.codec.encode(message) {
            Ok(bytes) => {
                self.transport.broadcast(&bytes);
                self.counters.record_send(bytes.len() as u64);
                self.per_kind.record(message.kind(), bytes.len() as u64);
            }
            Err(e) => {
                self.counters.record_send_failure();
                tracing::warn!(kind = ?message.kind(), "failed to encode broadcast: {e}");
            }
        }
    }

    fn maybe_roll_stats(&self, now: Instant) {
        let due = {
            let mut state = self.state();
            match state.last_stats_roll {
                None => {
                    state.last_stats_roll = Some(now);
                    false
                }
                Some(last) if now.saturating_duration_since(last) >= self.config.debug.stats_interval() => {
                    state.last_stats_roll = Some(now);
                    true
                }
                Some(_) => false,
            }
        };
        if due {
            let stats = self.roll_network_stats();
            tracing::debug!(
                sent = stats.current.bytes_sent,
                received = stats.current.bytes_received,
                send_failures = stats.current.send_failures,
                decode_failures = stats.current.decode_failures,
                "network stats"
            );
        }
    }

    // -- local simulation hooks ---------------------------------------------

    /// The local player fires. The host mints the projectile directly; a
    /// client sends a ShootRequest and returns `None`.
    pub fn fire(&self, position: Vec2, direction: Vec2, weapon_id: u32) -> Option<ProjectileId> {
        let (active, role, host_peer) = {
            let state = self.state();
            (state.active, state.role, state.host_peer)
        };
        if !active {
            return None;
        }
        let local = self.transport.local_id();
        let mut effects = Effects::new();
        let minted = match (role, host_peer) {
            (Some(Role::Host), _) => self.authority.fire(
                local,
                position,
                direction,
                weapon_id,
                self.clock.now(),
                &mut effects,
            ),
            (Some(Role::Client), Some(host)) => {
                effects.outbound.push(Outbound::To(
                    host,
                    Message::ShootRequest(ShootRequest {
                        player_id: local,
                        position,
                        direction,
                        weapon_id,
                    }),
                ));
                None
            }
            _ => None,
        };
        self.flush(effects);
        minted
    }

    /// The local simulation wants to spawn a projectile. Returns `false` if
    /// it must be destroyed instead.
    pub fn check_local_spawn(&self, id: ProjectileId, is_player_projectile: bool) -> bool {
        let mut effects = Effects::new();
        let allowed = self
            .authority
            .check_local_spawn(id, is_player_projectile, &mut effects);
        self.flush(effects);
        allowed
    }

    /// The local spawn for `id` is confirmed.
    pub fn acknowledge_spawn(&self, id: ProjectileId) {
        self.authority.acknowledge_spawn(id);
    }

    /// A projectile hit something or left the world.
    pub fn destroy_projectile(&self, id: ProjectileId) {
        let mut effects = Effects::new();
        self.authority.destroy(id, &mut effects);
        self.flush(effects);
    }

    /// The host engine is tearing the current scene down.
    pub fn notify_scene_unloading(&self) {
        if !self.is_active() {
            return;
        }
        if self.scene.is_transition_active() {
            tracing::warn!("scene unload while a transition is active, ignoring");
            return;
        }
        let snapshots = self.replication.suspend();
        if !self.scene.begin_unload(snapshots) {
            self.replication.resume();
        }
    }

    /// The host engine finished loading the new scene.
    pub fn notify_scene_loaded(&self) {
        if !self.is_active() {
            return;
        }
        if self.scene.on_scene_loaded(self.clock.now()) {
            self.replication.resume();
        }
    }

    // -- accessors ----------------------------------------------------------

    /// Whether a session is running.
    pub fn is_active(&self) -> bool {
        self.state().active
    }

    /// Local role while active.
    pub fn role(&self) -> Option<Role> {
        self.state().role
    }

    /// Local peer id.
    pub fn local_id(&self) -> PeerId {
        self.transport.local_id()
    }

    /// The session host (for clients).
    pub fn host_peer(&self) -> Option<PeerId> {
        self.state().host_peer
    }

    /// Copy of one connection record.
    pub fn connection(&self, peer: PeerId) -> Option<ConnectionRecord> {
        self.registry.record(peer)
    }

    /// Peers whose handshake has completed.
    pub fn ready_peers(&self) -> Vec<PeerId> {
        self.registry.ready_peers()
    }

    /// Number of connection records.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    /// Copy of one remote snapshot.
    pub fn remote_snapshot(&self, peer: PeerId) -> Option<RemotePlayerSnapshot> {
        self.replication.snapshot(peer)
    }

    /// Copy of the remote snapshot table.
    pub fn remote_snapshots(&self) -> Vec<RemotePlayerSnapshot> {
        self.replication.snapshots()
    }

    /// Current scene transition state.
    pub fn scene_state(&self) -> SceneTransitionState {
        self.scene.state()
    }

    /// Number of snapshots held for a scene transition.
    pub fn persisted_count(&self) -> usize {
        self.scene.persisted_len()
    }

    /// Whether a projectile id is currently authorized locally.
    pub fn is_projectile_authorized(&self, id: ProjectileId) -> bool {
        self.authority.is_authorized(id)
    }

    /// Statistics for the last completed measurement period.
    pub fn network_stats(&self) -> NetworkStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Close the current measurement period now and return its statistics.
    pub fn roll_network_stats(&self) -> NetworkStats {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.roll_period(&self.counters, &self.per_kind);
        stats.clone()
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
