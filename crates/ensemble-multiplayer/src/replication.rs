//! Player-state replication between peers.
//!
//! The send side compares the local player against "last sent" shadows and
//! broadcasts a full [`PositionUpdate`] only when something moved past a
//! threshold or the heartbeat interval ran out. The receive side keeps one
//! [`RemotePlayerSnapshot`] per peer, interpolates its rendered position
//! toward the latest ground truth every tick, hides it while it is on another
//! map, and evicts it when updates stop arriving.
//!
//! The snapshot table and the renderable table share one lock. Presentation
//! callbacks are queued in [`Effects`] and run after the lock is released.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use ensemble_config::ReplicationConfig;
use ensemble_net::{AnimationState, CharacterInfo, Message, Outbound, PeerId, PositionUpdate};
use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::animation::derive_animation;
use crate::host::{CharacterIdentity, LocalPlayerState};
use crate::presentation::{Effects, PresentationEvent};

// ---------------------------------------------------------------------------
// RemotePlayerSnapshot
// ---------------------------------------------------------------------------

/// Most recently known state of a remote player.
///
/// `target_position` is the latest ground truth; `position` is the rendered
/// value, blended toward the target every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePlayerSnapshot {
    /// Owning peer.
    pub peer_id: PeerId,
    /// Interpolated position.
    pub position: Vec2,
    /// Velocity in world units per second.
    pub velocity: Vec2,
    /// Facing in degrees.
    pub rotation: f32,
    /// Standing on ground.
    pub grounded: bool,
    /// Mid dodge-roll.
    pub dodge_rolling: bool,
    /// Map the player is on.
    pub map_name: String,
    /// Character identifier, `-1` when unknown.
    pub character_id: i32,
    /// Character display name.
    pub character_name: String,
    /// Sender-derived animation state.
    pub anim_state: AnimationState,
    /// Normalized movement direction.
    pub movement_dir: Vec2,
    /// Clip the sender is playing.
    pub clip_name: String,
    /// Latest received position.
    pub target_position: Vec2,
    /// Blend rate per second.
    pub interpolation_rate: f32,
    /// When the last update arrived.
    #[serde(skip, default = "Instant::now")]
    pub last_update_time: Instant,
    /// Restored from the persisted table and not yet refreshed by the network.
    pub restored: bool,
}

impl RemotePlayerSnapshot {
    fn from_update(peer_id: PeerId, update: &PositionUpdate, now: Instant, rate: f32) -> Self {
        let character = update
            .character
            .clone()
            .map(CharacterIdentity::from)
            .unwrap_or_default();
        Self {
            peer_id,
            position: update.position,
            velocity: update.velocity,
            rotation: update.rotation,
            grounded: update.grounded,
            dodge_rolling: update.dodge_rolling,
            map_name: update.map_name.clone(),
            character_id: character.id,
            character_name: character.name,
            anim_state: update.anim_state,
            movement_dir: update.movement_dir,
            clip_name: update.clip_name.clone(),
            target_position: update.position,
            interpolation_rate: rate,
            last_update_time: now,
            restored: false,
        }
    }

    fn apply(&mut self, update: &PositionUpdate, now: Instant) {
        self.target_position = update.position;
        self.velocity = update.velocity;
        self.rotation = update.rotation;
        self.grounded = update.grounded;
        self.dodge_rolling = update.dodge_rolling;
        self.map_name.clone_from(&update.map_name);
        self.anim_state = update.anim_state;
        self.movement_dir = update.movement_dir;
        self.clip_name.clone_from(&update.clip_name);
        // Absent character means "unchanged".
        if let Some(info) = &update.character {
            self.character_id = info.character_id;
            self.character_name.clone_from(&info.character_name);
        }
        self.last_update_time = now;
        self.restored = false;
    }

    /// Fill identity gaps from a persisted copy. Positional data stays.
    fn fill_identity_from(&mut self, persisted: &RemotePlayerSnapshot) {
        if self.character_id == CharacterIdentity::NONE_ID {
            self.character_id = persisted.character_id;
            self.character_name.clone_from(&persisted.character_name);
        }
        if self.map_name.is_empty() {
            self.map_name.clone_from(&persisted.map_name);
        }
    }

    /// Character identity carried by this snapshot.
    pub fn character(&self) -> CharacterIdentity {
        CharacterIdentity::new(self.character_id, self.character_name.clone())
    }

    /// Blend toward the target. Returns `true` if the rendered position moved.
    fn interpolate(&mut self, dt: f32, threshold: f32, base_rate: f32) -> bool {
        if self.position == self.target_position {
            return false;
        }
        let before = self.position;
        let t = (dt * self.interpolation_rate).clamp(0.0, 1.0);
        self.position = before.lerp(self.target_position, t);
        if self.interpolation_rate > base_rate
            && self.position.distance(self.target_position) <= threshold
        {
            self.interpolation_rate = base_rate;
        }
        self.position != before
    }
}

/// Local inputs to the send path, read from the host engine before locking.
#[derive(Debug, Clone, Default)]
pub struct LocalFrame {
    /// Local player, `None` while it does not exist.
    pub player: Option<LocalPlayerState>,
    /// Current local map.
    pub map_name: String,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct SentShadow {
    position: Vec2,
    rotation: f32,
    grounded: bool,
    dodge_rolling: bool,
    map_name: String,
    at: Instant,
}

#[derive(Debug, Default)]
struct LocalOutbound {
    last_sent: Option<SentShadow>,
    current_character: Option<CharacterIdentity>,
    last_character_sent: Option<CharacterIdentity>,
    resend_character: bool,
    force_send: bool,
    last_character_check: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Renderable {
    visible: bool,
}

#[derive(Debug, Default)]
struct ReplicationInner {
    active: bool,
    local_id: PeerId,
    snapshots: HashMap<PeerId, RemotePlayerSnapshot>,
    renderables: HashMap<PeerId, Renderable>,
    local_map: String,
    suspended: bool,
    outbound: LocalOutbound,
}

impl ReplicationInner {
    /// An unknown local map shows everything.
    fn is_visible(&self, snapshot: &RemotePlayerSnapshot) -> bool {
        self.local_map.is_empty() || snapshot.map_name == self.local_map
    }

    fn create_renderable(&mut self, peer: PeerId, effects: &mut Effects) {
        let Some(snapshot) = self.snapshots.get(&peer) else {
            return;
        };
        let visible = self.is_visible(snapshot);
        self.renderables.insert(peer, Renderable { visible });
        effects
            .events
            .push(PresentationEvent::SnapshotCreated(snapshot.clone()));
        if !visible {
            effects
                .events
                .push(PresentationEvent::VisibilityChanged(peer, false));
        }
    }

    fn remove(&mut self, peer: PeerId, effects: &mut Effects) -> bool {
        let had_snapshot = self.snapshots.remove(&peer).is_some();
        if self.renderables.remove(&peer).is_some() {
            effects.events.push(PresentationEvent::SnapshotRemoved(peer));
        }
        had_snapshot
    }
}

fn angle_difference(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    d.min(360.0 - d)
}

// ---------------------------------------------------------------------------
// ReplicationEngine
// ---------------------------------------------------------------------------

/// Send gating, snapshot table, interpolation and eviction.
pub struct ReplicationEngine {
    config: ReplicationConfig,
    inner: Mutex<ReplicationInner>,
}

impl ReplicationEngine {
    /// Create an engine with the given tuning.
    pub fn new(config: ReplicationConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(ReplicationInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReplicationInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset for a new session.
    pub fn begin(&self, local_id: PeerId) {
        let mut inner = self.lock();
        *inner = ReplicationInner {
            active: true,
            local_id,
            ..Default::default()
        };
    }

    /// Drop every snapshot, emitting a removal for each renderable. Updates
    /// are ignored until the next [`ReplicationEngine::begin`].
    pub fn clear(&self, effects: &mut Effects) {
        let mut inner = self.lock();
        let peers: Vec<PeerId> = inner.snapshots.keys().copied().collect();
        for peer in peers {
            inner.remove(peer, effects);
        }
        *inner = ReplicationInner::default();
    }

    /// Whether the local character identity should be re-read this tick.
    pub fn character_check_due(&self, now: Instant) -> bool {
        self.lock().outbound.last_character_check.is_none_or(|last| {
            now.saturating_duration_since(last) >= self.config.character_check_interval()
        })
    }

    /// A peer finished its handshake: the next update goes out immediately
    /// and carries the character identity.
    pub fn on_peer_ready(&self) {
        let mut inner = self.lock();
        inner.outbound.resend_character = true;
        inner.outbound.force_send = true;
    }

    /// Run the send path and the receive-side upkeep for one tick.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &self,
        now: Instant,
        dt: Duration,
        frame: &LocalFrame,
        character: Option<CharacterIdentity>,
        has_ready_peer: bool,
        transition_active: bool,
        effects: &mut Effects,
    ) {
        self.tick_send(now, frame, character, has_ready_peer, effects);
        self.tick_remote(now, dt, &frame.map_name, transition_active, effects);
    }

    /// Send path: broadcast an update if the local player changed enough or
    /// the heartbeat interval elapsed. `character` is the freshly read local
    /// identity when a check was due.
    pub fn tick_send(
        &self,
        now: Instant,
        frame: &LocalFrame,
        character: Option<CharacterIdentity>,
        has_ready_peer: bool,
        effects: &mut Effects,
    ) {
        let mut guard = self.lock();
        let out = &mut guard.outbound;

        if let Some(character) = character {
            out.last_character_check = Some(now);
            if out.current_character.as_ref() != Some(&character) {
                if out.current_character.is_some() {
                    tracing::info!(
                        id = character.id,
                        name = %character.name,
                        "local character changed, forcing update"
                    );
                    out.force_send = true;
                }
                out.current_character = Some(character);
            }
        }

        if !has_ready_peer {
            return;
        }
        let Some(player) = frame.player.as_ref() else {
            return;
        };

        let include_character = out.current_character.is_some()
            && (out.resend_character || out.last_character_sent != out.current_character);

        let due = match &out.last_sent {
            None => true,
            Some(last) => {
                out.force_send
                    || include_character
                    || player.position.distance(last.position) > self.config.position_threshold
                    || angle_difference(player.rotation, last.rotation)
                        > self.config.rotation_threshold_deg
                    || player.grounded != last.grounded
                    || player.dodge_rolling != last.dodge_rolling
                    || frame.map_name != last.map_name
                    || now.saturating_duration_since(last.at) >= self.config.max_send_interval()
            }
        };
        if !due {
            return;
        }

        let animation = derive_animation(player);
        let update = PositionUpdate {
            position: player.position,
            velocity: player.velocity,
            rotation: player.rotation,
            grounded: player.grounded,
            dodge_rolling: player.dodge_rolling,
            map_name: frame.map_name.clone(),
            anim_state: animation.state,
            movement_dir: animation.movement_dir,
            clip_name: animation.clip_name,
            character: include_character
                .then(|| out.current_character.as_ref().map(CharacterInfo::from))
                .flatten(),
        };
        effects
            .outbound
            .push(Outbound::Broadcast(Message::PositionUpdate(update)));

        out.last_sent = Some(SentShadow {
            position: player.position,
            rotation: player.rotation,
            grounded: player.grounded,
            dodge_rolling: player.dodge_rolling,
            map_name: frame.map_name.clone(),
            at: now,
        });
        if include_character {
            out.last_character_sent.clone_from(&out.current_character);
            out.resend_character = false;
        }
        out.force_send = false;
    }

    /// Receive-side upkeep: evict stale snapshots, interpolate, and keep the
    /// renderable table (existence and per-map visibility) in step.
    pub fn tick_remote(
        &self,
        now: Instant,
        dt: Duration,
        local_map: &str,
        transition_active: bool,
        effects: &mut Effects,
    ) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if inner.local_map != local_map {
            inner.local_map = local_map.to_string();
        }

        let standard = self.config.snapshot_timeout();
        let persistent = self.config.persistent_snapshot_timeout();
        let expired: Vec<PeerId> = inner
            .snapshots
            .values()
            .filter(|s| {
                let timeout = if s.restored || transition_active {
                    persistent
                } else {
                    standard
                };
                now.saturating_duration_since(s.last_update_time) > timeout
            })
            .map(|s| s.peer_id)
            .collect();
        for peer in expired {
            inner.remove(peer, effects);
            tracing::info!(%peer, "remote snapshot timed out");
        }

        if inner.suspended {
            return;
        }

        let dt = dt.as_secs_f32();
        let peers: Vec<PeerId> = inner.snapshots.keys().copied().collect();
        for peer in peers {
            if !inner.renderables.contains_key(&peer) {
                inner.create_renderable(peer, effects);
                continue;
            }
            let Some(snapshot) = inner.snapshots.get_mut(&peer) else {
                continue;
            };
            let moved = snapshot.interpolate(
                dt,
                self.config.position_threshold,
                self.config.interpolation_rate,
            );
            if moved {
                effects
                    .events
                    .push(PresentationEvent::SnapshotUpdated(snapshot.clone()));
            }
            let Some(snapshot) = inner.snapshots.get(&peer) else {
                continue;
            };
            let visible = inner.is_visible(snapshot);
            if let Some(renderable) = inner.renderables.get_mut(&peer)
                && renderable.visible != visible
            {
                renderable.visible = visible;
                effects
                    .events
                    .push(PresentationEvent::VisibilityChanged(peer, visible));
            }
        }
    }

    /// Apply a received update. Returns `true` if this created the peer's
    /// snapshot.
    pub fn apply_update(
        &self,
        peer: PeerId,
        update: &PositionUpdate,
        now: Instant,
        effects: &mut Effects,
    ) -> bool {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.active {
            tracing::debug!(%peer, "position update outside a session ignored");
            return false;
        }
        if !peer.is_valid() || peer == inner.local_id {
            tracing::warn!(%peer, "position update from invalid sender ignored");
            return false;
        }

        if let Some(snapshot) = inner.snapshots.get_mut(&peer) {
            snapshot.apply(update, now);
            if !inner.suspended && inner.renderables.contains_key(&peer) {
                effects
                    .events
                    .push(PresentationEvent::SnapshotUpdated(snapshot.clone()));
            }
            return false;
        }

        let snapshot = RemotePlayerSnapshot::from_update(
            peer,
            update,
            now,
            self.config.initial_interpolation_rate,
        );
        tracing::debug!(%peer, map = %snapshot.map_name, "remote snapshot created");
        inner.snapshots.insert(peer, snapshot);
        if !inner.suspended {
            inner.create_renderable(peer, effects);
        }
        true
    }

    /// Drop one peer's snapshot. Returns `true` if it existed.
    pub fn remove_peer(&self, peer: PeerId, effects: &mut Effects) -> bool {
        self.lock().remove(peer, effects)
    }

    /// The local world is being torn down: hand back every snapshot for
    /// persistence, forget all renderables and stop presenting.
    pub fn suspend(&self) -> Vec<RemotePlayerSnapshot> {
        let mut inner = self.lock();
        inner.suspended = true;
        inner.renderables.clear();
        let drained: Vec<RemotePlayerSnapshot> =
            inner.snapshots.drain().map(|(_, s)| s).collect();
        tracing::info!(count = drained.len(), "replication suspended for scene unload");
        drained
    }

    /// The new world exists again; presentation may resume.
    pub fn resume(&self) {
        self.lock().suspended = false;
    }

    /// Push persisted snapshots back into the live table. Live data that
    /// arrived during the transition keeps its positional fields; persisted
    /// identity fills gaps. Each peer's renderable is refreshed or recreated.
    pub fn restore(&self, persisted: Vec<RemotePlayerSnapshot>, effects: &mut Effects) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if !inner.active {
            return;
        }
        let count = persisted.len();
        for saved in persisted {
            let peer = saved.peer_id;
            match inner.snapshots.get_mut(&peer) {
                Some(live) => live.fill_identity_from(&saved),
                None => {
                    let mut snapshot = saved;
                    snapshot.restored = true;
                    inner.snapshots.insert(peer, snapshot);
                }
            }
            if inner.suspended {
                continue;
            }
            if inner.renderables.contains_key(&peer) {
                if let Some(snapshot) = inner.snapshots.get(&peer) {
                    effects
                        .events
                        .push(PresentationEvent::SnapshotUpdated(snapshot.clone()));
                }
            } else {
                inner.create_renderable(peer, effects);
            }
        }
        tracing::info!(count, "remote snapshots restored");
    }

    /// Copy of one peer's snapshot.
    pub fn snapshot(&self, peer: PeerId) -> Option<RemotePlayerSnapshot> {
        self.lock().snapshots.get(&peer).cloned()
    }

    /// Copy of the whole snapshot table.
    pub fn snapshots(&self) -> Vec<RemotePlayerSnapshot> {
        self.lock().snapshots.values().cloned().collect()
    }

    /// Whether `peer` currently has a renderable, and if so whether it is
    /// shown.
    pub fn renderable_visible(&self, peer: PeerId) -> Option<bool> {
        self.lock().renderables.get(&peer).map(|r| r.visible)
    }

    /// Number of live snapshots.
    pub fn len(&self) -> usize {
        self.lock().snapshots.len()
    }

    /// Returns `true` when no snapshots are held.
    pub fn is_empty(&self) -> bool {
        self.lock().snapshots.is_empty()
    }

    /// Whether presentation is suspended for a scene transition.
    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }
}

#[cfg(test)]
#[path = "replication_tests.rs"]
mod tests;
