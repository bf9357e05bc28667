//! Host-authoritative projectile spawning.
//!
//! Only the host mints [`ProjectileId`]s. A minted id is placed in the
//! authorization set for a short grace period; any local attempt to spawn a
//! *player* projectile whose id is not authorized is blocked, so peers never
//! simulate the same shot independently. Every accepted id is also recorded
//! as seen and is never accepted again; ids are monotonic, so the record is a
//! high-water mark plus a bounded window of out-of-order ids above it.
//!
//! Visual-only projectiles (not server-authoritative) are extrapolated
//! linearly from their last known state and expire on their own.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use ensemble_config::AuthorityConfig;
use ensemble_net::{
    Message, Outbound, PeerId, ProjectileDestroy, ProjectileId, ProjectileSpawn, ShootRequest,
};
use glam::Vec2;

use crate::presentation::{Effects, PresentationEvent};
use crate::scheduler::{TaskHandle, TaskQueue};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Initial (or extrapolated) state of a projectile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectileState {
    /// Identifier.
    pub id: ProjectileId,
    /// Position.
    pub position: Vec2,
    /// Velocity in world units per second.
    pub velocity: Vec2,
    /// Facing in degrees.
    pub rotation: f32,
    /// Firing peer.
    pub owner: PeerId,
    /// Damage on hit.
    pub damage: f32,
    /// Fired by a player.
    pub is_player_projectile: bool,
    /// Minted by the host.
    pub authoritative: bool,
}

impl From<&ProjectileSpawn> for ProjectileState {
    fn from(spawn: &ProjectileSpawn) -> Self {
        Self {
            id: spawn.id,
            position: spawn.position,
            velocity: spawn.velocity,
            rotation: spawn.rotation,
            owner: spawn.owner_id,
            damage: spawn.damage,
            is_player_projectile: spawn.is_player_projectile,
            authoritative: spawn.is_server_authoritative,
        }
    }
}

impl From<&ProjectileState> for ProjectileSpawn {
    fn from(state: &ProjectileState) -> Self {
        Self {
            id: state.id,
            position: state.position,
            velocity: state.velocity,
            rotation: state.rotation,
            owner_id: state.owner,
            damage: state.damage,
            is_player_projectile: state.is_player_projectile,
            is_server_authoritative: state.authoritative,
        }
    }
}

/// Ballistics of one weapon.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeaponSpec {
    /// Muzzle speed in world units per second.
    pub speed: f32,
    /// Damage on hit.
    pub damage: f32,
}

#[derive(Debug, Clone)]
struct VisualProjectile {
    origin: ProjectileState,
    spawned_at: Instant,
    last_update: Instant,
}

impl VisualProjectile {
    fn extrapolated(&self, now: Instant) -> ProjectileState {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f32();
        ProjectileState {
            position: self.origin.position + self.origin.velocity * elapsed,
            ..self.origin.clone()
        }
    }
}

/// Out-of-order ids tracked above the high-water mark before it is forced
/// forward.
const SEEN_WINDOW: usize = 256;

/// Accepted projectile ids. Everything at or below `floor` counts as seen.
#[derive(Debug, Default)]
struct SeenIds {
    floor: u64,
    above: BTreeSet<u64>,
}

impl SeenIds {
    fn contains(&self, id: ProjectileId) -> bool {
        id.0 <= self.floor || self.above.contains(&id.0)
    }

    /// Returns `false` if `id` was already seen.
    fn insert(&mut self, id: ProjectileId) -> bool {
        if self.contains(id) {
            return false;
        }
        self.above.insert(id.0);
        // Ids skipped by the window are never accepted late.
        while self.above.len() > SEEN_WINDOW {
            if let Some(lowest) = self.above.pop_first() {
                self.floor = lowest;
            }
        }
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
        true
    }
}

#[derive(Debug, Default)]
struct AuthorityInner {
    active: bool,
    is_host: bool,
    local_id: PeerId,
    next_id: u64,
    authorized: HashSet<ProjectileId>,
    seen: SeenIds,
    live: HashMap<ProjectileId, (ProjectileState, Instant)>,
    visual: HashMap<ProjectileId, VisualProjectile>,
    deauthorize: TaskQueue<ProjectileId>,
    pending: HashMap<ProjectileId, TaskHandle>,
}

impl AuthorityInner {
    fn authorize(&mut self, id: ProjectileId, deadline: Instant) {
        self.authorized.insert(id);
        let handle = self.deauthorize.schedule(deadline, id);
        if let Some(old) = self.pending.insert(id, handle) {
            self.deauthorize.cancel(old);
        }
    }

    fn deauthorize_now(&mut self, id: ProjectileId) {
        self.authorized.remove(&id);
        if let Some(handle) = self.pending.remove(&id) {
            self.deauthorize.cancel(handle);
        }
    }

    /// Accept an authoritative spawn exactly once.
    fn accept(&mut self, state: ProjectileState, now: Instant, effects: &mut Effects) -> bool {
        if !self.seen.insert(state.id) {
            tracing::debug!(id = state.id.0, "authoritative spawn already seen, rejecting");
            return false;
        }
        effects
            .events
            .push(PresentationEvent::ProjectileSpawned(state.clone()));
        self.live.insert(state.id, (state, now));
        true
    }
}

// ---------------------------------------------------------------------------
// AuthorityGate
// ---------------------------------------------------------------------------

/// Projectile id minting, authorization and blocking.
pub struct AuthorityGate {
    config: AuthorityConfig,
    weapons: HashMap<u32, WeaponSpec>,
    inner: Mutex<AuthorityInner>,
}

impl AuthorityGate {
    /// Create a gate with an empty weapon catalog.
    pub fn new(config: AuthorityConfig) -> Self {
        Self {
            config,
            weapons: HashMap::new(),
            inner: Mutex::new(AuthorityInner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Register a weapon's ballistics. Unknown weapons use config defaults.
    pub fn with_weapon(mut self, weapon_id: u32, spec: WeaponSpec) -> Self {
        self.weapons.insert(weapon_id, spec);
        self
    }

    fn lock(&self) -> MutexGuard<'_, AuthorityInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ballistics for `weapon_id`.
    pub fn weapon(&self, weapon_id: u32) -> WeaponSpec {
        self.weapons.get(&weapon_id).copied().unwrap_or(WeaponSpec {
            speed: self.config.default_projectile_speed,
            damage: self.config.default_projectile_damage,
        })
    }

    /// Reset for a new session. The id counter keeps running so ids are
    /// never reused.
    pub fn begin(&self, is_host: bool, local_id: PeerId) {
        let mut inner = self.lock();
        let next_id = inner.next_id;
        *inner = AuthorityInner {
            active: true,
            is_host,
            local_id,
            next_id,
            ..Default::default()
        };
    }

    /// Drop all projectile state and timers. Remote spawns and shoot
    /// requests are ignored until the next [`AuthorityGate::begin`].
    pub fn clear(&self) {
        let mut inner = self.lock();
        let next_id = inner.next_id;
        *inner = AuthorityInner {
            next_id,
            ..Default::default()
        };
    }

    /// Host-side: fire a projectile on behalf of `owner`. Mints an id,
    /// authorizes it, broadcasts the authoritative spawn and spawns locally.
    pub fn fire(
        &self,
        owner: PeerId,
        position: Vec2,
        direction: Vec2,
        weapon_id: u32,
        now: Instant,
        effects: &mut Effects,
    ) -> Option<ProjectileId> {
        let Some(dir) = direction.try_normalize() else {
            tracing::warn!(%owner, "shot with zero direction ignored");
            return None;
        };
        let weapon = self.weapon(weapon_id);
        let mut inner = self.lock();
        if !inner.is_host {
            tracing::warn!("only the host can mint projectiles");
            return None;
        }

        let id = ProjectileId(inner.next_id);
        inner.next_id += 1;
        let state = ProjectileState {
            id,
            position: position + dir * self.config.muzzle_offset,
            velocity: dir * weapon.speed,
            rotation: dir.y.atan2(dir.x).to_degrees(),
            owner,
            damage: weapon.damage,
            is_player_projectile: true,
            authoritative: true,
        };
        inner.authorize(id, now + self.config.authorization_grace());
        effects
            .outbound
            .push(Outbound::Broadcast(Message::ProjectileSpawn(
                ProjectileSpawn::from(&state),
            )));
        inner.accept(state, now, effects);
        tracing::debug!(id = id.0, %owner, weapon_id, "projectile minted");
        Some(id)
    }

    /// Host-side: a client asked to fire.
    pub fn on_shoot_request(
        &self,
        from: PeerId,
        request: &ShootRequest,
        now: Instant,
        effects: &mut Effects,
    ) -> Option<ProjectileId> {
        {
            let inner = self.lock();
            if !inner.active {
                tracing::debug!(%from, "ShootRequest outside a session ignored");
                return None;
            }
            if !inner.is_host {
                tracing::warn!(%from, "ShootRequest received but this side is not the host");
                return None;
            }
        }
        if request.player_id != from {
            tracing::warn!(%from, claimed = %request.player_id, "ShootRequest for another player, ignoring");
            return None;
        }
        self.fire(
            from,
            request.position,
            request.direction,
            request.weapon_id,
            now,
            effects,
        )
    }

    /// A ProjectileSpawn arrived from `from`.
    pub fn on_remote_spawn(
        &self,
        from: PeerId,
        spawn: &ProjectileSpawn,
        session_host: Option<PeerId>,
        now: Instant,
        effects: &mut Effects,
    ) {
        let state = ProjectileState::from(spawn);
        let mut inner = self.lock();
        if !inner.active {
            tracing::debug!(%from, id = spawn.id.0, "projectile spawn outside a session ignored");
            return;
        }

        if !spawn.is_server_authoritative {
            let entry = inner.visual.entry(spawn.id).or_insert_with(|| VisualProjectile {
                origin: state.clone(),
                spawned_at: now,
                last_update: now,
            });
            entry.origin = state.clone();
            entry.last_update = now;
            effects
                .events
                .push(PresentationEvent::VisualProjectile(state));
            return;
        }

        if session_host != Some(from) {
            tracing::warn!(%from, id = spawn.id.0, "authoritative spawn from non-host, ignoring");
            return;
        }
        if inner.seen.contains(spawn.id) {
            tracing::debug!(id = spawn.id.0, "duplicate authoritative spawn rejected");
            return;
        }
        inner.authorize(spawn.id, now + self.config.authorization_grace());
        inner.accept(state, now, effects);
    }

    /// The local simulation wants to spawn a projectile. Player projectiles
    /// need an authorized id; anything else is allowed. Blocked attempts are
    /// reported as destroyed.
    pub fn check_local_spawn(
        &self,
        id: ProjectileId,
        is_player_projectile: bool,
        effects: &mut Effects,
    ) -> bool {
        if !is_player_projectile {
            return true;
        }
        if self.lock().authorized.contains(&id) {
            return true;
        }
        tracing::debug!(id = id.0, "unauthorized player projectile blocked");
        effects
            .events
            .push(PresentationEvent::ProjectileDestroyed(id));
        false
    }

    /// The local spawn for `id` was confirmed; drop its authorization now.
    pub fn acknowledge_spawn(&self, id: ProjectileId) {
        self.lock().deauthorize_now(id);
    }

    /// Destroy a projectile locally. The host also tells every peer.
    pub fn destroy(&self, id: ProjectileId, effects: &mut Effects) {
        let mut inner = self.lock();
        let existed = inner.live.remove(&id).is_some() | inner.visual.remove(&id).is_some();
        inner.deauthorize_now(id);
        if inner.is_host {
            effects
                .outbound
                .push(Outbound::Broadcast(Message::ProjectileDestroy(
                    ProjectileDestroy { id },
                )));
        }
        if existed {
            effects
                .events
                .push(PresentationEvent::ProjectileDestroyed(id));
        }
    }

    /// A ProjectileDestroy arrived.
    pub fn on_remote_destroy(&self, id: ProjectileId, effects: &mut Effects) {
        let mut inner = self.lock();
        let existed = inner.live.remove(&id).is_some() | inner.visual.remove(&id).is_some();
        inner.deauthorize_now(id);
        if existed {
            effects
                .events
                .push(PresentationEvent::ProjectileDestroyed(id));
        }
    }

    /// Run scheduled deauthorizations and visual projectile upkeep.
    pub fn tick(&self, now: Instant, effects: &mut Effects) {
        let mut guard = self.lock();
        let inner = &mut *guard;

        for id in inner.deauthorize.drain_due(now) {
            inner.pending.remove(&id);
            inner.authorized.remove(&id);
            tracing::trace!(id = id.0, "projectile id deauthorized");
        }

        let lifetime = self.config.visual_projectile_lifetime();
        let stale = self.config.visual_projectile_stale();
        let expired: Vec<ProjectileId> = inner
            .visual
            .iter()
            .filter(|(_, v)| {
                now.saturating_duration_since(v.spawned_at) >= lifetime
                    || now.saturating_duration_since(v.last_update) >= stale
            })
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            inner.visual.remove(&id);
            effects
                .events
                .push(PresentationEvent::ProjectileDestroyed(id));
        }
        for visual in inner.visual.values() {
            effects
                .events
                .push(PresentationEvent::VisualProjectile(visual.extrapolated(now)));
        }

        // Authoritative projectiles are owned by the game once spawned; only
        // the bookkeeping entry is bounded here.
        inner
            .live
            .retain(|_, (_, spawned)| now.saturating_duration_since(*spawned) < lifetime);
    }

    /// Whether `id` is currently authorized.
    pub fn is_authorized(&self, id: ProjectileId) -> bool {
        self.lock().authorized.contains(&id)
    }

    /// Number of tracked authoritative projectiles.
    pub fn live_count(&self) -> usize {
        self.lock().live.len()
    }

    /// Extrapolated state of a visual-only projectile.
    pub fn visual_projectile(&self, id: ProjectileId, now: Instant) -> Option<ProjectileState> {
        self.lock().visual.get(&id).map(|v| v.extrapolated(now))
    }

    /// Local peer id as configured by [`AuthorityGate::begin`].
    pub fn local_id(&self) -> PeerId {
        self.lock().local_id
    }
}
