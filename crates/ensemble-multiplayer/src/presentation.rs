//! Presentation callbacks and the deferred side-effect batch.
//!
//! Components never call the presentation layer or the transport directly.
//! They append to an [`Effects`] batch while holding their own lock; the
//! session flushes the batch once every lock is released.

use ensemble_net::{Outbound, PeerId, ProjectileId};

use crate::authority::ProjectileState;
use crate::replication::RemotePlayerSnapshot;

/// Rendering/animation side of the game, notified of replicated changes.
pub trait Presentation: Send + Sync {
    /// A remote player became known and needs a renderable.
    fn on_remote_snapshot_created(&self, peer: PeerId, snapshot: &RemotePlayerSnapshot);

    /// A remote player's state (or interpolated position) changed.
    fn on_remote_snapshot_updated(&self, peer: PeerId, snapshot: &RemotePlayerSnapshot);

    /// A remote player's renderable should be destroyed.
    fn on_remote_snapshot_removed(&self, peer: PeerId);

    /// The host authorized and spawned a projectile.
    fn on_authoritative_projectile_spawn(&self, id: ProjectileId, state: &ProjectileState);

    /// A projectile must be destroyed (blocked, expired, or destroyed remotely).
    fn on_projectile_destroyed(&self, id: ProjectileId);

    /// A remote player's renderable should be shown or hidden because it is
    /// on another map.
    fn on_remote_visibility_changed(&self, _peer: PeerId, _visible: bool) {}

    /// A visual-only projectile was created or moved by extrapolation.
    fn on_visual_projectile(&self, _id: ProjectileId, _state: &ProjectileState) {}
}

/// A deferred presentation callback.
#[derive(Debug, Clone, PartialEq)]
pub enum PresentationEvent {
    /// See [`Presentation::on_remote_snapshot_created`].
    SnapshotCreated(RemotePlayerSnapshot),
    /// See [`Presentation::on_remote_snapshot_updated`].
    SnapshotUpdated(RemotePlayerSnapshot),
    /// See [`Presentation::on_remote_snapshot_removed`].
    SnapshotRemoved(PeerId),
    /// See [`Presentation::on_remote_visibility_changed`].
    VisibilityChanged(PeerId, bool),
    /// See [`Presentation::on_authoritative_projectile_spawn`].
    ProjectileSpawned(ProjectileState),
    /// See [`Presentation::on_projectile_destroyed`].
    ProjectileDestroyed(ProjectileId),
    /// See [`Presentation::on_visual_projectile`].
    VisualProjectile(ProjectileState),
}

impl PresentationEvent {
    /// Invoke the matching callback.
    pub fn dispatch(&self, presentation: &dyn Presentation) {
        match self {
            Self::SnapshotCreated(s) => presentation.on_remote_snapshot_created(s.peer_id, s),
            Self::SnapshotUpdated(s) => presentation.on_remote_snapshot_updated(s.peer_id, s),
            Self::SnapshotRemoved(peer) => presentation.on_remote_snapshot_removed(*peer),
            Self::VisibilityChanged(peer, visible) => {
                presentation.on_remote_visibility_changed(*peer, *visible)
            }
            Self::ProjectileSpawned(p) => presentation.on_authoritative_projectile_spawn(p.id, p),
            Self::ProjectileDestroyed(id) => presentation.on_projectile_destroyed(*id),
            Self::VisualProjectile(p) => presentation.on_visual_projectile(p.id, p),
        }
    }
}

/// Side effects produced under component locks.
#[derive(Debug, Default)]
pub struct Effects {
    /// Messages to encode and hand to the transport.
    pub outbound: Vec<Outbound>,
    /// Presentation callbacks, in order.
    pub events: Vec<PresentationEvent>,
    /// Map the host engine should load.
    pub scene_load: Option<String>,
}

impl Effects {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when there is nothing to flush.
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty() && self.scene_load.is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Removals(Mutex<Vec<PeerId>>);

    impl Presentation for Removals {
        fn on_remote_snapshot_created(&self, _: PeerId, _: &RemotePlayerSnapshot) {}
        fn on_remote_snapshot_updated(&self, _: PeerId, _: &RemotePlayerSnapshot) {}
        fn on_remote_snapshot_removed(&self, peer: PeerId) {
            self.0.lock().unwrap().push(peer);
        }
        fn on_authoritative_projectile_spawn(&self, _: ProjectileId, _: &ProjectileState) {}
        fn on_projectile_destroyed(&self, _: ProjectileId) {}
    }

    #[test]
    fn test_dispatch_routes_to_callback() {
        let removals = Removals::default();
        PresentationEvent::SnapshotRemoved(PeerId(4)).dispatch(&removals);
        // Optional callbacks default to no-ops.
        PresentationEvent::VisibilityChanged(PeerId(4), false).dispatch(&removals);
        assert_eq!(*removals.0.lock().unwrap(), vec![PeerId(4)]);
    }

    #[test]
    fn test_empty_effects() {
        let mut effects = Effects::new();
        assert!(effects.is_empty());
        effects.scene_load = Some("Foyer".into());
        assert!(!effects.is_empty());
    }
}
