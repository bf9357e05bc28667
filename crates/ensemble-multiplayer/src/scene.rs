//! Keeps replicated state coherent while the local world is torn down and
//! rebuilt, and handles the host's MapSync requests.
//!
//! Transition flow: `Idle → Unloading → Restoring → Idle`. On unload the
//! live snapshots are copied into a persisted table; once the new scene is
//! loaded and the local player is ready (or the restore timeout elapses) the
//! persisted table is handed back for restoration and cleared.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use ensemble_config::SceneConfig;
use ensemble_net::PeerId;

use crate::replication::RemotePlayerSnapshot;
use crate::scheduler::TaskQueue;

/// Scene transition state. At most one transition is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SceneTransitionState {
    /// No transition.
    #[default]
    Idle,
    /// The old scene is being torn down.
    Unloading,
    /// The new scene is loaded; waiting to push persisted state back.
    Restoring,
}

/// Work produced by one [`SceneCoherence::step`].
#[derive(Debug, Default)]
pub struct SceneStep {
    /// Persisted snapshots to push back into replication.
    pub restore: Option<Vec<RemotePlayerSnapshot>>,
    /// Map the host engine should switch to.
    pub load_map: Option<String>,
}

#[derive(Debug, Default)]
struct SceneInner {
    state: SceneTransitionState,
    persisted: HashMap<PeerId, RemotePlayerSnapshot>,
    restore_deadline: TaskQueue<()>,
    deadline_passed: bool,
    pending_map_sync: Option<String>,
}

/// Persistence across scene transitions plus the MapSync client side.
pub struct SceneCoherence {
    config: SceneConfig,
    inner: Mutex<SceneInner>,
}

impl SceneCoherence {
    /// Create an idle controller.
    pub fn new(config: SceneConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SceneInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SceneInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current transition state.
    pub fn state(&self) -> SceneTransitionState {
        self.lock().state
    }

    /// Whether a transition is in progress.
    pub fn is_transition_active(&self) -> bool {
        self.state() != SceneTransitionState::Idle
    }

    /// Number of persisted snapshots.
    pub fn persisted_len(&self) -> usize {
        self.lock().persisted.len()
    }

    /// Latest MapSync target still waiting to be applied.
    pub fn pending_map_sync(&self) -> Option<String> {
        self.lock().pending_map_sync.clone()
    }

    /// The local scene started unloading. Stores `snapshots` in the
    /// persisted table. Returns `false` (and stores nothing) if a transition
    /// is already in progress.
    pub fn begin_unload(&self, snapshots: Vec<RemotePlayerSnapshot>) -> bool {
        let mut inner = self.lock();
        if inner.state != SceneTransitionState::Idle {
            tracing::warn!(state = ?inner.state, "scene unload while a transition is active, ignoring");
            return false;
        }
        inner.persisted = snapshots.into_iter().map(|s| (s.peer_id, s)).collect();
        inner.state = SceneTransitionState::Unloading;
        tracing::info!(persisted = inner.persisted.len(), "scene unloading");
        true
    }

    /// The new scene finished loading. Returns `true` if this moved the
    /// controller into Restoring.
    pub fn on_scene_loaded(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.state != SceneTransitionState::Unloading {
            tracing::debug!(state = ?inner.state, "scene loaded outside an unload, ignoring");
            return false;
        }
        inner.state = SceneTransitionState::Restoring;
        inner.deadline_passed = false;
        inner.restore_deadline.clear();
        inner
            .restore_deadline
            .schedule(now + self.config.restore_timeout(), ());
        tracing::info!("scene loaded, restoring remote players");
        true
    }

    /// Record a MapSync. Only the session host may send one; only the latest
    /// is kept.
    pub fn on_map_sync(&self, from: PeerId, session_host: Option<PeerId>, map_name: String) {
        if session_host != Some(from) {
            tracing::warn!(%from, "MapSync from a peer other than the session host, ignoring");
            return;
        }
        tracing::debug!(%from, map = %map_name, "MapSync queued");
        self.lock().pending_map_sync = Some(map_name);
    }

    /// Advance the state machine.
    ///
    /// While Restoring, the persisted table is released once the local player
    /// is ready or the restore timeout has passed. While Idle, a pending
    /// MapSync is released once the local player is ready; it yields a load
    /// only if the map differs from `current_map`.
    pub fn step(&self, now: Instant, player_ready: bool, current_map: &str) -> SceneStep {
        let mut inner = self.lock();
        let mut step = SceneStep::default();

        match inner.state {
            SceneTransitionState::Restoring => {
                if !inner.restore_deadline.drain_due(now).is_empty() {
                    inner.deadline_passed = true;
                }
                if player_ready || inner.deadline_passed {
                    if !player_ready {
                        tracing::warn!(
                            "local player not ready after restore timeout, restoring best-effort"
                        );
                    }
                    let restored: Vec<RemotePlayerSnapshot> =
                        inner.persisted.drain().map(|(_, s)| s).collect();
                    inner.restore_deadline.clear();
                    inner.state = SceneTransitionState::Idle;
                    step.restore = Some(restored);
                }
            }
            SceneTransitionState::Idle => {
                if player_ready && let Some(map) = inner.pending_map_sync.take() {
                    if map != current_map {
                        tracing::info!(from = %current_map, to = %map, "MapSync: switching scene");
                        step.load_map = Some(map);
                    } else {
                        tracing::debug!(map = %map, "MapSync: already on host map");
                    }
                }
            }
            SceneTransitionState::Unloading => {}
        }
        step
    }

    /// Drop `peer` from the persisted table so a restore does not bring it
    /// back. Returns `true` if it was held.
    pub fn forget(&self, peer: PeerId) -> bool {
        let mut inner = self.lock();
        let removed = inner.persisted.remove(&peer).is_some();
        if removed {
            tracing::debug!(%peer, "persisted snapshot dropped with its peer");
        }
        removed
    }

    /// Forget everything and return to Idle.
    pub fn clear(&self) {
        let mut inner = self.lock();
        *inner = SceneInner::default();
    }
}
