//! Session-level multiplayer: connection orchestration, player-state
//! replication, scene-transition coherence, and host-authoritative
//! projectile spawning.
//!
//! A [`Session`] owns one instance of every component and drives them from a
//! single cooperative tick. Transport callbacks may arrive on other threads;
//! each component guards its tables with its own lock, and all presentation
//! and transport side effects are collected into [`Effects`] and flushed
//! after those locks are released.

pub mod animation;
pub mod authority;
pub mod clock;
pub mod host;
pub mod presentation;
pub mod replication;
pub mod scene;
pub mod scheduler;
pub mod session;

pub use animation::{AnimationFrame, derive_animation};
pub use authority::{AuthorityGate, ProjectileState, WeaponSpec};
pub use clock::{Clock, ManualClock, SystemClock};
pub use host::{CharacterIdentity, HostEngine, LocalPlayerState};
pub use presentation::{Effects, Presentation, PresentationEvent};
pub use replication::{LocalFrame, RemotePlayerSnapshot, ReplicationEngine};
pub use scene::{SceneCoherence, SceneStep, SceneTransitionState};
pub use scheduler::{TaskHandle, TaskQueue};
pub use session::{Session, SessionBuilder, SessionError};
