//! Sender-side animation derivation.
//!
//! Receivers do not re-run animation logic; each position update carries a
//! coarse [`AnimationState`], a normalized movement direction and the name of
//! the clip the sender is playing.

use ensemble_net::AnimationState;
use glam::Vec2;

use crate::host::LocalPlayerState;

/// Speeds below this count as standing still.
pub const WALK_SPEED_THRESHOLD: f32 = 0.1;

/// Speeds above this count as running.
pub const RUN_SPEED_THRESHOLD: f32 = 3.0;

/// Animation fields attached to an outgoing update.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimationFrame {
    /// Coarse state.
    pub state: AnimationState,
    /// Normalized movement direction, zero when not moving.
    pub movement_dir: Vec2,
    /// Clip name, e.g. `run_east`.
    pub clip_name: String,
}

/// Derive the animation frame for the local player.
pub fn derive_animation(player: &LocalPlayerState) -> AnimationFrame {
    let speed = player.velocity.length();
    let movement_dir = if speed > WALK_SPEED_THRESHOLD {
        player.velocity / speed
    } else {
        Vec2::ZERO
    };

    // Higher entries override lower ones.
    let state = if player.dead {
        AnimationState::Dead
    } else if player.taking_damage {
        AnimationState::TakingDamage
    } else if player.dodge_rolling {
        AnimationState::DodgeRolling
    } else if player.reloading {
        AnimationState::Reloading
    } else if player.shooting {
        AnimationState::Shooting
    } else if !player.grounded {
        AnimationState::Falling
    } else if speed > RUN_SPEED_THRESHOLD {
        AnimationState::Running
    } else if speed > WALK_SPEED_THRESHOLD {
        AnimationState::Walking
    } else {
        AnimationState::Idle
    };

    let facing = if movement_dir == Vec2::ZERO {
        facing_from_rotation(player.rotation)
    } else {
        facing_from_direction(movement_dir)
    };

    AnimationFrame {
        state,
        movement_dir,
        clip_name: format!("{}_{facing}", clip_prefix(state)),
    }
}

fn clip_prefix(state: AnimationState) -> &'static str {
    match state {
        AnimationState::Idle => "idle",
        AnimationState::Walking => "walk",
        AnimationState::Running => "run",
        AnimationState::Falling => "fall",
        AnimationState::DodgeRolling => "dodge",
        AnimationState::Shooting => "shoot",
        AnimationState::Reloading => "reload",
        AnimationState::TakingDamage => "hit",
        AnimationState::Dead => "death",
    }
}

fn facing_from_direction(dir: Vec2) -> &'static str {
    if dir.x.abs() >= dir.y.abs() {
        if dir.x >= 0.0 { "east" } else { "west" }
    } else if dir.y >= 0.0 {
        "north"
    } else {
        "south"
    }
}

fn facing_from_rotation(degrees: f32) -> &'static str {
    let radians = degrees.to_radians();
    facing_from_direction(Vec2::new(radians.cos(), radians.sin()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grounded() -> LocalPlayerState {
        LocalPlayerState {
            grounded: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_idle_uses_rotation_for_facing() {
        let player = LocalPlayerState {
            rotation: 180.0,
            ..grounded()
        };
        let frame = derive_animation(&player);
        assert_eq!(frame.state, AnimationState::Idle);
        assert_eq!(frame.movement_dir, Vec2::ZERO);
        assert_eq!(frame.clip_name, "idle_west");
    }

    #[test]
    fn test_speed_selects_walk_or_run() {
        let walk = derive_animation(&LocalPlayerState {
            velocity: Vec2::new(0.0, 1.0),
            ..grounded()
        });
        assert_eq!(walk.state, AnimationState::Walking);
        assert_eq!(walk.clip_name, "walk_north");

        let run = derive_animation(&LocalPlayerState {
            velocity: Vec2::new(6.0, 0.0),
            ..grounded()
        });
        assert_eq!(run.state, AnimationState::Running);
        assert!((run.movement_dir - Vec2::X).length() < 1e-6);
        assert_eq!(run.clip_name, "run_east");
    }

    #[test]
    fn test_airborne_is_falling() {
        let frame = derive_animation(&LocalPlayerState {
            velocity: Vec2::new(0.0, -5.0),
            ..Default::default()
        });
        assert_eq!(frame.state, AnimationState::Falling);
        assert_eq!(frame.clip_name, "fall_south");
    }

    #[test]
    fn test_action_flags_take_priority() {
        let frame = derive_animation(&LocalPlayerState {
            velocity: Vec2::new(6.0, 0.0),
            shooting: true,
            dodge_rolling: true,
            ..grounded()
        });
        assert_eq!(frame.state, AnimationState::DodgeRolling);

        let dead = derive_animation(&LocalPlayerState {
            dead: true,
            taking_damage: true,
            ..grounded()
        });
        assert_eq!(dead.state, AnimationState::Dead);
    }
}
