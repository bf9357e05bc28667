//! The host-engine boundary: everything the session needs to know about the
//! local game, and the one thing it may ask the game to do (load a scene).

use ensemble_net::CharacterInfo;
use glam::Vec2;
use serde::{Deserialize, Serialize};

/// Identity of the locally selected character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacterIdentity {
    /// Character identifier, [`CharacterIdentity::NONE_ID`] when unset.
    pub id: i32,
    /// Display name.
    pub name: String,
}

impl CharacterIdentity {
    /// Identifier meaning "no character selected".
    pub const NONE_ID: i32 = -1;

    /// Create an identity.
    pub fn new(id: i32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// The unset identity.
    pub fn none() -> Self {
        Self {
            id: Self::NONE_ID,
            name: String::new(),
        }
    }

    /// Returns `true` when no character is selected.
    pub fn is_none(&self) -> bool {
        self.id == Self::NONE_ID
    }
}

impl Default for CharacterIdentity {
    fn default() -> Self {
        Self::none()
    }
}

impl From<&CharacterIdentity> for CharacterInfo {
    fn from(identity: &CharacterIdentity) -> Self {
        CharacterInfo {
            character_id: identity.id,
            character_name: identity.name.clone(),
        }
    }
}

impl From<CharacterInfo> for CharacterIdentity {
    fn from(info: CharacterInfo) -> Self {
        Self {
            id: info.character_id,
            name: info.character_name,
        }
    }
}

/// Local player state read once per tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalPlayerState {
    /// World position.
    pub position: Vec2,
    /// Velocity in world units per second.
    pub velocity: Vec2,
    /// Facing in degrees.
    pub rotation: f32,
    /// Standing on ground.
    pub grounded: bool,
    /// Mid dodge-roll.
    pub dodge_rolling: bool,
    /// Firing a weapon this frame.
    pub shooting: bool,
    /// Reloading.
    pub reloading: bool,
    /// Playing a hit reaction.
    pub taking_damage: bool,
    /// Dead.
    pub dead: bool,
}

/// The local game as seen by the session.
///
/// Implementations must be cheap and non-blocking; they are called from the
/// tick and, for [`HostEngine::current_map_name`], from the transport
/// callback. The session never holds one of its own locks while calling in.
pub trait HostEngine: Send + Sync {
    /// Name of the currently loaded map.
    fn current_map_name(&self) -> String;

    /// Whether the local player exists and is controllable.
    fn local_player_ready(&self) -> bool;

    /// Ask the game to load `map_name`. The game reports the resulting
    /// unload/load through the session's scene notifications.
    fn request_scene_load(&self, map_name: &str);

    /// Whether the game is in a location where sessions may start.
    fn current_safe_location(&self) -> bool;

    /// Local player state, or `None` while the player does not exist.
    fn local_player(&self) -> Option<LocalPlayerState>;

    /// The locally selected character.
    fn local_character(&self) -> CharacterIdentity;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_identity_is_none() {
        let identity = CharacterIdentity::default();
        assert!(identity.is_none());
        assert!(!CharacterIdentity::new(2, "Marine").is_none());
    }

    #[test]
    fn test_identity_converts_to_wire_and_back() {
        let identity = CharacterIdentity::new(4, "Hunter");
        let info = CharacterInfo::from(&identity);
        assert_eq!(info.character_id, 4);
        assert_eq!(CharacterIdentity::from(info), identity);
    }
}
