//! Wire message types and serialization.
//!
//! All messages are serialized with [`postcard`] and prefixed with a protocol
//! version byte. Use [`serialize_message`] and [`deserialize_message`] for
//! encoding/decoding; [`crate::packet`] adds the compression envelope.

use glam::Vec2;
use serde::{Deserialize, Serialize};

use crate::transport::PeerId;

/// Current wire-protocol version. Prepended to every serialized message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Host-assigned projectile identifier. Monotonically increasing, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectileId(pub u64);

// ---------------------------------------------------------------------------
// Top-level enum
// ---------------------------------------------------------------------------

/// Top-level network message. The enum discriminant is the type tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Message {
    // --- Handshake ---
    /// Client asks the host to admit it into the session.
    HandshakeRequest(HandshakeRequest),
    /// Host accepts a handshake request.
    HandshakeResponse,
    /// Client confirms it observed the response. Idempotent.
    HandshakeComplete,
    /// Graceful leave; the receiver tears the connection down.
    Disconnect,

    // --- Replication ---
    /// Full local-player state update.
    PositionUpdate(PositionUpdate),
    /// Host names the map every peer should be on.
    MapSync(MapSync),

    // --- Projectiles ---
    /// A projectile came into existence.
    ProjectileSpawn(ProjectileSpawn),
    /// A projectile was destroyed.
    ProjectileDestroy(ProjectileDestroy),
    /// Client asks the host to fire on its behalf.
    ShootRequest(ShootRequest),
}

/// Fieldless mirror of [`Message`] used for logging and bandwidth accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// [`Message::HandshakeRequest`]
    HandshakeRequest,
    /// [`Message::HandshakeResponse`]
    HandshakeResponse,
    /// [`Message::HandshakeComplete`]
    HandshakeComplete,
    /// [`Message::Disconnect`]
    Disconnect,
    /// [`Message::PositionUpdate`]
    PositionUpdate,
    /// [`Message::MapSync`]
    MapSync,
    /// [`Message::ProjectileSpawn`]
    ProjectileSpawn,
    /// [`Message::ProjectileDestroy`]
    ProjectileDestroy,
    /// [`Message::ShootRequest`]
    ShootRequest,
}

impl Message {
    /// Returns the kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::HandshakeRequest(_) => MessageKind::HandshakeRequest,
            Self::HandshakeResponse => MessageKind::HandshakeResponse,
            Self::HandshakeComplete => MessageKind::HandshakeComplete,
            Self::Disconnect => MessageKind::Disconnect,
            Self::PositionUpdate(_) => MessageKind::PositionUpdate,
            Self::MapSync(_) => MessageKind::MapSync,
            Self::ProjectileSpawn(_) => MessageKind::ProjectileSpawn,
            Self::ProjectileDestroy(_) => MessageKind::ProjectileDestroy,
            Self::ShootRequest(_) => MessageKind::ShootRequest,
        }
    }

    /// Returns `true` for the messages handled by the connection registry.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRequest(_)
                | Self::HandshakeResponse
                | Self::HandshakeComplete
                | Self::Disconnect
        )
    }
}

// ---------------------------------------------------------------------------
// Payload structs
// ---------------------------------------------------------------------------

/// Handshake request carrying the sender's own identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandshakeRequest {
    /// The requesting peer.
    pub peer_id: PeerId,
}

/// Coarse animation state derived by the sender so receivers can drive
/// presentation without re-running animation logic.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AnimationState {
    /// Standing still.
    #[default]
    Idle,
    /// Moving slowly.
    Walking,
    /// Moving quickly.
    Running,
    /// Airborne.
    Falling,
    /// Mid dodge-roll.
    DodgeRolling,
    /// Firing a weapon.
    Shooting,
    /// Reloading a weapon.
    Reloading,
    /// Playing a hit reaction.
    TakingDamage,
    /// Dead.
    Dead,
}

/// Selected character identity. Sent only when it first appears or changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharacterInfo {
    /// Character identifier, `-1` when no character is selected.
    pub character_id: i32,
    /// Display name of the character.
    pub character_name: String,
}

/// Full player-state update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionUpdate {
    /// World position.
    pub position: Vec2,
    /// Velocity in world units per second.
    pub velocity: Vec2,
    /// Facing in degrees.
    pub rotation: f32,
    /// Whether the player stands on ground.
    pub grounded: bool,
    /// Whether the player is mid dodge-roll.
    pub dodge_rolling: bool,
    /// Map the player is currently on.
    pub map_name: String,
    /// Derived animation state.
    pub anim_state: AnimationState,
    /// Normalized movement direction (zero when idle).
    pub movement_dir: Vec2,
    /// Name of the animation clip the sender is playing.
    pub clip_name: String,
    /// Character identity, or `None` to leave the receiver's copy unchanged.
    pub character: Option<CharacterInfo>,
}

/// Host announcement of the map every peer should be on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapSync {
    /// Name of the host's current map.
    pub map_name: String,
}

/// Projectile spawn announcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectileSpawn {
    /// Projectile identifier.
    pub id: ProjectileId,
    /// Spawn position.
    pub position: Vec2,
    /// Velocity in world units per second.
    pub velocity: Vec2,
    /// Facing in degrees.
    pub rotation: f32,
    /// Peer that fired the projectile.
    pub owner_id: PeerId,
    /// Damage dealt on hit.
    pub damage: f32,
    /// Fired by a player (as opposed to an enemy or the environment).
    pub is_player_projectile: bool,
    /// Minted by the host; visual-only projectiles carry `false`.
    pub is_server_authoritative: bool,
}

/// Projectile destruction announcement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectileDestroy {
    /// Projectile identifier.
    pub id: ProjectileId,
}

/// Client request for the host to fire on its behalf.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShootRequest {
    /// Shooting player.
    pub player_id: PeerId,
    /// Shooter position.
    pub position: Vec2,
    /// Aim direction (need not be normalized).
    pub direction: Vec2,
    /// Weapon used.
    pub weapon_id: u32,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during message deserialization.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The payload was empty (no version byte).
    #[error("empty payload, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard serialization or deserialization failed.
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize a [`Message`] into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded Message]`
pub fn serialize_message(msg: &Message) -> Result<Vec<u8>, MessageError> {
    let body = postcard::to_allocvec(msg)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload into a [`Message`].
pub fn deserialize_message(data: &[u8]) -> Result<Message, MessageError> {
    let (&version, body) = data.split_first().ok_or(MessageError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update(character: Option<CharacterInfo>) -> Message {
        Message::PositionUpdate(PositionUpdate {
            position: Vec2::new(12.5, -3.0),
            velocity: Vec2::new(4.0, 0.0),
            rotation: 90.0,
            grounded: true,
            dodge_rolling: false,
            map_name: "Foyer".to_string(),
            anim_state: AnimationState::Running,
            movement_dir: Vec2::X,
            clip_name: "run_east".to_string(),
            character,
        })
    }

    #[test]
    fn test_position_update_with_character_survives_encoding() {
        let msg = sample_update(Some(CharacterInfo {
            character_id: 3,
            character_name: "Pilot".to_string(),
        }));
        let decoded = deserialize_message(&serialize_message(&msg).unwrap()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_update_without_character_is_smaller() {
        let with = serialize_message(&sample_update(Some(CharacterInfo {
            character_id: 3,
            character_name: "Pilot".to_string(),
        })))
        .unwrap();
        let without = serialize_message(&sample_update(None)).unwrap();
        assert!(without.len() < with.len());
    }

    #[test]
    fn test_unit_handshake_messages_are_tiny() {
        for msg in [
            Message::HandshakeResponse,
            Message::HandshakeComplete,
            Message::Disconnect,
        ] {
            let bytes = serialize_message(&msg).unwrap();
            assert_eq!(bytes.len(), 2, "{:?} should be version + tag", msg.kind());
            assert_eq!(deserialize_message(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_kind_and_handshake_classification() {
        let req = Message::HandshakeRequest(HandshakeRequest {
            peer_id: PeerId(5),
        });
        assert_eq!(req.kind(), MessageKind::HandshakeRequest);
        assert!(req.is_handshake());
        assert!(Message::Disconnect.is_handshake());
        assert!(!sample_update(None).is_handshake());
        assert!(
            !Message::MapSync(MapSync {
                map_name: "Foyer".into()
            })
            .is_handshake()
        );
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let mut bytes = serialize_message(&Message::HandshakeComplete).unwrap();
        bytes[0] = 255;
        let result = deserialize_message(&bytes);
        assert!(matches!(result, Err(MessageError::UnsupportedVersion(255))));
    }

    #[test]
    fn test_empty_payload_rejected() {
        assert!(matches!(
            deserialize_message(&[]),
            Err(MessageError::EmptyPayload)
        ));
    }

    #[test]
    fn test_corrupted_payload_rejected() {
        let result = deserialize_message(&[PROTOCOL_VERSION, 0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_version_byte_is_first_byte() {
        let msg = Message::ProjectileDestroy(ProjectileDestroy {
            id: ProjectileId(9),
        });
        let bytes = serialize_message(&msg).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
    }
}
