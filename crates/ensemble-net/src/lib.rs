//! Peer-to-peer networking: transport abstraction, wire messages, packet
//! codec, bandwidth counters, and the connection/handshake registry.

pub mod connection;
pub mod loopback;
pub mod messages;
pub mod packet;
pub mod stats;
pub mod transport;
pub mod udp;

pub use connection::{
    ConnectionRecord, ConnectionRegistry, ConnectionState, DropReason, RegistryEvent, Role,
};
pub use loopback::{LoopbackNetwork, LoopbackTransport};
pub use messages::{
    AnimationState, CharacterInfo, HandshakeRequest, MapSync, Message, MessageError, MessageKind,
    PROTOCOL_VERSION, PositionUpdate, ProjectileDestroy, ProjectileId, ProjectileSpawn,
    ShootRequest, deserialize_message, serialize_message,
};
pub use packet::{PacketCodec, PacketError};
pub use stats::{MessageKindStats, NetworkCounters, NetworkStats, PerKindCounters, StatsSnapshot};
pub use transport::{EventHandler, Outbound, PeerId, Transport, TransportEvent};
pub use udp::UdpTransport;
