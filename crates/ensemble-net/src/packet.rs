//! Packet envelope: a compression flag byte in front of the versioned
//! message payload.
//!
//! Payloads at or above the configured threshold are LZ4 compressed; small
//! ones (the overwhelming majority of handshake and position traffic) are
//! sent as-is to avoid the size prefix overhead.

use ensemble_config::NetworkConfig;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::messages::{Message, MessageError, deserialize_message, serialize_message};

/// Compression flag: payload is uncompressed.
pub const FLAG_RAW: u8 = 0x00;

/// Compression flag: payload is LZ4-compressed with a size prefix.
pub const FLAG_LZ4: u8 = 0x01;

/// Errors produced while decoding a received packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    /// The packet was empty, no compression flag present.
    #[error("empty packet")]
    Empty,
    /// An unknown compression flag byte was encountered.
    #[error("unknown compression flag: 0x{0:02X}")]
    UnknownFlag(u8),
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    /// The inner message could not be (de)serialized.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Encodes and decodes [`Message`]s to and from wire packets.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    compression_enabled: bool,
    threshold: usize,
}

impl PacketCodec {
    /// Creates a codec with explicit compression settings.
    pub fn new(compression_enabled: bool, threshold: usize) -> Self {
        Self {
            compression_enabled,
            threshold,
        }
    }

    /// Creates a codec from the network section of the config.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.compression_enabled, config.compression_threshold)
    }

    /// Encodes a message into a wire packet.
    ///
    /// Wire format: `[flag: u8] [version: u8 + postcard body, maybe LZ4]`
    pub fn encode(&self, msg: &Message) -> Result<Vec<u8>, PacketError> {
        let payload = serialize_message(msg)?;
        if !self.compression_enabled || payload.len() < self.threshold {
            let mut out = Vec::with_capacity(1 + payload.len());
            out.push(FLAG_RAW);
            out.extend_from_slice(&payload);
            return Ok(out);
        }

        let compressed = compress_prepend_size(&payload);
        let mut out = Vec::with_capacity(1 + compressed.len());
        out.push(FLAG_LZ4);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Decodes a wire packet into a message.
    pub fn decode(&self, packet: &[u8]) -> Result<Message, PacketError> {
        let (&flag, body) = packet.split_first().ok_or(PacketError::Empty)?;
        match flag {
            FLAG_RAW => Ok(deserialize_message(body)?),
            FLAG_LZ4 => {
                let payload = decompress_size_prepended(body)?;
                Ok(deserialize_message(&payload)?)
            }
            other => Err(PacketError::UnknownFlag(other)),
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MapSync, ProjectileDestroy, ProjectileId};

    #[test]
    fn test_small_message_is_not_compressed() {
        let codec = PacketCodec::default();
        let packet = codec
            .encode(&Message::ProjectileDestroy(ProjectileDestroy {
                id: ProjectileId(3),
            }))
            .unwrap();
        assert_eq!(packet[0], FLAG_RAW);
    }

    #[test]
    fn test_large_message_is_compressed_and_decodes() {
        let codec = PacketCodec::new(true, 64);
        let msg = Message::MapSync(MapSync {
            map_name: "Foyer".repeat(100),
        });
        let packet = codec.encode(&msg).unwrap();
        assert_eq!(packet[0], FLAG_LZ4);
        assert!(packet.len() < 500, "repetitive map name should shrink");
        assert_eq!(codec.decode(&packet).unwrap(), msg);
    }

    #[test]
    fn test_compression_disabled_never_compresses() {
        let codec = PacketCodec::new(false, 0);
        let msg = Message::MapSync(MapSync {
            map_name: "Foyer".repeat(100),
        });
        let packet = codec.encode(&msg).unwrap();
        assert_eq!(packet[0], FLAG_RAW);
        assert_eq!(codec.decode(&packet).unwrap(), msg);
    }

    #[test]
    fn test_empty_packet_rejected() {
        let codec = PacketCodec::default();
        assert!(matches!(codec.decode(&[]), Err(PacketError::Empty)));
    }

    #[test]
    fn test_unknown_flag_rejected() {
        let codec = PacketCodec::default();
        assert!(matches!(
            codec.decode(&[0x7F, 1, 2]),
            Err(PacketError::UnknownFlag(0x7F))
        ));
    }

    #[test]
    fn test_truncated_lz4_rejected() {
        let codec = PacketCodec::default();
        assert!(codec.decode(&[FLAG_LZ4, 0x10, 0x00, 0x00, 0x00, 0xF0]).is_err());
    }
}
