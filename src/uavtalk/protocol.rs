//! # UAVTalk Protocol Constants and Types
//!
//! ## Packet Layout (little-endian)
//!
//! | Offset | Size | Content |
//! |--------|------|---------|
//! | 0 | 1 | sync byte `0x3C` |
//! | 1 | 1 | type byte: version bits \| kind |
//! | 2 | 2 | length: header + payload, CRC excluded |
//! | 4 | 4 | object type id |
//! | 8 | 2 | instance id |
//! | 10 | N | payload (OBJ and OBJ_ACK only) |
//! | 10+N | 1 | CRC-8 over bytes `0..10+N` |

use std::fmt;

use crate::error::{GcsError, Result};
use crate::uavobject::ObjectKey;

/// UAVTalk sync byte
pub const UAVTALK_SYNC_BYTE: u8 = 0x3C;

/// Sync + type + length + object id + instance id
pub const UAVTALK_HEADER_LENGTH: usize = 10;

/// Low bits of the type byte carrying the packet kind
pub const UAVTALK_TYPE_MASK: u8 = 0x07;

/// High bits of the type byte, reserved for the protocol version
pub const UAVTALK_VERSION_MASK: u8 = !UAVTALK_TYPE_MASK;

/// Largest payload any packet may carry
pub const UAVTALK_MAX_PAYLOAD_SIZE: usize = crate::uavobject::MAX_PAYLOAD_SIZE;

/// Largest complete frame: header + payload + CRC
pub const UAVTALK_MAX_PACKET_LENGTH: usize = UAVTALK_HEADER_LENGTH + UAVTALK_MAX_PAYLOAD_SIZE + 1;

/// Packet kind, the low 3 bits of the type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    /// Object data, no reply expected
    Obj = 0,
    /// Request for object data
    ObjReq = 1,
    /// Object data that must be acknowledged
    ObjAck = 2,
    Ack = 3,
    Nack = 4,
}

impl PacketKind {
    /// OBJ and OBJ_ACK carry the packed object; the rest carry nothing
    pub const fn carries_payload(self) -> bool {
        matches!(self, PacketKind::Obj | PacketKind::ObjAck)
    }
}

impl TryFrom<u8> for PacketKind {
    type Error = GcsError;

    /// Decode the kind from a full type byte, ignoring the version bits
    fn try_from(type_byte: u8) -> Result<Self> {
        match type_byte & UAVTALK_TYPE_MASK {
            0 => Ok(PacketKind::Obj),
            1 => Ok(PacketKind::ObjReq),
            2 => Ok(PacketKind::ObjAck),
            3 => Ok(PacketKind::Ack),
            4 => Ok(PacketKind::Nack),
            other => Err(GcsError::Protocol(format!("Invalid packet kind: {}", other))),
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketKind::Obj => "OBJ",
            PacketKind::ObjReq => "OBJ_REQ",
            PacketKind::ObjAck => "OBJ_ACK",
            PacketKind::Ack => "ACK",
            PacketKind::Nack => "NACK",
        };
        f.write_str(name)
    }
}

/// A decoded (or to-be-encoded) UAVTalk packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub object_id: u32,
    pub instance_id: u16,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet, checking the payload against the kind
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - a payload is given for ACK, NACK or OBJ_REQ
    /// - the payload exceeds [`UAVTALK_MAX_PAYLOAD_SIZE`]
    pub fn new(kind: PacketKind, object_id: u32, instance_id: u16, payload: Vec<u8>) -> Result<Self> {
        if !kind.carries_payload() && !payload.is_empty() {
            return Err(GcsError::Protocol(format!(
                "{} packets carry no payload, got {} bytes",
                kind,
                payload.len()
            )));
        }
        if payload.len() > UAVTALK_MAX_PAYLOAD_SIZE {
            return Err(GcsError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                payload.len(),
                UAVTALK_MAX_PAYLOAD_SIZE
            )));
        }

        Ok(Self {
            kind,
            object_id,
            instance_id,
            payload,
        })
    }

    /// Payload-less packet (OBJ_REQ, ACK, NACK) addressed to `key`
    pub fn control(kind: PacketKind, key: ObjectKey) -> Self {
        Self {
            kind,
            object_id: key.object_id,
            instance_id: key.instance_id,
            payload: Vec::new(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.object_id, self.instance_id)
    }

    /// Value of the length field: header plus payload
    ///
    /// Cannot overflow since the payload is bounded at construction.
    pub fn length(&self) -> u16 {
        (UAVTALK_HEADER_LENGTH + self.payload.len()) as u16
    }
}
