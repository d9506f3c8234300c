//! # UAVTalk Packet Encoder
//!
//! Frames packets for the wire.

use bytes::{BufMut, Bytes, BytesMut};

use super::crc::crc8;
use super::protocol::*;
use crate::error::{GcsError, Result};
use crate::uavobject::UavObject;

/// Encode a packet into a complete frame
///
/// `type_version` supplies the high bits of the type byte; its low 3 bits
/// must be clear.
///
/// # Examples
///
/// ```
/// use uavtalk_gcs::uavtalk::encoder::encode_packet;
/// use uavtalk_gcs::uavtalk::protocol::{Packet, PacketKind};
///
/// let packet = Packet::new(PacketKind::ObjReq, 0xDEFC5548, 0, Vec::new())?;
/// let frame = encode_packet(&packet, 0x00);
/// assert_eq!(frame.len(), 11);
/// assert_eq!(&frame[..4], &[0x3C, 0x01, 0x0A, 0x00]);
/// # Ok::<(), uavtalk_gcs::error::GcsError>(())
/// ```
pub fn encode_packet(packet: &Packet, type_version: u8) -> Bytes {
    let mut frame = BytesMut::with_capacity(UAVTALK_HEADER_LENGTH + packet.payload.len() + 1);

    frame.put_u8(UAVTALK_SYNC_BYTE);
    frame.put_u8((type_version & UAVTALK_VERSION_MASK) | packet.kind as u8);
    frame.put_u16_le(packet.length());
    frame.put_u32_le(packet.object_id);
    frame.put_u16_le(packet.instance_id);
    frame.put_slice(&packet.payload);

    let crc = crc8(&frame);
    frame.put_u8(crc);

    frame.freeze()
}

/// Build the packet of `kind` for an object
///
/// OBJ and OBJ_ACK carry the object's packed fields, other kinds are
/// header only.
pub fn object_packet(kind: PacketKind, obj: &UavObject) -> Result<Packet> {
    let payload = if kind.carries_payload() {
        obj.pack()
    } else {
        Vec::new()
    };
    Packet::new(kind, obj.object_id(), obj.instance_id(), payload)
}

/// Encode `kind` for an object into a complete frame
pub fn encode_object(kind: PacketKind, obj: &UavObject, type_version: u8) -> Result<Bytes> {
    if type_version & UAVTALK_TYPE_MASK != 0 {
        return Err(GcsError::Protocol(format!(
            "Type version 0x{:02X} overlaps the kind bits",
            type_version
        )));
    }
    Ok(encode_packet(&object_packet(kind, obj)?, type_version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uavobjects::AhrsSettings;

    #[test]
    fn test_encode_header_layout() {
        let packet = Packet::new(PacketKind::ObjAck, 0x1234_5678, 0x0102, vec![0xAA, 0xBB]).unwrap();
        let frame = encode_packet(&packet, 0x20);

        assert_eq!(frame.len(), 13);
        assert_eq!(frame[0], UAVTALK_SYNC_BYTE);
        assert_eq!(frame[1], 0x22);
        assert_eq!(&frame[2..4], &[12, 0]);
        assert_eq!(&frame[4..8], &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(&frame[8..10], &[0x02, 0x01]);
        assert_eq!(&frame[10..12], &[0xAA, 0xBB]);
        assert_eq!(frame[12], crc8(&frame[..12]));
    }

    #[test]
    fn test_encode_object_payload() {
        let obj = UavObject::new(&AhrsSettings).unwrap();
        let frame = encode_object(PacketKind::Obj, &obj, 0).unwrap();
        assert_eq!(frame.len(), UAVTALK_HEADER_LENGTH + 16 + 1);
        assert_eq!(&frame[10..26], obj.pack().as_slice());

        let request = encode_object(PacketKind::ObjReq, &obj, 0).unwrap();
        assert_eq!(request.len(), UAVTALK_HEADER_LENGTH + 1);
        assert_eq!(&request[2..4], &[10, 0]);
    }

    #[test]
    fn test_encode_object_rejects_bad_version() {
        let obj = UavObject::new(&AhrsSettings).unwrap();
        assert!(encode_object(PacketKind::Obj, &obj, 0x03).is_err());
    }
}
