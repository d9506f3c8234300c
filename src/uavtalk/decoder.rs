//! # UAVTalk Packet Decoder
//!
//! Byte-at-a-time state machine:
//!
//! ```text
//! SYNC → TYPE → LEN_LO → LEN_HI → OID[4] → INST_LO → INST_HI → PAYLOAD[N] → CRC
//! ```
//!
//! Bytes that arrive while waiting for a sync byte are skipped. Any error
//! (bad kind, impossible length, CRC mismatch) drops the partial packet and
//! returns the decoder to SYNC; the error is reported so the caller can
//! count it, and decoding continues with the next byte.

use super::crc::crc8;
use super::protocol::*;
use crate::error::{GcsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sync,
    Type,
    LengthLow,
    LengthHigh,
    ObjectId,
    InstanceLow,
    InstanceHigh,
    Payload,
    Crc,
}

/// Incremental UAVTalk decoder
#[derive(Debug)]
pub struct Decoder {
    state: State,
    max_payload: usize,
    kind: PacketKind,
    length: usize,
    frame: Vec<u8>,
}

impl Decoder {
    /// Create a decoder accepting payloads up to `max_payload` bytes
    ///
    /// The limit is clamped to [`UAVTALK_MAX_PAYLOAD_SIZE`].
    pub fn new(max_payload: usize) -> Self {
        Self {
            state: State::Sync,
            max_payload: max_payload.min(UAVTALK_MAX_PAYLOAD_SIZE),
            kind: PacketKind::Obj,
            length: 0,
            frame: Vec::with_capacity(UAVTALK_MAX_PACKET_LENGTH),
        }
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Change the payload limit, e.g. after new object types were registered
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = max_payload.min(UAVTALK_MAX_PAYLOAD_SIZE);
    }

    /// Drop any partial packet
    pub fn reset(&mut self) {
        self.state = State::Sync;
        self.frame.clear();
    }

    /// True while no packet is partially received
    pub fn is_idle(&self) -> bool {
        self.state == State::Sync
    }

    /// Feed one byte
    ///
    /// # Returns
    ///
    /// * `None` - more bytes are needed
    /// * `Some(Ok(packet))` - a complete, CRC-valid packet
    /// * `Some(Err(_))` - the partial packet was dropped
    pub fn push(&mut self, byte: u8) -> Option<Result<Packet>> {
        match self.state {
            State::Sync => {
                if byte == UAVTALK_SYNC_BYTE {
                    self.frame.clear();
                    self.frame.push(byte);
                    self.state = State::Type;
                }
                None
            }
            State::Type => {
                self.frame.push(byte);
                match PacketKind::try_from(byte) {
                    Ok(kind) => {
                        self.kind = kind;
                        self.state = State::LengthLow;
                        None
                    }
                    Err(e) => self.fail(e),
                }
            }
            State::LengthLow => {
                self.frame.push(byte);
                self.state = State::LengthHigh;
                None
            }
            State::LengthHigh => {
                self.frame.push(byte);
                self.length = u16::from_le_bytes([self.frame[2], byte]) as usize;
                if let Err(e) = self.check_length() {
                    return self.fail(e);
                }
                self.state = State::ObjectId;
                None
            }
            State::ObjectId => {
                self.frame.push(byte);
                if self.frame.len() == 8 {
                    self.state = State::InstanceLow;
                }
                None
            }
            State::InstanceLow => {
                self.frame.push(byte);
                self.state = State::InstanceHigh;
                None
            }
            State::InstanceHigh => {
                self.frame.push(byte);
                self.state = if self.length > UAVTALK_HEADER_LENGTH {
                    State::Payload
                } else {
                    State::Crc
                };
                None
            }
            State::Payload => {
                self.frame.push(byte);
                if self.frame.len() == self.length {
                    self.state = State::Crc;
                }
                None
            }
            State::Crc => {
                let expected = crc8(&self.frame);
                self.state = State::Sync;
                if byte != expected {
                    return Some(Err(GcsError::Protocol(format!(
                        "CRC mismatch: expected 0x{:02X}, got 0x{:02X}",
                        expected, byte
                    ))));
                }
                Some(Ok(self.finish()))
            }
        }
    }

    /// Feed a chunk, collecting every outcome in order
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Packet>> {
        data.iter().filter_map(|&byte| self.push(byte)).collect()
    }

    fn check_length(&self) -> Result<()> {
        let max = UAVTALK_HEADER_LENGTH + self.max_payload;
        if self.length < UAVTALK_HEADER_LENGTH || self.length > max {
            return Err(GcsError::Protocol(format!(
                "Invalid packet length {} (expected {}..={})",
                self.length, UAVTALK_HEADER_LENGTH, max
            )));
        }
        if !self.kind.carries_payload() && self.length != UAVTALK_HEADER_LENGTH {
            return Err(GcsError::Protocol(format!(
                "{} packet with payload length {}",
                self.kind,
                self.length - UAVTALK_HEADER_LENGTH
            )));
        }
        Ok(())
    }

    fn fail(&mut self, error: GcsError) -> Option<Result<Packet>> {
        self.reset();
        Some(Err(error))
    }

    fn finish(&mut self) -> Packet {
        let f = &self.frame;
        let packet = Packet {
            kind: self.kind,
            object_id: u32::from_le_bytes([f[4], f[5], f[6], f[7]]),
            instance_id: u16::from_le_bytes([f[8], f[9]]),
            payload: f[UAVTALK_HEADER_LENGTH..].to_vec(),
        };
        self.frame.clear();
        packet
    }
}

/// Decode one complete frame
///
/// # Arguments
///
/// * `frame` - Frame bytes from the sync byte through the CRC
/// * `max_payload` - Largest payload accepted
///
/// # Errors
///
/// Returns error if:
/// - Frame does not start with the sync byte
/// - Kind, length or CRC are invalid
/// - Frame ends before the packet is complete
pub fn decode_packet(frame: &[u8], max_payload: usize) -> Result<Packet> {
    match frame.first() {
        Some(&UAVTALK_SYNC_BYTE) => {}
        Some(&other) => {
            return Err(GcsError::Protocol(format!("Invalid sync byte: 0x{:02X}", other)));
        }
        None => return Err(GcsError::Protocol("Frame too short".to_string())),
    }

    let mut decoder = Decoder::new(max_payload);
    for &byte in frame {
        if let Some(result) = decoder.push(byte) {
            return result;
        }
    }
    Err(GcsError::Protocol(format!(
        "Frame too short: {} bytes",
        frame.len()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uavobject::{FieldValue, UavObject};
    use crate::uavobjects::{ahrs_settings, AhrsSettings};
    use crate::uavtalk::encoder::{encode_object, encode_packet};

    fn ahrs_frame() -> (UavObject, Vec<u8>) {
        let obj = UavObject::new(&AhrsSettings).unwrap();
        obj.set_value("Algorithm", 0, "INSGPS_OUTDOOR").unwrap();
        obj.set_value("UpdatePeriod", 0, 5).unwrap();
        let frame = encode_object(PacketKind::Obj, &obj, 0).unwrap().to_vec();
        (obj, frame)
    }

    #[test]
    fn test_round_trip_ahrs_settings() {
        let (_, frame) = ahrs_frame();
        let mut decoder = Decoder::new(256);
        let results = decoder.feed(&frame);
        assert_eq!(results.len(), 1);

        let packet = results.into_iter().next().unwrap().unwrap();
        assert_eq!(packet.kind, PacketKind::Obj);
        assert_eq!(packet.object_id, ahrs_settings::OBJECT_ID);
        assert_eq!(packet.instance_id, 0);

        let received = UavObject::new(&AhrsSettings).unwrap();
        received.unpack(&packet.payload).unwrap();
        assert_eq!(received.get_value("Algorithm", 0).unwrap().as_str(), Some("INSGPS_OUTDOOR"));
        assert_eq!(received.get_value("UpdatePeriod", 0).unwrap(), FieldValue::UInt8(5));
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let (_, frame) = ahrs_frame();
        let whole = decode_packet(&frame, 256).unwrap();

        for split in 1..frame.len() {
            let mut decoder = Decoder::new(256);
            assert!(decoder.feed(&frame[..split]).is_empty());
            let results = decoder.feed(&frame[split..]);
            assert_eq!(results.len(), 1, "split at {}", split);
            assert_eq!(results[0].as_ref().unwrap(), &whole);
        }
    }

    #[test]
    fn test_garbage_before_sync_is_skipped() {
        let (_, frame) = ahrs_frame();
        let mut stream = vec![0x00, 0xFF, 0x12, 0x99];
        stream.extend_from_slice(&frame);

        let mut decoder = Decoder::new(256);
        let results = decoder.feed(&stream);
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
    }

    #[test]
    fn test_crc_flip_drops_packet_and_resyncs() {
        let (_, frame) = ahrs_frame();
        let mut corrupted = frame.clone();
        corrupted[4] ^= 0x01;

        let mut decoder = Decoder::new(256);
        let results = decoder.feed(&corrupted);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(GcsError::Protocol(_))));

        let results = decoder.feed(&frame);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().object_id, ahrs_settings::OBJECT_ID);
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let (_, frame) = ahrs_frame();
        for byte in 1..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte] ^= 1 << bit;
                let mut decoder = Decoder::new(256);
                let accepted = decoder.feed(&corrupted).into_iter().any(|r| r.is_ok());
                assert!(!accepted, "flip at byte {} bit {} accepted", byte, bit);
            }
        }
    }

    #[test]
    fn test_oversize_length_resyncs() {
        let (_, frame) = ahrs_frame();
        let mut stream = vec![UAVTALK_SYNC_BYTE, 0x00, 0x00, 0x02, 0x11, 0x22];
        stream.extend_from_slice(&frame);

        let mut decoder = Decoder::new(16);
        let results = decoder.feed(&stream);
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert!(results[1].is_ok());
    }

    #[test]
    fn test_length_above_known_objects_rejected() {
        let (_, frame) = ahrs_frame();
        let mut decoder = Decoder::new(15);
        let results = decoder.feed(&frame);
        assert!(matches!(results.first(), Some(Err(GcsError::Protocol(_)))));

        decoder.set_max_payload(1000);
        assert_eq!(decoder.max_payload(), UAVTALK_MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_invalid_kind_rejected() {
        let mut decoder = Decoder::new(256);
        assert!(decoder.push(UAVTALK_SYNC_BYTE).is_none());
        assert!(matches!(decoder.push(0x07), Some(Err(_))));
        assert!(decoder.is_idle());
    }

    #[test]
    fn test_control_packet_with_payload_rejected() {
        let mut frame = vec![UAVTALK_SYNC_BYTE, PacketKind::Ack as u8, 12, 0];
        frame.extend_from_slice(&[0u8; 9]);
        assert!(decode_packet(&frame, 256).is_err());
    }

    #[test]
    fn test_version_bits_ignored() {
        let packet = Packet::new(PacketKind::ObjReq, 0x02B8_2102, 3, Vec::new()).unwrap();
        let frame = encode_packet(&packet, 0x20);
        assert_eq!(decode_packet(&frame, 0).unwrap(), packet);
    }

    #[test]
    fn test_decode_packet_errors() {
        assert!(decode_packet(&[], 256).is_err());
        assert!(decode_packet(&[0xFF, 0x00], 256).is_err());

        let (_, frame) = ahrs_frame();
        assert!(decode_packet(&frame[..frame.len() - 1], 256).is_err());
    }
}
