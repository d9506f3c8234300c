//! # UAVTalk Protocol Module
//!
//! Framing for the object exchange with the flight controller.
//!
//! This module handles:
//! - Packet encoding for the five packet kinds
//! - Byte-at-a-time decoding with resynchronization
//! - CRC-8 (poly 0x07) checksum calculation

pub mod crc;
pub mod decoder;
pub mod encoder;
pub mod protocol;

pub use decoder::{decode_packet, Decoder};
pub use encoder::{encode_object, encode_packet};
pub use protocol::{Packet, PacketKind};
