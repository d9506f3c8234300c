//! # Object Metadata
//!
//! Per-object telemetry policy, carried by the object's metaobject.
//!
//! ## Wire Layout (20 bytes, little-endian)
//!
//! | Offset | Size | Content |
//! |--------|------|---------|
//! | 0 | 1 | flight access |
//! | 1 | 1 | GCS access |
//! | 2 | 1 | flight telemetry acked |
//! | 3 | 1 | GCS telemetry acked |
//! | 4 | 1 | flight telemetry update mode |
//! | 5 | 1 | GCS telemetry update mode |
//! | 6 | 1 | logging update mode |
//! | 7 | 1 | reserved, zero |
//! | 8 | 4 | flight telemetry update period (ms) |
//! | 12 | 4 | GCS telemetry update period (ms) |
//! | 16 | 4 | logging update period (ms) |

use crate::error::{GcsError, Result};

/// Serialized size of a metadata record
pub const METADATA_NUM_BYTES: usize = 20;

/// Who may write an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    ReadWrite = 0,
    ReadOnly = 1,
}

impl TryFrom<u8> for AccessMode {
    type Error = GcsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(AccessMode::ReadWrite),
            1 => Ok(AccessMode::ReadOnly),
            other => Err(GcsError::ValueOutOfRange {
                field: "access".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// When an object is transmitted or logged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateMode {
    /// Every update period
    Periodic = 0,
    /// Whenever the object is updated locally
    OnChange = 1,
    /// Only on explicit request
    Manual = 2,
    Never = 3,
}

impl TryFrom<u8> for UpdateMode {
    type Error = GcsError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(UpdateMode::Periodic),
            1 => Ok(UpdateMode::OnChange),
            2 => Ok(UpdateMode::Manual),
            3 => Ok(UpdateMode::Never),
            other => Err(GcsError::ValueOutOfRange {
                field: "update mode".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Telemetry policy for one object, for both link ends plus logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Metadata {
    pub flight_access: AccessMode,
    pub gcs_access: AccessMode,
    pub flight_telemetry_acked: bool,
    pub gcs_telemetry_acked: bool,
    pub flight_telemetry_update_mode: UpdateMode,
    pub gcs_telemetry_update_mode: UpdateMode,
    pub logging_update_mode: UpdateMode,
    pub flight_telemetry_update_period: u16,
    pub gcs_telemetry_update_period: u16,
    pub logging_update_period: u16,
}

impl Metadata {
    /// Default policy of a settings-class object: acked, sent on change
    pub const fn settings_default() -> Self {
        Self {
            flight_access: AccessMode::ReadWrite,
            gcs_access: AccessMode::ReadWrite,
            flight_telemetry_acked: true,
            gcs_telemetry_acked: true,
            flight_telemetry_update_mode: UpdateMode::OnChange,
            gcs_telemetry_update_mode: UpdateMode::OnChange,
            logging_update_mode: UpdateMode::Never,
            flight_telemetry_update_period: 0,
            gcs_telemetry_update_period: 0,
            logging_update_period: 0,
        }
    }

    /// Default policy of a data-class object: streamed by the flight side,
    /// sent by the GCS only on request
    pub const fn data_default() -> Self {
        Self {
            flight_access: AccessMode::ReadWrite,
            gcs_access: AccessMode::ReadWrite,
            flight_telemetry_acked: false,
            gcs_telemetry_acked: false,
            flight_telemetry_update_mode: UpdateMode::Periodic,
            gcs_telemetry_update_mode: UpdateMode::Manual,
            logging_update_mode: UpdateMode::Never,
            flight_telemetry_update_period: 1000,
            gcs_telemetry_update_period: 0,
            logging_update_period: 0,
        }
    }

    /// Fixed policy of every metaobject
    pub const fn metaobject_default() -> Self {
        Self::settings_default()
    }

    /// Serialize into the 20-byte wire layout
    pub fn pack(&self) -> [u8; METADATA_NUM_BYTES] {
        let mut buf = [0u8; METADATA_NUM_BYTES];
        buf[0] = self.flight_access as u8;
        buf[1] = self.gcs_access as u8;
        buf[2] = self.flight_telemetry_acked as u8;
        buf[3] = self.gcs_telemetry_acked as u8;
        buf[4] = self.flight_telemetry_update_mode as u8;
        buf[5] = self.gcs_telemetry_update_mode as u8;
        buf[6] = self.logging_update_mode as u8;
        buf[8..12].copy_from_slice(&(self.flight_telemetry_update_period as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&(self.gcs_telemetry_update_period as u32).to_le_bytes());
        buf[16..20].copy_from_slice(&(self.logging_update_period as u32).to_le_bytes());
        buf
    }

    /// Deserialize from the 20-byte wire layout
    ///
    /// # Errors
    ///
    /// - `BufferTooShort` if fewer than 20 bytes are given
    /// - `ValueOutOfRange` for an unknown access/update-mode code or a period
    ///   that does not fit 16 bits
    pub fn unpack(buf: &[u8]) -> Result<Self> {
        if buf.len() < METADATA_NUM_BYTES {
            return Err(GcsError::BufferTooShort {
                needed: METADATA_NUM_BYTES,
                available: buf.len(),
            });
        }

        Ok(Self {
            flight_access: AccessMode::try_from(buf[0])?,
            gcs_access: AccessMode::try_from(buf[1])?,
            flight_telemetry_acked: buf[2] != 0,
            gcs_telemetry_acked: buf[3] != 0,
            flight_telemetry_update_mode: UpdateMode::try_from(buf[4])?,
            gcs_telemetry_update_mode: UpdateMode::try_from(buf[5])?,
            logging_update_mode: UpdateMode::try_from(buf[6])?,
            flight_telemetry_update_period: period(&buf[8..12])?,
            gcs_telemetry_update_period: period(&buf[12..16])?,
            logging_update_period: period(&buf[16..20])?,
        })
    }
}

fn period(bytes: &[u8]) -> Result<u16> {
    let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    u16::try_from(raw).map_err(|_| GcsError::ValueOutOfRange {
        field: "update period".to_string(),
        value: raw.to_string(),
    })
}
