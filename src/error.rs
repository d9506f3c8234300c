//! # Error Types
//!
//! Custom error types for the UAVTalk GCS using `thiserror`.

use thiserror::Error;

/// Main error type for the UAVTalk GCS
#[derive(Debug, Error)]
pub enum GcsError {
    /// UAVTalk framing errors (bad CRC, impossible length, truncated packet)
    #[error("UAVTalk protocol error: {0}")]
    Protocol(String),

    /// Type id not present in the object catalog
    #[error("unknown object 0x{0:08X}")]
    UnknownObject(u32),

    /// Instance id not registered for a known type
    #[error("unknown instance {instance} of object 0x{object_id:08X}")]
    UnknownInstance { object_id: u32, instance: u16 },

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("field '{field}' has no element named '{element}'")]
    UnknownElement { field: String, element: String },

    #[error("element index {index} out of range for field '{field}' ({count} elements)")]
    ElementOutOfRange {
        field: String,
        index: usize,
        count: usize,
    },

    #[error("field '{field}' has no option '{option}'")]
    UnknownOption { field: String, option: String },

    #[error("value {value} out of range for field '{field}'")]
    ValueOutOfRange { field: String, value: String },

    #[error("field '{field}' of type {expected} cannot hold {found}")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },

    #[error("buffer too short: need {needed} bytes, have {available}")]
    BufferTooShort { needed: usize, available: usize },

    /// Local write to an object whose GCS access is read-only
    #[error("object {0} is read-only for the GCS")]
    AccessDenied(String),

    #[error("object {name} instance {instance} is already registered")]
    Duplicate { name: String, instance: u16 },

    #[error("object {0} is single-instance")]
    SingleInstance(String),

    /// A transaction for the same object instance is still in flight
    #[error("transaction already pending for {0}")]
    Busy(String),

    /// Object catalog is internally inconsistent
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link closed by peer")]
    LinkClosed,
}

/// Result type alias for the UAVTalk GCS
pub type Result<T> = std::result::Result<T, GcsError>;
