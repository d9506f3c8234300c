//! Link statistics counters

use serde::Serialize;

/// Byte, object and error counts for one telemetry link
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TalkStats {
    /// Bytes written to the transport, framing included
    pub tx_bytes: u64,
    /// Bytes read from the transport, garbage included
    pub rx_bytes: u64,
    /// Payload bytes of transmitted objects
    pub tx_object_bytes: u64,
    /// Payload bytes of accepted objects
    pub rx_object_bytes: u64,
    pub tx_objects: u64,
    pub rx_objects: u64,
    /// Transport write failures
    pub tx_errors: u64,
    /// Decode errors and payload size mismatches
    pub rx_errors: u64,
}

impl TalkStats {
    pub(crate) fn record_tx_object(&mut self, payload_len: usize) {
        self.tx_objects += 1;
        self.tx_object_bytes += payload_len as u64;
    }

    pub(crate) fn record_rx_object(&mut self, payload_len: usize) {
        self.rx_objects += 1;
        self.rx_object_bytes += payload_len as u64;
    }
}
