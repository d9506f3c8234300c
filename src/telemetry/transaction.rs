//! # Transaction Table
//!
//! Tracks acked writes (OBJ_ACK awaiting ACK) and requests (OBJ_REQ awaiting
//! OBJ) per object instance. At most one transaction may be pending for a
//! given (type id, instance id).
//!
//! Each transaction is sent up to `attempts` times, `timeout` apart, before
//! it fails. A reserved transaction has no deadline until its first frame
//! is handed to the writer.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{GcsError, Result};
use crate::uavobject::{ObjectKey, UavObject};
use crate::uavtalk::PacketKind;

/// What a pending transaction waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// OBJ_REQ sent, waiting for OBJ or OBJ_ACK
    Request,
    /// OBJ_ACK sent, waiting for ACK
    WriteAcked,
}

impl TransactionKind {
    /// Whether an inbound packet of `reply` answers this transaction
    pub fn matches(self, reply: PacketKind) -> bool {
        match (self, reply) {
            (_, PacketKind::Nack) => true,
            (TransactionKind::WriteAcked, PacketKind::Ack) => true,
            (TransactionKind::Request, PacketKind::Obj | PacketKind::ObjAck) => true,
            _ => false,
        }
    }
}

#[derive(Debug)]
struct Pending {
    object: Arc<UavObject>,
    kind: TransactionKind,
    packet: Bytes,
    expires_at: Option<Instant>,
    attempts_remaining: u8,
}

/// Outcome of a timeout
#[derive(Debug)]
pub enum Expired {
    /// Send this frame again
    Retry(Bytes),
    /// Out of attempts; the transaction is gone
    Failed(Arc<UavObject>),
}

/// Pending transactions keyed by object instance
#[derive(Debug)]
pub struct TransactionTable {
    pending: BTreeMap<ObjectKey, Pending>,
    timeout: Duration,
    attempts: u8,
}

impl TransactionTable {
    /// `attempts` counts every transmission, the first included
    pub fn new(timeout: Duration, attempts: u8) -> Self {
        Self {
            pending: BTreeMap::new(),
            timeout,
            attempts: attempts.max(1),
        }
    }

    /// Record that `packet` is being sent for `object` at `now`
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a transaction is already pending for the same
    /// object instance.
    pub fn begin(
        &mut self,
        object: Arc<UavObject>,
        kind: TransactionKind,
        packet: Bytes,
        now: Instant,
    ) -> Result<()> {
        let key = object.key();
        self.reserve(object, kind, packet)?;
        self.mark_sent(key, now);
        Ok(())
    }

    /// Claim the object instance for a transaction whose first frame is
    /// still queued
    ///
    /// The transaction cannot time out until [`mark_sent`](Self::mark_sent).
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a transaction is already pending for the same
    /// object instance.
    pub fn reserve(&mut self, object: Arc<UavObject>, kind: TransactionKind, packet: Bytes) -> Result<()> {
        let key = object.key();
        if self.pending.contains_key(&key) {
            return Err(GcsError::Busy(format!("{} {}", object.name(), key)));
        }

        debug!("Transaction {:?} started for {} {}", kind, object.name(), key);
        self.pending.insert(
            key,
            Pending {
                object,
                kind,
                packet,
                expires_at: None,
                attempts_remaining: self.attempts - 1,
            },
        );
        Ok(())
    }

    /// Start the timeout of a reserved transaction
    ///
    /// Returns `false` if nothing is reserved for `key` or its clock is
    /// already running.
    pub fn mark_sent(&mut self, key: ObjectKey, now: Instant) -> bool {
        match self.pending.get_mut(&key) {
            Some(pending) if pending.expires_at.is_none() => {
                pending.expires_at = Some(now + self.timeout);
                true
            }
            _ => false,
        }
    }

    /// Resolve the transaction for `key` with an inbound packet of `reply`
    ///
    /// Returns the object and whether the transaction succeeded, or `None`
    /// if nothing pending matches.
    pub fn complete(&mut self, key: ObjectKey, reply: PacketKind) -> Option<(Arc<UavObject>, bool)> {
        let kind = self.pending.get(&key)?.kind;
        if !kind.matches(reply) {
            return None;
        }

        let pending = self.pending.remove(&key)?;
        let success = reply != PacketKind::Nack;
        debug!(
            "Transaction {:?} for {} {} completed by {} (success: {})",
            kind,
            pending.object.name(),
            key,
            reply,
            success
        );
        Some((pending.object, success))
    }

    /// Handle every transaction whose deadline has passed
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let mut outcomes = Vec::new();
        let mut failed = Vec::new();

        for (key, pending) in self.pending.iter_mut() {
            match pending.expires_at {
                Some(deadline) if deadline <= now => {}
                _ => continue,
            }
            if pending.attempts_remaining > 0 {
                pending.attempts_remaining -= 1;
                pending.expires_at = Some(now + self.timeout);
                debug!(
                    "Transaction {:?} for {} {} timed out, retrying ({} left)",
                    pending.kind,
                    pending.object.name(),
                    key,
                    pending.attempts_remaining
                );
                outcomes.push(Expired::Retry(pending.packet.clone()));
            } else {
                failed.push(*key);
            }
        }

        for key in failed {
            if let Some(pending) = self.pending.remove(&key) {
                warn!(
                    "Transaction {:?} for {} {} failed after {} attempts",
                    pending.kind,
                    pending.object.name(),
                    key,
                    self.attempts
                );
                outcomes.push(Expired::Failed(pending.object));
            }
        }

        outcomes
    }

    /// Remove every pending transaction, returning their objects
    pub fn drain(&mut self) -> Vec<Arc<UavObject>> {
        std::mem::take(&mut self.pending)
            .into_values()
            .map(|pending| pending.object)
            .collect()
    }

    pub fn is_pending(&self, key: ObjectKey) -> bool {
        self.pending.contains_key(&key)
    }

    /// Earliest deadline among pending transactions
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|pending| pending.expires_at).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
