//! # Outbound Queue
//!
//! Work waiting for the writer. Object emissions are queued by key and
//! packed only when the writer takes them, so an object updated several
//! times while the writer is behind goes out once, with its latest value.

use bytes::Bytes;
use std::collections::VecDeque;

use crate::uavobject::ObjectKey;

/// One unit of outbound work
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send the object's current value (OBJ or OBJ_ACK per its metadata)
    Update(ObjectKey),
    /// Send OBJ_REQ for the object
    Request(ObjectKey),
    /// Send a ready-made frame (ACK, NACK, retries)
    Packet(Bytes),
    /// Send a frame built by the direct API
    Direct {
        key: ObjectKey,
        frame: Bytes,
        /// Object payload size for OBJ and OBJ_ACK, `None` for OBJ_REQ
        object_bytes: Option<usize>,
        /// A transaction is reserved for `key` and starts with this frame
        transaction: bool,
    },
}

impl Outbound {
    fn key(&self) -> Option<ObjectKey> {
        match self {
            Outbound::Update(key) | Outbound::Request(key) => Some(*key),
            Outbound::Packet(_) | Outbound::Direct { .. } => None,
        }
    }

    fn coalesces(&self) -> bool {
        matches!(self, Outbound::Update(_) | Outbound::Request(_))
    }
}

/// FIFO of outbound work plus items parked behind a busy transaction
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: VecDeque<Outbound>,
    deferred: Vec<Outbound>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `item` unless an identical emission is already waiting
    ///
    /// Returns `false` when the item was merged into an existing one.
    pub fn push(&mut self, item: Outbound) -> bool {
        if item.coalesces() && self.items.contains(&item) {
            return false;
        }
        self.items.push_back(item);
        true
    }

    pub fn pop(&mut self) -> Option<Outbound> {
        self.items.pop_front()
    }

    /// Park an emission until the transaction on its key finishes
    pub fn defer(&mut self, item: Outbound) {
        if !self.deferred.contains(&item) {
            self.deferred.push(item);
        }
    }

    /// Move every parked emission for `key` back into the queue
    pub fn release(&mut self, key: ObjectKey) -> usize {
        let (ready, parked): (Vec<_>, Vec<_>) = std::mem::take(&mut self.deferred)
            .into_iter()
            .partition(|item| item.key() == Some(key));
        self.deferred = parked;

        let count = ready.len();
        for item in ready {
            self.push(item);
        }
        count
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    /// Drop queued and parked work alike
    pub fn clear(&mut self) {
        self.items.clear();
        self.deferred.clear();
    }
}
