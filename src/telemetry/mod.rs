//! # Telemetry Module
//!
//! Moves objects between the local [`ObjectManager`] and the flight
//! controller over a UAVTalk link.
//!
//! This module handles:
//! - Decoding inbound bytes and dispatching OBJ, OBJ_REQ, OBJ_ACK, ACK and NACK
//! - Emitting objects according to their GCS telemetry update mode
//! - Acked writes and requests, with timeout and retry
//! - PERIODIC scheduling
//! - Link statistics
//! - Object logging to JSONL files ([`ObjectLogger`])
//!
//! ## Threading
//!
//! [`Telemetry::run`] spawns a reader task and a writer task. Object
//! observers fire on whichever task caused the event: inbound updates on
//! the reader, transaction failures on the writer, local updates on the
//! caller. No engine lock is held while an observer runs.

pub mod logger;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod transaction;

pub use logger::ObjectLogger;
pub use queue::{Outbound, OutboundQueue};
pub use scheduler::PeriodicScheduler;
pub use stats::TalkStats;
pub use transaction::{Expired, TransactionKind, TransactionTable};

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::TelemetryConfig;
use crate::error::{GcsError, Result};
use crate::link::{LinkReader, LinkWriter};
use crate::uavobject::{ObjectKey, ObjectManager, UavObject, UpdateMode, UpdateTrigger};
use crate::uavtalk::protocol::UAVTALK_VERSION_MASK;
use crate::uavtalk::{encode_object, encode_packet, Decoder, Packet, PacketKind};

/// Bytes requested from the link per read
const READ_BUFFER_SIZE: usize = 512;

/// A frame handed to the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub bytes: Bytes,
    /// Object payload size for OBJ and OBJ_ACK emissions
    pub object_bytes: Option<usize>,
}

impl OutboundFrame {
    fn control(bytes: Bytes) -> Self {
        Self { bytes, object_bytes: None }
    }

    fn object(bytes: Bytes, object_bytes: usize) -> Self {
        Self {
            bytes,
            object_bytes: Some(object_bytes),
        }
    }
}

/// UAVTalk engine bound to one object manager
pub struct Telemetry {
    manager: Arc<ObjectManager>,
    type_version: u8,
    tick: Duration,
    decoder: Mutex<Decoder>,
    transactions: Mutex<TransactionTable>,
    queue: Mutex<OutboundQueue>,
    scheduler: Mutex<PeriodicScheduler>,
    stats: Mutex<TalkStats>,
    attached: Mutex<HashSet<ObjectKey>>,
    connected: AtomicBool,
    wake: Notify,
}

impl Telemetry {
    /// Create the engine and subscribe to every object of `manager`
    ///
    /// Objects registered later are picked up through the manager's
    /// new-object and new-instance events.
    pub fn new(manager: Arc<ObjectManager>, config: &TelemetryConfig) -> Arc<Self> {
        let telemetry = Arc::new(Self {
            decoder: Mutex::new(Decoder::new(manager.max_object_size())),
            manager,
            type_version: config.type_version & UAVTALK_VERSION_MASK,
            tick: config.scheduler_tick(),
            transactions: Mutex::new(TransactionTable::new(
                config.transaction_timeout(),
                config.transaction_attempts,
            )),
            queue: Mutex::new(OutboundQueue::new()),
            scheduler: Mutex::new(PeriodicScheduler::new()),
            stats: Mutex::new(TalkStats::default()),
            attached: Mutex::new(HashSet::new()),
            connected: AtomicBool::new(false),
            wake: Notify::new(),
        });

        let weak = Arc::downgrade(&telemetry);
        telemetry.manager.on_new_object(move |obj| {
            if let Some(telemetry) = weak.upgrade() {
                telemetry.attach_object(obj);
            }
        });
        let weak = Arc::downgrade(&telemetry);
        telemetry.manager.on_new_instance(move |obj| {
            if let Some(telemetry) = weak.upgrade() {
                telemetry.attach_object(obj);
            }
        });

        for obj in telemetry.manager.get_objects().into_iter().flatten() {
            telemetry.attach_object(&obj);
        }

        debug!(
            "Telemetry attached to {} objects (max payload {} bytes)",
            telemetry.attached.lock().len(),
            telemetry.decoder.lock().max_payload()
        );
        telemetry
    }

    fn attach_object(self: &Arc<Self>, obj: &Arc<UavObject>) {
        if !self.attached.lock().insert(obj.key()) {
            return;
        }

        {
            let mut decoder = self.decoder.lock();
            if obj.num_bytes() > decoder.max_payload() {
                decoder.set_max_payload(obj.num_bytes());
            }
        }

        let weak = Arc::downgrade(self);
        obj.add_updated_auto_observer(move |o, trigger| {
            if let Some(telemetry) = weak.upgrade() {
                telemetry.on_local_update(o, trigger);
            }
        });
        let weak = Arc::downgrade(self);
        obj.add_update_requested_observer(move |o| {
            if let Some(telemetry) = weak.upgrade() {
                telemetry.enqueue(Outbound::Request(o.key()));
            }
        });
    }

    fn on_local_update(&self, obj: &UavObject, trigger: UpdateTrigger) {
        let mode = obj.metadata().gcs_telemetry_update_mode;
        let emit = match trigger {
            UpdateTrigger::Updated => mode == UpdateMode::OnChange,
            UpdateTrigger::Manual => mode != UpdateMode::Never,
        };
        if emit {
            self.enqueue(Outbound::Update(obj.key()));
        }
    }

    fn enqueue(&self, item: Outbound) {
        if !self.queue.lock().push(item) {
            trace!("Outbound emission coalesced");
        }
        self.wake.notify_one();
    }

    pub fn manager(&self) -> &Arc<ObjectManager> {
        &self.manager
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> TalkStats {
        *self.stats.lock()
    }

    pub fn reset_stats(&self) {
        *self.stats.lock() = TalkStats::default();
    }

    /// Number of acked writes and requests awaiting a reply
    pub fn pending_transactions(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Send the object's current value now, bypassing its update mode
    ///
    /// The value is packed immediately. An acked write's timeout starts
    /// once the writer takes the frame.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if the object is acked and a transaction is already
    /// pending for it.
    pub fn send_object(&self, obj: &Arc<UavObject>) -> Result<()> {
        let acked = obj.metadata().gcs_telemetry_acked;
        let kind = if acked { PacketKind::ObjAck } else { PacketKind::Obj };
        let frame = encode_object(kind, obj, self.type_version)?;

        if acked {
            self.transactions
                .lock()
                .reserve(obj.clone(), TransactionKind::WriteAcked, frame.clone())?;
        }

        self.enqueue(Outbound::Direct {
            key: obj.key(),
            frame,
            object_bytes: Some(obj.num_bytes()),
            transaction: acked,
        });
        Ok(())
    }

    /// Ask the flight side for the object now
    ///
    /// # Errors
    ///
    /// Returns `Busy` if a transaction is already pending for the object.
    pub fn request_object(&self, obj: &Arc<UavObject>) -> Result<()> {
        let frame = encode_object(PacketKind::ObjReq, obj, self.type_version)?;
        self.transactions
            .lock()
            .reserve(obj.clone(), TransactionKind::Request, frame.clone())?;
        self.enqueue(Outbound::Direct {
            key: obj.key(),
            frame,
            object_bytes: None,
            transaction: true,
        });
        Ok(())
    }

    /// Next frame for the writer, or `None` when there is nothing to send
    ///
    /// Object emissions are packed here, so the frame carries the value
    /// current at the time of sending. Transactions carried by the frame
    /// start their timeout at `now`. Call [`record_sent`](Self::record_sent)
    /// once the frame is written.
    pub fn next_outbound(&self, now: Instant) -> Option<OutboundFrame> {
        loop {
            let item = self.queue.lock().pop()?;
            let frame = match item {
                Outbound::Packet(bytes) => Some(OutboundFrame::control(bytes)),
                Outbound::Direct {
                    key,
                    frame,
                    object_bytes,
                    transaction,
                } => {
                    if transaction {
                        self.transactions.lock().mark_sent(key, now);
                    }
                    Some(OutboundFrame {
                        bytes: frame,
                        object_bytes,
                    })
                }
                Outbound::Update(key) => self.prepare_update(key, now),
                Outbound::Request(key) => self.prepare_request(key, now),
            };
            if frame.is_some() {
                return frame;
            }
        }
    }

    /// Count a frame the link accepted
    pub fn record_sent(&self, frame: &OutboundFrame) {
        let mut stats = self.stats.lock();
        stats.tx_bytes += frame.bytes.len() as u64;
        if let Some(object_bytes) = frame.object_bytes {
            stats.record_tx_object(object_bytes);
        }
    }

    fn prepare_update(&self, key: ObjectKey, now: Instant) -> Option<OutboundFrame> {
        let Some(obj) = self.manager.get_object(key.object_id, key.instance_id) else {
            warn!("Dropping update for unregistered object {}", key);
            return None;
        };

        let acked = obj.metadata().gcs_telemetry_acked;
        let kind = if acked { PacketKind::ObjAck } else { PacketKind::Obj };
        let frame = match encode_object(kind, &obj, self.type_version) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode {}: {}", obj.name(), e);
                return None;
            }
        };

        if acked {
            let begun = self.transactions.lock().begin(
                obj.clone(),
                TransactionKind::WriteAcked,
                frame.clone(),
                now,
            );
            if begun.is_err() {
                debug!("{} {} busy, update deferred", obj.name(), key);
                self.queue.lock().defer(Outbound::Update(key));
                return None;
            }
        }

        trace!("Sending {} {} ({})", obj.name(), key, kind);
        Some(OutboundFrame::object(frame, obj.num_bytes()))
    }

    fn prepare_request(&self, key: ObjectKey, now: Instant) -> Option<OutboundFrame> {
        let obj = self.manager.get_object(key.object_id, key.instance_id)?;
        let frame = match encode_object(PacketKind::ObjReq, &obj, self.type_version) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode request for {}: {}", obj.name(), e);
                return None;
            }
        };

        let begun = self.transactions.lock().begin(
            obj.clone(),
            TransactionKind::Request,
            frame.clone(),
            now,
        );
        if begun.is_err() {
            debug!("{} {} busy, request deferred", obj.name(), key);
            self.queue.lock().defer(Outbound::Request(key));
            return None;
        }

        trace!("Requesting {} {}", obj.name(), key);
        Some(OutboundFrame::control(frame))
    }

    /// Retry or fail every transaction whose timeout has passed
    pub fn process_timeouts(&self, now: Instant) {
        let outcomes = self.transactions.lock().expire(now);
        for outcome in outcomes {
            match outcome {
                Expired::Retry(frame) => self.enqueue(Outbound::Packet(frame)),
                Expired::Failed(obj) => self.finish_transaction(&obj, false),
            }
        }
    }

    fn finish_transaction(&self, obj: &UavObject, success: bool) {
        if self.queue.lock().release(obj.key()) > 0 {
            self.wake.notify_one();
        }
        obj.transaction_completed(success);
    }

    /// Queue every PERIODIC object whose GCS period has elapsed
    ///
    /// Does nothing while the link is down.
    pub fn poll_periodic(&self, now: Instant) {
        if !self.is_connected() {
            return;
        }

        for obj in self.manager.get_objects().into_iter().flatten() {
            let metadata = obj.metadata();
            let key = obj.key();
            if metadata.gcs_telemetry_update_mode != UpdateMode::Periodic
                || metadata.gcs_telemetry_update_period == 0
            {
                self.scheduler.lock().forget(key);
                continue;
            }

            let period = Duration::from_millis(metadata.gcs_telemetry_update_period as u64);
            let due = self.scheduler.lock().due(key, period, now);
            if due {
                self.enqueue(Outbound::Update(key));
            }
        }
    }

    /// Decode and dispatch bytes received from the link
    pub fn process_bytes(&self, data: &[u8]) {
        self.stats.lock().rx_bytes += data.len() as u64;

        let results = self.decoder.lock().feed(data);
        for result in results {
            match result {
                Ok(packet) => self.handle_packet(packet),
                Err(e) => {
                    debug!("Dropping malformed packet: {}", e);
                    self.stats.lock().rx_errors += 1;
                }
            }
        }
    }

    fn handle_packet(&self, packet: Packet) {
        trace!(
            "Received {} for 0x{:08X}/{} ({} bytes)",
            packet.kind,
            packet.object_id,
            packet.instance_id,
            packet.payload.len()
        );

        match packet.kind {
            PacketKind::Obj | PacketKind::ObjAck => self.handle_object(packet),
            PacketKind::ObjReq => self.handle_request(packet.key()),
            PacketKind::Ack | PacketKind::Nack => self.handle_reply(packet.key(), packet.kind),
        }
    }

    fn handle_object(&self, packet: Packet) {
        let key = packet.key();
        let acked = packet.kind == PacketKind::ObjAck;

        let Some(num_bytes) = self
            .manager
            .get_instances(key.object_id)
            .first()
            .map(|obj| obj.num_bytes())
        else {
            debug!("{} for unknown object {}", packet.kind, key);
            if acked {
                self.send_control(PacketKind::Nack, key);
            }
            return;
        };

        if packet.payload.len() != num_bytes {
            debug!(
                "Dropping {} for {}: payload {} bytes, expected {}",
                packet.kind,
                key,
                packet.payload.len(),
                num_bytes
            );
            self.stats.lock().rx_errors += 1;
            return;
        }

        let obj = match self.manager.get_or_create_instance(key.object_id, key.instance_id) {
            Ok(obj) => obj,
            Err(e) => {
                debug!("Rejecting {} for {}: {}", packet.kind, key, e);
                self.send_control(PacketKind::Nack, key);
                return;
            }
        };

        if let Err(e) = obj.load(&packet.payload) {
            debug!("Dropping {} for {}: {}", packet.kind, obj.name(), e);
            self.stats.lock().rx_errors += 1;
            return;
        }
        self.stats.lock().record_rx_object(packet.payload.len());

        if acked {
            self.send_control(PacketKind::Ack, key);
        }

        let completed = self.transactions.lock().complete(key, packet.kind);
        if let Some((pending, success)) = completed {
            self.finish_transaction(&pending, success);
        }

        obj.notify_unpacked();
    }

    fn handle_request(&self, key: ObjectKey) {
        if self.manager.get_object(key.object_id, key.instance_id).is_some() {
            self.enqueue(Outbound::Update(key));
        } else {
            debug!("OBJ_REQ for unknown object {}", key);
            self.send_control(PacketKind::Nack, key);
        }
    }

    fn handle_reply(&self, key: ObjectKey, kind: PacketKind) {
        let completed = self.transactions.lock().complete(key, kind);
        match completed {
            Some((obj, true)) => {
                self.finish_transaction(&obj, true);
                obj.notify_updated();
            }
            Some((obj, false)) => {
                warn!("{} {} rejected by peer", obj.name(), key);
                self.finish_transaction(&obj, false);
            }
            None => debug!("Ignoring {} for {} with no pending transaction", kind, key),
        }
    }

    fn send_control(&self, kind: PacketKind, key: ObjectKey) {
        let frame = encode_packet(&Packet::control(kind, key), self.type_version);
        self.enqueue(Outbound::Packet(frame));
    }

    /// Drop the link state: pending transactions fail, queued work is
    /// discarded and PERIODIC objects start over on the next connection
    pub fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let pending = self.transactions.lock().drain();
        self.queue.lock().clear();
        self.scheduler.lock().reset();
        self.decoder.lock().reset();

        if !pending.is_empty() {
            info!("Failing {} pending transactions", pending.len());
        }
        for obj in pending {
            obj.transaction_completed(false);
        }
    }

    /// Serve one link until it fails or `cancel` fires
    ///
    /// Returns `Ok(())` on cancellation, `LinkClosed` when the peer closes
    /// the stream, or the I/O error that ended the link. The engine is shut
    /// down before returning.
    pub async fn run(
        self: &Arc<Self>,
        reader: Box<dyn LinkReader>,
        writer: Box<dyn LinkWriter>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let link = cancel.child_token();
        self.decoder.lock().reset();
        self.scheduler.lock().reset();
        self.connected.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        info!("Telemetry link up");

        let reader_task = {
            let telemetry = self.clone();
            let link = link.clone();
            tokio::spawn(async move {
                let result = telemetry.run_reader(reader, &link).await;
                link.cancel();
                result
            })
        };
        let writer_task = {
            let telemetry = self.clone();
            let link = link.clone();
            tokio::spawn(async move {
                let result = telemetry.run_writer(writer, &link).await;
                link.cancel();
                result
            })
        };

        let (reader_result, writer_result) = tokio::join!(reader_task, writer_task);
        self.shutdown();
        info!("Telemetry link down");

        let reader_result = reader_result.map_err(|e| GcsError::Io(io::Error::other(e)))?;
        let writer_result = writer_result.map_err(|e| GcsError::Io(io::Error::other(e)))?;
        reader_result.and(writer_result)
    }

    async fn run_reader(&self, mut reader: Box<dyn LinkReader>, cancel: &CancellationToken) -> Result<()> {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                read = reader.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        info!("Link closed by peer");
                        return Err(GcsError::LinkClosed);
                    }
                    self.process_bytes(&buf[..n]);
                }
            }
        }
    }

    async fn run_writer(&self, mut writer: Box<dyn LinkWriter>, cancel: &CancellationToken) -> Result<()> {
        loop {
            let now = Instant::now();
            self.process_timeouts(now);
            self.poll_periodic(now);

            let mut wrote = false;
            while let Some(frame) = self.next_outbound(now) {
                if let Err(e) = writer.write_all(&frame.bytes).await {
                    self.stats.lock().tx_errors += 1;
                    warn!("Link write failed: {}", e);
                    return Err(e.into());
                }
                self.record_sent(&frame);
                wrote = true;
            }
            if wrote {
                writer.flush().await?;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.tick) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::port_trait::mocks::RecordingWriter;
    use crate::link::port_trait::MockLinkWriter;
    use crate::link::{StreamReader, StreamWriter};
    use crate::uavobject::{FieldDef, FieldType, FieldValue, ObjectDefinition, SCALAR};
    use crate::uavobjects::{ahrs_settings, catalog, manual_control_settings, ManualControlSettings};
    use crate::uavtalk::decode_packet;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const AHRS: ObjectKey = ObjectKey::new(ahrs_settings::OBJECT_ID, 0);
    const MANUAL: ObjectKey = ObjectKey::new(manual_control_settings::OBJECT_ID, 0);

    struct Waypoint;

    impl ObjectDefinition for Waypoint {
        fn object_id(&self) -> u32 {
            0x1234_5670
        }
        fn name(&self) -> &'static str {
            "Waypoint"
        }
        fn is_single_instance(&self) -> bool {
            false
        }
        fn is_settings(&self) -> bool {
            false
        }
        fn fields(&self) -> &'static [FieldDef] {
            static FIELDS: [FieldDef; 1] = [FieldDef::new("Altitude", "m", FieldType::Float32, SCALAR)];
            &FIELDS
        }
    }

    fn setup() -> (Arc<ObjectManager>, Arc<Telemetry>) {
        let manager = Arc::new(catalog().unwrap());
        let telemetry = Telemetry::new(manager.clone(), &TelemetryConfig::default());
        (manager, telemetry)
    }

    fn object(manager: &ObjectManager, key: ObjectKey) -> Arc<UavObject> {
        manager.get_object(key.object_id, key.instance_id).unwrap()
    }

    /// Take every queued frame as the writer would, counting each as sent
    fn drain(telemetry: &Telemetry, now: Instant) -> Vec<Packet> {
        std::iter::from_fn(|| telemetry.next_outbound(now))
            .map(|frame| {
                telemetry.record_sent(&frame);
                decode_packet(&frame.bytes, 256).unwrap()
            })
            .collect()
    }

    fn frame(kind: PacketKind, key: ObjectKey, payload: Vec<u8>) -> Vec<u8> {
        let packet = Packet::new(kind, key.object_id, key.instance_id, payload).unwrap();
        encode_packet(&packet, 0).to_vec()
    }

    fn completions(obj: &UavObject) -> Arc<Mutex<Vec<bool>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        obj.add_transaction_completed_observer(move |_, success| l.lock().push(success));
        log
    }

    fn update_count(obj: &UavObject) -> Arc<Mutex<usize>> {
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        obj.add_updated_observer(move |_| *c.lock() += 1);
        count
    }

    fn set_gcs_policy(obj: &UavObject, mode: UpdateMode, period: u16, acked: bool) {
        let mut metadata = obj.metadata();
        metadata.gcs_telemetry_update_mode = mode;
        metadata.gcs_telemetry_update_period = period;
        metadata.gcs_telemetry_acked = acked;
        obj.set_metadata(metadata).unwrap();
    }

    #[test]
    fn test_onchange_update_sends_acked_write() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let completed = completions(&ahrs);

        ahrs.set_value("UpdatePeriod", 0, 5u8).unwrap();
        ahrs.updated().unwrap();
        let updates = update_count(&ahrs);

        let now = Instant::now();
        let sent = drain(&telemetry, now);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::ObjAck);
        assert_eq!(sent[0].key(), AHRS);
        assert_eq!(sent[0].payload, ahrs.pack());
        assert_eq!(telemetry.pending_transactions(), 1);

        telemetry.process_bytes(&frame(PacketKind::Ack, AHRS, Vec::new()));
        assert_eq!(*completed.lock(), vec![true]);
        assert_eq!(*updates.lock(), 1);
        assert_eq!(telemetry.pending_transactions(), 0);
    }

    #[test]
    fn test_request_reply_exchange() {
        let (manager, telemetry) = setup();
        let manual = object(&manager, MANUAL);

        let events = Arc::new(Mutex::new(Vec::new()));
        let e = events.clone();
        manual.add_transaction_completed_observer(move |_, ok| e.lock().push(format!("completed:{}", ok)));
        let e = events.clone();
        manual.add_updated_observer(move |_| e.lock().push("updated".to_string()));

        manual.request_update();
        let sent = drain(&telemetry, Instant::now());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::ObjReq);
        assert_eq!(sent[0].key(), MANUAL);
        assert!(sent[0].payload.is_empty());

        let peer = UavObject::new(&ManualControlSettings).unwrap();
        peer.set_value("InputMode", 0, "PPM").unwrap();
        telemetry.process_bytes(&frame(PacketKind::Obj, MANUAL, peer.pack()));

        assert_eq!(*events.lock(), vec!["completed:true", "updated"]);
        assert_eq!(manual.get_value("InputMode", 0).unwrap().as_str(), Some("PPM"));
        assert!(drain(&telemetry, Instant::now()).is_empty());
    }

    #[test]
    fn test_acked_write_retries_then_fails() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let completed = completions(&ahrs);
        let start = Instant::now();

        ahrs.updated().unwrap();
        let mut sent = drain(&telemetry, start);

        for step in 1..=3u64 {
            let now = start + Duration::from_millis(260 * step);
            telemetry.process_timeouts(now);
            sent.extend(drain(&telemetry, now));
        }

        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|p| p.kind == PacketKind::ObjAck && p.key() == AHRS));
        assert_eq!(*completed.lock(), vec![false]);
        assert_eq!(telemetry.pending_transactions(), 0);
    }

    #[test]
    fn test_nack_for_unknown_type() {
        let (manager, telemetry) = setup();
        let types = manager.num_types();
        let unknown = ObjectKey::new(0xDEAD_BEEF, 0);

        telemetry.process_bytes(&frame(PacketKind::ObjReq, unknown, Vec::new()));
        let sent = drain(&telemetry, Instant::now());
        assert_eq!(sent, vec![Packet::control(PacketKind::Nack, unknown)]);
        assert_eq!(manager.num_types(), types);

        // OBJ for an unknown type is dropped without reply, OBJ_ACK is NACKed
        telemetry.process_bytes(&frame(PacketKind::Obj, unknown, vec![1, 2, 3]));
        assert!(drain(&telemetry, Instant::now()).is_empty());
        telemetry.process_bytes(&frame(PacketKind::ObjAck, unknown, vec![1, 2, 3]));
        assert_eq!(
            drain(&telemetry, Instant::now()),
            vec![Packet::control(PacketKind::Nack, unknown)]
        );
        assert!(manager.get_object(0xDEAD_BEEF, 0).is_none());
    }

    #[test]
    fn test_corrupted_packet_fires_nothing() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let updates = update_count(&ahrs);

        let source = UavObject::new(&crate::uavobjects::AhrsSettings).unwrap();
        source.set_value("Algorithm", 0, "INSGPS_OUTDOOR").unwrap();
        source.set_value("UpdatePeriod", 0, 5u8).unwrap();
        let valid = frame(PacketKind::Obj, AHRS, source.pack());
        let mut corrupted = valid.clone();
        corrupted[4] ^= 0x01;

        telemetry.process_bytes(&corrupted);
        assert_eq!(*updates.lock(), 0);
        assert_eq!(ahrs.get_value("Algorithm", 0).unwrap().as_str(), Some("INSGPS_INDOOR_NOMAG"));
        assert_eq!(telemetry.stats().rx_errors, 1);

        telemetry.process_bytes(&valid);
        assert_eq!(*updates.lock(), 1);
        assert_eq!(ahrs.get_value("Algorithm", 0).unwrap().as_str(), Some("INSGPS_OUTDOOR"));
        assert_eq!(ahrs.get_value("UpdatePeriod", 0).unwrap(), FieldValue::UInt8(5));
    }

    #[test]
    fn test_inbound_obj_ack_is_acknowledged() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let mut payload = ahrs.pack();
        payload[1] = 7;

        telemetry.process_bytes(&frame(PacketKind::ObjAck, AHRS, payload));
        assert_eq!(
            drain(&telemetry, Instant::now()),
            vec![Packet::control(PacketKind::Ack, AHRS)]
        );
        assert_eq!(ahrs.get_value("Downsampling", 0).unwrap(), FieldValue::UInt8(7));
    }

    #[test]
    fn test_inbound_update_is_not_echoed() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        telemetry.process_bytes(&frame(PacketKind::Obj, AHRS, ahrs.pack()));
        assert!(drain(&telemetry, Instant::now()).is_empty());
        assert_eq!(telemetry.stats().rx_objects, 1);
    }

    #[test]
    fn test_unknown_instance_of_single_instance_type_is_nacked() {
        let (manager, telemetry) = setup();
        let key = ObjectKey::new(ahrs_settings::OBJECT_ID, 1);
        let payload = object(&manager, AHRS).pack();

        telemetry.process_bytes(&frame(PacketKind::Obj, key, payload));
        assert_eq!(
            drain(&telemetry, Instant::now()),
            vec![Packet::control(PacketKind::Nack, key)]
        );
        assert_eq!(manager.get_num_instances(ahrs_settings::OBJECT_ID), 1);
    }

    #[test]
    fn test_unknown_instance_of_multi_instance_type_is_created() {
        let (manager, telemetry) = setup();
        manager.register_definition(&Waypoint).unwrap();
        let key = ObjectKey::new(0x1234_5670, 2);

        telemetry.process_bytes(&frame(PacketKind::Obj, key, 120.5f32.to_le_bytes().to_vec()));
        let waypoint = manager.get_object(0x1234_5670, 2).unwrap();
        assert_eq!(waypoint.get_value("Altitude", 0).unwrap(), FieldValue::Float32(120.5));

        // the new instance is wired to the engine
        waypoint.updated_manual().unwrap();
        let sent = drain(&telemetry, Instant::now());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::Obj);
        assert_eq!(sent[0].key(), key);

        // OBJ_REQ never creates instances
        let missing = ObjectKey::new(0x1234_5670, 9);
        telemetry.process_bytes(&frame(PacketKind::ObjReq, missing, Vec::new()));
        assert_eq!(
            drain(&telemetry, Instant::now()),
            vec![Packet::control(PacketKind::Nack, missing)]
        );
        assert_eq!(manager.get_num_instances(0x1234_5670), 2);
    }

    #[test]
    fn test_payload_size_mismatch_is_dropped() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let updates = update_count(&ahrs);

        telemetry.process_bytes(&frame(PacketKind::ObjAck, AHRS, vec![0u8; 15]));
        assert!(drain(&telemetry, Instant::now()).is_empty());
        assert_eq!(*updates.lock(), 0);
        assert_eq!(telemetry.stats().rx_errors, 1);
    }

    #[test]
    fn test_obj_req_replies_with_current_value() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        ahrs.set_value("Downsampling", 0, 40u8).unwrap();

        telemetry.process_bytes(&frame(PacketKind::ObjReq, AHRS, Vec::new()));
        let sent = drain(&telemetry, Instant::now());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::ObjAck);
        assert_eq!(sent[0].payload, ahrs.pack());
        assert_eq!(telemetry.pending_transactions(), 1);
    }

    #[test]
    fn test_update_deferred_while_transaction_pending() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let now = Instant::now();

        ahrs.updated().unwrap();
        assert_eq!(drain(&telemetry, now).len(), 1);

        ahrs.set_value("Downsampling", 0, 33u8).unwrap();
        ahrs.updated().unwrap();
        assert!(drain(&telemetry, now).is_empty());

        telemetry.process_bytes(&frame(PacketKind::Ack, AHRS, Vec::new()));
        let sent = drain(&telemetry, now);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::ObjAck);
        assert_eq!(sent[0].payload[1], 33);
    }

    #[test]
    fn test_nack_fails_transaction() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let completed = completions(&ahrs);
        let updates = update_count(&ahrs);

        telemetry.request_object(&ahrs).unwrap();
        telemetry.process_bytes(&frame(PacketKind::Nack, AHRS, Vec::new()));
        assert_eq!(*completed.lock(), vec![false]);
        assert_eq!(*updates.lock(), 0);

        // stray replies are ignored
        telemetry.process_bytes(&frame(PacketKind::Ack, AHRS, Vec::new()));
        assert_eq!(*completed.lock(), vec![false]);
    }

    #[test]
    fn test_direct_api_reports_busy() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let manual = object(&manager, MANUAL);

        telemetry.send_object(&ahrs).unwrap();
        assert!(matches!(telemetry.send_object(&ahrs), Err(GcsError::Busy(_))));
        assert!(matches!(telemetry.request_object(&ahrs), Err(GcsError::Busy(_))));
        telemetry.send_object(&manual).unwrap();

        let sent = drain(&telemetry, Instant::now());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].key(), AHRS);
        assert_eq!(sent[1].key(), MANUAL);
    }

    #[test]
    fn test_unacked_direct_send_never_busy() {
        let (manager, telemetry) = setup();
        let manual = object(&manager, MANUAL);
        set_gcs_policy(&manual, UpdateMode::Manual, 0, false);

        telemetry.send_object(&manual).unwrap();
        telemetry.send_object(&manual).unwrap();
        assert_eq!(telemetry.pending_transactions(), 0);
        assert_eq!(drain(&telemetry, Instant::now()).len(), 2);
    }

    #[test]
    fn test_direct_send_timeout_starts_when_written() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let completed = completions(&ahrs);
        let start = Instant::now();

        telemetry.send_object(&ahrs).unwrap();
        telemetry.process_timeouts(start + Duration::from_secs(5));
        assert_eq!(telemetry.pending_transactions(), 1);

        let written = start + Duration::from_millis(300);
        let first = telemetry.next_outbound(written).unwrap();
        assert_eq!(decode_packet(&first.bytes, 256).unwrap().kind, PacketKind::ObjAck);

        telemetry.process_timeouts(start + Duration::from_millis(400));
        assert!(drain(&telemetry, start + Duration::from_millis(400)).is_empty());

        let due = written + Duration::from_millis(250);
        telemetry.process_timeouts(due);
        let retry = drain(&telemetry, due);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].key(), AHRS);
        assert!(completed.lock().is_empty());
    }

    #[test]
    fn test_direct_request_timeout_starts_when_written() {
        let (manager, telemetry) = setup();
        let manual = object(&manager, MANUAL);
        let completed = completions(&manual);
        let start = Instant::now();

        telemetry.request_object(&manual).unwrap();
        let written = start + Duration::from_millis(600);
        assert_eq!(drain(&telemetry, written).len(), 1);

        telemetry.process_timeouts(written + Duration::from_millis(249));
        assert!(drain(&telemetry, written).is_empty());
        telemetry.process_timeouts(written + Duration::from_millis(250));
        assert_eq!(drain(&telemetry, written).len(), 1);
        assert!(completed.lock().is_empty());
    }

    #[test]
    fn test_tx_stats_count_written_frames_only() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let manual = object(&manager, MANUAL);
        set_gcs_policy(&manual, UpdateMode::Manual, 0, false);

        telemetry.send_object(&ahrs).unwrap();
        telemetry.send_object(&manual).unwrap();
        assert_eq!(telemetry.stats().tx_objects, 0);

        let frame = telemetry.next_outbound(Instant::now()).unwrap();
        assert_eq!(frame.object_bytes, Some(16));
        assert_eq!(telemetry.stats(), TalkStats::default());

        telemetry.record_sent(&frame);
        let stats = telemetry.stats();
        assert_eq!(stats.tx_objects, 1);
        assert_eq!(stats.tx_object_bytes, 16);
        assert_eq!(stats.tx_bytes, frame.bytes.len() as u64);

        telemetry.shutdown();
        assert_eq!(telemetry.stats().tx_objects, 1);
        assert!(telemetry.next_outbound(Instant::now()).is_none());
    }

    #[test]
    fn test_shutdown_before_write_sends_nothing() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let completed = completions(&ahrs);

        telemetry.send_object(&ahrs).unwrap();
        telemetry.request_object(&object(&manager, MANUAL)).unwrap();
        telemetry.shutdown();

        assert_eq!(*completed.lock(), vec![false]);
        assert_eq!(telemetry.stats().tx_objects, 0);
        assert_eq!(telemetry.stats().tx_bytes, 0);
        assert!(drain(&telemetry, Instant::now()).is_empty());
    }

    #[test]
    fn test_onchange_updates_coalesce() {
        let (manager, telemetry) = setup();
        let manual = object(&manager, MANUAL);
        set_gcs_policy(&manual, UpdateMode::OnChange, 0, false);

        for timeout in [1000u16, 2000, 3000, 4000] {
            manual.set_value("ArmedTimeout", 0, timeout).unwrap();
            manual.updated().unwrap();
        }

        let sent = drain(&telemetry, Instant::now());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::Obj);
        assert_eq!(&sent[0].payload[70..72], &4000u16.to_le_bytes());
    }

    #[test]
    fn test_update_triggers_follow_mode() {
        let (manager, telemetry) = setup();
        let manual = object(&manager, MANUAL);
        let now = Instant::now();

        set_gcs_policy(&manual, UpdateMode::Manual, 0, false);
        manual.updated().unwrap();
        assert!(drain(&telemetry, now).is_empty());
        manual.updated_manual().unwrap();
        assert_eq!(drain(&telemetry, now).len(), 1);

        set_gcs_policy(&manual, UpdateMode::Never, 0, false);
        manual.updated_manual().unwrap();
        manual.updated().unwrap();
        assert!(drain(&telemetry, now).is_empty());

        set_gcs_policy(&manual, UpdateMode::Periodic, 100, false);
        manual.updated().unwrap();
        assert!(drain(&telemetry, now).is_empty());
    }

    #[test]
    fn test_metaobject_update_is_sent() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let meta = ahrs.meta_object().unwrap().clone();
        set_gcs_policy(&ahrs, UpdateMode::Periodic, 500, false);

        meta.updated().unwrap();
        let sent = drain(&telemetry, Instant::now());
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, PacketKind::ObjAck);
        assert_eq!(sent[0].object_id, ahrs_settings::OBJECT_ID + 1);
        assert_eq!(sent[0].payload.len(), 20);
    }

    #[test]
    fn test_periodic_emission() {
        let (manager, telemetry) = setup();
        let manual = object(&manager, MANUAL);
        set_gcs_policy(&manual, UpdateMode::Periodic, 100, false);
        let start = Instant::now();

        telemetry.poll_periodic(start);
        assert!(drain(&telemetry, start).is_empty());

        telemetry.connected.store(true, Ordering::SeqCst);
        telemetry.poll_periodic(start);
        assert_eq!(drain(&telemetry, start).len(), 1);

        let half = start + Duration::from_millis(50);
        telemetry.poll_periodic(half);
        assert!(drain(&telemetry, half).is_empty());

        let next = start + Duration::from_millis(100);
        telemetry.poll_periodic(next);
        let sent = drain(&telemetry, next);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key(), MANUAL);

        // period 0 disables emission
        set_gcs_policy(&manual, UpdateMode::Periodic, 0, false);
        let later = start + Duration::from_millis(1000);
        telemetry.poll_periodic(later);
        assert!(drain(&telemetry, later).is_empty());
    }

    #[test]
    fn test_shutdown_fails_pending_transactions() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let manual = object(&manager, MANUAL);
        let completed = completions(&ahrs);

        ahrs.updated().unwrap();
        assert_eq!(drain(&telemetry, Instant::now()).len(), 1);
        manual.updated().unwrap();

        telemetry.shutdown();
        assert_eq!(*completed.lock(), vec![false]);
        assert_eq!(telemetry.pending_transactions(), 0);
        assert!(drain(&telemetry, Instant::now()).is_empty());
        assert!(!telemetry.is_connected());
    }

    #[test]
    fn test_stats_counters() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);

        ahrs.updated().unwrap();
        drain(&telemetry, Instant::now());
        let inbound = frame(PacketKind::Obj, AHRS, ahrs.pack());
        telemetry.process_bytes(&inbound);
        telemetry.process_bytes(&[0x00, 0xFF]);

        let stats = telemetry.stats();
        assert_eq!(stats.tx_objects, 1);
        assert_eq!(stats.tx_object_bytes, 16);
        assert_eq!(stats.rx_objects, 1);
        assert_eq!(stats.rx_object_bytes, 16);
        assert_eq!(stats.rx_bytes, inbound.len() as u64 + 2);
        assert_eq!(stats.rx_errors, 0);

        telemetry.reset_stats();
        assert_eq!(telemetry.stats(), TalkStats::default());
    }

    async fn read_packet(reader: &mut (impl AsyncReadExt + Unpin), decoder: &mut Decoder) -> Packet {
        let mut buf = [0u8; 64];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0, "link closed early");
            for byte in &buf[..n] {
                if let Some(result) = decoder.push(*byte) {
                    return result.unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_run_over_duplex() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let completed = completions(&ahrs);

        let (gcs, peer) = tokio::io::duplex(1024);
        let (gcs_read, gcs_write) = tokio::io::split(gcs);
        let (mut peer_read, mut peer_write) = tokio::io::split(peer);

        let cancel = CancellationToken::new();
        let task = {
            let telemetry = telemetry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                telemetry
                    .run(
                        Box::new(StreamReader::new(gcs_read)),
                        Box::new(StreamWriter::new(gcs_write)),
                        cancel,
                    )
                    .await
            })
        };

        let mut decoder = Decoder::new(256);
        peer_write
            .write_all(&frame(PacketKind::ObjReq, AHRS, Vec::new()))
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut peer_read, &mut decoder))
            .await
            .unwrap();
        assert_eq!(reply.kind, PacketKind::ObjAck);
        assert_eq!(reply.payload, ahrs.pack());

        peer_write
            .write_all(&frame(PacketKind::Ack, AHRS, Vec::new()))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while completed.lock().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*completed.lock(), vec![true]);
        assert!(telemetry.is_connected());

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!telemetry.is_connected());
    }

    #[tokio::test]
    async fn test_run_ends_on_peer_close() {
        let (manager, telemetry) = setup();
        let ahrs = object(&manager, AHRS);
        let completed = completions(&ahrs);
        telemetry.send_object(&ahrs).unwrap();

        let reader = tokio_test::io::Builder::new().build();
        let writer = RecordingWriter::new();
        let result = telemetry
            .run(
                Box::new(StreamReader::new(reader)),
                Box::new(writer),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(GcsError::LinkClosed)));
        assert_eq!(*completed.lock(), vec![false]);
        assert!(!telemetry.is_connected());
    }

    #[tokio::test]
    async fn test_run_ends_on_write_failure() {
        let (manager, telemetry) = setup();
        telemetry.send_object(&object(&manager, MANUAL)).unwrap();

        let mut writer = MockLinkWriter::new();
        writer
            .expect_write_all()
            .times(1)
            .returning(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")));

        let (gcs, _peer) = tokio::io::duplex(64);
        let result = telemetry
            .run(
                Box::new(StreamReader::new(gcs)),
                Box::new(writer),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(GcsError::Io(_))));
        assert_eq!(telemetry.stats().tx_errors, 1);
        assert_eq!(telemetry.stats().tx_objects, 0);
        assert_eq!(telemetry.stats().tx_bytes, 0);
    }
}
