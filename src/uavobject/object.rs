//! # UAVObjects
//!
//! A [`UavObject`] is one live instance of an object class: its schema,
//! instance id, field values and observer lists. Metaobjects are the same
//! type with a [`Metadata`] body instead of fields.
//!
//! ## Locking
//!
//! Field bytes (or metadata) sit behind a per-object mutex. The mutex is
//! released before any observer runs.
//!
//! ## Event order
//!
//! | Cause | Events, in order |
//! |-------|------------------|
//! | inbound unpack | unpacked, updated |
//! | [`UavObject::updated`] | fast-path (`Updated`), updated |
//! | [`UavObject::updated_manual`] | fast-path (`Manual`), updated |
//! | [`UavObject::request_update`] | update-requested |
//! | acked write confirmed | transaction-completed(true), updated |
//! | acked write failed | transaction-completed(false) |

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use super::definition::{ObjectDefinition, ObjectKind, ObjectSchema};
use super::field::{Field, FieldSet, FieldValue};
use super::metadata::{AccessMode, Metadata};
use super::observer::{ObserverList, SubscriptionId};
use crate::error::{GcsError, Result};

/// (type id, instance id) address of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub object_id: u32,
    pub instance_id: u16,
}

impl ObjectKey {
    pub const fn new(object_id: u32, instance_id: u16) -> Self {
        Self {
            object_id,
            instance_id,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.object_id, self.instance_id)
    }
}

/// What caused a local update, as seen by the fast-path observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTrigger {
    /// [`UavObject::updated`]
    Updated,
    /// [`UavObject::updated_manual`]
    Manual,
}

type ObjectCallback = dyn Fn(&UavObject) + Send + Sync;
type TriggerCallback = dyn Fn(&UavObject, UpdateTrigger) + Send + Sync;
type TransactionCallback = dyn Fn(&UavObject, bool) + Send + Sync;

#[derive(Debug, Clone)]
enum Body {
    Data(FieldSet),
    Meta(Metadata),
}

/// A live object instance
pub struct UavObject {
    schema: Arc<ObjectSchema>,
    instance_id: u16,
    instance_assigned: bool,
    meta: Option<Arc<UavObject>>,
    body: Mutex<Body>,
    unpacked: ObserverList<ObjectCallback>,
    updated: ObserverList<ObjectCallback>,
    updated_auto: ObserverList<TriggerCallback>,
    update_requested: ObserverList<ObjectCallback>,
    transaction_completed: ObserverList<TransactionCallback>,
}

impl fmt::Debug for UavObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UavObject")
            .field("name", &self.schema.name())
            .field("object_id", &format_args!("0x{:08X}", self.schema.object_id()))
            .field("instance_id", &self.instance_id)
            .finish_non_exhaustive()
    }
}

impl UavObject {
    /// Instantiate a class with its default values and a fresh metaobject
    ///
    /// The instance id is left unassigned; the manager picks the next free
    /// one at registration unless [`UavObject::with_instance_id`] is used.
    pub fn new(def: &dyn ObjectDefinition) -> Result<Self> {
        let schema = Arc::new(ObjectSchema::from_definition(def)?);
        let meta = Arc::new(Self::metaobject(&schema));
        Ok(Self::from_schema(schema, Some(meta), 0, false))
    }

    /// Pin the instance id used at registration
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: u16) -> Self {
        self.instance_id = instance_id;
        self.instance_assigned = true;
        self
    }

    fn metaobject(parent: &ObjectSchema) -> Self {
        let schema = Arc::new(ObjectSchema::metaobject_for(parent));
        Self::from_schema(schema, None, 0, true)
    }

    fn from_schema(
        schema: Arc<ObjectSchema>,
        meta: Option<Arc<UavObject>>,
        instance_id: u16,
        instance_assigned: bool,
    ) -> Self {
        let body = match schema.kind() {
            ObjectKind::Data => Body::Data(schema.default_fields()),
            ObjectKind::Meta { .. } => Body::Meta(schema.default_metadata()),
        };
        Self {
            schema,
            instance_id,
            instance_assigned,
            meta,
            body: Mutex::new(body),
            unpacked: ObserverList::new(),
            updated: ObserverList::new(),
            updated_auto: ObserverList::new(),
            update_requested: ObserverList::new(),
            transaction_completed: ObserverList::new(),
        }
    }

    /// New instance of the same class: default values, same metaobject
    ///
    /// `None` leaves the id for the manager to assign.
    pub(crate) fn clone_instance(&self, instance_id: Option<u16>) -> Self {
        Self::from_schema(
            self.schema.clone(),
            self.meta.clone(),
            instance_id.unwrap_or(0),
            instance_id.is_some(),
        )
    }

    pub(crate) fn instance_assigned(&self) -> bool {
        self.instance_assigned
    }

    pub(crate) fn assign_instance_id(&mut self, instance_id: u16) {
        self.instance_id = instance_id;
        self.instance_assigned = true;
    }

    pub(crate) fn share_meta_object(&mut self, meta: Option<Arc<UavObject>>) {
        self.meta = meta;
    }

    pub fn schema(&self) -> &Arc<ObjectSchema> {
        &self.schema
    }

    pub fn object_id(&self) -> u32 {
        self.schema.object_id()
    }

    pub fn instance_id(&self) -> u16 {
        self.instance_id
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.object_id(), self.instance_id)
    }

    pub fn name(&self) -> &str {
        self.schema.name()
    }

    pub fn description(&self) -> &str {
        self.schema.description()
    }

    pub fn is_single_instance(&self) -> bool {
        self.schema.is_single_instance()
    }

    pub fn is_settings(&self) -> bool {
        self.schema.is_settings()
    }

    pub fn is_metaobject(&self) -> bool {
        self.schema.is_metaobject()
    }

    /// Serialized payload size
    pub fn num_bytes(&self) -> usize {
        self.schema.num_bytes()
    }

    /// The metaobject carrying this object's policy (`None` for metaobjects)
    pub fn meta_object(&self) -> Option<&Arc<UavObject>> {
        self.meta.as_ref()
    }

    /// Current telemetry policy
    ///
    /// Metaobjects always report [`Metadata::metaobject_default`].
    pub fn metadata(&self) -> Metadata {
        match &self.meta {
            Some(meta) => meta.metadata_body(),
            None => Metadata::metaobject_default(),
        }
    }

    /// Replace this object's policy in its metaobject
    ///
    /// Call `updated()` on the metaobject afterwards to push the change to
    /// the flight side.
    ///
    /// # Errors
    ///
    /// Returns `AccessDenied` on a metaobject, whose own policy is fixed.
    pub fn set_metadata(&self, metadata: Metadata) -> Result<()> {
        match &self.meta {
            Some(meta) => {
                let mut body = meta.body.lock();
                *body = Body::Meta(metadata);
                Ok(())
            }
            None => Err(GcsError::AccessDenied(self.name().to_string())),
        }
    }

    pub fn default_metadata(&self) -> Metadata {
        match &self.meta {
            Some(meta) => meta.schema.default_metadata(),
            None => Metadata::metaobject_default(),
        }
    }

    fn metadata_body(&self) -> Metadata {
        match &*self.body.lock() {
            Body::Meta(metadata) => *metadata,
            Body::Data(_) => Metadata::metaobject_default(),
        }
    }

    /// Concatenated field bytes in declared order
    pub fn pack(&self) -> Vec<u8> {
        match &*self.body.lock() {
            Body::Data(fields) => fields.pack(),
            Body::Meta(metadata) => metadata.pack().to_vec(),
        }
    }

    /// Pack into `buf`, returning the number of bytes written
    pub fn pack_into(&self, buf: &mut [u8]) -> Result<usize> {
        let bytes = self.pack();
        if buf.len() < bytes.len() {
            return Err(GcsError::BufferTooShort {
                needed: bytes.len(),
                available: buf.len(),
            });
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// Replace all field values from `buf` and notify unpacked, then updated
    ///
    /// No observer runs if the bytes are rejected.
    pub fn unpack(&self, buf: &[u8]) -> Result<()> {
        self.load(buf)?;
        self.notify_unpacked();
        Ok(())
    }

    /// Unpack without notifying anyone
    pub(crate) fn load(&self, buf: &[u8]) -> Result<()> {
        let mut body = self.body.lock();
        match &mut *body {
            Body::Data(fields) => fields.unpack(buf),
            Body::Meta(metadata) => {
                *metadata = Metadata::unpack(buf)?;
                Ok(())
            }
        }
    }

    /// Read element `index` of field `field`
    pub fn get_value(&self, field: &str, index: usize) -> Result<FieldValue> {
        match &*self.body.lock() {
            Body::Data(fields) => fields.get(field, index),
            Body::Meta(_) => Err(GcsError::UnknownField(field.to_string())),
        }
    }

    /// Read the element named `element` of field `field`
    pub fn get_value_by_name(&self, field: &str, element: &str) -> Result<FieldValue> {
        match &*self.body.lock() {
            Body::Data(fields) => fields.field(field)?.get_value_by_name(element),
            Body::Meta(_) => Err(GcsError::UnknownField(field.to_string())),
        }
    }

    /// Write element `index` of field `field`
    ///
    /// Does not notify; call [`UavObject::updated`] once the edit is done.
    ///
    /// # Errors
    ///
    /// `AccessDenied` when the GCS access mode is read-only, otherwise any
    /// field access error. The object is unchanged on error.
    pub fn set_value(&self, field: &str, index: usize, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        self.edit(|fields| fields.set(field, index, value))
    }

    /// Write the element named `element` of field `field`
    pub fn set_value_by_name(
        &self,
        field: &str,
        element: &str,
        value: impl Into<FieldValue>,
    ) -> Result<()> {
        let value = value.into();
        self.edit(|fields| fields.field_mut(field)?.set_value_by_name(element, value))
    }

    /// Apply several field writes as one change
    ///
    /// The closure runs on a copy; the copy replaces the live fields only if
    /// the closure succeeds.
    pub fn edit<R>(&self, f: impl FnOnce(&mut FieldSet) -> Result<R>) -> Result<R> {
        self.check_gcs_write()?;
        let mut body = self.body.lock();
        match &mut *body {
            Body::Data(fields) => {
                let mut staged = fields.clone();
                let result = f(&mut staged)?;
                *fields = staged;
                Ok(result)
            }
            Body::Meta(_) => Err(GcsError::UnknownField(self.name().to_string())),
        }
    }

    /// Snapshot of one field
    pub fn field(&self, name: &str) -> Result<Field> {
        match &*self.body.lock() {
            Body::Data(fields) => fields.field(name).cloned(),
            Body::Meta(_) => Err(GcsError::UnknownField(name.to_string())),
        }
    }

    /// Snapshot of every field in declared order
    pub fn fields(&self) -> Vec<Field> {
        match &*self.body.lock() {
            Body::Data(fields) => fields.iter().cloned().collect(),
            Body::Meta(_) => Vec::new(),
        }
    }

    pub fn field_names(&self) -> Vec<&'static str> {
        self.schema.fields().iter().map(|def| def.name).collect()
    }

    /// Reset to the class defaults (metaobjects: the parent's default policy)
    pub fn set_default_field_values(&self) {
        let mut body = self.body.lock();
        *body = match self.schema.kind() {
            ObjectKind::Data => Body::Data(self.schema.default_fields()),
            ObjectKind::Meta { .. } => Body::Meta(self.schema.default_metadata()),
        };
    }

    /// Announce a local change; emission follows the GCS update mode
    ///
    /// # Errors
    ///
    /// Returns `AccessDenied` when the GCS access mode is read-only; nothing
    /// is notified in that case.
    pub fn updated(&self) -> Result<()> {
        self.check_gcs_write()?;
        self.fire_auto(UpdateTrigger::Updated);
        self.notify_updated();
        Ok(())
    }

    /// Announce a local change that must be sent even outside ONCHANGE mode
    pub fn updated_manual(&self) -> Result<()> {
        self.check_gcs_write()?;
        self.fire_auto(UpdateTrigger::Manual);
        self.notify_updated();
        Ok(())
    }

    /// Ask the flight side for its current value of this object
    pub fn request_update(&self) {
        for observer in self.update_requested.snapshot() {
            observer(self);
        }
    }

    /// Report the outcome of an acked write or request
    pub fn transaction_completed(&self, success: bool) {
        for observer in self.transaction_completed.snapshot() {
            observer(self, success);
        }
    }

    pub(crate) fn notify_unpacked(&self) {
        for observer in self.unpacked.snapshot() {
            observer(self);
        }
        self.notify_updated();
    }

    pub(crate) fn notify_updated(&self) {
        for observer in self.updated.snapshot() {
            observer(self);
        }
    }

    fn fire_auto(&self, trigger: UpdateTrigger) {
        for observer in self.updated_auto.snapshot() {
            observer(self, trigger);
        }
    }

    fn check_gcs_write(&self) -> Result<()> {
        if self.metadata().gcs_access == AccessMode::ReadOnly {
            return Err(GcsError::AccessDenied(self.name().to_string()));
        }
        Ok(())
    }

    /// Fires after every local or remote change
    pub fn add_updated_observer(
        &self,
        observer: impl Fn(&UavObject) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.updated.add(Arc::new(observer))
    }

    /// Fires after the object was overwritten from the wire
    pub fn add_unpacked_observer(
        &self,
        observer: impl Fn(&UavObject) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.unpacked.add(Arc::new(observer))
    }

    pub fn add_update_requested_observer(
        &self,
        observer: impl Fn(&UavObject) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.update_requested.add(Arc::new(observer))
    }

    pub fn add_transaction_completed_observer(
        &self,
        observer: impl Fn(&UavObject, bool) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.transaction_completed.add(Arc::new(observer))
    }

    /// Fast path for the telemetry engine: local updates only
    pub(crate) fn add_updated_auto_observer(
        &self,
        observer: impl Fn(&UavObject, UpdateTrigger) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.updated_auto.add(Arc::new(observer))
    }

    /// Remove a subscription from whichever list holds it
    pub fn remove_observer(&self, id: SubscriptionId) -> bool {
        self.updated.remove(id)
            || self.unpacked.remove(id)
            || self.update_requested.remove(id)
            || self.transaction_completed.remove(id)
            || self.updated_auto.remove(id)
    }
}
