//! # UAVObject Model
//!
//! Typed field containers shared with the flight controller, their
//! per-object telemetry policy (metadata) and the registry that holds every
//! live instance.

pub mod definition;
pub mod field;
pub mod manager;
pub mod metadata;
pub mod object;
pub mod observer;

pub use definition::{meta_object_id, ObjectDefinition, ObjectKind, ObjectSchema};
pub use field::{Field, FieldDef, FieldSet, FieldType, FieldValue, SCALAR};
pub use manager::{ObjectManager, MAX_PAYLOAD_SIZE};
pub use metadata::{AccessMode, Metadata, UpdateMode, METADATA_NUM_BYTES};
pub use object::{ObjectKey, UavObject, UpdateTrigger};
pub use observer::SubscriptionId;
