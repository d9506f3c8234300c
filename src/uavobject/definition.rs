//! # Object Definitions
//!
//! Every catalog entry implements [`ObjectDefinition`]: identity, flags,
//! field layout and default content. Registration turns a definition into
//! an [`ObjectSchema`], which is shared by all instances of the class and
//! by nothing else.

use std::sync::Arc;

use super::field::{build_index, FieldDef, FieldIndex, FieldSet};
use super::metadata::{Metadata, METADATA_NUM_BYTES};
use crate::error::{GcsError, Result};

/// Compile-time description of one object class
pub trait ObjectDefinition: Send + Sync {
    /// 32-bit type id shared with the flight firmware
    fn object_id(&self) -> u32;

    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str {
        ""
    }

    /// Single-instance objects only ever exist as instance 0
    fn is_single_instance(&self) -> bool;

    /// Settings objects are persisted by the flight side
    fn is_settings(&self) -> bool;

    /// Field layout in wire order
    fn fields(&self) -> &'static [FieldDef];

    /// Fill a zero-initialized field set with the class defaults
    fn set_default_field_values(&self, _fields: &mut FieldSet) -> Result<()> {
        Ok(())
    }

    fn default_metadata(&self) -> Metadata {
        if self.is_settings() {
            Metadata::settings_default()
        } else {
            Metadata::data_default()
        }
    }
}

/// Type id of the metaobject belonging to `object_id`
pub const fn meta_object_id(object_id: u32) -> u32 {
    object_id.wrapping_add(1)
}

/// Whether a schema describes a data object or a metaobject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Data,
    Meta { parent_id: u32 },
}

/// Resolved, validated layout of an object class
#[derive(Debug)]
pub struct ObjectSchema {
    object_id: u32,
    name: String,
    description: String,
    single_instance: bool,
    settings: bool,
    kind: ObjectKind,
    fields: &'static [FieldDef],
    num_bytes: usize,
    default_metadata: Metadata,
    defaults: FieldSet,
}

impl ObjectSchema {
    /// Validate a definition and compute its default field values
    ///
    /// # Errors
    ///
    /// Returns `Catalog` if the field layout is inconsistent or the
    /// definition's defaults cannot be applied.
    pub fn from_definition(def: &dyn ObjectDefinition) -> Result<Self> {
        if def.name().is_empty() {
            return Err(GcsError::Catalog(format!(
                "object 0x{:08X} has no name",
                def.object_id()
            )));
        }

        let index: Arc<FieldIndex> = Arc::new(build_index(def.fields()).map_err(|e| {
            GcsError::Catalog(format!("{}: {}", def.name(), e))
        })?);

        let mut defaults = FieldSet::new(def.fields(), index);
        def.set_default_field_values(&mut defaults).map_err(|e| {
            GcsError::Catalog(format!("{}: invalid default value: {}", def.name(), e))
        })?;

        Ok(Self {
            object_id: def.object_id(),
            name: def.name().to_string(),
            description: def.description().to_string(),
            single_instance: def.is_single_instance(),
            settings: def.is_settings(),
            kind: ObjectKind::Data,
            fields: def.fields(),
            num_bytes: defaults.num_bytes(),
            default_metadata: def.default_metadata(),
            defaults,
        })
    }

    /// Schema of the metaobject that carries `parent`'s policy
    pub fn metaobject_for(parent: &ObjectSchema) -> Self {
        Self {
            object_id: meta_object_id(parent.object_id),
            name: format!("{}Meta", parent.name),
            description: format!("Metadata for {}", parent.name),
            single_instance: true,
            settings: false,
            kind: ObjectKind::Meta {
                parent_id: parent.object_id,
            },
            fields: &[],
            num_bytes: METADATA_NUM_BYTES,
            default_metadata: parent.default_metadata,
            defaults: FieldSet::new(&[], Arc::new(FieldIndex::new())),
        }
    }

    pub fn object_id(&self) -> u32 {
        self.object_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_single_instance(&self) -> bool {
        self.single_instance
    }

    pub fn is_settings(&self) -> bool {
        self.settings
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_metaobject(&self) -> bool {
        matches!(self.kind, ObjectKind::Meta { .. })
    }

    pub fn fields(&self) -> &'static [FieldDef] {
        self.fields
    }

    /// Payload size on the wire (`NUMBYTES`)
    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    /// For a data class, its default policy; for a metaobject, the default
    /// policy it carries for its parent
    pub fn default_metadata(&self) -> Metadata {
        self.default_metadata
    }

    /// A fresh copy of the class default field values
    pub fn default_fields(&self) -> FieldSet {
        self.defaults.clone()
    }
}
