//! # Object Manager
//!
//! Registry of every known object instance, indexed by type id and by name.
//!
//! Each type id maps to a dense list of instances ordered by instance id.
//! Registering the first instance of a data class also registers its
//! metaobject under `object_id + 1`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::definition::ObjectDefinition;
use super::object::UavObject;
use super::observer::{ObserverList, SubscriptionId};
use crate::error::{GcsError, Result};

type ManagerCallback = dyn Fn(&Arc<UavObject>) + Send + Sync;

/// Upper bound on any object payload carried by the link
pub const MAX_PAYLOAD_SIZE: usize = 256;

#[derive(Default)]
struct Registry {
    /// Instances per type, sorted by instance id
    types: Vec<Vec<Arc<UavObject>>>,
    by_id: HashMap<u32, usize>,
    by_name: HashMap<String, u32>,
}

impl Registry {
    fn instances(&self, object_id: u32) -> Option<&Vec<Arc<UavObject>>> {
        self.by_id.get(&object_id).map(|&slot| &self.types[slot])
    }

    fn insert(&mut self, obj: Arc<UavObject>) {
        match self.by_id.get(&obj.object_id()) {
            Some(&slot) => {
                let list = &mut self.types[slot];
                let at = list.partition_point(|o| o.instance_id() < obj.instance_id());
                list.insert(at, obj);
            }
            None => {
                self.by_id.insert(obj.object_id(), self.types.len());
                self.by_name.insert(obj.name().to_string(), obj.object_id());
                self.types.push(vec![obj]);
            }
        }
    }
}

/// Thread-safe object registry
#[derive(Default)]
pub struct ObjectManager {
    registry: RwLock<Registry>,
    new_object: ObserverList<ManagerCallback>,
    new_instance: ObserverList<ManagerCallback>,
}

impl std::fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("ObjectManager")
            .field("types", &registry.types.len())
            .field(
                "instances",
                &registry.types.iter().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}

impl ObjectManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manager holding instance 0 of every definition
    ///
    /// # Errors
    ///
    /// Fails on the first definition that is invalid or collides with an
    /// earlier one.
    pub fn with_catalog(catalog: &[&dyn ObjectDefinition]) -> Result<Self> {
        let manager = Self::new();
        for def in catalog {
            manager.register_definition(*def)?;
        }
        info!(
            "Object manager ready: {} types",
            manager.registry.read().types.len()
        );
        Ok(manager)
    }

    /// Instantiate and register instance 0 of `def`
    pub fn register_definition(&self, def: &dyn ObjectDefinition) -> Result<Arc<UavObject>> {
        self.register_object(UavObject::new(def)?.with_instance_id(0))
    }

    /// Add an object instance to the registry
    ///
    /// An object without an explicit instance id receives the next free one
    /// for its type. The first instance of a type brings its metaobject
    /// along; later instances are rebound to that same metaobject. Fires new-object (first instance of a type) or new-instance,
    /// after the registry lock is released.
    ///
    /// # Errors
    ///
    /// - `Duplicate` if the (type, instance) pair is taken
    /// - `SingleInstance` for a second instance of a single-instance type
    /// - `Catalog` if the name or id is already used by a different type
    pub fn register_object(&self, mut obj: UavObject) -> Result<Arc<UavObject>> {
        let mut added = Vec::with_capacity(2);
        let is_new_type;
        let obj = {
            let mut registry = self.registry.write();

            match registry.instances(obj.object_id()) {
                Some(existing) => {
                    let first = &existing[0];
                    if first.name() != obj.name() {
                        return Err(GcsError::Catalog(format!(
                            "object id 0x{:08X} already used by {}",
                            obj.object_id(),
                            first.name()
                        )));
                    }
                    if obj.is_single_instance() {
                        return Err(GcsError::SingleInstance(obj.name().to_string()));
                    }
                    if !obj.instance_assigned() {
                        let next = next_free_instance(existing)?;
                        obj.assign_instance_id(next);
                    }
                    if existing.iter().any(|o| o.instance_id() == obj.instance_id()) {
                        return Err(GcsError::Duplicate {
                            name: obj.name().to_string(),
                            instance: obj.instance_id(),
                        });
                    }
                    obj.share_meta_object(first.meta_object().cloned());
                    is_new_type = false;
                }
                None => {
                    if let Some(id) = registry.by_name.get(obj.name()) {
                        return Err(GcsError::Catalog(format!(
                            "object name {} already used by 0x{:08X}",
                            obj.name(),
                            id
                        )));
                    }
                    if !obj.instance_assigned() {
                        obj.assign_instance_id(0);
                    }
                    if obj.is_single_instance() && obj.instance_id() != 0 {
                        return Err(GcsError::SingleInstance(obj.name().to_string()));
                    }
                    if let Some(meta) = obj.meta_object() {
                        if registry.instances(meta.object_id()).is_some()
                            || registry.by_name.contains_key(meta.name())
                        {
                            return Err(GcsError::Catalog(format!(
                                "metaobject id 0x{:08X} of {} is already registered",
                                meta.object_id(),
                                obj.name()
                            )));
                        }
                    }
                    is_new_type = true;
                }
            }

            let obj = Arc::new(obj);
            registry.insert(obj.clone());
            added.push(obj.clone());
            if is_new_type {
                if let Some(meta) = obj.meta_object() {
                    registry.insert(meta.clone());
                    added.push(meta.clone());
                }
            }
            obj
        };

        debug!(
            "Registered {} instance {} (0x{:08X})",
            obj.name(),
            obj.instance_id(),
            obj.object_id()
        );

        let observers = if is_new_type {
            self.new_object.snapshot()
        } else {
            self.new_instance.snapshot()
        };
        for registered in &added {
            for observer in &observers {
                observer(registered);
            }
        }
        Ok(obj)
    }

    /// Create and register a new instance of an already known type
    ///
    /// The instance starts from the class defaults and shares the type's
    /// metaobject. `None` picks the next free instance id.
    pub fn new_instance(&self, object_id: u32, instance_id: Option<u16>) -> Result<Arc<UavObject>> {
        let prototype = self
            .get_object(object_id, 0)
            .or_else(|| self.get_instances(object_id).into_iter().next())
            .ok_or(GcsError::UnknownObject(object_id))?;
        if prototype.is_single_instance() {
            return Err(GcsError::SingleInstance(prototype.name().to_string()));
        }

        self.register_object(prototype.clone_instance(instance_id))
    }

    /// Look up an instance, creating it if its type is multi-instance
    ///
    /// Used by the inbound path for OBJ and OBJ_ACK packets that address an
    /// instance the GCS has not seen yet.
    pub fn get_or_create_instance(&self, object_id: u32, instance_id: u16) -> Result<Arc<UavObject>> {
        if let Some(obj) = self.get_object(object_id, instance_id) {
            return Ok(obj);
        }
        match self.new_instance(object_id, Some(instance_id)) {
            Err(GcsError::Duplicate { .. }) => self
                .get_object(object_id, instance_id)
                .ok_or(GcsError::UnknownInstance {
                    object_id,
                    instance: instance_id,
                }),
            other => other,
        }
    }

    pub fn get_object(&self, object_id: u32, instance_id: u16) -> Option<Arc<UavObject>> {
        let registry = self.registry.read();
        registry
            .instances(object_id)?
            .iter()
            .find(|o| o.instance_id() == instance_id)
            .cloned()
    }

    pub fn get_object_by_name(&self, name: &str, instance_id: u16) -> Option<Arc<UavObject>> {
        let object_id = *self.registry.read().by_name.get(name)?;
        self.get_object(object_id, instance_id)
    }

    /// All instances of a type, ordered by instance id
    pub fn get_instances(&self, object_id: u32) -> Vec<Arc<UavObject>> {
        self.registry
            .read()
            .instances(object_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_instances_by_name(&self, name: &str) -> Vec<Arc<UavObject>> {
        let object_id = match self.registry.read().by_name.get(name) {
            Some(id) => *id,
            None => return Vec::new(),
        };
        self.get_instances(object_id)
    }

    pub fn get_num_instances(&self, object_id: u32) -> usize {
        self.registry
            .read()
            .instances(object_id)
            .map_or(0, Vec::len)
    }

    /// Every type's instance list, in registration order
    pub fn get_objects(&self) -> Vec<Vec<Arc<UavObject>>> {
        self.registry.read().types.clone()
    }

    pub fn get_data_objects(&self) -> Vec<Vec<Arc<UavObject>>> {
        self.filtered(|obj| !obj.is_metaobject())
    }

    pub fn get_meta_objects(&self) -> Vec<Vec<Arc<UavObject>>> {
        self.filtered(UavObject::is_metaobject)
    }

    /// Number of registered types, metaobjects included
    pub fn num_types(&self) -> usize {
        self.registry.read().types.len()
    }

    /// Largest payload among registered types, capped at [`MAX_PAYLOAD_SIZE`]
    pub fn max_object_size(&self) -> usize {
        self.registry
            .read()
            .types
            .iter()
            .filter_map(|list| list.first())
            .map(|obj| obj.num_bytes())
            .max()
            .unwrap_or(0)
            .min(MAX_PAYLOAD_SIZE)
    }

    /// Fires for the first instance of a type and for its metaobject
    pub fn on_new_object(
        &self,
        observer: impl Fn(&Arc<UavObject>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.new_object.add(Arc::new(observer))
    }

    /// Fires for every further instance of a known type
    pub fn on_new_instance(
        &self,
        observer: impl Fn(&Arc<UavObject>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.new_instance.add(Arc::new(observer))
    }

    pub fn remove_observer(&self, id: SubscriptionId) -> bool {
        self.new_object.remove(id) || self.new_instance.remove(id)
    }

    fn filtered(&self, keep: impl Fn(&UavObject) -> bool) -> Vec<Vec<Arc<UavObject>>> {
        self.registry
            .read()
            .types
            .iter()
            .filter(|list| list.first().is_some_and(|obj| keep(obj)))
            .cloned()
            .collect()
    }
}

/// Lowest instance id not used by any instance in `existing`
fn next_free_instance(existing: &[Arc<UavObject>]) -> Result<u16> {
    let mut candidate: u16 = 0;
    for obj in existing {
        if obj.instance_id() != candidate {
            break;
        }
        candidate = candidate.checked_add(1).ok_or_else(|| {
            GcsError::Catalog(format!("{} has no free instance id", obj.name()))
        })?;
    }
    Ok(candidate)
}
