//! # Object Catalog
//!
//! Definitions of the objects this ground station knows, as generated from
//! the flight firmware's object descriptions.

pub mod ahrs_settings;
pub mod manual_control_settings;

pub use ahrs_settings::AhrsSettings;
pub use manual_control_settings::ManualControlSettings;

use crate::error::Result;
use crate::uavobject::{ObjectDefinition, ObjectManager};

/// Every known object class
pub static CATALOG: &[&dyn ObjectDefinition] = &[&AhrsSettings, &ManualControlSettings];

/// Manager pre-populated with instance 0 of each catalog object
pub fn catalog() -> Result<ObjectManager> {
    ObjectManager::with_catalog(CATALOG)
}
