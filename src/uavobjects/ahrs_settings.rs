//! AHRSSettings: algorithm selection and update rate of the attitude module

use crate::error::Result;
use crate::uavobject::{FieldDef, FieldSet, FieldType, ObjectDefinition, SCALAR};

pub const OBJECT_ID: u32 = 0xDEFC_5548;
pub const NAME: &str = "AHRSSettings";

static FIELDS: [FieldDef; 7] = [
    FieldDef::enumeration(
        "Algorithm",
        "",
        SCALAR,
        &["SIMPLE", "INSGPS_INDOOR_NOMAG", "INSGPS_INDOOR", "INSGPS_OUTDOOR"],
    ),
    FieldDef::new("Downsampling", "", FieldType::UInt8, SCALAR),
    FieldDef::new("UpdatePeriod", "ms", FieldType::UInt8, SCALAR),
    FieldDef::enumeration("BiasCorrectedRaw", "", SCALAR, &["TRUE", "FALSE"]),
    FieldDef::new("YawBias", "", FieldType::Float32, SCALAR),
    FieldDef::new("PitchBias", "", FieldType::Float32, SCALAR),
    FieldDef::new("RollBias", "", FieldType::Float32, SCALAR),
];

pub struct AhrsSettings;

impl ObjectDefinition for AhrsSettings {
    fn object_id(&self) -> u32 {
        OBJECT_ID
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Settings for the AHRS comms module to control the algorithm and what is updated"
    }

    fn is_single_instance(&self) -> bool {
        true
    }

    fn is_settings(&self) -> bool {
        true
    }

    fn fields(&self) -> &'static [FieldDef] {
        &FIELDS
    }

    fn set_default_field_values(&self, fields: &mut FieldSet) -> Result<()> {
        fields.set("Algorithm", 0, "INSGPS_INDOOR_NOMAG")?;
        fields.set("Downsampling", 0, 20)?;
        fields.set("UpdatePeriod", 0, 1)?;
        fields.set("BiasCorrectedRaw", 0, "TRUE")?;
        fields.set("YawBias", 0, 0.0f32)?;
        fields.set("PitchBias", 0, 0.0f32)?;
        fields.set("RollBias", 0, 0.0f32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uavobject::{FieldValue, Metadata, UavObject};

    #[test]
    fn test_layout_and_defaults() {
        let obj = UavObject::new(&AhrsSettings).unwrap();
        assert_eq!(obj.num_bytes(), 16);
        assert_eq!(obj.metadata(), Metadata::settings_default());
        assert_eq!(obj.get_value("Algorithm", 0).unwrap().as_str(), Some("INSGPS_INDOOR_NOMAG"));
        assert_eq!(obj.get_value("Downsampling", 0).unwrap(), FieldValue::UInt8(20));

        let bytes = obj.pack();
        assert_eq!(&bytes[..4], &[1, 20, 1, 0]);
        assert_eq!(&bytes[4..], &[0u8; 12]);
    }
}
