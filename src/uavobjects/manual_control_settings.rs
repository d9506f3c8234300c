//! ManualControlSettings: how receiver input is decoded by the manual
//! control module

use crate::error::Result;
use crate::uavobject::{FieldDef, FieldSet, FieldType, ObjectDefinition, SCALAR};

pub const OBJECT_ID: u32 = 0x02B8_2102;
pub const NAME: &str = "ManualControlSettings";

const CHANNEL_OPTIONS: &[&str] = &[
    "Channel1", "Channel2", "Channel3", "Channel4", "Channel5", "Channel6", "Channel7",
    "Channel8", "None",
];
const AXES: &[&str] = &["Roll", "Pitch", "Yaw"];
const STABILIZATION_OPTIONS: &[&str] = &["None", "Rate", "Attitude"];
const CHANNELS: &[&str] = &["0", "1", "2", "3", "4", "5", "6", "7"];

static FIELDS: [FieldDef; 18] = [
    FieldDef::enumeration("InputMode", "", SCALAR, &["PWM", "PPM", "Spektrum"]),
    FieldDef::enumeration("Roll", "channel", SCALAR, CHANNEL_OPTIONS),
    FieldDef::enumeration("Pitch", "channel", SCALAR, CHANNEL_OPTIONS),
    FieldDef::enumeration("Yaw", "channel", SCALAR, CHANNEL_OPTIONS),
    FieldDef::enumeration("Throttle", "channel", SCALAR, CHANNEL_OPTIONS),
    FieldDef::enumeration("FlightMode", "channel", SCALAR, CHANNEL_OPTIONS),
    FieldDef::enumeration("Accessory1", "channel", SCALAR, CHANNEL_OPTIONS),
    FieldDef::enumeration("Accessory2", "channel", SCALAR, CHANNEL_OPTIONS),
    FieldDef::enumeration("Accessory3", "channel", SCALAR, CHANNEL_OPTIONS),
    FieldDef::enumeration(
        "Arming",
        "",
        SCALAR,
        &[
            "Always Disarmed",
            "Always Armed",
            "Roll Left",
            "Roll Right",
            "Pitch Forward",
            "Pitch Aft",
            "Yaw Left",
            "Yaw Right",
        ],
    ),
    FieldDef::enumeration("Stabilization1Settings", "", AXES, STABILIZATION_OPTIONS),
    FieldDef::enumeration("Stabilization2Settings", "", AXES, STABILIZATION_OPTIONS),
    FieldDef::enumeration("Stabilization3Settings", "", AXES, STABILIZATION_OPTIONS),
    FieldDef::enumeration(
        "FlightModePosition",
        "",
        &["0", "1", "2"],
        &[
            "Manual",
            "Stabilized1",
            "Stabilized2",
            "Stabilized3",
            "VelocityControl",
            "PositionHold",
        ],
    ),
    FieldDef::new("ChannelMax", "us", FieldType::Int16, CHANNELS),
    FieldDef::new("ChannelNeutral", "us", FieldType::Int16, CHANNELS),
    FieldDef::new("ChannelMin", "us", FieldType::Int16, CHANNELS),
    FieldDef::new("ArmedTimeout", "ms", FieldType::UInt16, SCALAR),
];

pub struct ManualControlSettings;

impl ObjectDefinition for ManualControlSettings {
    fn object_id(&self) -> u32 {
        OBJECT_ID
    }

    fn name(&self) -> &'static str {
        NAME
    }

    fn description(&self) -> &'static str {
        "Settings to indicate how to decode receiver input by the manual control module"
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
        fields.set("InputMode", 0, "PWM")?;
        fields.set("Roll", 0, "Channel1")?;
        fields.set("Pitch", 0, "Channel2")?;
        fields.set("Yaw", 0, "Channel3")?;
        fields.set("Throttle", 0, "Channel4")?;
        fields.set("FlightMode", 0, "Channel5")?;
        fields.set("Accessory1", 0, "None")?;
        fields.set("Accessory2", 0, "None")?;
        fields.set("Accessory3", 0, "None")?;
        fields.set("Arming", 0, "Always Disarmed")?;
        fields.set_all("Stabilization1Settings", "Attitude")?;
        fields.set_all("Stabilization2Settings", "Attitude")?;
        fields.set_all("Stabilization3Settings", "Attitude")?;
        fields.set_all("FlightModePosition", "Manual")?;
        fields.set_all("ChannelMax", 2000)?;
        fields.set_all("ChannelNeutral", 1500)?;
        fields.set_all("ChannelMin", 1000)?;
        fields.set("ArmedTimeout", 0, 30000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uavobject::{FieldValue, UavObject};

    #[test]
    fn test_layout_and_defaults() {
        let obj = UavObject::new(&ManualControlSettings).unwrap();
        assert_eq!(obj.num_bytes(), 72);
        assert_eq!(obj.get_value("InputMode", 0).unwrap().as_str(), Some("PWM"));
        assert_eq!(
            obj.get_value_by_name("Stabilization2Settings", "Yaw").unwrap().as_str(),
            Some("Attitude")
        );
        assert_eq!(obj.get_value("ChannelNeutral", 7).unwrap(), FieldValue::Int16(1500));
        assert_eq!(obj.get_value("ArmedTimeout", 0).unwrap(), FieldValue::UInt16(30000));

        let bytes = obj.pack();
        assert_eq!(&bytes[..10], &[0, 0, 1, 2, 3, 4, 8, 8, 8, 0]);
        assert_eq!(&bytes[22..24], &2000i16.to_le_bytes());
        assert_eq!(&bytes[70..], &30000u16.to_le_bytes());

        let at = |offset: usize| i16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        for i in 0..CHANNELS.len() {
            assert_eq!(obj.get_value("ChannelMax", i).unwrap(), FieldValue::Int16(2000));
            assert_eq!(obj.get_value("ChannelNeutral", i).unwrap(), FieldValue::Int16(1500));
            assert_eq!(obj.get_value("ChannelMin", i).unwrap(), FieldValue::Int16(1000));
            assert_eq!(at(22 + 2 * i), 2000);
            assert_eq!(at(38 + 2 * i), 1500);
            assert_eq!(at(54 + 2 * i), 1000);
        }
    }
}
