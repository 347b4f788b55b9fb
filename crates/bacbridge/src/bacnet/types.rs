//! BACnet addressing and value types

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// BACnet object type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Device,
    Schedule,
    Calendar,
    NotificationClass,
    MultiStateInput,
    MultiStateOutput,
    MultiStateValue,
    TrendLog,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::AnalogInput => "analog-input",
            ObjectType::AnalogOutput => "analog-output",
            ObjectType::AnalogValue => "analog-value",
            ObjectType::BinaryInput => "binary-input",
            ObjectType::BinaryOutput => "binary-output",
            ObjectType::BinaryValue => "binary-value",
            ObjectType::Device => "device",
            ObjectType::Schedule => "schedule",
            ObjectType::Calendar => "calendar",
            ObjectType::NotificationClass => "notification-class",
            ObjectType::MultiStateInput => "multi-state-input",
            ObjectType::MultiStateOutput => "multi-state-output",
            ObjectType::MultiStateValue => "multi-state-value",
            ObjectType::TrendLog => "trend-log",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Folds `analog-input`, `analogInput` and `analog_input` to the same token
fn normalize(s: &str) -> String {
    s.to_lowercase().replace(['-', '_'], "")
}

impl FromStr for ObjectType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "analoginput" | "ai" => Ok(ObjectType::AnalogInput),
            "analogoutput" | "ao" => Ok(ObjectType::AnalogOutput),
            "analogvalue" | "av" => Ok(ObjectType::AnalogValue),
            "binaryinput" | "bi" => Ok(ObjectType::BinaryInput),
            "binaryoutput" | "bo" => Ok(ObjectType::BinaryOutput),
            "binaryvalue" | "bv" => Ok(ObjectType::BinaryValue),
            "device" => Ok(ObjectType::Device),
            "schedule" => Ok(ObjectType::Schedule),
            "calendar" => Ok(ObjectType::Calendar),
            "notificationclass" => Ok(ObjectType::NotificationClass),
            "multistateinput" | "msi" => Ok(ObjectType::MultiStateInput),
            "multistateoutput" | "mso" => Ok(ObjectType::MultiStateOutput),
            "multistatevalue" | "msv" => Ok(ObjectType::MultiStateValue),
            "trendlog" => Ok(ObjectType::TrendLog),
            _ => Err(Error::InvalidArgument(format!("Unknown object type: {}", s))),
        }
    }
}

/// BACnet property identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyIdentifier {
    PresentValue,
    ObjectName,
    ObjectType,
    ObjectList,
    Description,
    StatusFlags,
    EventState,
    OutOfService,
    Units,
    Reliability,
    PriorityArray,
    RelinquishDefault,
    VendorName,
    ModelName,
}

impl PropertyIdentifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyIdentifier::PresentValue => "present-value",
            PropertyIdentifier::ObjectName => "object-name",
            PropertyIdentifier::ObjectType => "object-type",
            PropertyIdentifier::ObjectList => "object-list",
            PropertyIdentifier::Description => "description",
            PropertyIdentifier::StatusFlags => "status-flags",
            PropertyIdentifier::EventState => "event-state",
            PropertyIdentifier::OutOfService => "out-of-service",
            PropertyIdentifier::Units => "units",
            PropertyIdentifier::Reliability => "reliability",
            PropertyIdentifier::PriorityArray => "priority-array",
            PropertyIdentifier::RelinquishDefault => "relinquish-default",
            PropertyIdentifier::VendorName => "vendor-name",
            PropertyIdentifier::ModelName => "model-name",
        }
    }
}

impl fmt::Display for PropertyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "presentvalue" | "pv" => Ok(PropertyIdentifier::PresentValue),
            "objectname" | "name" => Ok(PropertyIdentifier::ObjectName),
            "objecttype" => Ok(PropertyIdentifier::ObjectType),
            "objectlist" => Ok(PropertyIdentifier::ObjectList),
            "description" => Ok(PropertyIdentifier::Description),
            "statusflags" => Ok(PropertyIdentifier::StatusFlags),
            "eventstate" => Ok(PropertyIdentifier::EventState),
            "outofservice" => Ok(PropertyIdentifier::OutOfService),
            "units" => Ok(PropertyIdentifier::Units),
            "reliability" => Ok(PropertyIdentifier::Reliability),
            "priorityarray" => Ok(PropertyIdentifier::PriorityArray),
            "relinquishdefault" => Ok(PropertyIdentifier::RelinquishDefault),
            "vendorname" => Ok(PropertyIdentifier::VendorName),
            "modelname" => Ok(PropertyIdentifier::ModelName),
            _ => Err(Error::InvalidArgument(format!("Unknown property: {}", s))),
        }
    }
}

/// A BACnet object reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub object_type: ObjectType,
    pub instance: u32,
}

impl ObjectId {
    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self { object_type, instance }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.instance)
    }
}

/// Addressing unit for reads, writes and overrides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PropertyKey {
    /// Device instance number
    pub device_id: u32,
    pub object: ObjectId,
    pub property: PropertyIdentifier,
}

impl PropertyKey {
    pub fn new(device_id: u32, object_type: ObjectType, instance: u32, property: PropertyIdentifier) -> Self {
        Self {
            device_id,
            object: ObjectId::new(object_type, instance),
            property,
        }
    }

    /// Shorthand for the present-value of an object
    pub fn present_value(device_id: u32, object_type: ObjectType, instance: u32) -> Self {
        Self::new(device_id, object_type, instance, PropertyIdentifier::PresentValue)
    }
}

impl fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.device_id, self.object, self.property)
    }
}

/// Decoded property value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum PropertyValue {
    Null,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    Real(f32),
    Double(f64),
    CharacterString(String),
    Enumerated(u32),
    ObjectIdentifier(ObjectId),
    Array(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Parse an operator-typed value
    ///
    /// `null`, booleans (also `active`/`inactive`), integers and reals are
    /// recognised; anything else becomes a character string.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "null" => return PropertyValue::Null,
            "true" | "active" => return PropertyValue::Boolean(true),
            "false" | "inactive" => return PropertyValue::Boolean(false),
            _ => {}
        }
        if let Ok(u) = trimmed.parse::<u64>() {
            return PropertyValue::Unsigned(u);
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return PropertyValue::Signed(i);
        }
        if let Ok(r) = trimmed.parse::<f32>() {
            if r.is_finite() {
                return PropertyValue::Real(r);
            }
        }
        PropertyValue::CharacterString(trimmed.to_string())
    }

    /// Plain JSON rendering for consumers that do not care about BACnet tags
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            PropertyValue::Null => serde_json::Value::Null,
            PropertyValue::Boolean(b) => serde_json::json!(*b),
            PropertyValue::Unsigned(u) => serde_json::json!(*u),
            PropertyValue::Signed(s) => serde_json::json!(*s),
            PropertyValue::Real(r) => serde_json::json!(*r),
            PropertyValue::Double(d) => serde_json::json!(*d),
            PropertyValue::CharacterString(s) => serde_json::json!(s),
            PropertyValue::Enumerated(e) => serde_json::json!(*e),
            PropertyValue::ObjectIdentifier(oid) => serde_json::json!({
                "type": oid.object_type.as_str(),
                "instance": oid.instance,
            }),
            PropertyValue::Array(values) => {
                serde_json::Value::Array(values.iter().map(|v| v.to_json()).collect())
            }
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::CharacterString(s) => f.write_str(s),
            PropertyValue::ObjectIdentifier(oid) => write!(f, "{}", oid),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

/// Segmentation support advertised in I-Am
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Segmentation {
    Both,
    Transmit,
    Receive,
    #[default]
    None,
}

/// What a device tells us about itself when it answers Who-Is
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Maximum APDU length the device supports
    pub max_apdu: u16,
    pub segmentation: Segmentation,
    /// BACnet vendor ID
    pub vendor_id: u16,
    pub vendor_name: Option<String>,
    pub model_name: Option<String>,
}

impl Default for DeviceMetadata {
    fn default() -> Self {
        Self {
            max_apdu: 1476,
            segmentation: Segmentation::None,
            vendor_id: 0,
            vendor_name: None,
            model_name: None,
        }
    }
}

/// Discovered BACnet device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// BACnet device instance number
    pub device_id: u32,
    /// Last known address
    pub address: SocketAddr,
    #[serde(flatten)]
    pub metadata: DeviceMetadata,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_spellings() {
        for s in ["analog-input", "analogInput", "analog_input", "AI"] {
            assert_eq!(s.parse::<ObjectType>().unwrap(), ObjectType::AnalogInput);
        }
        assert_eq!("msv".parse::<ObjectType>().unwrap(), ObjectType::MultiStateValue);
        assert!(matches!("pump".parse::<ObjectType>(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_property_spellings() {
        for s in ["present-value", "presentValue", "pv"] {
            assert_eq!(s.parse::<PropertyIdentifier>().unwrap(), PropertyIdentifier::PresentValue);
        }
        assert!("bogus".parse::<PropertyIdentifier>().is_err());
    }

    #[test]
    fn test_display_is_parseable() {
        let t = ObjectType::MultiStateOutput;
        assert_eq!(t.to_string().parse::<ObjectType>().unwrap(), t);
        let p = PropertyIdentifier::RelinquishDefault;
        assert_eq!(p.to_string().parse::<PropertyIdentifier>().unwrap(), p);
    }

    #[test]
    fn test_value_parse() {
        assert_eq!(PropertyValue::parse("null"), PropertyValue::Null);
        assert_eq!(PropertyValue::parse("active"), PropertyValue::Boolean(true));
        assert_eq!(PropertyValue::parse("8"), PropertyValue::Unsigned(8));
        assert_eq!(PropertyValue::parse("-3"), PropertyValue::Signed(-3));
        assert_eq!(PropertyValue::parse("72.5"), PropertyValue::Real(72.5));
        assert_eq!(
            PropertyValue::parse("Zone 4"),
            PropertyValue::CharacterString("Zone 4".to_string())
        );
    }

    #[test]
    fn test_value_to_json() {
        let value = PropertyValue::Array(vec![
            PropertyValue::ObjectIdentifier(ObjectId::new(ObjectType::AnalogInput, 3)),
            PropertyValue::Real(1.5),
        ]);
        assert_eq!(
            value.to_json(),
            serde_json::json!([{ "type": "analog-input", "instance": 3 }, 1.5])
        );
    }

    #[test]
    fn test_property_key_display() {
        let key = PropertyKey::present_value(1001, ObjectType::AnalogValue, 7);
        assert_eq!(key.to_string(), "1001 analog-value:7 present-value");
    }
}
