//! Device models, properties and runtime device instances.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::ProtocolConfig;
use crate::visitor::PropertyVisitor;

// ============================================================================
// Property data types and access modes
// ============================================================================

/// Declared data type of a model property.
///
/// The spellings match the device-profile document ("int", "float", ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[default]
    Int,
    Float,
    Double,
    Boolean,
    String,
    Bytes,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Double => "double",
            DataType::Boolean => "boolean",
            DataType::String => "string",
            DataType::Bytes => "bytes",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access mode of a model property as seen from the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AccessMode {
    /// Property can only be read from the device.
    ReadOnly,
    /// Property can be read and written.
    #[default]
    ReadWrite,
}

impl AccessMode {
    pub fn is_read_only(&self) -> bool {
        matches!(self, AccessMode::ReadOnly)
    }
}

// ============================================================================
// Device model
// ============================================================================

/// One observable/controllable property of a device model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default)]
    pub default_value: Option<String>,
    #[serde(default)]
    pub minimum: Option<String>,
    #[serde(default)]
    pub maximum: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

/// A device model: a named, ordered set of properties.
///
/// Models are immutable once loaded and keyed by name in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceModel {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl DeviceModel {
    /// Look up a property by name.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties.iter().find(|p| p.name == name)
    }
}

// ============================================================================
// Twins
// ============================================================================

/// Type and timestamp metadata attached to a twin value.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValueMetadata {
    #[serde(rename = "type", default)]
    pub value_type: DataType,
    #[serde(default)]
    pub timestamp: i64,
}

/// One side (desired or reported) of a twin.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TwinProperty {
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub metadata: ValueMetadata,
}

/// The paired desired/reported state for one device property, bound to its
/// physical addressing rules.
///
/// `desired` is mutated by inbound write requests; `reported` is mutated only
/// after a successful read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Twin {
    pub property_name: String,
    /// The model property this twin observes (resolved at profile load).
    pub property: Property,
    /// Physical addressing + transcoding rules (resolved at profile load).
    pub visitor: PropertyVisitor,
    #[serde(default)]
    pub desired: TwinProperty,
    #[serde(default)]
    pub reported: TwinProperty,
}

/// A non-twin telemetry property: same visitor binding as a twin, but
/// one-way (device to sink) with no desired state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataProperty {
    pub property_name: String,
    #[serde(default)]
    pub data_type: DataType,
    pub visitor: PropertyVisitor,
}

// ============================================================================
// Device instance
// ============================================================================

/// A concrete device: a model bound to a protocol endpoint, with resolved
/// twins and data properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInstance {
    pub id: String,
    pub name: String,
    pub protocol_name: String,
    pub model_name: String,
    #[serde(default)]
    pub twins: Vec<Twin>,
    #[serde(default)]
    pub data_properties: Vec<DataProperty>,
    /// The bound protocol descriptor (resolved at profile load).
    pub protocol: ProtocolConfig,
}

impl DeviceInstance {
    pub fn twin(&self, property_name: &str) -> Option<&Twin> {
        self.twins.iter().find(|t| t.property_name == property_name)
    }

    pub fn twin_mut(&mut self, property_name: &str) -> Option<&mut Twin> {
        self.twins
            .iter_mut()
            .find(|t| t.property_name == property_name)
    }
}

// ============================================================================
// Device status
// ============================================================================

/// Connection status of a device as reported by its driver probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Ok,
    Disconnected,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Ok => "OK",
            DeviceStatus::Disconnected => "DISCONNECTED",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, DeviceStatus::Ok)
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
