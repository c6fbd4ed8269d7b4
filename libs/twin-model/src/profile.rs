//! The declarative device-profile document.
//!
//! This mirrors the JSON layout produced by the control plane (or written by
//! hand for standalone deployments): flat lists of device instances, device
//! models and protocols, cross-referenced by name. Resolution of those
//! references into runtime [`DeviceInstance`](crate::DeviceInstance) values
//! happens in the mapper's profile source, not here.

use serde::{Deserialize, Serialize};

use crate::device::{DeviceModel, TwinProperty};
use crate::protocol::ProtocolConfig;
use crate::visitor::PropertyVisitor;

/// Root of the device-profile document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    #[serde(default)]
    pub device_instances: Vec<ProfileInstance>,
    #[serde(default)]
    pub device_models: Vec<DeviceModel>,
    #[serde(default)]
    pub protocols: Vec<ProtocolConfig>,
}

/// A device instance as written in the profile: references by name, twins
/// and data properties not yet linked to their visitors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileInstance {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Name of an entry in `protocols`.
    pub protocol: String,
    /// Name of an entry in `deviceModels`.
    pub model: String,
    #[serde(default)]
    pub twins: Vec<ProfileTwin>,
    #[serde(default)]
    pub property_visitors: Vec<PropertyVisitor>,
    #[serde(default)]
    pub data_properties: Vec<ProfileDataProperty>,
}

/// A twin as written in the profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileTwin {
    pub property_name: String,
    #[serde(default)]
    pub desired: TwinProperty,
    #[serde(default)]
    pub reported: TwinProperty,
}

/// A one-way telemetry property as written in the profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileDataProperty {
    pub property_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_profile() {
        let raw = r#"{
            "deviceInstances": [{
                "id": "sensor-01",
                "name": "boiler sensor",
                "protocol": "modbus-tcp-01",
                "model": "temperature-sensor",
                "twins": [{"propertyName": "temperature", "desired": {"value": "20"}}],
                "propertyVisitors": [{
                    "propertyName": "temperature",
                    "modelName": "temperature-sensor",
                    "register": "HoldingRegister",
                    "offset": 0,
                    "limit": 1,
                    "collectCycle": 1000
                }]
            }],
            "deviceModels": [{
                "name": "temperature-sensor",
                "properties": [{"name": "temperature", "dataType": "int"}]
            }],
            "protocols": [{
                "name": "modbus-tcp-01",
                "protocol": "modbus-tcp",
                "protocolCommonConfig": {"host": "127.0.0.1", "port": 1502},
                "protocolConfig": {"slaveID": 1}
            }]
        }"#;
        let profile: DeviceProfile = serde_json::from_str(raw).unwrap();
        assert_eq!(profile.device_instances.len(), 1);
        assert_eq!(profile.device_models.len(), 1);
        assert_eq!(profile.protocols.len(), 1);
        let instance = &profile.device_instances[0];
        assert_eq!(instance.twins[0].desired.value, "20");
        assert_eq!(instance.property_visitors[0].collect_cycle, 1000);
    }
}
