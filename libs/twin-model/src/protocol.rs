//! Protocol descriptors.

use serde::{Deserialize, Serialize};

/// A named protocol binding shared by one or more device instances.
///
/// `common_config` describes the physical channel (serial port parameters,
/// host/port, ...) and is shared by every device on that channel;
/// `device_config` carries per-device settings (slave/unit ID, node ID, ...).
/// Both blobs are opaque to the device panel: each driver deserializes its
/// own schema out of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    pub name: String,
    /// Protocol kind tag, e.g. "modbus-tcp", "modbus-rtu", "virtual".
    #[serde(rename = "protocol")]
    pub kind: String,
    #[serde(default = "empty_object", rename = "protocolCommonConfig")]
    pub common_config: serde_json::Value,
    #[serde(default = "empty_object", rename = "protocolConfig")]
    pub device_config: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl ProtocolConfig {
    /// Two protocol entries with equal kind and common config are expected
    /// to share one driver instance (one physical channel).
    pub fn same_channel(&self, other: &ProtocolConfig) -> bool {
        self.kind == other.kind && self.common_config == other.common_config
    }
}
