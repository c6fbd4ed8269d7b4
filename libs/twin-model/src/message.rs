//! Message envelopes and topic naming for twin/data/state events.
//!
//! Topic layout is kept wire-compatible with the upstream mapper
//! conventions: `$hw/events/device/<id>/twin/update[...]` for the internal
//! twin-synchronization path, `$ke/events/device/<id>/data/update` for
//! third-party telemetry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::device::{DataType, DeviceStatus};

/// Topic prefix for the twin-synchronization path.
pub const TWIN_TOPIC_PREFIX: &str = "$hw";
/// Topic prefix for third-party telemetry.
pub const DATA_TOPIC_PREFIX: &str = "$ke";

pub fn twin_update_topic(device_id: &str) -> String {
    format!("{TWIN_TOPIC_PREFIX}/events/device/{device_id}/twin/update")
}

pub fn twin_delta_topic(device_id: &str) -> String {
    format!("{TWIN_TOPIC_PREFIX}/events/device/{device_id}/twin/update/delta")
}

pub fn state_update_topic(device_id: &str) -> String {
    format!("{TWIN_TOPIC_PREFIX}/events/device/{device_id}/state/update")
}

pub fn data_update_topic(device_id: &str) -> String {
    format!("{DATA_TOPIC_PREFIX}/events/device/{device_id}/data/update")
}

/// Topic for full per-twin status reports (used by sinks that publish the
/// upstream report instead of calling a dedicated RPC).
pub fn state_report_topic(device_id: &str) -> String {
    format!("{TWIN_TOPIC_PREFIX}/events/device/{device_id}/state/report")
}

/// Extract the device ID from a twin-delta topic.
pub fn device_id_from_delta_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TWIN_TOPIC_PREFIX)
        .and_then(|t| t.strip_prefix("/events/device/"))
        .and_then(|t| t.strip_suffix("/twin/update/delta"))
        .filter(|id| !id.is_empty())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Envelopes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BaseMessage {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TwinValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TypeMetadata {
    #[serde(rename = "type")]
    pub value_type: String,
}

/// One twin entry inside a twin-update message.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MsgTwin {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<TwinValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<TwinValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TypeMetadata>,
}

/// Outbound twin update: freshly sampled actual values keyed by property.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceTwinUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub twin: HashMap<String, MsgTwin>,
}

impl DeviceTwinUpdate {
    /// Build a single-property twin update carrying `value` as the actual.
    pub fn new(property: &str, value_type: DataType, value: &str) -> Self {
        let mut twin = HashMap::new();
        twin.insert(
            property.to_string(),
            MsgTwin {
                expected: None,
                actual: Some(TwinValue {
                    value: Some(value.to_string()),
                }),
                metadata: Some(TypeMetadata {
                    value_type: value_type.as_str().to_string(),
                }),
            },
        );
        DeviceTwinUpdate {
            base: BaseMessage {
                timestamp: now_millis(),
            },
            twin,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataMetadata {
    #[serde(rename = "type")]
    pub value_type: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DataValue {
    pub value: String,
    pub metadata: DataMetadata,
}

/// Outbound telemetry for non-twin data properties.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceData {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub data: HashMap<String, DataValue>,
}

impl DeviceData {
    pub fn new(property: &str, value_type: DataType, value: &str) -> Self {
        let ts = now_millis();
        let mut data = HashMap::new();
        data.insert(
            property.to_string(),
            DataValue {
                value: value.to_string(),
                metadata: DataMetadata {
                    value_type: value_type.as_str().to_string(),
                    timestamp: ts,
                },
            },
        );
        DeviceData {
            base: BaseMessage { timestamp: ts },
            data,
        }
    }
}

/// Outbound device state ("OK" / "DISCONNECTED").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceStateUpdate {
    #[serde(flatten)]
    pub base: BaseMessage,
    pub state: String,
}

impl DeviceStateUpdate {
    pub fn new(status: DeviceStatus) -> Self {
        DeviceStateUpdate {
            base: BaseMessage {
                timestamp: now_millis(),
            },
            state: status.as_str().to_string(),
        }
    }
}

/// Inbound desired-value delta from the control plane or a peer subscriber.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceTwinDelta {
    #[serde(flatten)]
    pub base: BaseMessage,
    #[serde(default)]
    pub twin: HashMap<String, MsgTwin>,
    /// Changed desired values keyed by property name.
    #[serde(default)]
    pub delta: HashMap<String, String>,
}

/// Per-twin status snippet for upstream device-status reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinStatus {
    pub property_name: String,
    pub value: String,
    #[serde(rename = "type")]
    pub value_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_round_trip() {
        let topic = twin_delta_topic("sensor-01");
        assert_eq!(topic, "$hw/events/device/sensor-01/twin/update/delta");
        assert_eq!(device_id_from_delta_topic(&topic), Some("sensor-01"));
        assert_eq!(device_id_from_delta_topic("$hw/events/device//twin/update/delta"), None);
        assert_eq!(device_id_from_delta_topic("bogus"), None);
    }

    #[test]
    fn twin_update_carries_actual_and_type() {
        let msg = DeviceTwinUpdate::new("temperature", DataType::Int, "7");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["twin"]["temperature"]["actual"]["value"], "7");
        assert_eq!(json["twin"]["temperature"]["metadata"]["type"], "int");
        assert!(json["timestamp"].as_i64().unwrap() > 0);
        // expected side omitted entirely
        assert!(json["twin"]["temperature"].get("expected").is_none());
    }

    #[test]
    fn delta_parses_upstream_payload() {
        let raw = r#"{"timestamp": 1700000000000, "delta": {"switch": "1"}}"#;
        let delta: DeviceTwinDelta = serde_json::from_str(raw).unwrap();
        assert_eq!(delta.delta.get("switch").map(String::as_str), Some("1"));
    }
}
