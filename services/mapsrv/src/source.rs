//! Source collaborators: producers of the initial device/model/protocol maps.
//!
//! A source is anything that can deliver a device profile: the bundled JSON
//! document reader below, or a control-plane registration client. The panel
//! consumes both through the same trait. Cross-reference errors are fatal at
//! load time; no partial device set is produced.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use twin_model::{
    DataProperty, DeviceInstance, DeviceModel, DeviceProfile, ProfileInstance, ProtocolConfig,
    Twin,
};

use crate::error::{ErrorExt, MapperError, Result};

/// The three registry maps produced by a source.
#[derive(Debug, Default)]
pub struct ProfileMaps {
    pub devices: HashMap<String, DeviceInstance>,
    pub models: HashMap<String, DeviceModel>,
    pub protocols: HashMap<String, ProtocolConfig>,
}

/// Producer of the initial device/model/protocol maps.
#[async_trait]
pub trait Source: Send + Sync {
    async fn load_profile(&self) -> Result<ProfileMaps>;
}

/// Source reading a device-profile JSON document from disk.
pub struct JsonProfileSource {
    path: PathBuf,
}

impl JsonProfileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Source for JsonProfileSource {
    async fn load_profile(&self) -> Result<ProfileMaps> {
        let raw = tokio::fs::read(&self.path)
            .await
            .config_error(&format!("read profile {}", self.path.display()))?;
        let profile: DeviceProfile = serde_json::from_slice(&raw)
            .config_error(&format!("parse profile {}", self.path.display()))?;
        resolve_profile(profile)
    }
}

/// Resolve a raw profile document into the registry maps, validating every
/// cross-reference (instance → protocol, visitor → model property,
/// twin/data → visitor).
pub fn resolve_profile(profile: DeviceProfile) -> Result<ProfileMaps> {
    let models: HashMap<String, DeviceModel> = profile
        .device_models
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect();
    let protocols: HashMap<String, ProtocolConfig> = profile
        .protocols
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect();

    let mut devices = HashMap::new();
    for instance in profile.device_instances {
        let id = instance.id.clone();
        if devices.contains_key(&id) {
            return Err(MapperError::config(format!("duplicate device id {id:?}")));
        }
        let device = resolve_instance(instance, &models, &protocols)?;
        debug!(device = %id, twins = device.twins.len(), "resolved device");
        devices.insert(id, device);
    }

    Ok(ProfileMaps {
        devices,
        models,
        protocols,
    })
}

fn resolve_instance(
    instance: ProfileInstance,
    models: &HashMap<String, DeviceModel>,
    protocols: &HashMap<String, ProtocolConfig>,
) -> Result<DeviceInstance> {
    let id = &instance.id;

    let protocol = protocols.get(&instance.protocol).ok_or_else(|| {
        MapperError::config(format!(
            "device {id:?}: protocol {:?} not found",
            instance.protocol
        ))
    })?;
    let model = models.get(&instance.model).ok_or_else(|| {
        MapperError::config(format!(
            "device {id:?}: device model {:?} not found",
            instance.model
        ))
    })?;

    // Every visitor must address a real property of its model.
    for visitor in &instance.property_visitors {
        let model_name = if visitor.model_name.is_empty() {
            &instance.model
        } else {
            &visitor.model_name
        };
        let visited_model = models.get(model_name).ok_or_else(|| {
            MapperError::config(format!(
                "device {id:?}: visitor model {model_name:?} not found"
            ))
        })?;
        if visited_model.property(&visitor.property_name).is_none() {
            return Err(MapperError::config(format!(
                "device {id:?}: property {:?} not found in model {model_name:?}",
                visitor.property_name
            )));
        }
    }

    let find_visitor = |property_name: &str| {
        instance
            .property_visitors
            .iter()
            .find(|v| v.property_name == property_name)
            .cloned()
            .ok_or_else(|| {
                MapperError::config(format!(
                    "device {id:?}: property visitor for {property_name:?} not found"
                ))
            })
    };

    let mut twins = Vec::with_capacity(instance.twins.len());
    for twin in &instance.twins {
        let visitor = find_visitor(&twin.property_name)?;
        let property = model.property(&twin.property_name).ok_or_else(|| {
            MapperError::config(format!(
                "device {id:?}: property {:?} not found in model {:?}",
                twin.property_name, instance.model
            ))
        })?;

        let mut desired = twin.desired.clone();
        let mut reported = twin.reported.clone();
        // The model is authoritative for the value type.
        desired.metadata.value_type = property.data_type;
        reported.metadata.value_type = property.data_type;

        twins.push(Twin {
            property_name: twin.property_name.clone(),
            property: property.clone(),
            visitor,
            desired,
            reported,
        });
    }

    let mut data_properties = Vec::with_capacity(instance.data_properties.len());
    for data in &instance.data_properties {
        let visitor = find_visitor(&data.property_name)?;
        let property = model.property(&data.property_name).ok_or_else(|| {
            MapperError::config(format!(
                "device {id:?}: property {:?} not found in model {:?}",
                data.property_name, instance.model
            ))
        })?;
        data_properties.push(DataProperty {
            property_name: data.property_name.clone(),
            data_type: property.data_type,
            visitor,
        });
    }

    let name = if instance.name.is_empty() {
        instance.id.clone()
    } else {
        instance.name
    };
    Ok(DeviceInstance {
        id: instance.id,
        name,
        protocol_name: instance.protocol,
        model_name: instance.model,
        twins,
        data_properties,
        protocol: protocol.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn profile_json() -> serde_json::Value {
        serde_json::json!({
            "deviceInstances": [{
                "id": "pump-01",
                "name": "feed pump",
                "protocol": "virt-chan",
                "model": "pump",
                "twins": [{"propertyName": "speed", "desired": {"value": "0"}}],
                "dataProperties": [{"propertyName": "temperature"}],
                "propertyVisitors": [
                    {"propertyName": "speed", "register": "HoldingRegister", "offset": 0, "limit": 2},
                    {"propertyName": "temperature", "register": "InputRegister", "offset": 4, "limit": 1}
                ]
            }],
            "deviceModels": [{
                "name": "pump",
                "properties": [
                    {"name": "speed", "dataType": "int", "accessMode": "ReadWrite"},
                    {"name": "temperature", "dataType": "int", "accessMode": "ReadOnly"}
                ]
            }],
            "protocols": [{"name": "virt-chan", "protocol": "virtual"}]
        })
    }

    #[test]
    fn resolves_valid_profile() {
        let profile: DeviceProfile = serde_json::from_value(profile_json()).unwrap();
        let maps = resolve_profile(profile).unwrap();
        assert_eq!(maps.devices.len(), 1);
        assert_eq!(maps.models.len(), 1);
        assert_eq!(maps.protocols.len(), 1);

        let device = &maps.devices["pump-01"];
        assert_eq!(device.name, "feed pump");
        assert_eq!(device.twins.len(), 1);
        assert_eq!(device.twins[0].visitor.register, "HoldingRegister");
        assert_eq!(
            device.twins[0].desired.metadata.value_type,
            twin_model::DataType::Int
        );
        assert_eq!(device.data_properties.len(), 1);
        assert_eq!(device.data_properties[0].visitor.offset, 4);
    }

    #[test]
    fn unknown_protocol_is_fatal() {
        let mut json = profile_json();
        json["deviceInstances"][0]["protocol"] = "missing".into();
        let profile: DeviceProfile = serde_json::from_value(json).unwrap();
        let err = resolve_profile(profile).unwrap_err();
        assert!(err.to_string().contains("protocol"));
    }

    #[test]
    fn twin_without_visitor_is_fatal() {
        let mut json = profile_json();
        json["deviceInstances"][0]["propertyVisitors"]
            .as_array_mut()
            .unwrap()
            .remove(0);
        let profile: DeviceProfile = serde_json::from_value(json).unwrap();
        let err = resolve_profile(profile).unwrap_err();
        assert!(err.to_string().contains("visitor"));
    }

    #[test]
    fn visitor_for_unknown_property_is_fatal() {
        let mut json = profile_json();
        json["deviceInstances"][0]["propertyVisitors"][0]["propertyName"] = "vibration".into();
        let profile: DeviceProfile = serde_json::from_value(json).unwrap();
        assert!(resolve_profile(profile).is_err());
    }

    #[test]
    fn duplicate_device_id_is_fatal() {
        let mut json = profile_json();
        let dup = json["deviceInstances"][0].clone();
        json["deviceInstances"].as_array_mut().unwrap().push(dup);
        let profile: DeviceProfile = serde_json::from_value(json).unwrap();
        let err = resolve_profile(profile).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[tokio::test]
    async fn json_source_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(profile_json().to_string().as_bytes()).unwrap();

        let source = JsonProfileSource::new(file.path());
        let maps = source.load_profile().await.unwrap();
        assert!(maps.devices.contains_key("pump-01"));
    }

    #[tokio::test]
    async fn missing_file_is_a_config_error() {
        let source = JsonProfileSource::new("/nonexistent/profile.json");
        assert!(matches!(
            source.load_profile().await.unwrap_err(),
            MapperError::Config(_)
        ));
    }
}
