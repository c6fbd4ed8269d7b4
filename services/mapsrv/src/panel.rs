//! Device panel: the registry and lifecycle controller.
//!
//! Owns the device/model/protocol maps and one cancellation token per
//! device. The central invariant: a cancellation token exists for a device
//! ID iff that device's polling tasks are running, and there is never more
//! than one live polling generation per ID — updates always stop the old
//! generation before starting the new one.
//!
//! Lock order (outermost first): registry lock, device twin lock, driver
//! I/O mutex. The registry lock is never held across an await.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use twin_model::{
    DataProperty, DeviceInstance, DeviceModel, DeviceStatus, DeviceTwinDelta, DeviceTwinUpdate,
    ProtocolConfig, Twin, TwinProperty, TwinStatus,
};

use crate::codec;
use crate::drivers::{DriverRegistry, ProtocolDriver};
use crate::error::{MapperError, Result};
use crate::poller::{
    sample_property, PropertyPoller, ReportMode, StatusPoller, UpdateKind, DEFAULT_COLLECT_CYCLE,
};
use crate::sink::Sink;
use crate::source::Source;

// ============================================================================
// Settings
// ============================================================================

/// Tunables applied to every device loop.
#[derive(Debug, Clone)]
pub struct PanelSettings {
    /// Collection cycle used when a visitor leaves it unset.
    pub default_collect_cycle: Duration,
    /// Reconnect-and-retry attempts for driver reads/writes.
    pub retries: usize,
    /// Publish every sample instead of suppressing unchanged values.
    pub always_publish: bool,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            default_collect_cycle: DEFAULT_COLLECT_CYCLE,
            retries: 3,
            always_publish: false,
        }
    }
}

// ============================================================================
// Active device
// ============================================================================

/// Runtime state of one registered device.
///
/// The twins vector sits behind the device's own lock, so desired/reported
/// updates on one device never contend with other devices.
pub struct ActiveDevice {
    pub id: String,
    pub name: String,
    pub model_name: String,
    pub protocol_name: String,
    protocol: ProtocolConfig,
    data_properties: Vec<DataProperty>,
    twins: RwLock<Vec<Twin>>,
}

impl ActiveDevice {
    pub(crate) fn new(instance: DeviceInstance) -> Self {
        Self {
            id: instance.id,
            name: instance.name,
            model_name: instance.model_name,
            protocol_name: instance.protocol_name,
            protocol: instance.protocol,
            data_properties: instance.data_properties,
            twins: RwLock::new(instance.twins),
        }
    }

    pub fn protocol(&self) -> &ProtocolConfig {
        &self.protocol
    }

    /// Full snapshot as a plain instance (twins cloned under the device lock).
    pub fn instance(&self) -> DeviceInstance {
        DeviceInstance {
            id: self.id.clone(),
            name: self.name.clone(),
            protocol_name: self.protocol_name.clone(),
            model_name: self.model_name.clone(),
            twins: self.twins.read().clone(),
            data_properties: self.data_properties.clone(),
            protocol: self.protocol.clone(),
        }
    }

    pub(crate) fn twins_snapshot(&self) -> Vec<Twin> {
        self.twins.read().clone()
    }

    pub(crate) fn data_properties(&self) -> &[DataProperty] {
        &self.data_properties
    }

    /// Record a freshly read value as the twin's reported state.
    pub(crate) fn set_reported(&self, property_name: &str, value: &str) {
        let mut twins = self.twins.write();
        if let Some(twin) = twins.iter_mut().find(|t| t.property_name == property_name) {
            twin.reported.value = value.to_string();
            twin.reported.metadata.timestamp = chrono::Utc::now().timestamp_millis();
        }
    }

    pub fn desired_value(&self, property_name: &str) -> Option<String> {
        self.twins
            .read()
            .iter()
            .find(|t| t.property_name == property_name)
            .map(|t| t.desired.value.clone())
    }

    /// Mutate the desired value, returning the updated twin (for the write)
    /// and the previous desired state (for rollback on write failure).
    fn set_desired(&self, property_name: &str, value: &str) -> Result<(Twin, TwinProperty)> {
        let mut twins = self.twins.write();
        let twin = twins
            .iter_mut()
            .find(|t| t.property_name == property_name)
            .ok_or_else(|| MapperError::not_found(format!("twin {property_name:?}")))?;
        if twin.property.access_mode.is_read_only() {
            return Err(MapperError::validation(format!(
                "property {property_name:?} is read-only"
            )));
        }
        let previous = twin.desired.clone();
        twin.desired.value = value.to_string();
        twin.desired.metadata.timestamp = chrono::Utc::now().timestamp_millis();
        Ok((twin.clone(), previous))
    }

    fn restore_desired(&self, property_name: &str, previous: TwinProperty) {
        let mut twins = self.twins.write();
        if let Some(twin) = twins.iter_mut().find(|t| t.property_name == property_name) {
            twin.desired = previous;
        }
    }

    /// Reported values as a status snapshot for upstream reports.
    pub(crate) fn twin_statuses(&self) -> Vec<TwinStatus> {
        self.twins
            .read()
            .iter()
            .map(|t| TwinStatus {
                property_name: t.property_name.clone(),
                value: t.reported.value.clone(),
                value_type: t.property.data_type.as_str().to_string(),
            })
            .collect()
    }
}

// ============================================================================
// Panel
// ============================================================================

#[derive(Default)]
struct Registry {
    devices: HashMap<String, Arc<ActiveDevice>>,
    models: HashMap<String, DeviceModel>,
    protocols: HashMap<String, ProtocolConfig>,
}

/// Result of an on-demand twin read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TwinReadResult {
    pub property_name: String,
    pub payload: Vec<u8>,
}

/// The registry + lifecycle controller owning all device polling tasks.
pub struct DevPanel {
    registry: RwLock<Registry>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
    drivers: Arc<DriverRegistry>,
    sink: Arc<dyn Sink>,
    settings: PanelSettings,
}

impl DevPanel {
    pub fn new(drivers: Arc<DriverRegistry>, sink: Arc<dyn Sink>, settings: PanelSettings) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            cancels: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            drivers,
            sink,
            settings,
        }
    }

    // ------------------------------------------------------------------
    // Init / start
    // ------------------------------------------------------------------

    /// Populate the registry maps from a source collaborator.
    ///
    /// Only valid before polling starts; afterwards changes go through
    /// update/remove.
    pub async fn dev_init(&self, source: &dyn Source) -> Result<()> {
        if !self.cancels.lock().is_empty() {
            return Err(MapperError::validation(
                "device panel already started; use update/remove instead of re-init",
            ));
        }
        let maps = source.load_profile().await?;
        info!(
            devices = maps.devices.len(),
            models = maps.models.len(),
            protocols = maps.protocols.len(),
            "device registry initialized"
        );

        let mut registry = self.registry.write();
        registry.devices = maps
            .devices
            .into_iter()
            .map(|(id, instance)| (id, Arc::new(ActiveDevice::new(instance))))
            .collect();
        registry.models = maps.models;
        registry.protocols = maps.protocols;
        Ok(())
    }

    /// Launch the polling task set for every registered device.
    pub fn dev_start(self: &Arc<Self>) {
        let devices: Vec<Arc<ActiveDevice>> =
            self.registry.read().devices.values().cloned().collect();
        info!(count = devices.len(), "starting devices");
        for device in devices {
            self.spawn_device(device);
        }
    }

    fn spawn_device(self: &Arc<Self>, device: Arc<ActiveDevice>) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .cancels
            .lock()
            .insert(device.id.clone(), token.clone())
        {
            // Should only happen if a caller bypassed update_dev; never let
            // two generations run for one ID.
            warn!(device = %device.id, "replacing live polling generation");
            previous.cancel();
        }
        let panel = Arc::clone(self);
        let _ = self.tracker.spawn(async move {
            panel.run_device(device, token).await;
        });
    }

    /// Bring one device up: resolve its driver, connect, push writable
    /// desired values once, then fan out the per-property and status loops.
    async fn run_device(self: Arc<Self>, device: Arc<ActiveDevice>, token: CancellationToken) {
        let driver = match self.drivers.create(device.protocol()).await {
            Ok(driver) => driver,
            Err(err) => {
                error!(device = %device.id, %err, "driver creation failed");
                let _ = self
                    .sink
                    .report_device_status(&device.id, DeviceStatus::Disconnected, &[])
                    .await;
                return;
            },
        };

        if let Err(err) = driver.connect().await {
            // Not fatal: the status loop reports DISCONNECTED and reads
            // retry through the reconnect helpers.
            warn!(device = %device.id, %err, "initial connect failed");
        }

        for twin in device.twins_snapshot() {
            self.write_desired(&device, &twin, driver.as_ref()).await;
        }

        let report_mode = if self.settings.always_publish {
            ReportMode::Always
        } else {
            ReportMode::OnChange
        };

        for twin in device.twins_snapshot() {
            let _ = self.tracker.spawn(
                PropertyPoller {
                    device: device.clone(),
                    property_name: twin.property_name.clone(),
                    data_type: twin.property.data_type,
                    visitor: twin.visitor.clone(),
                    kind: UpdateKind::Twin,
                    report_mode,
                    driver: driver.clone(),
                    sink: self.sink.clone(),
                    retries: self.settings.retries,
                    default_cycle: self.settings.default_collect_cycle,
                }
                .run(token.clone()),
            );
        }

        for data in device.data_properties() {
            let _ = self.tracker.spawn(
                PropertyPoller {
                    device: device.clone(),
                    property_name: data.property_name.clone(),
                    data_type: data.data_type,
                    visitor: data.visitor.clone(),
                    kind: UpdateKind::Data,
                    report_mode,
                    driver: driver.clone(),
                    sink: self.sink.clone(),
                    retries: self.settings.retries,
                    default_cycle: self.settings.default_collect_cycle,
                }
                .run(token.clone()),
            );
        }

        let _ = self.tracker.spawn(
            StatusPoller {
                device: device.clone(),
                driver,
                sink: self.sink.clone(),
            }
            .run(token.clone()),
        );

        debug!(device = %device.id, "device loops started");
        token.cancelled().await;
        debug!(device = %device.id, "device stopped");
    }

    /// Push a twin's desired value to the device if the property is
    /// writable. Failures are logged, never fatal to the loop.
    async fn write_desired(&self, device: &ActiveDevice, twin: &Twin, driver: &dyn ProtocolDriver) {
        if twin.property.access_mode.is_read_only() {
            debug!(device = %device.id, property = %twin.property_name, "skipping read-only register");
            return;
        }
        if twin.desired.value.is_empty() {
            return;
        }
        let raw = match codec::encode(
            twin.property.data_type,
            &twin.desired.value,
            write_width(&twin.visitor),
        ) {
            Ok(raw) => raw,
            Err(err) => {
                error!(device = %device.id, property = %twin.property_name, %err, "desired value convert failed");
                return;
            },
        };
        if let Err(err) = driver
            .set_with_retry(&twin.visitor, &raw, self.settings.retries)
            .await
        {
            error!(device = %device.id, property = %twin.property_name, %err, "desired value write failed");
        }
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    fn device(&self, device_id: &str) -> Result<Arc<ActiveDevice>> {
        self.registry
            .read()
            .devices
            .get(device_id)
            .cloned()
            .ok_or_else(|| MapperError::device_not_found(device_id))
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.registry.read().devices.keys().cloned().collect()
    }

    /// Registry snapshot of a device without touching the wire.
    pub fn device_snapshot(&self, device_id: &str) -> Result<DeviceInstance> {
        Ok(self.device(device_id)?.instance())
    }

    /// IDs with a live polling generation.
    pub fn running_ids(&self) -> Vec<String> {
        self.cancels.lock().keys().cloned().collect()
    }

    pub fn get_model(&self, model_name: &str) -> Result<DeviceModel> {
        self.registry
            .read()
            .models
            .get(model_name)
            .cloned()
            .ok_or_else(|| MapperError::not_found(format!("device model {model_name:?}")))
    }

    pub fn update_model(&self, model: DeviceModel) {
        self.registry.write().models.insert(model.name.clone(), model);
    }

    pub fn remove_model(&self, model_name: &str) {
        self.registry.write().models.remove(model_name);
    }

    pub fn model_names(&self) -> Vec<String> {
        self.registry.read().models.keys().cloned().collect()
    }

    pub fn protocol_names(&self) -> Vec<String> {
        self.registry.read().protocols.keys().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Hot update / remove
    // ------------------------------------------------------------------

    /// Replace a device's definition: the old polling generation is stopped
    /// first, then the maps are updated and a fresh generation starts.
    pub fn update_dev(
        self: &Arc<Self>,
        model: DeviceModel,
        instance: DeviceInstance,
        protocol: ProtocolConfig,
    ) {
        if let Err(err) = self.stop_device(&instance.id) {
            debug!(device = %instance.id, %err, "no running generation to stop");
        }

        let device = Arc::new(ActiveDevice::new(instance));
        {
            let mut registry = self.registry.write();
            registry.devices.insert(device.id.clone(), device.clone());
            registry.models.insert(model.name.clone(), model);
            registry.protocols.insert(protocol.name.clone(), protocol);
        }
        self.spawn_device(device);
    }

    /// Replace only the twins of an existing device, keeping its model and
    /// protocol (control-plane partial updates).
    pub fn update_dev_twins(self: &Arc<Self>, device_id: &str, twins: Vec<Twin>) -> Result<()> {
        let device = self.device(device_id)?;
        let mut instance = device.instance();
        instance.twins = twins;

        let (model, protocol) = {
            let registry = self.registry.read();
            let model = registry
                .models
                .get(&instance.model_name)
                .cloned()
                .ok_or_else(|| {
                    MapperError::not_found(format!("device model {:?}", instance.model_name))
                })?;
            let protocol = registry
                .protocols
                .get(&instance.protocol_name)
                .cloned()
                .ok_or_else(|| {
                    MapperError::not_found(format!("protocol {:?}", instance.protocol_name))
                })?;
            (model, protocol)
        };

        self.update_dev(model, instance, protocol);
        Ok(())
    }

    /// Stop a device's polling generation (the token is removed; tasks exit
    /// at their next tick boundary).
    pub fn stop_device(&self, device_id: &str) -> Result<()> {
        let token = self
            .cancels
            .lock()
            .remove(device_id)
            .ok_or_else(|| MapperError::device_not_found(device_id))?;
        token.cancel();
        Ok(())
    }

    /// Stop and deregister a device. Models and protocols no other device
    /// references are garbage-collected from the maps.
    pub fn remove_device(&self, device_id: &str) -> Result<()> {
        let removed = {
            let mut registry = self.registry.write();
            let removed = registry
                .devices
                .remove(device_id)
                .ok_or_else(|| MapperError::device_not_found(device_id))?;

            let model_in_use = registry
                .devices
                .values()
                .any(|d| d.model_name == removed.model_name);
            if !model_in_use {
                registry.models.remove(&removed.model_name);
            }
            let protocol_in_use = registry
                .devices
                .values()
                .any(|d| d.protocol_name == removed.protocol_name);
            if !protocol_in_use {
                registry.protocols.remove(&removed.protocol_name);
            }
            removed
        };

        if let Err(err) = self.stop_device(device_id) {
            debug!(device = %removed.id, %err, "device had no running generation");
        }
        info!(device = %device_id, "device removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// On-demand read of one twin (or all twins) through the same driver and
    /// decode path the pollers use. Never served from a cache.
    pub async fn deal_device_twin_get(
        &self,
        device_id: &str,
        property_name: Option<&str>,
    ) -> Result<Vec<TwinReadResult>> {
        let device = self.device(device_id)?;
        let driver = self.drivers.create(device.protocol()).await?;

        let twins = device.twins_snapshot();
        let mut results = Vec::new();
        for twin in &twins {
            if let Some(wanted) = property_name {
                if twin.property_name != wanted {
                    continue;
                }
            }
            let value = sample_property(
                driver.as_ref(),
                &twin.visitor,
                twin.property.data_type,
                self.settings.retries,
            )
            .await?;
            device.set_reported(&twin.property_name, &value);
            let payload = serde_json::to_vec(&DeviceTwinUpdate::new(
                &twin.property_name,
                twin.property.data_type,
                &value,
            ))?;
            results.push(TwinReadResult {
                property_name: twin.property_name.clone(),
                payload,
            });
        }

        if results.is_empty() {
            if let Some(wanted) = property_name {
                return Err(MapperError::not_found(format!("twin {wanted:?}")));
            }
        }
        Ok(results)
    }

    /// Snapshot a device with freshly sampled reported values.
    pub async fn get_device(&self, device_id: &str) -> Result<DeviceInstance> {
        self.deal_device_twin_get(device_id, None).await?;
        Ok(self.device(device_id)?.instance())
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write a desired value to the device: validate access mode, translate
    /// to the declared type, dispatch through the driver. The in-memory
    /// desired value is rolled back if the write fails.
    pub async fn set_twin_desired(
        &self,
        device_id: &str,
        property_name: &str,
        value: &str,
    ) -> Result<()> {
        let device = self.device(device_id)?;
        let (twin, previous) = device.set_desired(property_name, value)?;

        let outcome = async {
            let raw = codec::encode(
                twin.property.data_type,
                value,
                write_width(&twin.visitor),
            )?;
            let driver = self.drivers.create(device.protocol()).await?;
            driver
                .set_with_retry(&twin.visitor, &raw, self.settings.retries)
                .await
        }
        .await;

        if let Err(err) = outcome {
            device.restore_desired(property_name, previous);
            return Err(err);
        }
        debug!(device = %device_id, property = %property_name, %value, "desired value written");
        Ok(())
    }

    /// Apply an inbound twin delta: unchanged desired values are skipped,
    /// the rest are written. Per-property failures are logged and do not
    /// abort the remaining properties.
    pub async fn handle_twin_delta(&self, device_id: &str, delta: &DeviceTwinDelta) -> Result<()> {
        let device = self.device(device_id)?;
        for (property_name, value) in &delta.delta {
            if device.desired_value(property_name).as_deref() == Some(value.as_str()) {
                continue;
            }
            if let Err(err) = self.set_twin_desired(device_id, property_name, value).await {
                error!(device = %device_id, property = %property_name, %err, "delta write failed");
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop every device loop, wait for them to wind down, and close all
    /// pooled drivers. Stop failures are logged, never raised.
    pub async fn shutdown(&self) {
        info!("shutting down device panel");
        let tokens: Vec<(String, CancellationToken)> =
            self.cancels.lock().drain().collect();
        for (id, token) in tokens {
            debug!(device = %id, "cancelling");
            token.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.drivers.pool().close_all().await;
        info!("device panel stopped");
    }
}

/// Byte width a written value must occupy for a visitor: one byte for bit
/// registers, two bytes per register otherwise.
fn write_width(visitor: &twin_model::PropertyVisitor) -> usize {
    let lower = visitor.register.to_ascii_lowercase();
    if lower.contains("coil") || lower.contains("discrete") {
        1
    } else {
        visitor.register_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{default_driver_registry, DriverFactory, DriverPool};
    use crate::sink::RecordingSink;
    use crate::source::{resolve_profile, ProfileMaps};
    use async_trait::async_trait;
    use twin_model::{DeviceProfile, PropertyVisitor};

    struct MapSource(parking_lot::Mutex<Option<ProfileMaps>>);

    impl MapSource {
        fn new(maps: ProfileMaps) -> Self {
            Self(parking_lot::Mutex::new(Some(maps)))
        }
    }

    #[async_trait]
    impl Source for MapSource {
        async fn load_profile(&self) -> Result<ProfileMaps> {
            self.0
                .lock()
                .take()
                .ok_or_else(|| MapperError::config("profile already consumed"))
        }
    }

    fn maps(protocol_kind: &str) -> ProfileMaps {
        let profile: DeviceProfile = serde_json::from_value(serde_json::json!({
            "deviceInstances": [{
                "id": "pump-01",
                "name": "feed pump",
                "protocol": "chan-1",
                "model": "pump",
                "twins": [{"propertyName": "speed", "desired": {"value": "5"}}],
                "propertyVisitors": [{
                    "propertyName": "speed",
                    "register": "HoldingRegister",
                    "offset": 0,
                    "limit": 2,
                    "collectCycle": 20
                }]
            }],
            "deviceModels": [{
                "name": "pump",
                "properties": [{"name": "speed", "dataType": "int", "accessMode": "ReadWrite"}]
            }],
            "protocols": [{"name": "chan-1", "protocol": protocol_kind}]
        }))
        .unwrap();
        resolve_profile(profile).unwrap()
    }

    fn test_panel(protocol_kind: &str) -> (Arc<DevPanel>, Arc<RecordingSink>) {
        let drivers = Arc::new(default_driver_registry());
        if protocol_kind == "failing" {
            drivers.register(Arc::new(FailingFactory));
        }
        let sink = Arc::new(RecordingSink::new());
        let panel = Arc::new(DevPanel::new(
            drivers,
            sink.clone(),
            PanelSettings {
                default_collect_cycle: Duration::from_millis(20),
                retries: 1,
                always_publish: false,
            },
        ));
        (panel, sink)
    }

    // Driver whose writes always fail, for rollback tests.
    struct FailingDriver;

    #[async_trait]
    impl ProtocolDriver for FailingDriver {
        fn channel_key(&self) -> &str {
            "failing"
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn get(&self, _visitor: &PropertyVisitor) -> Result<Vec<u8>> {
            Err(MapperError::protocol("read refused"))
        }
        async fn set(&self, _visitor: &PropertyVisitor, _raw: &[u8]) -> Result<()> {
            Err(MapperError::protocol("write refused"))
        }
        async fn status(&self) -> DeviceStatus {
            DeviceStatus::Disconnected
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl DriverFactory for FailingFactory {
        fn protocol_names(&self) -> &'static [&'static str] {
            &["failing"]
        }
        async fn create(
            &self,
            _protocol: &ProtocolConfig,
            pool: &DriverPool,
        ) -> Result<Arc<dyn ProtocolDriver>> {
            pool.get_or_create("failing", || Ok(Arc::new(FailingDriver) as _))
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn dev_init_rejected_once_started() {
        let (panel, _sink) = test_panel("virtual");
        panel
            .dev_init(&MapSource::new(maps("virtual")))
            .await
            .unwrap();
        panel.dev_start();

        let err = panel
            .dev_init(&MapSource::new(maps("virtual")))
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::Validation(_)));
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn update_twice_leaves_one_generation() {
        let (panel, _sink) = test_panel("virtual");
        panel
            .dev_init(&MapSource::new(maps("virtual")))
            .await
            .unwrap();
        panel.dev_start();
        assert_eq!(panel.running_ids(), vec!["pump-01".to_string()]);

        let m = maps("virtual");
        let instance = m.devices["pump-01"].clone();
        let model = m.models["pump"].clone();
        let protocol = m.protocols["chan-1"].clone();

        panel.update_dev(model.clone(), instance.clone(), protocol.clone());
        panel.update_dev(model, instance, protocol);

        assert_eq!(panel.running_ids(), vec!["pump-01".to_string()]);
        assert_eq!(panel.device_ids(), vec!["pump-01".to_string()]);
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn remove_device_garbage_collects_maps() {
        let (panel, _sink) = test_panel("virtual");
        panel
            .dev_init(&MapSource::new(maps("virtual")))
            .await
            .unwrap();
        panel.dev_start();

        panel.remove_device("pump-01").unwrap();
        assert!(panel.device_ids().is_empty());
        assert!(panel.model_names().is_empty());
        assert!(panel.protocol_names().is_empty());
        assert!(panel.running_ids().is_empty());

        assert!(matches!(
            panel.remove_device("pump-01").unwrap_err(),
            MapperError::NotFound(_)
        ));
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn failed_write_rolls_back_desired_value() {
        let (panel, _sink) = test_panel("failing");
        panel
            .dev_init(&MapSource::new(maps("failing")))
            .await
            .unwrap();

        let err = panel
            .set_twin_desired("pump-01", "speed", "9")
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::Protocol(_)));

        let snapshot = panel.device_snapshot("pump-01").unwrap();
        assert_eq!(snapshot.twins[0].desired.value, "5");
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn delta_skips_unchanged_desired_values() {
        let (panel, _sink) = test_panel("failing");
        panel
            .dev_init(&MapSource::new(maps("failing")))
            .await
            .unwrap();

        // Same value as the current desired: no write attempted, no error,
        // nothing rolled back.
        let delta: DeviceTwinDelta = serde_json::from_value(serde_json::json!({
            "timestamp": 1, "delta": {"speed": "5"}
        }))
        .unwrap();
        panel.handle_twin_delta("pump-01", &delta).await.unwrap();
        assert_eq!(
            panel.device_snapshot("pump-01").unwrap().twins[0].desired.value,
            "5"
        );

        assert!(matches!(
            panel
                .handle_twin_delta("ghost", &delta)
                .await
                .unwrap_err(),
            MapperError::NotFound(_)
        ));
        panel.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_device_operations_return_not_found() {
        let (panel, _sink) = test_panel("virtual");
        assert!(matches!(
            panel.set_twin_desired("ghost", "speed", "1").await.unwrap_err(),
            MapperError::NotFound(_)
        ));
        assert!(matches!(
            panel.stop_device("ghost").unwrap_err(),
            MapperError::NotFound(_)
        ));
        assert!(matches!(
            panel.update_dev_twins("ghost", Vec::new()).unwrap_err(),
            MapperError::NotFound(_)
        ));
    }
}
