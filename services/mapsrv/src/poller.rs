//! Twin, data and status pollers: the per-property sampling loops.
//!
//! Each property of each device runs its own loop: tick, read raw bytes
//! through the driver, decode, compare against the last published value, and
//! publish through the sink. Cancellation is cooperative and observed at
//! every tick boundary. Driver errors never unwind past the loop: the cycle
//! is logged and skipped.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use twin_model::{
    data_update_topic, state_update_topic, twin_update_topic, DataType, DeviceData,
    DeviceStateUpdate, DeviceTwinUpdate, PropertyVisitor,
};

use crate::codec;
use crate::drivers::ProtocolDriver;
use crate::error::Result;
use crate::panel::ActiveDevice;
use crate::sink::Sink;

/// Collection cycle used when the visitor leaves it zero/unset.
pub const DEFAULT_COLLECT_CYCLE: Duration = Duration::from_secs(1);
/// Fixed cycle of the per-device status probe.
pub const STATUS_CYCLE: Duration = Duration::from_secs(1);

/// Publish policy for a property loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportMode {
    /// Publish only when the decoded value differs from the last published
    /// one. Keeps duplicate reports off the control plane and the broker.
    OnChange,
    /// Publish every sample (legacy behavior).
    Always,
}

/// Which update stream a property loop feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Twin synchronization: payload routed to the twin-update topic and
    /// mirrored into the twin's reported value.
    Twin,
    /// Third-party telemetry: payload routed to the data-update topic only.
    Data,
}

/// One property's sampling loop.
pub(crate) struct PropertyPoller {
    pub device: Arc<ActiveDevice>,
    pub property_name: String,
    pub data_type: DataType,
    pub visitor: PropertyVisitor,
    pub kind: UpdateKind,
    pub report_mode: ReportMode,
    pub driver: Arc<dyn ProtocolDriver>,
    pub sink: Arc<dyn Sink>,
    pub retries: usize,
    pub default_cycle: Duration,
}

impl PropertyPoller {
    pub async fn run(self, token: CancellationToken) {
        // Negative cycle: never sample, only wait for cancellation.
        if self.visitor.collect_cycle < 0 {
            token.cancelled().await;
            return;
        }
        let period = if self.visitor.collect_cycle == 0 {
            self.default_cycle
        } else {
            Duration::from_millis(self.visitor.collect_cycle as u64)
        };

        let topic = match self.kind {
            UpdateKind::Twin => twin_update_topic(&self.device.id),
            UpdateKind::Data => data_update_topic(&self.device.id),
        };

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_published: Option<String> = None;

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(device = %self.device.id, property = %self.property_name, "poller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let value = match self.sample().await {
                        Ok(value) => value,
                        Err(err) => {
                            warn!(
                                device = %self.device.id,
                                property = %self.property_name,
                                %err,
                                "sample failed, skipping cycle"
                            );
                            continue;
                        },
                    };

                    if self.report_mode == ReportMode::OnChange
                        && last_published.as_deref() == Some(value.as_str())
                    {
                        continue;
                    }

                    if self.kind == UpdateKind::Twin {
                        self.device.set_reported(&self.property_name, &value);
                    }

                    let payload = match self.build_payload(&value) {
                        Ok(payload) => payload,
                        Err(err) => {
                            warn!(device = %self.device.id, property = %self.property_name, %err, "payload build failed");
                            continue;
                        },
                    };
                    match self.sink.publish(&topic, &payload).await {
                        Ok(()) => last_published = Some(value),
                        Err(err) => {
                            warn!(device = %self.device.id, topic = %topic, %err, "publish failed");
                        },
                    }
                }
            }
        }
    }

    /// One read through the driver plus decode; shared with the panel's
    /// on-demand read path.
    async fn sample(&self) -> Result<String> {
        sample_property(
            self.driver.as_ref(),
            &self.visitor,
            self.data_type,
            self.retries,
        )
        .await
    }

    fn build_payload(&self, value: &str) -> Result<Vec<u8>> {
        let payload = match self.kind {
            UpdateKind::Twin => {
                serde_json::to_vec(&DeviceTwinUpdate::new(&self.property_name, self.data_type, value))?
            },
            UpdateKind::Data => {
                serde_json::to_vec(&DeviceData::new(&self.property_name, self.data_type, value))?
            },
        };
        Ok(payload)
    }
}

/// Read the property through the driver and decode it per its visitor rules.
pub(crate) async fn sample_property(
    driver: &dyn ProtocolDriver,
    visitor: &PropertyVisitor,
    data_type: DataType,
    retries: usize,
) -> Result<String> {
    let raw = driver.get_with_retry(visitor, retries).await?;
    codec::decode(
        visitor.is_register_swap,
        visitor.is_swap,
        data_type,
        visitor.scale,
        &raw,
    )
}

/// Per-device connection status loop: probes the driver once a second,
/// publishes a state update and reports the twin snapshot upstream.
pub(crate) struct StatusPoller {
    pub device: Arc<ActiveDevice>,
    pub driver: Arc<dyn ProtocolDriver>,
    pub sink: Arc<dyn Sink>,
}

impl StatusPoller {
    pub async fn run(self, token: CancellationToken) {
        let topic = state_update_topic(&self.device.id);
        let mut ticker = tokio::time::interval(STATUS_CYCLE);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    debug!(device = %self.device.id, "status poller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let status = self.driver.status().await;

                    match serde_json::to_vec(&DeviceStateUpdate::new(status)) {
                        Ok(payload) => {
                            if let Err(err) = self.sink.publish(&topic, &payload).await {
                                warn!(device = %self.device.id, %err, "state publish failed");
                            }
                        },
                        Err(err) => warn!(device = %self.device.id, %err, "state payload build failed"),
                    }

                    let twins = self.device.twin_statuses();
                    if let Err(err) = self
                        .sink
                        .report_device_status(&self.device.id, status, &twins)
                        .await
                    {
                        warn!(device = %self.device.id, %err, "status report failed");
                    }
                }
            }
        }
    }
}
