//! Sink collaborators: the outward publish/report path.
//!
//! The mapper hands sinks already-encoded payloads; transports (MQTT broker,
//! gRPC upstream) live behind this trait. `LogSink` is the default wiring,
//! `MqttSink` (feature `mqtt`) publishes to a broker, and `RecordingSink`
//! captures traffic for tests and embedders.

use async_trait::async_trait;
use parking_lot::Mutex;

use twin_model::{DeviceStatus, TwinStatus};

use crate::error::Result;

/// Outward publish/report path consumed by the pollers and the panel.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Publish an already-encoded event payload on a topic.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Report a device's connection status and per-twin values upstream.
    async fn report_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        twins: &[TwinStatus],
    ) -> Result<()>;
}

// ============================================================================
// Log sink
// ============================================================================

/// Sink that writes every event to the log. Default when no transport is
/// configured; useful for bring-up and debugging.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        tracing::info!(%topic, payload = %String::from_utf8_lossy(payload), "publish");
        Ok(())
    }

    async fn report_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        twins: &[TwinStatus],
    ) -> Result<()> {
        tracing::debug!(device = %device_id, status = %status, twins = twins.len(), "device status");
        Ok(())
    }
}

// ============================================================================
// Recording sink
// ============================================================================

/// Sink that records every publish and status report in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    statuses: Mutex<Vec<(String, DeviceStatus)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All `(topic, payload)` pairs published so far.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().clone()
    }

    /// Payloads published on one topic.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    /// All `(device_id, status)` reports so far.
    pub fn statuses(&self) -> Vec<(String, DeviceStatus)> {
        self.statuses.lock().clone()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
        self.statuses.lock().clear();
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.published
            .lock()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn report_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
        _twins: &[TwinStatus],
    ) -> Result<()> {
        self.statuses.lock().push((device_id.to_string(), status));
        Ok(())
    }
}

// ============================================================================
// MQTT sink
// ============================================================================

#[cfg(feature = "mqtt")]
pub use mqtt::MqttSink;

#[cfg(feature = "mqtt")]
mod mqtt {
    use super::*;
    use crate::error::MapperError;
    use rumqttc::{AsyncClient, MqttOptions, QoS};
    use std::time::Duration;
    use twin_model::state_report_topic;

    /// Sink publishing to an MQTT broker.
    ///
    /// Status reports are serialized to the device's state-report topic so
    /// upstream consumers see the same payload a gRPC reporter would send.
    pub struct MqttSink {
        client: AsyncClient,
    }

    impl MqttSink {
        /// Connect to `host:port` and spawn the event loop.
        pub fn new(client_id: &str, host: &str, port: u16) -> Self {
            let mut options = MqttOptions::new(client_id, host, port);
            options.set_keep_alive(Duration::from_secs(30));
            options.set_clean_session(true);

            let (client, mut eventloop) = AsyncClient::new(options, 64);
            tokio::spawn(async move {
                loop {
                    if let Err(err) = eventloop.poll().await {
                        tracing::warn!(%err, "mqtt event loop error, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            });

            Self { client }
        }
    }

    #[async_trait]
    impl Sink for MqttSink {
        async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
            self.client
                .publish(topic, QoS::AtMostOnce, false, payload)
                .await
                .map_err(|e| MapperError::sink(format!("mqtt publish: {e}")))
        }

        async fn report_device_status(
            &self,
            device_id: &str,
            status: DeviceStatus,
            twins: &[TwinStatus],
        ) -> Result<()> {
            let payload = serde_json::json!({
                "state": status.as_str(),
                "twins": twins,
            });
            self.publish(
                &state_report_topic(device_id),
                payload.to_string().as_bytes(),
            )
            .await
        }
    }
}
