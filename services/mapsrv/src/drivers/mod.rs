//! Protocol drivers: per-protocol adapters exposing a narrow read/write
//! contract over a physical channel.
//!
//! One driver instance is shared by every logical register on the same
//! physical channel (see [`pool::DriverPool`]); each driver serializes its
//! own physical I/O internally, since the underlying transports (RS-485 bus,
//! single TCP session) do not tolerate overlapping requests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

use twin_model::{DeviceStatus, PropertyVisitor, ProtocolConfig};

use crate::error::{MapperError, Result};

#[cfg(feature = "modbus")]
pub mod modbus;
pub mod pool;
pub mod virt;

pub use pool::DriverPool;

// ============================================================================
// Driver trait
// ============================================================================

/// The capability set every protocol driver implements.
///
/// `get`/`set` receive the full property visitor; drivers interpret the
/// register kind, offset and limit themselves and may read protocol-specific
/// extras from `customized_values`. A failed call is local to that cycle:
/// callers log and skip, they never tear the driver down.
#[async_trait]
pub trait ProtocolDriver: Send + Sync {
    /// Stable identity of the physical channel this driver owns.
    fn channel_key(&self) -> &str;

    /// Establish the physical connection.
    async fn connect(&self) -> Result<()>;

    /// Read the raw bytes addressed by `visitor`.
    async fn get(&self, visitor: &PropertyVisitor) -> Result<Vec<u8>>;

    /// Write pre-encoded bytes to the location addressed by `visitor`.
    async fn set(&self, visitor: &PropertyVisitor, raw: &[u8]) -> Result<()>;

    /// Cheap, non-destructive connection probe.
    async fn status(&self) -> DeviceStatus;

    /// Close and re-open the physical connection.
    async fn reconnect(&self) -> Result<()> {
        self.close().await?;
        self.connect().await
    }

    /// Release the physical connection.
    async fn close(&self) -> Result<()>;

    /// Read with bounded reconnect-and-retry cycles.
    async fn get_with_retry(&self, visitor: &PropertyVisitor, retries: usize) -> Result<Vec<u8>> {
        let mut last = MapperError::not_connected();
        for _ in 0..retries.max(1) {
            match self.get(visitor).await {
                Ok(raw) => return Ok(raw),
                Err(err) => {
                    warn!(channel = %self.channel_key(), %err, "get failed, reconnect and retry");
                    last = err;
                    if let Err(conn_err) = self.reconnect().await {
                        warn!(channel = %self.channel_key(), %conn_err, "reconnect failed");
                    }
                },
            }
        }
        Err(last)
    }

    /// Write with bounded reconnect-and-retry cycles.
    async fn set_with_retry(
        &self,
        visitor: &PropertyVisitor,
        raw: &[u8],
        retries: usize,
    ) -> Result<()> {
        let mut last = MapperError::not_connected();
        for _ in 0..retries.max(1) {
            match self.set(visitor, raw).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(channel = %self.channel_key(), %err, "set failed, reconnect and retry");
                    last = err;
                    if let Err(conn_err) = self.reconnect().await {
                        warn!(channel = %self.channel_key(), %conn_err, "reconnect failed");
                    }
                },
            }
        }
        Err(last)
    }
}

// ============================================================================
// Driver factory & registry
// ============================================================================

/// Factory for one protocol family.
///
/// Factories resolve the opaque protocol config blobs into a concrete driver
/// and are responsible for looking the driver up in the shared pool so that
/// two devices on the same physical channel share one instance.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    /// Protocol kind names this factory handles (aliases included).
    fn protocol_names(&self) -> &'static [&'static str];

    /// Create (or fetch from the pool) a driver for this protocol binding.
    async fn create(
        &self,
        protocol: &ProtocolConfig,
        pool: &DriverPool,
    ) -> Result<Arc<dyn ProtocolDriver>>;
}

/// Normalize a protocol kind for registry lookup: lowercase, separators
/// removed, so "Modbus-TCP", "modbus_tcp" and "modbustcp" all match.
pub fn normalize_protocol_name(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Registry of driver factories plus the channel-keyed driver pool.
pub struct DriverRegistry {
    factories: DashMap<String, Arc<dyn DriverFactory>>,
    pool: DriverPool,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
            pool: DriverPool::new(),
        }
    }

    /// Register a factory under all its protocol names.
    pub fn register(&self, factory: Arc<dyn DriverFactory>) {
        for name in factory.protocol_names() {
            self.factories
                .insert(normalize_protocol_name(name), factory.clone());
        }
    }

    pub fn is_registered(&self, protocol_name: &str) -> bool {
        self.factories
            .contains_key(&normalize_protocol_name(protocol_name))
    }

    /// Create (or fetch) the driver for a protocol binding.
    pub async fn create(&self, protocol: &ProtocolConfig) -> Result<Arc<dyn ProtocolDriver>> {
        let normalized = normalize_protocol_name(&protocol.kind);
        let factory = self
            .factories
            .get(&normalized)
            .map(|f| f.value().clone())
            .ok_or_else(|| {
                MapperError::config(format!("unknown protocol kind {:?}", protocol.kind))
            })?;
        factory.create(protocol, &self.pool).await
    }

    pub fn pool(&self) -> &DriverPool {
        &self.pool
    }
}

/// Registry with all built-in protocols registered.
///
/// This is the single point where new protocols are added: implement
/// [`DriverFactory`] and register it here.
pub fn default_driver_registry() -> DriverRegistry {
    let registry = DriverRegistry::new();

    #[cfg(feature = "modbus")]
    registry.register(Arc::new(modbus::ModbusFactory));

    registry.register(Arc::new(virt::VirtualFactory));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_folds_aliases() {
        assert_eq!(normalize_protocol_name("Modbus-TCP"), "modbustcp");
        assert_eq!(normalize_protocol_name("modbus_rtu"), "modbusrtu");
        assert_eq!(normalize_protocol_name("virtual"), "virtual");
    }

    #[test]
    fn default_registry_has_builtins() {
        let registry = default_driver_registry();
        assert!(registry.is_registered("virtual"));
        assert!(registry.is_registered("virt"));

        #[cfg(feature = "modbus")]
        {
            assert!(registry.is_registered("modbus-tcp"));
            assert!(registry.is_registered("modbus_rtu"));
        }
    }

    #[tokio::test]
    async fn unknown_protocol_kind_is_a_config_error() {
        let registry = default_driver_registry();
        let protocol: ProtocolConfig = serde_json::from_str(
            r#"{"name":"x","protocol":"bacnet","protocolCommonConfig":{},"protocolConfig":{}}"#,
        )
        .unwrap();
        let err = match registry.create(&protocol).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, MapperError::Config(_)));
    }
}
