//! Virtual protocol driver.
//!
//! An in-memory register store standing in for a physical device. Used by
//! tests and demo deployments; register contents can be seeded from the
//! per-device protocol config.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use twin_model::{DeviceStatus, PropertyVisitor, ProtocolConfig};

use super::{DriverFactory, DriverPool, ProtocolDriver};
use crate::error::{ErrorExt, MapperError, Result};

/// In-memory driver simulating a register-addressable device.
pub struct VirtualDriver {
    key: String,
    connected: AtomicBool,
    registers: Mutex<HashMap<(String, u16), Vec<u8>>>,
}

impl VirtualDriver {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            connected: AtomicBool::new(false),
            registers: Mutex::new(HashMap::new()),
        }
    }

    /// Store raw bytes at a register location (test/seed helper).
    pub fn write_register(&self, register: &str, offset: u16, raw: &[u8]) {
        self.registers
            .lock()
            .insert((register.to_string(), offset), raw.to_vec());
    }

    /// Read back raw bytes at a register location (test helper).
    pub fn read_register(&self, register: &str, offset: u16) -> Option<Vec<u8>> {
        self.registers
            .lock()
            .get(&(register.to_string(), offset))
            .cloned()
    }

    fn is_bit_register(register: &str) -> bool {
        let lower = register.to_ascii_lowercase();
        lower.contains("coil") || lower.contains("discrete")
    }

    /// Unaddressed reads return zeroes of the natural width: packed bits for
    /// bit kinds, two bytes per register otherwise.
    fn default_payload(visitor: &PropertyVisitor) -> Vec<u8> {
        if Self::is_bit_register(&visitor.register) {
            vec![0u8; (visitor.limit as usize).div_ceil(8).max(1)]
        } else {
            vec![0u8; visitor.register_bytes().max(2)]
        }
    }
}

#[async_trait]
impl ProtocolDriver for VirtualDriver {
    fn channel_key(&self) -> &str {
        &self.key
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, visitor: &PropertyVisitor) -> Result<Vec<u8>> {
        let registers = self.registers.lock();
        Ok(registers
            .get(&(visitor.register.clone(), visitor.offset))
            .cloned()
            .unwrap_or_else(|| Self::default_payload(visitor)))
    }

    async fn set(&self, visitor: &PropertyVisitor, raw: &[u8]) -> Result<()> {
        if raw.is_empty() {
            return Err(MapperError::data("empty write payload"));
        }
        self.registers
            .lock()
            .insert((visitor.register.clone(), visitor.offset), raw.to_vec());
        Ok(())
    }

    async fn status(&self) -> DeviceStatus {
        if self.connected.load(Ordering::SeqCst) {
            DeviceStatus::Ok
        } else {
            DeviceStatus::Disconnected
        }
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Factory
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct VirtualCommonConfig {
    /// Explicit channel identity; defaults to the protocol entry name.
    #[serde(default)]
    channel: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct VirtualDeviceConfig {
    #[serde(default)]
    registers: Vec<RegisterSeed>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterSeed {
    register: String,
    #[serde(default)]
    offset: u16,
    /// Initial contents as a hex string.
    value: String,
}

/// Factory for the virtual protocol (always available).
pub struct VirtualFactory;

#[async_trait]
impl DriverFactory for VirtualFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["virtual", "virt"]
    }

    async fn create(
        &self,
        protocol: &ProtocolConfig,
        pool: &DriverPool,
    ) -> Result<Arc<dyn ProtocolDriver>> {
        let common: VirtualCommonConfig = serde_json::from_value(protocol.common_config.clone())
            .config_error("invalid virtual common config")?;
        let device: VirtualDeviceConfig = serde_json::from_value(protocol.device_config.clone())
            .config_error("invalid virtual device config")?;

        let key = common.channel.unwrap_or_else(|| protocol.name.clone());
        pool.get_or_create(&key, || {
            let driver = VirtualDriver::new(&key);
            for seed in &device.registers {
                let raw = decode_hex(&seed.value)?;
                driver.write_register(&seed.register, seed.offset, &raw);
            }
            Ok(Arc::new(driver) as Arc<dyn ProtocolDriver>)
        })
    }
}

fn decode_hex(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(MapperError::config("register seed has odd hex length"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|e| MapperError::config(format!("invalid register seed: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn visitor(register: &str, offset: u16, limit: u16) -> PropertyVisitor {
        serde_json::from_value(serde_json::json!({
            "propertyName": "p",
            "register": register,
            "offset": offset,
            "limit": limit,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let driver = VirtualDriver::new("virt-0");
        let v = visitor("HoldingRegister", 3, 2);
        driver.set(&v, &[0, 0, 0, 9]).await.unwrap();
        assert_eq!(driver.get(&v).await.unwrap(), vec![0, 0, 0, 9]);
    }

    #[tokio::test]
    async fn unseeded_reads_are_zero_filled() {
        let driver = VirtualDriver::new("virt-0");
        assert_eq!(
            driver.get(&visitor("HoldingRegister", 0, 2)).await.unwrap(),
            vec![0, 0, 0, 0]
        );
        assert_eq!(driver.get(&visitor("CoilRegister", 0, 1)).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn factory_seeds_registers_once() {
        let pool = DriverPool::new();
        let protocol: ProtocolConfig = serde_json::from_value(serde_json::json!({
            "name": "virt-chan",
            "protocol": "virtual",
            "protocolConfig": {
                "registers": [
                    {"register": "HoldingRegister", "offset": 0, "value": "00000007"}
                ]
            }
        }))
        .unwrap();

        let a = VirtualFactory.create(&protocol, &pool).await.unwrap();
        let b = VirtualFactory.create(&protocol, &pool).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let raw = a.get(&visitor("HoldingRegister", 0, 2)).await.unwrap();
        assert_eq!(raw, vec![0, 0, 0, 7]);
    }

    #[tokio::test]
    async fn status_follows_connect_close() {
        let driver = VirtualDriver::new("virt-0");
        assert_eq!(driver.status().await, DeviceStatus::Disconnected);
        driver.connect().await.unwrap();
        assert_eq!(driver.status().await, DeviceStatus::Ok);
        driver.close().await.unwrap();
        assert_eq!(driver.status().await, DeviceStatus::Disconnected);
    }
}
