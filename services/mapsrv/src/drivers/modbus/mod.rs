//! Modbus TCP/RTU reference driver.
//!
//! One `ModbusDriver` owns one physical channel: a serial line (RTU, many
//! units on one RS-485 bus) or one TCP session. The driver mutex serializes
//! every round trip; retry behavior lives in the generic
//! [`ProtocolDriver`](crate::drivers::ProtocolDriver) helpers.

mod frame;
mod transport;

pub use transport::{ModbusTransport, TransportConfig, DEFAULT_TIMEOUT};

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use twin_model::{DeviceStatus, PropertyVisitor, ProtocolConfig};

use super::{DriverFactory, DriverPool, ProtocolDriver};
use crate::error::{ErrorExt, MapperError, Result};

// ============================================================================
// Register kinds
// ============================================================================

/// The four Modbus register kinds, spelled as in property visitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Coil,
    DiscreteInput,
    Holding,
    Input,
}

impl RegisterKind {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "coilregister" | "coil" => Ok(RegisterKind::Coil),
            "discreteinputregister" | "discreteinput" => Ok(RegisterKind::DiscreteInput),
            "holdingregister" | "holding" => Ok(RegisterKind::Holding),
            "inputregister" | "input" => Ok(RegisterKind::Input),
            other => Err(MapperError::validation(format!(
                "bad register type {other:?}"
            ))),
        }
    }

    fn read_fc(&self) -> u8 {
        match self {
            RegisterKind::Coil => frame::FC_READ_COILS,
            RegisterKind::DiscreteInput => frame::FC_READ_DISCRETE_INPUTS,
            RegisterKind::Holding => frame::FC_READ_HOLDING_REGISTERS,
            RegisterKind::Input => frame::FC_READ_INPUT_REGISTERS,
        }
    }
}

// ============================================================================
// Driver
// ============================================================================

pub struct ModbusDriver {
    key: String,
    unit: u8,
    transport: Mutex<ModbusTransport>,
}

impl ModbusDriver {
    pub fn new(key: impl Into<String>, unit: u8, config: TransportConfig) -> Self {
        Self {
            key: key.into(),
            unit,
            transport: Mutex::new(ModbusTransport::new(config)),
        }
    }
}

#[async_trait]
impl ProtocolDriver for ModbusDriver {
    fn channel_key(&self) -> &str {
        &self.key
    }

    async fn connect(&self) -> Result<()> {
        self.transport.lock().await.connect().await
    }

    async fn get(&self, visitor: &PropertyVisitor) -> Result<Vec<u8>> {
        let kind = RegisterKind::parse(&visitor.register)?;
        let pdu = frame::build_read_request(kind.read_fc(), visitor.offset, visitor.limit)?;

        let mut transport = self.transport.lock().await;
        let response = transport.request(self.unit, &pdu).await?;
        drop(transport);

        frame::parse_response(pdu[0], &response)
    }

    async fn set(&self, visitor: &PropertyVisitor, raw: &[u8]) -> Result<()> {
        let kind = RegisterKind::parse(&visitor.register)?;
        let pdu = match kind {
            RegisterKind::Coil => {
                // FC05 request value is 0xFF00 for ON, 0x0000 for OFF.
                let on = raw.iter().any(|b| *b != 0);
                frame::build_write_single(
                    frame::FC_WRITE_SINGLE_COIL,
                    visitor.offset,
                    if on { 0xFF00 } else { 0x0000 },
                )
            },
            RegisterKind::Holding => {
                if raw.len() == 2 {
                    frame::build_write_single(
                        frame::FC_WRITE_SINGLE_REGISTER,
                        visitor.offset,
                        u16::from_be_bytes([raw[0], raw[1]]),
                    )
                } else {
                    frame::build_write_multiple_registers(visitor.offset, raw)?
                }
            },
            RegisterKind::DiscreteInput | RegisterKind::Input => {
                return Err(MapperError::validation(format!(
                    "register kind {:?} is not writable",
                    visitor.register
                )))
            },
        };

        debug!(channel = %self.key, register = %visitor.register, offset = visitor.offset, "modbus write");
        let mut transport = self.transport.lock().await;
        let response = transport.request(self.unit, &pdu).await?;
        drop(transport);

        frame::parse_response(pdu[0], &response).map(|_| ())
    }

    async fn status(&self) -> DeviceStatus {
        // A held lock means a round trip is in flight, which is as connected
        // as it gets; don't queue a probe behind it.
        let Ok(mut transport) = self.transport.try_lock() else {
            return DeviceStatus::Ok;
        };
        if transport.is_connected() {
            return DeviceStatus::Ok;
        }
        match transport.connect().await {
            Ok(()) => DeviceStatus::Ok,
            Err(_) => DeviceStatus::Disconnected,
        }
    }

    async fn close(&self) -> Result<()> {
        self.transport.lock().await.close().await
    }
}

// ============================================================================
// Protocol configuration
// ============================================================================

fn default_baud_rate() -> u32 {
    9600
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_parity() -> String {
    "none".to_string()
}
fn default_unit() -> u8 {
    1
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ModbusCommonConfig {
    #[serde(default)]
    com: Option<ComConfig>,
    #[serde(default)]
    tcp: Option<TcpConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComConfig {
    serial_port: String,
    #[serde(default = "default_baud_rate")]
    baud_rate: u32,
    #[serde(default = "default_data_bits")]
    data_bits: u8,
    #[serde(default = "default_stop_bits")]
    stop_bits: u8,
    #[serde(default = "default_parity")]
    parity: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TcpConfig {
    ip: String,
    port: u16,
}

#[derive(Debug, Clone, Deserialize)]
struct ModbusDeviceConfig {
    #[serde(default = "default_unit", rename = "slaveID")]
    slave_id: u8,
}

// ============================================================================
// Factory
// ============================================================================

/// Factory for Modbus TCP and RTU drivers.
///
/// Channel identity: `ip:port/slaveID` for TCP, the serial device path for
/// RTU (all units on one RS-485 bus share the line, and therefore the
/// driver).
pub struct ModbusFactory;

#[async_trait]
impl DriverFactory for ModbusFactory {
    fn protocol_names(&self) -> &'static [&'static str] {
        &["modbus", "modbus-tcp", "modbus-rtu", "modbustcp", "modbusrtu"]
    }

    async fn create(
        &self,
        protocol: &ProtocolConfig,
        pool: &DriverPool,
    ) -> Result<Arc<dyn ProtocolDriver>> {
        let common: ModbusCommonConfig = serde_json::from_value(protocol.common_config.clone())
            .config_error("invalid modbus common config")?;
        let device: ModbusDeviceConfig = serde_json::from_value(protocol.device_config.clone())
            .config_error("invalid modbus device config")?;

        let (key, config) = if let Some(tcp) = &common.tcp {
            (
                format!("{}:{}/{}", tcp.ip, tcp.port, device.slave_id),
                TransportConfig::Tcp {
                    host: tcp.ip.clone(),
                    port: tcp.port,
                    timeout: DEFAULT_TIMEOUT,
                },
            )
        } else if let Some(com) = &common.com {
            if com.serial_port.is_empty() {
                return Err(MapperError::config("modbus serial port is empty"));
            }
            (
                com.serial_port.clone(),
                TransportConfig::Rtu {
                    path: com.serial_port.clone(),
                    baud_rate: com.baud_rate,
                    data_bits: com.data_bits,
                    stop_bits: com.stop_bits,
                    parity: com.parity.clone(),
                    timeout: DEFAULT_TIMEOUT,
                },
            )
        } else {
            return Err(MapperError::config(
                "modbus protocol has neither tcp nor com endpoint",
            ));
        };

        pool.get_or_create(&key, || {
            Ok(Arc::new(ModbusDriver::new(&key, device.slave_id, config)) as _)
        })
    }
}
