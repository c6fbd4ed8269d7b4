//! Modbus transport: one TCP session or serial line, one request in flight.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use super::frame::{self, MBAP_HEADER_LEN};
use crate::error::{MapperError, Result};

/// Default connect/IO timeout for Modbus endpoints.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Physical endpoint parameters.
#[derive(Debug, Clone)]
pub enum TransportConfig {
    Tcp {
        host: String,
        port: u16,
        timeout: Duration,
    },
    Rtu {
        path: String,
        baud_rate: u32,
        data_bits: u8,
        stop_bits: u8,
        parity: String,
        timeout: Duration,
    },
}

impl TransportConfig {
    fn timeout(&self) -> Duration {
        match self {
            TransportConfig::Tcp { timeout, .. } | TransportConfig::Rtu { timeout, .. } => *timeout,
        }
    }
}

enum Link {
    Tcp(TcpStream),
    Serial(SerialStream),
}

/// A single Modbus session. Not internally synchronized: the owning driver
/// serializes access with its own mutex.
pub struct ModbusTransport {
    config: TransportConfig,
    link: Option<Link>,
    transaction_id: u16,
}

impl ModbusTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            link: None,
            // Seed the MBAP transaction counter so parallel gateways don't
            // all start at zero.
            transaction_id: rand::random::<u16>(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.link.is_some() {
            return Ok(());
        }
        let link = match &self.config {
            TransportConfig::Tcp { host, port, timeout } => {
                let stream = tokio::time::timeout(*timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| MapperError::timeout(format!("connect to {host}:{port}")))?
                    .map_err(|e| MapperError::connection(format!("connect to {host}:{port}: {e}")))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| MapperError::connection(format!("set nodelay: {e}")))?;
                debug!(endpoint = %format!("{host}:{port}"), "modbus tcp connected");
                Link::Tcp(stream)
            },
            TransportConfig::Rtu {
                path,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                timeout,
            } => {
                let builder = tokio_serial::new(path, *baud_rate)
                    .data_bits(map_data_bits(*data_bits))
                    .stop_bits(map_stop_bits(*stop_bits))
                    .parity(map_parity(parity))
                    .timeout(*timeout);
                let stream = builder
                    .open_native_async()
                    .map_err(|e| MapperError::connection(format!("open {path}: {e}")))?;
                debug!(port = %path, baud = baud_rate, "modbus rtu opened");
                Link::Serial(stream)
            },
        };
        self.link = Some(link);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        if let Some(Link::Tcp(mut stream)) = self.link.take() {
            // Best effort; the peer may already be gone.
            let _ = stream.shutdown().await;
        }
        Ok(())
    }

    /// Execute one request/response round trip, returning the response PDU.
    ///
    /// Any I/O failure drops the link so the next call reconnects cleanly.
    pub async fn request(&mut self, unit: u8, pdu: &[u8]) -> Result<Vec<u8>> {
        self.connect().await?;
        let result = self.request_inner(unit, pdu).await;
        if result.is_err() {
            self.link = None;
        }
        result
    }

    async fn request_inner(&mut self, unit: u8, pdu: &[u8]) -> Result<Vec<u8>> {
        let io_timeout = self.config.timeout();
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let transaction_id = self.transaction_id;

        match self.link.as_mut() {
            Some(Link::Tcp(stream)) => {
                let frame = frame::mbap_frame(transaction_id, unit, pdu);
                io(io_timeout, stream.write_all(&frame), "write request").await?;

                let mut header = [0u8; MBAP_HEADER_LEN];
                io(io_timeout, stream.read_exact(&mut header), "read MBAP header").await?;

                let rx_txn = u16::from_be_bytes([header[0], header[1]]);
                let proto = u16::from_be_bytes([header[2], header[3]]);
                let length = u16::from_be_bytes([header[4], header[5]]) as usize;
                if proto != 0 {
                    return Err(MapperError::protocol(format!(
                        "unexpected MBAP protocol id {proto}"
                    )));
                }
                if rx_txn != transaction_id {
                    return Err(MapperError::protocol(format!(
                        "transaction id mismatch: sent {transaction_id}, got {rx_txn}"
                    )));
                }
                if length < 2 || length > 256 {
                    return Err(MapperError::protocol(format!(
                        "invalid MBAP length {length}"
                    )));
                }
                if header[6] != unit {
                    return Err(MapperError::protocol(format!(
                        "unit id mismatch: sent {unit}, got {}",
                        header[6]
                    )));
                }

                let mut body = vec![0u8; length - 1];
                io(io_timeout, stream.read_exact(&mut body), "read response PDU").await?;
                Ok(body)
            },
            Some(Link::Serial(stream)) => {
                let frame_out = frame::rtu_frame(unit, pdu);
                io(io_timeout, stream.write_all(&frame_out), "write request").await?;

                // Response layout depends on the function code; read the
                // echoed unit + function first, then the rest.
                let mut head = [0u8; 2];
                io(io_timeout, stream.read_exact(&mut head), "read RTU header").await?;
                if head[0] != unit {
                    return Err(MapperError::protocol(format!(
                        "unit id mismatch: sent {unit}, got {}",
                        head[0]
                    )));
                }

                let fc = head[1];
                let mut raw = vec![head[0], head[1]];
                if fc & 0x80 != 0 {
                    // Exception: code + CRC.
                    let mut rest = [0u8; 3];
                    io(io_timeout, stream.read_exact(&mut rest), "read exception").await?;
                    raw.extend_from_slice(&rest);
                } else if matches!(fc, 0x01..=0x04) {
                    let mut count = [0u8; 1];
                    io(io_timeout, stream.read_exact(&mut count), "read byte count").await?;
                    raw.push(count[0]);
                    let mut rest = vec![0u8; count[0] as usize + 2];
                    io(io_timeout, stream.read_exact(&mut rest), "read data").await?;
                    raw.extend_from_slice(&rest);
                } else {
                    // Write echoes: address + value + CRC.
                    let mut rest = [0u8; 6];
                    io(io_timeout, stream.read_exact(&mut rest), "read write echo").await?;
                    raw.extend_from_slice(&rest);
                }

                frame::check_rtu_crc(&raw)?;
                Ok(raw[1..raw.len() - 2].to_vec())
            },
            None => Err(MapperError::not_connected()),
        }
    }
}

async fn io<T, E>(
    limit: Duration,
    fut: impl std::future::Future<Output = std::result::Result<T, E>>,
    what: &str,
) -> Result<T>
where
    E: std::fmt::Display,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MapperError::timeout(what.to_string()))?
        .map_err(|e| MapperError::Io(format!("{what}: {e}")))
}

fn map_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

fn map_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

fn map_parity(parity: &str) -> Parity {
    match parity.to_ascii_lowercase().as_str() {
        "even" | "e" => Parity::Even,
        "odd" | "o" => Parity::Odd,
        _ => Parity::None,
    }
}
