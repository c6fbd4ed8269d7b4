//! Modbus TCP driver tests against an in-process MBAP simulator.

#![cfg(feature = "modbus")]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use mapsrv::drivers::{default_driver_registry, ProtocolDriver};
use twin_model::{DeviceStatus, PropertyVisitor, ProtocolConfig};

type Registers = Arc<Mutex<HashMap<u16, u16>>>;

/// Minimal Modbus TCP server: FC03 reads, FC06/FC16 writes, exception 0x01
/// for anything else.
async fn serve_connection(mut stream: TcpStream, registers: Registers) {
    loop {
        let mut header = [0u8; 7];
        if stream.read_exact(&mut header).await.is_err() {
            return;
        }
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        let mut pdu = vec![0u8; length - 1];
        if stream.read_exact(&mut pdu).await.is_err() {
            return;
        }

        let response_pdu = handle_pdu(&pdu, &registers);
        let mut response = Vec::with_capacity(7 + response_pdu.len());
        response.extend_from_slice(&header[0..4]); // transaction + protocol
        response.extend_from_slice(&(response_pdu.len() as u16 + 1).to_be_bytes());
        response.push(header[6]); // unit
        response.extend_from_slice(&response_pdu);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn handle_pdu(pdu: &[u8], registers: &Registers) -> Vec<u8> {
    match pdu[0] {
        0x03 => {
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            let mut out = vec![0x03, (quantity * 2) as u8];
            let regs = registers.lock();
            for i in 0..quantity {
                let value = regs.get(&(addr + i)).copied().unwrap_or(0);
                out.extend_from_slice(&value.to_be_bytes());
            }
            out
        },
        0x06 => {
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let value = u16::from_be_bytes([pdu[3], pdu[4]]);
            registers.lock().insert(addr, value);
            pdu.to_vec()
        },
        0x10 => {
            let addr = u16::from_be_bytes([pdu[1], pdu[2]]);
            let quantity = u16::from_be_bytes([pdu[3], pdu[4]]);
            let mut regs = registers.lock();
            for i in 0..quantity as usize {
                let value = u16::from_be_bytes([pdu[6 + i * 2], pdu[7 + i * 2]]);
                regs.insert(addr + i as u16, value);
            }
            vec![0x10, pdu[1], pdu[2], pdu[3], pdu[4]]
        },
        fc => vec![fc | 0x80, 0x01],
    }
}

async fn start_simulator(registers: Registers) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_connection(stream, registers.clone()));
        }
    });
    port
}

fn protocol_for(port: u16, slave: u8) -> ProtocolConfig {
    serde_json::from_value(serde_json::json!({
        "name": format!("sim-{port}"),
        "protocol": "modbus-tcp",
        "protocolCommonConfig": {"tcp": {"ip": "127.0.0.1", "port": port}},
        "protocolConfig": {"slaveID": slave},
    }))
    .unwrap()
}

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
async fn reads_holding_registers_over_tcp() {
    let registers: Registers = Arc::new(Mutex::new(HashMap::from([(0, 0x0000), (1, 0x0007)])));
    let port = start_simulator(registers).await;

    let drivers = default_driver_registry();
    let driver = drivers.create(&protocol_for(port, 1)).await.unwrap();
    driver.connect().await.unwrap();
    assert_eq!(driver.status().await, DeviceStatus::Ok);

    let raw = driver.get(&visitor("HoldingRegister", 0, 2)).await.unwrap();
    assert_eq!(raw, vec![0x00, 0x00, 0x00, 0x07]);

    driver.close().await.unwrap();
}

#[tokio::test]
async fn writes_single_and_multiple_registers() {
    let registers: Registers = Arc::new(Mutex::new(HashMap::new()));
    let port = start_simulator(registers.clone()).await;

    let drivers = default_driver_registry();
    let driver = drivers.create(&protocol_for(port, 1)).await.unwrap();

    // Two raw bytes: FC06 single register.
    driver
        .set(&visitor("HoldingRegister", 5, 1), &[0x00, 0x2A])
        .await
        .unwrap();
    assert_eq!(registers.lock().get(&5), Some(&0x002A));

    // Four raw bytes: FC16 multiple registers.
    driver
        .set(&visitor("HoldingRegister", 10, 2), &[0x00, 0x00, 0x00, 0x09])
        .await
        .unwrap();
    assert_eq!(registers.lock().get(&10), Some(&0x0000));
    assert_eq!(registers.lock().get(&11), Some(&0x0009));

    driver.close().await.unwrap();
}

#[tokio::test]
async fn exception_response_surfaces_as_protocol_error() {
    let registers: Registers = Arc::new(Mutex::new(HashMap::new()));
    let port = start_simulator(registers).await;

    let drivers = default_driver_registry();
    let driver = drivers.create(&protocol_for(port, 1)).await.unwrap();

    // The simulator only implements FC03/06/16; input registers come back
    // as exception 0x01.
    let err = driver
        .get(&visitor("InputRegister", 0, 1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("illegal function"));

    driver.close().await.unwrap();
}

#[tokio::test]
async fn input_registers_are_not_writable() {
    let registers: Registers = Arc::new(Mutex::new(HashMap::new()));
    let port = start_simulator(registers).await;

    let drivers = default_driver_registry();
    let driver = drivers.create(&protocol_for(port, 1)).await.unwrap();
    let err = driver
        .set(&visitor("InputRegister", 0, 1), &[0x00, 0x01])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not writable"));
}

#[tokio::test]
async fn unreachable_endpoint_reports_disconnected() {
    let drivers = default_driver_registry();
    // Reserve a port, then drop the listener so nothing is listening.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let driver = drivers.create(&protocol_for(port, 1)).await.unwrap();
    assert!(driver.connect().await.is_err());
    assert_eq!(driver.status().await, DeviceStatus::Disconnected);
}
