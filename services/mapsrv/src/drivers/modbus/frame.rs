//! Modbus frame building and parsing: PDUs, MBAP (TCP) and RTU framing.

use bytes::{BufMut, BytesMut};

use crate::error::{MapperError, Result};

/// Read function codes.
pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
/// Write function codes.
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Protocol limit on registers in one FC16 request.
pub const MAX_WRITE_REGISTERS: usize = 123;

/// MBAP header length (transaction + protocol + length + unit).
pub const MBAP_HEADER_LEN: usize = 7;

// ============================================================================
// PDU builders
// ============================================================================

/// Build a read request PDU: function code, start address, quantity.
pub fn build_read_request(fc: u8, address: u16, quantity: u16) -> Result<Vec<u8>> {
    if quantity == 0 {
        return Err(MapperError::protocol("read quantity must be nonzero"));
    }
    let mut pdu = Vec::with_capacity(5);
    pdu.push(fc);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&quantity.to_be_bytes());
    Ok(pdu)
}

/// Build a single-value write PDU (FC05 coil / FC06 register).
pub fn build_write_single(fc: u8, address: u16, value: u16) -> Vec<u8> {
    let mut pdu = Vec::with_capacity(5);
    pdu.push(fc);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    pdu
}

/// Build an FC16 write-multiple-registers PDU from raw big-endian bytes.
pub fn build_write_multiple_registers(address: u16, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() || payload.len() % 2 != 0 {
        return Err(MapperError::protocol(format!(
            "FC16 payload must be a nonzero multiple of 2 bytes, got {}",
            payload.len()
        )));
    }
    let quantity = payload.len() / 2;
    if quantity > MAX_WRITE_REGISTERS {
        return Err(MapperError::protocol(format!(
            "FC16 register count {quantity} exceeds limit {MAX_WRITE_REGISTERS}"
        )));
    }
    let mut pdu = Vec::with_capacity(6 + payload.len());
    pdu.push(FC_WRITE_MULTIPLE_REGISTERS);
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&(quantity as u16).to_be_bytes());
    pdu.push(payload.len() as u8);
    pdu.extend_from_slice(payload);
    Ok(pdu)
}

// ============================================================================
// Response parsing
// ============================================================================

/// Validate a response PDU against the request function code and return the
/// data payload (byte-count stripped for reads, empty for writes).
pub fn parse_response(request_fc: u8, pdu: &[u8]) -> Result<Vec<u8>> {
    let fc = *pdu
        .first()
        .ok_or_else(|| MapperError::protocol("empty response PDU"))?;

    if fc == request_fc | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(MapperError::protocol(format!(
            "exception response {:#04x}: {}",
            code,
            exception_message(code)
        )));
    }
    if fc != request_fc {
        return Err(MapperError::protocol(format!(
            "function code mismatch: expected {request_fc:#04x}, got {fc:#04x}"
        )));
    }

    match fc {
        FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
        | FC_READ_INPUT_REGISTERS => {
            let count = *pdu
                .get(1)
                .ok_or_else(|| MapperError::protocol("truncated read response"))?
                as usize;
            let data = &pdu[2..];
            if data.len() != count {
                return Err(MapperError::protocol(format!(
                    "read response length {} does not match byte count {count}",
                    data.len()
                )));
            }
            Ok(data.to_vec())
        },
        // Write responses echo address/value; a matching function code means success.
        _ => Ok(Vec::new()),
    }
}

fn exception_message(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x05 => "acknowledge",
        0x06 => "server device busy",
        0x08 => "memory parity error",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown exception",
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Wrap a PDU in an MBAP header for Modbus TCP.
pub fn mbap_frame(transaction_id: u16, unit: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0); // protocol identifier
    frame.put_u16(pdu.len() as u16 + 1);
    frame.put_u8(unit);
    frame.put_slice(pdu);
    frame
}

/// Wrap a PDU in an RTU frame: unit, PDU, CRC-16 (low byte first).
pub fn rtu_frame(unit: u8, pdu: &[u8]) -> BytesMut {
    let mut frame = BytesMut::with_capacity(3 + pdu.len());
    frame.put_u8(unit);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u8(crc as u8);
    frame.put_u8((crc >> 8) as u8);
    frame
}

/// Modbus CRC-16 (polynomial 0xA001).
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= byte as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Verify the trailing CRC of an RTU frame (unit + PDU + 2 CRC bytes).
pub fn check_rtu_crc(frame: &[u8]) -> Result<()> {
    if frame.len() < 4 {
        return Err(MapperError::protocol("RTU frame too short"));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16(body);
    let received = u16::from_le_bytes([tail[0], tail[1]]);
    if expected != received {
        return Err(MapperError::protocol(format!(
            "CRC mismatch: expected {expected:#06x}, got {received:#06x}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_known_vector() {
        // Canonical "read one holding register from unit 1" frame:
        // 01 03 00 00 00 01 84 0A
        let body = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let crc = crc16(&body);
        assert_eq!(crc as u8, 0x84);
        assert_eq!((crc >> 8) as u8, 0x0A);

        let frame = rtu_frame(0x01, &build_read_request(0x03, 0, 1).unwrap());
        assert_eq!(&frame[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        check_rtu_crc(&frame).unwrap();
    }

    #[test]
    fn mbap_frame_layout() {
        let pdu = build_read_request(0x03, 0x0002, 0x0001).unwrap();
        let frame = mbap_frame(0x1234, 0x11, &pdu);
        assert_eq!(
            &frame[..],
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x02, 0x00, 0x01]
        );
    }

    #[test]
    fn parse_read_response_strips_byte_count() {
        let data = parse_response(0x03, &[0x03, 0x04, 0x00, 0x00, 0x00, 0x07]).unwrap();
        assert_eq!(data, vec![0x00, 0x00, 0x00, 0x07]);

        let err = parse_response(0x03, &[0x03, 0x04, 0x00]).unwrap_err();
        assert!(err.to_string().contains("byte count"));
    }

    #[test]
    fn parse_exception_response() {
        let err = parse_response(0x03, &[0x83, 0x02]).unwrap_err();
        assert!(err.to_string().contains("illegal data address"));
    }

    #[test]
    fn parse_rejects_mismatched_function_code() {
        let err = parse_response(0x03, &[0x04, 0x02, 0x00, 0x07]).unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn fc16_payload_must_be_even() {
        assert!(build_write_multiple_registers(0, &[1, 2, 3]).is_err());
        assert!(build_write_multiple_registers(0, &[]).is_err());
        let pdu = build_write_multiple_registers(0x0010, &[0x00, 0x09]).unwrap();
        assert_eq!(pdu, vec![0x10, 0x00, 0x10, 0x00, 0x01, 0x02, 0x00, 0x09]);
    }
}
