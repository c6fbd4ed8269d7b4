//! Register codec: pure conversions between raw register bytes and typed
//! string values, driven by the declarative per-property rules (byte order,
//! scale, width).
//!
//! Swap order is fixed: register swap first, then byte swap, both before any
//! type interpretation. With both swaps enabled, `[0x01,0x02,0x03,0x04]`
//! becomes `[0x04,0x03,0x02,0x01]`.

use twin_model::DataType;

use crate::error::{MapperError, Result};

// ============================================================================
// Byte reordering
// ============================================================================

/// Reorder 16-bit words back-to-front in 4-byte groups.
pub fn swap_registers(value: &mut [u8]) {
    let len = value.len();
    let mut i = 0;
    while i < len / 2 {
        let j = len - i - 2;
        value.swap(i, j);
        value.swap(i + 1, j + 1);
        i += 2;
    }
}

/// Swap the two bytes within each 16-bit word. A trailing odd byte is left
/// in place.
pub fn swap_bytes(value: &mut [u8]) {
    for pair in value.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode raw register bytes into the string form of `data_type`.
///
/// Integers accept raw widths of 1/2/4/8 bytes, interpreted as signed
/// big-endian, scaled, then truncated. `float`/`double` require exactly
/// 4/8 bytes. Booleans read the first byte: any nonzero value is true
/// (covers both the 0xFF coil convention and a literal 1). Strings are
/// sanitized so register padding bytes cannot leak into the decoded text.
pub fn decode(
    is_register_swap: bool,
    is_swap: bool,
    data_type: DataType,
    scale: f64,
    raw: &[u8],
) -> Result<String> {
    let mut value = raw.to_vec();
    if is_register_swap {
        swap_registers(&mut value);
    }
    if is_swap {
        swap_bytes(&mut value);
    }

    match data_type {
        DataType::Int => {
            let data = match value.len() {
                1 => value[0] as i8 as f64,
                2 => i16::from_be_bytes([value[0], value[1]]) as f64,
                4 => i32::from_be_bytes([value[0], value[1], value[2], value[3]]) as f64,
                8 => {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(&value);
                    i64::from_be_bytes(buf) as f64
                },
                n => {
                    return Err(MapperError::data(format!(
                        "invalid byte length {n} for int"
                    )))
                },
            };
            Ok(((data * scale) as i64).to_string())
        },
        DataType::Double => {
            if value.len() != 8 {
                return Err(MapperError::data(format!(
                    "invalid byte length {} for double",
                    value.len()
                )));
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&value);
            let data = f64::from_bits(u64::from_be_bytes(buf)) * scale;
            Ok(format!("{data:.6}"))
        },
        DataType::Float => {
            if value.len() != 4 {
                return Err(MapperError::data(format!(
                    "invalid byte length {} for float",
                    value.len()
                )));
            }
            let bits = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            let data = f32::from_bits(bits) as f64 * scale;
            Ok(format!("{data:.6}"))
        },
        DataType::Boolean => match value.first() {
            Some(b) => Ok((*b != 0).to_string()),
            None => Err(MapperError::data("invalid byte length 0 for boolean")),
        },
        DataType::String => Ok(sanitize_string(&value)),
        DataType::Bytes => Ok(to_hex(&value)),
    }
}

/// Keep only bytes from the text whitelist: ASCII letters, digits, and the
/// punctuation set `/ - _ . % + , = @ # : ^ ~ ? & ! *`. Everything else
/// (register padding, NULs, whitespace) is dropped.
pub fn sanitize_string(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|b| is_whitelisted(*b))
        .map(char::from)
        .collect()
}

fn is_whitelisted(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'/' | b'-' | b'_' | b'.' | b'%' | b'+' | b',' | b'=' | b'@' | b'#' | b':' | b'^' | b'~' | b'?' | b'&' | b'!' | b'*')
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a string value into raw register bytes for `data_type`.
///
/// `width` is the target byte width derived from the visitor's limit
/// (2 bytes per register); zero means the type's natural width. Integers are
/// range-checked against the requested width instead of silently truncated.
pub fn encode(data_type: DataType, value: &str, width: usize) -> Result<Vec<u8>> {
    match data_type {
        DataType::Int => {
            let v: i64 = value
                .trim()
                .parse()
                .map_err(|e| MapperError::data(format!("invalid int value {value:?}: {e}")))?;
            match width {
                1 => i8::try_from(v)
                    .map(|n| n.to_be_bytes().to_vec())
                    .map_err(|_| out_of_range(value, width)),
                2 => i16::try_from(v)
                    .map(|n| n.to_be_bytes().to_vec())
                    .map_err(|_| out_of_range(value, width)),
                4 => i32::try_from(v)
                    .map(|n| n.to_be_bytes().to_vec())
                    .map_err(|_| out_of_range(value, width)),
                0 | 8 => Ok(v.to_be_bytes().to_vec()),
                n => Err(MapperError::data(format!(
                    "invalid byte length {n} for int"
                ))),
            }
        },
        DataType::Float => {
            if width != 0 && width != 4 {
                return Err(MapperError::data(format!(
                    "invalid byte length {width} for float"
                )));
            }
            let v: f32 = value
                .trim()
                .parse()
                .map_err(|e| MapperError::data(format!("invalid float value {value:?}: {e}")))?;
            Ok(v.to_bits().to_be_bytes().to_vec())
        },
        DataType::Double => {
            if width != 0 && width != 8 {
                return Err(MapperError::data(format!(
                    "invalid byte length {width} for double"
                )));
            }
            let v: f64 = value
                .trim()
                .parse()
                .map_err(|e| MapperError::data(format!("invalid double value {value:?}: {e}")))?;
            Ok(v.to_bits().to_be_bytes().to_vec())
        },
        DataType::Boolean => {
            let v = match value.trim() {
                "true" | "1" => true,
                "false" | "0" => false,
                other => {
                    return Err(MapperError::data(format!(
                        "invalid boolean value {other:?}"
                    )))
                },
            };
            let mut out = vec![0u8; width.max(1)];
            let last = out.len() - 1;
            out[last] = v as u8;
            Ok(out)
        },
        DataType::String => {
            let bytes = value.as_bytes();
            if width == 0 {
                return Ok(bytes.to_vec());
            }
            if bytes.len() > width {
                return Err(MapperError::data(format!(
                    "string value longer than {width} bytes"
                )));
            }
            let mut out = vec![0u8; width];
            out[..bytes.len()].copy_from_slice(bytes);
            Ok(out)
        },
        DataType::Bytes => {
            let out = from_hex(value.trim())?;
            if width != 0 && out.len() != width {
                return Err(MapperError::data(format!(
                    "invalid byte length {} for bytes (expected {width})",
                    out.len()
                )));
            }
            Ok(out)
        },
    }
}

fn out_of_range(value: &str, width: usize) -> MapperError {
    MapperError::data(format!("int value {value} out of range for {width} bytes"))
}

// ============================================================================
// Hex helpers for the bytes data type
// ============================================================================

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn from_hex(text: &str) -> Result<Vec<u8>> {
    if text.len() % 2 != 0 {
        return Err(MapperError::data("hex string has odd length"));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|e| MapperError::data(format!("invalid hex string: {e}")))
        })
        .collect()
}
