//! Property visitors: the physical addressing and transcoding rules binding
//! a model property to device storage.

use serde::{Deserialize, Serialize};

fn default_scale() -> f64 {
    1.0
}

/// Binds a model property to a register range and the declarative rules for
/// turning raw register bytes into a typed value.
///
/// `collect_cycle` and `report_cycle` are in milliseconds. A collect cycle of
/// zero means "use the service default"; a negative value means the property
/// is never sampled (the poller only waits for cancellation).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyVisitor {
    pub property_name: String,
    #[serde(default)]
    pub model_name: String,
    /// Register kind: "CoilRegister", "DiscreteInputRegister",
    /// "HoldingRegister", "InputRegister", or a protocol-specific equivalent.
    pub register: String,
    #[serde(default)]
    pub offset: u16,
    /// Quantity to read: registers for register kinds, coils for bit kinds.
    #[serde(default)]
    pub limit: u16,
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Swap the two bytes within each 16-bit word.
    #[serde(default)]
    pub is_swap: bool,
    /// Swap 16-bit words back-to-front in 4-byte groups.
    #[serde(default)]
    pub is_register_swap: bool,
    #[serde(default)]
    pub collect_cycle: i64,
    #[serde(default)]
    pub report_cycle: i64,
    /// Driver-specific extras the panel never inspects.
    #[serde(default)]
    pub customized_values: serde_json::Value,
}

impl PropertyVisitor {
    /// Expected payload width in bytes for register kinds (2 bytes per
    /// register). Bit kinds deliver packed bytes and have no fixed width.
    pub fn register_bytes(&self) -> usize {
        self.limit as usize * 2
    }
}
