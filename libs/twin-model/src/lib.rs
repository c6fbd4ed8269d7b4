//! Device twin data model for the EdgeTwin mapper.
//!
//! This crate owns the vocabulary shared between the mapper service and its
//! collaborators: device models and their properties, protocol descriptors,
//! property visitors (the physical addressing + transcoding rules), twins,
//! device instances, the on-disk device-profile document, and the message
//! envelopes published on twin/data/state topics.
//!
//! The types here are plain data. All behavior (polling, decoding, driver
//! I/O) lives in the `mapsrv` service crate.

pub mod device;
pub mod message;
pub mod profile;
pub mod protocol;
pub mod visitor;

pub use device::{
    AccessMode, DataProperty, DataType, DeviceInstance, DeviceModel, DeviceStatus, Property, Twin,
    TwinProperty, ValueMetadata,
};
pub use message::{
    data_update_topic, device_id_from_delta_topic, state_report_topic, state_update_topic,
    twin_delta_topic, twin_update_topic, DataValue, DeviceData, DeviceStateUpdate, DeviceTwinDelta,
    DeviceTwinUpdate, MsgTwin, TwinStatus, TwinValue, TypeMetadata,
};
pub use profile::{DeviceProfile, ProfileDataProperty, ProfileInstance, ProfileTwin};
pub use protocol::ProtocolConfig;
pub use visitor::PropertyVisitor;
