//! Edge device mapper service.
//!
//! Bridges physical industrial devices speaking field protocols (Modbus
//! TCP/RTU as the reference, others pluggable) into a uniform device-twin
//! model: one registry of devices/models/protocols, one cancellable polling
//! loop per device property, declarative raw-byte decoding, and change-aware
//! twin/data/state publishing through a sink collaborator.
//!
//! # Architecture
//!
//! ```text
//! Source (profile JSON / control plane)
//!        │
//!        ▼
//! ┌─────────────┐   per device    ┌──────────────┐   per property
//! │  DevPanel   │ ──────────────► │ device tasks │ ───────────────► PropertyPoller
//! │ (registry)  │                 │  (cancel     │                  StatusPoller
//! └─────────────┘                 │   token)     │                        │
//!        │                        └──────────────┘                        ▼
//!        │ write path                     │                      ProtocolDriver
//!        ▼                                ▼                      (pooled per channel)
//!   Register codec ◄──────────────── raw bytes                           │
//!        │                                                               ▼
//!        └────────────────────────► Sink (MQTT / upstream report) ◄── decode
//! ```
//!
//! The panel guarantees at most one live polling generation per device ID;
//! hot add/update/remove always stop the old generation first.

pub mod codec;
pub mod config;
pub mod drivers;
pub mod error;
pub mod panel;
pub mod poller;
pub mod sink;
pub mod source;

pub use config::ServiceConfig;
pub use error::{MapperError, Result};
pub use panel::{DevPanel, PanelSettings};
pub use sink::{LogSink, RecordingSink, Sink};
pub use source::{JsonProfileSource, ProfileMaps, Source};
