//! Error handling for the mapper service.

use thiserror::Error;

/// Mapper service error type.
#[derive(Error, Debug, Clone)]
pub enum MapperError {
    /// Configuration-related errors (malformed profile, missing
    /// cross-references). Fatal at load time.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input/output operation errors.
    #[error("IO error: {0}")]
    Io(String),

    /// Protocol communication errors (bad frame, exception response).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Connection establishment and maintenance errors.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Data handling errors (decode, encode, translate, validation of values).
    #[error("Data error: {0}")]
    Data(String),

    /// Operation timeout errors.
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// Lookup failures (unknown device, model, protocol, property).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request validation errors (access mode, unsupported operation).
    #[error("Validation error: {0}")]
    Validation(String),

    /// Publishing/reporting errors from the sink collaborator.
    #[error("Sink error: {0}")]
    Sink(String),

    /// Internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for the mapper service.
pub type Result<T> = std::result::Result<T, MapperError>;

impl MapperError {
    pub fn config(msg: impl Into<String>) -> Self {
        MapperError::Config(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        MapperError::Io(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        MapperError::Protocol(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        MapperError::Connection(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        MapperError::Data(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        MapperError::Timeout(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        MapperError::NotFound(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        MapperError::Validation(msg.into())
    }

    pub fn sink(msg: impl Into<String>) -> Self {
        MapperError::Sink(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        MapperError::Internal(msg.into())
    }

    // Convenience constructors for specific cases
    pub fn device_not_found(id: impl std::fmt::Display) -> Self {
        MapperError::NotFound(format!("device {id}"))
    }

    pub fn not_connected() -> Self {
        MapperError::Connection("not connected".to_string())
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for MapperError {
    fn from(err: std::io::Error) -> Self {
        MapperError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MapperError {
    fn from(err: serde_json::Error) -> Self {
        MapperError::Data(format!("JSON: {err}"))
    }
}

impl From<serde_yaml::Error> for MapperError {
    fn from(err: serde_yaml::Error) -> Self {
        MapperError::Data(format!("YAML: {err}"))
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors.
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn data_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| MapperError::Config(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| MapperError::Protocol(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| MapperError::Connection(format!("{msg}: {e}")))
    }

    fn data_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| MapperError::Data(format!("{msg}: {e}")))
    }
}
