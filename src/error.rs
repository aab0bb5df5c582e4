use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::register_map::{CommandFlag, Field};

/// Failure to open a Modbus session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("connection attempt timed out")]
    Timeout,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Failure of a single register read or write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("register i/o timed out")]
    Timeout,
    #[error("disconnected: {0}")]
    Disconnected(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TransportError::Timeout,
            std::io::ErrorKind::InvalidData => TransportError::MalformedResponse(err.to_string()),
            _ => TransportError::Disconnected(err.to_string()),
        }
    }
}

impl From<tokio_modbus::Error> for TransportError {
    fn from(err: tokio_modbus::Error) -> Self {
        match err {
            tokio_modbus::Error::Transport(io) => io.into(),
            other => TransportError::MalformedResponse(other.to_string()),
        }
    }
}

impl From<tokio_modbus::Exception> for TransportError {
    fn from(exception: tokio_modbus::Exception) -> Self {
        TransportError::MalformedResponse(format!("device exception: {exception}"))
    }
}

/// Lookup or composition failure against a device descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterMapError {
    #[error("{model} has no register for {field:?}")]
    UnknownField { model: String, field: Field },
    #[error("{model} has no code for {flag:?}")]
    UnknownCommand { model: String, flag: CommandFlag },
    #[error("command word {word:#06x} asserts mutually exclusive bits")]
    ConflictingBits { word: u16 },
    #[error("command word {word:#06x} is not supported by {model}")]
    UnsupportedCode { model: String, word: u16 },
}

/// A hardware-reported error condition, latched until cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("device fault {code:#06x}: {description}")]
pub struct DeviceFault {
    pub code: u16,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum GripperError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    RegisterMap(#[from] RegisterMapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Another handshake is in flight on this connection.
    #[error("a command is already in progress on this connection")]
    Busy,
    #[error("no acknowledgment after {attempts} attempt(s)")]
    TimeoutExceeded { attempts: u32 },
    #[error(transparent)]
    DeviceFault(#[from] DeviceFault),
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },
    /// The handshake was pre-empted by `stop()`.
    #[error("command aborted by stop")]
    Aborted,
    #[error("gripper is not connected")]
    NotConnected,
}

impl GripperError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        GripperError::Validation {
            field,
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = GripperError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_transport_kinds() {
        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        assert_eq!(TransportError::from(timeout), TransportError::Timeout);

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer gone");
        assert!(matches!(TransportError::from(reset), TransportError::Disconnected(_)));
    }

    #[test]
    fn fault_display_carries_code() {
        let fault = DeviceFault {
            code: 0x0402,
            description: "Jam".into(),
        };
        let err = GripperError::from(fault);
        assert_eq!(err.to_string(), "device fault 0x0402: Jam");
    }
}
