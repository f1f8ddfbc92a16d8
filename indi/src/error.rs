//! INDI error types
//!
//! Store lookups never fail; these errors cover connection handling, command
//! requests and the blocking wait.

use std::fmt;
use std::time::Duration;

/// INDI client errors
#[derive(Debug, Clone, PartialEq)]
pub enum IndiError {
    /// Not connected to server
    NotConnected,
    /// Connection to INDI server failed
    ConnectionFailed(String),
    /// Connection timeout with context
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// The session already holds a live connection
    DuplicateConnection(String),
    /// Empty device/property/elements or a type that cannot be sent
    InvalidRequest(String),
    /// Property not found
    PropertyNotFound { device: String, property: String },
    /// A requested element went to Alert; carries the latest server message
    DeviceAlert {
        device: String,
        property: String,
        message: String,
    },
    /// The device disconnected while a blocking send was waiting
    DeviceDisconnected(String),
    /// The abort token was signalled during a blocking wait
    Aborted,
    /// Blocking send exceeded the configured timeout
    OperationTimeout {
        device: String,
        property: String,
        duration: Duration,
    },
    /// Send channel closed
    ChannelClosed(String),
    /// XML parse error
    ParseError(String),
    /// Socket or file error
    Io(String),
    /// No client registered under this session id
    UnknownSession(String),
}

impl IndiError {
    /// Cancellation is reported separately from command failure
    pub fn is_aborted(&self) -> bool {
        matches!(self, IndiError::Aborted)
    }
}

impl std::error::Error for IndiError {}

impl fmt::Display for IndiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndiError::NotConnected => write!(f, "Not connected to INDI server"),
            IndiError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            IndiError::ConnectionTimeout {
                host,
                port,
                duration,
            } => {
                write!(
                    f,
                    "Connection timeout: failed to connect to {}:{} after {:?}",
                    host, port, duration
                )
            }
            IndiError::DuplicateConnection(session) => {
                write!(f, "Session '{}' is already connected", session)
            }
            IndiError::InvalidRequest(msg) => write!(f, "Invalid property request: {}", msg),
            IndiError::PropertyNotFound { device, property } => {
                write!(f, "Property not found: {}.{}", device, property)
            }
            IndiError::DeviceAlert {
                device,
                property,
                message,
            } => {
                if message.is_empty() {
                    write!(f, "Device alert on {}.{}", device, property)
                } else {
                    write!(f, "Device alert on {}.{}: {}", device, property, message)
                }
            }
            IndiError::DeviceDisconnected(device) => {
                write!(f, "Device '{}' disconnected while waiting", device)
            }
            IndiError::Aborted => write!(f, "Process aborted"),
            IndiError::OperationTimeout {
                device,
                property,
                duration,
            } => {
                write!(
                    f,
                    "Timed out waiting for {}.{} after {:?}",
                    device, property, duration
                )
            }
            IndiError::ChannelClosed(msg) => write!(f, "Channel closed: {}", msg),
            IndiError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            IndiError::Io(msg) => write!(f, "I/O error: {}", msg),
            IndiError::UnknownSession(session) => write!(f, "Unknown session '{}'", session),
        }
    }
}

impl From<std::io::Error> for IndiError {
    fn from(e: std::io::Error) -> Self {
        IndiError::Io(e.to_string())
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;
