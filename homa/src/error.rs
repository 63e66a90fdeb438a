//! Error types for the Homa transport.

use std::fmt;

/// Error type for transport operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the underlying packet driver.
    Io(std::io::Error),
    /// Packet carried an opcode this transport does not understand.
    InvalidOpcode(u8),
    /// Buffer too small to hold the expected header.
    BufferTooSmall { required: usize, available: usize },
    /// Message exceeds the maximum transmittable size.
    MessageTooLarge { size: usize, max: usize },
    /// Invalid configuration.
    InvalidConfig(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidOpcode(op) => write!(f, "invalid opcode: {}", op),
            Error::BufferTooSmall {
                required,
                available,
            } => {
                write!(
                    f,
                    "buffer too small: required {} bytes, available {} bytes",
                    required, available
                )
            }
            Error::MessageTooLarge { size, max } => {
                write!(f, "message too large: {} bytes, max {} bytes", size, max)
            }
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;
