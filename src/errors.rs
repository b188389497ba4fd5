/// Custom error types for the uplink pipeline
///
/// Direct calls report failures through these values; everything that
/// happens inside the pipelines (no-ack, retries, drops) is surfaced through
/// the event bus instead.
use std::fmt;
use std::io;

/// Result type alias for SDK operations
pub type Result<T> = std::result::Result<T, SomError>;

/// SDK error enumeration
///
/// Covers the synchronous failure modes of the SDK:
/// - Validation errors (bad index, out-of-range setting)
/// - Collaborator failures (storage, transport, codec)
/// - Transfer protocol violations
/// - Critical invariant violations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SomError {
    /// Tape index outside `0..MAX_TAPE_COUNT`
    InvalidTapeIndex(usize),

    /// Setting rejected by range validation
    InvalidSetting {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Generic argument validation failure
    InvalidArgument(String),

    /// I/O error (storage or socket failure)
    IoError(String),

    /// Serialization failed - message too large or invalid structure
    SerializationError(String),

    /// Deserialization failed - corrupted datagram or incompatible format
    DeserializationError(String),

    /// Integrity check failed - CRC mismatch
    IntegrityCheckFailed { expected: u32, actual: u32 },

    /// Buffer too small for operation
    BufferTooSmall { required: usize, available: usize },

    /// ACK timeout - no response from the collector
    AckTimeout,

    /// The link is held by an in-flight delivery or transfer
    LinkBusy,

    /// Chunk received while no transfer is active
    TransferNotStarted,

    /// A previous block failed; the secondary slot must be erased first
    TransferFailed,

    /// Pending-action slot holds a request of another kind
    SlotOccupied,

    /// Memory layout or invariant violation
    Critical(String),
}

impl SomError {
    /// Build a range-validation error for a numeric setting
    pub fn out_of_range(name: &'static str, value: i64, min: i64, max: i64) -> Self {
        Self::InvalidSetting {
            name,
            value,
            min,
            max,
        }
    }

    /// Errors that must escalate to a controlled reset
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical(_))
    }
}

impl fmt::Display for SomError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTapeIndex(idx) => write!(f, "Invalid tape index: {}", idx),
            Self::InvalidSetting {
                name,
                value,
                min,
                max,
            } => write!(
                f,
                "Invalid setting {}: {} not in {}..={}",
                name, value, min, max
            ),
            Self::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Self::IoError(msg) => write!(f, "I/O error: {}", msg),
            Self::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            Self::DeserializationError(msg) => write!(f, "Deserialization error: {}", msg),
            Self::IntegrityCheckFailed { expected, actual } => {
                write!(
                    f,
                    "Integrity check failed: expected CRC32 {:#x}, got {:#x}",
                    expected, actual
                )
            }
            Self::BufferTooSmall {
                required,
                available,
            } => {
                write!(
                    f,
                    "Buffer too small: required {}, available {}",
                    required, available
                )
            }
            Self::AckTimeout => write!(f, "ACK timeout - no response from collector"),
            Self::LinkBusy => write!(f, "Link busy - delivery or transfer in progress"),
            Self::TransferNotStarted => write!(f, "No chunked transfer in progress"),
            Self::TransferFailed => write!(f, "Chunked transfer failed - erase required"),
            Self::SlotOccupied => write!(f, "Pending action slot occupied"),
            Self::Critical(msg) => write!(f, "Critical error: {}", msg),
        }
    }
}

impl std::error::Error for SomError {}

/// Convert from io::Error to SomError
impl From<io::Error> for SomError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for SomError {
    fn from(err: serde_json::Error) -> Self {
        Self::DeserializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_setting_range() {
        let err = SomError::out_of_range("max_resend_attempts", 11, 1, 10);
        assert_eq!(
            err.to_string(),
            "Invalid setting max_resend_attempts: 11 not in 1..=10"
        );
        assert!(!err.is_critical());
    }

    #[test]
    fn test_io_conversion() {
        let err: SomError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, SomError::IoError(_)));
    }
}
