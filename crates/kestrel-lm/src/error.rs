//! Error types for migration driver operations.

use kestrel_proto::CmdStatus;
use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Errors that can occur while driving a VF migration.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Device transiently unable to accept commands (e.g. mid-reset).
    /// Retry after backoff.
    #[error("device busy, command channel unavailable")]
    Busy,

    /// No completion arrived within the deadline. The caller decides
    /// whether this is fatal (lifecycle transitions) or retryable
    /// (dirty-bitmap fetches).
    #[error("no completion within {duration_ms}ms")]
    Timeout {
        /// Deadline that elapsed, in milliseconds.
        duration_ms: u64,
    },

    /// Firmware rejected the command.
    #[error("device rejected command: status {code:#04x} ({})", CmdStatus::name(*.code))]
    Device {
        /// Raw completion status byte.
        code: u8,
    },

    /// Caller supplied an argument the protocol cannot express.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the argument.
        reason: String,
    },

    /// Operation not legal in the current state.
    #[error("invalid state: {state}")]
    InvalidState {
        /// Description of the state conflict.
        state: String,
    },

    /// State blob access outside the queried size.
    #[error("blob range {offset}+{length} exceeds blob size {size}")]
    OutOfRange {
        /// Requested start offset.
        offset: u64,
        /// Requested length.
        length: u64,
        /// Queried blob size.
        size: u64,
    },

    /// Bitmap page acknowledged out of sequence order.
    #[error("sequence {seq} precedes highest acknowledged {acked}")]
    OutOfOrder {
        /// Sequence number the caller tried to acknowledge.
        seq: u32,
        /// Highest sequence number already acknowledged.
        acked: u32,
    },

    /// Dirty tracking enable requested while already active.
    #[error("dirty tracking already enabled")]
    AlreadyEnabled,

    /// No migration-capable VFs detected on the system.
    #[error("no migration-capable virtual functions found")]
    NoVfsFound,

    /// I/O error reaching the device or sysfs.
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Transport setup or MMIO failure.
    #[error("transport error: {reason}")]
    Transport {
        /// Reason for failure.
        reason: String,
    },
}

impl MigrationError {
    /// Create an invalid argument error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(state: impl Into<String>) -> Self {
        Self::InvalidState {
            state: state.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Whether the caller may retry the same operation unchanged.
    ///
    /// `Busy` and `Timeout` are transient; everything else requires the
    /// caller to correct usage or abandon the migration.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy | Self::Timeout { .. })
    }

    /// Raw device status code, when the firmware produced one.
    #[must_use]
    pub const fn device_code(&self) -> Option<u8> {
        match self {
            Self::Device { code } => Some(*code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(MigrationError::Busy.is_retryable());
        assert!(MigrationError::Timeout { duration_ms: 5 }.is_retryable());
        assert!(!MigrationError::AlreadyEnabled.is_retryable());
        assert!(!MigrationError::Device { code: 8 }.is_retryable());
    }

    #[test]
    fn device_error_names_status() {
        let err = MigrationError::Device {
            code: CmdStatus::BadState as u8,
        };
        assert!(err.to_string().contains("bad-state"));
        assert_eq!(err.device_code(), Some(8));
    }
}
