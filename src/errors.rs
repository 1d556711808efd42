//! Error handling for the reward joiner
//!
//! Errors fall into three buckets. Setup errors stop the run before a single
//! record is read, stream-fatal errors abort joining for the rest of the log,
//! and everything else recoverable never reaches this type at all: it is
//! counted in [`crate::telemetry::JoinMetrics`] instead.

use thiserror::Error;

/// Failures raised while decoding the binary log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bad magic: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported log version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },

    #[error("truncated frame: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("corrupt frame at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    #[error("read failed: {0}")]
    Io(String),
}

impl DecodeError {
    pub fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            offset,
            reason: reason.into(),
        }
    }

    /// Header problems are discovered before any record is produced.
    pub fn is_header_error(&self) -> bool {
        matches!(self, Self::BadMagic { .. } | Self::UnsupportedVersion { .. })
    }
}

/// Main error type for the joiner
#[derive(Error, Debug)]
pub enum JoinerError {
    #[error("Configuration error: {field} - {message}")]
    Config { field: String, message: String },

    #[error("Configuration could not be loaded")]
    ConfigLoad {
        #[source]
        source: Box<figment::Error>,
    },

    #[error("Log decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Input is already structured text: {path}")]
    AlreadyText { path: String },

    #[error("I/O operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization failed: {context}")]
    Serialization {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Encoding failed: {context}")]
    Encoding {
        context: String,
        #[source]
        source: bincode::Error,
    },
}

pub type JoinerResult<T> = Result<T, JoinerError>;

impl JoinerError {
    /// Create a configuration error
    pub fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Config {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an I/O error
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a serialization error
    pub fn serialization(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            context: context.into(),
            source,
        }
    }

    /// Create a binary encoding error
    pub fn encoding(context: impl Into<String>, source: bincode::Error) -> Self {
        Self::Encoding {
            context: context.into(),
            source,
        }
    }

    /// Errors that prevent processing from ever starting.
    pub fn is_setup(&self) -> bool {
        match self {
            Self::Config { .. } | Self::ConfigLoad { .. } | Self::AlreadyText { .. } => true,
            Self::Decode(e) => e.is_header_error(),
            _ => false,
        }
    }

    /// Errors that end joining for the remainder of the stream.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            Self::Decode(DecodeError::Corrupt { .. }) | Self::Decode(DecodeError::Io(_))
        )
    }
}

impl From<figment::Error> for JoinerError {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad {
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for JoinerError {
    fn from(err: serde_json::Error) -> Self {
        JoinerError::serialization("json_operation", err)
    }
}

impl From<std::io::Error> for JoinerError {
    fn from(err: std::io::Error) -> Self {
        JoinerError::io("io_operation", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let cfg = JoinerError::config("problem_type", "unknown value 'xyz'");
        assert!(cfg.is_setup());
        assert!(!cfg.is_stream_fatal());
        assert!(cfg.to_string().contains("problem_type"));

        let version: JoinerError = DecodeError::UnsupportedVersion {
            found: 9,
            supported: 1,
        }
        .into();
        assert!(version.is_setup());

        let corrupt: JoinerError = DecodeError::corrupt(128, "unknown kind 0x7").into();
        assert!(corrupt.is_stream_fatal());
        assert!(!corrupt.is_setup());
    }

    #[test]
    fn test_error_chaining() {
        use std::error::Error;

        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err = JoinerError::io("opening log", io_err);

        assert!(err.source().is_some());
        assert!(err.to_string().contains("I/O operation failed"));
    }
}
