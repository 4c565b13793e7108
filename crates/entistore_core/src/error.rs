//! Error types for EntiStore core.

use crate::entity::EntityId;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in EntiStore core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] entistore_storage::StorageError),

    /// Payload codec error.
    #[error("codec error: {0}")]
    Codec(#[from] entistore_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The engine could not open the store.
    ///
    /// Every operation after a failed initialization returns this error
    /// with the original cause.
    #[error("initialization failed: {message}")]
    InitializationFailed {
        /// Description of the failure.
        message: String,
    },

    /// A record's framing or metadata is inconsistent.
    #[error("corrupt record at offset {offset}: {message}")]
    CorruptRecord {
        /// Offset of the record in the entity log.
        offset: u64,
        /// Description of the corruption.
        message: String,
    },

    /// No active record exists for the entity.
    #[error("entity not found: {entity_id}")]
    NotFound {
        /// The entity ID that was not found.
        entity_id: EntityId,
    },

    /// An active record already exists for the entity.
    #[error("entity already exists: {entity_id}")]
    AlreadyExists {
        /// The conflicting entity ID.
        entity_id: EntityId,
    },

    /// A lock was not granted within the configured timeout.
    #[error("lock not acquired within {timeout:?}")]
    LockTimeout {
        /// The configured timeout.
        timeout: Duration,
    },

    /// The operation was cancelled while waiting.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Invalid store format or version.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Store directory is already open or locked.
    #[error("store locked: another process has exclusive access")]
    DatabaseLocked,

    /// The engine has been closed.
    #[error("engine is closed")]
    EngineClosed,
}

/// Coarse classification of an error for callers deciding what to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The caller's precondition was wrong (missing or duplicate key, misuse).
    Precondition,
    /// The store or its environment is broken.
    System,
    /// The operation may succeed if retried.
    Retry,
}

impl CoreError {
    /// Creates an initialization failed error.
    pub fn initialization_failed(message: impl Into<String>) -> Self {
        Self::InitializationFailed {
            message: message.into(),
        }
    }

    /// Creates a corrupt record error.
    pub fn corrupt_record(offset: u64, message: impl Into<String>) -> Self {
        Self::CorruptRecord {
            offset,
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Classifies the error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::InvalidOperation { .. }
            | Self::EngineClosed => ErrorClass::Precondition,
            Self::LockTimeout { .. } | Self::Cancelled | Self::DatabaseLocked => ErrorClass::Retry,
            Self::Storage(_)
            | Self::Codec(_)
            | Self::Io(_)
            | Self::InitializationFailed { .. }
            | Self::CorruptRecord { .. }
            | Self::InvalidFormat { .. } => ErrorClass::System,
        }
    }

    /// Message to carry into an [`InitializationFailed`](Self::InitializationFailed)
    /// error without nesting prefixes.
    pub(crate) fn into_init_message(self) -> String {
        match self {
            Self::InitializationFailed { message } => message,
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes() {
        let id = EntityId::from_bytes([7; 16]);
        assert_eq!(
            CoreError::NotFound { entity_id: id }.class(),
            ErrorClass::Precondition
        );
        assert_eq!(
            CoreError::AlreadyExists { entity_id: id }.class(),
            ErrorClass::Precondition
        );
        assert_eq!(CoreError::Cancelled.class(), ErrorClass::Retry);
        assert_eq!(
            CoreError::corrupt_record(14, "short").class(),
            ErrorClass::System
        );
        assert_eq!(
            CoreError::initialization_failed("bad header").class(),
            ErrorClass::System
        );
    }

    #[test]
    fn init_message_does_not_nest() {
        let err = CoreError::initialization_failed("bad header");
        assert_eq!(err.into_init_message(), "bad header");

        let err = CoreError::corrupt_record(3, "short");
        assert_eq!(err.into_init_message(), "corrupt record at offset 3: short");
    }
}
