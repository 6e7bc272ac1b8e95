use ulid::Ulid;

use crate::model::Hz;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or out-of-domain input. Nothing was read or written.
    Validation {
        field: &'static str,
        reason: String,
    },
    LimitExceeded(&'static str),
    /// Fewer free channels than requested. An expected outcome, not a fault.
    InsufficientAvailability {
        available: usize,
        requested: usize,
    },
    /// A value was already occupied at commit time. Safe to retry.
    WriteConflict(Hz),
    BandNotFound(Ulid),
    ChannelNotFound(Hz),
    AlreadyExists(Ulid),
    WalError(String),
}

/// Coarse discriminant callers switch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    InsufficientAvailability,
    WriteConflict,
    NotFound,
    AlreadyExists,
    Internal,
}

impl EngineError {
    pub(crate) fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        EngineError::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation { .. } | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::InsufficientAvailability { .. } => ErrorKind::InsufficientAvailability,
            EngineError::WriteConflict(_) => ErrorKind::WriteConflict,
            EngineError::BandNotFound(_) | EngineError::ChannelNotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand to a caller: storage failures are not described.
    pub fn client_message(&self) -> String {
        match self {
            EngineError::WalError(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation { field, reason } => write!(f, "invalid {field}: {reason}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::InsufficientAvailability {
                available,
                requested,
            } => write!(f, "Available {available}, requesting {requested}"),
            EngineError::WriteConflict(value) => {
                write!(f, "write conflict: frequency {value} is already occupied")
            }
            EngineError::BandNotFound(id) => write!(f, "band not found: {id}"),
            EngineError::ChannelNotFound(value) => write!(f, "frequency not found: {value}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
