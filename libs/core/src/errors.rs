use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse classification of a transport failure, used by retry filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Throttling,
    ServiceUnavailable,
    InternalServerError,
    NotConnected,
    Unauthorized,
    DeviceNotFound,
    QuotaExceeded,
    MessageTooLarge,
    InvalidOperation,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Throttling => "throttling",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::InternalServerError => "internal_server_error",
            ErrorKind::NotConnected => "not_connected",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::DeviceNotFound => "device_not_found",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::MessageTooLarge => "message_too_large",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a transport operation or carried by a disconnect notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    kind: ErrorKind,
    message: String,
}

impl TransportError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn throttled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Throttling, message)
    }

    pub fn not_connected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotConnected, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_throttling(&self) -> bool {
        self.kind == ErrorKind::Throttling
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("credential provider does not support renewal")]
    NotRenewable,
    #[error("credential source failed: {0}")]
    Source(#[source] anyhow::Error),
}

/// Terminal disconnect raised once a recovery episode gives up.
#[derive(Debug, Clone, Error)]
#[error("device disconnected: {reason}")]
pub struct Disconnected {
    pub reason: String,
    #[source]
    pub transport_error: TransportError,
}

impl Disconnected {
    pub fn new(reason: impl Into<String>, transport_error: TransportError) -> Self {
        Self {
            reason: reason.into(),
            transport_error,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Caller passed an argument that violates the operation contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Upload(anyhow::Error),
    #[error("session closed")]
    Closed,
}

impl SessionError {
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, SessionError::InvalidArgument(_))
    }

    /// Returns the transport error when this is a transport failure.
    pub fn as_transport(&self) -> Option<&TransportError> {
        match self {
            SessionError::Transport(err) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn transport_error_display_includes_kind() {
        let err = TransportError::timeout("no ack within 30s");
        assert_eq!(err.to_string(), "timeout: no ack within 30s");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_throttling());
    }

    #[test]
    fn disconnected_exposes_cause() {
        let cause = TransportError::other("fake");
        let disconnected = Disconnected::new("retry exhausted", cause.clone());
        let source = disconnected.source().expect("source");
        assert_eq!(source.to_string(), cause.to_string());
    }

    #[test]
    fn contract_violation_is_flagged() {
        assert!(SessionError::InvalidArgument("blob name").is_contract_violation());
        assert!(!SessionError::Closed.is_contract_violation());
    }
}
