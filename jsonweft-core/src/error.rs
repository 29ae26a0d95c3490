use crate::value::PrimitiveKind;
use serde_json::{json, Value as JsonValue};
use std::fmt;
use thiserror::Error;

/// Errors raised by the codec itself: misconfiguration, rejected input,
/// or a malformed wire document.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("duplicate handler registered for wire key '{key}'")]
    DuplicateHandler { key: String },

    #[error("duplicate handler registered for primitive kind {kind}")]
    DuplicatePrimitive { kind: PrimitiveKind },

    #[error("guard '{guard}' rejected value: {message}")]
    GuardRejected { guard: String, message: String },

    #[error("circular reference detected during synchronous serialization")]
    CircularReference,

    #[error("asynchronous value encountered in a synchronous context")]
    AsyncInSyncContext,

    #[error("no handler registered for value of kind '{0}'")]
    Unsupported(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl CodecError {
    pub fn protocol(message: impl Into<String>) -> Self {
        CodecError::Protocol(message.into())
    }

    pub fn guard_rejected(guard: impl Into<String>, message: impl Into<String>) -> Self {
        CodecError::GuardRejected {
            guard: guard.into(),
            message: message.into(),
        }
    }

    pub fn unsupported(kind: impl Into<String>) -> Self {
        CodecError::Unsupported(kind.into())
    }
}

/// Distinguishes why a reconstructed value failed on the consumer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteErrorKind {
    /// An error produced by the remote producer and carried over the wire.
    Remote,
    /// The transport ended before this value settled.
    Interrupted,
    /// The local caller cancelled the parse.
    Aborted,
    /// The producer closed without completing or failing.
    Incomplete,
}

/// Stable error type for failures that cross the wire or cut it short.
///
/// Remote error payloads are always rebuilt into this type rather than
/// rethrown verbatim, so a remote peer cannot smuggle arbitrary shapes
/// into local error handling.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub name: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        RemoteError {
            kind: RemoteErrorKind::Remote,
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn interrupted() -> Self {
        RemoteError {
            kind: RemoteErrorKind::Interrupted,
            name: "InterruptedError".into(),
            message: "stream ended before the value settled".into(),
        }
    }

    pub fn aborted() -> Self {
        RemoteError {
            kind: RemoteErrorKind::Aborted,
            name: "AbortError".into(),
            message: "parse aborted by the caller".into(),
        }
    }

    pub fn incomplete() -> Self {
        RemoteError {
            kind: RemoteErrorKind::Incomplete,
            name: "IncompleteError".into(),
            message: "producer closed before completing".into(),
        }
    }

    pub fn is_interruption(&self) -> bool {
        matches!(
            self.kind,
            RemoteErrorKind::Interrupted | RemoteErrorKind::Aborted
        )
    }

    pub fn is_abort(&self) -> bool {
        self.kind == RemoteErrorKind::Aborted
    }

    /// Wire shape carried on an error tail: `{"name": .., "message": ..}`.
    pub fn to_payload(&self) -> JsonValue {
        json!({ "name": self.name, "message": self.message })
    }

    /// Rebuild from a tail payload, tolerating missing fields.
    pub fn from_payload(payload: &JsonValue) -> Self {
        let name = payload
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap_or("Error");
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("remote error");
        RemoteError::new(name, message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for RemoteError {}
