//! Typed errors for the program runtime
//!
//! Every failure that crosses the sandbox boundary is a [`ProgramError`]: a
//! closed [`ErrorKind`] discriminant, a human readable message, and an
//! optional JSON detail payload. The closed set lets the engine, the budget
//! and the flow combinators dispatch on failures without string matching.

use serde::{Deserialize, Serialize};

use crate::Json;

/// The closed set of failure discriminants used across the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Timeout,
    Capability,
    Precondition,
    Pathfind,
    ResourceLimit,
    InvalidArgument,
    ExternalDisconnected,
    OperationFailed,
    Runtime,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Capability => "CAPABILITY",
            ErrorKind::Precondition => "PRECONDITION",
            ErrorKind::Pathfind => "PATHFIND",
            ErrorKind::ResourceLimit => "RESOURCE_LIMIT",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::ExternalDisconnected => "EXTERNAL_DISCONNECTED",
            ErrorKind::OperationFailed => "OPERATION_FAILED",
            ErrorKind::Runtime => "RUNTIME",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed runtime error with kind, message and optional detail payload.
#[derive(Debug, Clone, Deserialize, Serialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProgramError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Json>,
}

impl ProgramError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: Json) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn capability(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capability, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Precondition, message)
    }

    pub fn resource_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceLimit, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExternalDisconnected, message)
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::OperationFailed, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_as_screaming_snake_case() {
        let s = serde_json::to_string(&ErrorKind::ResourceLimit).unwrap();
        assert_eq!(s, r#""RESOURCE_LIMIT""#);
        let k: ErrorKind = serde_json::from_str(r#""EXTERNAL_DISCONNECTED""#).unwrap();
        assert_eq!(k, ErrorKind::ExternalDisconnected);
    }

    #[test]
    fn error_display_includes_kind_and_message() {
        let err = ProgramError::capability("operation requires capability move");
        assert_eq!(
            err.to_string(),
            "CAPABILITY: operation requires capability move"
        );
    }

    #[test]
    fn detail_roundtrips_through_json() {
        let err = ProgramError::resource_limit("per-minute quota exceeded")
            .with_detail(serde_json::json!({"capability": "dig", "limit": 20}));
        let s = serde_json::to_string(&err).unwrap();
        let back: ProgramError = serde_json::from_str(&s).unwrap();
        assert_eq!(back.kind, ErrorKind::ResourceLimit);
        assert_eq!(back.detail.unwrap()["limit"], 20);
    }
}
