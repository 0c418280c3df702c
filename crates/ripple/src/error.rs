//! Error types for the realtime layer.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric error codes carried by [`ErrorInfo`].
///
/// The codes follow the wire protocol's error taxonomy so callers can match
/// on them without inspecting message text.
pub mod codes {
    /// A channel operation (such as attach) settled in a non-attached state.
    pub const CHANNEL_OPERATION_FAILED: u32 = 90000;

    /// A presence operation was attempted without an authenticated client id.
    pub const PRESENCE_NO_CLIENT_ID: u32 = 91000;

    /// A presence operation was attempted in a channel state that cannot
    /// carry it (detaching, detached, suspended or failed).
    pub const PRESENCE_BAD_CHANNEL_STATE: u32 = 91001;

    /// Automatic presence re-entry after a resumed attach failed.
    pub const PRESENCE_REENTRY_FAILED: u32 = 91004;

    /// A presence message id could not be parsed.
    pub const PRESENCE_BAD_MESSAGE_ID: u32 = 91005;
}

/// An error reported by the realtime layer.
///
/// Carries the numeric protocol error code alongside a human-readable
/// message. Cloneable so a single failure can be fanned out to every queued
/// operation it aborts.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ErrorInfo {
    /// Protocol error code, see [`codes`].
    pub code: u32,
    /// Human-readable description of the failure.
    pub message: String,
}

impl ErrorInfo {
    /// Create an error with the given code and message.
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code() {
        let err = ErrorInfo::new(codes::PRESENCE_NO_CLIENT_ID, "no client id");
        assert_eq!(err.to_string(), "[91000] no client id");
    }
}
