use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ConnectionState;

/// Broad error category used for status presentation and recovery decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChatErrorCategory {
    /// Invalid input or local configuration issue.
    Config,
    /// The server refused the operation for the current user.
    Permission,
    /// The server requires a captcha answer before accepting the send.
    Captcha,
    /// Transient network or channel failure.
    Transport,
    /// Rate-limited by the server.
    RateLimited,
    /// Malformed or unexpected payload from the server.
    Protocol,
    /// Internal invariant break.
    Internal,
}

/// Stable error payload emitted across the session command/event boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct ChatError {
    /// High-level error category.
    pub category: ChatErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl ChatError {
    /// Construct a new chat error.
    pub fn new(
        category: ChatErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: ConnectionState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            ChatErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while connection is {current:?}"),
        )
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            ChatErrorCategory::Transport | ChatErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to chat error categories.
pub fn classify_http_status(status: u16) -> ChatErrorCategory {
    match status {
        401 | 403 => ChatErrorCategory::Permission,
        408 | 429 => ChatErrorCategory::RateLimited,
        400..=499 => ChatErrorCategory::Config,
        500..=599 => ChatErrorCategory::Transport,
        _ => ChatErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(403), ChatErrorCategory::Permission);
        assert_eq!(classify_http_status(429), ChatErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), ChatErrorCategory::Config);
        assert_eq!(classify_http_status(502), ChatErrorCategory::Transport);
        assert_eq!(classify_http_status(302), ChatErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = ChatError::invalid_state(ConnectionState::DegradedPolling, "connect");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, ChatErrorCategory::Internal);
        assert!(err.message.contains("DegradedPolling"));
    }

    #[test]
    fn only_transport_and_rate_limits_are_recoverable() {
        let transport = ChatError::new(ChatErrorCategory::Transport, "t", "down");
        let limited = ChatError::new(ChatErrorCategory::RateLimited, "r", "slow");
        let denied = ChatError::new(ChatErrorCategory::Permission, "p", "no");

        assert!(transport.is_recoverable());
        assert!(limited.is_recoverable());
        assert!(!denied.is_recoverable());
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = ChatError::new(ChatErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }
}
