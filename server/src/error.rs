//! Error types for the Mainframe hub.
//!
//! This module defines the error hierarchy used by the event router and the
//! connection layer. Every rejected or malformed inbound envelope is turned
//! into a [`HubError`], which knows both its internal description (for logs)
//! and the text shown to the peer that sent the frame.
//!
//! # Error Categories
//!
//! - **Identity**: unknown or mismatched session id
//! - **Authentication**: missing, invalid, or repeated credential submission
//! - **Permission**: credential lacks the capability for the action
//! - **Decode**: envelope or payload does not match the expected shape
//! - **Persistence**: the store failed (never fatal to a broadcast)
//! - **Transport**: connection-level failure, confined to one session
//!
//! # Example
//!
//! ```rust
//! use mainframe_hub::error::{ErrorCategory, HubError};
//!
//! let err = HubError::decode("minecraft_player_join");
//! assert_eq!(err.category(), ErrorCategory::Decode);
//! assert_eq!(
//!     err.client_message(),
//!     "Invalid message structure for minecraft_player_join"
//! );
//! ```

use thiserror::Error;

/// Broad classification of a [`HubError`].
///
/// Used for log fields and to decide whether an error is the peer's fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Identity,
    Authentication,
    Permission,
    RateLimit,
    Decode,
    Persistence,
    Transport,
    Internal,
}

impl ErrorCategory {
    /// Returns the lowercase label used in structured logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Authentication => "authentication",
            Self::Permission => "permission",
            Self::RateLimit => "rate_limit",
            Self::Decode => "decode",
            Self::Persistence => "persistence",
            Self::Transport => "transport",
            Self::Internal => "internal",
        }
    }
}

/// Top-level error type for envelope routing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The `client_id` in the envelope is not a registered session.
    #[error("unknown session id '{0}'")]
    UnknownSession(String),

    /// The `client_id` in the envelope belongs to another connection.
    #[error("claimed session id '{claimed}' does not match connection '{actual}'")]
    SessionMismatch {
        /// The id the peer put in the envelope.
        claimed: String,
        /// The id assigned to the physical connection.
        actual: String,
    },

    /// A non-authentication action arrived before a credential was attached.
    #[error("session is not authenticated")]
    NotAuthenticated,

    /// A credential was submitted by a session that already has one.
    #[error("session is already authenticated")]
    AlreadyAuthenticated,

    /// The submitted secret does not match any issued credential.
    #[error("invalid api key")]
    InvalidCredential,

    /// The credential lacks the named capability.
    #[error("credential lacks {0} permission")]
    PermissionDenied(&'static str),

    /// The credential exhausted its hourly quota.
    #[error("rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds until a token becomes available.
        retry_after_secs: u64,
    },

    /// The action tag is not part of the closed action table.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// The frame is not a valid envelope at all.
    #[error("malformed envelope")]
    MalformedEnvelope,

    /// The payload does not match the action's expected shape.
    #[error("invalid payload for action '{0}'")]
    Decode(String),

    /// A store call failed. The string is the peer-facing notice.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A connection-level failure.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Unexpected failure inside the hub.
    #[error("internal hub error: {0}")]
    Internal(String),
}

impl HubError {
    /// Creates a decode error for the given wire action name.
    pub fn decode(action: impl Into<String>) -> Self {
        Self::Decode(action.into())
    }

    /// Creates a persistence error carrying the notice sent to the peer.
    pub fn persistence(notice: impl Into<String>) -> Self {
        Self::Persistence(notice.into())
    }

    /// Creates a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownSession(_) | Self::SessionMismatch { .. } => ErrorCategory::Identity,
            Self::NotAuthenticated | Self::AlreadyAuthenticated | Self::InvalidCredential => {
                ErrorCategory::Authentication
            }
            Self::PermissionDenied(_) => ErrorCategory::Permission,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::UnknownAction(_) | Self::MalformedEnvelope | Self::Decode(_) => {
                ErrorCategory::Decode
            }
            Self::Persistence(_) => ErrorCategory::Persistence,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns the text placed in the `data` field of the error envelope.
    ///
    /// These strings are part of the wire protocol; bots match on some of
    /// them, so they must stay stable.
    pub fn client_message(&self) -> String {
        match self {
            Self::UnknownSession(_) => "The client_id you gave is not valid.".to_string(),
            Self::SessionMismatch { .. } => {
                "It seems you sent a client_id that does not match the one assigned to you!"
                    .to_string()
            }
            Self::NotAuthenticated => {
                "You need to register your API key with the 'x-api-key' event action".to_string()
            }
            Self::AlreadyAuthenticated => "You are already authenticated.".to_string(),
            Self::InvalidCredential => "Invalid api key received.".to_string(),
            Self::PermissionDenied(permission) => {
                format!("No {permission} permissions for your API key.")
            }
            Self::RateLimited { retry_after_secs } => {
                format!("Rate limit exceeded, retry after {retry_after_secs} seconds")
            }
            Self::UnknownAction(_) => "Invalid event action type".to_string(),
            Self::MalformedEnvelope => "Invalid message structure".to_string(),
            Self::Decode(action) => format!("Invalid message structure for {action}"),
            Self::Persistence(notice) => notice.clone(),
            Self::Transport(_) | Self::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// Returns `true` if the peer caused this error.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::Persistence | ErrorCategory::Transport | ErrorCategory::Internal
        )
    }
}

/// A specialized Result type for routing operations.
pub type Result<T> = std::result::Result<T, HubError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_errors_are_categorized() {
        assert_eq!(
            HubError::UnknownSession("abc".into()).category(),
            ErrorCategory::Identity
        );
        let mismatch = HubError::SessionMismatch {
            claimed: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(mismatch.category(), ErrorCategory::Identity);
    }

    #[test]
    fn authentication_errors_are_categorized() {
        for err in [
            HubError::NotAuthenticated,
            HubError::AlreadyAuthenticated,
            HubError::InvalidCredential,
        ] {
            assert_eq!(err.category(), ErrorCategory::Authentication);
        }
    }

    #[test]
    fn decode_family_shares_category() {
        assert_eq!(
            HubError::UnknownAction("x".into()).category(),
            ErrorCategory::Decode
        );
        assert_eq!(HubError::MalformedEnvelope.category(), ErrorCategory::Decode);
        assert_eq!(HubError::decode("x").category(), ErrorCategory::Decode);
    }

    #[test]
    fn client_messages_match_protocol_text() {
        assert_eq!(
            HubError::AlreadyAuthenticated.client_message(),
            "You are already authenticated."
        );
        assert_eq!(
            HubError::PermissionDenied("write").client_message(),
            "No write permissions for your API key."
        );
        assert_eq!(
            HubError::MalformedEnvelope.client_message(),
            "Invalid message structure"
        );
        assert_eq!(
            HubError::UnknownAction("nope".into()).client_message(),
            "Invalid event action type"
        );
    }

    #[test]
    fn persistence_notice_is_passed_through() {
        let err = HubError::persistence("Error saving minecraft chat message to database");
        assert_eq!(
            err.client_message(),
            "Error saving minecraft chat message to database"
        );
        assert!(!err.is_client_error());
    }

    #[test]
    fn internal_details_are_not_leaked_to_peers() {
        let err = HubError::internal("store pool exhausted at 10.0.0.4");
        assert_eq!(err.client_message(), "Internal server error");
        assert!(err.to_string().contains("10.0.0.4"));
    }

    #[test]
    fn rate_limit_message_carries_retry_after() {
        let err = HubError::RateLimited {
            retry_after_secs: 42,
        };
        assert!(err.is_client_error());
        assert_eq!(
            err.client_message(),
            "Rate limit exceeded, retry after 42 seconds"
        );
    }

    #[test]
    fn category_labels_are_stable() {
        assert_eq!(ErrorCategory::Identity.as_str(), "identity");
        assert_eq!(ErrorCategory::RateLimit.as_str(), "rate_limit");
    }
}
