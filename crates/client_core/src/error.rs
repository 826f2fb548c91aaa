use shared::error::{ApiError, ErrorCode};
use thiserror::Error;

/// Error surfaced to the initiator of a fetch or local mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Network or connection failure; local state only changes by marking the
    /// correlated mutation failed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Rejected before any optimistic change was applied.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Server refused the mutation; the optimistic change has been rolled back.
    #[error("server rejected mutation ({code:?}): {message}")]
    Conflict { code: ErrorCode, message: String },
    #[error("not found: {0}")]
    NotFound(String),
}

impl ChatError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<ApiError> for ChatError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::Validation => Self::Validation(value.message),
            ErrorCode::NotFound => Self::NotFound(value.message),
            code => Self::Conflict {
                code,
                message: value.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_api_codes_to_taxonomy() {
        assert_eq!(
            ChatError::from(ApiError::new(ErrorCode::Validation, "empty")),
            ChatError::Validation("empty".into())
        );
        assert_eq!(
            ChatError::from(ApiError::new(ErrorCode::NotFound, "gone")),
            ChatError::NotFound("gone".into())
        );
        assert_eq!(
            ChatError::from(ApiError::new(ErrorCode::Forbidden, "not yours")),
            ChatError::Conflict {
                code: ErrorCode::Forbidden,
                message: "not yours".into()
            }
        );
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        assert!(ChatError::transport("reset").is_retryable());
        assert!(!ChatError::validation("empty").is_retryable());
    }
}
