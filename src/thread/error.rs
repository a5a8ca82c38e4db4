use super::model::{Depth, ReplyId};
use crate::api::{ApiError, ErrorKind};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// An intent that was refused before any request was made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Reply cannot be empty")]
    EmptyContent,

    #[error("Reply is longer than {max} characters")]
    ContentTooLong { max: usize },

    /// The target reply is already at the nesting cap.
    #[error("Replies nest at most {} levels deep", Depth::MAX.get() + 1)]
    DepthCapReached(ReplyId),

    #[error("Reply {0} has been deleted")]
    Deleted(ReplyId),

    #[error("Only the author can delete reply {0}")]
    NotOwner(ReplyId),

    #[error("Reply {0} is not loaded in this thread")]
    UnknownReply(ReplyId),

    /// The server refused the request as invalid.
    #[error("Rejected by server: {0}")]
    Rejected(String),
}

/// Failure surfaced to the presentation layer.
///
/// Every variant leaves the thread in a consistent state: nothing partial is
/// applied, and network failures can be retried by repeating the intent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplyError {
    #[error("Network error: {0}")]
    NetworkFailure(String),

    #[error("Reply no longer exists")]
    NotFound,

    #[error(transparent)]
    ValidationFailure(#[from] ValidationError),
}

impl ReplyError {
    /// Returns true if repeating the same intent may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReplyError::NetworkFailure(_))
    }
}

impl From<ApiError> for ReplyError {
    fn from(err: ApiError) -> Self {
        match err.kind() {
            // Reaching here means the one refresh-and-retry already happened.
            ErrorKind::NetworkFailure | ErrorKind::AuthExpired => {
                ReplyError::NetworkFailure(err.to_string())
            }
            ErrorKind::NotFound => ReplyError::NotFound,
            ErrorKind::ValidationFailure => match err {
                ApiError::Rejected(message) => {
                    ReplyError::ValidationFailure(ValidationError::Rejected(message))
                }
                other => ReplyError::ValidationFailure(ValidationError::Rejected(other.to_string())),
            },
        }
    }
}
