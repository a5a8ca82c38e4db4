//! Remote reply API consumed by the thread engine.
//!
//! The engine only depends on the [`ReplyApi`] trait. [`HttpReplyApi`] is
//! the production implementation; tests substitute scripted fakes.
//!
//! # Credential refresh
//!
//! Every operation may fail with [`ApiError::AuthExpired`]. Callers go
//! through [`with_auth_retry`], which runs the refresh flow once and retries
//! the operation exactly once. It never loops.

mod envelope;
mod http;

pub use envelope::{AuthorDto, CreateReplyBody, Envelope, PageDto, ReplyDto, VoteDto};
pub use http::HttpReplyApi;

use crate::thread::{Page, ReplyId, ReplyNode, SortKey, VoteSnapshot};
use std::future::Future;
use thiserror::Error;

/// Errors reported by a [`ReplyApi`] implementation.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Request timed out")]
    Timeout,
    /// Non-2xx status not covered by a more specific variant
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// The access credential was refused (HTTP 401)
    #[error("Credentials expired")]
    AuthExpired,
    /// The reply does not exist on the server (HTTP 404)
    #[error("Not found")]
    NotFound,
    /// The server refused the request as invalid (HTTP 400/422)
    #[error("Rejected: {0}")]
    Rejected(String),
    /// The response body did not match the expected envelope
    #[error("Malformed response: {0}")]
    Malformed(String),
    #[error("Response too large (exceeds {0} bytes)")]
    ResponseTooLarge(usize),
    #[error("Insecure base URL: HTTPS required (except localhost for testing)")]
    InsecureBaseUrl,
    #[error("Invalid base URL: {0}")]
    InvalidBaseUrl(String),
}

/// Coarse classification used by the engine's failure paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable; nothing was applied.
    NetworkFailure,
    /// Triggers one credential refresh and one retry.
    AuthExpired,
    /// Already gone server-side.
    NotFound,
    /// Refused as invalid; retrying unchanged will not help.
    ValidationFailure,
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::AuthExpired => ErrorKind::AuthExpired,
            ApiError::NotFound => ErrorKind::NotFound,
            ApiError::Rejected(_) => ErrorKind::ValidationFailure,
            ApiError::Network(_)
            | ApiError::Timeout
            | ApiError::HttpStatus(_)
            | ApiError::Malformed(_)
            | ApiError::ResponseTooLarge(_)
            | ApiError::InsecureBaseUrl
            | ApiError::InvalidBaseUrl(_) => ErrorKind::NetworkFailure,
        }
    }
}

/// The remote operations the reply engine needs.
///
/// `opinion_id` identifies the entity the thread hangs off (the opinion in
/// a debate room); reply ids identify nodes within it.
pub trait ReplyApi: Send + Sync {
    fn list_top_level(
        &self,
        opinion_id: &str,
        page: u32,
        page_size: u32,
        sort: SortKey,
    ) -> impl Future<Output = Result<Page, ApiError>> + Send;

    fn list_children(
        &self,
        reply_id: &ReplyId,
        page: u32,
        page_size: u32,
        sort: SortKey,
    ) -> impl Future<Output = Result<Page, ApiError>> + Send;

    fn create_reply(
        &self,
        opinion_id: &str,
        content: &str,
        parent: Option<&ReplyId>,
    ) -> impl Future<Output = Result<ReplyNode, ApiError>> + Send;

    /// A reply that is already gone reports [`ApiError::NotFound`]; the engine
    /// treats that as a successful delete.
    fn delete_reply(&self, reply_id: &ReplyId) -> impl Future<Output = Result<(), ApiError>> + Send;

    fn toggle_upvote(
        &self,
        reply_id: &ReplyId,
    ) -> impl Future<Output = Result<VoteSnapshot, ApiError>> + Send;

    /// Runs the credential refresh flow after an [`ApiError::AuthExpired`].
    fn refresh_credentials(&self) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Runs `op`, and on [`ApiError::AuthExpired`] refreshes credentials once and
/// retries once. A failed refresh returns the original `AuthExpired`.
pub async fn with_auth_retry<A, T, F, Fut>(api: &A, op_name: &'static str, mut op: F) -> Result<T, ApiError>
where
    A: ReplyApi,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    match op().await {
        Err(ApiError::AuthExpired) => {
            tracing::info!(op = op_name, "Credentials expired, refreshing before one retry");
            if let Err(e) = api.refresh_credentials().await {
                tracing::warn!(op = op_name, error = %e, "Credential refresh failed");
                return Err(ApiError::AuthExpired);
            }
            let retried = op().await;
            if let Err(e) = &retried {
                tracing::warn!(op = op_name, error = %e, "Retry after credential refresh failed");
            }
            retried
        }
        other => other,
    }
}
