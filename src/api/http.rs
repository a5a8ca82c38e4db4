use super::envelope::{
    CreateReplyBody, Envelope, ErrorBody, PageDto, RefreshBody, ReplyDto, TokenGrant, VoteDto,
};
use super::{ApiError, ReplyApi};
use crate::config::Config;
use crate::thread::{Page, ReplyId, ReplyNode, SortKey, VoteSnapshot};
use crate::util::{validate_base_url, UrlValidationError};
use futures::StreamExt;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

const MAX_BODY_SIZE: usize = 1024 * 1024; // 1MB
const MAX_ERROR_BODY_SIZE: usize = 16 * 1024;

/// [`ReplyApi`] over HTTPS with bearer authentication.
pub struct HttpReplyApi {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    access_token: RwLock<Option<SecretString>>,
    refresh_token: Option<SecretString>,
}

impl std::fmt::Debug for HttpReplyApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpReplyApi")
            .field("base_url", &self.base_url.as_str())
            .field("timeout", &self.timeout)
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

impl From<UrlValidationError> for ApiError {
    fn from(err: UrlValidationError) -> Self {
        match err {
            UrlValidationError::Insecure(_) => ApiError::InsecureBaseUrl,
            other => ApiError::InvalidBaseUrl(other.to_string()),
        }
    }
}

impl HttpReplyApi {
    /// Builds a client with pooled connections and the given request timeout.
    pub fn new(
        base_url: &str,
        access_token: Option<SecretString>,
        refresh_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(30))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!("rebuttal/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(client, base_url, access_token, refresh_token, timeout)
    }

    /// Uses an existing client; the base URL is validated the same way.
    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        access_token: Option<SecretString>,
        refresh_token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let base_url = validate_base_url(base_url).inspect_err(|e| {
            tracing::error!(base_url = %base_url, error = %e, "Rejecting API base URL");
        })?;
        if base_url.scheme() == "http" {
            tracing::warn!(base_url = %base_url, "Using non-HTTPS API base URL (localhost only)");
        }
        Ok(Self {
            client,
            base_url,
            timeout,
            access_token: RwLock::new(access_token),
            refresh_token,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        Self::new(
            &config.base_url,
            config.access_token.clone(),
            config.refresh_token.clone(),
            config.request_timeout(),
        )
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/seg/seg/...`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.access_token.read().await.as_ref() {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ApiError> {
        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ApiError::Timeout)??;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::UNAUTHORIZED => Err(ApiError::AuthExpired),
            StatusCode::NOT_FOUND => Err(ApiError::NotFound),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let message = read_limited(response, MAX_ERROR_BODY_SIZE)
                    .await
                    .ok()
                    .and_then(|body| serde_json::from_slice::<ErrorBody>(&body).ok())
                    .map(|body| body.message)
                    .unwrap_or_else(|| status.canonical_reason().unwrap_or("rejected").to_string());
                Err(ApiError::Rejected(message))
            }
            other => Err(ApiError::HttpStatus(other.as_u16())),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: Url, query: &[(&str, String)]) -> Result<T, ApiError> {
        let request = self.authorized(self.client.get(url).query(query)).await;
        decode(self.send(request).await?).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, url: Url, body: Option<&B>) -> Result<T, ApiError> {
        let mut request = self.client.post(url);
        if let Some(body) = body {
            request = json_body(request, body)?;
        }
        let request = self.authorized(request).await;
        decode(self.send(request).await?).await
    }

    fn page_query(page: u32, page_size: u32, sort: SortKey) -> [(&'static str, String); 3] {
        [
            ("page", page.to_string()),
            ("limit", page_size.to_string()),
            ("sort", sort.as_str().to_string()),
        ]
    }
}

fn json_body<B: Serialize>(request: RequestBuilder, body: &B) -> Result<RequestBuilder, ApiError> {
    let bytes = serde_json::to_vec(body).map_err(|e| ApiError::Malformed(e.to_string()))?;
    Ok(request
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(bytes))
}

/// Reads the body and unwraps the `{"data": ...}` envelope.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let body = read_limited(response, MAX_BODY_SIZE).await?;
    let envelope: Envelope<T> =
        serde_json::from_slice(&body).map_err(|e| ApiError::Malformed(e.to_string()))?;
    Ok(envelope.data)
}

async fn read_limited(response: Response, limit: usize) -> Result<Vec<u8>, ApiError> {
    if let Some(len) = response.content_length() {
        if len > limit as u64 {
            return Err(ApiError::ResponseTooLarge(limit));
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(ApiError::ResponseTooLarge(limit));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

impl ReplyApi for HttpReplyApi {
    async fn list_top_level(
        &self,
        opinion_id: &str,
        page: u32,
        page_size: u32,
        sort: SortKey,
    ) -> Result<Page, ApiError> {
        let url = self.endpoint(&["opinions", opinion_id, "replies"])?;
        let dto: PageDto = self.get(url, &Self::page_query(page, page_size, sort)).await?;
        tracing::debug!(opinion_id, page, sort = %sort, items = dto.items.len(), "Fetched top-level replies");
        Page::try_from(dto)
    }

    async fn list_children(
        &self,
        reply_id: &ReplyId,
        page: u32,
        page_size: u32,
        sort: SortKey,
    ) -> Result<Page, ApiError> {
        let url = self.endpoint(&["replies", reply_id.as_str(), "children"])?;
        let dto: PageDto = self.get(url, &Self::page_query(page, page_size, sort)).await?;
        tracing::debug!(reply_id = %reply_id, page, items = dto.items.len(), "Fetched child replies");
        Page::try_from(dto)
    }

    async fn create_reply(
        &self,
        opinion_id: &str,
        content: &str,
        parent: Option<&ReplyId>,
    ) -> Result<ReplyNode, ApiError> {
        let url = self.endpoint(&["opinions", opinion_id, "replies"])?;
        let body = CreateReplyBody {
            content,
            parent_reply_id: parent.map(ReplyId::as_str),
        };
        let dto: ReplyDto = self.post(url, Some(&body)).await?;
        ReplyNode::try_from(dto)
    }

    async fn delete_reply(&self, reply_id: &ReplyId) -> Result<(), ApiError> {
        let url = self.endpoint(&["replies", reply_id.as_str()])?;
        let request = self.authorized(self.client.delete(url)).await;
        self.send(request).await?;
        Ok(())
    }

    async fn toggle_upvote(&self, reply_id: &ReplyId) -> Result<VoteSnapshot, ApiError> {
        let url = self.endpoint(&["replies", reply_id.as_str(), "upvote"])?;
        let dto: VoteDto = self.post::<(), _>(url, None).await?;
        VoteSnapshot::try_from(dto)
    }

    async fn refresh_credentials(&self) -> Result<(), ApiError> {
        let Some(refresh_token) = self.refresh_token.as_ref() else {
            tracing::debug!("No refresh token configured");
            return Err(ApiError::AuthExpired);
        };

        let url = self.endpoint(&["auth", "refresh"])?;
        let body = RefreshBody {
            refresh_token: refresh_token.expose_secret(),
        };
        // Sent without the expired bearer token.
        let request = json_body(self.client.post(url), &body)?;
        let grant: TokenGrant = decode(self.send(request).await?).await?;
        if grant.access_token.trim().is_empty() {
            return Err(ApiError::Malformed("empty access token".to_string()));
        }

        *self.access_token.write().await = Some(SecretString::from(grant.access_token));
        tracing::info!("Access token refreshed");
        Ok(())
    }
}
