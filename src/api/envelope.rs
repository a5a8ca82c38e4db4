//! Wire shapes of the reply API.
//!
//! Every successful response is `{"data": ...}`. The body is decoded into
//! [`Envelope`] exactly once and converted to domain types here, so nothing
//! past this module ever inspects raw response shapes.

use super::ApiError;
use crate::thread::{Author, Depth, Page, ReplyId, ReplyNode, VoteSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub data: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorDto {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyDto {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub depth: u8,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub is_deleted: bool,
    pub author: AuthorDto,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_edited: bool,
    #[serde(default)]
    pub upvoted: bool,
    #[serde(default)]
    pub upvote_count: i64,
    #[serde(default)]
    pub child_count: i64,
    #[serde(default)]
    pub is_owner: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDto {
    pub items: Vec<ReplyDto>,
    #[serde(default)]
    pub has_next_page: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteDto {
    pub upvoted: bool,
    pub upvote_count: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateReplyBody<'a> {
    pub content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_reply_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RefreshBody<'a> {
    pub refresh_token: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenGrant {
    pub access_token: String,
}

/// Body of a 400/422 response.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(alias = "error")]
    pub message: String,
}

fn count(field: &str, value: i64) -> Result<u32, ApiError> {
    u32::try_from(value).map_err(|_| ApiError::Malformed(format!("{field} out of range: {value}")))
}

impl TryFrom<ReplyDto> for ReplyNode {
    type Error = ApiError;

    fn try_from(dto: ReplyDto) -> Result<Self, Self::Error> {
        let depth = Depth::new(dto.depth).map_err(|e| ApiError::Malformed(e.to_string()))?;
        let parent_id = dto.parent_id.filter(|p| !p.is_empty()).map(ReplyId::from);
        if (depth == Depth::TOP) != parent_id.is_none() {
            return Err(ApiError::Malformed(format!(
                "reply {} has depth {} but parent {:?}",
                dto.id, depth, parent_id
            )));
        }

        Ok(ReplyNode {
            id: ReplyId::from(dto.id),
            parent_id,
            depth,
            content: if dto.is_deleted { String::new() } else { dto.content },
            is_deleted: dto.is_deleted,
            author: Author {
                id: dto.author.id,
                display_name: dto.author.display_name,
                avatar_url: dto.author.avatar_url,
            },
            created_at: dto.created_at,
            is_edited: dto.is_edited,
            upvoted: dto.upvoted,
            upvote_count: count("upvoteCount", dto.upvote_count)?,
            child_count: count("childCount", dto.child_count)?,
            is_owner: dto.is_owner,
        })
    }
}

impl TryFrom<PageDto> for Page {
    type Error = ApiError;

    fn try_from(dto: PageDto) -> Result<Self, Self::Error> {
        let items = dto
            .items
            .into_iter()
            .map(ReplyNode::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            has_next_page: dto.has_next_page,
        })
    }
}

impl TryFrom<VoteDto> for VoteSnapshot {
    type Error = ApiError;

    fn try_from(dto: VoteDto) -> Result<Self, Self::Error> {
        Ok(VoteSnapshot {
            upvoted: dto.upvoted,
            upvote_count: count("upvoteCount", dto.upvote_count)?,
        })
    }
}
