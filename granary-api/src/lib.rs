//! Request/response boundary
//!
//! Serde DTOs plus an [`Api`] facade mapping them onto [`Node`] operations.
//! Transport is out of scope; whatever carries the requests (HTTP, IPC, a
//! REPL) deserializes into these shapes and serializes the responses.

use granary_feed::{FeedError, TimelineEntry};
use granary_meta::MetaValue;
use granary_model::{FeedKey, Message};
use granary_node::{Node, NodeError, ReplyTarget, TrustOptions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Messages returned per timeline page when the query names no limit.
pub const DEFAULT_TIMELINE_LIMIT: u64 = 64;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Invalid feed key: {0}")]
    InvalidKey(String),

    #[error("No message at index {0}")]
    NotFound(u64),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),
}

fn map_node_err(e: NodeError) -> ApiError {
    match e {
        NodeError::Feed(FeedError::NotFound(index)) => ApiError::NotFound(index),
        other => ApiError::Node(other),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InfoResponse {
    /// Base64-encoded key of the node's own feed.
    pub feed_key: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineQuery {
    /// Feed to read; the node's own feed when absent.
    #[serde(default)]
    pub feed_key: Option<String>,
    /// How many newest messages to skip.
    #[serde(default)]
    pub offset: Option<u64>,
    /// Page size, [`DEFAULT_TIMELINE_LIMIT`] when absent.
    #[serde(default)]
    pub limit: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimelineResponse {
    pub messages: Vec<MessageDto>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    pub feed_key: Option<String>,
    pub index: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: MessageDto,
}

/// One log message with its overlay annotations, in wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageDto {
    pub index: u64,
    #[serde(flatten)]
    pub message: Message,
    pub meta: Vec<MetaDto>,
}

impl From<TimelineEntry> for MessageDto {
    fn from(entry: TimelineEntry) -> Self {
        Self {
            index: entry.index,
            message: entry.message,
            meta: entry.meta.into_iter().map(MetaDto::from).collect(),
        }
    }
}

/// Overlay annotation in wire shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetaDto {
    /// The message at `index` in `feed_key`'s log replies to this one.
    Reply { feed_key: String, index: u32 },
    /// Unrecognized annotation, hex-encoded raw bytes.
    Unknown { bytes: String },
}

impl From<MetaValue> for MetaDto {
    fn from(value: MetaValue) -> Self {
        match value {
            MetaValue::Reply { feed_key, index } => {
                MetaDto::Reply { feed_key: feed_key.to_base64(), index }
            }
            MetaValue::Unknown(bytes) => MetaDto::Unknown { bytes: hex::encode(bytes) },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostBody {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyToBody>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyToBody {
    pub feed_key: String,
    pub index: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostResponse {
    /// Index the post was assigned in the local log.
    pub index: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustBody {
    pub feed_key: String,
    /// Link lifetime in seconds; one year when absent.
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustResponse {
    /// Hex-encoded signed link bytes, for out-of-band delivery.
    pub link: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FollowBody {
    pub feed_key: String,
}

pub type UnfollowBody = FollowBody;

/// The boundary facade. Cheap to clone; all state lives in the node.
#[derive(Clone)]
pub struct Api {
    node: Arc<Node>,
}

impl Api {
    pub fn new(node: Arc<Node>) -> Self {
        Self { node }
    }

    pub fn info(&self) -> InfoResponse {
        InfoResponse { feed_key: self.node.feed_key().to_base64() }
    }

    pub async fn timeline(&self, query: TimelineQuery) -> Result<TimelineResponse, ApiError> {
        let feed_key = self.resolve_key(query.feed_key.as_deref())?;
        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(DEFAULT_TIMELINE_LIMIT);
        let entries =
            self.node.get_timeline(feed_key, offset, limit).await.map_err(map_node_err)?;
        Ok(TimelineResponse { messages: entries.into_iter().map(MessageDto::from).collect() })
    }

    pub async fn message(&self, query: MessageQuery) -> Result<MessageResponse, ApiError> {
        let feed_key = self.resolve_key(query.feed_key.as_deref())?;
        let entry = self.node.get_message(feed_key, query.index).await.map_err(map_node_err)?;
        Ok(MessageResponse { message: entry.into() })
    }

    pub async fn post(&self, body: PostBody) -> Result<PostResponse, ApiError> {
        let reply_to = body
            .reply_to
            .map(|reply| {
                Ok::<_, ApiError>(ReplyTarget {
                    feed_key: parse_key(&reply.feed_key)?,
                    index: reply.index,
                })
            })
            .transpose()?;
        let index = self.node.post(body.content, reply_to).await.map_err(map_node_err)?;
        Ok(PostResponse { index })
    }

    pub async fn trust(&self, body: TrustBody) -> Result<TrustResponse, ApiError> {
        let feed_key = parse_key(&body.feed_key)?;
        let mut options = TrustOptions::default();
        if let Some(secs) = body.expires_in {
            options.expires_in = Duration::from_secs(secs);
        }
        options.description = body.description;
        let link = self.node.trust(feed_key, options).await.map_err(map_node_err)?;
        Ok(TrustResponse { link: hex::encode(link) })
    }

    pub async fn follow(&self, body: FollowBody) -> Result<PostResponse, ApiError> {
        let feed_key = parse_key(&body.feed_key)?;
        let index = self.node.follow(feed_key).await.map_err(map_node_err)?;
        Ok(PostResponse { index })
    }

    pub async fn unfollow(&self, body: UnfollowBody) -> Result<PostResponse, ApiError> {
        let feed_key = parse_key(&body.feed_key)?;
        let index = self.node.unfollow(feed_key).await.map_err(map_node_err)?;
        Ok(PostResponse { index })
    }

    fn resolve_key(&self, encoded: Option<&str>) -> Result<FeedKey, ApiError> {
        match encoded {
            Some(encoded) => parse_key(encoded),
            None => Ok(self.node.feed_key()),
        }
    }
}

fn parse_key(encoded: &str) -> Result<FeedKey, ApiError> {
    FeedKey::from_base64(encoded).map_err(ApiError::InvalidKey)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_dto_wire_shape() {
        let dto = MessageDto {
            index: 3,
            message: Message { kind: "post".into(), created_at: 1.0, payload: serde_json::json!({ "content": "hi" }) },
            meta: vec![MetaDto::Reply { feed_key: FeedKey([2; 32]).to_base64(), index: 7 }],
        };
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["index"], 3);
        assert_eq!(json["type"], "post");
        assert_eq!(json["payload"]["content"], "hi");
        assert_eq!(json["meta"][0]["type"], "reply");
        assert_eq!(json["meta"][0]["index"], 7);
    }

    #[test]
    fn test_timeline_query_defaults() {
        let query: TimelineQuery = serde_json::from_str("{}").unwrap();
        assert_eq!(query, TimelineQuery::default());
    }

    #[test]
    fn test_parse_key_rejects_bad_input() {
        assert!(matches!(parse_key("not base64!"), Err(ApiError::InvalidKey(_))));
        // Valid base64 but wrong length.
        assert!(matches!(parse_key("aGVsbG8="), Err(ApiError::InvalidKey(_))));
    }
}
