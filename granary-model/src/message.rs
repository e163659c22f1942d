//! Log message model
//!
//! Every entry in a feed's log is a JSON document of the shape
//! `{type, created_at, payload}`. The index assigned by the log on append is
//! the message's permanent identity within that feed.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol name recorded in the `open` message of a freshly created feed.
pub const PROTOCOL_NAME: &str = "granary";

/// Protocol version recorded in the `open` message.
pub const PROTOCOL_VERSION: u32 = 1;

/// Well-known message kinds.
pub mod kind {
    pub const OPEN: &str = "open";
    pub const POST: &str = "post";
    pub const TRUST: &str = "trust";
    pub const FOLLOW: &str = "follow";
    pub const UNFOLLOW: &str = "unfollow";
}

/// A message stored in a feed's append-only log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message kind: `open`, `post`, `trust`, `follow`, `unfollow`, ...
    #[serde(rename = "type")]
    pub kind: String,
    /// Seconds since the Unix epoch, stamped at append time.
    pub created_at: f64,
    /// Kind-specific body.
    pub payload: serde_json::Value,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn now(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Self { kind: kind.into(), created_at, payload }
    }

    /// Serialize to the log's value encoding (JSON).
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from the log's value encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Payload of the `open` message appended on first-ever feed creation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OpenPayload {
    pub protocol: String,
    pub version: u32,
}

impl Default for OpenPayload {
    fn default() -> Self {
        Self { protocol: PROTOCOL_NAME.to_string(), version: PROTOCOL_VERSION }
    }
}

/// Reply reference carried inside a `post` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplyTo {
    /// Base64-encoded feed key of the message being replied to.
    pub feed_key: String,
    /// Index of the message being replied to within that feed.
    pub index: u32,
}

/// Payload of a `post` message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PostPayload {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyTo>,
}

/// Payload of a `trust` message: the audit record of an issued link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrustPayload {
    /// Base64-encoded key of the grantee.
    pub feed_key: String,
    /// Absolute expiration, seconds since the Unix epoch.
    pub expires_at: u64,
    /// Base64-encoded signed link bytes.
    pub link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Payload of `follow` and `unfollow` messages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FollowPayload {
    /// Base64-encoded key of the feed being (un)followed.
    pub feed_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let msg = Message::now("post", serde_json::json!({ "content": "hello" }));
        let bytes = msg.to_bytes().unwrap();
        let back = Message::from_bytes(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_kind_serialized_as_type() {
        let msg = Message { kind: "open".into(), created_at: 1.5, payload: serde_json::json!({}) };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "open");
        assert_eq!(json["created_at"], 1.5);
    }

    #[test]
    fn test_post_payload_omits_absent_reply() {
        let payload = PostPayload { content: "hi".into(), reply_to: None };
        let json = serde_json::to_value(&payload).unwrap();
        assert!(json.get("reply_to").is_none());
    }
}
