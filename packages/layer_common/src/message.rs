use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::conversation::Conversation;
use crate::identity::BasicIdentity;

pub const MIME_TEXT_PLAIN: &str = "text/plain";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `layer:///messages/...` identifier
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub receipts_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Box<Conversation>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<BasicIdentity>,
    #[serde(default, rename = "is_unread")]
    pub unread: bool,
    /// Identity id -> `sent` / `delivered` / `read`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub recipient_status: BTreeMap<String, String>,
}

impl Message {
    /// Bodies of every `text/plain` part, in order.
    pub fn text_parts(&self) -> impl Iterator<Item = &str> {
        self.parts
            .iter()
            .filter(|part| part.mime_type == MIME_TEXT_PLAIN)
            .map(|part| part.body.as_str())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default)]
    pub body: String,
    pub mime_type: String,
    /// `base64` when the body is encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Set instead of `body` for parts larger than 2KB
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessagePartContent>,
}

impl MessagePart {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            mime_type: MIME_TEXT_PLAIN.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePartContent {
    pub id: String,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// Push notification settings attached to an outgoing message.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNotification {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound: Option<String>,
}

/// Body of a `Message.create` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageCreate {
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification: Option<MessageNotification>,
}
