use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::BasicIdentity;
use crate::message::Message;
use crate::metadata::Metadata;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// `layer:///conversations/...` identifier
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub messages_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<Box<Message>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<BasicIdentity>,
    /// Whether this is the distinct conversation for its participant list
    #[serde(default)]
    pub distinct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread_message_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Body of a `Conversation.create` request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationCreate {
    pub participants: Vec<String>,
    pub distinct: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}
