//! Frame codec.
//!
//! Every websocket text message is one envelope:
//!
//! ```text
//! {"type": "request" | "response" | "change", "body": {...}, "counter": 12}
//! ```
//!
//! Decoding is two-pass: the envelope is read with `body` left as an opaque
//! JSON value, then the body is resolved according to `type`. Response and
//! change payloads are further resolved into typed resources when the frame
//! says what they are; anything else stays a generic [`Payload::Generic`].

use layer_common::{Conversation, Identity, Message, ResourceKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ClientError;
use crate::methods::CONNECTED;

pub const TYPE_REQUEST: &str = "request";
pub const TYPE_RESPONSE: &str = "response";
pub const TYPE_CHANGE: &str = "change";

/// One message exchanged over the socket.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub body: FrameBody,
    /// Server-side sequence number, when present
    pub counter: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FrameBody {
    Request(Request),
    Response(Response),
    Change(Change),
    /// Synthetic event raised locally after each dial; never on the wire.
    Connected,
    /// A frame type this client does not interpret.
    Other { kind: String, body: Value },
}

/// Outbound call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reply to a [`Request`], carrying the same `request_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub request_id: String,
    pub method: String,
    pub object_id: Option<String>,
    pub data: Payload,
}

/// Unsolicited notification that a resource changed.
#[derive(Clone, Debug, PartialEq)]
pub struct Change {
    pub operation: String,
    pub object: ChangeObject,
    pub data: Payload,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeObject {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: String,
}

/// Resolved `data` of a response or change.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Conversation(Box<Conversation>),
    Message(Box<Message>),
    Identity(Box<Identity>),
    /// Anything without a recognizable resource type, including `null`.
    Generic(Value),
}

impl Request {
    /// A request with a fresh request id.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            method: method.into(),
            object_id: None,
            data: None,
        }
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    /// Attach `data`, failing with [`ClientError::Encoding`] when it cannot be
    /// represented as JSON.
    pub fn with_data<T: Serialize + ?Sized>(mut self, data: &T) -> Result<Self, ClientError> {
        let value =
            serde_json::to_value(data).map_err(|e| ClientError::Encoding(e.to_string()))?;
        self.data = Some(value);
        Ok(self)
    }
}

/// Request ids only need to be unique among outstanding calls; v4 UUIDs are.
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Lower-cased `{object_type}.{operation}` key for change notifications.
pub fn change_key(object_type: &str, operation: &str) -> String {
    format!("{object_type}.{operation}").to_lowercase()
}

impl Frame {
    pub fn request(request: Request) -> Self {
        Self {
            body: FrameBody::Request(request),
            counter: None,
        }
    }

    pub fn response(response: Response) -> Self {
        Self {
            body: FrameBody::Response(response),
            counter: None,
        }
    }

    pub fn change(change: Change) -> Self {
        Self {
            body: FrameBody::Change(change),
            counter: None,
        }
    }

    pub fn connected() -> Self {
        Self {
            body: FrameBody::Connected,
            counter: None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match &self.body {
            FrameBody::Response(response) => Some(response),
            _ => None,
        }
    }

    pub fn as_change(&self) -> Option<&Change> {
        match &self.body {
            FrameBody::Change(change) => Some(change),
            _ => None,
        }
    }

    /// Registry key this frame dispatches to, or `None` when nobody can be
    /// subscribed to it.
    pub fn dispatch_key(&self) -> Option<String> {
        match &self.body {
            FrameBody::Response(response) => Some(response.method.to_lowercase()),
            FrameBody::Change(change) => Some(change_key(&change.object.kind, &change.operation)),
            FrameBody::Connected => Some(CONNECTED.to_string()),
            FrameBody::Request(_) | FrameBody::Other { .. } => None,
        }
    }

    /// Serialize to the wire envelope.
    pub fn encode(&self) -> Result<String, ClientError> {
        let encoded = match &self.body {
            FrameBody::Request(request) => envelope(TYPE_REQUEST, request, self.counter),
            FrameBody::Response(response) => envelope(
                TYPE_RESPONSE,
                &WireResponseRef {
                    request_id: &response.request_id,
                    method: &response.method,
                    object_id: response.object_id.as_deref(),
                    data: &response.data,
                },
                self.counter,
            ),
            FrameBody::Change(change) => envelope(
                TYPE_CHANGE,
                &WireChangeRef {
                    operation: &change.operation,
                    object: &change.object,
                    data: &change.data,
                },
                self.counter,
            ),
            FrameBody::Other { kind, body } => envelope(kind, body, self.counter),
            FrameBody::Connected => {
                return Err(ClientError::Encoding(
                    "connected events are local and cannot be sent".into(),
                ));
            }
        };
        encoded.map_err(|e| ClientError::Encoding(e.to_string()))
    }

    /// Parse one wire envelope.
    pub fn decode(text: &str) -> Result<Self, ClientError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|source| ClientError::Decode { source })?;

        let body = match envelope.kind.to_ascii_lowercase().as_str() {
            TYPE_RESPONSE => {
                let wire: WireResponse = serde_json::from_value(envelope.body)
                    .map_err(|source| ClientError::Decode { source })?;
                FrameBody::Response(Response {
                    request_id: wire.request_id,
                    method: wire.method,
                    object_id: wire.object_id,
                    data: Payload::from_response_data(wire.data),
                })
            }
            TYPE_CHANGE => {
                let wire: WireChange = serde_json::from_value(envelope.body)
                    .map_err(|source| ClientError::Decode { source })?;
                let data = Payload::from_change_data(&wire.object.kind, wire.data);
                FrameBody::Change(Change {
                    operation: wire.operation,
                    object: wire.object,
                    data,
                })
            }
            _ => FrameBody::Other {
                kind: envelope.kind,
                body: envelope.body,
            },
        };

        Ok(Self {
            body,
            counter: envelope.counter,
        })
    }
}

impl Payload {
    /// Resolve response data by the `layer:///<collection>/` prefix of its `id`.
    pub fn from_response_data(data: Value) -> Self {
        let kind = data
            .get("id")
            .and_then(Value::as_str)
            .and_then(ResourceKind::from_layer_id);
        match kind {
            Some(kind) => Self::decode_as(kind, data),
            None => Self::Generic(data),
        }
    }

    /// Resolve change data by the notification's `object.type`.
    pub fn from_change_data(object_type: &str, data: Value) -> Self {
        match ResourceKind::from_type_name(object_type) {
            Some(kind) => Self::decode_as(kind, data),
            None => Self::Generic(data),
        }
    }

    fn decode_as(kind: ResourceKind, data: Value) -> Self {
        let decoded = match kind {
            ResourceKind::Conversation => {
                Conversation::deserialize(&data).map(|c| Self::Conversation(Box::new(c)))
            }
            ResourceKind::Message => Message::deserialize(&data).map(|m| Self::Message(Box::new(m))),
            ResourceKind::Identity => {
                Identity::deserialize(&data).map(|i| Self::Identity(Box::new(i)))
            }
        };
        decoded.unwrap_or_else(|err| {
            debug!(%kind, error = %err, "payload did not match its resource type, keeping it generic");
            Self::Generic(data)
        })
    }

    pub fn kind(&self) -> Option<ResourceKind> {
        match self {
            Self::Conversation(_) => Some(ResourceKind::Conversation),
            Self::Message(_) => Some(ResourceKind::Message),
            Self::Identity(_) => Some(ResourceKind::Identity),
            Self::Generic(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Generic(Value::Null))
    }

    pub fn into_conversation(self) -> Option<Conversation> {
        match self {
            Self::Conversation(conversation) => Some(*conversation),
            _ => None,
        }
    }

    pub fn into_message(self) -> Option<Message> {
        match self {
            Self::Message(message) => Some(*message),
            _ => None,
        }
    }

    pub fn into_identity(self) -> Option<Identity> {
        match self {
            Self::Identity(identity) => Some(*identity),
            _ => None,
        }
    }
}

impl Default for Payload {
    fn default() -> Self {
        Self::Generic(Value::Null)
    }
}

fn envelope<B: Serialize + ?Sized>(
    kind: &str,
    body: &B,
    counter: Option<u64>,
) -> serde_json::Result<String> {
    serde_json::to_string(&OutEnvelope {
        kind,
        body,
        counter,
    })
}

#[derive(Serialize)]
struct OutEnvelope<'a, B: Serialize + ?Sized> {
    #[serde(rename = "type")]
    kind: &'a str,
    body: &'a B,
    #[serde(skip_serializing_if = "Option::is_none")]
    counter: Option<u64>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    body: Value,
    #[serde(default)]
    counter: Option<u64>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    object_id: Option<String>,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct WireResponseRef<'a> {
    request_id: &'a str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    object_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Payload::is_null")]
    data: &'a Payload,
}

#[derive(Deserialize)]
struct WireChange {
    operation: String,
    object: ChangeObject,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct WireChangeRef<'a> {
    operation: &'a str,
    object: &'a ChangeObject,
    data: &'a Payload,
}
