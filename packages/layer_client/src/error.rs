use layer_common::{RequestError, ResourceKind};
use tokio_tungstenite::tungstenite;

use crate::session::SessionError;

/// Errors surfaced by the socket client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The session provider could not produce a token.
    #[error("authentication failed: {0}")]
    Authentication(#[from] SessionError),

    /// The websocket dial or handshake failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A frame could not be handed to the transport.
    #[error("failed to write frame: {0}")]
    Write(String),

    /// An outbound payload could not be serialized.
    #[error("failed to encode frame: {0}")]
    Encoding(String),

    /// An inbound frame could not be parsed.
    #[error("failed to decode frame: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
    },

    /// No matching response arrived before the call deadline.
    #[error("operation timed out")]
    TimedOut,

    /// The response arrived but carried the wrong kind of resource.
    #[error("expected a {expected} in the {method} response")]
    UnexpectedPayload {
        method: String,
        expected: ResourceKind,
    },

    #[error("websocket is not connected")]
    NotConnected,

    /// The backend rejected a request with an error body.
    #[error("request rejected: {0}")]
    Request(#[from] RequestError),
}

impl ClientError {
    /// Map a tungstenite dial failure. HTTP rejections keep their status so
    /// callers can tell a stale token from an unreachable host.
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Http(response) => Self::Connection(format!(
                "handshake rejected with status {}",
                response.status()
            )),
            _ => Self::Connection(err.to_string()),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Write(_) | Self::TimedOut | Self::NotConnected
        )
    }
}
