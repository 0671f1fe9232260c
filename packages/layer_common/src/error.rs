use serde::{Deserialize, Serialize};

/// Error body returned by the backend when it rejects a request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RequestError {
    /// HTTP status the error arrived with, when it came over HTTP
    #[serde(skip)]
    pub status: Option<u16>,
    pub code: i64,
    #[serde(default)]
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}
