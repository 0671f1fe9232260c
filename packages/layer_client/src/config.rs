use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Client configuration shared by the socket connection and the session
/// providers.
///
/// Every field has a serde default, so a config file only needs to name the
/// values it changes (usually just `app_id`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Application UUID or `layer:///apps/...` identifier
    #[serde(default)]
    pub app_id: String,
    /// Base URL of the REST API (nonce and session endpoints)
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Duplex endpoint; the session token is appended as a query parameter
    #[serde(default = "default_websocket_url")]
    pub websocket_url: String,
    /// Wire protocol version sent as `Sec-WebSocket-Protocol`
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    /// Extra headers applied to every dial
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Deadline for socket calls that do not pass their own
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Pause before the receive loop re-dials after a read error
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Upper bound on the identity token factory
    #[serde(default = "default_token_timeout_secs")]
    pub token_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            api_url: default_api_url(),
            websocket_url: default_websocket_url(),
            protocol: default_protocol(),
            origin: default_origin(),
            headers: BTreeMap::new(),
            user_agent: default_user_agent(),
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            token_timeout_secs: default_token_timeout_secs(),
        }
    }
}

impl ClientConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Default::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs)
    }
}

fn default_api_url() -> String {
    "https://api.layer.com".to_string()
}

fn default_websocket_url() -> String {
    "wss://websockets.layer.com".to_string()
}

fn default_protocol() -> String {
    "layer-3.0".to_string()
}

fn default_origin() -> String {
    "http://local.host:80".to_string()
}

fn default_user_agent() -> String {
    concat!("layer_client/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_token_timeout_secs() -> u64 {
    10
}
