use std::path::Path;

use layer_client::ClientConfig;
use serde::{Deserialize, Serialize};

// Three equivalent ways to configure:
//
//   layer.toml:   [client]
//                 app_id = "..."
//
//   env var:      LAYER_CLIENT__APP_ID=...   (double underscore = nesting)
//
//   CLI flag:     --app-id ...

pub const CONFIG_FILE: &str = "layer.toml";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AuthFileConfig {
    /// Pre-issued session token
    #[serde(default)]
    pub session_token: Option<String>,
}

/// Build a figment that layers: defaults → layer.toml → LAYER_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `LAYER_CLIENT__WEBSOCKET_URL=ws://...`  →  `client.websocket_url`
///   `LAYER_AUTH__SESSION_TOKEN=...`  →  `auth.session_token`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE)))
        .merge(Env::prefixed("LAYER_").split("__"))
}
