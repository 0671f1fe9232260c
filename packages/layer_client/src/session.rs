//! Session token providers.
//!
//! The socket only needs a session token per dial. [`StaticSession`] hands out
//! a token issued elsewhere; [`NonceSession`] runs the nonce exchange against
//! the REST API with a caller-supplied identity token factory.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use layer_common::RequestError;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::ClientConfig;

/// Media type the REST API expects for the versioned JSON representation.
pub const LAYER_ACCEPT: &str = "application/vnd.layer+json; version=3.0";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("this session provider does not issue nonces")]
    NonceUnsupported,

    #[error("invalid api url: {0}")]
    InvalidUrl(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} returned unexpected status {status}")]
    Status { endpoint: &'static str, status: u16 },

    /// The API answered with an error body.
    #[error("{0}")]
    Rejected(#[from] RequestError),

    #[error("identity token factory failed: {0}")]
    Factory(String),

    #[error("identity token factory did not answer within {0:?}")]
    FactoryTimeout(Duration),

    #[error("response is missing {0}")]
    Malformed(&'static str),
}

/// Source of session tokens for the socket.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Fetch a fresh authentication nonce.
    async fn nonce(&self) -> Result<String, SessionError>;

    /// Current session token, minting one if needed.
    async fn token(&self) -> Result<String, SessionError>;

    /// Forget any cached token; called when the socket rejects it.
    async fn invalidate(&self) {}
}

/// A session token obtained out of band.
#[derive(Clone)]
pub struct StaticSession {
    token: String,
}

impl StaticSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticSession").finish_non_exhaustive()
    }
}

#[async_trait]
impl SessionProvider for StaticSession {
    async fn nonce(&self) -> Result<String, SessionError> {
        Err(SessionError::NonceUnsupported)
    }

    async fn token(&self) -> Result<String, SessionError> {
        Ok(self.token.clone())
    }
}

/// Signs `(user, nonce)` into an identity token, usually by calling the
/// application's own backend.
#[async_trait]
pub trait IdentityTokenFactory: Send + Sync {
    async fn identity_token(&self, user: &str, nonce: &str) -> Result<String, String>;
}

#[async_trait]
impl<F, Fut, E> IdentityTokenFactory for F
where
    F: Fn(String, String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, E>> + Send + 'static,
    E: Display + 'static,
{
    async fn identity_token(&self, user: &str, nonce: &str) -> Result<String, String> {
        (self)(user.to_string(), nonce.to_string())
            .await
            .map_err(|e| e.to_string())
    }
}

/// Mints session tokens through `POST /nonces` and `POST /sessions`.
///
/// The token is cached until [`SessionProvider::invalidate`] is called.
/// Concurrent callers share one exchange.
pub struct NonceSession {
    http: reqwest::Client,
    api_url: Url,
    app_id: String,
    user: String,
    factory: Arc<dyn IdentityTokenFactory>,
    token_timeout: Duration,
    cached: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct NonceBody {
    #[serde(default)]
    nonce: String,
}

#[derive(Serialize)]
struct SessionRequest<'a> {
    app_id: &'a str,
    identity_token: &'a str,
}

#[derive(Deserialize)]
struct SessionBody {
    #[serde(default)]
    session_token: String,
}

impl NonceSession {
    pub fn new(
        config: &ClientConfig,
        user: impl Into<String>,
        factory: impl IdentityTokenFactory + 'static,
    ) -> Result<Self, SessionError> {
        let api_url =
            Url::parse(&config.api_url).map_err(|e| SessionError::InvalidUrl(e.to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(LAYER_ACCEPT));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent.clone())
            .build()?;

        Ok(Self {
            http,
            api_url,
            app_id: config.app_id.clone(),
            user: user.into(),
            factory: Arc::new(factory),
            token_timeout: config.token_timeout(),
            cached: Mutex::new(None),
        })
    }

    pub fn with_token_timeout(mut self, timeout: Duration) -> Self {
        self.token_timeout = timeout;
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, SessionError> {
        self.api_url
            .join(path)
            .map_err(|e| SessionError::InvalidUrl(e.to_string()))
    }

    /// Turn a non-201 answer into the API's error body when it sent one.
    async fn rejection(endpoint: &'static str, response: reqwest::Response) -> SessionError {
        let status = response.status().as_u16();
        match response.json::<RequestError>().await {
            Ok(mut err) => {
                err.status = Some(status);
                SessionError::Rejected(err)
            }
            Err(_) => SessionError::Status { endpoint, status },
        }
    }

    async fn create_session(&self, identity_token: &str) -> Result<String, SessionError> {
        let response = self
            .http
            .post(self.endpoint("/sessions")?)
            .json(&SessionRequest {
                app_id: &self.app_id,
                identity_token,
            })
            .send()
            .await?;
        if response.status() != StatusCode::CREATED {
            return Err(Self::rejection("sessions", response).await);
        }

        let body: SessionBody = response.json().await?;
        if body.session_token.is_empty() {
            return Err(SessionError::Malformed("session_token"));
        }
        Ok(body.session_token)
    }
}

#[async_trait]
impl SessionProvider for NonceSession {
    async fn nonce(&self) -> Result<String, SessionError> {
        let response = self.http.post(self.endpoint("/nonces")?).send().await?;
        if response.status() != StatusCode::CREATED {
            return Err(Self::rejection("nonces", response).await);
        }

        let body: NonceBody = response.json().await?;
        if body.nonce.is_empty() {
            return Err(SessionError::Malformed("nonce"));
        }
        debug!("nonce issued");
        Ok(body.nonce)
    }

    async fn token(&self) -> Result<String, SessionError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let nonce = self.nonce().await?;
        let identity_token = tokio::time::timeout(
            self.token_timeout,
            self.factory.identity_token(&self.user, &nonce),
        )
        .await
        .map_err(|_| SessionError::FactoryTimeout(self.token_timeout))?
        .map_err(SessionError::Factory)?;

        let token = self.create_session(&identity_token).await?;
        info!(user = %self.user, "session token issued");
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn invalidate(&self) {
        if self.cached.lock().await.take().is_some() {
            debug!(user = %self.user, "cached session token dropped");
        }
    }
}
