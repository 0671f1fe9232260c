use std::sync::Arc;
use std::time::Duration;

use layer_common::{
    Conversation, ConversationCreate, Message, MessageCreate, MessageNotification, MessagePart,
    Metadata, RequestError, ResourceKind, layer_id,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::task::JoinHandle;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::ClientError;
use crate::frame::{Payload, Request, Response, change_key};
use crate::handlers::{FrameHandler, HandlerRegistry, Subscription};
use crate::methods;
use crate::session::SessionProvider;

/// Typed operations over one socket connection.
///
/// Cloning is cheap; clones share the connection and its handlers.
#[derive(Clone)]
pub struct Client {
    connection: Arc<Connection>,
}

impl Client {
    pub fn new(config: ClientConfig, session: impl SessionProvider + 'static) -> Self {
        Self::with_session(config, Arc::new(session))
    }

    pub fn with_session(config: ClientConfig, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            connection: Arc::new(Connection::new(config, session)),
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        self.connection.handlers()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_listening(&self) -> bool {
        self.connection.is_listening()
    }

    pub async fn connect(&self) -> Result<(), ClientError> {
        self.connection.connect().await
    }

    pub async fn listen(&self) -> Result<(), ClientError> {
        self.connection.listen().await
    }

    pub fn spawn_listener(&self) -> JoinHandle<Result<(), ClientError>> {
        self.connection.spawn_listener()
    }

    pub async fn close(&self) {
        self.connection.close().await
    }

    /// Issue a raw request with the configured timeout.
    pub async fn call(&self, request: Request) -> Result<Response, ClientError> {
        self.connection.call(request, None).await
    }

    pub async fn call_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        self.connection.call(request, Some(timeout)).await
    }

    /// `Conversation.create`
    pub async fn create_conversation(
        &self,
        participants: Vec<String>,
        distinct: bool,
        metadata: Option<Metadata>,
    ) -> Result<Conversation, ClientError> {
        let body = ConversationCreate {
            participants,
            distinct,
            metadata,
        };
        let request = Request::new(methods::CONVERSATION_CREATE).with_data(&body)?;
        let response = self.call(request).await?;
        expect_resource(response, ResourceKind::Conversation, Payload::into_conversation)
    }

    /// `Message.create` in the given conversation. Bare UUIDs are expanded
    /// to `layer:///conversations/<uuid>`.
    pub async fn send_message(
        &self,
        conversation_id: &str,
        parts: Vec<MessagePart>,
        notification: Option<MessageNotification>,
    ) -> Result<Message, ClientError> {
        let body = MessageCreate {
            parts,
            notification,
        };
        let request = Request::new(methods::MESSAGE_CREATE)
            .with_object_id(layer_id(
                ResourceKind::Conversation.collection(),
                conversation_id,
            ))
            .with_data(&body)?;
        let response = self.call(request).await?;
        expect_resource(response, ResourceKind::Message, Payload::into_message)
    }

    /// Send a single `text/plain` part.
    pub async fn send_text_message(
        &self,
        conversation_id: &str,
        text: impl Into<String>,
    ) -> Result<Message, ClientError> {
        self.send_message(conversation_id, vec![MessagePart::text(text)], None)
            .await
    }

    /// `Counter.read`
    pub async fn read_counter(&self) -> Result<Payload, ClientError> {
        let response = self.call(Request::new(methods::COUNTER_READ)).await?;
        generic(response)
    }

    /// `Presence.update`
    pub async fn update_presence(&self, status: &str) -> Result<Payload, ClientError> {
        let request =
            Request::new(methods::PRESENCE_UPDATE).with_data(&json!({ "status": status }))?;
        generic(self.call(request).await?)
    }

    /// `Presence.sync`
    pub async fn sync_presence(&self, identity_ids: &[String]) -> Result<Payload, ClientError> {
        let request = Request::new(methods::PRESENCE_SYNC).with_data(&json!({ "ids": identity_ids }))?;
        generic(self.call(request).await?)
    }

    /// Register `handler` for responses to `method` or for a change key.
    pub async fn subscribe(&self, key: &str, handler: impl FrameHandler) -> Subscription {
        self.handlers().add(key, handler).await
    }

    /// Register `handler` for `object_type.operation` change notifications.
    pub async fn on_change(
        &self,
        object_type: &str,
        operation: &str,
        handler: impl FrameHandler,
    ) -> Subscription {
        self.handlers()
            .add(&change_key(object_type, operation), handler)
            .await
    }

    /// Register `handler` for the event raised after every dial.
    pub async fn on_connected(&self, handler: impl FrameHandler) -> Subscription {
        self.handlers().add(methods::CONNECTED, handler).await
    }
}

/// Server error body carried in place of a resource.
fn request_error(data: &Value) -> Option<RequestError> {
    RequestError::deserialize(data).ok()
}

fn expect_resource<T>(
    response: Response,
    expected: ResourceKind,
    extract: fn(Payload) -> Option<T>,
) -> Result<T, ClientError> {
    if let Payload::Generic(value) = &response.data {
        if let Some(err) = request_error(value) {
            return Err(ClientError::Request(err));
        }
    }
    extract(response.data).ok_or(ClientError::UnexpectedPayload {
        method: response.method,
        expected,
    })
}

fn generic(response: Response) -> Result<Payload, ClientError> {
    if let Payload::Generic(value) = &response.data {
        if let Some(err) = request_error(value) {
            return Err(ClientError::Request(err));
        }
    }
    Ok(response.data)
}
