//! In-process websocket server speaking the Layer frame envelope.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use layer_client::{Client, ClientConfig, StaticSession};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{self, HeaderMap, HeaderValue, StatusCode, header};

/// Turns one request body into the frames the server answers with.
pub type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

enum Command {
    Push(String),
    Drop,
}

#[derive(Default)]
struct State {
    connections: AtomicUsize,
    tokens: Mutex<Vec<String>>,
    headers: Mutex<Vec<HeaderMap>>,
    rejected: Mutex<HashSet<String>>,
    current: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

pub struct MockServer {
    url: String,
    state: Arc<State>,
    requests: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    pub async fn with_responder(
        responder: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::start_with(Some(Arc::new(responder))).await
    }

    /// Answers every request with a response carrying the request's data.
    pub async fn echo() -> Self {
        Self::with_responder(|request| {
            vec![response_frame(request, request["data"].clone())]
        })
        .await
    }

    async fn start_with(responder: Option<Responder>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let state = Arc::new(State::default());
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let task = {
            let state = state.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(
                        stream,
                        state.clone(),
                        responder.clone(),
                        requests_tx.clone(),
                    ));
                }
            })
        };

        Self {
            url,
            state,
            requests: tokio::sync::Mutex::new(requests_rx),
            task,
        }
    }

    pub fn url(&self) -> String {
        self.url.clone()
    }

    /// Client configuration pointed at this server with a short re-dial pause.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new("app-1");
        config.websocket_url = self.url();
        config.reconnect_delay_ms = 20;
        config
    }

    pub fn client(&self) -> Client {
        Client::new(self.config(), StaticSession::new("tok"))
    }

    /// Completed handshakes so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Session tokens presented by every handshake attempt, in order.
    pub fn tokens(&self) -> Vec<String> {
        self.state.tokens.lock().unwrap().clone()
    }

    pub fn handshake_headers(&self) -> Vec<HeaderMap> {
        self.state.headers.lock().unwrap().clone()
    }

    /// Answer handshakes presenting `token` with 401.
    pub fn reject_token(&self, token: &str) {
        self.state.rejected.lock().unwrap().insert(token.to_string());
    }

    pub async fn wait_for_connections(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.connections() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} connections, saw {}", self.connections()));
    }

    async fn command(&self, command: Command) {
        let sender = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(sender) = self.state.current.lock().unwrap().clone() {
                    return sender;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no client connected");
        sender.send(command).ok();
    }

    /// Send a frame to the most recent connection.
    pub async fn push(&self, frame: Value) {
        self.command(Command::Push(frame.to_string())).await;
    }

    pub async fn push_raw(&self, text: &str) {
        self.command(Command::Push(text.to_string())).await;
    }

    /// Drop the most recent connection without a close handshake.
    pub async fn drop_connection(&self) {
        self.command(Command::Drop).await;
        self.state.current.lock().unwrap().take();
    }

    /// Next request body the server received.
    pub async fn next_request(&self) -> Value {
        let mut requests = self.requests.lock().await;
        tokio::time::timeout(Duration::from_secs(5), requests.recv())
            .await
            .expect("no request received")
            .expect("server stopped")
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    state: Arc<State>,
    responder: Option<Responder>,
    requests: mpsc::UnboundedSender<Value>,
) {
    let handshake_state = state.clone();
    let callback = move |request: &Request, mut response: Response| {
        let token = request
            .uri()
            .query()
            .unwrap_or_default()
            .split('&')
            .find_map(|pair| pair.strip_prefix("session_token="))
            .unwrap_or_default()
            .to_string();
        handshake_state.tokens.lock().unwrap().push(token.clone());
        handshake_state
            .headers
            .lock()
            .unwrap()
            .push(request.headers().clone());

        if handshake_state.rejected.lock().unwrap().contains(&token) {
            let rejection: ErrorResponse = http::Response::builder()
                .status(StatusCode::UNAUTHORIZED)
                .body(Some("invalid session token".to_string()))
                .unwrap();
            return Err(rejection);
        }

        if let Some(protocol) = request.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
            response
                .headers_mut()
                .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol.clone());
        } else {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static("layer-3.0"),
            );
        }
        Ok(response)
    };

    let Ok(ws) = accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    *state.current.lock().unwrap() = Some(commands_tx);
    state.connections.fetch_add(1, Ordering::SeqCst);

    loop {
        tokio::select! {
            command = commands_rx.recv() => match command {
                Some(Command::Push(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Command::Drop) | None => break,
            },
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    if frame["type"] != "request" {
                        continue;
                    }
                    let body = frame["body"].clone();
                    let replies = responder.as_ref().map(|r| r(&body)).unwrap_or_default();
                    requests.send(body).ok();
                    for reply in replies {
                        if sink.send(Message::Text(reply.to_string().into())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Response envelope answering `request` with `data`.
pub fn response_frame(request: &Value, data: Value) -> Value {
    json!({
        "type": "response",
        "body": {
            "request_id": request["request_id"],
            "method": request["method"],
            "data": data,
        }
    })
}

/// Change envelope for `object_type.operation`.
pub fn change_frame(object_type: &str, operation: &str, id: &str, data: Value) -> Value {
    json!({
        "type": "change",
        "counter": 1,
        "body": {
            "operation": operation,
            "object": {"type": object_type, "id": id, "url": ""},
            "data": data,
        }
    })
}
