//! The single duplex socket shared by every caller.
//!
//! The connection dials lazily on first use, serializes writes, and runs at
//! most one receive loop that decodes inbound frames and dispatches them
//! through the [`HandlerRegistry`]. A read failure triggers one re-dial after
//! a short pause; only a failed re-dial ends the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as DialRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, StatusCode, header};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::frame::Frame;
use crate::handlers::HandlerRegistry;
use crate::session::SessionProvider;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

pub struct Connection {
    config: ClientConfig,
    session: Arc<dyn SessionProvider>,
    handlers: HandlerRegistry,
    writer: Mutex<Option<WsWriter>>,
    reader: Mutex<Option<WsReader>>,
    /// Serializes dials so concurrent callers share one handshake
    dial_lock: Mutex<()>,
    connected: AtomicBool,
    listening: AtomicBool,
    closed: AtomicBool,
    dials: AtomicU64,
    shutdown: Notify,
    /// Wakes the receive loop after a failed write
    write_failed: Notify,
}

/// State owned by a running receive loop.
///
/// Dropping it clears the listening flag. If the loop is dropped while it
/// still holds a live read half (an aborted task, a lost `select!`), nothing
/// can read that socket any more, so the connection is marked disconnected
/// and the next `connect()` dials again.
struct ReceiveLoop<'a> {
    conn: &'a Connection,
    reader: Option<WsReader>,
}

impl Drop for ReceiveLoop<'_> {
    fn drop(&mut self) {
        self.conn.listening.store(false, Ordering::Release);
        if self.reader.take().is_none() || self.conn.closed.load(Ordering::Acquire) {
            return;
        }

        // holding the dial lock means no dial can swap in a fresh writer here
        let dial = self.conn.dial_lock.try_lock();
        self.conn.connected.store(false, Ordering::Release);
        if dial.is_ok() {
            if let Ok(mut writer) = self.conn.writer.try_lock() {
                writer.take();
            }
        }
        warn!("receive loop dropped with a live socket, next use re-dials");
    }
}

enum ReadOutcome {
    Frame(String),
    Skip,
    Failed(String),
    /// A write on this socket failed; a newer read half may be waiting.
    Stale,
    Shutdown,
}

impl Connection {
    pub fn new(config: ClientConfig, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            config,
            session,
            handlers: HandlerRegistry::new(),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            dial_lock: Mutex::new(()),
            connected: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            dials: AtomicU64::new(0),
            shutdown: Notify::new(),
            write_failed: Notify::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Number of dial attempts made so far.
    pub fn dial_count(&self) -> u64 {
        self.dials.load(Ordering::Relaxed)
    }

    /// Dial if not already connected, then announce the connection with a
    /// synthetic `connected` frame.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            return Ok(());
        }

        let dial_guard = self.dial_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let (writer, reader) = self.dial().await?;
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        self.closed.store(false, Ordering::Release);
        self.connected.store(true, Ordering::Release);
        drop(dial_guard);

        self.handlers.dispatch(Arc::new(Frame::connected())).await;
        Ok(())
    }

    async fn dial(&self) -> Result<(WsWriter, WsReader), ClientError> {
        let token = self.session.token().await?;
        let request = self.dial_request(&token)?;

        self.dials.fetch_add(1, Ordering::Relaxed);
        debug!(url = %self.config.websocket_url, "dialing websocket");
        match tokio_tungstenite::connect_async(request).await {
            Ok((stream, response)) => {
                info!(
                    url = %self.config.websocket_url,
                    status = %response.status(),
                    "websocket connected"
                );
                Ok(stream.split())
            }
            Err(e) => {
                if let tungstenite::Error::Http(response) = &e {
                    if matches!(
                        response.status(),
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                    ) {
                        warn!(status = %response.status(), "session token rejected, invalidating");
                        self.session.invalidate().await;
                    }
                }
                Err(ClientError::from_tungstenite(e))
            }
        }
    }

    fn dial_request(&self, token: &str) -> Result<DialRequest, ClientError> {
        let mut url = Url::parse(&self.config.websocket_url)
            .map_err(|e| ClientError::Connection(format!("invalid websocket url: {e}")))?;
        url.query_pairs_mut().append_pair("session_token", token);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(ClientError::from_tungstenite)?;
        let headers = request.headers_mut();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            header_value(&self.config.protocol)?,
        );
        headers.insert(header::ORIGIN, header_value(&self.config.origin)?);
        for (name, value) in &self.config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::Connection(format!("invalid header {name}: {e}")))?;
            headers.insert(name, header_value(value)?);
        }
        Ok(request)
    }

    /// Write one frame, dialing first if needed. Writes are never retried.
    pub async fn send(&self, frame: &Frame) -> Result<(), ClientError> {
        let text = frame.encode()?;
        self.connect().await?;

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        if let Err(e) = sink.send(Message::Text(text.into())).await {
            warn!(error = %e, "websocket write failed");
            *writer = None;
            self.connected.store(false, Ordering::Release);
            if self.is_listening() {
                self.write_failed.notify_one();
            } else {
                self.reader.lock().await.take();
            }
            return Err(ClientError::Write(e.to_string()));
        }
        Ok(())
    }

    /// Run the receive loop until the connection is closed or a re-dial
    /// fails. A second concurrent call returns immediately.
    pub async fn listen(&self) -> Result<(), ClientError> {
        if self.listening.swap(true, Ordering::AcqRel) {
            debug!("receive loop already running");
            return Ok(());
        }
        let mut receiver = ReceiveLoop {
            conn: self,
            reader: None,
        };

        self.connect().await?;
        receiver.reader = self.reader.lock().await.take();
        if receiver.reader.is_none() {
            if self.closed.load(Ordering::Acquire) {
                return Ok(());
            }
            return Err(ClientError::NotConnected);
        }
        info!("receive loop started");

        loop {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let Some(reader) = receiver.reader.as_mut() else {
                break;
            };

            match self.read_next(reader).await {
                ReadOutcome::Frame(text) => self.handle_text(&text).await,
                ReadOutcome::Skip => {}
                ReadOutcome::Shutdown => break,
                ReadOutcome::Stale => {
                    receiver.reader = None;
                    let fresh = self.reader.lock().await.take();
                    receiver.reader = match fresh {
                        Some(next) => {
                            debug!("write failed, switched to the re-dialed socket");
                            Some(next)
                        }
                        None => match self.recover("write failed").await? {
                            Some(next) => Some(next),
                            None => break,
                        },
                    };
                }
                ReadOutcome::Failed(reason) => {
                    receiver.reader = None;
                    match self.recover(&reason).await? {
                        Some(next) => receiver.reader = Some(next),
                        None => break,
                    }
                }
            }
        }

        info!("receive loop stopped");
        Ok(())
    }

    async fn read_next(&self, reader: &mut WsReader) -> ReadOutcome {
        let message = tokio::select! {
            message = reader.next() => message,
            _ = self.shutdown.notified() => return ReadOutcome::Shutdown,
            _ = self.write_failed.notified() => return ReadOutcome::Stale,
        };

        match message {
            Some(Ok(Message::Text(text))) => ReadOutcome::Frame(text.as_str().to_owned()),
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => ReadOutcome::Frame(text),
                Err(_) => {
                    warn!(len = bytes.len(), "skipping non-utf8 binary frame");
                    ReadOutcome::Skip
                }
            },
            Some(Ok(Message::Close(close))) => {
                let reason = close.map_or_else(
                    || "closed by server".to_string(),
                    |frame| {
                        format!(
                            "closed by server: {} {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        )
                    },
                );
                ReadOutcome::Failed(reason)
            }
            Some(Ok(_)) => ReadOutcome::Skip,
            Some(Err(e)) => ReadOutcome::Failed(e.to_string()),
            None => ReadOutcome::Failed("stream ended".to_string()),
        }
    }

    async fn handle_text(&self, text: &str) {
        match Frame::decode(text) {
            Ok(frame) => {
                self.handlers.dispatch(Arc::new(frame)).await;
            }
            Err(e) => warn!(error = %e, "skipping undecodable frame"),
        }
    }

    /// Pause, re-dial once, and hand back the new read half. `Ok(None)` means
    /// the connection was closed on purpose and the loop should stop.
    async fn recover(&self, reason: &str) -> Result<Option<WsReader>, ClientError> {
        self.connected.store(false, Ordering::Release);
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        let delay = self.config.reconnect_delay();
        warn!(reason, delay_ms = delay.as_millis() as u64, "websocket read failed, reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.notified() => return Ok(None),
        }
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }

        if let Err(e) = self.connect().await {
            error!(error = %e, "reconnect failed, receive loop exiting");
            return Err(e);
        }
        match self.reader.lock().await.take() {
            Some(reader) => Ok(Some(reader)),
            None => Err(ClientError::NotConnected),
        }
    }

    /// Run [`Connection::listen`] on its own task.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<Result<(), ClientError>> {
        let connection = self.clone();
        tokio::spawn(async move { connection.listen().await })
    }

    /// Send a close message and drop both halves. The receive loop stops;
    /// the next send dials again.
    pub async fn close(&self) {
        let _dial = self.dial_lock.lock().await;
        self.closed.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        self.shutdown.notify_waiters();

        let writer = self.writer.lock().await.take();
        self.reader.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.send(Message::Close(None)).await {
                debug!(error = %e, "close message not delivered");
            }
        }
        info!("websocket closed");
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value)
        .map_err(|e| ClientError::Connection(format!("invalid header value {value:?}: {e}")))
}
