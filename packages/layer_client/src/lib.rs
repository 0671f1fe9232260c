//! Websocket client for the Layer messaging API.
//!
//! One duplex socket carries both request/response calls and server-pushed
//! change notifications. [`Connection`] owns the socket and the receive loop,
//! [`HandlerRegistry`] fans inbound frames out to subscribers, and
//! [`Connection::call`] correlates replies with outstanding requests.
//! [`Client`] layers typed operations on top.

pub mod call;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod methods;
pub mod session;

pub use client::Client;
pub use config::ClientConfig;
pub use connection::Connection;
pub use error::ClientError;
pub use frame::{Change, ChangeObject, Frame, FrameBody, Payload, Request, Response, change_key};
pub use handlers::{FrameHandler, HandlerRegistry, Subscription};
pub use session::{IdentityTokenFactory, NonceSession, SessionError, SessionProvider, StaticSession};
