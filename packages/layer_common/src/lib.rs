//! Resource types and identifier helpers shared by the Layer clients.

pub mod conversation;
pub mod error;
pub mod identity;
pub mod message;
pub mod metadata;
pub mod resource;

pub use conversation::{Conversation, ConversationCreate};
pub use error::RequestError;
pub use identity::{BasicIdentity, Identity};
pub use message::{Message, MessageCreate, MessageNotification, MessagePart, MessagePartContent};
pub use metadata::{Metadata, MetadataValue};
pub use resource::{ResourceKind, layer_id, uuid_from_layer_url};
