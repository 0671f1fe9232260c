//! Method and change names used on the socket.
//!
//! Names are matched case-insensitively; the registry lower-cases keys.

pub const COUNTER_READ: &str = "Counter.read";
pub const CONVERSATION_CREATE: &str = "Conversation.create";
pub const MESSAGE_CREATE: &str = "Message.create";
pub const PRESENCE_UPDATE: &str = "Presence.update";
pub const PRESENCE_SYNC: &str = "Presence.sync";

/// Key of the synthetic event dispatched after every successful dial.
pub const CONNECTED: &str = "connected";

/// Object types that carry change notifications.
pub const CHANGE_OBJECT_TYPES: [&str; 2] = ["Conversation", "Message"];

/// Operations a change notification can report.
pub const CHANGE_OPERATIONS: [&str; 7] = [
    "create",
    "delete",
    "participants",
    "metadata",
    "mark_all_read",
    "recipient_status",
    "last_message",
];

/// Every `Type.operation` change key, in declaration order.
pub fn change_keys() -> impl Iterator<Item = String> {
    CHANGE_OBJECT_TYPES.into_iter().flat_map(|object_type| {
        CHANGE_OPERATIONS
            .into_iter()
            .map(move |operation| format!("{object_type}.{operation}"))
    })
}
