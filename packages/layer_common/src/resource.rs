//! `layer:///` identifiers and the resource kinds they name.

use std::fmt;

/// Scheme prefix shared by every resource identifier.
pub const LAYER_SCHEME: &str = "layer:///";

/// Resource types the socket protocol carries as typed payloads.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum ResourceKind {
    Conversation,
    Message,
    Identity,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [Self::Conversation, Self::Message, Self::Identity];

    /// Collection segment used in identifiers, e.g. `conversations`.
    pub fn collection(self) -> &'static str {
        match self {
            Self::Conversation => "conversations",
            Self::Message => "messages",
            Self::Identity => "identities",
        }
    }

    /// Object type name used in change notifications, e.g. `Conversation`.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Conversation => "Conversation",
            Self::Message => "Message",
            Self::Identity => "Identity",
        }
    }

    /// Resolve a change notification's `object.type` (case-insensitive).
    pub fn from_type_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.type_name().eq_ignore_ascii_case(name))
    }

    /// Resolve the kind named by a `layer:///<collection>/<uuid>` identifier.
    pub fn from_layer_id(id: &str) -> Option<Self> {
        let scheme = id.get(..LAYER_SCHEME.len())?;
        if !scheme.eq_ignore_ascii_case(LAYER_SCHEME) {
            return None;
        }
        let collection = id[LAYER_SCHEME.len()..].split('/').next()?;
        Self::ALL
            .into_iter()
            .find(|kind| kind.collection().eq_ignore_ascii_case(collection))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Build a full identifier for `id` in `collection`, leaving ids that already
/// carry the prefix untouched.
pub fn layer_id(collection: &str, id: &str) -> String {
    let prefix = format!("{LAYER_SCHEME}{collection}/");
    if id.starts_with(&prefix) {
        id.to_string()
    } else {
        format!("{prefix}{id}")
    }
}

/// Strip a `layer:///` identifier down to its trailing UUID.
pub fn uuid_from_layer_url(url: &str) -> &str {
    if url.starts_with("layer") {
        url.rsplit('/').next().unwrap_or(url)
    } else {
        url
    }
}
