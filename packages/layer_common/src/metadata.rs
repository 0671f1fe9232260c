use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form metadata attached to conversations.
///
/// The backend only accepts strings or nested metadata as values, which the
/// [`MetadataValue`] type enforces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, MetadataValue>);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Text(String),
    Nested(Metadata),
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, returning the previous value if there was one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Option<MetadataValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Top-level string values only; nested metadata is skipped.
    pub fn to_flat_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .filter_map(|(key, value)| match value {
                MetadataValue::Text(text) => Some((key.clone(), text.clone())),
                MetadataValue::Nested(_) => None,
            })
            .collect()
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<Metadata> for MetadataValue {
    fn from(value: Metadata) -> Self {
        Self::Nested(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_metadata_serializes_as_plain_objects() {
        let mut inner = Metadata::new();
        inner.set("color", "blue");
        let mut outer = Metadata::new();
        outer.set("title", "Lunch");
        outer.set("style", inner);

        let json = serde_json::to_value(&outer).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"style": {"color": "blue"}, "title": "Lunch"})
        );

        let back: Metadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, outer);
    }

    #[test]
    fn flat_map_skips_nested_values() {
        let mut outer = Metadata::new();
        outer.set("title", "Lunch");
        outer.set("style", Metadata::new());
        let flat = outer.to_flat_map();
        assert_eq!(flat.len(), 1);
        assert_eq!(flat["title"], "Lunch");
    }

    #[test]
    fn non_string_values_are_rejected() {
        let err = serde_json::from_value::<Metadata>(serde_json::json!({"count": 3}));
        assert!(err.is_err());
    }
}
