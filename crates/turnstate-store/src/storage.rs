//! The storage contract consumed by the state engine.
//!
//! A backend stores opaque JSON records by string key. Each record may carry
//! an `eTag`; a write whose tag is neither absent nor [`WILDCARD_ETAG`] must
//! match the tag currently stored, otherwise the backend reports
//! [`StoreError::Conflict`]. The engine itself always writes the wildcard, so
//! the last save of a turn wins.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// eTag value that disables the optimistic-concurrency check.
pub const WILDCARD_ETAG: &str = "*";

/// A single stored record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreItem {
    /// Concurrency token assigned by the backend on every write.
    #[serde(rename = "eTag", default, skip_serializing_if = "Option::is_none")]
    pub e_tag: Option<String>,

    /// The record body.
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl StoreItem {
    /// Create an item from a JSON object with no eTag.
    pub fn new(data: Map<String, Value>) -> Self {
        Self { e_tag: None, data }
    }

    /// Create an item that overwrites unconditionally.
    pub fn unconditional(data: Map<String, Value>) -> Self {
        Self {
            e_tag: Some(WILDCARD_ETAG.to_string()),
            data,
        }
    }

    /// Build an item from any serializable value that encodes to a JSON object.
    pub fn from_value<T: Serialize>(value: &T) -> StoreResult<Self> {
        match serde_json::to_value(value)? {
            Value::Object(data) => Ok(Self::new(data)),
            other => Err(StoreError::InvalidArgument(format!(
                "store items must be JSON objects, got {other}"
            ))),
        }
    }

    /// Decode the record body into a typed value.
    pub fn to_value<T: serde::de::DeserializeOwned>(&self) -> StoreResult<T> {
        Ok(serde_json::from_value(Value::Object(self.data.clone()))?)
    }

    /// Set the eTag, returning `self` for chaining.
    pub fn with_e_tag(mut self, e_tag: impl Into<String>) -> Self {
        self.e_tag = Some(e_tag.into());
        self
    }
}

/// Records keyed by storage key.
pub type StoreItems = HashMap<String, StoreItem>;

/// Batch key/value storage with optimistic concurrency.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read the records for `keys`. Keys with no record are absent from the
    /// returned map.
    async fn read(&self, keys: &[String]) -> StoreResult<StoreItems>;

    /// Write every record in `changes`.
    async fn write(&self, changes: StoreItems) -> StoreResult<()>;

    /// Remove the records for `keys`. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> StoreResult<()>;
}

/// Validate an incoming eTag against the tag currently stored for `key`.
pub(crate) fn check_e_tag(key: &str, incoming: Option<&str>, current: Option<&str>) -> StoreResult<()> {
    match (incoming, current) {
        (Some(expected), Some(found)) if expected != WILDCARD_ETAG && expected != found => {
            Err(StoreError::Conflict {
                key: key.to_string(),
                expected: expected.to_string(),
                found: found.to_string(),
            })
        }
        _ => Ok(()),
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_item_serializes_etag_beside_data() {
        let item = StoreItem::from_value(&json!({ "count": 3 }))
            .unwrap()
            .with_e_tag("*");
        let encoded = serde_json::to_value(&item).unwrap();
        assert_eq!(encoded, json!({ "eTag": "*", "count": 3 }));

        let decoded: StoreItem = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn store_item_without_etag_omits_field() {
        let item = StoreItem::from_value(&json!({ "a": 1 })).unwrap();
        let encoded = serde_json::to_string(&item).unwrap();
        assert!(!encoded.contains("eTag"));
    }

    #[test]
    fn store_item_rejects_non_objects() {
        let err = StoreItem::from_value(&json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn e_tag_rules() {
        assert!(check_e_tag("k", None, Some("3")).is_ok());
        assert!(check_e_tag("k", Some("*"), Some("3")).is_ok());
        assert!(check_e_tag("k", Some("3"), Some("3")).is_ok());
        assert!(check_e_tag("k", Some("2"), None).is_ok());

        let err = check_e_tag("k", Some("2"), Some("3")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { ref key, .. } if key == "k"));
    }
}
