//! Turn-cached frame state.
//!
//! A root frame's record is loaded at most once per turn into a
//! [`FrameState`]: the live JSON object, the SHA-256 digest of what was last
//! persisted, and whether bot logic touched it. Slots reach their storage
//! through a [`StateHandle`], which is the root state plus a path of host slot
//! names for nested frames:
//!
//! ```text
//! { "profile": { "value": { "name": { "value": "Ada", ... } }, ... } }
//!    └─ path ["profile"] resolves to the inner object
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Persisted shape of one slot inside its frame's object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StoredValue {
    pub value: Value,
    /// Previous values, newest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    pub last_access: DateTime<Utc>,
}

impl StoredValue {
    pub fn new(value: Value, now: DateTime<Utc>) -> Self {
        Self {
            value,
            history: Vec::new(),
            last_access: now,
        }
    }
}

/// A value a slot held before it was overwritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct HistoryEntry {
    pub value: Value,
    /// When the value was replaced.
    pub timestamp: DateTime<Utc>,
}

/// SHA-256 of the canonical JSON encoding of `state`.
pub(crate) fn content_hash(state: &Map<String, Value>) -> Vec<u8> {
    // Serializing a string-keyed JSON map cannot fail.
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    digest(&SHA256, &bytes).as_ref().to_vec()
}

/// SHA-256 of the JSON encoding of any serializable value.
pub(crate) fn json_digest<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let bytes = serde_json::to_vec(value)?;
    Ok(digest(&SHA256, &bytes).as_ref().to_vec())
}

#[derive(Debug)]
struct CachedState {
    state: Map<String, Value>,
    hash: Vec<u8>,
    accessed: bool,
}

/// One root frame's record as cached for the current turn.
#[derive(Debug)]
pub struct FrameState {
    key: String,
    inner: Mutex<CachedState>,
}

impl FrameState {
    /// Cache `state` as read from storage under `key`.
    pub(crate) fn new(key: String, state: Map<String, Value>) -> Self {
        let hash = content_hash(&state);
        Self {
            key,
            inner: Mutex::new(CachedState {
                state,
                hash,
                accessed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CachedState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Storage key the state was loaded from.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn accessed(&self) -> bool {
        self.lock().accessed
    }

    pub(crate) fn mark_accessed(&self) {
        self.lock().accessed = true;
    }

    /// Deep copy of the current object.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().state.clone()
    }

    /// The state and its digest, if it differs from what was last persisted.
    pub(crate) fn pending_write(&self) -> Option<(Map<String, Value>, Vec<u8>)> {
        let inner = self.lock();
        let hash = content_hash(&inner.state);
        (hash != inner.hash).then(|| (inner.state.clone(), hash))
    }

    /// Record `hash` as persisted. Call only after the write succeeded.
    pub(crate) fn commit(&self, hash: Vec<u8>) {
        self.lock().hash = hash;
    }

    /// Replace the state with an already persisted `state`.
    pub(crate) fn reset(&self, state: Map<String, Value>) {
        let mut inner = self.lock();
        inner.hash = content_hash(&state);
        inner.state = state;
        inner.accessed = true;
    }
}

/// Address of one frame's object inside a cached root state.
#[derive(Debug, Clone)]
pub struct StateHandle {
    root: Arc<FrameState>,
    path: Vec<String>,
}

impl StateHandle {
    pub(crate) fn root(root: Arc<FrameState>) -> Self {
        Self {
            root,
            path: Vec::new(),
        }
    }

    /// Handle for the frame hosted by slot `host` of this frame.
    pub(crate) fn child(&self, host: &str) -> Self {
        let mut path = self.path.clone();
        path.push(host.to_string());
        Self {
            root: self.root.clone(),
            path,
        }
    }

    /// Host slot names from the root frame down to this frame.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn frame_state(&self) -> &Arc<FrameState> {
        &self.root
    }

    /// Run `f` against this frame's object while holding the state lock.
    ///
    /// `f` must not await; the lock is a plain mutex.
    pub(crate) fn with_object<R>(
        &self,
        f: impl FnOnce(&mut Map<String, Value>) -> Result<R>,
    ) -> Result<R> {
        let mut inner = self.root.lock();
        let mut node = &mut inner.state;
        for segment in &self.path {
            node = node
                .get_mut(segment)
                .and_then(|slot| slot.get_mut("value"))
                .and_then(Value::as_object_mut)
                .ok_or_else(|| EngineError::DetachedState {
                    path: self.path.join("/"),
                })?;
        }
        f(node)
    }

    /// Deep copy of this frame's object.
    pub fn snapshot(&self) -> Result<Map<String, Value>> {
        self.with_object(|object| Ok(object.clone()))
    }
}
