//! Typed slots.
//!
//! A [`Slot`] is a named, typed value inside a frame. Reads and writes go
//! through the frame's turn cache; nothing touches storage until the frame is
//! saved. Values are stored as JSON, so every read hands back a fresh copy and
//! callers can never alias cached state.
//!
//! Per-slot behavior is configured by a [`SlotDefinition`]:
//!
//! - `default_value` is returned by `get` while nothing is stored, but is
//!   never written into state and does not count for `has`.
//! - `expire_after_seconds` drops the value once it has gone unread for longer
//!   than the TTL.
//! - `history` keeps previous values, newest first, bounded by count and age.
//! - `change_tags` make `set` notify the frame's change listeners.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::context::TurnContext;
use crate::error::{EngineError, Result};
use crate::frame::{Frame, SlotBinding};
use crate::state::{HistoryEntry, StoredValue};

/// Retention policy for a slot's previous values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPolicy {
    /// Maximum number of previous values kept. `0` disables history.
    pub max_count: usize,
    /// Drop previous values older than this many seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<u64>,
}

impl HistoryPolicy {
    pub fn max_count(max_count: usize) -> Self {
        Self {
            max_count,
            expire_after_seconds: None,
        }
    }

    pub fn expire_after_seconds(mut self, seconds: u64) -> Self {
        self.expire_after_seconds = Some(seconds);
        self
    }

    fn prune(&self, history: &mut Vec<HistoryEntry>, now: DateTime<Utc>) {
        history.truncate(self.max_count);
        if let Some(seconds) = self.expire_after_seconds {
            let ttl = seconds_to_duration(seconds);
            history.retain(|entry| {
                entry
                    .timestamp
                    .checked_add_signed(ttl)
                    .is_none_or(|deadline| now < deadline)
            });
        }
    }
}

/// Static configuration of a slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotDefinition {
    /// Unique within the owning frame.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    /// TTL of the current value, measured from its last access.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_after_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub change_tags: Vec<String>,
}

impl SlotDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Use `value` (serialized to JSON) as the default.
    pub fn with_default<T: Serialize>(self, value: &T) -> Result<Self> {
        Ok(self.with_default_value(serde_json::to_value(value)?))
    }

    pub fn with_default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn expire_after_seconds(mut self, seconds: u64) -> Self {
        self.expire_after_seconds = Some(seconds);
        self
    }

    pub fn with_history(mut self, policy: HistoryPolicy) -> Self {
        self.history = Some(policy);
        self
    }

    pub fn with_change_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.change_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    fn is_expired(&self, stored: &StoredValue, now: DateTime<Utc>) -> bool {
        self.expire_after_seconds.is_some_and(|seconds| {
            stored
                .last_access
                .checked_add_signed(seconds_to_duration(seconds))
                .is_some_and(|deadline| now > deadline)
        })
    }
}

pub(crate) fn seconds_to_duration(seconds: u64) -> Duration {
    i64::try_from(seconds)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// A previous value of a slot and when it was replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotHistoryValue<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
}

/// Typed handle to a slot registered with a frame.
pub struct Slot<T> {
    frame: Arc<dyn Frame>,
    definition: Arc<SlotDefinition>,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for Slot<T> {
    fn clone(&self) -> Self {
        Self {
            frame: self.frame.clone(),
            definition: self.definition.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slot")
            .field("frame", &self.frame.name())
            .field("name", &self.definition.name)
            .finish()
    }
}

impl<T> Slot<T> {
    /// Create a slot and register it with `frame`.
    pub fn new(frame: Arc<dyn Frame>, definition: SlotDefinition) -> Result<Self> {
        let slot = Self::bind(frame, Arc::new(definition));
        slot.frame.add_slot(&slot.binding())?;
        Ok(slot)
    }

    /// A slot with no default, TTL, history or tags.
    pub fn named(frame: Arc<dyn Frame>, name: impl Into<String>) -> Result<Self> {
        Self::new(frame, SlotDefinition::new(name))
    }

    /// Handle to an already registered definition. Does not register.
    pub(crate) fn bind(frame: Arc<dyn Frame>, definition: Arc<SlotDefinition>) -> Self {
        Self {
            frame,
            definition,
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &SlotDefinition {
        &self.definition
    }

    pub fn frame(&self) -> &Arc<dyn Frame> {
        &self.frame
    }

    pub fn binding(&self) -> SlotBinding {
        SlotBinding::new(self.frame.id(), self.definition.clone())
    }

    /// The same slot viewed as a different type.
    pub fn retype<U>(&self) -> Slot<U> {
        Slot::bind(self.frame.clone(), self.definition.clone())
    }

    /// A handle exposing only the read operations.
    pub fn as_read_only(&self) -> ReadOnlySlot<T> {
        ReadOnlySlot {
            slot: self.clone(),
        }
    }

    /// Load the stored value, applying expiration and refreshing access time.
    pub(crate) async fn load_stored(
        &self,
        ctx: &TurnContext,
        accessed: bool,
    ) -> Result<Option<StoredValue>> {
        let handle = self.frame.load(ctx, accessed).await?;
        let now = ctx.now();
        let def = &self.definition;
        handle.with_object(|state| {
            let Some(raw) = state.get(&def.name) else {
                return Ok(None);
            };
            let mut stored: StoredValue = serde_json::from_value(raw.clone())?;
            if def.is_expired(&stored, now) {
                debug!(slot = %def.name, "slot value expired");
                state.remove(&def.name);
                return Ok(None);
            }
            stored.last_access = now;
            if let Some(policy) = &def.history {
                policy.prune(&mut stored.history, now);
            }
            state.insert(def.name.clone(), serde_json::to_value(&stored)?);
            Ok(Some(stored))
        })
    }

    /// Store `value` as the raw JSON current value.
    pub(crate) async fn store_json(&self, ctx: &TurnContext, value: Value) -> Result<()> {
        let handle = self.frame.load(ctx, true).await?;
        let now = ctx.now();
        let def = &self.definition;
        handle.with_object(|state| {
            let previous = match state.get(&def.name) {
                Some(raw) => Some(serde_json::from_value::<StoredValue>(raw.clone())?),
                None => None,
            };
            let stored = match previous {
                Some(mut stored) if !def.is_expired(&stored, now) => {
                    let old = std::mem::replace(&mut stored.value, value.clone());
                    if let Some(policy) = def.history.filter(|policy| policy.max_count > 0) {
                        stored.history.insert(
                            0,
                            HistoryEntry {
                                value: old,
                                timestamp: now,
                            },
                        );
                        policy.prune(&mut stored.history, now);
                    }
                    stored.last_access = now;
                    stored
                }
                _ => StoredValue::new(value.clone(), now),
            };
            state.insert(def.name.clone(), serde_json::to_value(&stored)?);
            Ok(())
        })?;

        if !def.change_tags.is_empty() {
            if let Err(err) = self
                .frame
                .slot_value_changed(ctx, &def.change_tags, &value)
                .await
            {
                warn!(slot = %def.name, %err, "change listener failed; value stays applied");
                return Err(EngineError::ChangeNotification {
                    slot: def.name.clone(),
                    source: Box::new(err),
                });
            }
        }
        Ok(())
    }
}

impl<T> Slot<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    /// Current value, else a copy of the default, else `None`.
    pub async fn get(&self, ctx: &TurnContext) -> Result<Option<T>> {
        match self.load_stored(ctx, true).await? {
            Some(stored) => Ok(Some(serde_json::from_value(stored.value)?)),
            None => match &self.definition.default_value {
                Some(default) => Ok(Some(serde_json::from_value(default.clone())?)),
                None => Ok(None),
            },
        }
    }

    /// Whether a non-expired value is stored. Defaults don't count.
    pub async fn has(&self, ctx: &TurnContext) -> Result<bool> {
        Ok(self.load_stored(ctx, true).await?.is_some())
    }

    /// Previous values, newest first. Empty without a history policy.
    pub async fn history(&self, ctx: &TurnContext) -> Result<Vec<SlotHistoryValue<T>>> {
        let stored = self.load_stored(ctx, true).await?;
        if self.definition.history.is_none() {
            return Ok(Vec::new());
        }
        stored
            .map(|stored| stored.history)
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                Ok(SlotHistoryValue {
                    value: serde_json::from_value(entry.value)?,
                    timestamp: entry.timestamp,
                })
            })
            .collect()
    }

    /// Replace the value, pushing the old one into history when enabled.
    ///
    /// If a change listener fails, the value stays applied and the error is
    /// returned as [`EngineError::ChangeNotification`].
    pub async fn set(&self, ctx: &TurnContext, value: T) -> Result<()> {
        let json = serde_json::to_value(&value)?;
        drop(value);
        self.store_json(ctx, json).await
    }

    /// Remove the value and its history; later reads see the default.
    pub async fn delete(&self, ctx: &TurnContext) -> Result<()> {
        let handle = self.frame.load(ctx, true).await?;
        handle.with_object(|state| {
            state.remove(&self.definition.name);
            Ok(())
        })
    }
}

/// Read-only view of a [`Slot`].
pub struct ReadOnlySlot<T> {
    slot: Slot<T>,
}

impl<T> Clone for ReadOnlySlot<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> ReadOnlySlot<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    pub fn name(&self) -> &str {
        self.slot.name()
    }

    pub async fn get(&self, ctx: &TurnContext) -> Result<Option<T>> {
        self.slot.get(ctx).await
    }

    pub async fn has(&self, ctx: &TurnContext) -> Result<bool> {
        self.slot.has(ctx).await
    }

    pub async fn history(&self, ctx: &TurnContext) -> Result<Vec<SlotHistoryValue<T>>> {
        self.slot.history(ctx).await
    }
}

/// An empty JSON object, the initial value of a child frame's host slot.
pub(crate) fn empty_object() -> Value {
    Value::Object(Map::new())
}
