//! Change tracking.
//!
//! Slots that carry change tags report every `set` to their root frame's
//! listeners. A [`ChangeTracker`] records those reports as an append-only,
//! sequence-numbered log that bot logic can query by tag.
//!
//! [`ChangeTrackerMiddleware`] keeps the log in its own storage record
//! (`{namespace}-changes`) and persists it after each turn.
//! [`DefaultChangeTracker`](crate::slot_tracker::DefaultChangeTracker) keeps it
//! in a slot's history instead.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, instrument};
use turnstate_store::{Storage, StoreItem, StoreItems};

use crate::context::{CacheKey, TurnContext};
use crate::error::{EngineError, Result};
use crate::frame::SlotChangeListener;
use crate::pipeline::{Middleware, Next};
use crate::root_frame::RootFrame;
use crate::scope::FrameScope;
use crate::slot::seconds_to_duration;
use crate::state::json_digest;

/// Default number of log entries kept by [`ChangeTrackerMiddleware`].
pub const DEFAULT_MAX_COUNT: usize = 1000;

/// One recorded change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotValueChange<T = Value> {
    pub tags: Vec<String>,
    pub value: T,
    pub timestamp: DateTime<Utc>,
    /// Monotonic within one log; the first change is `1`.
    pub sequence: u64,
}

impl SlotValueChange {
    /// Decode the value into a concrete type.
    pub fn decode<T: DeserializeOwned>(self) -> Result<SlotValueChange<T>> {
        Ok(SlotValueChange {
            tags: self.tags,
            value: serde_json::from_value(self.value)?,
            timestamp: self.timestamp,
            sequence: self.sequence,
        })
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Lower bound for [`ChangeTracker::find_changes`]. Both bounds are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCursor {
    /// Changes strictly newer than this instant.
    After(DateTime<Utc>),
    /// Changes with a strictly greater sequence number.
    Sequence(u64),
}

impl ChangeCursor {
    pub fn admits<T>(&self, change: &SlotValueChange<T>) -> bool {
        match *self {
            Self::After(instant) => change.timestamp > instant,
            Self::Sequence(sequence) => change.sequence > sequence,
        }
    }
}

/// Keep the changes tagged `tag` that pass `cursor`, preserving order.
pub(crate) fn select<'a>(
    changes: impl IntoIterator<Item = &'a SlotValueChange>,
    tag: &str,
    cursor: Option<ChangeCursor>,
) -> Vec<SlotValueChange> {
    changes
        .into_iter()
        .filter(|change| change.has_tag(tag))
        .filter(|change| cursor.is_none_or(|cursor| cursor.admits(change)))
        .cloned()
        .collect()
}

/// Records tagged slot changes and answers queries over them.
#[async_trait]
pub trait ChangeTracker: Send + Sync {
    /// Append one change stamped with the turn's time and the next sequence.
    async fn log_change(&self, ctx: &TurnContext, tags: &[String], value: &Value) -> Result<()>;

    /// Changes carrying `tag`, oldest first, optionally after `cursor`.
    async fn find_changes(
        &self,
        ctx: &TurnContext,
        tag: &str,
        cursor: Option<ChangeCursor>,
    ) -> Result<Vec<SlotValueChange>>;
}

/// Where and how long [`ChangeTrackerMiddleware`] keeps its log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeTrackerConfig {
    pub scope: FrameScope,
    /// Defaults to the scope name; the record lives under `{namespace}-changes`.
    pub namespace: Option<String>,
    pub max_count: usize,
    pub expire_after_seconds: Option<u64>,
}

impl Default for ChangeTrackerConfig {
    fn default() -> Self {
        Self {
            scope: FrameScope::User,
            namespace: None,
            max_count: DEFAULT_MAX_COUNT,
            expire_after_seconds: None,
        }
    }
}

impl ChangeTrackerConfig {
    pub fn new(scope: FrameScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn with_expire_after_seconds(mut self, seconds: u64) -> Self {
        self.expire_after_seconds = Some(seconds);
        self
    }

    pub(crate) fn record_namespace(&self) -> String {
        format!(
            "{}-changes",
            self.namespace.as_deref().unwrap_or(self.scope.as_str())
        )
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ChangeLog {
    #[serde(default)]
    sequence: u64,
    #[serde(default)]
    changes: Vec<SlotValueChange>,
}

#[derive(Debug)]
struct CachedLog {
    key: String,
    log: ChangeLog,
    hash: Vec<u8>,
}

#[derive(Debug, Default)]
struct TurnLog(OnceCell<Arc<Mutex<CachedLog>>>);

fn lock(log: &Mutex<CachedLog>) -> MutexGuard<'_, CachedLog> {
    log.lock().unwrap_or_else(|e| e.into_inner())
}

/// Change tracker persisted as its own record, saved after each turn.
///
/// Register it on the frames it should observe with [`attach`](Self::attach)
/// and add it to the pipeline so the log is flushed once the handler returns.
pub struct ChangeTrackerMiddleware {
    storage: Arc<dyn Storage>,
    config: ChangeTrackerConfig,
    cache_key: CacheKey,
}

impl ChangeTrackerMiddleware {
    pub fn new(storage: Arc<dyn Storage>, config: ChangeTrackerConfig) -> Arc<Self> {
        Arc::new(Self {
            storage,
            config,
            cache_key: CacheKey::new(),
        })
    }

    /// Create a tracker already listening to `frames`.
    pub fn with_frames(
        storage: Arc<dyn Storage>,
        config: ChangeTrackerConfig,
        frames: &[Arc<RootFrame>],
    ) -> Arc<Self> {
        let tracker = Self::new(storage, config);
        for frame in frames {
            tracker.attach(frame);
        }
        tracker
    }

    /// Listen to tagged changes in `frame` and its child frames.
    pub fn attach(self: &Arc<Self>, frame: &RootFrame) {
        frame.on_slot_value_changed(self.clone());
    }

    pub fn config(&self) -> &ChangeTrackerConfig {
        &self.config
    }

    /// Storage key of the log for the current turn's addressee.
    pub fn storage_key(&self, ctx: &TurnContext) -> String {
        self.config
            .scope
            .storage_key(&self.config.record_namespace(), ctx.activity())
    }

    /// Drop entries past the age limit, then all but the newest `max_count`.
    fn purge(&self, log: &mut ChangeLog, now: DateTime<Utc>) {
        if let Some(cutoff) = self
            .config
            .expire_after_seconds
            .and_then(|seconds| now.checked_sub_signed(seconds_to_duration(seconds)))
        {
            log.changes.retain(|change| change.timestamp > cutoff);
        }
        if log.changes.len() > self.config.max_count {
            let excess = log.changes.len() - self.config.max_count;
            log.changes.drain(..excess);
        }
    }

    async fn turn_log(&self, ctx: &TurnContext) -> Result<Arc<Mutex<CachedLog>>> {
        let cache = ctx.service::<TurnLog>(self.cache_key);
        let log = cache
            .0
            .get_or_try_init(|| async {
                let key = self.storage_key(ctx);
                let mut items = self.storage.read(std::slice::from_ref(&key)).await?;
                let mut log = match items.remove(&key) {
                    Some(item) => item.to_value::<ChangeLog>()?,
                    None => ChangeLog::default(),
                };
                let hash = json_digest(&log)?;
                self.purge(&mut log, ctx.now());
                debug!(key = %key, entries = log.changes.len(), "change log loaded");
                Ok::<_, EngineError>(Arc::new(Mutex::new(CachedLog { key, log, hash })))
            })
            .await?
            .clone();
        Ok(log)
    }

    /// Persist the turn's log if it changed. No-op when the log was never used.
    #[instrument(skip(self, ctx))]
    pub async fn save_changes(&self, ctx: &TurnContext) -> Result<()> {
        let cache = ctx.service::<TurnLog>(self.cache_key);
        let Some(cached) = cache.0.get().cloned() else {
            return Ok(());
        };
        let pending = {
            let mut guard = lock(&cached);
            let CachedLog { key, log, hash } = &mut *guard;
            self.purge(log, ctx.now());
            let next = json_digest(&*log)?;
            if next == *hash {
                None
            } else {
                Some((key.clone(), StoreItem::from_value(&*log)?, next))
            }
        };
        let Some((key, item, hash)) = pending else {
            return Ok(());
        };

        let item = StoreItem::unconditional(item.data);
        self.storage.write(StoreItems::from([(key.clone(), item)])).await?;
        lock(&cached).hash = hash;
        debug!(key = %key, "change log saved");
        Ok(())
    }
}

#[async_trait]
impl ChangeTracker for ChangeTrackerMiddleware {
    async fn log_change(&self, ctx: &TurnContext, tags: &[String], value: &Value) -> Result<()> {
        let cached = self.turn_log(ctx).await?;
        let now = ctx.now();
        let mut guard = lock(&cached);
        guard.log.sequence += 1;
        let sequence = guard.log.sequence;
        guard.log.changes.push(SlotValueChange {
            tags: tags.to_vec(),
            value: value.clone(),
            timestamp: now,
            sequence,
        });
        self.purge(&mut guard.log, now);
        debug!(sequence, ?tags, "change logged");
        Ok(())
    }

    async fn find_changes(
        &self,
        ctx: &TurnContext,
        tag: &str,
        cursor: Option<ChangeCursor>,
    ) -> Result<Vec<SlotValueChange>> {
        let cached = self.turn_log(ctx).await?;
        let guard = lock(&cached);
        Ok(select(&guard.log.changes, tag, cursor))
    }
}

#[async_trait]
impl SlotChangeListener for ChangeTrackerMiddleware {
    async fn slot_value_changed(
        &self,
        ctx: &TurnContext,
        tags: &[String],
        value: &Value,
    ) -> Result<()> {
        self.log_change(ctx, tags, value).await
    }
}

#[async_trait]
impl Middleware for ChangeTrackerMiddleware {
    async fn on_turn(&self, ctx: &TurnContext, next: Next<'_>) -> Result<()> {
        next.run(ctx).await?;
        self.save_changes(ctx).await
    }
}

// ── tests ────────────────────────────────────────────────────────────
