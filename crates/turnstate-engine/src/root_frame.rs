//! Root frames.
//!
//! A [`RootFrame`] maps one scope + namespace onto one storage record per
//! addressed user/conversation. Its state is read at most once per turn and
//! cached in the turn context; concurrent first loads share a single read.
//! `save` writes only when the state's digest changed since it was loaded or
//! last saved.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::{debug, instrument};
use turnstate_store::{Storage, StoreItem, StoreItems};

use crate::context::{CacheKey, TurnContext};
use crate::error::{EngineError, Result};
use crate::frame::{Frame, FrameDefinition, FrameId, SlotBinding, SlotChangeListener, SlotRegistry};
use crate::scope::FrameScope;
use crate::slot::{Slot, SlotDefinition};
use crate::state::{FrameState, StateHandle};

type TurnCache = OnceCell<Arc<FrameState>>;

/// A frame persisted as its own storage record.
pub struct RootFrame {
    id: FrameId,
    storage: Arc<dyn Storage>,
    scope: FrameScope,
    namespace: String,
    cache_key: CacheKey,
    slots: SlotRegistry,
    listeners: RwLock<Vec<Arc<dyn SlotChangeListener>>>,
}

impl RootFrame {
    /// A frame for `scope`; `namespace` defaults to the scope name.
    pub fn new(storage: Arc<dyn Storage>, scope: FrameScope, namespace: Option<&str>) -> Arc<Self> {
        let id = FrameId::next();
        Arc::new(Self {
            id,
            storage,
            scope,
            namespace: namespace.unwrap_or(scope.as_str()).to_string(),
            cache_key: CacheKey::new(),
            slots: SlotRegistry::new(id),
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Build a frame and register every slot in `definition`.
    pub fn from_definition(storage: Arc<dyn Storage>, definition: FrameDefinition) -> Result<Arc<Self>> {
        let frame = Self::new(storage, definition.scope, definition.namespace.as_deref());
        for slot in definition.slots {
            Slot::<Value>::new(frame.clone(), slot)?;
        }
        Ok(frame)
    }

    /// Per-user frame.
    pub fn user(storage: Arc<dyn Storage>, namespace: Option<&str>) -> Arc<Self> {
        Self::new(storage, FrameScope::User, namespace)
    }

    /// Per-conversation frame.
    pub fn conversation(storage: Arc<dyn Storage>, namespace: Option<&str>) -> Arc<Self> {
        Self::new(storage, FrameScope::Conversation, namespace)
    }

    /// Per-user-within-conversation frame.
    pub fn conversation_member(storage: Arc<dyn Storage>, namespace: Option<&str>) -> Arc<Self> {
        Self::new(storage, FrameScope::ConversationMember, namespace)
    }

    pub fn scope(&self) -> FrameScope {
        self.scope
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Storage key of the record this frame uses for the current turn.
    pub fn storage_key(&self, ctx: &TurnContext) -> String {
        self.scope.storage_key(&self.namespace, ctx.activity())
    }

    /// Typed handle to a slot registered with this frame.
    pub fn get_slot<T>(self: &Arc<Self>, name: &str) -> Result<Slot<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let definition = self.slots.get(&self.namespace, name)?;
        Ok(Slot::bind(self.clone(), definition))
    }

    /// Create and register a slot on this frame.
    pub fn add<T>(self: &Arc<Self>, definition: SlotDefinition) -> Result<Slot<T>> {
        Slot::new(self.clone(), definition)
    }

    /// Subscribe to tagged slot changes in this frame and its child frames.
    pub fn on_slot_value_changed(&self, listener: Arc<dyn SlotChangeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    fn turn_cache(&self, ctx: &TurnContext) -> Arc<TurnCache> {
        ctx.service::<TurnCache>(self.cache_key)
    }

    /// Whether bot logic touched this frame during the turn.
    pub fn was_accessed(&self, ctx: &TurnContext) -> bool {
        self.turn_cache(ctx)
            .get()
            .is_some_and(|state| state.accessed())
    }

    /// The turn's cached state, if the frame has been loaded.
    pub fn cached_state(&self, ctx: &TurnContext) -> Option<Arc<FrameState>> {
        self.turn_cache(ctx).get().cloned()
    }

    /// Persist the turn's changes. No-op when unloaded or unchanged.
    ///
    /// The saved digest only advances after the write succeeds, so a failed
    /// save is retried by the next `save` in the same turn.
    #[instrument(skip(self, ctx), fields(frame = %self.namespace))]
    pub async fn save(&self, ctx: &TurnContext) -> Result<()> {
        let Some(state) = self.cached_state(ctx) else {
            return Ok(());
        };
        let Some((data, hash)) = state.pending_write() else {
            debug!(key = %state.key(), "frame unchanged; skipping write");
            return Ok(());
        };
        let changes = StoreItems::from([(state.key().to_string(), StoreItem::unconditional(data))]);
        self.storage.write(changes).await?;
        state.commit(hash);
        debug!(key = %state.key(), "frame saved");
        Ok(())
    }

    /// Clear every slot of this frame for the current addressee.
    ///
    /// Writes an empty record immediately and resets the turn cache to match.
    #[instrument(skip(self, ctx), fields(frame = %self.namespace))]
    pub async fn delete_all(&self, ctx: &TurnContext) -> Result<()> {
        let key = self.storage_key(ctx);
        let changes = StoreItems::from([(key.clone(), StoreItem::unconditional(Map::new()))]);
        self.storage.write(changes).await?;

        let state = self
            .turn_cache(ctx)
            .get_or_init(|| async { Arc::new(FrameState::new(key, Map::new())) })
            .await
            .clone();
        state.reset(Map::new());
        debug!(key = %state.key(), "frame cleared");
        Ok(())
    }
}

#[async_trait]
impl Frame for RootFrame {
    fn id(&self) -> FrameId {
        self.id
    }

    fn name(&self) -> String {
        self.namespace.clone()
    }

    fn parent(&self) -> Option<Arc<dyn Frame>> {
        None
    }

    fn add_slot(&self, slot: &SlotBinding) -> Result<()> {
        self.slots.add(&self.namespace, slot)
    }

    fn slot_definition(&self, name: &str) -> Result<Arc<SlotDefinition>> {
        self.slots.get(&self.namespace, name)
    }

    fn slot_names(&self) -> Vec<String> {
        self.slots.names()
    }

    async fn load(&self, ctx: &TurnContext, accessed: bool) -> Result<StateHandle> {
        let state = self
            .turn_cache(ctx)
            .get_or_try_init(|| async {
                let key = self.storage_key(ctx);
                let mut items = self.storage.read(std::slice::from_ref(&key)).await?;
                let data = items.remove(&key).map(|item| item.data).unwrap_or_default();
                debug!(key = %key, slots = data.len(), "frame loaded");
                Ok::<_, EngineError>(Arc::new(FrameState::new(key, data)))
            })
            .await?
            .clone();
        if accessed {
            state.mark_accessed();
        }
        Ok(StateHandle::root(state))
    }

    async fn slot_value_changed(
        &self,
        ctx: &TurnContext,
        tags: &[String],
        value: &Value,
    ) -> Result<()> {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.slot_value_changed(ctx, tags, value).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RootFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootFrame")
            .field("scope", &self.scope)
            .field("namespace", &self.namespace)
            .field("slots", &self.slots.names())
            .finish()
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::Activity;
    use serde_json::json;
    use turnstate_store::MemoryStorage;

    fn ctx(from: &str) -> TurnContext {
        TurnContext::new(Activity::message("cli", "bot", from, "c1", "hi"))
    }

    #[test]
    fn namespace_defaults_to_scope() {
        let storage = Arc::new(MemoryStorage::new());
        assert_eq!(RootFrame::user(storage.clone(), None).namespace(), "user");
        assert_eq!(
            RootFrame::conversation_member(storage, Some("members")).namespace(),
            "members"
        );
    }

    #[test]
    fn duplicate_and_missing_slots() {
        let frame = RootFrame::user(Arc::new(MemoryStorage::new()), None);
        frame.add::<i64>(SlotDefinition::new("count")).unwrap();
        assert!(matches!(
            frame.add::<i64>(SlotDefinition::new("count")),
            Err(EngineError::DuplicateSlot { .. })
        ));
        assert!(frame.get_slot::<i64>("count").is_ok());
        assert!(matches!(
            frame.get_slot::<i64>("nope"),
            Err(EngineError::SlotNotFound { .. })
        ));
    }

    #[test]
    fn slot_bound_to_other_frame_is_rejected() {
        let storage = Arc::new(MemoryStorage::new());
        let a = RootFrame::user(storage.clone(), None);
        let b = RootFrame::conversation(storage, None);
        let slot: Slot<i64> = a.add(SlotDefinition::new("count")).unwrap();
        assert!(matches!(
            b.add_slot(&slot.binding()),
            Err(EngineError::SlotOwnedElsewhere { .. })
        ));
    }

    #[tokio::test]
    async fn save_writes_only_changed_state() {
        let storage = Arc::new(MemoryStorage::new());
        let frame = RootFrame::user(storage.clone(), None);
        let count: Slot<i64> = frame.add(SlotDefinition::new("count")).unwrap();

        let turn = ctx("alice");
        frame.save(&turn).await.unwrap();
        assert!(storage.is_empty(), "unloaded frame must not write");

        count.set(&turn, 5).await.unwrap();
        frame.save(&turn).await.unwrap();
        let items = storage.read(&["user/bot/cli/alice".to_string()]).await.unwrap();
        let first_tag = items["user/bot/cli/alice"].e_tag.clone();
        assert_eq!(items["user/bot/cli/alice"].data["count"]["value"], json!(5));

        // Second save in the same turn is a no-op.
        frame.save(&turn).await.unwrap();
        let items = storage.read(&["user/bot/cli/alice".to_string()]).await.unwrap();
        assert_eq!(items["user/bot/cli/alice"].e_tag, first_tag);
    }

    #[tokio::test]
    async fn state_survives_across_turns() {
        let storage = Arc::new(MemoryStorage::new());
        let frame = RootFrame::user(storage, None);
        let count: Slot<i64> = frame.add(SlotDefinition::new("count")).unwrap();

        let first = ctx("alice");
        count.set(&first, 5).await.unwrap();
        frame.save(&first).await.unwrap();

        let second = ctx("alice");
        assert_eq!(count.get(&second).await.unwrap(), Some(5));
        let other_user = ctx("bob");
        assert_eq!(count.get(&other_user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn preload_is_not_an_access() {
        let frame = RootFrame::user(Arc::new(MemoryStorage::new()), None);
        let turn = ctx("alice");
        frame.load(&turn, false).await.unwrap();
        assert!(!frame.was_accessed(&turn));
        frame.load(&turn, true).await.unwrap();
        assert!(frame.was_accessed(&turn));
    }

    #[tokio::test]
    async fn delete_all_clears_storage_and_cache() {
        let storage = Arc::new(MemoryStorage::new());
        let frame = RootFrame::user(storage.clone(), None);
        let count: Slot<i64> = frame.add(SlotDefinition::new("count")).unwrap();

        let turn = ctx("alice");
        count.set(&turn, 3).await.unwrap();
        frame.save(&turn).await.unwrap();

        frame.delete_all(&turn).await.unwrap();
        assert!(!count.has(&turn).await.unwrap());
        assert!(frame.was_accessed(&turn));

        let items = storage.read(&["user/bot/cli/alice".to_string()]).await.unwrap();
        assert!(items["user/bot/cli/alice"].data.is_empty());
    }

    #[tokio::test]
    async fn from_definition_registers_slots() {
        let frame = RootFrame::from_definition(
            Arc::new(MemoryStorage::new()),
            FrameDefinition::new(FrameScope::Conversation)
                .with_namespace("convo")
                .with_slot(SlotDefinition::new("topic"))
                .with_slot(SlotDefinition::new("turns").with_default_value(json!(0))),
        )
        .unwrap();
        assert_eq!(frame.slot_names(), vec!["topic", "turns"]);
        let turns: Slot<u32> = frame.get_slot("turns").unwrap();
        assert_eq!(turns.get(&ctx("alice")).await.unwrap(), Some(0));
    }
}
