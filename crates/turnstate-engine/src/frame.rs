//! Frame abstraction.
//!
//! A frame is a named container of slots persisted as one JSON object. Root
//! frames own a storage record; child frames live inside a slot of another
//! frame. Bot code works with [`Slot`](crate::slot::Slot) handles and only
//! touches frames to create slots or save.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::context::TurnContext;
use crate::error::{EngineError, Result};
use crate::scope::FrameScope;
use crate::slot::SlotDefinition;
use crate::state::StateHandle;

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a frame instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(u64);

impl FrameId {
    pub(crate) fn next() -> Self {
        Self(NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A slot definition bound to the frame it belongs to.
#[derive(Debug, Clone)]
pub struct SlotBinding {
    frame: FrameId,
    definition: Arc<SlotDefinition>,
}

impl SlotBinding {
    pub(crate) fn new(frame: FrameId, definition: Arc<SlotDefinition>) -> Self {
        Self { frame, definition }
    }

    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn definition(&self) -> &Arc<SlotDefinition> {
        &self.definition
    }
}

/// Receives notifications for slots that carry change tags.
#[async_trait]
pub trait SlotChangeListener: Send + Sync {
    async fn slot_value_changed(
        &self,
        ctx: &TurnContext,
        tags: &[String],
        value: &Value,
    ) -> Result<()>;
}

/// Common interface of root and child frames.
#[async_trait]
pub trait Frame: Send + Sync {
    fn id(&self) -> FrameId;

    /// Human-readable name used in logs and errors.
    fn name(&self) -> String;

    /// The frame hosting this one; `None` for a root frame.
    fn parent(&self) -> Option<Arc<dyn Frame>>;

    /// Register a slot.
    ///
    /// Fails with [`EngineError::SlotOwnedElsewhere`] when the binding names
    /// another frame, and [`EngineError::DuplicateSlot`] when the name is taken.
    fn add_slot(&self, slot: &SlotBinding) -> Result<()>;

    /// Definition of the registered slot called `name`.
    fn slot_definition(&self, name: &str) -> Result<Arc<SlotDefinition>>;

    /// Registered slot names in registration order.
    fn slot_names(&self) -> Vec<String>;

    /// Resolve this frame's object for the current turn.
    ///
    /// `accessed` marks the owning root frame as used by bot logic; preloads
    /// pass `false` so an untouched frame is never written back.
    async fn load(&self, ctx: &TurnContext, accessed: bool) -> Result<StateHandle>;

    /// Forward a tagged slot change toward the root frame's listeners.
    async fn slot_value_changed(
        &self,
        ctx: &TurnContext,
        tags: &[String],
        value: &Value,
    ) -> Result<()>;
}

/// Ordered, name-unique slot table shared by frame implementations.
#[derive(Debug)]
pub(crate) struct SlotRegistry {
    frame: FrameId,
    slots: RwLock<Vec<Arc<SlotDefinition>>>,
}

impl SlotRegistry {
    pub fn new(frame: FrameId) -> Self {
        Self {
            frame,
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, frame_name: &str, slot: &SlotBinding) -> Result<()> {
        let name = &slot.definition().name;
        if slot.frame() != self.frame {
            return Err(EngineError::SlotOwnedElsewhere { slot: name.clone() });
        }
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if slots.iter().any(|existing| &existing.name == name) {
            return Err(EngineError::DuplicateSlot {
                frame: frame_name.to_string(),
                slot: name.clone(),
            });
        }
        slots.push(slot.definition().clone());
        Ok(())
    }

    pub fn get(&self, frame_name: &str, name: &str) -> Result<Arc<SlotDefinition>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|def| def.name == name)
            .cloned()
            .ok_or_else(|| EngineError::SlotNotFound {
                frame: frame_name.to_string(),
                slot: name.to_string(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|def| def.name.clone())
            .collect()
    }
}

/// Declarative description of a root frame.
#[derive(Debug, Clone)]
pub struct FrameDefinition {
    pub scope: FrameScope,
    /// Defaults to the scope name.
    pub namespace: Option<String>,
    pub slots: Vec<SlotDefinition>,
}

impl FrameDefinition {
    pub fn new(scope: FrameScope) -> Self {
        Self {
            scope,
            namespace: None,
            slots: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_slot(mut self, slot: SlotDefinition) -> Self {
        self.slots.push(slot);
        self
    }
}
