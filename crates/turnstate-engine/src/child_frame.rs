//! Nested frames.
//!
//! A [`ChildFrame`] stores its slots inside the value of a host slot on
//! another frame. It has no storage record of its own: loading resolves the
//! parent first, and saving is the root frame's job.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::context::TurnContext;
use crate::error::Result;
use crate::frame::{Frame, FrameId, SlotBinding, SlotRegistry};
use crate::slot::{Slot, SlotDefinition, empty_object};
use crate::state::StateHandle;

/// A frame living inside a slot of its parent frame.
pub struct ChildFrame {
    id: FrameId,
    host: Slot<Value>,
    slots: SlotRegistry,
}

impl ChildFrame {
    /// Nest a frame inside `host`. The host slot's value becomes the frame's
    /// object and is created empty on first load.
    pub fn new<T>(host: &Slot<T>) -> Arc<Self> {
        let id = FrameId::next();
        Arc::new(Self {
            id,
            host: host.retype(),
            slots: SlotRegistry::new(id),
        })
    }

    /// Nest a frame and register `slots` on it.
    pub fn with_slots<T>(host: &Slot<T>, slots: Vec<SlotDefinition>) -> Result<Arc<Self>> {
        let frame = Self::new(host);
        for slot in slots {
            Slot::<Value>::new(frame.clone(), slot)?;
        }
        Ok(frame)
    }

    pub fn host(&self) -> &Slot<Value> {
        &self.host
    }

    pub fn get_slot<T>(self: &Arc<Self>, name: &str) -> Result<Slot<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let definition = self.slots.get(&self.name(), name)?;
        Ok(Slot::bind(self.clone(), definition))
    }

    pub fn add<T>(self: &Arc<Self>, definition: SlotDefinition) -> Result<Slot<T>> {
        Slot::new(self.clone(), definition)
    }
}

#[async_trait]
impl Frame for ChildFrame {
    fn id(&self) -> FrameId {
        self.id
    }

    fn name(&self) -> String {
        format!("{}.{}", self.host.frame().name(), self.host.name())
    }

    fn parent(&self) -> Option<Arc<dyn Frame>> {
        Some(self.host.frame().clone())
    }

    fn add_slot(&self, slot: &SlotBinding) -> Result<()> {
        self.slots.add(&self.name(), slot)
    }

    fn slot_definition(&self, name: &str) -> Result<Arc<SlotDefinition>> {
        self.slots.get(&self.name(), name)
    }

    fn slot_names(&self) -> Vec<String> {
        self.slots.names()
    }

    async fn load(&self, ctx: &TurnContext, accessed: bool) -> Result<StateHandle> {
        let parent = self.host.frame().load(ctx, accessed).await?;
        let current = self.host.load_stored(ctx, accessed).await?;
        if !current.is_some_and(|stored| stored.value.is_object()) {
            self.host.store_json(ctx, empty_object()).await?;
        }
        Ok(parent.child(self.host.name()))
    }

    async fn slot_value_changed(
        &self,
        ctx: &TurnContext,
        tags: &[String],
        value: &Value,
    ) -> Result<()> {
        self.host.frame().slot_value_changed(ctx, tags, value).await
    }
}
