//! Slot-backed change tracker.
//!
//! [`DefaultChangeTracker`] keeps the latest change as a slot value and older
//! changes in that slot's history, so the log lives inside an ordinary frame
//! and is saved with it. Retention follows the slot's history policy.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::change_tracker::{ChangeCursor, ChangeTracker, SlotValueChange, select};
use crate::context::TurnContext;
use crate::error::Result;
use crate::frame::{Frame, SlotChangeListener};
use crate::root_frame::RootFrame;
use crate::slot::{HistoryPolicy, Slot, SlotDefinition};

/// Default number of previous changes kept in the slot's history.
pub const DEFAULT_HISTORY_COUNT: usize = 100;

/// Change tracker stored in a frame slot.
pub struct DefaultChangeTracker {
    slot: Slot<SlotValueChange>,
}

impl DefaultChangeTracker {
    /// Register slot `name` on `frame` to hold the log.
    ///
    /// A missing or zero `max_count` keeps [`DEFAULT_HISTORY_COUNT`] entries.
    pub fn new(
        frame: Arc<dyn Frame>,
        name: &str,
        max_count: Option<usize>,
        expire_after_seconds: Option<u64>,
    ) -> Result<Arc<Self>> {
        let mut policy = HistoryPolicy::max_count(
            max_count
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_HISTORY_COUNT),
        );
        policy.expire_after_seconds = expire_after_seconds;
        let slot = Slot::new(frame, SlotDefinition::new(name).with_history(policy))?;
        Ok(Arc::new(Self { slot }))
    }

    /// Listen to tagged changes in `frame` and its child frames.
    pub fn attach(self: &Arc<Self>, frame: &RootFrame) {
        frame.on_slot_value_changed(self.clone());
    }

    pub fn slot(&self) -> &Slot<SlotValueChange> {
        &self.slot
    }
}

#[async_trait]
impl ChangeTracker for DefaultChangeTracker {
    async fn log_change(&self, ctx: &TurnContext, tags: &[String], value: &Value) -> Result<()> {
        let sequence = self
            .slot
            .get(ctx)
            .await?
            .map_or(1, |latest| latest.sequence + 1);
        self.slot
            .set(
                ctx,
                SlotValueChange {
                    tags: tags.to_vec(),
                    value: value.clone(),
                    timestamp: ctx.now(),
                    sequence,
                },
            )
            .await?;
        debug!(sequence, slot = %self.slot.name(), "change logged");
        Ok(())
    }

    async fn find_changes(
        &self,
        ctx: &TurnContext,
        tag: &str,
        cursor: Option<ChangeCursor>,
    ) -> Result<Vec<SlotValueChange>> {
        let Some(latest) = self.slot.get(ctx).await? else {
            return Ok(Vec::new());
        };
        // History is newest first; the log is reported oldest first.
        let mut changes: Vec<SlotValueChange> = self
            .slot
            .history(ctx)
            .await?
            .into_iter()
            .rev()
            .map(|entry| entry.value)
            .collect();
        changes.push(latest);
        Ok(select(&changes, tag, cursor))
    }
}

#[async_trait]
impl SlotChangeListener for DefaultChangeTracker {
    async fn slot_value_changed(
        &self,
        ctx: &TurnContext,
        tags: &[String],
        value: &Value,
    ) -> Result<()> {
        self.log_change(ctx, tags, value).await
    }
}
