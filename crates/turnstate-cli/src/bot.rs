//! Sample bot wired to the state engine.
//!
//! Commands (one per turn):
//!
//! - `profile name <name>` / `profile age <n>`: update the user's profile
//! - `profile`: show the profile
//! - `inspect`: peek at the conversation counter without changing it
//! - `changes [after <seq>]`: list logged profile edits
//! - `forget`: clear everything stored for the user
//! - anything else: echo with a per-conversation turn counter that resets
//!   after a period of silence

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use turnstate_engine::{
    ChangeCursor, ChangeTracker, ChangeTrackerMiddleware, ChildFrame, EngineConfig, EngineError,
    ReadOnlySlot, RootFrame, Slot, SlotDefinition, TurnContext, TurnHandler, TurnPipeline,
};
use turnstate_store::Storage;

/// Seconds of silence after which the echo counter starts over.
pub const COUNT_IDLE_SECONDS: u64 = 10;

/// Change tag attached to every profile slot.
pub const PROFILE_TAG: &str = "profile";

/// The sample bot: its frames, slots and collected replies.
pub struct SampleBot {
    user: Arc<RootFrame>,
    count: Slot<i64>,
    count_view: ReadOnlySlot<i64>,
    name: Slot<String>,
    age: Slot<u32>,
    tracker: Arc<ChangeTrackerMiddleware>,
    outbox: Mutex<Vec<String>>,
}

impl SampleBot {
    /// Build the bot's frames over `storage` and the pipeline that serves it.
    pub fn build(
        storage: Arc<dyn Storage>,
        config: &EngineConfig,
    ) -> turnstate_engine::Result<(Arc<Self>, TurnPipeline)> {
        let user = RootFrame::user(storage.clone(), None);
        let conversation = RootFrame::conversation(storage.clone(), None);

        let count: Slot<i64> = conversation.add(
            SlotDefinition::new("count")
                .with_default(&0)?
                .expire_after_seconds(COUNT_IDLE_SECONDS),
        )?;
        let profile: Slot<Value> = user.add(SlotDefinition::new("profile"))?;
        let profile_frame = ChildFrame::new(&profile);
        let name: Slot<String> =
            profile_frame.add(SlotDefinition::new("name").with_change_tags([PROFILE_TAG]))?;
        let age: Slot<u32> =
            profile_frame.add(SlotDefinition::new("age").with_change_tags([PROFILE_TAG]))?;

        let tracker = ChangeTrackerMiddleware::with_frames(
            storage,
            config.change_tracker.clone(),
            &[user.clone()],
        );
        let manager = config
            .frame_manager
            .build(vec![user.clone(), conversation]);

        let mut pipeline = TurnPipeline::new();
        pipeline
            .use_middleware(Arc::new(manager))
            .use_middleware(tracker.clone());

        let bot = Arc::new(Self {
            user,
            count_view: count.as_read_only(),
            count,
            name,
            age,
            tracker,
            outbox: Mutex::new(Vec::new()),
        });
        Ok((bot, pipeline))
    }

    fn reply(&self, text: impl Into<String>) {
        self.outbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(text.into());
    }

    /// Replies produced since the last call.
    pub fn take_replies(&self) -> Vec<String> {
        std::mem::take(&mut *self.outbox.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn on_profile(&self, ctx: &TurnContext, args: &[&str]) -> turnstate_engine::Result<()> {
        match args {
            ["name", rest @ ..] if !rest.is_empty() => {
                let name = rest.join(" ");
                self.name.set(ctx, name.clone()).await?;
                self.reply(format!("Nice to meet you, {name}."));
            }
            ["age", n] => match n.parse::<u32>() {
                Ok(age) => {
                    self.age.set(ctx, age).await?;
                    self.reply(format!("Got it, you are {age}."));
                }
                Err(_) => self.reply(format!("'{n}' is not an age.")),
            },
            [] => {
                let name = self.name.get(ctx).await?;
                let age = self.age.get(ctx).await?;
                self.reply(format!(
                    "name: {}, age: {}",
                    name.as_deref().unwrap_or("(unset)"),
                    age.map_or_else(|| "(unset)".to_string(), |a| a.to_string()),
                ));
            }
            _ => self.reply("usage: profile [name <name> | age <n>]"),
        }
        Ok(())
    }

    async fn on_changes(&self, ctx: &TurnContext, args: &[&str]) -> turnstate_engine::Result<()> {
        let cursor = match args {
            ["after", seq] => match seq.parse::<u64>() {
                Ok(seq) => Some(ChangeCursor::Sequence(seq)),
                Err(_) => {
                    self.reply(format!("'{seq}' is not a sequence number."));
                    return Ok(());
                }
            },
            _ => None,
        };
        let changes = self.tracker.find_changes(ctx, PROFILE_TAG, cursor).await?;
        if changes.is_empty() {
            self.reply("No profile changes.");
        }
        for change in changes {
            self.reply(format!(
                "#{} {} {}",
                change.sequence,
                change.timestamp.format("%Y-%m-%d %H:%M:%S"),
                change.value
            ));
        }
        Ok(())
    }

    async fn on_echo(&self, ctx: &TurnContext, text: &str) -> turnstate_engine::Result<()> {
        let count = self.count.get(ctx).await?.unwrap_or_default() + 1;
        self.count.set(ctx, count).await?;
        self.reply(format!("{count}: You said \"{text}\""));
        Ok(())
    }
}

#[async_trait]
impl TurnHandler for SampleBot {
    async fn on_turn(&self, ctx: &TurnContext) -> turnstate_engine::Result<()> {
        let text = ctx.activity().text.clone().unwrap_or_default();
        let words: Vec<&str> = text.split_whitespace().collect();
        match words.as_slice() {
            ["profile", args @ ..] => self.on_profile(ctx, args).await,
            ["changes", args @ ..] => self.on_changes(ctx, args).await,
            ["inspect"] => {
                let count = self.count_view.get(ctx).await?.unwrap_or_default();
                let stored = self.count_view.has(ctx).await?;
                self.reply(format!("count: {count} (stored: {stored})"));
                Ok(())
            }
            ["forget"] => {
                self.user.delete_all(ctx).await?;
                self.reply("Forgot everything about you.");
                Ok(())
            }
            [] => Ok(()),
            _ => self.on_echo(ctx, text.trim()).await,
        }
    }
}

/// Errors that end the chat session instead of just the turn.
pub fn is_fatal(err: &EngineError) -> bool {
    matches!(err, EngineError::Storage(_) | EngineError::Config(_))
}
