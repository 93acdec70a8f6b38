//! Turn-scoped state engine for conversational agents.
//!
//! Bot state is organized as frames of typed slots. A root frame maps to one
//! storage record per user, conversation, or conversation member; child
//! frames nest inside a slot of another frame. Each turn loads a record at
//! most once, serves every slot read and write from that cached copy, and
//! writes it back only when its content changed.
//!
//! # Architecture
//!
//! ```text
//!  TurnPipeline ──► FrameManagerMiddleware ──► ChangeTrackerMiddleware ──► handler
//!                     │ pre_load / save            │ save_changes
//!                     ▼                             ▼
//!                  RootFrame ◄── ChildFrame     change log record
//!                     │ Slot<T> get/set/has/history/delete
//!                     ▼
//!               turnstate_store::Storage (memory | sqlite)
//! ```

pub mod access;
pub mod activity;
pub mod change_tracker;
pub mod child_frame;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod frame;
pub mod frame_manager;
pub mod pipeline;
pub mod root_frame;
pub mod scope;
pub mod slot;
pub mod slot_tracker;
pub mod state;

pub use access::{
    AccessPatternCache, ObservedPattern, PatternStats, PreloadScorer, WeightedScorer, pattern_key,
};
pub use activity::{Activity, ChannelAccount, ConversationAccount, activity_types};
pub use change_tracker::{
    ChangeCursor, ChangeTracker, ChangeTrackerConfig, ChangeTrackerMiddleware, SlotValueChange,
};
pub use child_frame::ChildFrame;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, FrameManagerConfig, StorageConfig};
pub use context::{CacheKey, TurnContext};
pub use error::{EngineError, Result};
pub use frame::{Frame, FrameDefinition, FrameId, SlotBinding, SlotChangeListener};
pub use frame_manager::FrameManagerMiddleware;
pub use pipeline::{Middleware, Next, TurnHandler, TurnPipeline, handler_fn};
pub use root_frame::RootFrame;
pub use scope::FrameScope;
pub use slot::{HistoryPolicy, ReadOnlySlot, Slot, SlotDefinition, SlotHistoryValue};
pub use slot_tracker::DefaultChangeTracker;
pub use state::{FrameState, StateHandle};

pub use futures::future::BoxFuture;
