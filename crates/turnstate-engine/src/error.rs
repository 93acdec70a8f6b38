//! Engine error types.
//!
//! Every public API in this crate returns [`EngineError`]. Configuration
//! mistakes (duplicate slots, foreign slots, unknown scopes) surface at setup
//! time; storage failures surface from `load`/`save` unchanged and are never
//! retried here.

use turnstate_store::StoreError;

/// Unified error type for the state engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // -- Setup errors -------------------------------------------------------
    /// A slot with the same name is already registered with the frame.
    #[error("a slot named '{slot}' has already been added to frame '{frame}'")]
    DuplicateSlot { frame: String, slot: String },

    /// The slot is bound to a different frame than the one it is being added to.
    #[error("the slot named '{slot}' has already been added to a different frame")]
    SlotOwnedElsewhere { slot: String },

    /// No slot with this name is registered with the frame.
    #[error("a slot named '{slot}' couldn't be found in frame '{frame}'")]
    SlotNotFound { frame: String, slot: String },

    /// The scope name does not map to a known storage key layout.
    #[error("unknown frame scope '{scope}'")]
    UnknownScope { scope: String },

    /// Engine configuration is malformed.
    #[error("configuration error: {0}")]
    Config(String),

    // -- Turn errors --------------------------------------------------------
    /// A nested frame's host value disappeared while it was being addressed.
    #[error("frame state at '{path}' is missing or not an object")]
    DetachedState { path: String },

    /// The value was applied but a change listener failed afterwards.
    ///
    /// The new value stays in the turn's cached state and will be saved.
    #[error("change listener failed after slot '{slot}' was set: {source}")]
    ChangeNotification {
        slot: String,
        #[source]
        source: Box<EngineError>,
    },

    /// Bot logic reported a failure.
    #[error("turn handler failed: {0}")]
    Handler(String),

    // -- Wrapped ------------------------------------------------------------
    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// A stored value could not be converted to or from JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the engine crate.
pub type Result<T> = std::result::Result<T, EngineError>;
