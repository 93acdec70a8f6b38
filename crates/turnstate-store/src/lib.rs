//! # turnstate-store
//!
//! Storage backends for TurnState.
//!
//! The state engine never talks to a database directly. It reads and writes
//! whole records by key through the [`Storage`] trait, and every record
//! carries an optional `eTag` used for optimistic concurrency.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  Storage trait (read / write / delete)  │
//! ├────────────────────┬────────────────────┤
//! │  MemoryStorage     │  SqliteStorage     │
//! │  (DashMap, tests)  │  (state_items,     │
//! │                    │   rusqlite WAL)    │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use turnstate_store::{SqliteStorage, Storage};
//!
//! let storage = SqliteStorage::open("data/turnstate.db").await?;
//! let items = storage.read(&["user/bot/cli/alice".to_string()]).await?;
//! ```

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod storage;

// ── re-exports ───────────────────────────────────────────────────────

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;
pub use storage::{Storage, StoreItem, StoreItems, WILDCARD_ETAG};
