//! Durable storage backend over SQLite.
//!
//! Each storage key maps to one row of `state_items` holding the JSON record
//! body and its eTag. A batch write runs in one transaction, so an eTag
//! conflict on any key leaves every record in the batch untouched.
//!
//! The connection sits behind a mutex and every statement runs on the
//! blocking pool, so a turn waiting on disk never stalls the runtime.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::{StoreError, StoreResult};
use crate::storage::{Storage, StoreItem, StoreItems, check_e_tag};

/// Layout version stamped into `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS state_items (
        key        TEXT PRIMARY KEY,
        data       TEXT NOT NULL,
        e_tag      TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_state_items_updated ON state_items(updated_at);
";

/// [`Storage`] persisted in the `state_items` table.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database file at `path` on the blocking pool.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        tokio::task::spawn_blocking(move || {
            info!(path = %path.display(), "opening state database");
            let conn = Connection::open(&path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
            Self::from_connection(conn)
        })
        .await?
    }

    /// A private in-memory database, gone when the last clone drops.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        let found: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if found > SCHEMA_VERSION {
            return Err(StoreError::Schema {
                found,
                supported: SCHEMA_VERSION,
            });
        }
        conn.execute_batch(SCHEMA)?;
        if found < SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            debug!(from = found, to = SCHEMA_VERSION, "state schema created");
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut conn)
        })
        .await?
    }

    /// List stored keys that start with `prefix`, ordered by key.
    #[instrument(skip(self))]
    pub async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM state_items WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
            )?;
            let keys = stmt
                .query_map([&pattern], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(keys)
        })
        .await
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    #[instrument(skip(self), fields(count = keys.len()))]
    async fn read(&self, keys: &[String]) -> StoreResult<StoreItems> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare("SELECT data, e_tag FROM state_items WHERE key = ?1")?;
            let mut items = StoreItems::with_capacity(keys.len());
            for key in keys {
                let row = stmt.query_row([&key], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                });
                match row {
                    Ok((data, e_tag)) => {
                        let data: Map<String, Value> = serde_json::from_str(&data)?;
                        items.insert(key, StoreItem::new(data).with_e_tag(e_tag));
                    }
                    Err(rusqlite::Error::QueryReturnedNoRows) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            debug!(found = items.len(), "sqlite storage read");
            Ok(items)
        })
        .await
    }

    #[instrument(skip(self, changes), fields(count = changes.len()))]
    async fn write(&self, changes: StoreItems) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let now = Utc::now().timestamp();
            for (key, item) in &changes {
                let current = match tx.query_row(
                    "SELECT e_tag FROM state_items WHERE key = ?1",
                    [key],
                    |row| row.get::<_, String>(0),
                ) {
                    Ok(tag) => Some(tag),
                    Err(rusqlite::Error::QueryReturnedNoRows) => None,
                    Err(e) => return Err(e.into()),
                };
                if let Err(err) = check_e_tag(key, item.e_tag.as_deref(), current.as_deref()) {
                    warn!(key = %key, %err, "sqlite storage write rejected");
                    // Dropping `tx` rolls the batch back.
                    return Err(err);
                }

                let next_tag = current
                    .as_deref()
                    .and_then(|t| t.parse::<u64>().ok())
                    .map_or(1, |t| t + 1)
                    .to_string();
                let data = serde_json::to_string(&item.data)?;
                tx.execute(
                    "INSERT INTO state_items (key, data, e_tag, updated_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT(key) DO UPDATE SET \
                        data = excluded.data, \
                        e_tag = excluded.e_tag, \
                        updated_at = excluded.updated_at",
                    rusqlite::params![key, data, next_tag, now],
                )?;
            }
            tx.commit()?;
            debug!(count = changes.len(), "sqlite storage write");
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), fields(count = keys.len()))]
    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for key in &keys {
                tx.execute("DELETE FROM state_items WHERE key = ?1", [key])?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

// ── tests ────────────────────────────────────────────────────────────
